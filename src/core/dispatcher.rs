//! The single consumer between network callbacks and the script engine.
//!
//! Network hooks and Execute units never call script code. They hand closures
//! to [`Dispatcher::run`], which sends them through a bounded channel; one
//! dispatcher task per client receives them and passes each to the host
//! through a [`TaskQueue`], so handlers run on engine turns, one at a time, in
//! firing order.
//!
//! ```text
//! hooks / Execute ──► mpsc (bounded) ──► dispatcher task ──► TaskQueue ──► Host turn
//!                                            ▲
//!                          stop token ───────┤
//!                          host context ─────┘
//! ```
//!
//! Host registrations are taken on the submitting side, before the command is
//! sent, so the host never sees a moment with work in flight and nothing
//! registered. While a handle is attached the dispatcher holds an open task
//! queue, which keeps the host's loop running; detaching releases it so an
//! iteration can finish after `end`. A closure that arrives while detached
//! runs through the registration it was sent with.

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{blocking, task_queue::TaskQueue};
use crate::runtime::{Callback, Enqueue, Host};

enum Command {
    Run { task: Callback, slot: Enqueue },
    Attach(TaskQueue),
    Detach,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Run { .. } => "run",
            Command::Attach(_) => "attach",
            Command::Detach => "detach",
        }
    }
}

pub(crate) struct Dispatcher {
    host: Arc<dyn Host>,
    tx: mpsc::Sender<Command>,
    stop: CancellationToken,
}

impl Dispatcher {
    /// Starts the dispatcher task on the shared runtime.
    pub(crate) fn spawn(host: Arc<dyn Host>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let stop = CancellationToken::new();
        blocking::spawn(dispatch(rx, host.clone(), stop.clone()));
        Self { host, tx, stop }
    }

    /// Queues `task` for a host turn.
    pub(crate) fn run(&self, task: Callback) {
        let slot = self.host.register_callback();
        self.submit(Command::Run { task, slot });
    }

    /// Holds the host open until the matching [`detach`](Self::detach).
    pub(crate) fn attach(&self) {
        self.submit(Command::Attach(TaskQueue::new(self.host.clone())));
    }

    pub(crate) fn detach(&self) {
        self.submit(Command::Detach);
    }

    /// Sends `command`, waiting for channel space if the queue is full.
    ///
    /// Commands submitted after the dispatcher stopped are dropped, which
    /// releases any registration they carry.
    fn submit(&self, command: Command) {
        let command = match self.tx.try_send(command) {
            Ok(()) => return,
            Err(TrySendError::Closed(command)) => {
                debug!(command = command.name(), "Dispatcher stopped, dropping command");
                return;
            }
            Err(TrySendError::Full(command)) => command,
        };

        trace!("Task channel full, waiting for space");
        let tx = self.tx.clone();
        let delivered = match tokio::runtime::Handle::try_current() {
            Ok(handle)
                if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread =>
            {
                tokio::task::block_in_place(move || tx.blocking_send(command)).is_ok()
            }
            // blocking_send panics on a runtime thread, so wait from outside it
            Ok(_) => std::thread::scope(|scope| {
                scope
                    .spawn(move || tx.blocking_send(command).is_ok())
                    .join()
                    .unwrap_or(false)
            }),
            Err(_) => tx.blocking_send(command).is_ok(),
        };

        if !delivered {
            debug!("Dispatcher stopped while waiting, dropping command");
        }
    }

    pub(crate) fn stop(&self) {
        self.stop.cancel();
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stop.is_cancelled() || self.tx.is_closed()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn dispatch(mut rx: mpsc::Receiver<Command>, host: Arc<dyn Host>, stop: CancellationToken) {
    let context = host.context();
    let mut attached: Option<TaskQueue> = None;

    debug!("Dispatcher started");
    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                debug!("Dispatcher stop requested");
                break;
            }
            _ = context.cancelled() => {
                debug!("Execution context done, stopping dispatcher");
                break;
            }
            command = rx.recv() => match command {
                Some(Command::Run { task, slot }) => match &attached {
                    // the queue schedules its drain before the slot is released
                    Some(queue) => {
                        queue.queue(task);
                        drop(slot);
                    }
                    None => slot(task),
                },
                Some(Command::Attach(queue)) => {
                    if let Some(previous) = attached.replace(queue) {
                        previous.close();
                    }
                }
                Some(Command::Detach) => {
                    if let Some(queue) = attached.take() {
                        queue.close();
                    }
                }
                None => break,
            }
        }
    }

    // buffered commands are dropped with the receiver, releasing their registrations
    rx.close();
    if let Some(queue) = attached.take() {
        queue.close();
    }
    debug!("Dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::runtime::{EventLoop, ScriptError};

    fn record(log: &Arc<Mutex<Vec<u32>>>, value: u32) -> Callback {
        let log = log.clone();
        Box::new(move || {
            log.lock().push(value);
            Ok(())
        })
    }

    #[test]
    fn test_runs_in_fire_order_while_attached() {
        let event_loop = EventLoop::new();
        let dispatcher = Arc::new(Dispatcher::spawn(Arc::new(event_loop.clone()), 2));
        let log = Arc::new(Mutex::new(Vec::new()));

        let worker_log = log.clone();
        let submitter = dispatcher.clone();
        event_loop
            .start(move || {
                submitter.attach();
                let worker = std::thread::spawn(move || {
                    for i in 0..10 {
                        submitter.run(record(&worker_log, i));
                    }
                    submitter.detach();
                });
                worker.join().map_err(|_| ScriptError::new("worker panicked"))
            })
            .unwrap();

        assert_eq!(*log.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_full_channel_keeps_order_on_current_thread_runtime() {
        let event_loop = EventLoop::new();
        let dispatcher = Dispatcher::spawn(Arc::new(event_loop.clone()), 1);
        let log = Arc::new(Mutex::new(Vec::new()));

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        runtime.block_on(async {
            dispatcher.attach();
            for i in 0..20 {
                dispatcher.run(record(&log, i));
            }
            dispatcher.detach();
        });
        event_loop.start(|| Ok(())).unwrap();

        assert_eq!(*log.lock(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_detached_run_still_delivered() {
        let event_loop = EventLoop::new();
        let dispatcher = Dispatcher::spawn(Arc::new(event_loop.clone()), 4);
        let log = Arc::new(Mutex::new(Vec::new()));

        dispatcher.run(record(&log, 7));
        assert_eq!(event_loop.pending_registrations(), 1);
        event_loop.start(|| Ok(())).unwrap();

        assert_eq!(*log.lock(), vec![7]);
    }

    #[test]
    fn test_attach_registers_immediately() {
        let event_loop = EventLoop::new();
        let dispatcher = Dispatcher::spawn(Arc::new(event_loop.clone()), 4);

        dispatcher.attach();
        assert_eq!(event_loop.pending_registrations(), 1);
        dispatcher.detach();
        event_loop.start(|| Ok(())).unwrap();
        assert_eq!(event_loop.pending_registrations(), 0);
    }

    #[test]
    fn test_stop_releases_loop_and_drops_later_commands() {
        let event_loop = EventLoop::new();
        let dispatcher = Dispatcher::spawn(Arc::new(event_loop.clone()), 4);
        let log = Arc::new(Mutex::new(Vec::new()));

        dispatcher.attach();
        dispatcher.stop();
        std::thread::sleep(Duration::from_millis(50));
        assert!(dispatcher.is_stopped());
        dispatcher.run(record(&log, 1));

        event_loop.start(|| Ok(())).unwrap();
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_context_cancel_stops_dispatcher() {
        let event_loop = EventLoop::new();
        let dispatcher = Dispatcher::spawn(Arc::new(event_loop.clone()), 4);
        event_loop.cancel();
        std::thread::sleep(Duration::from_millis(50));
        assert!(dispatcher.is_stopped());
    }
}
