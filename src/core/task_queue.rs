//! Batches callbacks onto a [`Host`] while keeping one registration open.
//!
//! A queue always holds one spare registration, so the host's loop does not
//! finish while the queue is alive. Queued callbacks are drained in order by a
//! single host turn; when the first callback of a new batch arrives, the spare
//! registration is spent on a drain and a fresh one is taken. Closing the
//! queue releases the spare.

use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::runtime::{Callback, Enqueue, Host, ScriptError};

struct State {
    spare: Option<Enqueue>,
    tasks: VecDeque<Callback>,
    draining: bool,
}

pub(crate) struct TaskQueue {
    host: Arc<dyn Host>,
    state: Arc<Mutex<State>>,
}

impl TaskQueue {
    pub(crate) fn new(host: Arc<dyn Host>) -> Self {
        let spare = host.register_callback();
        Self {
            host,
            state: Arc::new(Mutex::new(State {
                spare: Some(spare),
                tasks: VecDeque::new(),
                draining: false,
            })),
        }
    }

    /// Adds `task` to the current batch, scheduling a drain if none is pending.
    pub(crate) fn queue(&self, task: Callback) {
        let mut state = self.state.lock();
        let Some(spare) = state.spare.take() else {
            debug!("Task queue closed, dropping callback");
            return;
        };

        state.tasks.push_back(task);
        if state.draining {
            state.spare = Some(spare);
            return;
        }

        state.draining = true;
        state.spare = Some(self.host.register_callback());
        drop(state);

        let shared = self.state.clone();
        spare(Box::new(move || drain(&shared)));
    }

    /// Releases the spare registration. Tasks already scheduled still run.
    pub(crate) fn close(&self) {
        let spare = self.state.lock().spare.take();
        if let Some(spare) = spare {
            trace!("Closing task queue");
            spare(Box::new(|| Ok(())));
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.close();
    }
}

fn drain(state: &Mutex<State>) -> Result<(), ScriptError> {
    loop {
        let task = {
            let mut state = state.lock();
            match state.tasks.pop_front() {
                Some(task) => task,
                None => {
                    state.draining = false;
                    return Ok(());
                }
            }
        };

        if let Err(err) = task() {
            let mut state = state.lock();
            state.draining = false;
            state.tasks.clear();
            return Err(err);
        }
    }
}
