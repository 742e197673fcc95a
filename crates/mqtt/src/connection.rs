//! The per-session driver that pumps rumqttc's event loop.
//!
//! One `ConnectionKernel` runs on its own tokio task for every server a handle
//! dials. It owns the `EventLoop` and is the only place that observes protocol
//! events, so it is also where waitables are completed and hooks are invoked:
//!
//! ```text
//! EventLoop::poll()
//!     │
//!     ├── Incoming ConnAck  ──► report initial connect, on-connect hook
//!     ├── Incoming Publish  ──► on-message hook
//!     ├── Incoming *Ack     ──► PendingRequests (complete waiters)
//!     ├── Outgoing packets  ──► PendingRequests (bind packet ids)
//!     └── Err(e)
//!           ├── before first CONNACK ──► report initial connect failure, stop
//!           ├── fatal               ──► stop
//!           └── transient           ──► on-reconnect hook, backoff, poll again
//! ```
//!
//! The kernel stops when its cancellation token fires, after writing DISCONNECT,
//! or when reconnection gives up. On exit every pending waiter is failed.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;
use rumqttc::{ConnectReturnCode, ConnectionError, Event, EventLoop, Outgoing, Packet};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{
    backoff::Backoff,
    error::{NetworkError, Result},
    handle::Hooks,
    options::Message,
    pending::PendingRequests,
};

/// Whether the driver keeps polling after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Drives one rumqttc session until it is cancelled or gives up.
pub(crate) struct ConnectionKernel {
    event_loop: EventLoop,
    pending: Arc<Mutex<PendingRequests>>,
    hooks: Hooks,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    backoff: Backoff,

    /// Reports the outcome of the first connection attempt; `None` afterwards.
    connack: Option<oneshot::Sender<Result<()>>>,
}

impl ConnectionKernel {
    pub(crate) fn new(
        event_loop: EventLoop,
        pending: Arc<Mutex<PendingRequests>>,
        hooks: Hooks,
        connected: Arc<AtomicBool>,
        cancel: CancellationToken,
        backoff: Backoff,
        connack: oneshot::Sender<Result<()>>,
    ) -> Self {
        Self {
            event_loop,
            pending,
            hooks,
            connected,
            cancel,
            backoff,
            connack: Some(connack),
        }
    }

    /// Runs the poll loop to completion.
    pub(crate) async fn run(mut self) {
        loop {
            let flow = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Connection driver cancelled");
                    Flow::Stop
                }
                event = self.event_loop.poll() => match event {
                    Ok(event) => self.handle_event(event),
                    Err(e) => self.handle_error(e).await,
                }
            };

            if flow == Flow::Stop {
                break;
            }
        }

        self.connected.store(false, Ordering::Release);
        self.pending.lock().close();
        if let Some(tx) = self.connack.take() {
            let _ = tx.send(Err(NetworkError::ConnectionClosed));
        }
        debug!("Connection driver stopped");
    }

    fn handle_event(&mut self, event: Event) -> Flow {
        match event {
            Event::Incoming(packet) => self.handle_incoming(packet),
            Event::Outgoing(outgoing) => self.handle_outgoing(outgoing),
        }
    }

    fn handle_incoming(&mut self, packet: Packet) -> Flow {
        match packet {
            Packet::ConnAck(ack) => {
                if ack.code != ConnectReturnCode::Success {
                    // rumqttc normally turns this into ConnectionRefused
                    warn!(code = ?ack.code, "Connection refused by broker");
                    return Flow::Continue;
                }

                info!(session_present = ack.session_present, "Connection established");
                self.connected.store(true, Ordering::Release);
                self.backoff.reset();
                if let Some(tx) = self.connack.take() {
                    let _ = tx.send(Ok(()));
                }
                self.hooks.connected();
            }
            Packet::Publish(publish) => {
                trace!(topic = %publish.topic, pkid = publish.pkid, "Received publish");
                self.hooks.message(Message {
                    topic: publish.topic,
                    payload: publish.payload,
                    qos: publish.qos,
                    retain: publish.retain,
                    pkid: publish.pkid,
                });
            }
            Packet::PubAck(ack) => self.pending.lock().publish_acked(ack.pkid),
            Packet::PubComp(comp) => self.pending.lock().publish_acked(comp.pkid),
            Packet::SubAck(ack) => self
                .pending
                .lock()
                .subscribe_acked(ack.pkid, &ack.return_codes),
            Packet::UnsubAck(ack) => self.pending.lock().unsubscribe_acked(ack.pkid),
            Packet::Disconnect => {
                warn!("Disconnected by broker");
                self.connected.store(false, Ordering::Release);
            }
            _ => {}
        }
        Flow::Continue
    }

    fn handle_outgoing(&mut self, outgoing: Outgoing) -> Flow {
        trace!(?outgoing, "Outgoing packet");
        match outgoing {
            Outgoing::Publish(pkid) => self.pending.lock().publish_sent(pkid),
            Outgoing::AwaitAck(pkid) => self.pending.lock().publish_parked(pkid),
            Outgoing::Subscribe(pkid) => self.pending.lock().subscribe_sent(pkid),
            Outgoing::Unsubscribe(pkid) => self.pending.lock().unsubscribe_sent(pkid),
            Outgoing::Disconnect => {
                debug!("DISCONNECT written, stopping driver");
                return Flow::Stop;
            }
            _ => {}
        }
        Flow::Continue
    }

    async fn handle_error(&mut self, err: ConnectionError) -> Flow {
        self.connected.store(false, Ordering::Release);

        if let Some(tx) = self.connack.take() {
            debug!(error = %err, "Initial connection attempt failed");
            let _ = tx.send(Err(err.into()));
            return Flow::Stop;
        }

        self.pending.lock().connection_lost();

        if is_fatal_error(&err) {
            error!(error = %get_error_message(&err), "Fatal connection error, stopping driver");
            return Flow::Stop;
        }

        let delay = match self.backoff.next_sleep() {
            Ok(delay) => delay,
            Err(e) => {
                error!(error = %e, "Giving up on reconnection");
                return Flow::Stop;
            }
        };

        warn!(
            "Connection lost ({}), reconnecting in {:.2} seconds",
            get_error_message(&err),
            delay.as_secs_f64()
        );
        self.hooks.reconnecting();

        tokio::select! {
            _ = self.cancel.cancelled() => Flow::Stop,
            _ = tokio::time::sleep(delay) => Flow::Continue,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    // reconnecting cannot help
    Fatal,
    Reconnect,
}

fn classify_connection_error(err: &ConnectionError) -> Disposition {
    use Disposition::*;

    match err {
        ConnectionError::Tls(_) => Fatal,
        ConnectionError::MqttState(_) => Reconnect,
        ConnectionError::NotConnAck(_) => Fatal,
        ConnectionError::RequestsDone => Fatal,

        ConnectionError::Io(e) => match e.kind() {
            std::io::ErrorKind::AddrInUse
            | std::io::ErrorKind::PermissionDenied
            | std::io::ErrorKind::InvalidInput => Fatal,
            _ => Reconnect,
        },

        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => Reconnect,

        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::RefusedProtocolVersion
            | ConnectReturnCode::BadClientId
            | ConnectReturnCode::BadUserNamePassword
            | ConnectReturnCode::NotAuthorized => Fatal,
            _ => Reconnect,
        },

        #[allow(unreachable_patterns)]
        _ => Reconnect,
    }
}

fn is_fatal_error(err: &ConnectionError) -> bool {
    classify_connection_error(err) == Disposition::Fatal
}

/// Walks the source chain down to the root cause.
fn get_error_message(e: &dyn std::error::Error) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string().trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use std::io;

    use rumqttc::MqttOptions;

    use super::*;
    use crate::token::Token;

    fn kernel() -> (ConnectionKernel, oneshot::Receiver<Result<()>>) {
        let options = MqttOptions::new("kernel-test", "127.0.0.1", 1);
        let event_loop = EventLoop::new(options, 10);
        let (tx, rx) = oneshot::channel();
        let kernel = ConnectionKernel::new(
            event_loop,
            Arc::new(Mutex::new(PendingRequests::default())),
            Hooks::default(),
            Arc::new(AtomicBool::new(false)),
            CancellationToken::new(),
            Backoff::default(),
            tx,
        );
        (kernel, rx)
    }

    #[test]
    fn test_fatal_classification() {
        let refused = ConnectionError::Io(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert!(!is_fatal_error(&refused));

        let denied = ConnectionError::Io(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "permission denied",
        ));
        assert!(is_fatal_error(&denied));

        let auth = ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized);
        assert!(is_fatal_error(&auth));

        let busy = ConnectionError::ConnectionRefused(ConnectReturnCode::ServiceUnavailable);
        assert!(!is_fatal_error(&busy));

        assert!(!is_fatal_error(&ConnectionError::NetworkTimeout));
    }

    #[test]
    fn test_root_cause_message() {
        let err = ConnectionError::Io(io::Error::new(io::ErrorKind::Other, "\"reset\""));
        assert_eq!(get_error_message(&err), "reset");
    }

    #[tokio::test]
    async fn test_initial_failure_is_reported_and_stops() {
        let (mut kernel, rx) = kernel();
        let flow = kernel
            .handle_error(ConnectionError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "refused",
            )))
            .await;

        assert_eq!(flow, Flow::Stop);
        assert!(matches!(rx.await, Ok(Err(NetworkError::Connection(_)))));
    }

    #[tokio::test]
    async fn test_connack_reports_success_and_sets_flag() {
        let (mut kernel, rx) = kernel();
        let connected = kernel.connected.clone();

        let ack = rumqttc::ConnAck::new(ConnectReturnCode::Success, false);
        assert_eq!(kernel.handle_incoming(Packet::ConnAck(ack)), Flow::Continue);

        assert!(connected.load(Ordering::Acquire));
        assert!(matches!(rx.await, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_outgoing_disconnect_stops() {
        let (mut kernel, _rx) = kernel();
        assert_eq!(kernel.handle_outgoing(Outgoing::Disconnect), Flow::Stop);
    }

    #[tokio::test]
    async fn test_cancelled_run_fails_pending_waiters() {
        let (kernel, rx) = kernel();
        let pending = kernel.pending.clone();
        let cancel = kernel.cancel.clone();

        let (waiter, token) = Token::channel();
        pending.lock().queue_unsubscribe(waiter);

        cancel.cancel();
        kernel.run().await;

        assert!(matches!(token.wait().await, Err(NetworkError::ConnectionClosed)));
        assert!(matches!(rx.await, Ok(Err(NetworkError::ConnectionClosed))));
    }

    #[tokio::test]
    async fn test_transient_error_after_connect_invokes_reconnect_hook() {
        let (mut kernel, _rx) = kernel();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        kernel.hooks = Hooks::default().on_reconnect(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        kernel.backoff = Backoff::new(
            std::time::Duration::from_millis(1),
            std::time::Duration::from_millis(5),
            2.0,
        );
        kernel.connack = None;

        let flow = kernel.handle_error(ConnectionError::NetworkTimeout).await;
        assert_eq!(flow, Flow::Continue);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
