//! Correlates queued requests with the acknowledgements that complete them.
//!
//! rumqttc hands out no per-request handle: a request goes into the client's
//! channel, and the event loop later reports `Outgoing::Publish(pkid)` (or
//! `Subscribe`/`Unsubscribe`) once it is written, followed eventually by the
//! matching ack. Requests of one kind leave the channel in the order they were
//! queued, so each kind keeps a FIFO of waiters:
//!
//! ```text
//! queue()            Outgoing(pkid)          Incoming ack(pkid)
//!   │                     │                        │
//!   ▼                     ▼                        ▼
//! queued ──pop front──► inflight[pkid] ──remove──► Waiter::complete
//! ```
//!
//! QoS 0 publishes have no ack and complete as soon as they are written.
//! A publish that collides with a still-inflight packet id is reported as
//! `Outgoing::AwaitAck(pkid)` first and written later; it is parked until then.
//! After a reconnect rumqttc retransmits unacknowledged publishes under their
//! original ids; those keep their existing waiter.

use std::collections::{HashMap, VecDeque};

use rumqttc::{QoS, SubscribeReasonCode};
use tracing::{trace, warn};

use super::{error::NetworkError, token::Waiter};

#[derive(Debug, Default)]
pub(crate) struct PendingRequests {
    queued_publishes: VecDeque<(QoS, Waiter)>,
    queued_subscribes: VecDeque<(String, Waiter)>,
    queued_unsubscribes: VecDeque<Waiter>,
    inflight_publishes: HashMap<u16, Waiter>,
    parked_publishes: HashMap<u16, Waiter>,
    inflight_subscribes: HashMap<u16, (String, Waiter)>,
    inflight_unsubscribes: HashMap<u16, Waiter>,
}

impl PendingRequests {
    pub(crate) fn queue_publish(&mut self, qos: QoS, waiter: Waiter) {
        self.queued_publishes.push_back((qos, waiter));
    }

    pub(crate) fn queue_subscribe(&mut self, topic: String, waiter: Waiter) {
        self.queued_subscribes.push_back((topic, waiter));
    }

    pub(crate) fn queue_unsubscribe(&mut self, waiter: Waiter) {
        self.queued_unsubscribes.push_back(waiter);
    }

    /// Takes back the most recently queued publish when the request never
    /// reached the client channel.
    pub(crate) fn unqueue_publish(&mut self) -> Option<Waiter> {
        self.queued_publishes.pop_back().map(|(_, waiter)| waiter)
    }

    pub(crate) fn unqueue_subscribe(&mut self) -> Option<Waiter> {
        self.queued_subscribes.pop_back().map(|(_, waiter)| waiter)
    }

    pub(crate) fn unqueue_unsubscribe(&mut self) -> Option<Waiter> {
        self.queued_unsubscribes.pop_back()
    }

    /// A PUBLISH packet was written with `pkid`.
    pub(crate) fn publish_sent(&mut self, pkid: u16) {
        if pkid != 0 {
            if self.inflight_publishes.contains_key(&pkid) {
                trace!(pkid, "Retransmitted publish");
                return;
            }
            if let Some(waiter) = self.parked_publishes.remove(&pkid) {
                self.inflight_publishes.insert(pkid, waiter);
                return;
            }
        }

        match self.queued_publishes.pop_front() {
            Some((QoS::AtMostOnce, waiter)) => waiter.succeed(),
            Some((_, waiter)) => {
                self.inflight_publishes.insert(pkid, waiter);
            }
            None => warn!(pkid, "Outgoing publish without a queued request"),
        }
    }

    /// A publish was held back because `pkid` is still inflight.
    pub(crate) fn publish_parked(&mut self, pkid: u16) {
        if let Some((_, waiter)) = self.queued_publishes.pop_front() {
            self.parked_publishes.insert(pkid, waiter);
        }
    }

    /// PUBACK (QoS 1) or PUBCOMP (QoS 2) arrived.
    pub(crate) fn publish_acked(&mut self, pkid: u16) {
        if let Some(waiter) = self.inflight_publishes.remove(&pkid) {
            waiter.succeed();
        }
    }

    pub(crate) fn subscribe_sent(&mut self, pkid: u16) {
        match self.queued_subscribes.pop_front() {
            Some(entry) => {
                self.inflight_subscribes.insert(pkid, entry);
            }
            None => warn!(pkid, "Outgoing subscribe without a queued request"),
        }
    }

    pub(crate) fn subscribe_acked(&mut self, pkid: u16, return_codes: &[SubscribeReasonCode]) {
        let Some((topic, waiter)) = self.inflight_subscribes.remove(&pkid) else {
            return;
        };

        if return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
        {
            waiter.fail(NetworkError::SubscribeRejected { topic });
        } else {
            waiter.succeed();
        }
    }

    pub(crate) fn unsubscribe_sent(&mut self, pkid: u16) {
        match self.queued_unsubscribes.pop_front() {
            Some(waiter) => {
                self.inflight_unsubscribes.insert(pkid, waiter);
            }
            None => warn!(pkid, "Outgoing unsubscribe without a queued request"),
        }
    }

    pub(crate) fn unsubscribe_acked(&mut self, pkid: u16) {
        if let Some(waiter) = self.inflight_unsubscribes.remove(&pkid) {
            waiter.succeed();
        }
    }

    /// The connection dropped. Subscribe and unsubscribe requests already on the
    /// wire are not retransmitted, so their waiters fail now. Queued requests and
    /// inflight publishes survive for the next connection.
    pub(crate) fn connection_lost(&mut self) {
        for (_, (_, waiter)) in self.inflight_subscribes.drain() {
            waiter.fail(NetworkError::ConnectionLost);
        }
        for (_, waiter) in self.inflight_unsubscribes.drain() {
            waiter.fail(NetworkError::ConnectionLost);
        }
    }

    /// The driver stopped; nothing pending can complete anymore.
    pub(crate) fn close(&mut self) {
        let queued = self
            .queued_publishes
            .drain(..)
            .map(|(_, w)| w)
            .chain(self.queued_subscribes.drain(..).map(|(_, w)| w))
            .chain(self.queued_unsubscribes.drain(..));
        let inflight = self
            .inflight_publishes
            .drain()
            .map(|(_, w)| w)
            .chain(self.parked_publishes.drain().map(|(_, w)| w))
            .chain(self.inflight_subscribes.drain().map(|(_, (_, w))| w))
            .chain(self.inflight_unsubscribes.drain().map(|(_, w)| w));

        for waiter in queued.chain(inflight) {
            waiter.fail(NetworkError::ConnectionClosed);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.queued_publishes.is_empty()
            && self.queued_subscribes.is_empty()
            && self.queued_unsubscribes.is_empty()
            && self.inflight_publishes.is_empty()
            && self.parked_publishes.is_empty()
            && self.inflight_subscribes.is_empty()
            && self.inflight_unsubscribes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::Token;

    #[tokio::test]
    async fn test_qos0_publish_completes_on_write() {
        let mut pending = PendingRequests::default();
        let (waiter, token) = Token::channel();
        pending.queue_publish(QoS::AtMostOnce, waiter);

        pending.publish_sent(0);
        assert!(token.wait().await.is_ok());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_qos1_publish_completes_on_ack() {
        let mut pending = PendingRequests::default();
        let (w1, t1) = Token::channel();
        let (w2, t2) = Token::channel();
        pending.queue_publish(QoS::AtLeastOnce, w1);
        pending.queue_publish(QoS::AtLeastOnce, w2);

        pending.publish_sent(1);
        pending.publish_sent(2);
        pending.publish_acked(2);
        assert!(t2.wait().await.is_ok());

        pending.publish_acked(1);
        assert!(t1.wait().await.is_ok());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_retransmit_keeps_original_waiter() {
        let mut pending = PendingRequests::default();
        let (w1, t1) = Token::channel();
        let (w2, t2) = Token::channel();
        pending.queue_publish(QoS::AtLeastOnce, w1);
        pending.publish_sent(7);
        pending.queue_publish(QoS::AtMostOnce, w2);

        // retransmission of 7 must not consume the queued QoS 0 request
        pending.publish_sent(7);
        pending.publish_sent(0);
        assert!(t2.wait().await.is_ok());

        pending.publish_acked(7);
        assert!(t1.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_parked_publish_resumes() {
        let mut pending = PendingRequests::default();
        let (w1, t1) = Token::channel();
        let (w2, t2) = Token::channel();
        pending.queue_publish(QoS::AtLeastOnce, w1);
        pending.queue_publish(QoS::AtLeastOnce, w2);

        pending.publish_sent(3);
        pending.publish_parked(3);
        pending.publish_acked(3);
        assert!(t1.wait().await.is_ok());

        pending.publish_sent(3);
        pending.publish_acked(3);
        assert!(t2.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_subscribe_failure_code_rejects() {
        let mut pending = PendingRequests::default();
        let (w1, t1) = Token::channel();
        let (w2, t2) = Token::channel();
        pending.queue_subscribe("test/ok".into(), w1);
        pending.queue_subscribe("test/denied".into(), w2);

        pending.subscribe_sent(1);
        pending.subscribe_sent(2);
        pending.subscribe_acked(1, &[SubscribeReasonCode::Success(QoS::AtLeastOnce)]);
        pending.subscribe_acked(2, &[SubscribeReasonCode::Failure]);

        assert!(t1.wait().await.is_ok());
        match t2.wait().await {
            Err(NetworkError::SubscribeRejected { topic }) => assert_eq!(topic, "test/denied"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connection_lost_fails_inflight_subscriptions_only() {
        let mut pending = PendingRequests::default();
        let (ws, ts) = Token::channel();
        let (wu, tu) = Token::channel();
        let (wp, tp) = Token::channel();
        pending.queue_subscribe("a".into(), ws);
        pending.queue_unsubscribe(wu);
        pending.queue_publish(QoS::AtLeastOnce, wp);
        pending.subscribe_sent(1);
        pending.unsubscribe_sent(2);
        pending.publish_sent(3);

        pending.connection_lost();
        assert!(matches!(ts.wait().await, Err(NetworkError::ConnectionLost)));
        assert!(matches!(tu.wait().await, Err(NetworkError::ConnectionLost)));

        pending.publish_acked(3);
        assert!(tp.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_fails_everything() {
        let mut pending = PendingRequests::default();
        let (w1, t1) = Token::channel();
        let (w2, t2) = Token::channel();
        pending.queue_publish(QoS::ExactlyOnce, w1);
        pending.queue_unsubscribe(w2);
        pending.publish_sent(9);

        pending.close();
        assert!(matches!(t1.wait().await, Err(NetworkError::ConnectionClosed)));
        assert!(matches!(t2.wait().await, Err(NetworkError::ConnectionClosed)));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_unqueue_returns_latest_waiter() {
        let mut pending = PendingRequests::default();
        let (w1, _t1) = Token::channel();
        let (w2, t2) = Token::channel();
        pending.queue_subscribe("a".into(), w1);
        pending.queue_subscribe("b".into(), w2);

        let waiter = pending.unqueue_subscribe().unwrap();
        waiter.fail(NetworkError::NotConnected);
        assert!(matches!(t2.wait().await, Err(NetworkError::NotConnected)));
    }
}
