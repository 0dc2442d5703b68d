//! Signaling channel abstraction and an in-process hub.
//!
//! The channel is a per-user pub/sub topic (`call:<userId>`). Delivery is
//! at-most-once with no acknowledgement; a message published to a topic
//! nobody listens on is gone.

use async_trait::async_trait;
use callcore::{SignalingMessage, UserId, topic_for};
use dashmap::DashMap;
use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

use super::error::SignalingError;

/// Receiving end of a subscription. Each delivered message is pushed here.
pub type MessageSink = mpsc::UnboundedSender<SignalingMessage>;

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Start receiving every message addressed to `user_id`.
    async fn subscribe(&self, user_id: &UserId, on_message: MessageSink)
    -> Result<(), SignalingError>;

    /// Send a message to its target's topic.
    async fn publish(&self, message: SignalingMessage) -> Result<(), SignalingError>;

    /// Stop receiving messages for `user_id`.
    async fn unsubscribe(&self, user_id: &UserId) -> Result<(), SignalingError>;
}

#[derive(Default)]
struct HubInner {
    subscribers: DashMap<String, MessageSink>,
    /// `Some` while delivery is held for scripted release.
    held: Mutex<Option<VecDeque<SignalingMessage>>>,
    log: Mutex<Vec<SignalingMessage>>,
}

/// Process-local signaling hub.
///
/// Cloning shares the hub. Delivery is immediate unless [`hold`] was called,
/// in which case published messages queue up until released one by one or
/// in bulk, in any order the caller picks.
///
/// [`hold`]: InMemoryChannel::hold
#[derive(Clone, Default)]
pub struct InMemoryChannel {
    inner: Arc<HubInner>,
}

impl InMemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue published messages instead of delivering them.
    pub async fn hold(&self) {
        let mut held = self.inner.held.lock().await;
        if held.is_none() {
            *held = Some(VecDeque::new());
        }
    }

    /// Deliver everything still queued and return to immediate delivery.
    pub async fn resume(&self) {
        let queued = self.inner.held.lock().await.take().unwrap_or_default();
        for message in queued {
            self.deliver(message);
        }
    }

    /// Messages currently queued, oldest first.
    pub async fn held(&self) -> Vec<SignalingMessage> {
        self.inner
            .held
            .lock()
            .await
            .as_ref()
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Deliver the first queued message matching `predicate`.
    ///
    /// Returns the delivered message, or `None` if nothing matched.
    pub async fn release_where(
        &self,
        predicate: impl Fn(&SignalingMessage) -> bool,
    ) -> Option<SignalingMessage> {
        let message = {
            let mut held = self.inner.held.lock().await;
            let queue = held.as_mut()?;
            let index = queue.iter().position(predicate)?;
            queue.remove(index)?
        };
        self.deliver(message.clone());
        Some(message)
    }

    /// Deliver every queued message, oldest first, staying in hold mode.
    pub async fn release_all(&self) -> usize {
        let queued: Vec<_> = match self.inner.held.lock().await.as_mut() {
            Some(queue) => queue.drain(..).collect(),
            None => Vec::new(),
        };
        let count = queued.len();
        for message in queued {
            self.deliver(message);
        }
        count
    }

    /// Drop every queued message, simulating loss in transit.
    pub async fn discard_held(&self) -> usize {
        match self.inner.held.lock().await.as_mut() {
            Some(queue) => queue.drain(..).count(),
            None => 0,
        }
    }

    /// Everything ever published, in publish order.
    pub async fn published(&self) -> Vec<SignalingMessage> {
        self.inner.log.lock().await.clone()
    }

    pub fn is_subscribed(&self, user_id: &UserId) -> bool {
        self.inner.subscribers.contains_key(&topic_for(user_id))
    }

    fn deliver(&self, message: SignalingMessage) {
        let topic = topic_for(&message.target_id);
        let Some(sink) = self.inner.subscribers.get(&topic).map(|s| s.clone()) else {
            debug!(target: "Call/Channel", "No subscriber on {topic}, dropping {}", message.kind);
            return;
        };
        if sink.send(message).is_err() {
            warn!(target: "Call/Channel", "Subscriber on {topic} went away, removing it");
            self.inner.subscribers.remove(&topic);
        }
    }
}

#[async_trait]
impl SignalingChannel for InMemoryChannel {
    async fn subscribe(
        &self,
        user_id: &UserId,
        on_message: MessageSink,
    ) -> Result<(), SignalingError> {
        let topic = topic_for(user_id);
        // A closed sink left behind by a dropped subscriber may be replaced.
        if let Some(existing) = self.inner.subscribers.get(&topic)
            && !existing.is_closed()
        {
            return Err(SignalingError::AlreadySubscribed(topic));
        }
        debug!(target: "Call/Channel", "Subscribed to {topic}");
        self.inner.subscribers.insert(topic, on_message);
        Ok(())
    }

    async fn publish(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        self.inner.log.lock().await.push(message.clone());
        {
            let mut held = self.inner.held.lock().await;
            if let Some(queue) = held.as_mut() {
                queue.push_back(message);
                return Ok(());
            }
        }
        self.deliver(message);
        Ok(())
    }

    async fn unsubscribe(&self, user_id: &UserId) -> Result<(), SignalingError> {
        let topic = topic_for(user_id);
        if self.inner.subscribers.remove(&topic).is_some() {
            debug!(target: "Call/Channel", "Unsubscribed from {topic}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callcore::{CallKind, SignalingType};

    fn alice() -> UserId {
        UserId::new("alice")
    }

    fn bob() -> UserId {
        UserId::new("bob")
    }

    #[tokio::test]
    async fn test_publish_routes_by_target_topic() {
        let hub = InMemoryChannel::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.subscribe(&bob(), tx).await.unwrap();

        hub.publish(SignalingMessage::call_request(&alice(), &bob(), CallKind::Audio))
            .await
            .unwrap();
        // Addressed to alice, who is not listening: dropped.
        hub.publish(SignalingMessage::call_end(&bob(), &alice()))
            .await
            .unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(got.kind, SignalingType::CallRequest);
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.published().await.len(), 2);
    }

    #[tokio::test]
    async fn test_double_subscribe_is_rejected() {
        let hub = InMemoryChannel::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        hub.subscribe(&bob(), tx1).await.unwrap();
        assert!(matches!(
            hub.subscribe(&bob(), tx2).await,
            Err(SignalingError::AlreadySubscribed(_))
        ));
    }

    #[tokio::test]
    async fn test_resubscribe_after_receiver_dropped() {
        let hub = InMemoryChannel::new();
        let (tx1, rx1) = mpsc::unbounded_channel();
        hub.subscribe(&bob(), tx1).await.unwrap();
        drop(rx1);

        let (tx2, _rx2) = mpsc::unbounded_channel();
        assert!(hub.subscribe(&bob(), tx2).await.is_ok());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let hub = InMemoryChannel::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.subscribe(&bob(), tx).await.unwrap();
        hub.unsubscribe(&bob()).await.unwrap();
        assert!(!hub.is_subscribed(&bob()));

        hub.publish(SignalingMessage::call_end(&alice(), &bob()))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_hold_and_release_out_of_order() {
        let hub = InMemoryChannel::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.subscribe(&bob(), tx).await.unwrap();
        hub.hold().await;

        hub.publish(SignalingMessage::call_request(&alice(), &bob(), CallKind::Audio))
            .await
            .unwrap();
        hub.publish(SignalingMessage::call_end(&alice(), &bob()))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.held().await.len(), 2);

        let released = hub
            .release_where(|m| m.kind == SignalingType::CallEnd)
            .await
            .unwrap();
        assert_eq!(released.kind, SignalingType::CallEnd);
        assert_eq!(rx.recv().await.unwrap().kind, SignalingType::CallEnd);

        assert_eq!(hub.release_all().await, 1);
        assert_eq!(rx.recv().await.unwrap().kind, SignalingType::CallRequest);
    }

    #[tokio::test]
    async fn test_discard_held_simulates_loss() {
        let hub = InMemoryChannel::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.subscribe(&bob(), tx).await.unwrap();
        hub.hold().await;
        hub.publish(SignalingMessage::call_end(&alice(), &bob()))
            .await
            .unwrap();
        assert_eq!(hub.discard_held().await, 1);
        hub.resume().await;
        assert!(rx.try_recv().is_err());
    }
}
