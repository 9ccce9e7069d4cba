use crate::error::AppError;
use crate::notify::event::{NotificationEvent, Topic};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tower::Service;
use tracing::{debug, trace};

/// Best-effort pub/sub keyed by [`Topic`].
///
/// Only subscribers attached at publish time see an event; nothing is
/// queued for late subscribers and nothing is replayed.
#[derive(Clone)]
pub struct Notifier {
    inner: Arc<NotifierInner>,
}

struct NotifierInner {
    channels: RwLock<HashMap<Topic, broadcast::Sender<NotificationEvent>>>,
    capacity: usize,
    connected: AtomicBool,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                channels: RwLock::new(HashMap::new()),
                capacity: capacity.max(1),
                connected: AtomicBool::new(true),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn connect(&self) {
        self.inner.connected.store(true, Ordering::SeqCst);
    }

    /// Events published while disconnected are dropped.
    pub fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
    }

    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<NotificationEvent> {
        if let Some(sender) = self.read().get(&topic) {
            return sender.subscribe();
        }
        self.write()
            .entry(topic)
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
            .subscribe()
    }

    /// Returns how many subscribers received the event.
    pub fn publish(&self, topic: Topic, event: NotificationEvent) -> usize {
        if !self.is_connected() {
            debug!("Notifier disconnected, dropping event for {}", topic);
            return 0;
        }
        let sent = match self.read().get(&topic) {
            Some(sender) => sender.send(event).ok(),
            None => {
                trace!("No subscribers for {}", topic);
                return 0;
            }
        };
        match sent {
            Some(receivers) => receivers,
            None => {
                // Every receiver went away; forget the channel.
                let mut channels = self.write();
                if channels
                    .get(&topic)
                    .is_some_and(|sender| sender.receiver_count() == 0)
                {
                    channels.remove(&topic);
                }
                0
            }
        }
    }

    /// Drops the topic's channel; its subscribers see the stream close.
    pub fn close_topic(&self, topic: Topic) {
        self.write().remove(&topic);
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.read()
            .get(&topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Topics with a live channel.
    pub fn topic_count(&self) -> usize {
        self.read().len()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Topic, broadcast::Sender<NotificationEvent>>> {
        self.inner
            .channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Topic, broadcast::Sender<NotificationEvent>>> {
        self.inner
            .channels
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Unlike [`Notifier::publish`], the service reports a disconnected transport.
impl Service<(Topic, NotificationEvent)> for Notifier {
    type Response = usize;
    type Error = AppError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.is_connected() {
            Poll::Ready(Ok(()))
        } else {
            Poll::Ready(Err(AppError::NotConnected))
        }
    }

    fn call(&mut self, (topic, event): (Topic, NotificationEvent)) -> Self::Future {
        let delivered = self.publish(topic, event);
        Box::pin(async move { Ok(delivered) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn ready(text: &str) -> NotificationEvent {
        NotificationEvent::PredictionReady {
            prediction_id: Uuid::new_v4(),
            text: text.to_string(),
            confidence: 0.8,
            model_version: "v1".to_string(),
        }
    }

    #[tokio::test]
    async fn subscribers_receive_events_for_their_topic_only() {
        let notifier = Notifier::new(8);
        let mine = Topic::Session(Uuid::new_v4());
        let other = Topic::Session(Uuid::new_v4());
        let mut rx = notifier.subscribe(mine);
        let mut other_rx = notifier.subscribe(other);

        assert_eq!(notifier.publish(mine, ready("hello")), 1);

        assert!(matches!(
            rx.recv().await.unwrap(),
            NotificationEvent::PredictionReady { text, .. } if text == "hello"
        ));
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn late_subscribers_get_no_replay() {
        let notifier = Notifier::new(8);
        let topic = Topic::Video(Uuid::new_v4());
        assert_eq!(notifier.publish(topic, ready("early")), 0);

        let mut rx = notifier.subscribe(topic);
        notifier.publish(topic, ready("late"));
        assert!(matches!(
            rx.recv().await.unwrap(),
            NotificationEvent::PredictionReady { text, .. } if text == "late"
        ));
    }

    #[tokio::test]
    async fn dropped_subscribers_release_the_topic() {
        let notifier = Notifier::new(8);
        let topic = Topic::Video(Uuid::new_v4());
        drop(notifier.subscribe(topic));
        assert_eq!(notifier.publish(topic, ready("nobody")), 0);
        assert_eq!(notifier.subscriber_count(topic), 0);
        assert_eq!(notifier.topic_count(), 0);
    }

    #[tokio::test]
    async fn closing_a_topic_ends_the_stream() {
        let notifier = Notifier::new(8);
        let topic = Topic::Session(Uuid::new_v4());
        let mut rx = notifier.subscribe(topic);
        notifier.close_topic(topic);
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn service_rejects_publishing_while_disconnected() {
        let notifier = Notifier::new(8);
        let topic = Topic::Session(Uuid::new_v4());
        let mut rx = notifier.subscribe(topic);
        notifier.disconnect();

        let result = notifier
            .clone()
            .oneshot((topic, ready("lost")))
            .await;
        assert!(matches!(result, Err(AppError::NotConnected)));
        assert_eq!(notifier.publish(topic, ready("lost")), 0);

        notifier.connect();
        let event = NotificationEvent::ProcessingError {
            kind: ErrorKind::EngineError,
            message: "boom".to_string(),
        };
        assert_eq!(notifier.clone().oneshot((topic, event.clone())).await.unwrap(), 1);
        assert_eq!(rx.recv().await.unwrap(), event);
    }
}
