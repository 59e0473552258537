use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::topic::Topic;
use crate::types::{HashMap, Message, PublishOptions, SubscriptionId, TopicFilter, TopicName};
use crate::Result;

/// Delivery end of a subscription. Messages are queued without blocking the publisher.
pub type Listener = mpsc::UnboundedSender<Message>;

#[async_trait]
pub trait Broker: Sync + Send {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    ///Delivers to every subscription whose filter matches `topic`, returns the number of deliveries.
    async fn publish(&self, topic: &TopicName, payload: Bytes, opts: PublishOptions) -> Result<usize>;

    async fn subscribe(&self, topic_filter: &str, listener: Listener) -> Result<SubscriptionId>;

    ///Subscribes to publishes on exactly `topic`, `+` and `#` in it are ordinary characters.
    async fn subscribe_exact(&self, topic: &str, listener: Listener) -> Result<SubscriptionId>;

    ///`topic_filter` is the filter or exact topic given on subscribe. Returns `false` if the
    ///subscription did not exist.
    async fn unsubscribe(&self, topic_filter: &str, id: SubscriptionId) -> Result<bool>;

    async fn subscriptions(&self) -> usize;
}

struct FilterEntry {
    topic: Topic,
    listeners: HashMap<SubscriptionId, Listener>,
}

#[derive(Default)]
struct Subscriptions {
    filters: HashMap<TopicFilter, FilterEntry>,
    exacts: HashMap<TopicName, HashMap<SubscriptionId, Listener>>,
}

impl Subscriptions {
    #[inline]
    fn len(&self) -> usize {
        self.filters.values().map(|e| e.listeners.len()).sum::<usize>()
            + self.exacts.values().map(|ls| ls.len()).sum::<usize>()
    }
}

#[inline]
fn deliver(id: &SubscriptionId, listener: &Listener, msg: Message) -> bool {
    if listener.send(msg).is_err() {
        log::debug!("subscription {} is closed, message dropped", id);
        false
    } else {
        true
    }
}

/// In-process broker with MQTT topic filter semantics.
///
/// Publishes are serialized by the subscription table lock, so every subscription observes
/// messages in the order the broker accepted them.
pub struct DefaultBroker {
    subs: Mutex<Subscriptions>,
    next_id: AtomicU64,
}

impl Default for DefaultBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultBroker {
    #[inline]
    pub fn new() -> Self {
        Self { subs: Mutex::new(Subscriptions::default()), next_id: AtomicU64::new(1) }
    }
}

#[async_trait]
impl Broker for DefaultBroker {
    async fn stop(&self) -> Result<()> {
        //dropping the listeners ends every open subscription stream
        let removeds = {
            let mut subs = self.subs.lock();
            let n = subs.len();
            *subs = Subscriptions::default();
            n
        };
        log::debug!("broker stopped, dropped {} subscriptions", removeds);
        Ok(())
    }

    async fn publish(&self, topic: &TopicName, payload: Bytes, opts: PublishOptions) -> Result<usize> {
        let subs = self.subs.lock();
        let mut delivered = 0;
        let exacts = subs.exacts.get(topic).into_iter().flat_map(|ls| ls.iter());
        let filtered = subs
            .filters
            .values()
            .filter(|e| e.topic.matches_str(topic))
            .flat_map(|e| e.listeners.iter());
        for (id, listener) in exacts.chain(filtered) {
            if deliver(id, listener, Message::new(topic.clone(), payload.clone(), &opts)) {
                delivered += 1;
            }
        }
        log::debug!("publish to {:?}, delivered: {}", topic, delivered);
        Ok(delivered)
    }

    async fn subscribe(&self, topic_filter: &str, listener: Listener) -> Result<SubscriptionId> {
        let topic = Topic::from_str(topic_filter)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subs
            .lock()
            .filters
            .entry(TopicFilter::from(topic_filter))
            .or_insert_with(|| FilterEntry { topic, listeners: HashMap::default() })
            .listeners
            .insert(id, listener);
        log::debug!("subscribe {:?}, id: {}", topic_filter, id);
        Ok(id)
    }

    async fn subscribe_exact(&self, topic: &str, listener: Listener) -> Result<SubscriptionId> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subs.lock().exacts.entry(TopicName::from(topic)).or_default().insert(id, listener);
        log::debug!("subscribe exactly {:?}, id: {}", topic, id);
        Ok(id)
    }

    async fn unsubscribe(&self, topic_filter: &str, id: SubscriptionId) -> Result<bool> {
        let mut subs = self.subs.lock();
        let mut removed = false;
        if let Some(entry) = subs.filters.get_mut(topic_filter) {
            removed = entry.listeners.remove(&id).is_some();
            if entry.listeners.is_empty() {
                subs.filters.remove(topic_filter);
            }
        }
        if !removed {
            if let Some(listeners) = subs.exacts.get_mut(topic_filter) {
                removed = listeners.remove(&id).is_some();
                if listeners.is_empty() {
                    subs.exacts.remove(topic_filter);
                }
            }
        }
        log::debug!("unsubscribe {:?}, id: {}, removed: {}", topic_filter, id, removed);
        Ok(removed)
    }

    async fn subscriptions(&self) -> usize {
        self.subs.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish_opts() -> PublishOptions {
        PublishOptions { retain: true, seq: Some(1), origin: None }
    }

    #[tokio::test]
    async fn publish_to_matching_filters() {
        let broker = DefaultBroker::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let (tx3, mut rx3) = mpsc::unbounded_channel();
        broker.subscribe("hello", tx1).await.unwrap();
        broker.subscribe("+", tx2).await.unwrap();
        broker.subscribe("/hello", tx3).await.unwrap();
        assert_eq!(broker.subscriptions().await, 3);

        let topic = TopicName::from("hello");
        let n = broker.publish(&topic, Bytes::from_static(b"world"), publish_opts()).await.unwrap();
        assert_eq!(n, 2);
        let m = rx1.recv().await.unwrap();
        assert_eq!(m.payload, Bytes::from_static(b"world"));
        assert!(m.retain);
        assert_eq!(m.seq, Some(1));
        assert_eq!(rx2.recv().await.unwrap().topic, "hello");
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn exact_subscriptions_ignore_wildcards() {
        let broker = DefaultBroker::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let id = broker.subscribe_exact("a/+", tx1).await.unwrap();
        broker.subscribe_exact("a+b", tx2).await.unwrap();

        let topic = TopicName::from("a/1");
        assert_eq!(broker.publish(&topic, Bytes::from_static(b"one"), publish_opts()).await.unwrap(), 0);
        broker.publish(&TopicName::from("a/+"), Bytes::from_static(b"plus"), publish_opts()).await.unwrap();
        broker.publish(&TopicName::from("a+b"), Bytes::from_static(b"ab"), publish_opts()).await.unwrap();
        assert_eq!(rx1.recv().await.unwrap().payload, Bytes::from_static(b"plus"));
        assert_eq!(rx2.recv().await.unwrap().payload, Bytes::from_static(b"ab"));
        assert!(rx1.try_recv().is_err());

        assert!(broker.unsubscribe("a/+", id).await.unwrap());
        assert_eq!(broker.subscriptions().await, 1);
    }

    #[tokio::test]
    async fn order_is_preserved() {
        let broker = DefaultBroker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.subscribe("t", tx).await.unwrap();
        for i in 0..100u32 {
            broker
                .publish(&TopicName::from("t"), Bytes::from(i.to_string()), PublishOptions::default())
                .await
                .unwrap();
        }
        for i in 0..100u32 {
            assert_eq!(rx.recv().await.unwrap().payload, Bytes::from(i.to_string()));
        }
    }

    #[tokio::test]
    async fn unsubscribe_once() {
        let broker = DefaultBroker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = broker.subscribe("a/#", tx).await.unwrap();
        assert!(broker.unsubscribe("a/#", id).await.unwrap());
        assert!(!broker.unsubscribe("a/#", id).await.unwrap());
        assert_eq!(broker.subscriptions().await, 0);
        let topic = TopicName::from("a/b");
        let n = broker.publish(&topic, Bytes::new(), PublishOptions::default()).await.unwrap();
        assert_eq!(n, 0);
        //the listener was dropped with the subscription
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn stop_closes_streams() {
        let broker = DefaultBroker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.subscribe("x", tx).await.unwrap();
        broker.stop().await.unwrap();
        assert!(rx.recv().await.is_none());
        assert!(broker.subscribe("a/#/b", mpsc::unbounded_channel().0).await.is_err());
    }
}
