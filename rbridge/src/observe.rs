//! Live observations of a topic.
//!
//! An [`Observation`] owns exactly one broker subscription. It may be ended from several places
//! at once (the peer going away, a delivery failure, server shutdown); all of them go through
//! [`Canceller::cancel`], which unsubscribes only on the first call. Dropping the last handle of an
//! observation that was never cancelled unsubscribes in the background.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::broker::Broker;
use crate::error::GatewayError;
use crate::types::{HashMap, Message, Retain, Seq, SubscriptionId, TopicFilter, TopicName};

struct CancellerInner {
    broker: Arc<dyn Broker>,
    topic_filter: TopicFilter,
    id: SubscriptionId,
    cancelled: AtomicBool,
}

impl Drop for CancellerInner {
    fn drop(&mut self) {
        if *self.cancelled.get_mut() {
            return;
        }
        let broker = self.broker.clone();
        let topic_filter = self.topic_filter.clone();
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = broker.unsubscribe(&topic_filter, id).await {
                        log::warn!("unsubscribe {:?} failed, {}", topic_filter, e);
                    }
                });
            }
            Err(_) => log::warn!("observation {:?}/{} dropped outside of a runtime", self.topic_filter, id),
        }
    }
}

/// Shareable handle that ends an [`Observation`].
#[derive(Clone)]
pub struct Canceller {
    inner: Arc<CancellerInner>,
}

impl Canceller {
    /// Unsubscribes from the broker. Only the first call does anything and returns `true`.
    pub async fn cancel(&self) -> bool {
        if self.inner.cancelled.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return false;
        }
        log::debug!("cancel observation {:?}/{}", self.inner.topic_filter, self.inner.id);
        if let Err(e) = self.inner.broker.unsubscribe(&self.inner.topic_filter, self.inner.id).await {
            log::warn!("unsubscribe {:?} failed, {}", self.inner.topic_filter, e);
        }
        true
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }
}

pub struct Observation {
    rx: mpsc::UnboundedReceiver<Message>,
    canceller: Canceller,
    //highest sequence number already handed out per topic
    seen: HashMap<TopicName, Seq>,
}

impl Observation {
    /// Observes every topic matching the MQTT filter `topic_filter`.
    pub(crate) async fn subscribe(broker: Arc<dyn Broker>, topic_filter: &str) -> Result<Self, GatewayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = broker.subscribe(topic_filter, tx).await.map_err(GatewayError::Broker)?;
        Ok(Self::new(broker, topic_filter, id, rx))
    }

    /// Observes exactly the topic named `topic`.
    pub(crate) async fn subscribe_exact(broker: Arc<dyn Broker>, topic: &str) -> Result<Self, GatewayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = broker.subscribe_exact(topic, tx).await.map_err(GatewayError::Broker)?;
        Ok(Self::new(broker, topic, id, rx))
    }

    fn new(
        broker: Arc<dyn Broker>,
        topic_filter: &str,
        id: SubscriptionId,
        rx: mpsc::UnboundedReceiver<Message>,
    ) -> Self {
        let inner = CancellerInner {
            broker,
            topic_filter: TopicFilter::from(topic_filter),
            id,
            cancelled: AtomicBool::new(false),
        };
        Self { rx, canceller: Canceller { inner: Arc::new(inner) }, seen: HashMap::default() }
    }

    /// Marks a retained record as already delivered, so publishes of it or of anything older are
    /// skipped.
    #[inline]
    pub fn seen(&mut self, retain: &Retain) {
        let last = self.seen.entry(retain.topic.clone()).or_insert(0);
        if retain.seq > *last {
            *last = retain.seq;
        }
    }

    /// Next live update, in broker order. `None` once cancelled or when the broker goes away.
    ///
    /// A retained publish whose sequence number is not newer than the last one handed out for its
    /// topic is skipped, the observer already holds a later write of that topic. This covers the
    /// retained value overlapping the live stream, and two writers whose publishes reach the
    /// broker in the opposite order of their store writes.
    pub async fn next(&mut self) -> Option<Message> {
        loop {
            if self.canceller.is_cancelled() {
                return None;
            }
            let msg = self.rx.recv().await?;
            if let Some(seq) = msg.seq {
                let last = self.seen.entry(msg.topic.clone()).or_insert(0);
                if seq <= *last {
                    log::debug!("skip stale update of {:?}, seq: {} <= {}", msg.topic, seq, last);
                    continue;
                }
                *last = seq;
            }
            return Some(msg);
        }
    }

    #[inline]
    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    #[inline]
    pub async fn cancel(&self) -> bool {
        self.canceller.cancel().await
    }

    #[inline]
    pub fn topic_filter(&self) -> &TopicFilter {
        &self.canceller.inner.topic_filter
    }
}
