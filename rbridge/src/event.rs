use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::types::UpdateEvent;
use crate::Result;

pub type UpdateReceiver = broadcast::Receiver<UpdateEvent>;

/// Synchronous consumer of update events. Called on the writer's task, so keep it short.
pub trait UpdateSink: Sync + Send {
    fn updated(&self, event: &UpdateEvent);
}

impl<F> UpdateSink for F
where
    F: Fn(&UpdateEvent) + Sync + Send,
{
    #[inline]
    fn updated(&self, event: &UpdateEvent) {
        self(event)
    }
}

/// The gateway-wide `updated(topic, payload)` stream.
///
/// Closed until the gateway opens it on start, closed again on stop. Events emitted while closed
/// are dropped.
pub struct UpdateEvents {
    capacity: usize,
    tx: RwLock<Option<broadcast::Sender<UpdateEvent>>>,
    sinks: RwLock<Vec<Arc<dyn UpdateSink>>>,
    emitted: AtomicUsize,
}

impl UpdateEvents {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tx: RwLock::new(None),
            sinks: RwLock::new(Vec::new()),
            emitted: AtomicUsize::new(0),
        }
    }

    pub fn open(&self) {
        let mut tx = self.tx.write();
        if tx.is_none() {
            tx.replace(broadcast::channel(self.capacity).0);
        }
    }

    /// Ends every outstanding [`UpdateReceiver`].
    pub fn close(&self) {
        self.tx.write().take();
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.tx.read().is_some()
    }

    pub fn subscribe(&self) -> Result<UpdateReceiver> {
        self.tx.read().as_ref().map(|tx| tx.subscribe()).ok_or_else(|| anyhow!("update events are closed"))
    }

    pub fn add_sink(&self, sink: Arc<dyn UpdateSink>) {
        self.sinks.write().push(sink);
    }

    /// Returns `false` if the stream was closed and the event was dropped.
    pub fn emit(&self, event: UpdateEvent) -> bool {
        let tx = self.tx.read();
        let tx = match tx.as_ref() {
            Some(tx) => tx,
            None => {
                log::warn!("update events are closed, drop update of {:?}", event.topic);
                return false;
            }
        };
        for sink in self.sinks.read().iter() {
            sink.updated(&event);
        }
        log::debug!("updated {:?}, seq: {}, origin: {}", event.topic, event.seq, event.origin);
        self.emitted.fetch_add(1, Ordering::SeqCst);
        //no receivers is not an error
        let _ = tx.send(event);
        true
    }

    #[inline]
    pub fn emitted(&self) -> usize {
        self.emitted.load(Ordering::SeqCst)
    }
}

impl Default for UpdateEvents {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::types::{Protocol, TopicName};

    fn event(payload: &'static [u8]) -> UpdateEvent {
        UpdateEvent {
            topic: TopicName::from("hello"),
            payload: Bytes::from_static(payload),
            seq: 1,
            origin: Protocol::Http,
        }
    }

    #[tokio::test]
    async fn lifecycle() {
        let events = UpdateEvents::new(8);
        assert!(events.subscribe().is_err());
        assert!(!events.emit(event(b"dropped")));

        events.open();
        let mut rx = events.subscribe().unwrap();
        assert!(events.emit(event(b"world")));
        assert_eq!(rx.recv().await.unwrap().payload, Bytes::from_static(b"world"));

        events.close();
        assert!(!events.is_open());
        assert!(rx.recv().await.is_err());
        assert_eq!(events.emitted(), 1);
    }

    #[test]
    fn sinks() {
        let events = UpdateEvents::default();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen1 = seen.clone();
        events.add_sink(Arc::new(move |e: &UpdateEvent| seen1.lock().push(e.payload.clone())));
        events.open();
        events.emit(event(b"a"));
        events.emit(event(b"b"));
        assert_eq!(*seen.lock(), vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
    }
}
