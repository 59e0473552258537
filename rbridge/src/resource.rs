//! Protocol independent read and write of a resource.

use std::sync::Arc;

use bytes::Bytes;

use crate::broker::Broker;
use crate::error::GatewayError;
use crate::event::UpdateEvents;
use crate::observe::Observation;
use crate::retain::RetainStorage;
use crate::types::{Protocol, PublishOptions, Retain, Seq, TopicName, UpdateEvent};

/// Resource locator returned to writers, `/{root}/{topic}`.
#[inline]
pub fn locate(root: &str, topic: &str) -> String {
    format!("/{}/{}", root, topic)
}

/// Result of a read.
pub struct Resource {
    pub retain: Retain,
    /// Live updates following `retain`, if observation was requested
    pub observation: Option<Observation>,
}

/// A completed write whose update event has not been emitted yet.
///
/// Adapters reply to the writer first and then call [`Written::updated`]. The event can only be
/// emitted once since `updated` consumes the value.
#[must_use = "the update event is only emitted by `Written::updated`"]
pub struct Written {
    event: UpdateEvent,
    events: Arc<UpdateEvents>,
}

impl Written {
    #[inline]
    pub fn topic(&self) -> &TopicName {
        &self.event.topic
    }

    #[inline]
    pub fn seq(&self) -> Seq {
        self.event.seq
    }

    /// Emits the gateway `updated` event.
    #[inline]
    pub fn updated(self) -> bool {
        self.events.emit(self.event)
    }
}

#[derive(Clone)]
pub struct ResourceHandler {
    retain: Arc<dyn RetainStorage>,
    broker: Arc<dyn Broker>,
    events: Arc<UpdateEvents>,
}

impl ResourceHandler {
    #[inline]
    pub fn new(retain: Arc<dyn RetainStorage>, broker: Arc<dyn Broker>, events: Arc<UpdateEvents>) -> Self {
        Self { retain, broker, events }
    }

    /// Subscribes to `topic_filter`, then looks up everything retained under it.
    ///
    /// Everything the lookup returned is marked as seen on the observation, so the live stream
    /// continues exactly where the retained values end.
    pub async fn observe(&self, topic_filter: &str) -> Result<(Vec<Retain>, Observation), GatewayError> {
        let mut observation = Observation::subscribe(self.broker.clone(), topic_filter).await?;
        match self.retain.lookup_retained(topic_filter).await {
            Ok(mut retaineds) => {
                retaineds.sort_by_key(|r| r.seq);
                retaineds.iter().for_each(|r| observation.seen(r));
                Ok((retaineds, observation))
            }
            Err(e) => {
                observation.cancel().await;
                Err(GatewayError::Store(e))
            }
        }
    }

    /// Looks up the retained value stored under exactly `topic`.
    ///
    /// The name is opaque, `+` and `#` in it are not wildcards. With `observe` the caller gets the
    /// retained value first and then each later write to the same name exactly once; the
    /// subscription is taken before the lookup so no write in between is lost.
    pub async fn get(&self, topic: &str, observe: bool) -> Result<Resource, GatewayError> {
        let mut observation = if observe {
            Some(Observation::subscribe_exact(self.broker.clone(), topic).await?)
        } else {
            None
        };

        match self.retain.get_retained(topic).await {
            Ok(Some(retain)) => {
                if let Some(o) = observation.as_mut() {
                    o.seen(&retain);
                }
                Ok(Resource { retain, observation })
            }
            res => {
                if let Some(o) = observation {
                    o.cancel().await;
                }
                match res {
                    Err(e) => Err(GatewayError::Store(e)),
                    Ok(_) => Err(GatewayError::NotFound),
                }
            }
        }
    }

    /// Stores `payload` as the retained value of `topic` and publishes it.
    ///
    /// The returned [`Written`] must be used to emit the update event once the writer has been
    /// answered. Nothing is emitted if either step fails.
    pub async fn put(&self, topic: &str, payload: Bytes, origin: Protocol) -> Result<Written, GatewayError> {
        let seq = self
            .retain
            .store_retained(Retain::new(topic, payload.clone()))
            .await
            .map_err(GatewayError::Store)?;

        let topic = TopicName::from(topic);
        let opts = PublishOptions { retain: true, seq: Some(seq), origin: Some(origin) };
        self.broker.publish(&topic, payload.clone(), opts).await.map_err(GatewayError::Broker)?;

        Ok(Written { event: UpdateEvent { topic, payload, seq, origin }, events: self.events.clone() })
    }

    /// Publishes without touching the retained store; no update event is produced.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        origin: Protocol,
    ) -> Result<usize, GatewayError> {
        let opts = PublishOptions { retain: false, seq: None, origin: Some(origin) };
        self.broker.publish(&TopicName::from(topic), payload, opts).await.map_err(GatewayError::Broker)
    }

    #[inline]
    pub fn retain(&self) -> &Arc<dyn RetainStorage> {
        &self.retain
    }

    #[inline]
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }
}
