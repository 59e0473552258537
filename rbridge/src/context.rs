use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::acl::AclAuthenticator;
use crate::auth::{AllowAll, AuthPipeline, Authenticator};
use crate::broker::{Broker, DefaultBroker};
use crate::conf::Settings;
use crate::event::{UpdateEvents, UpdateSink};
use crate::resource::ResourceHandler;
use crate::retain::{DefaultRetainStorage, RetainStorage};
use crate::Result;

/// Everything shared by the protocol adapters of one gateway.
#[derive(Clone)]
pub struct GatewayContext {
    inner: Arc<GatewayContextInner>,
}

pub struct GatewayContextInner {
    pub settings: Settings,
    pub retain: Arc<dyn RetainStorage>,
    pub broker: Arc<dyn Broker>,
    pub auth: AuthPipeline,
    pub events: Arc<UpdateEvents>,
    pub resources: ResourceHandler,
}

impl Deref for GatewayContext {
    type Target = GatewayContextInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl GatewayContext {
    #[allow(clippy::new_ret_no_self)]
    #[inline]
    pub fn new(settings: Settings) -> GatewayContextBuilder {
        GatewayContextBuilder::new(settings)
    }
}

impl fmt::Debug for GatewayContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "GatewayContext ...")?;
        Ok(())
    }
}

/// Collaborators not set explicitly fall back to the in-memory store and broker, and to the ACL
/// authenticator when `auth.enable` is set, [`AllowAll`] otherwise.
pub struct GatewayContextBuilder {
    settings: Settings,
    retain: Option<Arc<dyn RetainStorage>>,
    broker: Option<Arc<dyn Broker>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    sinks: Vec<Arc<dyn UpdateSink>>,
}

impl GatewayContextBuilder {
    fn new(settings: Settings) -> Self {
        Self { settings, retain: None, broker: None, authenticator: None, sinks: Vec::new() }
    }

    pub fn retain(mut self, retain: Arc<dyn RetainStorage>) -> Self {
        self.retain = Some(retain);
        self
    }

    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn UpdateSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn build(self) -> Result<GatewayContext> {
        let settings = self.settings;
        let retain =
            self.retain.unwrap_or_else(|| Arc::new(DefaultRetainStorage::new(settings.retain.clone())));
        let broker = self.broker.unwrap_or_else(|| Arc::new(DefaultBroker::new()));
        let authenticator: Arc<dyn Authenticator> = match self.authenticator {
            Some(a) => a,
            None if settings.auth.enable => Arc::new(AclAuthenticator::new(&settings.auth)?),
            None => Arc::new(AllowAll),
        };
        let events = Arc::new(UpdateEvents::new(settings.events.capacity));
        for sink in self.sinks {
            events.add_sink(sink);
        }
        let resources = ResourceHandler::new(retain.clone(), broker.clone(), events.clone());
        Ok(GatewayContext {
            inner: Arc::new(GatewayContextInner {
                settings,
                retain,
                broker,
                auth: AuthPipeline::new(authenticator),
                events,
                resources,
            }),
        })
    }
}
