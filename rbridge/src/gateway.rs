//! One start/stop lifecycle over the retained store, the broker and the protocol adapters.
//!
//! Services start in the order they were added, store first, then broker, then the adapters, and
//! stop in reverse. The `updated` stream is opened before anything starts and closed after
//! everything stopped, so every write accepted by an adapter produces its event.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::broker::Broker;
use crate::context::GatewayContext;
use crate::event::UpdateReceiver;
use crate::retain::RetainStorage;
use crate::Result;

#[async_trait]
pub trait Service: Sync + Send {
    fn name(&self) -> &str;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Bound address of a listening service.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

struct RetainService(Arc<dyn RetainStorage>);

#[async_trait]
impl Service for RetainService {
    fn name(&self) -> &str {
        "retain"
    }

    async fn start(&self) -> Result<()> {
        self.0.start().await
    }

    async fn stop(&self) -> Result<()> {
        self.0.stop().await
    }
}

struct BrokerService(Arc<dyn Broker>);

#[async_trait]
impl Service for BrokerService {
    fn name(&self) -> &str {
        "broker"
    }

    async fn start(&self) -> Result<()> {
        self.0.start().await
    }

    async fn stop(&self) -> Result<()> {
        self.0.stop().await
    }
}

pub struct Gateway {
    scx: GatewayContext,
    services: Vec<Arc<dyn Service>>,
    //number of services currently started, a prefix of `services`
    started: Mutex<Option<usize>>,
}

impl Gateway {
    /// The store and the broker of `scx`, followed by every enabled protocol adapter.
    pub fn new(scx: GatewayContext) -> Self {
        let mut services: Vec<Arc<dyn Service>> =
            vec![Arc::new(RetainService(scx.retain.clone())), Arc::new(BrokerService(scx.broker.clone()))];
        #[cfg(feature = "mqtt")]
        if scx.settings.mqtt.enable {
            services.push(Arc::new(crate::mqtt::MqttServer::new(scx.clone())));
        }
        #[cfg(feature = "http")]
        if scx.settings.http.enable {
            services.push(Arc::new(crate::http::HttpServer::new(scx.clone())));
        }
        #[cfg(feature = "coap")]
        if scx.settings.coap.enable {
            services.push(Arc::new(crate::coap::CoapServer::new(scx.clone())));
        }
        Self { scx, services, started: Mutex::new(None) }
    }

    /// Appends a service, started after everything added before it.
    pub fn service(mut self, service: Arc<dyn Service>) -> Self {
        self.services.push(service);
        self
    }

    #[inline]
    pub fn context(&self) -> &GatewayContext {
        &self.scx
    }

    /// Opens the `updated` stream and starts every service.
    ///
    /// If a service fails to start, the ones already started are stopped again in reverse order
    /// and the error is returned.
    pub async fn start(&self) -> Result<()> {
        let mut started = self.started.lock().await;
        if started.is_some() {
            return Err(anyhow!("gateway is already started"));
        }

        self.scx.events.open();
        for (i, s) in self.services.iter().enumerate() {
            if let Err(e) = s.start().await {
                log::error!("start {} error, {:?}", s.name(), e);
                self.stop_services(i).await;
                self.scx.events.close();
                return Err(e);
            }
            log::debug!("{} started", s.name());
        }
        started.replace(self.services.len());
        let names = self.services.iter().map(|s| s.name()).collect::<Vec<_>>();
        log::info!("gateway started, services: {:?}", names);
        Ok(())
    }

    /// Stops every service in reverse start order, then closes the `updated` stream.
    ///
    /// A service failing to stop is logged, the remaining services are still stopped.
    pub async fn stop(&self) -> Result<()> {
        let mut started = self.started.lock().await;
        if let Some(n) = started.take() {
            self.stop_services(n).await;
            self.scx.events.close();
            log::info!("gateway stopped");
        }
        Ok(())
    }

    async fn stop_services(&self, n: usize) {
        for s in self.services[..n].iter().rev() {
            if let Err(e) = s.stop().await {
                log::warn!("stop {} error, {:?}", s.name(), e);
            } else {
                log::debug!("{} stopped", s.name());
            }
        }
    }

    /// Subscribes to the `updated` stream, available while the gateway is started.
    #[inline]
    pub fn updates(&self) -> Result<UpdateReceiver> {
        self.scx.events.subscribe()
    }

    /// Bound address of the service called `name`.
    pub fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        self.services.iter().find(|s| s.name() == name).and_then(|s| s.local_addr())
    }
}
