#![deny(unsafe_code)]

use std::sync::Arc;

use structopt::StructOpt;

use rbridge::conf::{Options, Settings};
use rbridge::context::GatewayContext;
use rbridge::gateway::Gateway;
use rbridge::logger::{config_logger, logger_init};
use rbridge::{log, tokio, UpdateEvent};

#[allow(dead_code)]
mod version {
    include!(concat!(env!("OUT_DIR"), "/version.rs"));
}

#[tokio::main]
async fn main() {
    //init config
    let settings = Settings::init(Options::from_args()).expect("settings init failed");

    //init log
    let logger = config_logger(settings.log.filename(), settings.log.to, settings.log.level.inner());
    logger_init(logger, settings.log.level.inner()).expect("logger init failed");

    log::info!("{} starting", version::VERSION);
    settings.logs();

    let scx = GatewayContext::new(settings.clone())
        .sink(Arc::new(|update: &UpdateEvent| {
            log::info!("updated {:?}, {} bytes, via {}", update.topic, update.payload.len(), update.origin);
        }))
        .build()
        .expect("gateway context init failed");

    let gateway = Gateway::new(scx);
    if let Err(e) = gateway.start().await {
        log::error!("gateway start failed, {:?}", e);
        std::process::exit(1);
    }
    for name in ["coap", "http", "mqtt"] {
        if let Some(laddr) = gateway.local_addr(name) {
            log::info!("{} on {:?}", name, laddr);
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("listen for shutdown signal failed, {:?}", e);
    }
    log::info!("shutting down");
    if let Err(e) = gateway.stop().await {
        log::error!("gateway stop failed, {:?}", e);
    }
}
