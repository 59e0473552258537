#![deny(unsafe_code)] // Enforce memory safety across the entire crate

//! # Overall Example
//! ```rust,no_run
//!
//! use rbridge::conf::Settings;
//! use rbridge::context::GatewayContext;
//! use rbridge::gateway::Gateway;
//! use rbridge::Result;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let scx = GatewayContext::new(Settings::default()).build()?;
//!     let gateway = Gateway::new(scx);
//!
//!     gateway.start().await?;
//!     let mut updates = gateway.updates()?;
//!     tokio::spawn(async move {
//!         while let Ok(update) = updates.recv().await {
//!             println!("updated {} ({} bytes) via {}", update.topic, update.payload.len(), update.origin);
//!         }
//!     });
//!
//!     tokio::signal::ctrl_c().await?;
//!     gateway.stop().await?;
//!     Ok(())
//! }
//! ```

/// Shared State
pub mod broker; // Publish/subscribe routing
pub mod context; // Collaborators shared by every adapter
pub mod retain; // Retained value store

/// Request Pipeline
pub mod acl; // Rule based authenticator
pub mod auth; // Authentication and authorization
pub mod error; // Protocol independent outcomes
pub mod event; // The gateway `updated` stream
pub mod observe; // Live observations
pub mod resource; // Resource read and write

/// Lifecycle
pub mod gateway; // Ordered start/stop of all services
pub mod logger; // log facade to slog

/// Protocol Adapters
#[cfg(feature = "coap")]
pub mod coap;
#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "mqtt")]
pub mod mqtt;
#[cfg(feature = "ws")]
pub mod ws; // MQTT over websocket on the HTTP listener

pub mod topic; // Topic parsing and matching
pub mod types; // Common data types

pub use rbridge_conf as conf;
pub use rbridge_utils as utils;
#[cfg(feature = "mqtt")]
pub use rmqtt_codec as codec;

pub use anyhow;
pub use log;
pub use tokio;

pub use crate::error::GatewayError;
pub use crate::types::{Protocol, UpdateEvent};

pub type Result<T, E = anyhow::Error> = anyhow::Result<T, E>;
