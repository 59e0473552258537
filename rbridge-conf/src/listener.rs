use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::Deserialize;

use rbridge_utils::{deserialize_addr, deserialize_duration, Bytesize};

#[derive(Debug, Clone, Deserialize)]
pub struct Coap {
    #[serde(default = "Coap::enable_default")]
    pub enable: bool,
    #[serde(default = "Coap::laddr_default", deserialize_with = "deserialize_addr")]
    pub laddr: SocketAddr,
    /// First path segment of every resource, `/r/{topic}`
    #[serde(default = "Coap::root_default")]
    pub root: String,
    /// How long a confirmable request is remembered for duplicate detection
    #[serde(default = "Coap::exchange_lifetime_default", deserialize_with = "deserialize_duration")]
    pub exchange_lifetime: Duration,
    #[serde(default = "Coap::max_datagram_size_default")]
    pub max_datagram_size: Bytesize,
    /// An observer gets a confirmable notification at least this often, 0 confirms every one
    #[serde(default = "Coap::confirm_interval_default", deserialize_with = "deserialize_duration")]
    pub confirm_interval: Duration,
    /// Initial wait for the acknowledgement of a confirmable notification, doubled on each retry
    #[serde(default = "Coap::ack_timeout_default", deserialize_with = "deserialize_duration")]
    pub ack_timeout: Duration,
    #[serde(default = "Coap::max_retransmit_default")]
    pub max_retransmit: u32,
}

impl Default for Coap {
    #[inline]
    fn default() -> Self {
        Self {
            enable: Self::enable_default(),
            laddr: Self::laddr_default(),
            root: Self::root_default(),
            exchange_lifetime: Self::exchange_lifetime_default(),
            max_datagram_size: Self::max_datagram_size_default(),
            confirm_interval: Self::confirm_interval_default(),
            ack_timeout: Self::ack_timeout_default(),
            max_retransmit: Self::max_retransmit_default(),
        }
    }
}

impl Coap {
    fn enable_default() -> bool {
        true
    }
    fn laddr_default() -> SocketAddr {
        ([0, 0, 0, 0], 5683).into()
    }
    fn root_default() -> String {
        "r".into()
    }
    fn exchange_lifetime_default() -> Duration {
        Duration::from_secs(247)
    }
    fn max_datagram_size_default() -> Bytesize {
        Bytesize::from(64 * 1024)
    }
    fn confirm_interval_default() -> Duration {
        Duration::from_secs(60)
    }
    fn ack_timeout_default() -> Duration {
        Duration::from_secs(2)
    }
    fn max_retransmit_default() -> u32 {
        4
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Http {
    #[serde(default = "Http::enable_default")]
    pub enable: bool,
    #[serde(default = "Http::laddr_default", deserialize_with = "deserialize_addr")]
    pub laddr: SocketAddr,
    /// First path segment of every resource, `/resources/{topic}`
    #[serde(default = "Http::root_default")]
    pub root: String,
    #[serde(default = "Http::max_body_size_default")]
    pub max_body_size: Bytesize,
    /// Serve files from `public_dirs` for paths outside the resource root
    #[serde(default)]
    pub serve_static: bool,
    #[serde(default = "Http::public_dirs_default")]
    pub public_dirs: Vec<String>,
    #[serde(default)]
    pub static_dot_files: bool,
    /// Accept MQTT over websocket (subprotocol `mqtt`) on this listener
    #[serde(default = "Http::websocket_default")]
    pub websocket: bool,
}

impl Default for Http {
    #[inline]
    fn default() -> Self {
        Self {
            enable: Self::enable_default(),
            laddr: Self::laddr_default(),
            root: Self::root_default(),
            max_body_size: Self::max_body_size_default(),
            serve_static: false,
            public_dirs: Self::public_dirs_default(),
            static_dot_files: false,
            websocket: Self::websocket_default(),
        }
    }
}

impl Http {
    fn enable_default() -> bool {
        true
    }
    fn laddr_default() -> SocketAddr {
        ([0, 0, 0, 0], 3000).into()
    }
    fn root_default() -> String {
        "resources".into()
    }
    fn max_body_size_default() -> Bytesize {
        Bytesize::from("1M")
    }
    fn public_dirs_default() -> Vec<String> {
        vec!["./public".into()]
    }
    fn websocket_default() -> bool {
        true
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Mqtt {
    #[serde(default = "Mqtt::enable_default")]
    pub enable: bool,
    #[serde(default = "Mqtt::laddr_default", deserialize_with = "deserialize_addr")]
    pub laddr: SocketAddr,
    #[serde(default = "Mqtt::max_packet_size_default")]
    pub max_packet_size: Bytesize,
    /// Keep-alive multiplier; a client is dropped after `keep_alive / keepalive_backoff` of silence
    #[serde(default = "Mqtt::keepalive_backoff_default")]
    pub keepalive_backoff: f32,
}

impl Default for Mqtt {
    #[inline]
    fn default() -> Self {
        Self {
            enable: Self::enable_default(),
            laddr: Self::laddr_default(),
            max_packet_size: Self::max_packet_size_default(),
            keepalive_backoff: Self::keepalive_backoff_default(),
        }
    }
}

impl Mqtt {
    fn enable_default() -> bool {
        true
    }
    fn laddr_default() -> SocketAddr {
        ([0, 0, 0, 0], 1883).into()
    }
    fn max_packet_size_default() -> Bytesize {
        Bytesize::from("1M")
    }
    fn keepalive_backoff_default() -> f32 {
        0.75
    }
}

#[inline]
pub(crate) fn override_addr(laddr: &mut SocketAddr, host: Option<IpAddr>, port: Option<u16>) {
    if let Some(host) = host {
        laddr.set_ip(host);
    }
    if let Some(port) = port {
        laddr.set_port(port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let coap = Coap::default();
        assert_eq!(coap.laddr.port(), 5683);
        assert_eq!(coap.root, "r");
        assert_eq!(coap.exchange_lifetime, Duration::from_secs(247));
        assert_eq!(coap.confirm_interval, Duration::from_secs(60));
        assert_eq!(coap.max_retransmit, 4);

        let http = Http::default();
        assert_eq!(http.laddr.port(), 3000);
        assert_eq!(http.root, "resources");
        assert!(!http.serve_static);
        assert!(http.websocket);

        let mqtt = Mqtt::default();
        assert_eq!(mqtt.laddr.port(), 1883);
        assert_eq!(mqtt.max_packet_size.as_usize(), 1024 * 1024);
    }

    #[test]
    fn partial_section() {
        let http: Http =
            serde_json::from_str(r#"{"laddr": "127.0.0.1:8080", "serve_static": true}"#).unwrap();
        assert_eq!(http.laddr, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
        assert!(http.serve_static);
        assert_eq!(http.root, "resources");
    }

    #[test]
    fn addr_override() {
        let mut laddr = Coap::default().laddr;
        override_addr(&mut laddr, Some("127.0.0.1".parse().unwrap()), None);
        assert_eq!(laddr, "127.0.0.1:5683".parse::<SocketAddr>().unwrap());
        override_addr(&mut laddr, None, Some(15683));
        assert_eq!(laddr.port(), 15683);
    }
}
