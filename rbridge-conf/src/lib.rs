#![deny(unsafe_code)]

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use config::{Config, File};
use once_cell::sync::OnceCell;
use serde::Deserialize;

use rbridge_utils::{deserialize_duration, Bytesize};

pub use self::listener::{Coap, Http, Mqtt};
pub use self::logging::Log;
pub use self::options::Options;

pub mod listener;
pub mod logging;
pub mod options;

pub type Result<T, E = anyhow::Error> = anyhow::Result<T, E>;

static SETTINGS: OnceCell<Settings> = OnceCell::new();

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub retain: Retain,
    #[serde(default)]
    pub events: Events,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub coap: Coap,
    #[serde(default)]
    pub http: Http,
    #[serde(default)]
    pub mqtt: Mqtt,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self(Arc::new(Inner::default()))
    }
}

impl From<Inner> for Settings {
    fn from(inner: Inner) -> Self {
        Self(Arc::new(inner))
    }
}

impl Settings {
    pub fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/rbridge/rbridge").required(false))
            .add_source(File::with_name("rbridge").required(false))
            .add_source(
                config::Environment::with_prefix("rbridge")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(true));
        }

        let mut inner: Inner = builder.build()?.try_deserialize()?;

        //Command line configuration overriding file configuration
        listener::override_addr(&mut inner.coap.laddr, opts.coap_host.or(opts.host), opts.coap_port);
        listener::override_addr(&mut inner.http.laddr, opts.http_host.or(opts.host), opts.http_port);
        listener::override_addr(&mut inner.mqtt.laddr, opts.mqtt_host.or(opts.host), opts.mqtt_port);
        if opts.very_verbose {
            inner.log.level = logging::Level::new(slog::Level::Debug);
        } else if opts.verbose {
            inner.log.level = logging::Level::new(slog::Level::Info);
        }

        inner.opts = opts;
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn init(opts: Options) -> Result<&'static Self> {
        SETTINGS.set(Settings::new(opts)?).map_err(|_| anyhow!("Settings init failed"))?;
        SETTINGS.get().ok_or_else(|| anyhow!("Settings init failed"))
    }

    #[inline]
    pub fn logs(&self) {
        log::debug!("Config info is {:?}", self.0);
        log::info!("coap listener is {:?}, enable: {}", self.coap.laddr, self.coap.enable);
        log::info!("http listener is {:?}, enable: {}", self.http.laddr, self.http.enable);
        log::info!("mqtt listener is {:?}, enable: {}", self.mqtt.laddr, self.mqtt.enable);
        log::info!("retain config is: {:?}", self.retain);
        if self.auth.enable {
            log::info!("auth rules: {}", self.auth.rules.len());
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Retain {
    //The maximum number of retained records, 0 means no limit.
    #[serde(default)]
    pub max_retained_messages: isize,
    //The maximum size of a retained payload.
    #[serde(default = "Retain::max_payload_size_default")]
    pub max_payload_size: Bytesize,
    //How long a record is kept after its last write, 0 means forever.
    #[serde(default = "Retain::expiry_interval_default", deserialize_with = "deserialize_duration")]
    pub expiry_interval: Duration,
}

impl Default for Retain {
    #[inline]
    fn default() -> Self {
        Self {
            max_retained_messages: 0,
            max_payload_size: Self::max_payload_size_default(),
            expiry_interval: Self::expiry_interval_default(),
        }
    }
}

impl Retain {
    fn max_payload_size_default() -> Bytesize {
        Bytesize::from("1M")
    }
    fn expiry_interval_default() -> Duration {
        Duration::ZERO
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Events {
    //Buffered update events per listener before a slow listener starts lagging.
    #[serde(default = "Events::capacity_default")]
    pub capacity: usize,
}

impl Default for Events {
    #[inline]
    fn default() -> Self {
        Self { capacity: Self::capacity_default() }
    }
}

impl Events {
    fn capacity_default() -> usize {
        1024
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Auth {
    //When disabled every request is authenticated and authorized.
    #[serde(default)]
    pub enable: bool,
    //Decision when no rule matches, "allow" or "deny".
    #[serde(default = "Auth::no_match_default")]
    pub no_match: String,
    //["allow" | "deny", user, "connect" | "read" | "write" | "all", [topic filters]]
    #[serde(default)]
    pub rules: Vec<serde_json::Value>,
}

impl Default for Auth {
    #[inline]
    fn default() -> Self {
        Self { enable: false, no_match: Self::no_match_default(), rules: Vec::new() }
    }
}

impl Auth {
    fn no_match_default() -> String {
        "allow".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_files() {
        let settings = Settings::new(Options::default()).expect("Settings creation failed");
        assert_eq!(settings.coap.laddr.port(), 5683);
        assert_eq!(settings.http.laddr.port(), 3000);
        assert_eq!(settings.mqtt.laddr.port(), 1883);
        assert_eq!(settings.retain.max_retained_messages, 0);
        assert_eq!(settings.events.capacity, 1024);
        assert!(!settings.auth.enable);
    }

    #[test]
    fn options_override_listeners() {
        let opts = Options {
            host: Some("127.0.0.1".parse().unwrap()),
            http_host: Some("127.0.0.2".parse().unwrap()),
            http_port: Some(3042),
            coap_port: Some(3043),
            very_verbose: true,
            ..Default::default()
        };
        let settings = Settings::new(opts).expect("Settings creation failed");
        assert_eq!(settings.http.laddr, "127.0.0.2:3042".parse().unwrap());
        assert_eq!(settings.coap.laddr, "127.0.0.1:3043".parse().unwrap());
        assert_eq!(settings.mqtt.laddr, "127.0.0.1:1883".parse().unwrap());
        assert_eq!(settings.log.level.inner(), slog::Level::Debug);
    }

    #[test]
    fn config_file() {
        let path = std::env::temp_dir().join(format!("rbridge-conf-test-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            r#"
[http]
root = "res"
serve_static = true

[retain]
max_retained_messages = 10
max_payload_size = "2K"
expiry_interval = "1h"

[auth]
enable = true
no_match = "deny"
rules = [["allow", "all", "read", ["public/#"]]]
"#,
        )
        .unwrap();

        let opts = Options { cfg_name: Some(path.to_string_lossy().to_string()), ..Default::default() };
        let settings = Settings::new(opts);
        let _ = std::fs::remove_file(&path);
        let settings = settings.expect("Settings creation failed");

        assert_eq!(settings.http.root, "res");
        assert!(settings.http.serve_static);
        assert_eq!(settings.retain.max_retained_messages, 10);
        assert_eq!(settings.retain.max_payload_size.as_usize(), 2048);
        assert_eq!(settings.retain.expiry_interval, Duration::from_secs(3600));
        assert!(settings.auth.enable);
        assert_eq!(settings.auth.no_match, "deny");
        assert_eq!(settings.auth.rules.len(), 1);
    }

    #[test]
    fn missing_config_file_fails() {
        let opts =
            Options { cfg_name: Some("/nonexistent/rbridge-missing.toml".into()), ..Default::default() };
        assert!(Settings::new(opts).is_err());
    }
}
