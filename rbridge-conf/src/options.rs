use std::net::IpAddr;

use structopt::StructOpt;

/// Command line options, applied on top of the configuration files.
#[derive(StructOpt, Debug, Clone, Default)]
#[structopt(name = "rbridged", about = "Bridge CoAP, HTTP and MQTT onto one retained store")]
pub struct Options {
    /// Config file, e.g. ./rbridge.toml
    #[structopt(name = "config", short = "c", long = "config")]
    pub cfg_name: Option<String>,

    /// The mqtt port to listen to
    #[structopt(short = "m", long = "mqtt-port")]
    pub mqtt_port: Option<u16>,

    /// The http port to listen to
    #[structopt(short = "p", long = "http-port")]
    pub http_port: Option<u16>,

    /// The coap port to listen to
    #[structopt(short = "a", long = "coap-port")]
    pub coap_port: Option<u16>,

    /// The host every listener binds to
    #[structopt(long = "host")]
    pub host: Option<IpAddr>,

    #[structopt(long = "coap-host")]
    pub coap_host: Option<IpAddr>,

    #[structopt(long = "mqtt-host")]
    pub mqtt_host: Option<IpAddr>,

    #[structopt(long = "http-host")]
    pub http_host: Option<IpAddr>,

    /// Set the log level to info
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,

    /// Set the log level to debug
    #[structopt(long = "very-verbose")]
    pub very_verbose: bool,
}
