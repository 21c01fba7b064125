use std::{fs::read_to_string, net::SocketAddr, str::FromStr};

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Signaling {
    /// signaling server listen address
    ///
    /// The address and port to which the WebSocket server is bound. The
    /// bound address supports ipv4 and ipv6.
    #[serde(default = "Signaling::listen")]
    pub listen: SocketAddr,

    /// server permanent secret keys
    ///
    /// Base64 encoded 32 byte NaCl secret keys. Clients may select any of
    /// the advertised keys during the handshake, the first entry is the
    /// primary one. When the list is empty an ephemeral key is generated at
    /// startup.
    #[serde(default)]
    pub keys: Vec<String>,

    /// handshake timeout
    ///
    /// Number of seconds a client is given to complete the handshake before
    /// the connection is closed again.
    #[serde(default = "Signaling::handshake_timeout")]
    pub handshake_timeout: u64,

    /// keep alive interval
    ///
    /// Number of seconds between WebSocket pings towards a client. Clients
    /// can request a shorter interval during the handshake, but never less
    /// than one second.
    #[serde(default = "Signaling::ping_interval")]
    pub ping_interval: u64,

    /// keep alive timeout
    ///
    /// Number of seconds a client's pong may take before the connection is
    /// considered dead and dropped.
    #[serde(default = "Signaling::ping_timeout")]
    pub ping_timeout: u64,
}

impl Signaling {
    fn listen() -> SocketAddr {
        "127.0.0.1:8765".parse().unwrap()
    }

    fn handshake_timeout() -> u64 {
        30
    }

    fn ping_interval() -> u64 {
        3600
    }

    fn ping_timeout() -> u64 {
        30
    }
}

impl Default for Signaling {
    fn default() -> Self {
        Self {
            listen: Self::listen(),
            keys: Default::default(),
            handshake_timeout: Self::handshake_timeout(),
            ping_interval: Self::ping_interval(),
            ping_timeout: Self::ping_timeout(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub signaling: Signaling,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// Specify the configuration file path
    ///
    /// Example: salty-server --config /etc/salty-server/config.json5
    #[arg(long, short)]
    config: Option<String>,
}

impl Config {
    /// Load configure from config file and command line parameters.
    ///
    /// Load command line parameters, if the configuration file path is
    /// specified, the configuration is read from the configuration file,
    /// otherwise the default configuration is used.
    pub fn load() -> Result<Self> {
        Ok(match Cli::parse().config {
            Some(path) => serde_json5::from_str(&read_to_string(&path)?)?,
            None => Self::default(),
        })
    }
}
