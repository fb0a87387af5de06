use std::env;
use std::time::Duration;

use volatile_hashring::{NodeConfig, RingOptions};

use crate::messages::{BROADCAST_CHANNEL, HEARTBEAT_CHANNEL, NODE_SET_KEY};
use crate::Error;

/// Coordinator timing windows and store layout.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub node_set_key: String,
    pub broadcast_channel: String,
    pub heartbeat_channel: String,
    /// Period of the active health sweep.
    pub ping_interval: Duration,
    /// How long a probe may run before the node counts as unresponsive.
    pub ping_timeout: Duration,
    /// An up node with no heartbeat for this long is marked down even if it
    /// still answers pings.
    pub heartbeat_timeout: Duration,
    /// Continuous downtime after which a node is purged from membership.
    pub retention: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_set_key: NODE_SET_KEY.to_string(),
            broadcast_channel: BROADCAST_CHANNEL.to_string(),
            heartbeat_channel: HEARTBEAT_CHANNEL.to_string(),
            ping_interval: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(3),
            heartbeat_timeout: Duration::from_secs(45),
            retention: Duration::from_secs(20 * 60),
        }
    }
}

impl CoordinatorConfig {
    /// Defaults with optional window overrides from the environment
    /// (`PING_INTERVAL_SECS`, `PING_TIMEOUT_SECS`, `HEARTBEAT_TIMEOUT_SECS`,
    /// `RETENTION_SECS`).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(secs) = env_secs("PING_INTERVAL_SECS") {
            config.ping_interval = secs;
        }
        if let Some(secs) = env_secs("PING_TIMEOUT_SECS") {
            config.ping_timeout = secs;
        }
        if let Some(secs) = env_secs("HEARTBEAT_TIMEOUT_SECS") {
            config.heartbeat_timeout = secs;
        }
        if let Some(secs) = env_secs("RETENTION_SECS") {
            config.retention = secs;
        }
        config
    }
}

/// Node-agent identity and cadence.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub heartbeat_channel: String,
    pub heartbeat_interval: Duration,
    /// Connection config of the local cache node, announced verbatim.
    pub node: NodeConfig,
    pub weight: f64,
}

impl AgentConfig {
    pub fn new(node: NodeConfig, weight: f64) -> Self {
        Self {
            heartbeat_channel: HEARTBEAT_CHANNEL.to_string(),
            heartbeat_interval: Duration::from_secs(5),
            node,
            weight,
        }
    }

    /// Build from `NODE_HOST`, `NODE_PORT`, `NODE_WEIGHT` and
    /// `HEARTBEAT_INTERVAL_SECS`.
    pub fn from_env() -> Result<Self, Error> {
        let host = env::var("NODE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port: u16 = env::var("NODE_PORT")
            .unwrap_or_else(|_| "6379".to_string())
            .parse()
            .map_err(|_| Error::Config("NODE_PORT must be a port number".to_string()))?;
        let weight: f64 = env::var("NODE_WEIGHT")
            .unwrap_or_else(|_| "1.0".to_string())
            .parse()
            .map_err(|_| Error::Config("NODE_WEIGHT must be a number".to_string()))?;

        let mut config = Self::new(NodeConfig::new(host, port), weight);
        if let Some(secs) = env_secs("HEARTBEAT_INTERVAL_SECS") {
            config.heartbeat_interval = secs;
        }
        Ok(config)
    }
}

/// Client-side store layout and ring options.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub node_set_key: String,
    pub broadcast_channel: String,
    pub ring: RingOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            node_set_key: NODE_SET_KEY.to_string(),
            broadcast_channel: BROADCAST_CHANNEL.to_string(),
            ring: RingOptions::default(),
        }
    }
}

impl ClientOptions {
    pub fn with_ring(ring: RingOptions) -> Self {
        Self {
            ring,
            ..Self::default()
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    env::var(name)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_secs)
}
