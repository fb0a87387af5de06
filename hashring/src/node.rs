use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Connection configuration for a cache node, carried opaquely through the
/// membership protocol inside `data.config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    /// Extra transport options (auth, db index, ...) preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl NodeConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            extra: serde_json::Map::new(),
        }
    }

    /// Canonical node name derived from the connection address.
    pub fn derived_name(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Opaque payload attached to a node. The ring carries it but never
/// interprets anything beyond `config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    pub config: NodeConfig,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl NodeData {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            extra: serde_json::Map::new(),
        }
    }
}

/// A node's membership entry as persisted in the store and carried inside
/// `update_nodes` broadcasts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub up: bool,
    /// Epoch milliseconds of the last up/down transition.
    pub state_change_time: u64,
    pub weight: f64,
    /// Defaulted on deserialization: the store's field key is authoritative.
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<NodeData>,
}

/// The authoritative mapping of node name to membership entry.
pub type NodeMap = HashMap<String, Node>;

/// Result of a ring lookup: a snapshot of the routed node plus the derived
/// time since its last state change, computed at lookup time and never
/// persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedNode {
    pub name: String,
    pub up: bool,
    pub weight: f64,
    pub state_change_time: u64,
    pub time_since_last_change: u64,
    pub data: Option<NodeData>,
}
