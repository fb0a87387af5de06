//! Wire messages and store layout shared by every process in the cluster.
//!
//! Broadcasts always carry the entire node map, never a delta: one received
//! message is a complete, self-consistent membership view, so subscribers
//! never have to merge or order partial updates.

use serde::{Deserialize, Serialize};
use volatile_hashring::{Node, NodeConfig, NodeMap};

use crate::Error;

/// Hash in the store holding one serialized entry per node name.
pub const NODE_SET_KEY: &str = "rvolcluster:nodeset";
/// Channel carrying full-map membership broadcasts to clients.
pub const BROADCAST_CHANNEL: &str = "RedisVolatileClusterBus";
/// Channel carrying node-agent heartbeats to the coordinator.
pub const HEARTBEAT_CHANNEL: &str = "RedisVolatileClusterSlaveBus";

/// Message on the membership broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BusMessage {
    #[serde(rename = "update_nodes")]
    UpdateNodes {
        #[serde(rename = "nodeMap")]
        node_map: NodeMap,
    },
}

/// Message on the heartbeat channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HeartbeatMessage {
    #[serde(rename = "node_up")]
    NodeUp { node: HeartbeatNode },
}

/// Liveness announcement payload: the announcing node's connection config
/// and capacity weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatNode {
    pub config: NodeConfig,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl BusMessage {
    pub fn decode(payload: &str) -> Result<Self, Error> {
        serde_json::from_str(payload).map_err(|err| Error::UnknownMessage(err.to_string()))
    }

    pub fn encode(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|err| Error::Config(err.to_string()))
    }
}

impl HeartbeatMessage {
    pub fn decode(payload: &str) -> Result<Self, Error> {
        serde_json::from_str(payload).map_err(|err| Error::UnknownMessage(err.to_string()))
    }

    pub fn encode(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|err| Error::Config(err.to_string()))
    }
}

/// Serialize one node entry for the store.
pub fn encode_entry(node: &Node) -> Result<String, Error> {
    serde_json::to_string(node).map_err(|err| Error::Config(err.to_string()))
}

/// Parse one node entry fetched from the store. The field key is
/// authoritative for the name, whatever the stored blob says.
pub fn decode_entry(name: &str, raw: &str) -> Result<Node, Error> {
    let mut node: Node =
        serde_json::from_str(raw).map_err(|err| Error::Config(format!("invalid node entry: {err}")))?;
    node.name = name.to_string();
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use volatile_hashring::NodeData;

    #[test]
    fn test_broadcast_wire_shape() {
        let mut node_map = NodeMap::new();
        node_map.insert(
            "a:1".into(),
            Node {
                up: true,
                state_change_time: 42,
                weight: 1.0,
                name: "a:1".into(),
                data: Some(NodeData::new(NodeConfig::new("a", 1))),
            },
        );
        let payload = BusMessage::UpdateNodes { node_map }.encode().unwrap();
        let json: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(json["type"], "update_nodes");
        assert_eq!(json["nodeMap"]["a:1"]["stateChangeTime"], 42);

        let decoded = BusMessage::decode(&payload).unwrap();
        let BusMessage::UpdateNodes { node_map } = decoded;
        assert!(node_map["a:1"].up);
    }

    #[test]
    fn test_heartbeat_wire_shape() {
        let message = HeartbeatMessage::NodeUp {
            node: HeartbeatNode {
                config: NodeConfig::new("10.0.0.9", 6380),
                weight: 2.5,
            },
        };
        let payload = message.encode().unwrap();
        let json: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(json["type"], "node_up");
        assert_eq!(json["node"]["config"]["host"], "10.0.0.9");
        assert_eq!(json["node"]["config"]["port"], 6380);
        assert_eq!(json["node"]["weight"], 2.5);
    }

    #[test]
    fn test_heartbeat_weight_defaults_to_one() {
        let raw = r#"{"type":"node_up","node":{"config":{"host":"h","port":1}}}"#;
        let HeartbeatMessage::NodeUp { node } = HeartbeatMessage::decode(raw).unwrap();
        assert_eq!(node.weight, 1.0);
    }

    #[test]
    fn test_unknown_message_type_is_rejected() {
        let raw = r#"{"type":"definitely_not_a_thing","nodeMap":{}}"#;
        assert!(matches!(
            BusMessage::decode(raw),
            Err(Error::UnknownMessage(_))
        ));
        assert!(matches!(
            HeartbeatMessage::decode(raw),
            Err(Error::UnknownMessage(_))
        ));
    }

    #[test]
    fn test_entry_name_comes_from_field_key() {
        let raw = r#"{"up":false,"stateChangeTime":7,"weight":1.5,"name":"stale-name"}"#;
        let node = decode_entry("real:1", raw).unwrap();
        assert_eq!(node.name, "real:1");
        assert!(!node.up);
        assert_eq!(node.state_change_time, 7);
    }
}
