use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use thiserror::Error;

use crate::node::{NodeData, RoutedNode};
use crate::options::{LookupOptions, RingOptions};

const FNV_OFFSET_64: u64 = 0xcbf29ce484222325;
const FNV_PRIME_64: u64 = 0x100000001b3;
const FNV_OFFSET_32: u32 = 0x811c9dc5;
const FNV_PRIME_32: u32 = 0x01000193;

#[derive(Error, Debug)]
pub enum RingError {
    /// A node name is being re-registered with a different weight. Weight is
    /// immutable once a name is known; this signals a topology-definition
    /// bug, not a transient condition.
    #[error("node {name} re-added with weight {requested} (registered as {existing})")]
    WeightConflict {
        name: String,
        existing: f64,
        requested: f64,
    },
}

/// Key being routed: free-form text hashed onto the ring, or an integer
/// shard number indexed directly over the up nodes.
#[derive(Debug, Clone, Copy)]
pub enum RouteKey<'a> {
    Text(&'a str),
    Shard(i64),
}

impl<'a> From<&'a str> for RouteKey<'a> {
    fn from(key: &'a str) -> Self {
        RouteKey::Text(key)
    }
}

impl<'a> From<&'a String> for RouteKey<'a> {
    fn from(key: &'a String) -> Self {
        RouteKey::Text(key)
    }
}

impl From<i64> for RouteKey<'static> {
    fn from(shard: i64) -> Self {
        RouteKey::Shard(shard)
    }
}

#[derive(Debug, Clone)]
struct NodeState {
    up: bool,
    state_change_time: u64,
    weight: f64,
    data: Option<NodeData>,
}

/// One virtual position on the ring, owned by a node.
#[derive(Debug, Clone)]
struct Bucket {
    value: u32,
    name: String,
}

/// Weighted consistent-hash ring.
///
/// A node of weight `w` owns `round(buckets_per_node * w)` buckets (at least
/// one), placed by a pseudo-random sequence seeded from the node name alone.
/// Only name and weight need to travel over the network for every process to
/// reproduce the same layout.
///
/// Down nodes keep their buckets so keys can continue routing to them inside
/// a per-lookup grace window; nodes down past the ring's retention window
/// are deleted by a periodic prune.
#[derive(Debug, Clone)]
pub struct HashRing {
    nodes: HashMap<String, NodeState>,
    /// Sorted ascending by value; ties broken by name so the order is
    /// identical across processes regardless of insertion order.
    buckets: Vec<Bucket>,
    /// Sorted names of currently-up nodes, for shard-number routing.
    node_num_map: Vec<String>,
    buckets_per_node: u32,
    down_node_expiry_ms: u64,
    prune_interval_ms: u64,
    last_prune: u64,
}

impl HashRing {
    pub fn new(options: RingOptions) -> Self {
        Self {
            nodes: HashMap::new(),
            buckets: Vec::new(),
            node_num_map: Vec::new(),
            buckets_per_node: options.buckets_per_node,
            down_node_expiry_ms: options.down_node_expiry.as_millis() as u64,
            prune_interval_ms: options.prune_interval.as_millis() as u64,
            last_prune: now_ms(),
        }
    }

    /// Reset to the empty state: no nodes, no buckets.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.buckets.clear();
        self.node_num_map.clear();
        self.last_prune = now_ms();
    }

    /// Register `name` as up, generating its buckets on first sight.
    ///
    /// Re-adding a known name refreshes its `data` and `state_change_time`
    /// and marks it up again without touching its buckets. Re-adding with a
    /// different weight is a [`RingError::WeightConflict`].
    pub fn add_node(
        &mut self,
        name: &str,
        weight: f64,
        state_change_time: Option<u64>,
        data: Option<NodeData>,
    ) -> Result<(), RingError> {
        let state_change_time = state_change_time.unwrap_or_else(now_ms);

        if let Some(node) = self.nodes.get_mut(name) {
            if node.weight != weight {
                return Err(RingError::WeightConflict {
                    name: name.to_string(),
                    existing: node.weight,
                    requested: weight,
                });
            }
            node.data = data;
            node.state_change_time = state_change_time;
            if !node.up {
                node.up = true;
                self.update_node_num_map();
            }
            return Ok(());
        }

        self.nodes.insert(
            name.to_string(),
            NodeState {
                up: true,
                state_change_time,
                weight,
                data,
            },
        );

        let mut rng = StdRng::seed_from_u64(fnv1a_64(name.as_bytes()));
        let count = ((self.buckets_per_node as f64 * weight).round() as usize).max(1);
        for _ in 0..count {
            self.buckets.push(Bucket {
                value: rng.next_u32(),
                name: name.to_string(),
            });
        }
        self.buckets
            .sort_by(|a, b| a.value.cmp(&b.value).then_with(|| a.name.cmp(&b.name)));

        self.check_prune();
        self.update_node_num_map();
        Ok(())
    }

    /// Mark a known up node down, stamping its state-change time. Its
    /// buckets stay in place so grace-window routing keeps working. No-op
    /// for unknown or already-down nodes.
    pub fn remove_node(&mut self, name: &str, state_change_time: Option<u64>) {
        let Some(node) = self.nodes.get_mut(name) else {
            return;
        };
        if !node.up {
            return;
        }
        node.up = false;
        node.state_change_time = state_change_time.unwrap_or_else(now_ms);
        self.check_prune();
        self.update_node_num_map();
    }

    /// Register a node that is currently down: add, then immediately mark
    /// down with the same state-change time.
    pub fn add_down_node(
        &mut self,
        name: &str,
        weight: f64,
        state_change_time: Option<u64>,
        data: Option<NodeData>,
    ) -> Result<(), RingError> {
        self.add_node(name, weight, state_change_time, data)?;
        self.remove_node(name, state_change_time);
        Ok(())
    }

    /// Route a key to a node, or `None` when no usable node exists.
    ///
    /// Shard-number keys index the sorted list of up node names directly
    /// (`|k mod count|`), bypassing the ring. Text keys are checksummed and
    /// placed by bisection over the bucket list, then walked forward until
    /// an owner is up or down-but-inside the per-lookup grace window.
    pub fn hash_to_node<'a>(
        &mut self,
        key: impl Into<RouteKey<'a>>,
        options: &LookupOptions,
    ) -> Option<RoutedNode> {
        self.check_prune();
        let now = now_ms();

        match key.into() {
            RouteKey::Shard(shard) => {
                if self.node_num_map.is_empty() {
                    return None;
                }
                let index = (shard % self.node_num_map.len() as i64).unsigned_abs() as usize;
                let name = self.node_num_map[index].clone();
                let node = self.nodes.get(&name)?;
                Some(routed(&name, node, now))
            }
            RouteKey::Text(key) => {
                if self.buckets.is_empty() {
                    return None;
                }
                let checksum = fnv1a_32(key.as_bytes());
                let expiry_ms = options.down_node_expiry.as_millis() as u64;
                let len = self.buckets.len();
                let mut start = self.buckets.partition_point(|b| b.value < checksum);
                if start == len {
                    start = 0;
                }
                for step in 0..len {
                    let bucket = &self.buckets[(start + step) % len];
                    let Some(node) = self.nodes.get(&bucket.name) else {
                        continue;
                    };
                    let since = now.saturating_sub(node.state_change_time);
                    if node.up || since < expiry_ms {
                        return Some(routed(&bucket.name, node, now));
                    }
                }
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn up_count(&self) -> usize {
        self.node_num_map.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn is_up(&self, name: &str) -> bool {
        self.nodes.get(name).map(|n| n.up).unwrap_or(false)
    }

    fn update_node_num_map(&mut self) {
        let mut names: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.up)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        self.node_num_map = names;
    }

    fn check_prune(&mut self) {
        if now_ms().saturating_sub(self.last_prune) >= self.prune_interval_ms {
            self.prune();
        }
    }

    fn prune(&mut self) {
        let now = now_ms();
        let expired: HashSet<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| {
                !node.up && now.saturating_sub(node.state_change_time) >= self.down_node_expiry_ms
            })
            .map(|(name, _)| name.clone())
            .collect();
        if !expired.is_empty() {
            self.nodes.retain(|name, _| !expired.contains(name));
            self.buckets.retain(|bucket| !expired.contains(&bucket.name));
        }
        self.last_prune = now;
        self.update_node_num_map();
    }
}

fn routed(name: &str, node: &NodeState, now: u64) -> RoutedNode {
    RoutedNode {
        name: name.to_string(),
        up: node.up,
        weight: node.weight,
        state_change_time: node.state_change_time,
        time_since_last_change: now.saturating_sub(node.state_change_time),
        data: node.data.clone(),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_millis() as u64
}

#[inline]
fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_64;
    for &byte in bytes {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME_64);
    }
    hash
}

#[inline]
fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_32;
    for &byte in bytes {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME_32);
    }
    hash
}
