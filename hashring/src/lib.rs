//! Weighted consistent-hash ring over named cache nodes.
//!
//! This crate is the pure routing core: it maps keys onto a sorted list of
//! virtual buckets owned by weighted nodes, keeps routing stable while nodes
//! flap, and prunes long-dead nodes. It does no I/O; membership arrives from
//! the outside (see the `volatile-cluster` crate) as plain
//! `add_node`/`remove_node` calls.
//!
//! Bucket placement is seeded from the node name alone, so independent
//! processes that learn the same name/weight pair build byte-identical rings
//! without ever exchanging bucket positions.
//!
//! # Example
//!
//! ```rust
//! use volatile_hashring::{HashRing, LookupOptions, RingOptions};
//!
//! let mut ring = HashRing::new(RingOptions::default());
//! ring.add_node("10.0.0.1:6379", 1.0, None, None).unwrap();
//! ring.add_node("10.0.0.2:6379", 2.0, None, None).unwrap();
//!
//! let node = ring.hash_to_node("some-key", &LookupOptions::default()).unwrap();
//! assert!(node.up);
//! ```

mod node;
mod options;
mod ring;

pub use node::{Node, NodeConfig, NodeData, NodeMap, RoutedNode};
pub use options::{LookupOptions, RingOptions};
pub use ring::{HashRing, RingError, RouteKey};
