//! Redis-backed volatile cache-cluster membership with weighted consistent
//! hashing.
//!
//! This crate provides:
//! - A [`Coordinator`] — the sole writer of the authoritative node map: it
//!   pings known nodes, consumes agent heartbeats, applies the
//!   up/down/purge state machine, and broadcasts the full map after every
//!   change.
//! - A [`NodeAgent`] — runs next to each cache node and announces liveness
//!   on the heartbeat channel.
//! - A [`ClusterClient`] — mirrors membership broadcasts into a private
//!   [`volatile_hashring::HashRing`], resolves keys to nodes, and pools
//!   connections to up nodes.
//! - The [`MembershipStore`](store::MembershipStore) and
//!   [`Connector`](transport::Connector) seams with Redis and in-memory
//!   implementations.
//!
//! Consistency across processes is eventual and carried entirely by
//! full-map broadcasts: no locks, no consensus, a single pre-designated
//! coordinator.
//!
//! # Example
//!
//! ```rust,ignore
//! use volatile_cluster::{ClientOptions, ClusterClient, RedisConnector, RedisStore};
//! use volatile_hashring::LookupOptions;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), volatile_cluster::Error> {
//!     let store = RedisStore::connect("redis://127.0.0.1:6379").await?;
//!     let client =
//!         ClusterClient::connect(store, RedisConnector, ClientOptions::default()).await?;
//!
//!     if let Some(mut link) = client.get_connection("some-key", &LookupOptions::default()).await {
//!         link.write("some-key", "value").await?;
//!     }
//!     Ok(())
//! }
//! ```

mod agent;
mod client;
mod config;
mod coordinator;
mod error;
pub mod messages;
pub mod store;
pub mod transport;

pub use agent::NodeAgent;
pub use client::{ClientEvent, ClusterClient};
pub use config::{AgentConfig, ClientOptions, CoordinatorConfig};
pub use coordinator::{Coordinator, CoordinatorEvent};
pub use error::Error;
pub use store::{
    MembershipStore, MemorySubscription, MemoryStore, RedisStore, RedisSubscription,
    StoreSubscription,
};
pub use transport::{
    Connector, MemoryConnector, MemoryLink, MemoryNode, NodeLink, RedisConnector, RedisLink,
};
