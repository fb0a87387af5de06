//! Transport to an individual cache node.
//!
//! Once routing has chosen a node, the node itself is just an opaque keyed
//! store: the core only ever pings it, resets it on (re)provisioning, and
//! reads/writes values through it. [`Connector`] and [`NodeLink`] are that
//! seam; the coordinator and clients are generic over them.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use volatile_hashring::NodeConfig;

use crate::Error;

/// A live handle to one cache node. Handles are cheap clones of a shared
/// underlying connection; dropping the last clone closes it.
#[async_trait]
pub trait NodeLink: Send + Sync + Clone + 'static {
    async fn ping(&mut self) -> Result<(), Error>;
    /// Clear the node's entire stored dataset (idempotent provisioning step).
    async fn reset(&mut self) -> Result<(), Error>;
    async fn read(&mut self, key: &str) -> Result<Option<String>, Error>;
    async fn write(&mut self, key: &str, value: &str) -> Result<(), Error>;
}

/// Opens links to cache nodes from their carried connection config.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Link: NodeLink;

    async fn connect(&self, config: &NodeConfig) -> Result<Self::Link, Error>;
}

/// Connects to cache nodes that are Redis instances.
#[derive(Debug, Clone, Default)]
pub struct RedisConnector;

#[async_trait]
impl Connector for RedisConnector {
    type Link = RedisLink;

    async fn connect(&self, config: &NodeConfig) -> Result<Self::Link, Error> {
        let url = format!("redis://{}:{}/", config.host, config.port);
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(RedisLink { conn })
    }
}

#[derive(Clone)]
pub struct RedisLink {
    conn: redis::aio::MultiplexedConnection,
}

#[async_trait]
impl NodeLink for RedisLink {
    async fn ping(&mut self) -> Result<(), Error> {
        redis::cmd("PING").query_async::<String>(&mut self.conn).await?;
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), Error> {
        redis::cmd("FLUSHDB").query_async::<()>(&mut self.conn).await?;
        Ok(())
    }

    async fn read(&mut self, key: &str) -> Result<Option<String>, Error> {
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn)
            .await?;
        Ok(value)
    }

    async fn write(&mut self, key: &str, value: &str) -> Result<(), Error> {
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<()>(&mut self.conn)
            .await?;
        Ok(())
    }
}

/// In-process fake nodes for hermetic tests and simulations.
///
/// Nodes are registered up front, keyed by `host:port`; each one has a
/// health toggle (failing pings simulate a dead node) and its own keyspace.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    nodes: Arc<Mutex<HashMap<String, MemoryNode>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fake node and return its control handle.
    pub fn register(&self, config: &NodeConfig) -> MemoryNode {
        let node = MemoryNode::new();
        self.nodes
            .lock()
            .expect("node lock poisoned")
            .insert(config.derived_name(), node.clone());
        node
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Link = MemoryLink;

    async fn connect(&self, config: &NodeConfig) -> Result<Self::Link, Error> {
        let name = config.derived_name();
        let node = self
            .nodes
            .lock()
            .expect("node lock poisoned")
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::Connection(format!("no such node: {name}")))?;
        Ok(MemoryLink { node })
    }
}

/// Control handle for one fake node.
#[derive(Clone)]
pub struct MemoryNode {
    healthy: Arc<AtomicBool>,
    data: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryNode {
    fn new() -> Self {
        Self {
            healthy: Arc::new(AtomicBool::new(true)),
            data: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn key_count(&self) -> usize {
        self.data.lock().expect("data lock poisoned").len()
    }
}

#[derive(Clone)]
pub struct MemoryLink {
    node: MemoryNode,
}

#[async_trait]
impl NodeLink for MemoryLink {
    async fn ping(&mut self) -> Result<(), Error> {
        if self.node.is_healthy() {
            Ok(())
        } else {
            Err(Error::Connection("node unhealthy".to_string()))
        }
    }

    async fn reset(&mut self) -> Result<(), Error> {
        self.node.data.lock().expect("data lock poisoned").clear();
        Ok(())
    }

    async fn read(&mut self, key: &str) -> Result<Option<String>, Error> {
        if !self.node.is_healthy() {
            return Err(Error::Connection("node unhealthy".to_string()));
        }
        Ok(self
            .node
            .data
            .lock()
            .expect("data lock poisoned")
            .get(key)
            .cloned())
    }

    async fn write(&mut self, key: &str, value: &str) -> Result<(), Error> {
        if !self.node.is_healthy() {
            return Err(Error::Connection("node unhealthy".to_string()));
        }
        self.node
            .data
            .lock()
            .expect("data lock poisoned")
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
