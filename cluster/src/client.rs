//! Client for processes using the cluster: keeps a private ring in sync
//! with membership broadcasts, hashes keys on request, and manages a pool
//! of connections to up nodes.
//!
//! Initialization is strictly ordered: subscribe to the broadcast channel,
//! and only after the subscription is acknowledged fetch the snapshot and
//! build the first ring. A broadcast that lands between the two steps waits
//! in the subscription buffer and is applied after the snapshot — because
//! broadcasts are full-replace, the newest state always wins and no update
//! is lost. Lookups made before the first ring exists suspend until it does.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use volatile_hashring::{HashRing, LookupOptions, NodeConfig, NodeMap, RoutedNode, RouteKey};

use crate::config::ClientOptions;
use crate::messages::{decode_entry, BusMessage};
use crate::store::{MembershipStore, StoreSubscription};
use crate::transport::Connector;
use crate::Error;

/// Out-of-band client events.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A fresh node map was applied to the local ring.
    MembershipUpdated { nodes: usize },
    /// Store or bus trouble; the client keeps routing with its last-known
    /// ring until the store recovers.
    StoreError(String),
    /// Opening a connection to a resolved node failed.
    LinkError { node: String, message: String },
}

struct ClientShared<C: Connector> {
    ring: Mutex<HashRing>,
    pool: Mutex<HashMap<String, C::Link>>,
    connector: C,
}

/// Handle to a running cluster client.
pub struct ClusterClient<C: Connector> {
    shared: Arc<ClientShared<C>>,
    cancel_token: CancellationToken,
    task_handle: Option<JoinHandle<()>>,
    ready_rx: watch::Receiver<bool>,
    event_tx: broadcast::Sender<ClientEvent>,
}

impl<C: Connector> ClusterClient<C> {
    /// Subscribe to membership broadcasts and start the update task.
    ///
    /// Returns once the subscription is acknowledged; the snapshot fetch and
    /// first ring build happen in the background. Lookups block until they
    /// complete.
    ///
    /// # Errors
    ///
    /// Returns an error if the broadcast subscription cannot be established.
    pub async fn connect<S>(store: S, connector: C, options: ClientOptions) -> Result<Self, Error>
    where
        S: MembershipStore,
    {
        let subscription = store.subscribe(&options.broadcast_channel).await?;

        let shared = Arc::new(ClientShared {
            ring: Mutex::new(HashRing::new(options.ring.clone())),
            pool: Mutex::new(HashMap::new()),
            connector,
        });
        let cancel_token = CancellationToken::new();
        let (ready_tx, ready_rx) = watch::channel(false);
        let (event_tx, _) = broadcast::channel(16);

        let task_handle = tokio::spawn(run(
            store,
            subscription,
            shared.clone(),
            options,
            ready_tx,
            event_tx.clone(),
            cancel_token.clone(),
        ));

        Ok(Self {
            shared,
            cancel_token,
            task_handle: Some(task_handle),
            ready_rx,
            event_tx,
        })
    }

    /// Route a key to its node. Suspends until the client is initialized;
    /// `None` means no usable node exists.
    pub async fn resolve_node<'a>(
        &self,
        key: impl Into<RouteKey<'a>>,
        options: &LookupOptions,
    ) -> Option<RoutedNode> {
        self.wait_ready().await;
        let mut ring = self.shared.ring.lock().await;
        ring.hash_to_node(key, options)
    }

    /// Route a key and return the node's connection config.
    ///
    /// On top of the ring's own grace-window routing this suppresses any
    /// resolved node that is not up, and any node whose last state change is
    /// more recent than the per-call `down_node_expiry`. The second check
    /// also damps nodes that only just came back up; both layers are kept
    /// deliberately, so callers should understand they stack.
    pub async fn resolve_config<'a>(
        &self,
        key: impl Into<RouteKey<'a>>,
        options: &LookupOptions,
    ) -> Option<(NodeConfig, RoutedNode)> {
        let node = self.resolve_node(key, options).await?;
        if !node.up {
            return None;
        }
        let expiry_ms = options.down_node_expiry.as_millis() as u64;
        if expiry_ms > 0 && node.time_since_last_change < expiry_ms {
            return None;
        }
        let config = node.data.as_ref().map(|data| data.config.clone())?;
        Some((config, node))
    }

    /// Route a key and return a pooled connection to its node, opening one
    /// if needed. Connection failures surface as [`ClientEvent::LinkError`]
    /// rather than failing the call.
    pub async fn get_connection<'a>(
        &self,
        key: impl Into<RouteKey<'a>>,
        options: &LookupOptions,
    ) -> Option<C::Link> {
        let (config, node) = self.resolve_config(key, options).await?;

        let mut pool = self.shared.pool.lock().await;
        if let Some(link) = pool.get(&node.name) {
            return Some(link.clone());
        }
        match self.shared.connector.connect(&config).await {
            Ok(link) => {
                pool.insert(node.name.clone(), link.clone());
                Some(link)
            }
            Err(err) => {
                tracing::error!(node = %node.name, "opening node connection failed: {err}");
                let _ = self.event_tx.send(ClientEvent::LinkError {
                    node: node.name.clone(),
                    message: err.to_string(),
                });
                None
            }
        }
    }

    /// Subscribe to out-of-band client events.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.event_tx.subscribe()
    }

    /// Nodes currently known to the local ring (up or in grace).
    pub async fn node_count(&self) -> usize {
        self.shared.ring.lock().await.len()
    }

    /// Nodes currently up in the local ring.
    pub async fn up_count(&self) -> usize {
        self.shared.ring.lock().await.up_count()
    }

    /// Connections currently pooled.
    pub async fn pooled_connections(&self) -> usize {
        self.shared.pool.lock().await.len()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    pub async fn shutdown(mut self) {
        self.cancel_token.cancel();
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
    }

    async fn wait_ready(&self) {
        let mut ready = self.ready_rx.clone();
        let _ = ready.wait_for(|initialized| *initialized).await;
    }
}

async fn run<S, C>(
    store: S,
    mut subscription: S::Subscription,
    shared: Arc<ClientShared<C>>,
    options: ClientOptions,
    ready_tx: watch::Sender<bool>,
    event_tx: broadcast::Sender<ClientEvent>,
    cancel_token: CancellationToken,
) where
    S: MembershipStore,
    C: Connector,
{
    match store.get_all(&options.node_set_key).await {
        Ok(snapshot) => {
            let mut node_map = NodeMap::new();
            for (name, raw) in snapshot {
                match decode_entry(&name, &raw) {
                    Ok(node) => {
                        node_map.insert(name, node);
                    }
                    Err(err) => {
                        tracing::warn!(node = %name, "skipping unreadable node entry: {err}");
                    }
                }
            }
            let nodes = apply_node_map(&shared, node_map).await;
            let _ = ready_tx.send(true);
            tracing::debug!(nodes, "cluster client initialized");
        }
        Err(err) => {
            // Stay uninitialized; the next broadcast supplies a full map.
            tracing::error!("initial node map fetch failed: {err}");
            let _ = event_tx.send(ClientEvent::StoreError(err.to_string()));
        }
    }

    loop {
        let message = tokio::select! {
            _ = cancel_token.cancelled() => break,
            message = subscription.next_message() => message,
        };

        match message {
            Ok(Some(payload)) => match BusMessage::decode(&payload) {
                Ok(BusMessage::UpdateNodes { node_map }) => {
                    let nodes = apply_node_map(&shared, node_map).await;
                    let _ = ready_tx.send(true);
                    let _ = event_tx.send(ClientEvent::MembershipUpdated { nodes });
                }
                Err(err) => {
                    tracing::error!("discarding broadcast: {err}");
                    let _ = event_tx.send(ClientEvent::StoreError(err.to_string()));
                }
            },
            Ok(None) => {
                tracing::error!("broadcast subscription ended");
                let _ = event_tx.send(ClientEvent::StoreError(
                    "broadcast subscription ended".to_string(),
                ));
                break;
            }
            Err(err) => {
                tracing::error!("broadcast subscription error: {err}");
                let _ = event_tx.send(ClientEvent::StoreError(err.to_string()));
            }
        }
    }
}

/// Full-replace rebuild: clear the ring, re-add every node from the map,
/// then evict pooled connections for nodes no longer present and up.
async fn apply_node_map<C: Connector>(shared: &ClientShared<C>, node_map: NodeMap) -> usize {
    let mut ring = shared.ring.lock().await;
    ring.clear();
    for (name, entry) in node_map {
        let result = if entry.up {
            ring.add_node(&name, entry.weight, Some(entry.state_change_time), entry.data)
        } else {
            ring.add_down_node(&name, entry.weight, Some(entry.state_change_time), entry.data)
        };
        if let Err(err) = result {
            tracing::warn!(node = %name, "skipping node in broadcast: {err}");
        }
    }
    let nodes = ring.len();

    let mut pool = shared.pool.lock().await;
    pool.retain(|name, _| ring.is_up(name));
    nodes
}
