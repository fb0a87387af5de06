//! The coordinator: sole writer of the authoritative node map.
//!
//! One event-loop task drives everything: the periodic health sweep, the
//! heartbeat subscription, and the purge timers. Every state transition is
//! persisted to the store and then broadcast as the entire current node map,
//! so any subscriber that catches one broadcast has a complete view.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures_util::future::{join_all, poll_fn};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::time::delay_queue::{DelayQueue, Key as PurgeKey};

use volatile_hashring::{Node, NodeData, NodeMap};

use crate::config::CoordinatorConfig;
use crate::messages::{decode_entry, encode_entry, BusMessage, HeartbeatMessage};
use crate::store::{MembershipStore, StoreSubscription};
use crate::transport::{Connector, NodeLink};
use crate::Error;

/// Node state transition applied by the coordinator, for observers.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    NodeUp(String),
    NodeDown(String),
    NodePurged(String),
}

/// Handle to a running coordinator.
pub struct Coordinator {
    cancel_token: CancellationToken,
    task_handle: Option<JoinHandle<()>>,
    event_tx: broadcast::Sender<CoordinatorEvent>,
}

impl Coordinator {
    /// Load the persisted node map, subscribe to heartbeats, broadcast the
    /// current state once, and start the health-sweep loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial load or the heartbeat subscription
    /// fails; after startup, store errors are logged and the loop keeps
    /// running on its in-memory state.
    pub async fn start<S, C>(store: S, connector: C, config: CoordinatorConfig) -> Result<Self, Error>
    where
        S: MembershipStore,
        C: Connector,
    {
        let heartbeats = store.subscribe(&config.heartbeat_channel).await?;

        let mut node_map = NodeMap::new();
        for (name, raw) in store.get_all(&config.node_set_key).await? {
            match decode_entry(&name, &raw) {
                Ok(node) => {
                    node_map.insert(name, node);
                }
                Err(err) => {
                    tracing::warn!(node = %name, "skipping unreadable node entry: {err}");
                }
            }
        }

        let cancel_token = CancellationToken::new();
        let (event_tx, _) = broadcast::channel(16);

        let task = CoordinatorTask {
            store,
            connector,
            config,
            node_map,
            links: HashMap::new(),
            last_heartbeat: HashMap::new(),
            purge_queue: DelayQueue::new(),
            purge_keys: HashMap::new(),
            event_tx: event_tx.clone(),
            cancel_token: cancel_token.clone(),
        };
        let task_handle = tokio::spawn(task.run(heartbeats));

        Ok(Self {
            cancel_token,
            task_handle: Some(task_handle),
            event_tx,
        })
    }

    /// Subscribe to node state transitions. Events are sent after the
    /// transition has been persisted and broadcast.
    pub fn events(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.event_tx.subscribe()
    }

    /// Stop the event loop and wait for it to finish.
    pub async fn shutdown(mut self) {
        self.cancel_token.cancel();
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
    }
}

enum Tick {
    Cancelled,
    Sweep,
    Heartbeat(Result<Option<String>, Error>),
    Purge(String),
}

struct CoordinatorTask<S: MembershipStore, C: Connector> {
    store: S,
    connector: C,
    config: CoordinatorConfig,
    node_map: NodeMap,
    /// Open links to cache nodes, evicted when a node goes down.
    links: HashMap<String, C::Link>,
    /// Armed by the first heartbeat from each node; absent for nodes only
    /// known from the persisted map or from pings.
    last_heartbeat: HashMap<String, Instant>,
    purge_queue: DelayQueue<String>,
    purge_keys: HashMap<String, PurgeKey>,
    event_tx: broadcast::Sender<CoordinatorEvent>,
    cancel_token: CancellationToken,
}

impl<S: MembershipStore, C: Connector> CoordinatorTask<S, C> {
    async fn run(mut self, mut heartbeats: S::Subscription) {
        tracing::info!(nodes = self.node_map.len(), "coordinator initialized");
        self.broadcast().await;

        // Nodes loaded already down still owe a purge check; maybe_purge
        // waits out whatever is left of their retention window.
        let down_nodes: Vec<String> = self
            .node_map
            .values()
            .filter(|node| !node.up)
            .map(|node| node.name.clone())
            .collect();
        for name in down_nodes {
            let key = self.purge_queue.insert(name.clone(), Duration::ZERO);
            self.purge_keys.insert(name, key);
        }

        let cancel_token = self.cancel_token.clone();
        let mut sweep = tokio::time::interval(self.config.ping_interval);

        loop {
            let purge_pending = !self.purge_queue.is_empty();
            let tick = tokio::select! {
                _ = cancel_token.cancelled() => Tick::Cancelled,
                _ = sweep.tick() => Tick::Sweep,
                message = heartbeats.next_message() => Tick::Heartbeat(message),
                Some(expired) = poll_fn(|cx| self.purge_queue.poll_expired(cx)),
                    if purge_pending =>
                {
                    Tick::Purge(expired.into_inner())
                }
            };

            match tick {
                Tick::Cancelled => {
                    tracing::debug!("coordinator shutting down");
                    break;
                }
                Tick::Sweep => self.health_sweep().await,
                Tick::Heartbeat(Ok(Some(payload))) => self.handle_heartbeat(&payload).await,
                Tick::Heartbeat(Ok(None)) => {
                    tracing::error!("heartbeat subscription ended");
                    break;
                }
                Tick::Heartbeat(Err(err)) => {
                    tracing::error!("heartbeat subscription error: {err}");
                }
                Tick::Purge(name) => {
                    self.purge_keys.remove(&name);
                    self.maybe_purge(&name).await;
                }
            }
        }
    }

    /// One pass over every known node: the missed-heartbeat check first,
    /// then concurrent active pings raced against the ping timeout. A late
    /// pong loses the race and is dropped.
    async fn health_sweep(&mut self) {
        let now = Instant::now();
        let mut going_down = Vec::new();
        let mut probes = Vec::new();

        let names: Vec<String> = self.node_map.keys().cloned().collect();
        for name in names {
            let up = self.node_map.get(&name).map(|n| n.up).unwrap_or(false);

            if up {
                if let Some(last) = self.last_heartbeat.get(&name) {
                    if now.duration_since(*last) > self.config.heartbeat_timeout {
                        tracing::info!(node = %name, "missed heartbeat window");
                        going_down.push(name);
                        continue;
                    }
                }
            }

            match self.link_for(&name).await {
                Ok(link) => probes.push((name, up, link)),
                Err(err) => {
                    if up {
                        tracing::warn!(node = %name, "cannot open link for probe: {err}");
                        going_down.push(name);
                    }
                }
            }
        }

        let ping_timeout = self.config.ping_timeout;
        let results = join_all(probes.into_iter().map(|(name, up, mut link)| async move {
            let pong = tokio::time::timeout(ping_timeout, link.ping())
                .await
                .map(|result| result.is_ok())
                .unwrap_or(false);
            (name, up, pong)
        }))
        .await;

        for (name, up, pong) in results {
            match (up, pong) {
                (true, false) => going_down.push(name),
                (false, true) => {
                    let Some(node) = self.node_map.get(&name) else {
                        continue;
                    };
                    let (weight, data) = (node.weight, node.data.clone());
                    self.transition_up(&name, weight, data).await;
                }
                _ => {}
            }
        }

        for name in going_down {
            self.transition_down(&name).await;
        }
    }

    async fn handle_heartbeat(&mut self, payload: &str) {
        match HeartbeatMessage::decode(payload) {
            Ok(HeartbeatMessage::NodeUp { node }) => {
                let name = node.config.derived_name();
                self.transition_up(&name, node.weight, Some(NodeData::new(node.config)))
                    .await;
                self.last_heartbeat.insert(name, Instant::now());
            }
            Err(err) => {
                tracing::error!("discarding heartbeat message: {err}");
            }
        }
    }

    /// `unknown → up` and `down → up`. No-op for nodes already up. The node
    /// is told to reset its stored data on the way up, since it may carry
    /// state from a previous life.
    async fn transition_up(&mut self, name: &str, weight: f64, data: Option<NodeData>) {
        if self.node_map.get(name).map(|n| n.up).unwrap_or(false) {
            return;
        }

        self.node_map.insert(
            name.to_string(),
            Node {
                up: true,
                state_change_time: now_ms(),
                weight,
                name: name.to_string(),
                data,
            },
        );
        if let Some(key) = self.purge_keys.remove(name) {
            self.purge_queue.remove(&key);
        }
        // The missed-heartbeat window re-arms on the next heartbeat.
        self.last_heartbeat.remove(name);
        tracing::info!(node = %name, "node is up");

        match self.link_for(name).await {
            Ok(mut link) => {
                if let Err(err) = link.reset().await {
                    tracing::warn!(node = %name, "reset failed: {err}");
                }
            }
            Err(err) => {
                tracing::warn!(node = %name, "cannot open link for reset: {err}");
            }
        }

        self.persist(name).await;
        self.broadcast().await;
        let _ = self.event_tx.send(CoordinatorEvent::NodeUp(name.to_string()));
    }

    /// `up → down`. No-op for unknown or already-down nodes. Schedules the
    /// purge check; the timer is cancelled if the node comes back first.
    async fn transition_down(&mut self, name: &str) {
        let Some(node) = self.node_map.get_mut(name) else {
            return;
        };
        if !node.up {
            return;
        }
        node.up = false;
        node.state_change_time = now_ms();
        self.links.remove(name);
        tracing::info!(node = %name, "node is down");

        let key = self.purge_queue.insert(name.to_string(), self.config.retention);
        self.purge_keys.insert(name.to_string(), key);

        self.persist(name).await;
        self.broadcast().await;
        let _ = self
            .event_tx
            .send(CoordinatorEvent::NodeDown(name.to_string()));
    }

    /// `down → purged`, re-checked when the retention timer fires.
    async fn maybe_purge(&mut self, name: &str) {
        let Some(node) = self.node_map.get(name) else {
            return;
        };
        if node.up {
            return;
        }
        let elapsed = now_ms().saturating_sub(node.state_change_time);
        let retention_ms = self.config.retention.as_millis() as u64;
        if elapsed < retention_ms {
            // Timer and wall clock can disagree; wait out the remainder.
            let key = self
                .purge_queue
                .insert(name.to_string(), Duration::from_millis(retention_ms - elapsed));
            self.purge_keys.insert(name.to_string(), key);
            return;
        }

        self.node_map.remove(name);
        self.links.remove(name);
        self.last_heartbeat.remove(name);
        tracing::info!(node = %name, "node purged after retention window");

        self.persist(name).await;
        self.broadcast().await;
        let _ = self
            .event_tx
            .send(CoordinatorEvent::NodePurged(name.to_string()));
    }

    async fn link_for(&mut self, name: &str) -> Result<C::Link, Error> {
        if let Some(link) = self.links.get(name) {
            return Ok(link.clone());
        }
        let config = self
            .node_map
            .get(name)
            .and_then(|node| node.data.as_ref())
            .map(|data| data.config.clone())
            .ok_or_else(|| Error::Config(format!("node {name} carries no connection config")))?;
        let link = self.connector.connect(&config).await?;
        self.links.insert(name.to_string(), link.clone());
        Ok(link)
    }

    /// Write (or delete) one node's entry in the store. Failures are logged;
    /// the in-memory map stays authoritative for sweep decisions until the
    /// store recovers.
    async fn persist(&mut self, name: &str) {
        let result = match self.node_map.get(name) {
            Some(node) => match encode_entry(node) {
                Ok(raw) => {
                    self.store
                        .set_field(&self.config.node_set_key, name, &raw)
                        .await
                }
                Err(err) => Err(err),
            },
            None => {
                self.store
                    .delete_field(&self.config.node_set_key, name)
                    .await
            }
        };
        if let Err(err) = result {
            tracing::error!(node = %name, "persisting node entry failed: {err}");
        }
    }

    /// Publish the entire current node map on the broadcast channel.
    async fn broadcast(&mut self) {
        let message = BusMessage::UpdateNodes {
            node_map: self.node_map.clone(),
        };
        let result = match message.encode() {
            Ok(payload) => {
                self.store
                    .publish(&self.config.broadcast_channel, &payload)
                    .await
            }
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            tracing::error!("membership broadcast failed: {err}");
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_millis() as u64
}
