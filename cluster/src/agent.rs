//! The node agent: a stateless liveness reporter running next to each cache
//! node. Every interval it pings its own node and, on success, announces
//! `node_up` on the heartbeat channel; a failed self-check just skips the
//! round and lets the coordinator time the node out.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::messages::{HeartbeatMessage, HeartbeatNode};
use crate::store::MembershipStore;
use crate::transport::{Connector, NodeLink};

/// Handle to a running node agent.
pub struct NodeAgent {
    cancel_token: CancellationToken,
    task_handle: Option<JoinHandle<()>>,
}

impl NodeAgent {
    pub fn start<S, C>(store: S, connector: C, config: AgentConfig) -> Self
    where
        S: MembershipStore,
        C: Connector,
    {
        let cancel_token = CancellationToken::new();
        let task_handle = tokio::spawn(run(store, connector, config, cancel_token.clone()));
        Self {
            cancel_token,
            task_handle: Some(task_handle),
        }
    }

    pub async fn shutdown(mut self) {
        self.cancel_token.cancel();
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
    }
}

async fn run<S, C>(store: S, connector: C, config: AgentConfig, cancel_token: CancellationToken)
where
    S: MembershipStore,
    C: Connector,
{
    let name = config.node.derived_name();
    let mut interval = tokio::time::interval(config.heartbeat_interval);
    let mut link: Option<C::Link> = None;

    tracing::info!(node = %name, weight = config.weight, "node agent started");

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                tracing::debug!(node = %name, "node agent shutting down");
                break;
            }
            _ = interval.tick() => {}
        }

        if link.is_none() {
            match connector.connect(&config.node).await {
                Ok(opened) => link = Some(opened),
                Err(err) => {
                    tracing::warn!(node = %name, "self-check connect failed: {err}");
                    continue;
                }
            }
        }
        let Some(active) = link.as_mut() else {
            continue;
        };
        if let Err(err) = active.ping().await {
            tracing::warn!(node = %name, "self-check ping failed: {err}");
            link = None;
            continue;
        }

        let message = HeartbeatMessage::NodeUp {
            node: HeartbeatNode {
                config: config.node.clone(),
                weight: config.weight,
            },
        };
        let result = match message.encode() {
            Ok(payload) => store.publish(&config.heartbeat_channel, &payload).await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            tracing::error!(node = %name, "heartbeat publish failed: {err}");
        }
    }
}
