//! Node-agent daemon: runs next to one cache node and announces its
//! liveness to the coordinator over the heartbeat channel.
//!
//! Run: cargo run -p volatile-cluster --bin node_agent

use dotenv::dotenv;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use volatile_cluster::{AgentConfig, NodeAgent, RedisConnector, RedisStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let config = AgentConfig::from_env()?;

    let store = RedisStore::connect(&redis_url).await?;
    let node = config.node.derived_name();
    let agent = NodeAgent::start(store, RedisConnector, config);
    tracing::info!(%redis_url, %node, "node agent running");

    wait_for_shutdown_signal().await;
    agent.shutdown().await;
    tracing::info!("node agent stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
