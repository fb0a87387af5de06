//! Multi-component simulation tests: coordinator, node agents, and clients
//! wired together over the in-memory store and fake cache nodes, with
//! shortened protocol windows so state transitions happen in milliseconds.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::sleep;

use volatile_cluster::messages::HEARTBEAT_CHANNEL;
use volatile_cluster::{
    AgentConfig, ClientOptions, ClusterClient, Connector, Coordinator, CoordinatorConfig,
    CoordinatorEvent, MembershipStore, MemoryConnector, MemoryStore, NodeAgent, NodeLink,
};
use volatile_hashring::{LookupOptions, NodeConfig, RoutedNode};

fn coordinator_config(retention: Duration) -> CoordinatorConfig {
    CoordinatorConfig {
        ping_interval: Duration::from_millis(50),
        ping_timeout: Duration::from_millis(25),
        heartbeat_timeout: Duration::from_millis(250),
        retention,
        ..CoordinatorConfig::default()
    }
}

fn agent_config(node: &NodeConfig, weight: f64) -> AgentConfig {
    let mut config = AgentConfig::new(node.clone(), weight);
    config.heartbeat_interval = Duration::from_millis(25);
    config
}

async fn wait_for_event(
    events: &mut broadcast::Receiver<CoordinatorEvent>,
    matcher: impl Fn(&CoordinatorEvent) -> bool,
) -> CoordinatorEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if matcher(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for coordinator event")
}

async fn resolve_eventually(
    client: &ClusterClient<MemoryConnector>,
    key: &str,
) -> Option<RoutedNode> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(node) = client.resolve_node(key, &LookupOptions::default()).await {
            return Some(node);
        }
        if tokio::time::Instant::now() > deadline {
            return None;
        }
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_agent_heartbeat_brings_node_up() {
    let store = MemoryStore::new();
    let connector = MemoryConnector::new();
    let node_config = NodeConfig::new("10.0.0.1", 7001);
    connector.register(&node_config);

    let coordinator = Coordinator::start(
        store.clone(),
        connector.clone(),
        coordinator_config(Duration::from_secs(60)),
    )
    .await
    .unwrap();
    let mut events = coordinator.events();

    let client = ClusterClient::connect(store.clone(), connector.clone(), ClientOptions::default())
        .await
        .unwrap();

    let agent = NodeAgent::start(store.clone(), connector.clone(), agent_config(&node_config, 1.0));

    wait_for_event(&mut events, |e| {
        matches!(e, CoordinatorEvent::NodeUp(name) if name.as_str() == "10.0.0.1:7001")
    })
    .await;

    let node = resolve_eventually(&client, "some-key").await.unwrap();
    assert_eq!(node.name, "10.0.0.1:7001");
    assert!(node.up);

    // Shard-number addressing indexes the up nodes directly.
    let shard = client
        .resolve_node(0i64, &LookupOptions::default())
        .await
        .unwrap();
    assert_eq!(shard.name, "10.0.0.1:7001");

    // The persisted entry matches the broadcast view.
    let persisted = store.get_all("rvolcluster:nodeset").await.unwrap();
    assert!(persisted.contains_key("10.0.0.1:7001"));

    agent.shutdown().await;
    client.shutdown().await;
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_fresh_node_is_reset_on_first_up() {
    let store = MemoryStore::new();
    let connector = MemoryConnector::new();
    let node_config = NodeConfig::new("10.0.0.2", 7002);
    let node = connector.register(&node_config);

    // Stale state from a previous life.
    let mut link = connector.connect(&node_config).await.unwrap();
    link.write("stale", "value").await.unwrap();
    assert_eq!(node.key_count(), 1);

    let coordinator = Coordinator::start(
        store.clone(),
        connector.clone(),
        coordinator_config(Duration::from_secs(60)),
    )
    .await
    .unwrap();
    let mut events = coordinator.events();

    let agent = NodeAgent::start(store.clone(), connector.clone(), agent_config(&node_config, 1.0));

    wait_for_event(&mut events, |e| matches!(e, CoordinatorEvent::NodeUp(_))).await;
    assert_eq!(node.key_count(), 0);

    agent.shutdown().await;
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_failed_ping_downs_node_and_heartbeat_revives_it() {
    let store = MemoryStore::new();
    let connector = MemoryConnector::new();
    let node_config = NodeConfig::new("10.0.0.3", 7003);
    let node = connector.register(&node_config);

    let coordinator = Coordinator::start(
        store.clone(),
        connector.clone(),
        coordinator_config(Duration::from_secs(60)),
    )
    .await
    .unwrap();
    let mut events = coordinator.events();

    let client = ClusterClient::connect(store.clone(), connector.clone(), ClientOptions::default())
        .await
        .unwrap();
    let agent = NodeAgent::start(store.clone(), connector.clone(), agent_config(&node_config, 1.0));

    wait_for_event(&mut events, |e| matches!(e, CoordinatorEvent::NodeUp(_))).await;

    node.set_healthy(false);
    wait_for_event(&mut events, |e| matches!(e, CoordinatorEvent::NodeDown(_))).await;

    // With no grace window the down node is unroutable; inside a grace
    // window it still resolves, flagged down.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let strict = client.resolve_node("key", &LookupOptions::default()).await;
        if strict.is_none() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "down node still routable without grace"
        );
        sleep(Duration::from_millis(20)).await;
    }
    let graced = client
        .resolve_node(
            "key",
            &LookupOptions::with_down_node_expiry(Duration::from_secs(3600)),
        )
        .await
        .unwrap();
    assert!(!graced.up);

    // resolve_config suppresses nodes that are not up.
    assert!(client
        .resolve_config("key", &LookupOptions::default())
        .await
        .is_none());

    node.set_healthy(true);
    wait_for_event(&mut events, |e| matches!(e, CoordinatorEvent::NodeUp(_))).await;
    let node_back = resolve_eventually(&client, "key").await.unwrap();
    assert!(node_back.up);

    agent.shutdown().await;
    client.shutdown().await;
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_missed_heartbeats_down_a_node_that_still_pongs() {
    let store = MemoryStore::new();
    let connector = MemoryConnector::new();
    let node_config = NodeConfig::new("10.0.0.4", 7004);
    connector.register(&node_config);

    let coordinator = Coordinator::start(
        store.clone(),
        connector.clone(),
        coordinator_config(Duration::from_secs(60)),
    )
    .await
    .unwrap();
    let mut events = coordinator.events();

    let agent = NodeAgent::start(store.clone(), connector.clone(), agent_config(&node_config, 1.0));
    wait_for_event(&mut events, |e| matches!(e, CoordinatorEvent::NodeUp(_))).await;

    // Kill the agent but leave the node healthy: the missed-heartbeat
    // window still downs it, then the active ping revives it.
    agent.shutdown().await;
    wait_for_event(&mut events, |e| matches!(e, CoordinatorEvent::NodeDown(_))).await;
    wait_for_event(&mut events, |e| matches!(e, CoordinatorEvent::NodeUp(_))).await;

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_node_down_past_retention_is_purged() {
    let store = MemoryStore::new();
    let connector = MemoryConnector::new();
    let node_config = NodeConfig::new("10.0.0.5", 7005);
    let node = connector.register(&node_config);

    let coordinator = Coordinator::start(
        store.clone(),
        connector.clone(),
        coordinator_config(Duration::from_millis(300)),
    )
    .await
    .unwrap();
    let mut events = coordinator.events();

    let client = ClusterClient::connect(store.clone(), connector.clone(), ClientOptions::default())
        .await
        .unwrap();
    let agent = NodeAgent::start(store.clone(), connector.clone(), agent_config(&node_config, 1.0));

    wait_for_event(&mut events, |e| matches!(e, CoordinatorEvent::NodeUp(_))).await;

    agent.shutdown().await;
    node.set_healthy(false);
    wait_for_event(&mut events, |e| matches!(e, CoordinatorEvent::NodeDown(_))).await;
    wait_for_event(&mut events, |e| matches!(e, CoordinatorEvent::NodePurged(_))).await;

    // Purged from the store and, after the broadcast, from the client.
    assert!(store.get_all("rvolcluster:nodeset").await.unwrap().is_empty());
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while client.node_count().await > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "client still knows the purged node"
        );
        sleep(Duration::from_millis(20)).await;
    }

    client.shutdown().await;
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_recovered_node_is_not_purged() {
    let store = MemoryStore::new();
    let connector = MemoryConnector::new();
    let node_config = NodeConfig::new("10.0.0.6", 7006);
    let node = connector.register(&node_config);

    let coordinator = Coordinator::start(
        store.clone(),
        connector.clone(),
        coordinator_config(Duration::from_millis(400)),
    )
    .await
    .unwrap();
    let mut events = coordinator.events();

    let agent = NodeAgent::start(store.clone(), connector.clone(), agent_config(&node_config, 1.0));
    wait_for_event(&mut events, |e| matches!(e, CoordinatorEvent::NodeUp(_))).await;

    agent.shutdown().await;
    node.set_healthy(false);
    wait_for_event(&mut events, |e| matches!(e, CoordinatorEvent::NodeDown(_))).await;

    // Recover well before the retention window runs out; the pending purge
    // timer must be cancelled.
    node.set_healthy(true);
    wait_for_event(&mut events, |e| matches!(e, CoordinatorEvent::NodeUp(_))).await;

    sleep(Duration::from_millis(800)).await;
    loop {
        match events.try_recv() {
            Ok(CoordinatorEvent::NodePurged(name)) => panic!("recovered node {name} was purged"),
            Ok(_) => {}
            Err(_) => break,
        }
    }
    assert!(store
        .get_all("rvolcluster:nodeset")
        .await
        .unwrap()
        .contains_key("10.0.0.6:7006"));

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_pool_evicts_connections_to_down_nodes() {
    let store = MemoryStore::new();
    let connector = MemoryConnector::new();
    let node_config = NodeConfig::new("10.0.0.7", 7007);
    let node = connector.register(&node_config);

    let coordinator = Coordinator::start(
        store.clone(),
        connector.clone(),
        coordinator_config(Duration::from_secs(60)),
    )
    .await
    .unwrap();
    let mut events = coordinator.events();

    let client = ClusterClient::connect(store.clone(), connector.clone(), ClientOptions::default())
        .await
        .unwrap();
    let agent = NodeAgent::start(store.clone(), connector.clone(), agent_config(&node_config, 1.0));

    wait_for_event(&mut events, |e| matches!(e, CoordinatorEvent::NodeUp(_))).await;
    resolve_eventually(&client, "key").await.unwrap();

    let mut link = client
        .get_connection("key", &LookupOptions::default())
        .await
        .unwrap();
    link.write("key", "value").await.unwrap();
    assert_eq!(link.read("key").await.unwrap().as_deref(), Some("value"));
    assert_eq!(client.pooled_connections().await, 1);

    node.set_healthy(false);
    wait_for_event(&mut events, |e| matches!(e, CoordinatorEvent::NodeDown(_))).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while client.pooled_connections().await > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "pool still holds a connection to a down node"
        );
        sleep(Duration::from_millis(20)).await;
    }
    assert!(client
        .get_connection("key", &LookupOptions::default())
        .await
        .is_none());

    agent.shutdown().await;
    client.shutdown().await;
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_two_weighted_nodes_share_keys() {
    let store = MemoryStore::new();
    let connector = MemoryConnector::new();
    let config_a = NodeConfig::new("10.0.1.1", 7001);
    let config_b = NodeConfig::new("10.0.1.2", 7001);
    connector.register(&config_a);
    connector.register(&config_b);

    let coordinator = Coordinator::start(
        store.clone(),
        connector.clone(),
        coordinator_config(Duration::from_secs(60)),
    )
    .await
    .unwrap();

    let client = ClusterClient::connect(store.clone(), connector.clone(), ClientOptions::default())
        .await
        .unwrap();
    let agent_a = NodeAgent::start(store.clone(), connector.clone(), agent_config(&config_a, 1.0));
    let agent_b = NodeAgent::start(store.clone(), connector.clone(), agent_config(&config_b, 2.0));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while client.up_count().await < 2 {
        assert!(tokio::time::Instant::now() < deadline, "both nodes should come up");
        sleep(Duration::from_millis(20)).await;
    }

    let mut seen_a = 0usize;
    let mut seen_b = 0usize;
    for i in 0..200 {
        let key = format!("key-{i}");
        let node = client
            .resolve_node(key.as_str(), &LookupOptions::default())
            .await
            .unwrap();
        match node.name.as_str() {
            "10.0.1.1:7001" => seen_a += 1,
            "10.0.1.2:7001" => seen_b += 1,
            other => panic!("key routed to unknown node {other}"),
        }
    }
    assert_eq!(seen_a + seen_b, 200);
    assert!(seen_a > 0 && seen_b > 0);

    agent_a.shutdown().await;
    agent_b.shutdown().await;
    client.shutdown().await;
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_unknown_heartbeat_message_is_ignored() {
    let store = MemoryStore::new();
    let connector = MemoryConnector::new();
    let node_config = NodeConfig::new("10.0.0.8", 7008);
    connector.register(&node_config);

    let coordinator = Coordinator::start(
        store.clone(),
        connector.clone(),
        coordinator_config(Duration::from_secs(60)),
    )
    .await
    .unwrap();
    let mut events = coordinator.events();

    // Garbage and unknown types are reported and discarded; the loop
    // keeps consuming real heartbeats afterwards.
    store.publish(HEARTBEAT_CHANNEL, "not json").await.unwrap();
    store
        .publish(HEARTBEAT_CHANNEL, r#"{"type":"node_sideways","node":{}}"#)
        .await
        .unwrap();

    let agent = NodeAgent::start(store.clone(), connector.clone(), agent_config(&node_config, 1.0));
    wait_for_event(&mut events, |e| {
        matches!(e, CoordinatorEvent::NodeUp(name) if name.as_str() == "10.0.0.8:7008")
    })
    .await;

    agent.shutdown().await;
    coordinator.shutdown().await;
}
