//! The authoritative mapping-store behind the membership protocol.
//!
//! [`MembershipStore`] is the narrow interface the coordinator and clients
//! consume: read the full node map, write or delete one node's entry, and
//! publish/subscribe membership messages. No retry or backoff lives here;
//! transport failures surface as errors to the caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::broadcast;

use crate::Error;

/// A live subscription to one channel. Messages arrive in publish order and
/// buffer while the consumer is busy elsewhere (this is what makes the
/// client's subscribe-then-snapshot bootstrap lossless).
#[async_trait]
pub trait StoreSubscription: Send {
    /// Next message, or `None` once the subscription has ended.
    async fn next_message(&mut self) -> Result<Option<String>, Error>;
}

/// Mapping-store plus pub/sub bus primitives.
#[async_trait]
pub trait MembershipStore: Send + Sync + 'static {
    type Subscription: StoreSubscription + 'static;

    async fn get_all(&self, key: &str) -> Result<HashMap<String, String>, Error>;
    async fn set_field(&self, key: &str, field: &str, value: &str) -> Result<(), Error>;
    async fn delete_field(&self, key: &str, field: &str) -> Result<(), Error>;
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), Error>;
    /// Resolves only once the subscription is acknowledged by the bus.
    async fn subscribe(&self, channel: &str) -> Result<Self::Subscription, Error>;
}

/// Redis-backed store: a hash for the node map, Redis Pub/Sub for the bus.
///
/// Commands run on a shared multiplexed connection; each subscription gets
/// its own Pub/Sub connection, since a connection in subscriber mode cannot
/// issue regular commands.
pub struct RedisStore {
    client: redis::Client,
    conn: redis::aio::MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl MembershipStore for RedisStore {
    type Subscription = RedisSubscription;

    async fn get_all(&self, key: &str) -> Result<HashMap<String, String>, Error> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(map)
    }

    async fn set_field(&self, key: &str, field: &str, value: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete_field(&self, key: &str, field: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        redis::cmd("HDEL")
            .arg(key)
            .arg(field)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Self::Subscription, Error> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        Ok(RedisSubscription { pubsub })
    }
}

pub struct RedisSubscription {
    pubsub: redis::aio::PubSub,
}

#[async_trait]
impl StoreSubscription for RedisSubscription {
    async fn next_message(&mut self) -> Result<Option<String>, Error> {
        let mut stream = self.pubsub.on_message();
        match stream.next().await {
            Some(message) => Ok(Some(message.get_payload()?)),
            None => Ok(None),
        }
    }
}

/// In-process store over plain maps and tokio broadcast channels.
///
/// Same contract as [`RedisStore`], no external service: the backend for
/// hermetic tests and single-process simulations. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    maps: Mutex<HashMap<String, HashMap<String, String>>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.inner.channels.lock().expect("channel lock poisoned");
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }
}

#[async_trait]
impl MembershipStore for MemoryStore {
    type Subscription = MemorySubscription;

    async fn get_all(&self, key: &str) -> Result<HashMap<String, String>, Error> {
        let maps = self.inner.maps.lock().expect("map lock poisoned");
        Ok(maps.get(key).cloned().unwrap_or_default())
    }

    async fn set_field(&self, key: &str, field: &str, value: &str) -> Result<(), Error> {
        let mut maps = self.inner.maps.lock().expect("map lock poisoned");
        maps.entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_field(&self, key: &str, field: &str) -> Result<(), Error> {
        let mut maps = self.inner.maps.lock().expect("map lock poisoned");
        if let Some(map) = maps.get_mut(key) {
            map.remove(field);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), Error> {
        // A send with no live subscribers is not an error, same as Redis.
        let _ = self.sender(channel).send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Self::Subscription, Error> {
        Ok(MemorySubscription {
            rx: self.sender(channel).subscribe(),
        })
    }
}

pub struct MemorySubscription {
    rx: broadcast::Receiver<String>,
}

#[async_trait]
impl StoreSubscription for MemorySubscription {
    async fn next_message(&mut self) -> Result<Option<String>, Error> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => return Ok(Some(payload)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "memory store subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}
