use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::MeshConfig;
use crate::error::Result;

/// Capacity of a subscription's frame buffer. Delivery is best-effort and
/// at-most-once, so a full buffer drops frames rather than blocking the
/// broker connection.
const SUBSCRIPTION_BUFFER: usize = 1024;

/// The broker interface the mesh needs: keyed storage with per-key expiry
/// plus topic-based publish/subscribe.
///
/// The production implementation is [`RedisBroker`]; tests and mock mode run
/// against [`crate::mock::MockBroker`]. The handle is shared by every task in
/// the process and must be safe for concurrent use.
#[async_trait]
pub trait BrokerTransport: Send + Sync + std::fmt::Debug {
    /// Publish a frame on a channel
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()>;

    /// Subscribe to a channel, returning a stream of raw frames
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    /// Write a key with a lifetime
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Read a key; `None` when absent or expired
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// List keys matching a glob-style pattern
    async fn scan(&self, pattern: &str) -> Result<Vec<String>>;

    /// Refresh the lifetime of an existing key
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
}

/// A live subscription to one broker channel.
///
/// Dropping the subscription releases the underlying channel and aborts any
/// forwarding task, so holders can tear down on every exit path without an
/// explicit unsubscribe call.
pub struct Subscription {
    rx: mpsc::Receiver<Vec<u8>>,
    forwarder: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            forwarder: None,
        }
    }

    pub(crate) fn with_forwarder(rx: mpsc::Receiver<Vec<u8>>, task: JoinHandle<()>) -> Self {
        Self {
            rx,
            forwarder: Some(task),
        }
    }

    /// Receive the next frame; `None` when the channel is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.forwarder.take() {
            task.abort();
        }
    }
}

/// Redis-backed broker transport.
///
/// Commands go through a shared [`redis::aio::ConnectionManager`]; each
/// subscription holds a dedicated pub/sub connection owned by a forwarding
/// task that is aborted (closing the connection) when the subscription is
/// dropped.
pub struct RedisBroker {
    client: redis::Client,
    manager: redis::aio::ConnectionManager,
}

impl RedisBroker {
    /// Connect to the broker. Failure here is fatal to the caller: a mesh
    /// participant cannot operate without its broker.
    pub async fn connect(config: &MeshConfig) -> Result<Self> {
        let client = redis::Client::open(config.connection_url())?;
        let manager = redis::aio::ConnectionManager::new(client.clone()).await?;
        debug!(url = %config.broker_url, "connected to broker");
        Ok(Self { client, manager })
    }
}

#[async_trait]
impl BrokerTransport for RedisBroker {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let channel = channel.to_string();
        let task = tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let frame = msg.get_payload_bytes().to_vec();
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
            debug!(channel, "subscription stream ended");
        });

        Ok(Subscription::with_forwarder(rx, task))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        let refreshed: bool = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        if !refreshed {
            warn!(key, "expire on missing key");
        }
        Ok(())
    }
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker").finish_non_exhaustive()
    }
}
