use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use crate::broker::{BrokerTransport, Subscription};
use crate::error::Result;

const SUBSCRIPTION_BUFFER: usize = 1024;

struct MockEntry {
    value: String,
    expires_at: Instant,
}

/// In-memory broker for mock mode and tests.
///
/// Keyed storage expires lazily against the tokio clock, so paused-clock
/// tests can drive TTL behavior deterministically with `tokio::time::advance`.
/// Publish fans out to all current subscribers; frames published with no
/// subscriber are dropped, matching the production transport.
#[derive(Default)]
pub struct MockBroker {
    keys: Mutex<HashMap<String, MockEntry>>,
    channels: Mutex<HashMap<String, Vec<mpsc::Sender<Vec<u8>>>>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on a channel. Test probe for the
    /// no-leaked-subscription guarantees of the RPC engine.
    pub async fn subscriber_count(&self, channel: &str) -> usize {
        let mut channels = self.channels.lock().await;
        match channels.get_mut(channel) {
            Some(senders) => {
                senders.retain(|tx| !tx.is_closed());
                let count = senders.len();
                if count == 0 {
                    channels.remove(channel);
                }
                count
            }
            None => 0,
        }
    }
}

/// Glob matcher supporting `*` only, the subset the mesh keyspace uses.
fn key_matches(pattern: &str, key: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return pattern == key;
    };
    if !key.starts_with(first) {
        return false;
    }
    let mut rest = &key[first.len()..];
    let mut last_part: Option<&str> = None;
    for part in parts {
        last_part = Some(part);
        if part.is_empty() {
            continue;
        }
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    match last_part {
        // Pattern contained at least one '*'; it must end on the final
        // literal unless that literal is empty (trailing '*').
        Some(part) => part.is_empty() || rest.is_empty(),
        None => first == key,
    }
}

#[async_trait]
impl BrokerTransport for MockBroker {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        let mut channels = self.channels.lock().await;
        if let Some(senders) = channels.get_mut(channel) {
            // Best-effort fan-out; closed or saturated subscribers miss the
            // frame, never block the publisher.
            senders.retain(|tx| tx.try_send(payload.to_vec()).is_ok() || !tx.is_closed());
            if senders.is_empty() {
                channels.remove(channel);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.channels
            .lock()
            .await
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(rx))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.keys.lock().await.insert(
            key.to_string(),
            MockEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut keys = self.keys.lock().await;
        match keys.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                keys.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut keys = self.keys.lock().await;
        keys.retain(|_, entry| entry.expires_at > now);
        Ok(keys
            .keys()
            .filter(|key| key_matches(pattern, key))
            .cloned()
            .collect())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        if let Some(entry) = self.keys.lock().await.get_mut(key) {
            entry.expires_at = Instant::now() + ttl;
        }
        Ok(())
    }
}

impl std::fmt::Debug for MockBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBroker").finish_non_exhaustive()
    }
}
