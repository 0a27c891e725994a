use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::broker::BrokerTransport;
use crate::error::{MeshError, Result};
use crate::message::Envelope;

/// Ceiling applied to [`RpcEngine::rpc`]: long enough to be unbounded for
/// practical purposes while still guaranteeing eventual teardown of the
/// subscription.
pub const RPC_CEILING: Duration = Duration::from_secs(24 * 60 * 60);

/// Publishes request envelopes and correlates exactly one reply each.
///
/// Correlation is solely the uniqueness of the per-request response channel
/// (derived from the message id); only the first frame received on it is
/// consumed. This layer never retries a publish — callers wanting a retry
/// build a fresh envelope and invoke again.
#[derive(Clone)]
pub struct RpcEngine {
    broker: Arc<dyn BrokerTransport>,
}

impl RpcEngine {
    pub fn new(broker: Arc<dyn BrokerTransport>) -> Self {
        Self { broker }
    }

    /// Send a request and await its reply, bounded only by [`RPC_CEILING`].
    pub async fn rpc(&self, msg: &Envelope) -> Result<Option<Envelope>> {
        self.rpc_with_timeout(msg, RPC_CEILING).await
    }

    /// Send a request and await its reply with an explicit deadline.
    ///
    /// Subscribes to the response channel *before* publishing, so a reply
    /// arriving faster than the caller can listen is never lost. The
    /// deadline elapsing is not an error: the call resolves to `Ok(None)`.
    /// Frames on the response channel that fail to decode are logged and
    /// dropped, and the wait continues until the deadline. The subscription
    /// is torn down on every outcome.
    pub async fn rpc_with_timeout(
        &self,
        msg: &Envelope,
        timeout: Duration,
    ) -> Result<Option<Envelope>> {
        if msg.response_channel.is_empty() {
            return Err(MeshError::invalid_message(
                "rpc requires an envelope with a response channel",
            ));
        }

        let mut subscription = self.broker.subscribe(&msg.response_channel).await?;
        self.broker.publish(&msg.channel, &msg.to_bytes()?).await?;
        debug!(channel = %msg.channel, msg_id = %msg.msg_id, "published rpc request");

        let deadline = tokio::time::Instant::now() + timeout;
        let reply = loop {
            match tokio::time::timeout_at(deadline, subscription.recv()).await {
                Ok(Some(frame)) => match Envelope::from_bytes(&frame) {
                    Ok(envelope) => break Some(envelope),
                    Err(err) => {
                        warn!(
                            response_channel = %msg.response_channel,
                            error = %err,
                            "dropping undecodable reply frame"
                        );
                    }
                },
                Ok(None) => break None,
                Err(_) => {
                    debug!(
                        response_channel = %msg.response_channel,
                        timeout_ms = timeout.as_millis() as u64,
                        "rpc deadline elapsed without reply"
                    );
                    break None;
                }
            }
        };
        // Dropping the subscription releases the channel and any forwarding
        // task on both the reply and timeout paths.
        drop(subscription);
        Ok(reply)
    }
}

impl std::fmt::Debug for RpcEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcEngine").finish_non_exhaustive()
    }
}
