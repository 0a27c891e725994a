use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MeshError, Result};
use crate::registry::Service;

/// Generate a globally unique identifier, uuid v4 with dashes stripped.
pub(crate) fn random_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// The wire envelope carrying routing, correlation and payload.
///
/// Encoding is JSON with empty fields omitted entirely rather than
/// null-filled. `response_channel` is only set on fresh requests; replies
/// publish onto the original response channel and carry none of their own,
/// so a reply is not itself repliable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    /// Creation time, milliseconds since the Unix epoch
    #[serde(default, skip_serializing_if = "is_zero")]
    pub timestamp: i64,
    /// Globally unique per send
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub msg_id: String,
    /// Ephemeral channel a reply should be published on (requests only)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub response_channel: String,
    /// Channel this envelope is published on
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel: String,
    /// Logical route within the target service
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub route: String,
    /// Caller identity
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from: String,
    /// Target identity
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to: String,
    /// Opaque payload; round-trips through the wire format untouched
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
    /// String metadata (headers, tracing info)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub meta: HashMap<String, String>,
}

impl Envelope {
    /// Build a fresh request for a target service instance.
    ///
    /// Allocates a new `msg_id` and derives the one-shot response channel
    /// from it: `<channel>:response:<msg_id>`.
    pub fn request(
        from: impl Into<String>,
        target: &Service,
        route: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::request_with_meta(from, target, route, payload, HashMap::new())
    }

    /// Build a fresh request carrying caller metadata.
    pub fn request_with_meta(
        from: impl Into<String>,
        target: &Service,
        route: impl Into<String>,
        payload: serde_json::Value,
        meta: HashMap<String, String>,
    ) -> Self {
        let msg_id = random_id();
        let channel = target.key();
        Self {
            timestamp: Utc::now().timestamp_millis(),
            response_channel: format!("{channel}:response:{msg_id}"),
            msg_id,
            to: channel.clone(),
            channel,
            route: route.into(),
            from: from.into(),
            payload,
            meta,
        }
    }

    /// Build the reply to this envelope.
    ///
    /// Stamps a new timestamp and `msg_id`, publishes onto the original
    /// response channel, swaps `from`/`to` and substitutes the payload.
    /// Fails when this envelope carries no response channel, which is the
    /// case for replies themselves.
    pub fn reply(
        &self,
        payload: serde_json::Value,
        meta: Option<HashMap<String, String>>,
    ) -> Result<Envelope> {
        if self.response_channel.is_empty() {
            return Err(MeshError::invalid_message(
                "envelope has no response channel; replies cannot be replied to",
            ));
        }
        Ok(Envelope {
            timestamp: Utc::now().timestamp_millis(),
            msg_id: random_id(),
            response_channel: String::new(),
            channel: self.response_channel.clone(),
            route: self.route.clone(),
            from: self.to.clone(),
            to: self.from.clone(),
            payload,
            meta: meta.unwrap_or_else(|| self.meta.clone()),
        })
    }

    /// Serialize for transmission
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize a received frame
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Deserialize the payload to a concrete type
    pub fn deserialize_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Add a metadata entry
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }
}
