use thiserror::Error;

/// Result type alias for mesh operations
pub type Result<T> = std::result::Result<T, MeshError>;

/// Error types for the mesh.
///
/// Note that an RPC deadline elapsing is deliberately not represented here:
/// "no reply within the timeout" is an ordinary outcome and surfaces as
/// `Ok(None)` from the RPC engine.
#[derive(Error, Debug)]
pub enum MeshError {
    /// Broker connection or command errors
    #[error("broker connection error: {0}")]
    Connection(#[from] redis::RedisError),

    /// Envelope or record serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid or duplicate service registration
    #[error("invalid registration: {reason}")]
    Registration { reason: String },

    /// No live instance matched a (service, route) pair
    #[error("no live instance of '{service}' matching '{route}'")]
    NotFound { service: String, route: String },

    /// Malformed envelope for the attempted operation
    #[error("invalid message: {reason}")]
    InvalidMessage { reason: String },

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Network I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal framework errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl MeshError {
    /// Create a new registration error
    pub fn registration<T: ToString>(reason: T) -> Self {
        Self::Registration {
            reason: reason.to_string(),
        }
    }

    /// Create a new invalid-message error
    pub fn invalid_message<T: ToString>(reason: T) -> Self {
        Self::InvalidMessage {
            reason: reason.to_string(),
        }
    }

    /// Create a new internal error
    pub fn internal<T: ToString>(message: T) -> Self {
        Self::Internal(message.to_string())
    }
}
