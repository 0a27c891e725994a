//! # Morpheus - Broker-Mediated Service Mesh
//!
//! Morpheus lets processes register as named services exposing path-style
//! routes, advertise liveness through expiring presence records, and exchange
//! correlated request/response messages over publish/subscribe channels. The
//! broker only has to offer keyed storage with per-key expiry plus topic
//! pub/sub; Redis is the production transport and an in-memory mock serves
//! test isolation.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use morpheus::{Mesh, MeshConfig, Route};
//!
//! #[tokio::main]
//! async fn main() -> morpheus::Result<()> {
//!     let mesh = Mesh::connect(MeshConfig::from_env()).await?;
//!
//!     mesh.register(
//!         "echo",
//!         0,
//!         vec![Route::with_handler("/echo", |envelope| async move {
//!             Ok(Some(envelope.payload))
//!         })],
//!     )
//!     .await?;
//!
//!     // Registration keeps heartbeating until removed or the process exits.
//!     tokio::signal::ctrl_c().await?;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod error;
mod heartbeat;
pub mod message;
pub mod mock;
pub mod registry;
pub mod resolver;
pub mod rpc;

use std::sync::Arc;

pub use broker::{BrokerTransport, RedisBroker, Subscription};
pub use config::{MeshConfig, DEFAULT_HB_INTERVAL, DEFAULT_TTL};
pub use error::{MeshError, Result};
pub use message::Envelope;
pub use mock::MockBroker;
pub use registry::{Route, RouteHandler, Service, ServiceRegistry};
pub use resolver::ServiceResolver;
pub use rpc::{RpcEngine, RPC_CEILING};

/// One mesh participant: a broker connection plus the registry, RPC engine
/// and resolver built on it.
#[derive(Debug, Clone)]
pub struct Mesh {
    broker: Arc<dyn BrokerTransport>,
    registry: Arc<ServiceRegistry>,
    rpc: RpcEngine,
    resolver: ServiceResolver,
}

impl Mesh {
    /// Connect to the broker and assemble the mesh components.
    ///
    /// With `config.mock` set, everything runs against an in-memory broker
    /// and no connection is made. Otherwise a failure to reach the broker is
    /// returned as [`MeshError::Connection`] and is fatal to the caller: no
    /// component of the mesh can operate without it.
    pub async fn connect(config: MeshConfig) -> Result<Self> {
        config.validate()?;
        let broker: Arc<dyn BrokerTransport> = if config.mock {
            Arc::new(MockBroker::new())
        } else {
            Arc::new(RedisBroker::connect(&config).await?)
        };
        Ok(Self::with_broker(broker, config))
    }

    /// Assemble the mesh over an existing broker handle.
    pub fn with_broker(broker: Arc<dyn BrokerTransport>, config: MeshConfig) -> Self {
        let registry = Arc::new(ServiceRegistry::new(broker.clone(), config));
        Self {
            rpc: RpcEngine::new(broker.clone()),
            resolver: ServiceResolver::new(registry.clone()),
            registry,
            broker,
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn rpc(&self) -> &RpcEngine {
        &self.rpc
    }

    pub fn resolver(&self) -> &ServiceResolver {
        &self.resolver
    }

    pub fn broker(&self) -> &Arc<dyn BrokerTransport> {
        &self.broker
    }

    /// Register a service; see [`ServiceRegistry::register`].
    pub async fn register(
        &self,
        name: &str,
        port: u16,
        routes: Vec<Route>,
    ) -> Result<Arc<Service>> {
        self.registry.register(name, port, routes).await
    }

    /// Remove a locally-registered service; see [`ServiceRegistry::remove`].
    pub async fn remove(&self, service: &Service) -> Result<()> {
        self.registry.remove(service).await
    }

    /// Snapshot of all live services; see [`ServiceRegistry::list`].
    pub async fn list_services(&self) -> Result<Vec<Service>> {
        self.registry.list().await
    }

    /// Publish an out-of-band reply to an inbound envelope.
    ///
    /// Handlers that return a payload get their reply published by the
    /// receive loop; this is for callers holding an envelope outside that
    /// path.
    pub async fn respond(&self, inbound: &Envelope, payload: serde_json::Value) -> Result<()> {
        let reply = inbound.reply(payload, None)?;
        self.broker.publish(&reply.channel, &reply.to_bytes()?).await
    }
}
