//! # Morpheus Gateway
//!
//! HTTP-facing translation layer for the morpheus mesh: inbound requests are
//! resolved to a live service instance and proxied as correlated RPC calls
//! over the broker. The gateway is stateless per request — every call is an
//! independent resolve-then-RPC cycle with no session or connection
//! affinity.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use morpheus::{Mesh, MeshConfig};
//! use morpheus_gateway::create_router;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> morpheus::Result<()> {
//!     let mesh = Arc::new(Mesh::connect(MeshConfig::from_env()).await?);
//!     let app = create_router(mesh);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!     axum::serve(
//!         listener,
//!         app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
//!     )
//!     .await?;
//!     Ok(())
//! }
//! ```

pub mod router;

pub use router::{create_router, GatewayError, GatewayState};
