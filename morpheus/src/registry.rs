use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::BrokerTransport;
use crate::config::MeshConfig;
use crate::error::{MeshError, Result};
use crate::heartbeat::spawn_heartbeat;
use crate::message::{random_id, Envelope};

/// Broker key namespace for all service projections.
pub(crate) const KEY_PREFIX: &str = "morpheus:service:";

pub(crate) fn presence_key(name: &str, id: &str) -> String {
    format!("{KEY_PREFIX}{name}:{id}:presence")
}

pub(crate) fn health_key(name: &str, id: &str) -> String {
    format!("{KEY_PREFIX}{name}:{id}:health")
}

pub(crate) fn routes_key(name: &str, id: &str) -> String {
    format!("{KEY_PREFIX}{name}:{id}:routes")
}

/// Extract `(name, id)` from a presence key.
fn parse_presence_key(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix(KEY_PREFIX)?;
    let mut parts = rest.split(':');
    let name = parts.next()?;
    let id = parts.next()?;
    match parts.next() {
        Some("presence") => Some((name, id)),
        _ => None,
    }
}

/// Type alias for async route handlers.
///
/// A handler receives the inbound envelope and may return a payload; the
/// receive loop publishes it as the reply when the envelope is repliable.
/// Returning `Ok(None)` sends no reply.
pub type RouteHandler = Arc<
    dyn Fn(Envelope) -> Pin<Box<dyn Future<Output = Result<Option<serde_json::Value>>> + Send>>
        + Send
        + Sync,
>;

/// A path-style route exposed by a service.
///
/// A route matches a requested path when the path equals or is prefixed by
/// `path`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Route {
    pub path: String,
    #[serde(skip)]
    pub handler: Option<RouteHandler>,
}

impl Route {
    /// A route with no handler (inbound envelopes for it are dropped).
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            handler: None,
        }
    }

    /// A route served by an async handler.
    pub fn with_handler<F, Fut>(path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<serde_json::Value>>> + Send + 'static,
    {
        Self {
            path: path.into(),
            handler: Some(Arc::new(move |envelope| Box::pin(handler(envelope)))),
        }
    }

    fn matches(&self, path: &str) -> bool {
        path == self.path || path.starts_with(&self.path)
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("path", &self.path)
            .field("handler", &self.handler.as_ref().map(|_| ".."))
            .finish()
    }
}

/// A registered service instance.
///
/// Identity is `(name, id)`. The serialized form is what lands in the broker
/// health record; handlers and the liveness signal stay process-local.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub ip_address: String,
    pub port: u16,
    pub routes: Vec<Route>,
    /// Liveness signal: cancelling it stops the receive loop and heartbeat.
    #[serde(skip, default)]
    pub(crate) cancel: CancellationToken,
}

impl Service {
    /// Instance-specific pub/sub channel, `<name>:<id>`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.name, self.id)
    }

    /// Broadcast channel shared by all instances of this name.
    pub fn broadcast_channel(&self) -> &str {
        &self.name
    }

    /// Whether any registered route matches the requested path.
    pub fn matches_route(&self, path: &str) -> bool {
        self.routes.iter().any(|route| route.matches(path))
    }

    #[cfg(test)]
    pub(crate) fn for_tests(name: &str, id: &str, routes: Vec<Route>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            ip_address: "127.0.0.1".to_string(),
            port: 0,
            routes,
            cancel: CancellationToken::new(),
        }
    }
}

struct ServiceEntry {
    service: Arc<Service>,
    tasks: Vec<JoinHandle<()>>,
}

/// Owns locally-registered services and their broker-backed projections.
///
/// The in-process map is the source of truth for ownership and removal; the
/// broker's presence keys are the source of truth for listing and resolution,
/// so remote readers converge purely through TTL expiry.
pub struct ServiceRegistry {
    broker: Arc<dyn BrokerTransport>,
    config: MeshConfig,
    services: RwLock<HashMap<String, HashMap<String, ServiceEntry>>>,
}

impl ServiceRegistry {
    pub fn new(broker: Arc<dyn BrokerTransport>, config: MeshConfig) -> Self {
        Self {
            broker,
            config,
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Register a service under `name` exposing `routes`.
    ///
    /// Allocates a random instance id, discovers the host's outbound
    /// address, writes the initial projections and spawns the per-service
    /// receive loop and heartbeat task. Fails only on invalid arguments or
    /// an in-process id collision.
    pub async fn register(
        &self,
        name: &str,
        port: u16,
        routes: Vec<Route>,
    ) -> Result<Arc<Service>> {
        if name.is_empty() {
            return Err(MeshError::registration("service name cannot be empty"));
        }
        if name.contains(':') {
            return Err(MeshError::registration(
                "service name cannot contain ':' (reserved as key separator)",
            ));
        }

        let id = random_id();
        let ip_address = match outbound_ip() {
            Ok(ip) => ip.to_string(),
            Err(e) => {
                warn!(error = %e, "outbound address discovery failed, using loopback");
                "127.0.0.1".to_string()
            }
        };

        let service = Arc::new(Service {
            id: id.clone(),
            name: name.to_string(),
            ip_address,
            port,
            routes,
            cancel: CancellationToken::new(),
        });

        let mut services = self.services.write().await;
        let instances = services.entry(name.to_string()).or_default();
        if instances.contains_key(&id) {
            return Err(MeshError::registration(format!(
                "instance id {id} already registered under '{name}'"
            )));
        }

        // Initial projection write; a failure here is not fatal because the
        // heartbeat refreshes the same keys on the next tick.
        if let Err(e) = write_projections(self.broker.as_ref(), &self.config, &service).await {
            warn!(service = %service.key(), error = %e, "initial projection write failed");
        }

        let receive_loop = tokio::spawn(run_receive_loop(
            self.broker.clone(),
            service.clone(),
            service.cancel.clone(),
        ));
        let heartbeat = spawn_heartbeat(
            self.broker.clone(),
            self.config.clone(),
            service.clone(),
            service.cancel.clone(),
        );

        instances.insert(
            id,
            ServiceEntry {
                service: service.clone(),
                tasks: vec![receive_loop, heartbeat],
            },
        );
        info!(service = %service.key(), port, "registered service");
        Ok(service)
    }

    /// Refresh the three broker projections for a service.
    ///
    /// Idempotent and last-write-wins; safe to call concurrently with the
    /// heartbeat for the same service.
    pub async fn update(&self, service: &Service) -> Result<()> {
        write_projections(self.broker.as_ref(), &self.config, service).await
    }

    /// Snapshot of all live services visible on the broker, sorted by id.
    ///
    /// An expired presence key implicitly excludes an instance; a missing or
    /// undecodable health record drops that instance with a warning.
    pub async fn list(&self) -> Result<Vec<Service>> {
        let pattern = format!("{KEY_PREFIX}*:presence");
        let keys = self.broker.scan(&pattern).await?;
        let mut services = Vec::with_capacity(keys.len());
        for key in keys {
            let Some((name, id)) = parse_presence_key(&key) else {
                continue;
            };
            match self.broker.get(&health_key(name, id)).await? {
                Some(record) => match serde_json::from_str::<Service>(&record) {
                    Ok(service) => services.push(service),
                    Err(e) => warn!(key, error = %e, "dropping undecodable health record"),
                },
                None => debug!(key, "presence key without health record"),
            }
        }
        services.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(services)
    }

    /// Remove a locally-registered service.
    ///
    /// Cancels the liveness signal and awaits both background tasks before
    /// returning, so nothing keeps running for a removed service. Broker
    /// projections are left to expire via TTL. Idempotent.
    pub async fn remove(&self, service: &Service) -> Result<()> {
        let entry = {
            let mut services = self.services.write().await;
            let entry = services
                .get_mut(&service.name)
                .and_then(|instances| instances.remove(&service.id));
            if services
                .get(&service.name)
                .is_some_and(|instances| instances.is_empty())
            {
                services.remove(&service.name);
            }
            entry
        };
        let Some(entry) = entry else {
            return Ok(());
        };
        entry.service.cancel.cancel();
        for task in entry.tasks {
            let _ = task.await;
        }
        info!(service = %service.key(), "removed service");
        Ok(())
    }

    /// Number of locally-registered instances.
    pub async fn local_count(&self) -> usize {
        self.services
            .read()
            .await
            .values()
            .map(|instances| instances.len())
            .sum()
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Write the presence, health and routes projections for a service.
pub(crate) async fn write_projections(
    broker: &dyn BrokerTransport,
    config: &MeshConfig,
    service: &Service,
) -> Result<()> {
    let ttl = config.ttl;
    broker
        .set(&presence_key(&service.name, &service.id), &service.id, ttl)
        .await?;
    broker
        .set(
            &health_key(&service.name, &service.id),
            &serde_json::to_string(service)?,
            ttl,
        )
        .await?;
    let paths: Vec<&str> = service.routes.iter().map(|r| r.path.as_str()).collect();
    broker
        .set(
            &routes_key(&service.name, &service.id),
            &serde_json::to_string(&paths)?,
            ttl,
        )
        .await?;
    Ok(())
}

/// Per-service receive loop.
///
/// Subscribes to the instance channel and the name-wide broadcast channel
/// and dispatches one frame at a time until cancelled. Decode and handler
/// failures are logged and the frame dropped; delivery is best-effort,
/// at-most-once.
async fn run_receive_loop(
    broker: Arc<dyn BrokerTransport>,
    service: Arc<Service>,
    cancel: CancellationToken,
) {
    let mut instance_sub = match broker.subscribe(&service.key()).await {
        Ok(sub) => sub,
        Err(e) => {
            warn!(service = %service.key(), error = %e, "failed to subscribe instance channel");
            return;
        }
    };
    let mut broadcast_sub = match broker.subscribe(service.broadcast_channel()).await {
        Ok(sub) => sub,
        Err(e) => {
            warn!(service = %service.key(), error = %e, "failed to subscribe broadcast channel");
            return;
        }
    };

    debug!(service = %service.key(), "receive loop started");
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = instance_sub.recv() => frame,
            frame = broadcast_sub.recv() => frame,
        };
        let Some(frame) = frame else {
            break;
        };
        dispatch(broker.as_ref(), &service, &frame).await;
    }
    debug!(service = %service.key(), "receive loop stopped");
}

async fn dispatch(broker: &dyn BrokerTransport, service: &Service, frame: &[u8]) {
    let envelope = match Envelope::from_bytes(frame) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(service = %service.key(), error = %e, "dropping undecodable frame");
            return;
        }
    };
    let Some(route) = service.routes.iter().find(|r| r.matches(&envelope.route)) else {
        debug!(service = %service.key(), route = %envelope.route, "no matching route");
        return;
    };
    let Some(handler) = route.handler.as_ref() else {
        debug!(service = %service.key(), route = %route.path, "route has no handler");
        return;
    };

    let repliable = !envelope.response_channel.is_empty();
    match handler(envelope.clone()).await {
        Ok(Some(payload)) if repliable => {
            let publish = envelope
                .reply(payload, None)
                .and_then(|reply| Ok((reply.channel.clone(), reply.to_bytes()?)));
            match publish {
                Ok((channel, bytes)) => {
                    if let Err(e) = broker.publish(&channel, &bytes).await {
                        warn!(service = %service.key(), error = %e, "failed to publish reply");
                    }
                }
                Err(e) => warn!(service = %service.key(), error = %e, "failed to build reply"),
            }
        }
        Ok(_) => {}
        Err(e) => {
            warn!(service = %service.key(), route = %envelope.route, error = %e, "handler failed")
        }
    }
}

/// Discover the host's outbound address.
///
/// Connecting a UDP socket to a well-known external endpoint makes the OS
/// pick the default-route local address; no packet is sent.
fn outbound_ip() -> std::io::Result<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBroker;
    use std::time::Duration;

    fn registry() -> (Arc<MockBroker>, ServiceRegistry) {
        let broker = Arc::new(MockBroker::new());
        let config = MeshConfig {
            mock: true,
            ..Default::default()
        };
        let registry = ServiceRegistry::new(broker.clone(), config);
        (broker, registry)
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_names() {
        let (_, registry) = registry();
        assert!(matches!(
            registry.register("", 0, vec![]).await,
            Err(MeshError::Registration { .. })
        ));
        assert!(matches!(
            registry.register("a:b", 0, vec![]).await,
            Err(MeshError::Registration { .. })
        ));
    }

    #[tokio::test]
    async fn test_registered_service_is_listed() {
        let (_, registry) = registry();
        let service = registry
            .register("echo", 8080, vec![Route::new("/echo")])
            .await
            .unwrap();

        let listed = registry.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, service.id);
        assert_eq!(listed[0].name, "echo");
        assert_eq!(listed[0].port, 8080);
        assert_eq!(listed[0].routes.len(), 1);
        assert_eq!(listed[0].routes[0].path, "/echo");

        registry.remove(&service).await.unwrap();
    }

    #[tokio::test]
    async fn test_second_reader_observes_registration() {
        let (broker, registry) = registry();
        let service = registry
            .register("echo", 0, vec![Route::new("/echo")])
            .await
            .unwrap();

        // Independent registry over the same broker.
        let other = ServiceRegistry::new(
            broker.clone(),
            MeshConfig {
                mock: true,
                ..Default::default()
            },
        );
        let listed = other.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, service.id);

        registry.remove(&service).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_projections_alive() {
        let (_, registry) = registry();
        let service = registry
            .register("echo", 0, vec![Route::new("/echo")])
            .await
            .unwrap();

        // Well past the 5s TTL; 2s heartbeats keep refreshing.
        for _ in 0..8 {
            tokio::time::advance(Duration::from_secs(2)).await;
            tokio::task::yield_now().await;
        }
        assert_eq!(registry.list().await.unwrap().len(), 1);

        registry.remove(&service).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_projections_lapse_after_removal() {
        let (broker, registry) = registry();
        let service = registry
            .register("echo", 0, vec![Route::new("/echo")])
            .await
            .unwrap();
        registry.remove(&service).await.unwrap();
        assert_eq!(registry.local_count().await, 0);

        // No explicit delete: keys are left to TTL.
        assert_eq!(registry.list().await.unwrap().len(), 1);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(registry.list().await.unwrap().is_empty());

        // Both background tasks are gone: nothing is subscribed any more.
        assert_eq!(broker.subscriber_count(&service.key()).await, 0);
        assert_eq!(broker.subscriber_count("echo").await, 0);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (_, registry) = registry();
        let service = registry.register("echo", 0, vec![]).await.unwrap();
        registry.remove(&service).await.unwrap();
        registry.remove(&service).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_is_idempotent() {
        let (broker, registry) = registry();
        let service = registry
            .register("echo", 0, vec![Route::new("/echo")])
            .await
            .unwrap();

        registry.update(&service).await.unwrap();
        let presence_once = broker
            .get(&presence_key("echo", &service.id))
            .await
            .unwrap();
        let health_once = broker.get(&health_key("echo", &service.id)).await.unwrap();
        let routes_once = broker.get(&routes_key("echo", &service.id)).await.unwrap();

        registry.update(&service).await.unwrap();
        assert_eq!(
            broker
                .get(&presence_key("echo", &service.id))
                .await
                .unwrap(),
            presence_once
        );
        assert_eq!(
            broker.get(&health_key("echo", &service.id)).await.unwrap(),
            health_once
        );
        assert_eq!(
            broker.get(&routes_key("echo", &service.id)).await.unwrap(),
            routes_once
        );
        assert_eq!(routes_once.as_deref(), Some(r#"["/echo"]"#));

        registry.remove(&service).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_skips_undecodable_health_records() {
        let (broker, registry) = registry();
        let service = registry.register("echo", 0, vec![]).await.unwrap();
        broker
            .set(
                &presence_key("ghost", "g1"),
                "g1",
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        broker
            .set(
                &health_key("ghost", "g1"),
                "not json",
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        let listed = registry.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, service.id);

        registry.remove(&service).await.unwrap();
    }

    #[test]
    fn test_parse_presence_key() {
        assert_eq!(
            parse_presence_key("morpheus:service:echo:i1:presence"),
            Some(("echo", "i1"))
        );
        assert_eq!(parse_presence_key("morpheus:service:echo:i1:health"), None);
        assert_eq!(parse_presence_key("unrelated"), None);
    }

    #[test]
    fn test_route_prefix_matching() {
        let service = Service::for_tests("api", "i1", vec![Route::new("/api")]);
        assert!(service.matches_route("/api"));
        assert!(service.matches_route("/api/users"));
        assert!(!service.matches_route("/health"));
    }
}
