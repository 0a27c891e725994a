use std::sync::Arc;

use rand::Rng;
use tracing::debug;

use crate::error::{MeshError, Result};
use crate::registry::{Service, ServiceRegistry};

/// Maps a (service name, route path) pair to one live candidate instance.
///
/// Selection among matches is uniform random — a simple, non-weighted policy
/// with no liveness awareness beyond the presence-key filter `list` already
/// applies. The weak randomness is fine for picking among equals and must
/// not be reused for anything security-sensitive.
#[derive(Debug, Clone)]
pub struct ServiceResolver {
    registry: Arc<ServiceRegistry>,
}

impl ServiceResolver {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self { registry }
    }

    /// Resolve `(name, path)` to a single live instance.
    ///
    /// Filters the current broker snapshot to instances of `name` whose
    /// route set matches `path` (exact or prefix). No fallback and no
    /// partial match: an empty candidate set is `NotFound`.
    pub async fn resolve(&self, name: &str, path: &str) -> Result<Service> {
        let mut candidates: Vec<Service> = self
            .registry
            .list()
            .await?
            .into_iter()
            .filter(|service| service.name == name && service.matches_route(path))
            .collect();

        if candidates.is_empty() {
            return Err(MeshError::NotFound {
                service: name.to_string(),
                route: path.to_string(),
            });
        }

        let index = rand::thread_rng().gen_range(0..candidates.len());
        let chosen = candidates.swap_remove(index);
        debug!(service = %chosen.key(), path, "resolved");
        Ok(chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshConfig;
    use crate::mock::MockBroker;
    use crate::registry::Route;
    use std::collections::HashSet;

    async fn mesh_with_instances(count: usize) -> (ServiceResolver, Arc<ServiceRegistry>) {
        let broker = Arc::new(MockBroker::new());
        let registry = Arc::new(ServiceRegistry::new(
            broker,
            MeshConfig {
                mock: true,
                ..Default::default()
            },
        ));
        for _ in 0..count {
            registry
                .register("echo", 0, vec![Route::new("/echo")])
                .await
                .unwrap();
        }
        (ServiceResolver::new(registry.clone()), registry)
    }

    #[tokio::test]
    async fn test_all_instances_are_eventually_selected() {
        let (resolver, _registry) = mesh_with_instances(3).await;
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let service = resolver.resolve("echo", "/echo").await.unwrap();
            seen.insert(service.id);
        }
        assert_eq!(seen.len(), 3, "no instance should be starved");
    }

    #[tokio::test]
    async fn test_no_match_is_not_found() {
        let (resolver, _registry) = mesh_with_instances(1).await;
        assert!(matches!(
            resolver.resolve("unknown", "/echo").await,
            Err(MeshError::NotFound { .. })
        ));
        assert!(matches!(
            resolver.resolve("echo", "/other").await,
            Err(MeshError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_prefix_route_matches() {
        let (resolver, _registry) = mesh_with_instances(1).await;
        let service = resolver.resolve("echo", "/echo/deep/path").await.unwrap();
        assert_eq!(service.name, "echo");
    }
}
