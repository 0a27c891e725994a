use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::BrokerTransport;
use crate::config::MeshConfig;
use crate::registry::{write_projections, Service};

/// Spawn the per-service heartbeat task.
///
/// Refreshes the broker projections every `heartbeat_interval` until the
/// service's liveness signal is cancelled. A failed write is logged and the
/// tick skipped; the scheduler never raises an error to the owning service.
/// If the broker stays unavailable the projections lapse via TTL and the
/// service simply becomes invisible to remote readers.
pub(crate) fn spawn_heartbeat(
    broker: Arc<dyn BrokerTransport>,
    config: MeshConfig,
    service: Arc<Service>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(service = %service.key(), "heartbeat started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = write_projections(broker.as_ref(), &config, &service).await {
                        warn!(service = %service.key(), error = %e, "heartbeat write failed, skipping tick");
                    }
                }
            }
        }
        debug!(service = %service.key(), "heartbeat stopped");
    })
}
