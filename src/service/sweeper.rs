use crate::context::OpContext;
use crate::registry::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Periodic `delete_expired` over every registered backend.
pub struct Sweeper {
    registry: Arc<Registry>,
    interval: Duration,
    timeout: Duration,
}

impl Sweeper {
    pub fn new(registry: Arc<Registry>, interval: Duration, timeout: Duration) -> Self {
        Self {
            registry,
            interval,
            timeout,
        }
    }

    /// One pass over all backends. A failing backend is logged and skipped.
    /// Returns how many credentials were reclaimed.
    pub async fn sweep_once(&self, shutdown: &CancellationToken) -> usize {
        let mut reclaimed = 0;
        for (name, backend) in self.registry.entries() {
            let ctx = OpContext::with_cancellation(shutdown.child_token()).with_timeout(self.timeout);
            match backend.delete_expired(&ctx).await {
                Ok(dbs) if dbs.is_empty() => debug!(backend = %name, "nothing to reclaim"),
                Ok(dbs) => {
                    info!(backend = %name, count = dbs.len(), "sweeper reclaimed expired databases");
                    reclaimed += dbs.len();
                }
                Err(e) => warn!(backend = %name, error = %e, "sweep failed"),
            }
        }
        reclaimed
    }

    /// Run until `shutdown` is cancelled. The first pass starts immediately.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval = ?self.interval, "sweeper started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        self.sweep_once(&shutdown).await;
                    }
                }
            }
            info!("sweeper stopped");
        })
    }
}
