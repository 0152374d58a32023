//! Periodic background sweep of expired TTL entries.

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ttl::TtlCache;

const METRIC_CACHE_SWEPT: &str = "tagport_cache_swept_total";

/// Handle to a running sweeper. Dropping it leaves the task running; call
/// [`CleanupHandle::stop`] to shut it down.
#[derive(Debug)]
pub struct CleanupHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl CleanupHandle {
    /// Signal the sweeper and wait until any in-flight sweep has finished.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            warn!(
                target = "tagport::cache",
                error = %err,
                "cache sweeper terminated abnormally"
            );
        }
    }
}

pub fn spawn_cleanup<K, V>(cache: Arc<TtlCache<K, V>>, every: Duration) -> CleanupHandle
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run_cleanup_loop(cache, every, cancel.clone()));
    CleanupHandle { cancel, task }
}

async fn run_cleanup_loop<K, V>(
    cache: Arc<TtlCache<K, V>>,
    every: Duration,
    cancel: CancellationToken,
) where
    K: Eq + Hash,
    V: Clone,
{
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    info!(interval_secs = every.as_secs(), "cache sweeper started");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("cache sweeper shutting down");
                break;
            }
            _ = ticker.tick() => {
                let removed = cache.cleanup();
                if removed > 0 {
                    counter!(METRIC_CACHE_SWEPT).increment(removed as u64);
                    debug!(removed, "cache sweep removed expired entries");
                }
            }
        }
    }
}
