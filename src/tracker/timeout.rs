//! Deadline enforcement for tracked publishes

use super::correlator::{PendingPublish, ReplyCorrelator};
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{debug, warn};

/// Evicts publishes whose cloud reply has not arrived in time
pub struct ReplyTimeout {
    correlator: Arc<ReplyCorrelator>,
    max_age: Duration,
    check_interval: Duration,
}

impl ReplyTimeout {
    /// Create a timeout sweeper for the given correlator
    pub fn new(correlator: Arc<ReplyCorrelator>, max_age: Duration) -> Self {
        Self {
            correlator,
            max_age,
            check_interval: Duration::from_millis(1000), // Check every second
        }
    }

    pub fn with_check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Cancel every publish older than the deadline
    ///
    /// Topic records whose accept never arrived are forgotten on the same
    /// deadline.
    pub async fn sweep(&self) -> Vec<PendingPublish> {
        let pruned = self.correlator.prune_correlations(self.max_age).await;
        if pruned > 0 {
            debug!("[TRACKER] Forgot {} unaccepted correlations", pruned);
        }

        let mut expired = Vec::new();

        for handle in self.correlator.stale(self.max_age).await {
            // Reply may have landed between listing and cancelling
            if let Some(publish) = self.correlator.cancel(handle).await {
                warn!(
                    "[TRACKER] No reply for {} ({}) after {:?}; dropped",
                    publish.description, publish.command, self.max_age
                );
                expired.push(publish);
            }
        }

        expired
    }

    /// Start the timeout monitoring loop
    pub async fn run(&self) {
        let mut ticker = interval(self.check_interval);

        loop {
            ticker.tick().await;

            let expired = self.sweep().await;
            if !expired.is_empty() {
                debug!("[TRACKER] Cleaned up {} expired publishes", expired.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use device_cloud_shared::{now_ms, TransportId};
    use serde_json::json;

    #[tokio::test]
    async fn test_sweep_evicts_only_old_entries() {
        let correlator = Arc::new(ReplyCorrelator::new());

        let mut old = PendingPublish::new(TransportId(1), 1, "log.publish", "old", json!({}));
        old.timestamp_ms = now_ms() - 10_000;
        correlator.track(old).await;
        correlator
            .track(PendingPublish::new(TransportId(2), 1, "log.publish", "new", json!({})))
            .await;

        let timeout = ReplyTimeout::new(correlator.clone(), Duration::from_secs(5));
        let expired = timeout.sweep().await;

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].description, "old");
        assert_eq!(correlator.pending_count().await, 1);
        assert!(timeout.sweep().await.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_keeps_fresh_correlations() {
        let correlator = Arc::new(ReplyCorrelator::new());
        correlator.assign_correlation(TransportId(4), 2).await;

        let timeout = ReplyTimeout::new(correlator.clone(), Duration::from_secs(5));
        timeout.sweep().await;
        assert_eq!(correlator.correlation_count().await, 1);

        let timeout = ReplyTimeout::new(correlator.clone(), Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(5)).await;
        timeout.sweep().await;
        assert_eq!(correlator.correlation_count().await, 0);
    }
}
