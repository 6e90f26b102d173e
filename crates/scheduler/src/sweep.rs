//! Expiry sweep for completed artifacts.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::scheduler::Scheduler;

/// Outcome of one sweep pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Keys whose artifact and record were removed.
    pub removed: Vec<String>,
    /// Keys that could not be removed, with the reason.
    pub failures: Vec<(String, String)>,
}

impl Scheduler {
    /// Removes completed artifacts whose validity has run out.
    pub async fn sweep_expired(&self) -> SweepReport {
        self.sweep_expired_at(Utc::now()).await
    }

    /// Same as [`sweep_expired`](Self::sweep_expired) with an explicit clock.
    ///
    /// A failure on one record never stops the others from being processed.
    pub async fn sweep_expired_at(&self, now: DateTime<Utc>) -> SweepReport {
        let _state = self.inner.state.lock().await;
        let mut report = SweepReport::default();

        for record in self.inner.store.all() {
            if !record.is_expired(now) {
                continue;
            }
            let key = record.resource_key;

            if let Some(name) = &record.local_artifact_name {
                match self.inner.artifacts.remove(name) {
                    Ok(true) => {}
                    Ok(false) => warn!(key = %key, artifact = %name, "expired artifact already missing"),
                    Err(e) => {
                        warn!(key = %key, error = %e, "failed to remove expired artifact");
                        report.failures.push((key, e.to_string()));
                        continue;
                    }
                }
            }

            match self.inner.store.delete(&key) {
                Ok(_) => {
                    info!(key = %key, "expired transfer removed");
                    report.removed.push(key);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "failed to delete expired record");
                    report.failures.push((key, e.to_string()));
                }
            }
        }
        report
    }

    /// Runs [`sweep_expired`](Self::sweep_expired) every `interval` until
    /// [`shutdown`](Self::shutdown). The first pass runs immediately.
    pub fn spawn_periodic_sweep(&self, interval: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = this.inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = this.sweep_expired().await;
                        debug!(
                            removed = report.removed.len(),
                            failures = report.failures.len(),
                            "periodic sweep finished"
                        );
                    }
                }
            }
        })
    }
}
