//! Reconciliation of persisted state with the transport after a relaunch.

use std::sync::Arc;

use tracing::{info, warn};

use vidvault_protocol::TransferState;
use vidvault_transport::TaskHandle;

use crate::scheduler::Scheduler;

/// What [`Scheduler::launch`] changed while reconciling.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReattachReport {
    /// Keys re-bound to a transport task that survived the relaunch.
    pub reattached: Vec<String>,
    /// Paused keys whose resume file had gone missing.
    pub lost_tokens: Vec<String>,
    /// Tokens dropped because no record refers to them.
    pub orphaned_tokens: usize,
    /// Transport tasks cancelled because no record claims them.
    pub cancelled_tasks: usize,
}

impl Scheduler {
    /// Runs once from `launch`, before any caller can reach the scheduler.
    pub(crate) async fn reattach(&self) -> ReattachReport {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        let mut report = ReattachReport::default();

        for mut record in inner.store.all() {
            if record.state == TransferState::Paused && !inner.tokens.contains(&record.resource_key)
            {
                warn!(key = %record.resource_key, "resume token missing, transfer will restart");
                record.mark_idle(false);
                report.lost_tokens.push(record.resource_key.clone());
                self.save(record);
            }
        }

        for key in inner.tokens.keys() {
            if inner.store.get(&key).is_none() {
                self.discard_token(&key);
                report.orphaned_tokens += 1;
            }
        }
        match inner.tokens.prune_orphans() {
            Ok(n) => report.orphaned_tokens += n,
            Err(e) => warn!(error = %e, "failed to prune resume files"),
        }

        for task in inner.transport.in_flight() {
            let claimable = inner
                .store
                .get(&task.tag)
                .filter(|r| r.state != TransferState::Completed)
                .filter(|_| !state.bound.contains_key(&task.tag))
                .filter(|_| state.bound.len() < inner.config.concurrency());

            match claimable {
                Some(mut record) => {
                    self.discard_token(&task.tag);
                    record.mark_active(false);
                    state.bind(&task.tag, task.handle);
                    self.save(record);
                    info!(key = %task.tag, handle = %task.handle, "reattached in-flight transfer");
                    report.reattached.push(task.tag);
                }
                None => {
                    warn!(tag = %task.tag, handle = %task.handle, "cancelling unclaimed transport task");
                    cancel_detached(Arc::clone(&inner.transport), task.handle);
                    report.cancelled_tasks += 1;
                }
            }
        }

        if report != ReattachReport::default() {
            info!(
                reattached = report.reattached.len(),
                lost_tokens = report.lost_tokens.len(),
                orphaned_tokens = report.orphaned_tokens,
                cancelled_tasks = report.cancelled_tasks,
                "reconciled persisted state"
            );
        }
        report
    }
}

fn cancel_detached(transport: Arc<dyn vidvault_transport::TransportSession>, handle: TaskHandle) {
    tokio::spawn(async move {
        if let Some(blob) = transport.cancel(handle).await {
            transport.release_token(&blob);
        }
    });
}
