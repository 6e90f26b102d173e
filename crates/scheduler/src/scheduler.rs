use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use vidvault_protocol::{ErrorKind, TransferRecord, TransferState};
use vidvault_storage::{ArtifactDir, StorageProbe, distinct_name_for, name_for};
use vidvault_transfer::{
    RECORDS_FILE_NAME, RESUME_INDEX_FILE_NAME, ResumeTokenCache, TransferStore,
};
use vidvault_transport::{TaskHandle, TransportEvent, TransportFailure, TransportSession};

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::notifier::Notifier;

/// Result of [`Scheduler::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Admitted and started from byte zero.
    Started,
    /// Admitted and continued from a stored resume token.
    Resumed,
    /// All slots busy; waiting in the FIFO queue.
    Queued,
    /// Already Active or Queued; nothing changed.
    AlreadyLive,
    /// The artifact is already present; nothing changed.
    AlreadyCompleted,
    /// The transport refused the transfer; the record is now Failed.
    Failed,
}

/// Transfer scheduler.
///
/// Cheap to clone; all clones share one state. Construct with
/// [`launch`](Self::launch).
#[derive(Clone)]
pub struct Scheduler {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) config: SchedulerConfig,
    pub(crate) transport: Arc<dyn TransportSession>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) probe: Arc<dyn StorageProbe>,
    pub(crate) store: TransferStore,
    pub(crate) tokens: ResumeTokenCache,
    pub(crate) artifacts: ArtifactDir,
    /// Serialization point for every state transition.
    pub(crate) state: Mutex<State>,
    pub(crate) pauses_settled: Notify,
    pub(crate) shutdown: CancellationToken,
}

/// In-memory bookkeeping guarded by [`Inner::state`].
#[derive(Debug, Default)]
pub(crate) struct State {
    pub(crate) queue: VecDeque<String>,
    /// Key to the task currently doing its transfer.
    pub(crate) bound: HashMap<String, TaskHandle>,
    /// Reverse of `bound`; events for handles not in here are stale.
    pub(crate) owners: HashMap<TaskHandle, String>,
    /// Pauses still waiting for the transport to hand back a token.
    pub(crate) pausing: HashMap<String, TaskHandle>,
}

impl State {
    pub(crate) fn bind(&mut self, key: &str, handle: TaskHandle) {
        self.bound.insert(key.to_string(), handle);
        self.owners.insert(handle, key.to_string());
    }

    pub(crate) fn unbind(&mut self, key: &str) -> Option<TaskHandle> {
        let handle = self.bound.remove(key)?;
        self.owners.remove(&handle);
        Some(handle)
    }
}

impl Scheduler {
    /// Opens persisted state, reconciles it with the transport and starts
    /// consuming transport events.
    ///
    /// Reconciliation finishes before this returns, so no `start` can race
    /// it.
    pub async fn launch(
        config: SchedulerConfig,
        transport: Arc<dyn TransportSession>,
        notifier: Arc<dyn Notifier>,
        probe: Arc<dyn StorageProbe>,
    ) -> Result<Self, SchedulerError> {
        let artifacts = ArtifactDir::new(&config.artifact_dir);
        artifacts.ensure()?;

        let store = TransferStore::open(config.state_dir.join(RECORDS_FILE_NAME))?;
        if store.recovered_from_corrupt() {
            warn!(
                error = %ErrorKind::PersistenceCorrupt(store.path().display().to_string()),
                "continuing without prior transfer state"
            );
        }
        let tokens = ResumeTokenCache::open(
            config.state_dir.join(RESUME_INDEX_FILE_NAME),
            artifacts.root().to_path_buf(),
        )?;
        let events = transport
            .take_events()
            .ok_or(SchedulerError::EventsUnavailable)?;

        let scheduler = Self {
            inner: Arc::new(Inner {
                config,
                transport,
                notifier,
                probe,
                store,
                tokens,
                artifacts,
                state: Mutex::new(State::default()),
                pauses_settled: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        };

        let report = scheduler.reattach().await;
        info!(
            records = scheduler.inner.store.len(),
            reattached = report.reattached.len(),
            "scheduler launched"
        );

        tokio::spawn(scheduler.clone().run_events(events));
        Ok(scheduler)
    }

    async fn run_events(self, mut events: mpsc::Receiver<TransportEvent>) {
        loop {
            tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }
        debug!("transport event loop stopped");
    }

    /// Requests a transfer for `key`.
    ///
    /// Fails with [`SchedulerError::InsufficientSpace`] (after notifying)
    /// when the artifact volume is below the reserve; no record is created
    /// or changed in that case.
    ///
    /// A failed record write is logged and does not undo the transition.
    pub async fn start(&self, key: &str) -> Result<StartOutcome, SchedulerError> {
        validate_key(key)?;

        let reserve = self.inner.config.space_reserve_bytes;
        if !self.inner.probe.has_reserve(self.inner.artifacts.root(), reserve) {
            warn!(key, reserve, "not enough free space to start transfer");
            self.inner.notifier.on_insufficient_space(key);
            return Err(SchedulerError::InsufficientSpace);
        }

        let mut state = self.inner.state.lock().await;
        let existing = self.inner.store.get(key);
        match existing.as_ref().map(|r| r.state) {
            Some(TransferState::Active | TransferState::Queued) => {
                return Ok(StartOutcome::AlreadyLive);
            }
            Some(TransferState::Completed) => return Ok(StartOutcome::AlreadyCompleted),
            _ => {}
        }

        if let Some(handle) = state.pausing.remove(key) {
            debug!(key, %handle, "superseding unsettled pause");
            self.inner.pauses_settled.notify_waiters();
        }

        let record = existing.unwrap_or_else(|| TransferRecord::new(key, Utc::now()));
        if state.bound.len() < self.inner.config.concurrency() {
            return Ok(self.admit(&mut state, record));
        }

        let mut record = record;
        record.mark_queued();
        state.queue.push_back(key.to_string());
        self.save(record);
        info!(key, position = state.queue.len(), "transfer queued");
        Ok(StartOutcome::Queued)
    }

    /// Same as [`start`](Self::start); a stored resume token is preferred.
    pub async fn resume(&self, key: &str) -> Result<StartOutcome, SchedulerError> {
        self.start(key).await
    }

    /// Discards any resume token and starts `key` again from byte zero.
    pub async fn retry(&self, key: &str) -> Result<StartOutcome, SchedulerError> {
        validate_key(key)?;
        {
            let _state = self.inner.state.lock().await;
            if let Some(mut record) = self.inner.store.get(key) {
                if record.state.is_live() {
                    return Ok(StartOutcome::AlreadyLive);
                }
                self.discard_token(key);
                if record.state == TransferState::Paused {
                    record.mark_idle(false);
                    self.save(record);
                }
            }
        }
        self.start(key).await
    }

    /// Pauses an Active transfer.
    ///
    /// The slot is freed and the next queued key admitted immediately. The
    /// record becomes Paused once the transport hands back a resume token;
    /// without a token it stays NotStarted and the next start begins from
    /// zero.
    pub async fn pause(&self, key: &str) -> Result<(), SchedulerError> {
        let mut state = self.inner.state.lock().await;
        let mut record = self
            .inner
            .store
            .get(key)
            .ok_or_else(|| SchedulerError::NotFound(key.to_string()))?;
        let handle = match (record.state, state.bound.get(key)) {
            (TransferState::Active, Some(handle)) => *handle,
            _ => return Err(SchedulerError::NotActive(key.to_string())),
        };

        state.unbind(key);
        state.pausing.insert(key.to_string(), handle);
        record.mark_idle(false);
        self.save(record);
        info!(key, %handle, "pausing transfer");

        self.admit_next(&mut state);
        drop(state);

        let this = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let token = this.inner.transport.cancel(handle).await;
            this.settle_pause(&key, handle, token).await;
        });
        Ok(())
    }

    /// Pauses every Active transfer. Returns how many were paused.
    ///
    /// Queued keys are dropped from the queue first so that freed slots
    /// are not refilled.
    pub async fn pause_all(&self) -> usize {
        let mut keys: Vec<String> = {
            let mut state = self.inner.state.lock().await;
            let queued: Vec<String> = state.queue.drain(..).collect();
            for key in &queued {
                if let Some(mut record) = self.inner.store.get(key) {
                    record.mark_idle(false);
                    self.save(record);
                }
            }
            state.bound.keys().cloned().collect()
        };
        keys.sort();

        let mut paused = 0;
        for key in keys {
            match self.pause(&key).await {
                Ok(()) => paused += 1,
                Err(e) => debug!(key = %key, error = %e, "skipped during pause-all"),
            }
        }
        paused
    }

    /// Waits until every pending pause has settled.
    pub async fn wait_for_pauses(&self) {
        loop {
            let notified = self.inner.pauses_settled.notified();
            if self.pending_pauses().await == 0 {
                return;
            }
            notified.await;
        }
    }

    async fn settle_pause(&self, key: &str, handle: TaskHandle, token: Option<Vec<u8>>) {
        let mut state = self.inner.state.lock().await;
        if state.pausing.get(key) != Some(&handle) {
            debug!(key, %handle, "pause superseded, discarding token");
            if let Some(blob) = token {
                self.inner.transport.release_token(&blob);
            }
            return;
        }
        state.pausing.remove(key);

        match (self.inner.store.get(key), token) {
            (Some(mut record), Some(blob)) if record.state == TransferState::NotStarted => {
                match self.inner.tokens.store(key, &blob) {
                    Ok(file) => {
                        record.mark_paused(file);
                        if let Err(e) = self.inner.store.upsert(record) {
                            warn!(key, error = %e, "failed to persist paused record");
                        }
                        info!(key, "transfer paused");
                    }
                    Err(e) => {
                        warn!(key, error = %e, "failed to store resume token");
                        self.inner.transport.release_token(&blob);
                    }
                }
            }
            (_, Some(blob)) => self.inner.transport.release_token(&blob),
            (_, None) => info!(key, "transfer stopped without resume token"),
        }

        drop(state);
        self.inner.pauses_settled.notify_waiters();
    }

    /// Stops `key` wherever it is and forgets its resume token.
    ///
    /// Completed artifacts are left alone.
    pub async fn cancel(&self, key: &str) -> Result<(), SchedulerError> {
        let mut state = self.inner.state.lock().await;

        let handle = state.unbind(key);
        if let Some(handle) = handle {
            let transport = Arc::clone(&self.inner.transport);
            tokio::spawn(async move {
                if let Some(blob) = transport.cancel(handle).await {
                    transport.release_token(&blob);
                }
            });
        }
        let pending = state.pausing.remove(key).is_some();
        state.queue.retain(|k| k != key);
        self.discard_token(key);

        if let Some(mut record) = self.inner.store.get(key) {
            if record.state != TransferState::Completed {
                record.mark_idle(true);
                self.save(record);
            }
        }
        info!(key, "transfer cancelled");

        if handle.is_some() {
            self.admit_next(&mut state);
        }
        drop(state);
        if pending {
            self.inner.pauses_settled.notify_waiters();
        }
        Ok(())
    }

    /// Cancels `key`, deletes its artifact and forgets the record.
    ///
    /// Returns `false` if no record existed.
    pub async fn delete(&self, key: &str) -> Result<bool, SchedulerError> {
        self.cancel(key).await?;

        let _state = self.inner.state.lock().await;
        let Some(record) = self.inner.store.get(key) else {
            return Ok(false);
        };
        if let Some(name) = &record.local_artifact_name {
            if !self.inner.artifacts.remove(name)? {
                warn!(key, artifact = %name, "artifact already missing");
            }
        }
        self.inner.store.delete(key)?;
        info!(key, "transfer deleted");
        Ok(true)
    }

    pub fn record(&self, key: &str) -> Option<TransferRecord> {
        self.inner.store.get(key)
    }

    /// All records, oldest first.
    pub fn records(&self) -> Vec<TransferRecord> {
        self.inner.store.all()
    }

    /// Keys waiting for a slot, in admission order.
    pub async fn queued(&self) -> Vec<String> {
        self.inner.state.lock().await.queue.iter().cloned().collect()
    }

    pub async fn active_count(&self) -> usize {
        self.inner.state.lock().await.bound.len()
    }

    /// Number of pauses still waiting for a token.
    pub async fn pending_pauses(&self) -> usize {
        self.inner.state.lock().await.pausing.len()
    }

    pub fn artifacts(&self) -> &ArtifactDir {
        &self.inner.artifacts
    }

    /// Writes the record store and resume index to disk.
    pub async fn flush(&self) -> Result<(), SchedulerError> {
        let _state = self.inner.state.lock().await;
        self.inner.store.flush()?;
        self.inner.tokens.flush()?;
        debug!("scheduler state flushed");
        Ok(())
    }

    /// Stops the event loop and periodic sweep.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Binds `record` to a new transport task.
    fn admit(&self, state: &mut State, mut record: TransferRecord) -> StartOutcome {
        let key = record.resource_key.clone();
        let transport = &self.inner.transport;

        let token = match self.inner.tokens.load(&key) {
            Ok(token) => token,
            Err(e) => {
                warn!(key = %key, error = %e, "failed to read resume token");
                None
            }
        };

        let mut resumed = false;
        let begun = match token {
            Some(blob) => {
                if let Err(e) = self.inner.tokens.evict(&key) {
                    warn!(key = %key, error = %e, "failed to evict consumed resume token");
                }
                match transport.begin_from_token(&blob, &key) {
                    Ok(handle) => {
                        resumed = true;
                        Ok(handle)
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "resume token rejected, starting fresh");
                        transport.release_token(&blob);
                        transport.begin_fresh(&key, &key)
                    }
                }
            }
            None => transport.begin_fresh(&key, &key),
        };

        match begun {
            Ok(handle) => {
                record.mark_active(!resumed);
                state.bind(&key, handle);
                self.save(record);
                info!(key = %key, %handle, resumed, "transfer admitted");
                if resumed {
                    StartOutcome::Resumed
                } else {
                    StartOutcome::Started
                }
            }
            Err(e) => {
                warn!(key = %key, error = %e, "transport refused transfer");
                record.mark_failed(true);
                self.save(record);
                self.inner
                    .notifier
                    .on_failed(&key, &ErrorKind::Transport(e.to_string()));
                StartOutcome::Failed
            }
        }
    }

    /// Admits queued keys in FIFO order while slots are free.
    fn admit_next(&self, state: &mut State) {
        while state.bound.len() < self.inner.config.concurrency() {
            let Some(key) = state.queue.pop_front() else {
                break;
            };
            let Some(record) = self.inner.store.get(&key) else {
                continue;
            };
            if record.state != TransferState::Queued {
                continue;
            }
            self.admit(state, record);
        }
    }

    /// Applies one transport event. Events from superseded tasks are dropped.
    pub(crate) async fn handle_event(&self, event: TransportEvent) {
        let mut state = self.inner.state.lock().await;
        let handle = event.handle();
        let Some(key) = state.owners.get(&handle).cloned() else {
            debug!(%handle, "ignoring stale transport event");
            if let TransportEvent::Completed { location, .. } = &event {
                remove_file_quietly(location);
            }
            return;
        };

        match event {
            TransportEvent::Progress {
                bytes_written,
                bytes_expected,
                ..
            } => self.on_progress(&key, bytes_written, bytes_expected),
            TransportEvent::Completed { location, .. } => {
                state.unbind(&key);
                self.on_completed(&key, &location);
                self.admit_next(&mut state);
            }
            TransportEvent::Failed { failure, .. } => {
                state.unbind(&key);
                self.on_failed(&key, failure);
                self.admit_next(&mut state);
            }
        }
    }

    fn on_progress(&self, key: &str, written: u64, expected: Option<u64>) {
        let Some(expected) = expected.filter(|e| *e > 0) else {
            return;
        };
        let Some(mut record) = self.inner.store.get(key) else {
            return;
        };
        record.set_progress((written as f64 / expected as f64) as f32);
        let fraction = record.progress;
        if let Err(e) = self.inner.store.upsert(record) {
            warn!(key, error = %e, "failed to persist progress");
        }
        self.inner.notifier.on_progress(key, fraction);
    }

    fn on_completed(&self, key: &str, location: &Path) {
        let Some(mut record) = self.inner.store.get(key) else {
            remove_file_quietly(location);
            return;
        };
        let name = self.artifact_name(key);

        match self.inner.artifacts.install(location, &name) {
            Ok(path) => {
                record.mark_completed(name.clone(), self.inner.config.validity());
                self.discard_token(key);
                if let Err(e) = self.inner.store.upsert(record) {
                    warn!(key, error = %e, "failed to persist completed record");
                }
                info!(key, path = %path.display(), "{name} is ready to watch");
                self.inner.notifier.on_completed(key, &path);
            }
            Err(e) => {
                warn!(key, error = %e, "failed to move artifact into place");
                remove_file_quietly(location);
                record.mark_failed(true);
                if let Err(e) = self.inner.store.upsert(record) {
                    warn!(key, error = %e, "failed to persist failed record");
                }
                self.inner
                    .notifier
                    .on_failed(key, &ErrorKind::MoveFailed(e.to_string()));
            }
        }
    }

    /// File name for the artifact of `key`.
    ///
    /// A file left behind by no record is replaced; a name held by another
    /// record's artifact is never reused.
    fn artifact_name(&self, key: &str) -> String {
        let name = name_for(key);
        let taken = self.inner.store.all().into_iter().any(|r| {
            r.resource_key != key && r.local_artifact_name.as_deref() == Some(name.as_str())
        });
        if taken {
            let distinct = distinct_name_for(key);
            debug!(key, name = %name, distinct = %distinct, "artifact name already in use");
            distinct
        } else {
            name
        }
    }

    fn on_failed(&self, key: &str, failure: TransportFailure) {
        let Some(mut record) = self.inner.store.get(key) else {
            return;
        };
        let error = match failure {
            TransportFailure::Cancelled => {
                debug!(key, "transfer cancelled by transport");
                record.mark_idle(false);
                None
            }
            TransportFailure::Timeout => {
                record.mark_failed(false);
                Some(ErrorKind::Timeout)
            }
            TransportFailure::Other(msg) => {
                record.mark_failed(true);
                Some(ErrorKind::Transport(msg))
            }
        };
        if let Err(e) = self.inner.store.upsert(record) {
            warn!(key, error = %e, "failed to persist failed record");
        }
        if let Some(error) = error {
            warn!(key, %error, "transfer failed");
            self.inner.notifier.on_failed(key, &error);
        }
    }

    /// Writes `record` through the store.
    ///
    /// The in-memory copy is updated even when the write fails, so the
    /// scheduler's bookkeeping stays in step with it; the next successful
    /// write or [`flush`](Self::flush) puts it on disk.
    pub(crate) fn save(&self, record: TransferRecord) {
        let key = record.resource_key.clone();
        if let Err(e) = self.inner.store.upsert(record) {
            warn!(key = %key, error = %e, "failed to persist transfer record");
        }
    }

    /// Evicts the stored token for `key` and lets the transport clean up
    /// after it.
    pub(crate) fn discard_token(&self, key: &str) {
        let blob = self.inner.tokens.load(key).ok().flatten();
        match self.inner.tokens.evict(key) {
            Ok(_) => {
                if let Some(blob) = blob {
                    self.inner.transport.release_token(&blob);
                }
            }
            Err(e) => warn!(key, error = %e, "failed to evict resume token"),
        }
    }
}

/// Accepts absolute http(s) URLs only.
fn validate_key(key: &str) -> Result<(), SchedulerError> {
    match Url::parse(key) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => Ok(()),
        _ => Err(SchedulerError::InvalidKey(key.to_string())),
    }
}

fn remove_file_quietly(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove file"),
    }
}
