//! Scripted collaborators for scheduler tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use tokio::sync::{Semaphore, mpsc};

use vidvault_protocol::{ErrorKind, TransferState};
use vidvault_storage::StorageProbe;
use vidvault_transport::{
    BoxFuture, InFlightTask, TaskHandle, TransportError, TransportEvent, TransportFailure,
    TransportSession,
};

use crate::config::SchedulerConfig;
use crate::notifier::{Notifier, TransferEvent};
use crate::scheduler::Scheduler;

pub(crate) fn key(i: usize) -> String {
    format!("https://cdn.example.com/videos/clip-{i}.mp4")
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Begin {
    Fresh(String),
    Token(Vec<u8>),
}

/// In-memory transport; events are injected with `Scheduler::handle_event`.
pub(crate) struct MockTransport {
    next: AtomicU64,
    begins: Mutex<Vec<Begin>>,
    in_flight: Mutex<Vec<InFlightTask>>,
    cancel_token: Mutex<Option<Vec<u8>>>,
    cancelled: Mutex<Vec<TaskHandle>>,
    released: Mutex<Vec<Vec<u8>>>,
    fail_begins: AtomicBool,
    reject_tokens: AtomicBool,
    hold_cancels: AtomicBool,
    cancel_gate: Arc<Semaphore>,
    _events_tx: mpsc::Sender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::channel(16);
        Self {
            next: AtomicU64::new(1),
            begins: Mutex::new(Vec::new()),
            in_flight: Mutex::new(Vec::new()),
            cancel_token: Mutex::new(None),
            cancelled: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
            fail_begins: AtomicBool::new(false),
            reject_tokens: AtomicBool::new(false),
            hold_cancels: AtomicBool::new(false),
            cancel_gate: Arc::new(Semaphore::new(0)),
            _events_tx: tx,
            events_rx: Mutex::new(Some(rx)),
        }
    }

    pub(crate) fn seed_in_flight(&self, tasks: Vec<InFlightTask>) {
        self.in_flight.lock().unwrap().extend(tasks);
    }

    /// Token returned by every subsequent `cancel`.
    pub(crate) fn set_cancel_token(&self, token: Option<Vec<u8>>) {
        *self.cancel_token.lock().unwrap() = token;
    }

    pub(crate) fn fail_begins(&self, fail: bool) {
        self.fail_begins.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn reject_tokens(&self, reject: bool) {
        self.reject_tokens.store(reject, Ordering::SeqCst);
    }

    /// Makes every subsequent `cancel` wait for [`release_cancels`].
    ///
    /// [`release_cancels`]: Self::release_cancels
    pub(crate) fn hold_cancels(&self) {
        self.hold_cancels.store(true, Ordering::SeqCst);
    }

    pub(crate) fn release_cancels(&self, n: usize) {
        self.cancel_gate.add_permits(n);
    }

    pub(crate) fn begins(&self) -> Vec<Begin> {
        self.begins.lock().unwrap().clone()
    }

    pub(crate) fn cancelled(&self) -> Vec<TaskHandle> {
        self.cancelled.lock().unwrap().clone()
    }

    pub(crate) fn released(&self) -> Vec<Vec<u8>> {
        self.released.lock().unwrap().clone()
    }

    fn register(&self, begin: Begin, tag: &str) -> TaskHandle {
        let handle = TaskHandle(self.next.fetch_add(1, Ordering::SeqCst));
        self.begins.lock().unwrap().push(begin);
        self.in_flight.lock().unwrap().push(InFlightTask {
            handle,
            tag: tag.to_string(),
        });
        handle
    }
}

impl TransportSession for MockTransport {
    fn begin_fresh(&self, url: &str, tag: &str) -> Result<TaskHandle, TransportError> {
        if self.fail_begins.load(Ordering::SeqCst) {
            return Err(TransportError::Io(std::io::Error::other("refused")));
        }
        Ok(self.register(Begin::Fresh(url.to_string()), tag))
    }

    fn begin_from_token(&self, token: &[u8], tag: &str) -> Result<TaskHandle, TransportError> {
        if self.reject_tokens.load(Ordering::SeqCst) {
            return Err(TransportError::InvalidToken("rejected".into()));
        }
        Ok(self.register(Begin::Token(token.to_vec()), tag))
    }

    fn cancel(&self, handle: TaskHandle) -> BoxFuture<'_, Option<Vec<u8>>> {
        self.in_flight.lock().unwrap().retain(|t| t.handle != handle);
        self.cancelled.lock().unwrap().push(handle);
        let token = self.cancel_token.lock().unwrap().clone();
        if !self.hold_cancels.load(Ordering::SeqCst) {
            return Box::pin(std::future::ready(token));
        }
        let gate = Arc::clone(&self.cancel_gate);
        Box::pin(async move {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
            token
        })
    }

    fn release_token(&self, token: &[u8]) {
        self.released.lock().unwrap().push(token.to_vec());
    }

    fn in_flight(&self) -> Vec<InFlightTask> {
        self.in_flight.lock().unwrap().clone()
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events_rx.lock().unwrap().take()
    }
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    events: Mutex<Vec<TransferEvent>>,
}

impl RecordingNotifier {
    pub(crate) fn events(&self) -> Vec<TransferEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn failures(&self) -> Vec<(String, ErrorKind)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                TransferEvent::Failed { key, error } => Some((key, error)),
                _ => None,
            })
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn on_progress(&self, key: &str, fraction: f32) {
        self.events.lock().unwrap().push(TransferEvent::Progress {
            key: key.to_string(),
            fraction,
        });
    }

    fn on_completed(&self, key: &str, location: &Path) {
        self.events.lock().unwrap().push(TransferEvent::Completed {
            key: key.to_string(),
            location: location.to_path_buf(),
        });
    }

    fn on_failed(&self, key: &str, error: &ErrorKind) {
        self.events.lock().unwrap().push(TransferEvent::Failed {
            key: key.to_string(),
            error: error.clone(),
        });
    }

    fn on_insufficient_space(&self, key: &str) {
        self.events
            .lock()
            .unwrap()
            .push(TransferEvent::InsufficientSpace {
                key: key.to_string(),
            });
    }
}

pub(crate) struct FixedProbe {
    free: AtomicU64,
}

impl FixedProbe {
    pub(crate) fn set(&self, free: u64) {
        self.free.store(free, Ordering::SeqCst);
    }
}

impl Default for FixedProbe {
    fn default() -> Self {
        Self {
            free: AtomicU64::new(u64::MAX),
        }
    }
}

impl StorageProbe for FixedProbe {
    fn free_space(&self, _path: &Path) -> Option<u64> {
        Some(self.free.load(Ordering::SeqCst))
    }
}

static TEMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A launched scheduler wired to scripted collaborators.
pub(crate) struct Harness {
    _tmp: Option<TempDir>,
    root: PathBuf,
    pub(crate) transport: Arc<MockTransport>,
    pub(crate) notifier: Arc<RecordingNotifier>,
    pub(crate) probe: Arc<FixedProbe>,
    pub(crate) scheduler: Scheduler,
}

impl Harness {
    pub(crate) async fn new() -> Self {
        Self::with_concurrency(3).await
    }

    pub(crate) async fn with_concurrency(max: usize) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let config = SchedulerConfig {
            max_concurrent: max,
            ..SchedulerConfig::with_root(&root)
        };
        Self::build(Some(tmp), root, config, Arc::new(MockTransport::new())).await
    }

    pub(crate) async fn with_validity(days: i64) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let config = SchedulerConfig {
            validity_days: days,
            ..SchedulerConfig::with_root(&root)
        };
        Self::build(Some(tmp), root, config, Arc::new(MockTransport::new())).await
    }

    pub(crate) async fn in_dir(root: &Path, max: usize) -> Self {
        Self::with_transport(root, max, Arc::new(MockTransport::new())).await
    }

    pub(crate) async fn with_transport(
        root: &Path,
        max: usize,
        transport: Arc<MockTransport>,
    ) -> Self {
        let config = SchedulerConfig {
            max_concurrent: max,
            ..SchedulerConfig::with_root(root)
        };
        Self::build(None, root.to_path_buf(), config, transport).await
    }

    async fn build(
        tmp: Option<TempDir>,
        root: PathBuf,
        config: SchedulerConfig,
        transport: Arc<MockTransport>,
    ) -> Self {
        let notifier = Arc::new(RecordingNotifier::default());
        let probe = Arc::new(FixedProbe::default());
        let scheduler = Scheduler::launch(
            config,
            transport.clone(),
            notifier.clone(),
            probe.clone(),
        )
        .await
        .unwrap();
        Self {
            _tmp: tmp,
            root,
            transport,
            notifier,
            probe,
            scheduler,
        }
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn state_of(&self, i: usize) -> TransferState {
        self.scheduler.record(&key(i)).unwrap().state
    }

    pub(crate) async fn handle_of(&self, i: usize) -> TaskHandle {
        self.handle_for(&key(i)).await
    }

    pub(crate) async fn handle_for(&self, key: &str) -> TaskHandle {
        let state = self.scheduler.inner.state.lock().await;
        *state.bound.get(key).unwrap()
    }

    /// Makes every record store write fail until the returned path is removed.
    pub(crate) fn block_store_writes(&self) -> PathBuf {
        let blocker = self.root.join("state").join("transfers.json.tmp");
        std::fs::create_dir_all(&blocker).unwrap();
        blocker
    }

    pub(crate) fn write_temp(&self, data: &[u8]) -> PathBuf {
        let dir = self.scheduler.artifacts().partial_dir();
        std::fs::create_dir_all(&dir).unwrap();
        let n = TEMP_COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = dir.join(format!("test-{n}.part"));
        std::fs::write(&path, data).unwrap();
        path
    }

    pub(crate) async fn progress(&self, i: usize, written: u64, expected: Option<u64>) {
        let handle = self.handle_of(i).await;
        self.scheduler
            .handle_event(TransportEvent::Progress {
                handle,
                bytes_written: written,
                bytes_expected: expected,
            })
            .await;
    }

    pub(crate) async fn complete(&self, i: usize, data: &[u8]) {
        self.complete_key(&key(i), data).await;
    }

    pub(crate) async fn complete_key(&self, key: &str, data: &[u8]) {
        let handle = self.handle_for(key).await;
        let location = self.write_temp(data);
        self.scheduler
            .handle_event(TransportEvent::Completed { handle, location })
            .await;
    }

    pub(crate) async fn fail(&self, i: usize, failure: TransportFailure) {
        let handle = self.handle_of(i).await;
        self.scheduler
            .handle_event(TransportEvent::Failed { handle, failure })
            .await;
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.scheduler.shutdown();
    }
}
