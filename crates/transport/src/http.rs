//! Resumable HTTP transport.
//!
//! Each task streams a GET response into `<partial_dir>/<uuid>.part`.
//! Resumed tasks send `Range` (and `If-Range` when a validator is known);
//! a 206 response is appended at the saved offset while a 200 response
//! means the server restarted the body.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT_RANGES, CONTENT_RANGE, ETAG, HeaderMap, IF_RANGE, LAST_MODIFIED, RANGE};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::TransportError;
use crate::session::{
    BoxFuture, InFlightTask, TaskHandle, TransportEvent, TransportFailure, TransportSession,
};

/// Capacity of the transport event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Resume token format version.
const TOKEN_VERSION: u32 = 1;

/// Extension of partial transfer files.
const PARTIAL_EXTENSION: &str = "part";

/// Settings for [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Directory for in-progress files. Should share a filesystem with the
    /// artifact directory.
    pub partial_dir: PathBuf,
    pub connect_timeout: Duration,
    /// Longest wait for a response or the next body chunk.
    pub stall_timeout: Duration,
    /// Write buffer size and progress reporting granularity.
    pub progress_step_bytes: usize,
}

impl HttpTransportConfig {
    pub fn new(partial_dir: impl Into<PathBuf>) -> Self {
        Self {
            partial_dir: partial_dir.into(),
            connect_timeout: Duration::from_secs(30),
            stall_timeout: Duration::from_secs(60),
            progress_step_bytes: 1024 * 1024,
        }
    }
}

/// Continuation state handed out on cancel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ResumeToken {
    version: u32,
    url: String,
    partial: PathBuf,
    offset: u64,
    #[serde(default)]
    expected: Option<u64>,
    #[serde(default)]
    validator: Option<String>,
}

struct TaskEntry {
    tag: String,
    cancel: CancellationToken,
    token_rx: Option<oneshot::Receiver<Option<Vec<u8>>>>,
}

struct Shared {
    client: reqwest::Client,
    config: HttpTransportConfig,
    tasks: Mutex<HashMap<TaskHandle, TaskEntry>>,
    events_tx: mpsc::Sender<TransportEvent>,
}

/// [`TransportSession`] over HTTP(S).
pub struct HttpTransport {
    shared: Arc<Shared>,
    next_handle: AtomicU64,
    events_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
}

impl HttpTransport {
    /// Builds the shared client and creates the partial directory.
    pub fn new(config: HttpTransportConfig) -> Result<Self, TransportError> {
        std::fs::create_dir_all(&config.partial_dir)?;
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            shared: Arc::new(Shared {
                client,
                config,
                tasks: Mutex::new(HashMap::new()),
                events_tx,
            }),
            next_handle: AtomicU64::new(1),
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    /// Cancels every running task without collecting resume tokens.
    pub fn shutdown(&self) {
        let tasks = self.shared.tasks.lock().unwrap();
        for entry in tasks.values() {
            entry.cancel.cancel();
        }
        info!(tasks = tasks.len(), "HTTP transport shut down");
    }

    fn spawn(&self, job: Job, tag: &str) -> TaskHandle {
        let handle = job.handle;
        let cancel = CancellationToken::new();
        let (token_tx, token_rx) = oneshot::channel();

        self.shared.tasks.lock().unwrap().insert(
            handle,
            TaskEntry {
                tag: tag.to_string(),
                cancel: cancel.clone(),
                token_rx: Some(token_rx),
            },
        );

        let shared = Arc::clone(&self.shared);
        tokio::spawn(run_task(shared, job, cancel, token_tx));
        handle
    }

    fn allocate_handle(&self) -> TaskHandle {
        TaskHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }
}

impl TransportSession for HttpTransport {
    fn begin_fresh(&self, url: &str, tag: &str) -> Result<TaskHandle, TransportError> {
        let partial = self.shared.config.partial_dir.join(format!(
            "{}.{PARTIAL_EXTENSION}",
            uuid::Uuid::new_v4()
        ));
        let handle = self.allocate_handle();
        debug!(%handle, url, "starting fresh transfer");
        Ok(self.spawn(
            Job {
                handle,
                url: url.to_string(),
                partial,
                offset: 0,
                expected: None,
                validator: None,
                ranges: false,
            },
            tag,
        ))
    }

    fn begin_from_token(&self, token: &[u8], tag: &str) -> Result<TaskHandle, TransportError> {
        let token: ResumeToken = serde_json::from_slice(token)
            .map_err(|e| TransportError::InvalidToken(e.to_string()))?;
        if token.version != TOKEN_VERSION {
            return Err(TransportError::InvalidToken(format!(
                "unsupported version {}",
                token.version
            )));
        }
        if token.partial.parent() != Some(self.shared.config.partial_dir.as_path()) {
            return Err(TransportError::InvalidToken(format!(
                "partial file outside {}",
                self.shared.config.partial_dir.display()
            )));
        }

        let len = std::fs::metadata(&token.partial)
            .map_err(|e| TransportError::InvalidToken(format!("partial file: {e}")))?
            .len();
        if len < token.offset {
            return Err(TransportError::InvalidToken(format!(
                "partial file has {len} bytes, token expects {}",
                token.offset
            )));
        }
        if len > token.offset {
            std::fs::OpenOptions::new()
                .write(true)
                .open(&token.partial)?
                .set_len(token.offset)?;
        }

        let handle = self.allocate_handle();
        debug!(%handle, url = %token.url, offset = token.offset, "resuming transfer");
        Ok(self.spawn(
            Job {
                handle,
                url: token.url,
                partial: token.partial,
                offset: token.offset,
                expected: token.expected,
                validator: token.validator,
                ranges: true,
            },
            tag,
        ))
    }

    fn cancel(&self, handle: TaskHandle) -> BoxFuture<'_, Option<Vec<u8>>> {
        let token_rx = {
            let mut tasks = self.shared.tasks.lock().unwrap();
            tasks.get_mut(&handle).and_then(|entry| {
                entry.cancel.cancel();
                entry.token_rx.take()
            })
        };
        Box::pin(async move {
            match token_rx {
                Some(rx) => rx.await.ok().flatten(),
                None => None,
            }
        })
    }

    fn release_token(&self, token: &[u8]) {
        let Ok(token) = serde_json::from_slice::<ResumeToken>(token) else {
            return;
        };
        if token.partial.parent() != Some(self.shared.config.partial_dir.as_path()) {
            return;
        }
        match std::fs::remove_file(&token.partial) {
            Ok(()) => debug!(path = %token.partial.display(), "released partial file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %token.partial.display(), error = %e, "failed to remove partial file"),
        }
    }

    fn in_flight(&self) -> Vec<InFlightTask> {
        let tasks = self.shared.tasks.lock().unwrap();
        let mut list: Vec<_> = tasks
            .iter()
            .filter(|(_, entry)| !entry.cancel.is_cancelled())
            .map(|(handle, entry)| InFlightTask {
                handle: *handle,
                tag: entry.tag.clone(),
            })
            .collect();
        list.sort_by_key(|t| t.handle);
        list
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events_rx.lock().unwrap().take()
    }
}

/// Mutable state of one running transfer.
struct Job {
    handle: TaskHandle,
    url: String,
    partial: PathBuf,
    /// Bytes known to be on disk.
    offset: u64,
    expected: Option<u64>,
    validator: Option<String>,
    /// Whether the server honours byte ranges for this resource.
    ranges: bool,
}

impl Job {
    /// Encodes a resume token, if the transfer can be continued.
    fn resume_token(&self) -> Option<Vec<u8>> {
        if self.offset == 0 || !self.ranges {
            return None;
        }
        let token = ResumeToken {
            version: TOKEN_VERSION,
            url: self.url.clone(),
            partial: self.partial.clone(),
            offset: self.offset,
            expected: self.expected,
            validator: self.validator.clone(),
        };
        serde_json::to_vec(&token).ok()
    }
}

enum Outcome {
    Finished,
    Cancelled,
}

async fn run_task(
    shared: Arc<Shared>,
    mut job: Job,
    cancel: CancellationToken,
    token_tx: oneshot::Sender<Option<Vec<u8>>>,
) {
    let result = transfer(&shared, &mut job, &cancel).await;
    shared.tasks.lock().unwrap().remove(&job.handle);

    let event = match result {
        Ok(Outcome::Finished) => {
            info!(handle = %job.handle, bytes = job.offset, "transfer finished");
            TransportEvent::Completed {
                handle: job.handle,
                location: job.partial.clone(),
            }
        }
        Ok(Outcome::Cancelled) => {
            let token = job.resume_token();
            if token.is_none() {
                remove_partial(&job.partial).await;
            }
            debug!(handle = %job.handle, offset = job.offset, resumable = token.is_some(), "transfer cancelled");
            let _ = token_tx.send(token);
            TransportEvent::Failed {
                handle: job.handle,
                failure: TransportFailure::Cancelled,
            }
        }
        Err(failure) => {
            warn!(handle = %job.handle, url = %job.url, error = %failure, "transfer failed");
            remove_partial(&job.partial).await;
            TransportEvent::Failed {
                handle: job.handle,
                failure,
            }
        }
    };

    let _ = shared.events_tx.send(event).await;
}

async fn transfer(
    shared: &Shared,
    job: &mut Job,
    cancel: &CancellationToken,
) -> Result<Outcome, TransportFailure> {
    let stall = shared.config.stall_timeout;

    let mut request = shared.client.get(&job.url);
    if job.offset > 0 {
        request = request.header(RANGE, format!("bytes={}-", job.offset));
        if let Some(validator) = &job.validator {
            request = request.header(IF_RANGE, validator.as_str());
        }
    }

    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(Outcome::Cancelled),
        r = tokio::time::timeout(stall, request.send()) => match r {
            Err(_) => return Err(TransportFailure::Timeout),
            Ok(Err(e)) => return Err(classify(e)),
            Ok(Ok(resp)) => resp,
        },
    };

    let status = response.status();
    if !status.is_success() {
        return Err(TransportFailure::Other(format!("HTTP {status}")));
    }

    let headers = response.headers();
    let append = status == StatusCode::PARTIAL_CONTENT && job.offset > 0;
    if append {
        job.ranges = true;
        if let Some(total) = content_range_total(headers) {
            job.expected = Some(total);
        } else if let Some(len) = response.content_length() {
            job.expected = Some(job.offset + len);
        }
    } else {
        if job.offset > 0 {
            debug!(handle = %job.handle, "server restarted body, discarding partial data");
        }
        job.offset = 0;
        job.ranges = accepts_ranges(headers);
        job.validator = validator(headers);
        job.expected = response.content_length();
    }

    let file = open_partial(&job.partial, job.offset, append)
        .await
        .map_err(io_failure)?;
    let step = shared.config.progress_step_bytes.max(1);
    let mut writer = BufWriter::with_capacity(step, file);
    let mut written = job.offset;
    let mut reported = written;

    progress(shared, job, written);

    let mut stream = response.bytes_stream();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                writer.flush().await.map_err(io_failure)?;
                job.offset = written;
                return Ok(Outcome::Cancelled);
            }
            r = tokio::time::timeout(stall, stream.next()) => r,
        };

        match next {
            Err(_) => return Err(TransportFailure::Timeout),
            Ok(None) => break,
            Ok(Some(Err(e))) => return Err(classify(e)),
            Ok(Some(Ok(chunk))) => {
                writer.write_all(&chunk).await.map_err(io_failure)?;
                written += chunk.len() as u64;
                trace!(handle = %job.handle, written, "chunk");
                if written - reported >= step as u64 {
                    writer.flush().await.map_err(io_failure)?;
                    job.offset = written;
                    reported = written;
                    progress(shared, job, written);
                }
            }
        }
    }

    writer.flush().await.map_err(io_failure)?;
    job.offset = written;

    if let Some(expected) = job.expected {
        if written < expected {
            return Err(TransportFailure::Other(format!(
                "connection closed after {written} of {expected} bytes"
            )));
        }
    }
    if written != reported {
        progress(shared, job, written);
    }
    Ok(Outcome::Finished)
}

/// Sends a progress event, dropping it if the channel is full.
fn progress(shared: &Shared, job: &Job, written: u64) {
    let _ = shared.events_tx.try_send(TransportEvent::Progress {
        handle: job.handle,
        bytes_written: written,
        bytes_expected: job.expected,
    });
}

async fn open_partial(path: &Path, offset: u64, append: bool) -> std::io::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if !append {
        return tokio::fs::File::create(path).await;
    }
    let mut file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    file.set_len(offset).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    Ok(file)
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove partial file"),
    }
}

fn classify(e: reqwest::Error) -> TransportFailure {
    if e.is_timeout() {
        TransportFailure::Timeout
    } else {
        TransportFailure::Other(e.to_string())
    }
}

fn io_failure(e: std::io::Error) -> TransportFailure {
    TransportFailure::Other(format!("I/O error: {e}"))
}

fn accepts_ranges(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("bytes"))
}

/// Strong validator for `If-Range`: the ETag, else Last-Modified.
fn validator(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ETAG)
        .filter(|v| !v.as_bytes().starts_with(b"W/"))
        .or_else(|| headers.get(LAST_MODIFIED))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Total length from `Content-Range: bytes a-b/total`.
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_RANGE)?
        .to_str()
        .ok()?
        .rsplit_once('/')?
        .1
        .trim()
        .parse()
        .ok()
}
