//! A queryable download queue and the bridge that turns its rows into
//! transfer progress.
//!
//! Poll-only transports hand a URL to a queue and then read back a status
//! row by id. [`follow_download`] samples that row every poll interval with
//! [`ProgressPoll`] and forwards each snapshot to a [`TransferReporter`].

use cirrus_core::error::{CirrusError, Result};
use cirrus_core::poll::{ProgressPoll, SourceStatus, StatusReadError, StatusSample, StatusSource};
use cirrus_core::transfer::TransferReporter;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::task::AbortHandle;

pub type DownloadId = u64;

/// A download queue addressed by id.
pub trait DownloadQueue: Send + Sync {
    /// Queue `url` for download into `destination`.
    fn enqueue(&self, url: &str, destination: &Path) -> Result<DownloadId>;

    /// Current row for `id`. A removed or unknown id is `Vanished`.
    fn query(&self, id: DownloadId) -> std::result::Result<StatusSample, StatusReadError>;

    /// Stop and forget a download. No-op for unknown ids.
    fn remove(&self, id: DownloadId);
}

struct Row {
    sample: StatusSample,
    destination: PathBuf,
    handle: Option<AbortHandle>,
}

type Rows = Arc<Mutex<HashMap<DownloadId, Row>>>;

/// In-process download queue backed by `reqwest`.
///
/// Each entry is fetched on its own tokio task; rows stay queryable after
/// the download finished until they are removed.
pub struct HttpDownloadQueue {
    client: reqwest::Client,
    next_id: AtomicU64,
    rows: Rows,
}

impl Default for HttpDownloadQueue {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl HttpDownloadQueue {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            next_id: AtomicU64::new(1),
            rows: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Destination path recorded for a row.
    pub fn destination(&self, id: DownloadId) -> Option<PathBuf> {
        lock(&self.rows).get(&id).map(|r| r.destination.clone())
    }

    async fn fetch(
        client: reqwest::Client,
        rows: Rows,
        id: DownloadId,
        url: String,
        destination: PathBuf,
    ) {
        let outcome = Self::fetch_inner(&client, &rows, id, &url, &destination).await;
        let mut guard = lock(&rows);
        if let Some(row) = guard.get_mut(&id) {
            match outcome {
                Ok(bytes) => {
                    row.sample.bytes_done = bytes;
                    row.sample.bytes_total = Some(bytes);
                    row.sample.status = SourceStatus::Succeeded;
                }
                Err(e) => {
                    tracing::warn!(download_id = id, error = %e, "Queued download failed");
                    row.sample.status = SourceStatus::Failed;
                }
            }
            row.handle = None;
        }
    }

    async fn fetch_inner(
        client: &reqwest::Client,
        rows: &Rows,
        id: DownloadId,
        url: &str,
        destination: &Path,
    ) -> Result<u64> {
        let mut resp = client
            .get(url)
            .send()
            .await
            .map_err(|e| CirrusError::Network(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CirrusError::Provider(format!("download returned HTTP {status}")));
        }

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(destination).await?;

        let total = resp.content_length();
        if !publish_running(rows, id, 0, total) {
            return Err(CirrusError::Cancelled);
        }

        let mut done = 0u64;
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| CirrusError::Network(e.to_string()))?
        {
            file.write_all(&chunk).await?;
            done += chunk.len() as u64;
            if !publish_running(rows, id, done, total) {
                return Err(CirrusError::Cancelled);
            }
        }
        file.flush().await?;

        if let Some(expected) = total.filter(|t| *t != done) {
            return Err(CirrusError::Network(format!(
                "download ended after {done} of {expected} bytes"
            )));
        }
        Ok(done)
    }
}

/// Publish progress for a running row. Returns false once the row is gone.
///
/// Pollers read `bytes_done == bytes_total` as finished, so a running row
/// stays below its total; only the succeeded row, written after the file is
/// flushed, carries the full count.
fn publish_running(rows: &Rows, id: DownloadId, done: u64, total: Option<u64>) -> bool {
    match lock(rows).get_mut(&id) {
        Some(row) => {
            row.sample.bytes_done = match total {
                Some(t) if done >= t => t.saturating_sub(1),
                _ => done,
            };
            row.sample.bytes_total = total.filter(|t| *t > 0).or(row.sample.bytes_total);
            row.sample.status = SourceStatus::Running;
            true
        }
        None => false,
    }
}

fn lock(rows: &Rows) -> std::sync::MutexGuard<'_, HashMap<DownloadId, Row>> {
    rows.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DownloadQueue for HttpDownloadQueue {
    fn enqueue(&self, url: &str, destination: &Path) -> Result<DownloadId> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            CirrusError::Precondition(format!("download queue needs a runtime: {e}"))
        })?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        lock(&self.rows).insert(
            id,
            Row {
                sample: StatusSample {
                    bytes_done: 0,
                    bytes_total: None,
                    status: SourceStatus::Pending,
                },
                destination: destination.to_path_buf(),
                handle: None,
            },
        );

        let task = runtime.spawn(Self::fetch(
            self.client.clone(),
            Arc::clone(&self.rows),
            id,
            url.to_string(),
            destination.to_path_buf(),
        ));
        if let Some(row) = lock(&self.rows).get_mut(&id) {
            if !row.sample.status.is_terminal() {
                row.handle = Some(task.abort_handle());
            }
        }
        tracing::debug!(download_id = id, destination = %destination.display(), "Download queued");
        Ok(id)
    }

    fn query(&self, id: DownloadId) -> std::result::Result<StatusSample, StatusReadError> {
        lock(&self.rows)
            .get(&id)
            .map(|r| r.sample)
            .ok_or_else(|| StatusReadError::Vanished(id.to_string()))
    }

    fn remove(&self, id: DownloadId) {
        if let Some(row) = lock(&self.rows).remove(&id) {
            if let Some(handle) = row.handle {
                handle.abort();
            }
        }
    }
}

/// One queue row viewed as a [`StatusSource`].
pub struct QueuedDownload {
    queue: Arc<dyn DownloadQueue>,
    id: DownloadId,
}

impl QueuedDownload {
    pub fn new(queue: Arc<dyn DownloadQueue>, id: DownloadId) -> Self {
        Self { queue, id }
    }
}

impl StatusSource for QueuedDownload {
    fn sample(&self) -> std::result::Result<StatusSample, StatusReadError> {
        self.queue.query(self.id)
    }
}

/// Poll queue row `id` until it is terminal, forwarding progress into
/// `reporter`. Returns the transferred byte count on success.
///
/// The row is removed once a terminal snapshot was observed.
pub async fn follow_download(
    queue: Arc<dyn DownloadQueue>,
    id: DownloadId,
    interval: Duration,
    reporter: &TransferReporter,
) -> Result<u64> {
    let source = Arc::new(QueuedDownload::new(Arc::clone(&queue), id));
    let mut snapshots = std::pin::pin!(ProgressPoll::start(source, interval));
    let mut last = None;
    while let Some(snapshot) = snapshots.next().await {
        reporter.progress(snapshot.bytes_done, snapshot.bytes_total);
        last = Some(snapshot);
    }
    queue.remove(id);

    match last {
        Some(s) if s.succeeded() => Ok(s.bytes_done),
        Some(_) => Err(CirrusError::Network(format!(
            "queued download {id} did not complete"
        ))),
        None => Err(CirrusError::Network(format!(
            "queued download {id} produced no status"
        ))),
    }
}
