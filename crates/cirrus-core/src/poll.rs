//! Fixed-interval progress polling for transports that only expose a
//! queryable status record (a platform download queue, poll-only SDKs).

use futures::Stream;
use std::sync::Arc;
use std::time::Duration;

/// Status code reported by a [`StatusSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    Pending,
    Running,
    Paused,
    Succeeded,
    Failed,
}

impl SourceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SourceStatus::Succeeded | SourceStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSample {
    pub bytes_done: u64,
    /// `None` until the transport knows the size.
    pub bytes_total: Option<u64>,
    pub status: SourceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatusReadError {
    #[error("status record {0} no longer exists")]
    Vanished(String),

    #[error("status read failed: {0}")]
    Read(String),
}

/// Something that can be sampled for transfer status. Sampling is expected
/// to be cheap and local.
pub trait StatusSource: Send + Sync {
    fn sample(&self) -> Result<StatusSample, StatusReadError>;
}

impl<F> StatusSource for F
where
    F: Fn() -> Result<StatusSample, StatusReadError> + Send + Sync,
{
    fn sample(&self) -> Result<StatusSample, StatusReadError> {
        self()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    pub terminal: bool,
    pub failed: bool,
}

impl ProgressSnapshot {
    pub fn succeeded(&self) -> bool {
        self.terminal && !self.failed
    }
}

struct PollState<S: ?Sized> {
    source: Arc<S>,
    interval: Duration,
    last_done: u64,
    last_total: Option<u64>,
    first: bool,
    finished: bool,
}

pub struct ProgressPoll;

impl ProgressPoll {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

    /// Poll `source` every `interval` until a terminal snapshot.
    ///
    /// The stream is lazy: nothing is sampled until it is polled, and
    /// dropping it stops polling. Calling `start` again on the same source
    /// resumes observation of a transfer that kept running meanwhile.
    ///
    /// `bytes_done` is non-decreasing and the last item is the only one with
    /// `terminal` set. A failed read ends the stream with one failed snapshot
    /// instead of retrying.
    pub fn start<S>(
        source: Arc<S>,
        interval: Duration,
    ) -> impl Stream<Item = ProgressSnapshot> + Send + 'static
    where
        S: StatusSource + ?Sized + 'static,
    {
        let state = PollState {
            source,
            interval,
            last_done: 0,
            last_total: None,
            first: true,
            finished: false,
        };
        futures::stream::unfold(state, |mut st| async move {
            if st.finished {
                return None;
            }
            if !st.first {
                tokio::time::sleep(st.interval).await;
            }
            st.first = false;

            let snapshot = match st.source.sample() {
                Ok(sample) => {
                    let total = sample.bytes_total.or(st.last_total);
                    let mut done = sample.bytes_done.max(st.last_done);
                    if sample.status == SourceStatus::Succeeded {
                        done = total.map_or(done, |t| t.max(done));
                    }
                    let reached_total = total.is_some_and(|t| t == done);
                    let failed = sample.status == SourceStatus::Failed;
                    ProgressSnapshot {
                        bytes_done: done,
                        bytes_total: total,
                        terminal: failed || sample.status.is_terminal() || reached_total,
                        failed,
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Status source read failed, ending poll");
                    ProgressSnapshot {
                        bytes_done: st.last_done,
                        bytes_total: st.last_total,
                        terminal: true,
                        failed: true,
                    }
                }
            };

            st.last_done = snapshot.bytes_done;
            st.last_total = snapshot.bytes_total;
            st.finished = snapshot.terminal;
            Some((snapshot, st))
        })
    }
}
