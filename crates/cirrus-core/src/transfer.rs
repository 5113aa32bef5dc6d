//! Transfer tasks returned by uploads and downloads.
//!
//! A provider creates a `(TransferTask, TransferReporter)` pair, hands the
//! task back to its caller immediately and drives the reporter from a worker.
//! State only moves forward:
//! `Pending -> InProgress* -> Succeeded | Failed | Cancelled`.

use futures::Stream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{CirrusError, Failure};
use crate::types::TransferDirection;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    Pending,
    InProgress {
        bytes_done: u64,
        bytes_total: Option<u64>,
    },
    Succeeded {
        bytes: u64,
    },
    /// `bytes_done` is the last count reported before the failure.
    Failed {
        failure: Failure,
        bytes_done: u64,
    },
    Cancelled {
        bytes_done: u64,
    },
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Succeeded { .. }
                | TransferState::Failed { .. }
                | TransferState::Cancelled { .. }
        )
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self, TransferState::Succeeded { .. })
    }

    pub fn bytes_done(&self) -> u64 {
        match self {
            TransferState::Pending => 0,
            TransferState::InProgress { bytes_done, .. }
            | TransferState::Failed { bytes_done, .. }
            | TransferState::Cancelled { bytes_done } => *bytes_done,
            TransferState::Succeeded { bytes } => *bytes,
        }
    }
}

/// Caller's view of one upload or download.
#[derive(Clone)]
pub struct TransferTask {
    id: Uuid,
    direction: TransferDirection,
    local: PathBuf,
    remote_key: String,
    state: Arc<watch::Sender<TransferState>>,
}

impl std::fmt::Debug for TransferTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferTask")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("remote_key", &self.remote_key)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl TransferTask {
    pub fn new(
        direction: TransferDirection,
        local: &Path,
        remote_key: &str,
    ) -> (TransferTask, TransferReporter) {
        let (tx, _rx) = watch::channel(TransferState::Pending);
        let state = Arc::new(tx);
        let id = Uuid::now_v7();
        let task = TransferTask {
            id,
            direction,
            local: local.to_path_buf(),
            remote_key: remote_key.to_string(),
            state: Arc::clone(&state),
        };
        (task, TransferReporter { id, state })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn local_path(&self) -> &Path {
        &self.local
    }

    pub fn remote_key(&self) -> &str {
        &self.remote_key
    }

    pub fn state(&self) -> TransferState {
        self.state.borrow().clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.borrow().is_terminal()
    }

    /// Request cancellation. Best effort: if the transfer already reached a
    /// terminal state this is a no-op and returns false.
    pub fn cancel(&self) -> bool {
        let cancelled = self.state.send_if_modified(|s| {
            if s.is_terminal() {
                false
            } else {
                *s = TransferState::Cancelled {
                    bytes_done: s.bytes_done(),
                };
                true
            }
        });
        if cancelled {
            tracing::info!(task_id = %self.id, "Transfer cancelled");
        }
        cancelled
    }

    /// Wait for the terminal state.
    pub async fn wait(&self) -> TransferState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(TransferState::is_terminal).await {
            Ok(s) => s.clone(),
            // Unreachable while `self` holds the sender.
            Err(_) => self.state(),
        }
    }

    /// Progress observed from now on. Starts with the current state, never
    /// goes backwards, and ends right after the terminal state.
    pub fn progress(&self) -> impl Stream<Item = TransferState> + Send + 'static {
        let rx = self.state.subscribe();
        futures::stream::unfold((rx, false, true), |(mut rx, finished, first)| async move {
            if finished {
                return None;
            }
            if !first && rx.changed().await.is_err() {
                return None;
            }
            let state = rx.borrow_and_update().clone();
            let finished = state.is_terminal();
            Some((state, (rx, finished, false)))
        })
    }
}

/// Worker side of a [`TransferTask`].
///
/// Dropping a reporter before it reported a terminal state fails the task,
/// so an awaiting caller is never left hanging by a crashed worker.
pub struct TransferReporter {
    id: Uuid,
    state: Arc<watch::Sender<TransferState>>,
}

impl TransferReporter {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Record transferred bytes. Counts below the last report are raised to
    /// it, so observers see a non-decreasing sequence.
    pub fn progress(&self, bytes_done: u64, bytes_total: Option<u64>) -> bool {
        self.state.send_if_modified(|s| match s {
            TransferState::Pending => {
                *s = TransferState::InProgress {
                    bytes_done,
                    bytes_total,
                };
                true
            }
            TransferState::InProgress {
                bytes_done: prev_done,
                bytes_total: prev_total,
            } => {
                let done = bytes_done.max(*prev_done);
                let total = bytes_total.or(*prev_total);
                if done == *prev_done && total == *prev_total {
                    return false;
                }
                *prev_done = done;
                *prev_total = total;
                true
            }
            _ => false,
        })
    }

    pub fn succeed(&self, bytes: u64) -> bool {
        self.terminate(|_| TransferState::Succeeded { bytes })
    }

    pub fn fail(&self, failure: Failure) -> bool {
        tracing::warn!(task_id = %self.id, error = %failure, "Transfer failed");
        self.terminate(|bytes_done| TransferState::Failed {
            failure,
            bytes_done,
        })
    }

    /// Report the outcome of a worker. Cancellation errors map to the
    /// cancelled state, everything else to failed.
    pub fn finish(&self, result: Result<u64, CirrusError>) -> bool {
        match result {
            Ok(bytes) => self.succeed(bytes),
            Err(CirrusError::Cancelled) => {
                self.terminate(|bytes_done| TransferState::Cancelled { bytes_done })
            }
            Err(e) => self.fail(Failure::from(e)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.state.borrow(), TransferState::Cancelled { .. })
    }

    /// Resolves once the owner cancelled the task.
    pub async fn cancelled(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx
            .wait_for(|s| matches!(s, TransferState::Cancelled { .. }))
            .await;
    }

    /// `terminal` receives the last reported byte count.
    fn terminate(&self, terminal: impl FnOnce(u64) -> TransferState) -> bool {
        self.state.send_if_modified(move |s| {
            if s.is_terminal() {
                false
            } else {
                *s = terminal(s.bytes_done());
                true
            }
        })
    }
}

impl Drop for TransferReporter {
    fn drop(&mut self) {
        if !self.state.borrow().is_terminal() {
            self.fail(Failure::new(
                crate::error::ErrorKind::Local,
                "transfer worker exited without a result",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use futures::StreamExt;

    fn pair() -> (TransferTask, TransferReporter) {
        TransferTask::new(TransferDirection::Upload, Path::new("/tmp/a.db"), "Cirrus/a.db")
    }

    #[test]
    fn progress_never_goes_backwards() {
        let (task, reporter) = pair();
        reporter.progress(10, Some(100));
        reporter.progress(5, Some(100));
        assert_eq!(
            task.state(),
            TransferState::InProgress {
                bytes_done: 10,
                bytes_total: Some(100)
            }
        );
        reporter.progress(60, None);
        assert_eq!(task.state().bytes_done(), 60);
    }

    #[test]
    fn terminal_state_is_sticky() {
        let (task, reporter) = pair();
        assert!(reporter.succeed(100));
        assert!(!reporter.fail(Failure::network("late")));
        assert!(!reporter.progress(5, None));
        assert!(!task.cancel());
        assert_eq!(task.state(), TransferState::Succeeded { bytes: 100 });
    }

    #[tokio::test]
    async fn cancel_wins_over_late_success() {
        let (task, reporter) = pair();
        reporter.progress(1, Some(10));
        assert!(task.cancel());
        assert!(reporter.is_cancelled());
        assert!(!reporter.succeed(10));
        assert_eq!(task.wait().await, TransferState::Cancelled { bytes_done: 1 });
    }

    #[tokio::test]
    async fn progress_stream_ends_with_terminal() {
        let (task, reporter) = pair();
        let observed = tokio::spawn(task.progress().collect::<Vec<_>>());
        tokio::task::yield_now().await;

        for done in [10, 20, 30] {
            reporter.progress(done, Some(30));
            tokio::task::yield_now().await;
        }
        reporter.succeed(30);

        let states = observed.await.unwrap();
        let last = states.last().unwrap();
        assert_eq!(*last, TransferState::Succeeded { bytes: 30 });
        assert_eq!(states.iter().filter(|s| s.is_terminal()).count(), 1);
        let bytes: Vec<u64> = states.iter().map(TransferState::bytes_done).collect();
        assert!(bytes.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn failed_transfer_keeps_reported_bytes() {
        let (task, reporter) = pair();
        let observed = tokio::spawn(task.progress().collect::<Vec<_>>());
        tokio::task::yield_now().await;

        reporter.progress(60, Some(100));
        tokio::task::yield_now().await;
        reporter.fail(Failure::network("connection reset"));

        let states = observed.await.unwrap();
        let bytes: Vec<u64> = states.iter().map(TransferState::bytes_done).collect();
        assert!(bytes.windows(2).all(|w| w[0] <= w[1]), "{bytes:?}");
        match states.last().unwrap() {
            TransferState::Failed { failure, bytes_done } => {
                assert_eq!(failure.kind, ErrorKind::Network);
                assert_eq!(*bytes_done, 60);
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn cancel_keeps_reported_bytes() {
        let (task, reporter) = pair();
        reporter.progress(25, Some(100));
        assert!(task.cancel());
        assert_eq!(task.state(), TransferState::Cancelled { bytes_done: 25 });
        assert_eq!(task.state().bytes_done(), 25);
    }

    #[tokio::test]
    async fn dropped_reporter_fails_task() {
        let (task, reporter) = pair();
        drop(reporter);
        match task.wait().await {
            TransferState::Failed { failure, .. } => assert_eq!(failure.kind, ErrorKind::Local),
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn finish_maps_cancelled_error() {
        let (task, reporter) = pair();
        reporter.finish(Err(CirrusError::Cancelled));
        assert_eq!(task.state(), TransferState::Cancelled { bytes_done: 0 });
    }

    #[tokio::test]
    async fn cancelled_future_resolves_on_cancel() {
        let (task, reporter) = pair();
        let waiter = tokio::spawn(async move {
            reporter.cancelled().await;
            reporter.is_cancelled()
        });
        tokio::task::yield_now().await;
        task.cancel();
        assert!(waiter.await.unwrap());
    }
}
