use async_trait::async_trait;
use cirrus_core::error::{CirrusError, Result};
use cirrus_core::transfer::{TransferReporter, TransferTask};
use cirrus_core::types::{BackupProviderId, LocalSource, Namespace, QuotaStatus};
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

/// Byte progress callback handed to vendor clients: `(done, total)`.
/// May be invoked from any thread.
pub type ProgressFn = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Uniform contract over one remote backup service.
///
/// Every call resolves exactly once with a value or a classified
/// [`CirrusError`]. Transfer methods return as soon as the transfer has been
/// accepted; byte progress and the final outcome are observed through the
/// returned [`TransferTask`].
#[async_trait]
pub trait BackupProvider: Send + Sync {
    fn id(&self) -> BackupProviderId;

    /// Provider name for display.
    fn name(&self) -> &str;

    /// Whether a usable session is held. Cheap, no network.
    fn is_signed_in(&self) -> bool;

    /// Storage usage. Providers without a quota concept report app usage only.
    async fn quota(&self) -> Result<QuotaStatus>;

    /// Get-or-create the root folder / key prefix. Idempotent.
    async fn ensure_namespace(&self, name: &str) -> Result<Namespace>;

    /// Start uploading `source` as `remote_name` under `namespace`.
    ///
    /// Fails fast (without a task) only on precondition errors: a missing
    /// source, a foreign namespace, or no session.
    async fn upload(
        &self,
        namespace: &Namespace,
        source: &LocalSource,
        remote_name: &str,
    ) -> Result<TransferTask>;

    /// Start downloading `remote_name` from `namespace` to `destination`.
    async fn download(
        &self,
        namespace: &Namespace,
        remote_name: &str,
        destination: &Path,
    ) -> Result<TransferTask>;

    /// Size of a remote object. A missing object is [`CirrusError::NotFound`].
    async fn object_size(&self, namespace: &Namespace, remote_name: &str) -> Result<u64>;

    /// Drop the session. Subsequent calls fail with an auth error.
    async fn sign_out(&self);
}

/// Reject namespaces issued by another provider.
pub fn check_namespace(provider: BackupProviderId, namespace: &Namespace) -> Result<()> {
    if namespace.provider != provider {
        return Err(CirrusError::Precondition(format!(
            "namespace {} belongs to {}, not {}",
            namespace.name, namespace.provider, provider
        )));
    }
    Ok(())
}

/// Reject remote names that would escape the namespace.
pub fn check_remote_name(remote_name: &str) -> Result<()> {
    if remote_name.is_empty()
        || remote_name.contains('/')
        || remote_name.contains('\\')
        || remote_name == "."
        || remote_name == ".."
    {
        return Err(CirrusError::Precondition(format!(
            "invalid remote name: {remote_name:?}"
        )));
    }
    Ok(())
}

/// Holder for a provider session.
///
/// Empty means signed out or invalidated: every access fails with an auth
/// error without touching the network. Any auth error observed through
/// [`SessionCell::observe`] empties the cell, so a stale session is never
/// silently reused.
pub struct SessionCell<S> {
    provider: BackupProviderId,
    inner: RwLock<Option<S>>,
}

impl<S: Clone> SessionCell<S> {
    pub fn new(provider: BackupProviderId, initial: Option<S>) -> Self {
        Self {
            provider,
            inner: RwLock::new(initial),
        }
    }

    pub fn get(&self) -> Result<S> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| CirrusError::Auth(format!("not signed in to {}", self.provider)))
    }

    pub fn set(&self, session: S) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Some(session);
    }

    pub fn is_present(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Drop the session. Returns true if one was held.
    pub fn invalidate(&self) -> bool {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    /// Pass `result` through, invalidating the session on an auth error.
    pub fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_auth() && self.invalidate() {
                tracing::warn!(provider = %self.provider, error = %e, "Session invalidated");
            }
        }
        result
    }
}

/// Drive `reporter` with `work` on a spawned task.
///
/// The work future is dropped as soon as the owner cancels the task. Auth
/// errors from the work invalidate `session`.
pub fn spawn_transfer<S, F, Fut>(
    session: Arc<SessionCell<S>>,
    reporter: TransferReporter,
    work: F,
) where
    S: Clone + Send + Sync + 'static,
    F: FnOnce(Arc<TransferReporter>) -> Fut,
    Fut: Future<Output = Result<u64>> + Send + 'static,
{
    let reporter = Arc::new(reporter);
    let fut = work(Arc::clone(&reporter));
    tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = reporter.cancelled() => {
                tracing::debug!(task_id = %reporter.id(), "Transfer worker stopped after cancel");
            }
            result = fut => {
                let result = session.observe(result);
                reporter.finish(result);
            }
        }
    });
}

/// Run a blocking vendor call off the async runtime.
pub async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CirrusError::Io(std::io::Error::other(e)))?
}

/// Progress callback that forwards into a reporter.
pub fn reporter_progress(reporter: &Arc<TransferReporter>) -> ProgressFn {
    let reporter = Arc::clone(reporter);
    Arc::new(move |done, total| {
        reporter.progress(done, total);
    })
}
