//! Backup orchestration over the configured provider.
//!
//! The coordinator reads [`BackupSettings`], picks the active adapter from
//! its registry, ensures the namespace once per batch and runs every target
//! independently. Failures are reported per target and never retried here.

use cirrus_core::config::BackupSettings;
use cirrus_core::error::{CirrusError, ErrorKind, Failure};
use cirrus_core::transfer::{TransferState, TransferTask};
use cirrus_core::types::{BackupProviderId, LocalSource, Namespace, QuotaStatus};
use futures::future::join_all;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::provider::BackupProvider;

pub type ProviderRegistry = HashMap<BackupProviderId, Arc<dyn BackupProvider>>;

/// One local file to back up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupTarget {
    /// Conversation / target id, matched against the enabled targets.
    pub id: String,
    pub source: LocalSource,
    pub remote_name: String,
}

impl BackupTarget {
    /// Target named after the source file.
    pub fn from_path(id: &str, path: impl Into<PathBuf>) -> Self {
        let source = LocalSource::new(path);
        let remote_name = source.file_name().unwrap_or(id).to_string();
        Self {
            id: id.to_string(),
            source,
            remote_name,
        }
    }
}

/// One remote object to restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreTarget {
    pub id: String,
    pub remote_name: String,
    pub destination: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Not in the enabled targets.
    NotEnabled,
    /// Larger than the automatic backup limit.
    TooLarge { size: u64, limit: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetResult {
    Succeeded { bytes: u64 },
    Failed(Failure),
    Cancelled,
    /// The provider rejected the session; the user must sign in again.
    NeedsReauth,
    /// Restore only: the remote object does not exist.
    NothingToRestore,
    Skipped(SkipReason),
}

impl TargetResult {
    pub fn is_success(&self) -> bool {
        matches!(self, TargetResult::Succeeded { .. })
    }

    fn from_error(err: CirrusError) -> Self {
        if err.is_auth() {
            TargetResult::NeedsReauth
        } else {
            TargetResult::Failed(Failure::from(err))
        }
    }

    fn from_state(state: TransferState) -> Self {
        match state {
            TransferState::Succeeded { bytes } => TargetResult::Succeeded { bytes },
            TransferState::Failed { failure, .. } if failure.kind == ErrorKind::Auth => {
                TargetResult::NeedsReauth
            }
            TransferState::Failed { failure, .. } => TargetResult::Failed(failure),
            TransferState::Cancelled { .. } => TargetResult::Cancelled,
            TransferState::Pending | TransferState::InProgress { .. } => TargetResult::Failed(
                Failure::new(ErrorKind::Local, "transfer ended without a terminal state"),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetOutcome {
    pub target: String,
    pub result: TargetResult,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchReport {
    /// No provider selected; nothing was attempted.
    Disabled,
    /// The namespace could not be reached because the session was rejected.
    NeedsReauth,
    /// The batch could not start.
    Aborted(Failure),
    /// One outcome per target, in input order.
    Completed(Vec<TargetOutcome>),
}

impl BatchReport {
    pub fn outcomes(&self) -> &[TargetOutcome] {
        match self {
            BatchReport::Completed(outcomes) => outcomes,
            _ => &[],
        }
    }

    pub fn needs_reauth(&self) -> bool {
        match self {
            BatchReport::NeedsReauth => true,
            BatchReport::Completed(outcomes) => outcomes
                .iter()
                .any(|o| o.result == TargetResult::NeedsReauth),
            _ => false,
        }
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes()
            .iter()
            .filter(|o| o.result.is_success())
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageStatus {
    Unconfigured,
    NeedsReauth(BackupProviderId),
    Ready {
        provider: BackupProviderId,
        quota: QuotaStatus,
    },
}

/// Per-target lifecycle within the current batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    Idle,
    NamespaceReady,
    Transferring,
    Done,
    Failed,
}

/// Announced when a target's transfer starts.
#[derive(Debug, Clone)]
pub struct TransferStarted {
    pub target: String,
    pub task: TransferTask,
}

pub struct BackupCoordinator {
    settings: BackupSettings,
    providers: ProviderRegistry,
    in_flight: Mutex<HashMap<Uuid, TransferStarted>>,
    phases: Mutex<HashMap<String, TransferPhase>>,
    started: broadcast::Sender<TransferStarted>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BackupCoordinator {
    pub fn new(settings: BackupSettings, providers: ProviderRegistry) -> Self {
        let (started, _) = broadcast::channel(64);
        Self {
            settings,
            providers,
            in_flight: Mutex::new(HashMap::new()),
            phases: Mutex::new(HashMap::new()),
            started,
        }
    }

    pub fn settings(&self) -> &BackupSettings {
        &self.settings
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Adapter for the selected provider, if one is selected and registered.
    pub fn active(&self) -> Option<Arc<dyn BackupProvider>> {
        if self.settings.provider.is_none() {
            return None;
        }
        self.providers.get(&self.settings.provider).cloned()
    }

    /// Transfers started from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferStarted> {
        self.started.subscribe()
    }

    /// Transfers started but not yet observed terminal.
    pub fn in_flight(&self) -> Vec<TransferStarted> {
        lock(&self.in_flight).values().cloned().collect()
    }

    pub fn phase(&self, target: &str) -> TransferPhase {
        lock(&self.phases)
            .get(target)
            .copied()
            .unwrap_or(TransferPhase::Idle)
    }

    pub async fn status(&self) -> cirrus_core::error::Result<StorageStatus> {
        let id = self.settings.provider;
        let Some(provider) = self.active() else {
            return Ok(StorageStatus::Unconfigured);
        };
        if !provider.is_signed_in() {
            return Ok(StorageStatus::NeedsReauth(id));
        }
        match provider.quota().await {
            Ok(quota) => Ok(StorageStatus::Ready {
                provider: id,
                quota,
            }),
            Err(e) if e.is_auth() => Ok(StorageStatus::NeedsReauth(id)),
            Err(e) => Err(e),
        }
    }

    pub async fn sign_out(&self) {
        if let Some(provider) = self.active() {
            provider.sign_out().await;
        }
    }

    /// Resolve the adapter and its namespace, or the report that ends the
    /// batch before any target is attempted.
    async fn prepare<'a>(
        &self,
        targets: impl Iterator<Item = &'a str>,
    ) -> Result<(Arc<dyn BackupProvider>, Namespace), BatchReport> {
        let targets: Vec<&str> = targets.collect();
        if self.settings.provider.is_none() {
            tracing::info!("Backup disabled, no provider selected");
            return Err(BatchReport::Disabled);
        }
        let Some(provider) = self.active() else {
            return Err(BatchReport::Aborted(Failure::new(
                ErrorKind::Precondition,
                format!("{} is selected but not configured", self.settings.provider),
            )));
        };

        match provider.ensure_namespace(&self.settings.namespace).await {
            Ok(namespace) => {
                self.set_phases(&targets, TransferPhase::NamespaceReady);
                Ok((provider, namespace))
            }
            Err(e) => {
                tracing::warn!(provider = %provider.id(), error = %e, "Namespace unavailable");
                self.set_phases(&targets, TransferPhase::Failed);
                if e.is_auth() {
                    Err(BatchReport::NeedsReauth)
                } else {
                    Err(BatchReport::Aborted(Failure::from(e)))
                }
            }
        }
    }

    fn set_phases(&self, targets: &[&str], phase: TransferPhase) {
        let mut phases = lock(&self.phases);
        for t in targets {
            phases.insert(t.to_string(), phase);
        }
    }

    fn track(&self, target: &str, task: &TransferTask) {
        let started = TransferStarted {
            target: target.to_string(),
            task: task.clone(),
        };
        lock(&self.in_flight).insert(task.id(), started.clone());
        lock(&self.phases).insert(target.to_string(), TransferPhase::Transferring);
        // No subscribers is fine.
        let _ = self.started.send(started);
    }

    fn settle(&self, target: &str, task: &TransferTask, result: &TargetResult) {
        lock(&self.in_flight).remove(&task.id());
        let phase = if result.is_success() {
            TransferPhase::Done
        } else {
            TransferPhase::Failed
        };
        lock(&self.phases).insert(target.to_string(), phase);
    }

    fn fail_start(&self, target: &str, err: CirrusError) -> TargetResult {
        tracing::warn!(target = target, error = %err, "Transfer not started");
        lock(&self.phases).insert(target.to_string(), TransferPhase::Failed);
        TargetResult::from_error(err)
    }

    /// Wait for every started task and fill in its outcome.
    async fn collect(
        &self,
        started: Vec<(usize, String, TransferTask)>,
        results: &mut [Option<TargetResult>],
    ) {
        let states = join_all(started.iter().map(|(_, _, task)| task.wait())).await;
        for ((idx, target, task), state) in started.into_iter().zip(states) {
            let result = TargetResult::from_state(state);
            self.settle(&target, &task, &result);
            results[idx] = Some(result);
        }
    }

    /// Back up every target to the active provider.
    ///
    /// A failing target never stops its siblings. With auto-delete enabled,
    /// a local source is removed only after its own upload succeeded.
    pub async fn backup(&self, targets: &[BackupTarget]) -> BatchReport {
        let (provider, namespace) = match self.prepare(targets.iter().map(|t| t.id.as_str())).await
        {
            Ok(ready) => ready,
            Err(report) => return report,
        };

        let mut results: Vec<Option<TargetResult>> = targets.iter().map(|_| None).collect();
        let mut started = Vec::new();
        for (idx, target) in targets.iter().enumerate() {
            match provider
                .upload(&namespace, &target.source, &target.remote_name)
                .await
            {
                Ok(task) => {
                    self.track(&target.id, &task);
                    started.push((idx, target.id.clone(), task));
                }
                Err(e) => results[idx] = Some(self.fail_start(&target.id, e)),
            }
        }
        self.collect(started, &mut results).await;

        if self.settings.auto_delete_local {
            for (target, result) in targets.iter().zip(&results) {
                if matches!(result, Some(r) if r.is_success()) {
                    delete_local(target).await;
                }
            }
        }

        let report = completed(targets.iter().map(|t| t.id.as_str()), results);
        tracing::info!(
            provider = %provider.id(),
            targets = targets.len(),
            succeeded = report.succeeded(),
            "Backup batch finished"
        );
        report
    }

    /// Restore every target from the active provider. A missing remote
    /// object is reported as nothing to restore, not as a failure.
    pub async fn restore(&self, targets: &[RestoreTarget]) -> BatchReport {
        let (provider, namespace) = match self.prepare(targets.iter().map(|t| t.id.as_str())).await
        {
            Ok(ready) => ready,
            Err(report) => return report,
        };

        let mut results: Vec<Option<TargetResult>> = targets.iter().map(|_| None).collect();
        let mut started = Vec::new();
        for (idx, target) in targets.iter().enumerate() {
            match provider.object_size(&namespace, &target.remote_name).await {
                Ok(_) => {}
                Err(CirrusError::NotFound(_)) => {
                    tracing::info!(
                        target = %target.id,
                        remote = %target.remote_name,
                        "Nothing to restore"
                    );
                    lock(&self.phases).insert(target.id.clone(), TransferPhase::Done);
                    results[idx] = Some(TargetResult::NothingToRestore);
                    continue;
                }
                Err(e) => {
                    results[idx] = Some(self.fail_start(&target.id, e));
                    continue;
                }
            }
            match provider
                .download(&namespace, &target.remote_name, &target.destination)
                .await
            {
                Ok(task) => {
                    self.track(&target.id, &task);
                    started.push((idx, target.id.clone(), task));
                }
                Err(e) => results[idx] = Some(self.fail_start(&target.id, e)),
            }
        }
        self.collect(started, &mut results).await;

        let report = completed(targets.iter().map(|t| t.id.as_str()), results);
        tracing::info!(
            provider = %provider.id(),
            targets = targets.len(),
            succeeded = report.succeeded(),
            "Restore batch finished"
        );
        report
    }

    /// Automatic backup of the enabled targets among `candidates`.
    ///
    /// Returns [`BatchReport::Disabled`] when automatic backup is off.
    /// Targets that are not enabled, or whose source exceeds the size limit,
    /// are reported as skipped.
    pub async fn auto_backup(&self, candidates: &[BackupTarget]) -> BatchReport {
        if !self.settings.auto_backup {
            return BatchReport::Disabled;
        }
        let limit = self.settings.auto_backup_max_bytes();

        let mut skipped: Vec<Option<SkipReason>> = Vec::with_capacity(candidates.len());
        let mut eligible = Vec::new();
        for target in candidates {
            if !self.settings.targets.contains(&target.id) {
                skipped.push(Some(SkipReason::NotEnabled));
                continue;
            }
            // Unreadable sources go through and fail as a precondition.
            match target.source.size().await {
                Ok(size) if size > limit => {
                    tracing::info!(target = %target.id, size, limit, "Skipping oversized source");
                    skipped.push(Some(SkipReason::TooLarge { size, limit }));
                }
                _ => {
                    skipped.push(None);
                    eligible.push(target.clone());
                }
            }
        }

        let mut ran = if eligible.is_empty() {
            Vec::new().into_iter()
        } else {
            match self.backup(&eligible).await {
                BatchReport::Completed(outcomes) => outcomes.into_iter(),
                other => return other,
            }
        };

        let outcomes = candidates
            .iter()
            .zip(skipped)
            .map(|(target, skip)| match skip {
                Some(reason) => TargetOutcome {
                    target: target.id.clone(),
                    result: TargetResult::Skipped(reason),
                },
                None => ran.next().unwrap_or_else(|| TargetOutcome {
                    target: target.id.clone(),
                    result: TargetResult::Failed(Failure::new(
                        ErrorKind::Local,
                        "missing batch outcome",
                    )),
                }),
            })
            .collect();
        BatchReport::Completed(outcomes)
    }
}

fn completed<'a>(
    ids: impl Iterator<Item = &'a str>,
    results: Vec<Option<TargetResult>>,
) -> BatchReport {
    BatchReport::Completed(
        ids.zip(results)
            .map(|(id, result)| TargetOutcome {
                target: id.to_string(),
                result: result.unwrap_or_else(|| {
                    TargetResult::Failed(Failure::new(ErrorKind::Local, "target not attempted"))
                }),
            })
            .collect(),
    )
}

async fn delete_local(target: &BackupTarget) {
    match tokio::fs::remove_file(target.source.path()).await {
        Ok(()) => tracing::info!(
            target = %target.id,
            path = %target.source.path().display(),
            "Deleted local source after backup"
        ),
        Err(e) => tracing::warn!(
            target = %target.id,
            path = %target.source.path().display(),
            error = %e,
            "Could not delete local source"
        ),
    }
}
