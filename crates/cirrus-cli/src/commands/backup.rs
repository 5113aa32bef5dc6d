use anyhow::Result;
use std::path::{Path, PathBuf};

use cirrus_storage::coordinator::BackupTarget;

use super::progress::{print_report, watch_transfers};
use super::providers::open_coordinator;

/// Target id for a source: its file stem, falling back to the full path.
fn target_for(path: &Path) -> BackupTarget {
    let id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| path.display().to_string());
    BackupTarget::from_path(&id, path)
}

pub async fn run(paths: &[PathBuf], auto: bool, base_dir: &Path) -> Result<()> {
    let (config, coordinator) = open_coordinator(base_dir).await?;
    println!(
        "Backing up {} file(s) to {} under '{}'",
        paths.len(),
        config.backup.provider,
        config.backup.namespace
    );

    let targets: Vec<BackupTarget> = paths.iter().map(|p| target_for(p)).collect();
    let watcher = watch_transfers(coordinator.subscribe());
    let report = if auto {
        coordinator.auto_backup(&targets).await
    } else {
        coordinator.backup(&targets).await
    };
    drop(coordinator);
    watcher.await?;

    print_report("Backup", &report)
}
