use anyhow::Result;
use std::path::Path;

use cirrus_storage::coordinator::RestoreTarget;

use super::progress::{print_report, watch_transfers};
use super::providers::open_coordinator;

pub async fn run(names: &[String], dest: &Path, base_dir: &Path) -> Result<()> {
    let (config, coordinator) = open_coordinator(base_dir).await?;
    println!(
        "Restoring {} object(s) from {} to {}",
        names.len(),
        config.backup.provider,
        dest.display()
    );

    std::fs::create_dir_all(dest)?;

    let targets: Vec<RestoreTarget> = names
        .iter()
        .map(|name| RestoreTarget {
            id: Path::new(name)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or(name)
                .to_string(),
            remote_name: name.clone(),
            destination: dest.join(name),
        })
        .collect();

    let watcher = watch_transfers(coordinator.subscribe());
    let report = coordinator.restore(&targets).await;
    drop(coordinator);
    watcher.await?;

    print_report("Restore", &report)
}
