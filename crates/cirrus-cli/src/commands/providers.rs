use std::path::Path;

use cirrus_core::config::CirrusConfig;
use cirrus_storage::coordinator::BackupCoordinator;
use cirrus_storage::factory::create_registry;

/// Load the config and build a coordinator over every configured provider.
pub async fn open_coordinator(
    base_dir: &Path,
) -> anyhow::Result<(CirrusConfig, BackupCoordinator)> {
    let config_path = CirrusConfig::default_path(base_dir);
    let config = CirrusConfig::load(&config_path)?;
    let registry = create_registry(&config).await;
    let coordinator = BackupCoordinator::new(config.backup.clone(), registry);
    Ok((config, coordinator))
}
