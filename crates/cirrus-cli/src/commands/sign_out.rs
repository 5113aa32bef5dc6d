use anyhow::Result;
use std::path::Path;

use cirrus_core::config::CirrusConfig;
use cirrus_core::types::BackupProviderId;

use super::providers::open_coordinator;

pub async fn run(base_dir: &Path) -> Result<()> {
    let (mut config, coordinator) = open_coordinator(base_dir).await?;
    let id = config.backup.provider;
    if id.is_none() {
        println!("No provider selected.");
        return Ok(());
    }

    coordinator.sign_out().await;

    // Forget stored session credentials so the next run starts signed out.
    let forgot = match id {
        BackupProviderId::GoogleDrive => config
            .google_drive
            .as_mut()
            .and_then(|g| g.access_token.take())
            .is_some(),
        BackupProviderId::OneDrive => config
            .onedrive
            .as_mut()
            .and_then(|o| o.refresh_token.take())
            .is_some(),
        _ => false,
    };
    if forgot {
        config.save(&CirrusConfig::default_path(base_dir))?;
    }

    println!("Signed out of {id}.");
    Ok(())
}
