//! Factory for building provider adapters from configuration.

use std::sync::Arc;

use cirrus_core::config::CirrusConfig;
use cirrus_core::types::BackupProviderId;

use crate::coordinator::ProviderRegistry;
use crate::download_queue::HttpDownloadQueue;
use crate::google_drive::{GoogleDriveClient, GoogleDriveProvider};
use crate::kodo::{KodoClient, QiniuKodoProvider};
use crate::onedrive::{GraphClient, OAuthRefreshBroker, OneDriveProvider};
use crate::provider::BackupProvider;

/// Create the adapter for `id` from its table in `config`.
///
/// Supported providers:
/// - `google_drive`: bearer token from `[google_drive]`
/// - `onedrive`: refresh-token broker from `[onedrive]`, signed in eagerly when a
///   refresh token is present
/// - `tencent_cos`: S3-compatible endpoint from `[tencent_cos]` (compile with `s3` feature)
/// - `qiniu_kodo`: signed REST client from `[qiniu_kodo]` with the HTTP download queue
pub async fn create_provider(
    id: BackupProviderId,
    config: &CirrusConfig,
) -> anyhow::Result<Arc<dyn BackupProvider>> {
    let root_name = config.backup.namespace.as_str();
    match id {
        BackupProviderId::None => anyhow::bail!("No backup provider selected"),

        BackupProviderId::GoogleDrive => {
            let cfg = config
                .google_drive
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("[google_drive] section required"))?;
            let client = GoogleDriveClient::new(cfg.api_base.as_deref())?;
            let provider =
                GoogleDriveProvider::new(Arc::new(client), cfg.access_token.clone(), root_name);
            Ok(Arc::new(provider))
        }

        BackupProviderId::OneDrive => {
            let cfg = config
                .onedrive
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("[onedrive] section required"))?;
            let broker =
                OAuthRefreshBroker::new(&cfg.tenant, &cfg.client_id, cfg.refresh_token.clone());
            let provider = OneDriveProvider::new(
                Arc::new(broker),
                Arc::new(GraphClient::default()),
                cfg.scopes.clone(),
                root_name,
            );
            if cfg.refresh_token.is_some() {
                if let Err(e) = provider.sign_in().await {
                    tracing::warn!(
                        error = %e,
                        "OneDrive sign-in failed, re-authentication required"
                    );
                }
            }
            Ok(Arc::new(provider))
        }

        #[cfg(feature = "s3")]
        BackupProviderId::TencentCos => {
            let cfg = config
                .tencent_cos
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("[tencent_cos] section required"))?;
            let client = crate::cos::S3CosClient::new(cfg).await?;
            let provider =
                crate::cos::TencentCosProvider::new(Arc::new(client), &cfg.access_key, root_name);
            Ok(Arc::new(provider))
        }

        #[cfg(not(feature = "s3"))]
        BackupProviderId::TencentCos => {
            anyhow::bail!("s3 feature not enabled. Recompile with --features s3")
        }

        BackupProviderId::QiniuKodo => {
            let cfg = config
                .qiniu_kodo
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("[qiniu_kodo] section required"))?;
            let client = KodoClient::new(cfg)?;
            let provider = QiniuKodoProvider::new(
                Arc::new(client),
                Arc::new(HttpDownloadQueue::default()),
                root_name,
                config.backup.poll_interval(),
            );
            Ok(Arc::new(provider))
        }
    }
}

/// Build every configured provider. Providers that fail to build are logged
/// and left out.
pub async fn create_registry(config: &CirrusConfig) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    for id in config.configured_providers() {
        match create_provider(id, config).await {
            Ok(provider) => {
                registry.insert(id, provider);
            }
            Err(e) => tracing::warn!(provider = %id, error = %e, "Provider unavailable"),
        }
    }
    registry
}
