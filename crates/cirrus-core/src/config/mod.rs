use crate::error::{CirrusError, Result};
use crate::types::BackupProviderId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Top-level Cirrus configuration stored as TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CirrusConfig {
    pub backup: BackupSettings,
    #[serde(default)]
    pub google_drive: Option<GoogleDriveConfig>,
    #[serde(default)]
    pub onedrive: Option<OneDriveConfig>,
    #[serde(default)]
    pub tencent_cos: Option<CosConfig>,
    #[serde(default)]
    pub qiniu_kodo: Option<KodoConfig>,
}

/// Settings read by the backup coordinator. Never written by it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSettings {
    /// Default backup service. `none` disables backup.
    #[serde(default)]
    pub provider: BackupProviderId,
    /// Back up enabled targets automatically.
    #[serde(default)]
    pub auto_backup: bool,
    /// Delete the local source once its upload succeeded.
    #[serde(default)]
    pub auto_delete_local: bool,
    /// Targets (conversation ids) enabled for automatic backup.
    #[serde(default)]
    pub targets: BTreeSet<String>,
    /// Root folder / key prefix created on the provider.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Download-queue polling interval.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Sources larger than this are skipped by automatic backup.
    #[serde(default = "default_auto_backup_max_file_mb")]
    pub auto_backup_max_file_mb: f64,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            provider: BackupProviderId::None,
            auto_backup: false,
            auto_delete_local: false,
            targets: BTreeSet::new(),
            namespace: default_namespace(),
            poll_interval_ms: default_poll_interval_ms(),
            auto_backup_max_file_mb: default_auto_backup_max_file_mb(),
        }
    }
}

impl BackupSettings {
    pub fn auto_backup_max_bytes(&self) -> u64 {
        (self.auto_backup_max_file_mb.max(0.0) * 1024.0 * 1024.0) as u64
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

fn default_namespace() -> String {
    "Cirrus".to_string()
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_auto_backup_max_file_mb() -> f64 {
    20.0
}

/// Consumer drive: an OAuth access token obtained by the host application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleDriveConfig {
    #[serde(default)]
    pub access_token: Option<String>,
    /// Override for the REST base URL (testing, proxies).
    #[serde(default)]
    pub api_base: Option<String>,
}

/// Enterprise drive behind an identity broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneDriveConfig {
    pub client_id: String,
    #[serde(default = "default_tenant")]
    pub tenant: String,
    /// Refresh token of the signed-in account, if any.
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_onedrive_scopes")]
    pub scopes: Vec<String>,
}

fn default_tenant() -> String {
    "common".to_string()
}

fn default_onedrive_scopes() -> Vec<String> {
    vec![
        "User.Read".to_string(),
        "Files.ReadWrite.All".to_string(),
        "offline_access".to_string(),
    ]
}

/// S3-compatible object store A (static access/secret keys).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CosConfig {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub bucket: String,
    /// Custom endpoint. Defaults to `https://cos.<region>.myqcloud.com`.
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

impl CosConfig {
    pub fn endpoint(&self) -> String {
        self.endpoint_url
            .clone()
            .unwrap_or_else(|| format!("https://cos.{}.myqcloud.com", self.region))
    }
}

/// Object store B (static access/secret keys, private download domain).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KodoConfig {
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    /// Download domain bound to the bucket.
    pub domain: String,
    #[serde(default = "default_kodo_upload_host")]
    pub upload_host: String,
    #[serde(default = "default_kodo_rs_host")]
    pub rs_host: String,
    #[serde(default = "default_kodo_rsf_host")]
    pub rsf_host: String,
}

fn default_kodo_upload_host() -> String {
    "https://upload.qiniup.com".to_string()
}

fn default_kodo_rs_host() -> String {
    "https://rs.qiniuapi.com".to_string()
}

fn default_kodo_rsf_host() -> String {
    "https://rsf.qiniuapi.com".to_string()
}

impl CirrusConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(CirrusError::ConfigNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| CirrusError::TomlDe(e.to_string()))
    }

    /// Save config to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| CirrusError::TomlSer(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Default config for `cirrus init`: backup disabled, no providers.
    pub fn default_config() -> Self {
        Self {
            backup: BackupSettings::default(),
            google_drive: None,
            onedrive: None,
            tencent_cos: None,
            qiniu_kodo: None,
        }
    }

    /// Providers that have a configuration table.
    pub fn configured_providers(&self) -> Vec<BackupProviderId> {
        let mut ids = Vec::new();
        if self.google_drive.is_some() {
            ids.push(BackupProviderId::GoogleDrive);
        }
        if self.onedrive.is_some() {
            ids.push(BackupProviderId::OneDrive);
        }
        if self.tencent_cos.is_some() {
            ids.push(BackupProviderId::TencentCos);
        }
        if self.qiniu_kodo.is_some() {
            ids.push(BackupProviderId::QiniuKodo);
        }
        ids
    }

    /// Resolve the config file path: `<base_dir>/cirrus.toml`
    pub fn default_path(base_dir: &Path) -> PathBuf {
        base_dir.join("cirrus.toml")
    }

    /// Resolve the default cirrus home directory: `~/.cirrus`
    pub fn default_base_dir() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|h| h.join(".cirrus"))
            .ok_or_else(|| CirrusError::Config("Cannot determine home directory".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn roundtrip_config() {
        let tmp = TempDir::new().unwrap();
        let path = CirrusConfig::default_path(tmp.path());
        let config = CirrusConfig::default_config();
        config.save(&path).unwrap();
        let loaded = CirrusConfig::load(&path).unwrap();
        assert_eq!(loaded.backup.provider, BackupProviderId::None);
        assert_eq!(loaded.backup.namespace, "Cirrus");
        assert!(loaded.configured_providers().is_empty());
    }

    #[test]
    fn load_nonexistent_returns_error() {
        let result = CirrusConfig::load(Path::new("/nonexistent/cirrus.toml"));
        assert!(matches!(result, Err(CirrusError::ConfigNotFound(_))));
    }

    #[test]
    fn parses_provider_tables() {
        let toml = r#"
            [backup]
            provider = "tencent_cos"
            auto_delete_local = true
            targets = ["chat-1", "chat-2"]

            [tencent_cos]
            access_key = "AK"
            secret_key = "SK"
            region = "ap-guangzhou"
            bucket = "backup-1250000000"

            [qiniu_kodo]
            access_key = "AK"
            secret_key = "SK"
            bucket = "backup"
            domain = "files.example.com"
        "#;
        let config: CirrusConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.backup.provider, BackupProviderId::TencentCos);
        assert!(config.backup.auto_delete_local);
        assert!(!config.backup.auto_backup);
        assert_eq!(config.backup.targets.len(), 2);
        assert_eq!(config.backup.poll_interval_ms, 500);
        assert_eq!(
            config.tencent_cos.as_ref().unwrap().endpoint(),
            "https://cos.ap-guangzhou.myqcloud.com"
        );
        assert_eq!(
            config.qiniu_kodo.as_ref().unwrap().upload_host,
            "https://upload.qiniup.com"
        );
        assert_eq!(
            config.configured_providers(),
            vec![BackupProviderId::TencentCos, BackupProviderId::QiniuKodo]
        );
    }

    #[test]
    fn auto_backup_limit_in_bytes() {
        let settings = BackupSettings {
            auto_backup_max_file_mb: 1.5,
            ..Default::default()
        };
        assert_eq!(settings.auto_backup_max_bytes(), 1_572_864);
    }
}
