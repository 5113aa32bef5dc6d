use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{CirrusError, Result};

/// Backup service selected by the user. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupProviderId {
    /// Backup disabled.
    None,
    /// Consumer drive (OAuth account session, blocking JSON/HTTP client).
    GoogleDrive,
    /// Enterprise drive behind an identity broker.
    OneDrive,
    /// S3-compatible object store with a listener-based transfer manager.
    TencentCos,
    /// Object store with blocking upload and signed private downloads.
    QiniuKodo,
}

impl BackupProviderId {
    pub const ALL: [BackupProviderId; 4] = [
        BackupProviderId::GoogleDrive,
        BackupProviderId::OneDrive,
        BackupProviderId::TencentCos,
        BackupProviderId::QiniuKodo,
    ];

    /// Stable integer code persisted by settings storage.
    pub fn code(&self) -> u32 {
        match self {
            BackupProviderId::None => 0,
            BackupProviderId::GoogleDrive => 1001,
            BackupProviderId::OneDrive => 1002,
            BackupProviderId::TencentCos => 1003,
            BackupProviderId::QiniuKodo => 1004,
        }
    }

    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(BackupProviderId::None),
            1001 => Ok(BackupProviderId::GoogleDrive),
            1002 => Ok(BackupProviderId::OneDrive),
            1003 => Ok(BackupProviderId::TencentCos),
            1004 => Ok(BackupProviderId::QiniuKodo),
            other => Err(CirrusError::InvalidProviderId(other.to_string())),
        }
    }

    pub fn is_none(&self) -> bool {
        *self == BackupProviderId::None
    }
}

impl Default for BackupProviderId {
    fn default() -> Self {
        BackupProviderId::None
    }
}

impl fmt::Display for BackupProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupProviderId::None => write!(f, "none"),
            BackupProviderId::GoogleDrive => write!(f, "google_drive"),
            BackupProviderId::OneDrive => write!(f, "onedrive"),
            BackupProviderId::TencentCos => write!(f, "tencent_cos"),
            BackupProviderId::QiniuKodo => write!(f, "qiniu_kodo"),
        }
    }
}

impl std::str::FromStr for BackupProviderId {
    type Err = CirrusError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "disabled" | "" => Ok(BackupProviderId::None),
            "google_drive" | "google-drive" | "gdrive" => Ok(BackupProviderId::GoogleDrive),
            "onedrive" | "one-drive" => Ok(BackupProviderId::OneDrive),
            "tencent_cos" | "tencent-cos" | "cos" => Ok(BackupProviderId::TencentCos),
            "qiniu_kodo" | "qiniu-kodo" | "kodo" => Ok(BackupProviderId::QiniuKodo),
            _ => Err(CirrusError::InvalidProviderId(s.to_string())),
        }
    }
}

/// Storage usage reported by a provider.
///
/// When both totals are known `app_used_space <= used_space <= total_space`
/// holds; constructors clamp vendor figures that disagree. Object stores with
/// no quota concept report `None` for both totals, never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaStatus {
    total_space: Option<u64>,
    used_space: Option<u64>,
    app_used_space: u64,
}

impl QuotaStatus {
    /// Quota from a provider that knows its limit and usage.
    pub fn known(total_space: u64, used_space: u64, app_used_space: u64) -> Self {
        let used = used_space.min(total_space);
        let app = app_used_space.min(used);
        if used != used_space || app != app_used_space {
            tracing::warn!(
                total_space,
                used_space,
                app_used_space,
                "Provider quota figures inconsistent, clamping"
            );
        }
        Self {
            total_space: Some(total_space),
            used_space: Some(used),
            app_used_space: app,
        }
    }

    /// Quota from a provider with no quota concept: only the app's own usage.
    pub fn app_only(app_used_space: u64) -> Self {
        Self {
            total_space: None,
            used_space: None,
            app_used_space,
        }
    }

    pub fn total_space(&self) -> Option<u64> {
        self.total_space
    }

    pub fn used_space(&self) -> Option<u64> {
        self.used_space
    }

    pub fn app_used_space(&self) -> u64 {
        self.app_used_space
    }

    pub fn free_space(&self) -> Option<u64> {
        Some(self.total_space?.saturating_sub(self.used_space?))
    }
}

/// Provider-specific handle to the application's root storage location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NamespaceHandle {
    /// Folder id on drive-style providers.
    FolderId(String),
    /// Key prefix on object stores, without a trailing slash.
    KeyPrefix(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    pub provider: BackupProviderId,
    pub name: String,
    pub handle: NamespaceHandle,
}

impl Namespace {
    pub fn folder(provider: BackupProviderId, name: &str, folder_id: &str) -> Self {
        Self {
            provider,
            name: name.to_string(),
            handle: NamespaceHandle::FolderId(folder_id.to_string()),
        }
    }

    pub fn prefix(provider: BackupProviderId, name: &str) -> Self {
        Self {
            provider,
            name: name.to_string(),
            handle: NamespaceHandle::KeyPrefix(name.trim_end_matches('/').to_string()),
        }
    }

    pub fn folder_id(&self) -> Option<&str> {
        match &self.handle {
            NamespaceHandle::FolderId(id) => Some(id),
            NamespaceHandle::KeyPrefix(_) => None,
        }
    }

    pub fn key_prefix(&self) -> Option<&str> {
        match &self.handle {
            NamespaceHandle::KeyPrefix(p) => Some(p),
            NamespaceHandle::FolderId(_) => None,
        }
    }

    /// Object key for `remote_name` under a key-prefix namespace.
    pub fn object_key(&self, remote_name: &str) -> Option<String> {
        self.key_prefix().map(|p| format!("{p}/{remote_name}"))
    }
}

/// Local file handed to an upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalSource {
    path: PathBuf,
}

impl LocalSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }

    /// Size of the source in bytes. A missing or non-file source is a
    /// precondition failure, reported before any transfer starts.
    pub async fn size(&self) -> Result<u64> {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) if meta.is_file() => Ok(meta.len()),
            Ok(_) => Err(CirrusError::Precondition(format!(
                "{} is not a regular file",
                self.path.display()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(
                CirrusError::Precondition(format!("{} does not exist", self.path.display())),
            ),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferDirection {
    Upload,
    Download,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::Upload => write!(f, "upload"),
            TransferDirection::Download => write!(f, "download"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn provider_id_parse() {
        assert_eq!(
            "gdrive".parse::<BackupProviderId>().unwrap(),
            BackupProviderId::GoogleDrive
        );
        assert_eq!(
            "onedrive".parse::<BackupProviderId>().unwrap(),
            BackupProviderId::OneDrive
        );
        assert_eq!(
            "cos".parse::<BackupProviderId>().unwrap(),
            BackupProviderId::TencentCos
        );
        assert_eq!(
            "kodo".parse::<BackupProviderId>().unwrap(),
            BackupProviderId::QiniuKodo
        );
        assert_eq!(
            "none".parse::<BackupProviderId>().unwrap(),
            BackupProviderId::None
        );
        assert!("dropbox".parse::<BackupProviderId>().is_err());
    }

    #[test]
    fn provider_codes_are_stable() {
        assert_eq!(BackupProviderId::None.code(), 0);
        assert_eq!(BackupProviderId::GoogleDrive.code(), 1001);
        assert_eq!(BackupProviderId::OneDrive.code(), 1002);
        for id in BackupProviderId::ALL {
            assert_eq!(BackupProviderId::from_code(id.code()).unwrap(), id);
        }
        assert!(BackupProviderId::from_code(7).is_err());
    }

    #[test]
    fn known_quota_keeps_ordering() {
        let q = QuotaStatus::known(100, 40, 10);
        assert_eq!(q.total_space(), Some(100));
        assert_eq!(q.used_space(), Some(40));
        assert_eq!(q.app_used_space(), 10);
        assert_eq!(q.free_space(), Some(60));
    }

    #[test]
    fn inconsistent_quota_is_clamped() {
        let q = QuotaStatus::known(100, 150, 200);
        let total = q.total_space().unwrap();
        let used = q.used_space().unwrap();
        assert!(q.app_used_space() <= used);
        assert!(used <= total);
    }

    #[test]
    fn app_only_quota_has_unknown_totals() {
        let q = QuotaStatus::app_only(0);
        assert_eq!(q.total_space(), None);
        assert_eq!(q.used_space(), None);
        assert_eq!(q.free_space(), None);
    }

    #[test]
    fn object_key_under_prefix() {
        let ns = Namespace::prefix(BackupProviderId::TencentCos, "Cirrus/");
        assert_eq!(ns.key_prefix(), Some("Cirrus"));
        assert_eq!(ns.object_key("chat.db").as_deref(), Some("Cirrus/chat.db"));
        let folder = Namespace::folder(BackupProviderId::GoogleDrive, "Cirrus", "f1");
        assert_eq!(folder.object_key("chat.db"), None);
        assert_eq!(folder.folder_id(), Some("f1"));
    }

    #[tokio::test]
    async fn missing_local_source_is_precondition() {
        let tmp = TempDir::new().unwrap();
        let src = LocalSource::new(tmp.path().join("absent.bin"));
        let err = src.size().await.unwrap_err();
        assert!(matches!(err, CirrusError::Precondition(_)));
    }

    #[tokio::test]
    async fn local_source_size() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.bin");
        std::fs::write(&path, b"12345").unwrap();
        let src = LocalSource::new(&path);
        assert_eq!(src.size().await.unwrap(), 5);
        assert_eq!(src.file_name(), Some("a.bin"));
    }
}
