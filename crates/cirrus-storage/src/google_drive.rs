//! Consumer drive backed by the Drive v3 REST API.
//!
//! The vendor surface is blocking: every [`DriveApi`] call runs on a
//! `spawn_blocking` thread and the adapter turns it into the async
//! [`BackupProvider`] contract.

use async_trait::async_trait;
use cirrus_core::error::{CirrusError, Result};
use cirrus_core::transfer::TransferTask;
use cirrus_core::types::{BackupProviderId, LocalSource, Namespace, QuotaStatus, TransferDirection};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::http::{self, BlockingBridge};
use crate::provider::{
    BackupProvider, ProgressFn, SessionCell, check_namespace, check_remote_name,
    reporter_progress, run_blocking, spawn_transfer,
};

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveQuota {
    /// Absent on unlimited plans.
    pub limit: Option<u64>,
    pub usage: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    /// Absent for native documents.
    pub size: Option<u64>,
}

/// Blocking drive client. Calls may block for the whole network round trip.
pub trait DriveApi: Send + Sync + 'static {
    fn about(&self, token: &str) -> Result<DriveQuota>;

    /// Oldest non-trashed folder called `name` in the drive root.
    fn find_folder(&self, token: &str, name: &str) -> Result<Option<String>>;

    fn create_folder(&self, token: &str, name: &str) -> Result<String>;

    fn list_children(&self, token: &str, folder_id: &str) -> Result<Vec<DriveFile>>;

    /// Most recently modified file called `name` inside `folder_id`.
    fn find_file(&self, token: &str, folder_id: &str, name: &str) -> Result<Option<DriveFile>>;

    fn upload_file(
        &self,
        token: &str,
        folder_id: &str,
        name: &str,
        source: &Path,
        size: u64,
        progress: ProgressFn,
    ) -> Result<DriveFile>;

    fn download_file(
        &self,
        token: &str,
        file_id: &str,
        destination: &Path,
        progress: ProgressFn,
    ) -> Result<u64>;
}

/// Session: an OAuth access token obtained by the host application.
#[derive(Clone)]
pub struct DriveSession {
    pub access_token: String,
}

pub struct GoogleDriveProvider {
    api: Arc<dyn DriveApi>,
    session: Arc<SessionCell<DriveSession>>,
    root_name: String,
}

impl GoogleDriveProvider {
    pub fn new(api: Arc<dyn DriveApi>, access_token: Option<String>, root_name: &str) -> Self {
        let session = access_token.map(|access_token| DriveSession { access_token });
        Self {
            api,
            session: Arc::new(SessionCell::new(BackupProviderId::GoogleDrive, session)),
            root_name: root_name.to_string(),
        }
    }

    /// Install a fresh access token.
    pub fn sign_in(&self, access_token: &str) {
        self.session.set(DriveSession {
            access_token: access_token.to_string(),
        });
        tracing::info!("Signed in to Google Drive");
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn DriveApi, &str) -> Result<T> + Send + 'static,
    {
        let token = self.session.get()?.access_token;
        let api = Arc::clone(&self.api);
        let result = run_blocking(move || f(api.as_ref(), &token)).await;
        self.session.observe(result)
    }

    fn folder_of(&self, namespace: &Namespace) -> Result<String> {
        check_namespace(BackupProviderId::GoogleDrive, namespace)?;
        namespace.folder_id().map(str::to_string).ok_or_else(|| {
            CirrusError::Precondition(format!("namespace {} has no folder id", namespace.name))
        })
    }
}

fn ensure_folder(api: &dyn DriveApi, token: &str, name: &str) -> Result<String> {
    if let Some(id) = api.find_folder(token, name)? {
        return Ok(id);
    }
    match api.create_folder(token, name) {
        // A concurrent creator may have won; the oldest folder is canonical.
        Ok(created) => Ok(api.find_folder(token, name)?.unwrap_or(created)),
        Err(e) if e.is_auth() => Err(e),
        Err(e) => api.find_folder(token, name)?.ok_or(e),
    }
}

#[async_trait]
impl BackupProvider for GoogleDriveProvider {
    fn id(&self) -> BackupProviderId {
        BackupProviderId::GoogleDrive
    }

    fn name(&self) -> &str {
        "Google Drive"
    }

    fn is_signed_in(&self) -> bool {
        self.session.is_present()
    }

    async fn quota(&self) -> Result<QuotaStatus> {
        let root = self.root_name.clone();
        self.call(move |api, token| {
            let about = api.about(token)?;
            let app_used = match api.find_folder(token, &root)? {
                Some(folder) => api
                    .list_children(token, &folder)?
                    .iter()
                    .filter_map(|f| f.size)
                    .sum(),
                None => 0,
            };
            Ok(match about.limit {
                Some(limit) => QuotaStatus::known(limit, about.usage, app_used),
                None => QuotaStatus::app_only(app_used),
            })
        })
        .await
    }

    async fn ensure_namespace(&self, name: &str) -> Result<Namespace> {
        let folder_name = name.to_string();
        let id = self
            .call(move |api, token| ensure_folder(api, token, &folder_name))
            .await?;
        tracing::debug!(namespace = name, folder_id = %id, "Drive namespace ready");
        Ok(Namespace::folder(BackupProviderId::GoogleDrive, name, &id))
    }

    async fn upload(
        &self,
        namespace: &Namespace,
        source: &LocalSource,
        remote_name: &str,
    ) -> Result<TransferTask> {
        let folder = self.folder_of(namespace)?;
        check_remote_name(remote_name)?;
        let size = source.size().await?;
        let token = self.session.get()?.access_token;

        let (task, reporter) = TransferTask::new(
            TransferDirection::Upload,
            source.path(),
            &format!("{}/{remote_name}", namespace.name),
        );
        let api = Arc::clone(&self.api);
        let path = source.path().to_path_buf();
        let name = remote_name.to_string();
        spawn_transfer(Arc::clone(&self.session), reporter, move |r| {
            let progress = reporter_progress(&r);
            async move {
                run_blocking(move || {
                    api.upload_file(&token, &folder, &name, &path, size, progress)?;
                    Ok(size)
                })
                .await
            }
        });
        tracing::info!(task_id = %task.id(), remote = remote_name, size, "Drive upload started");
        Ok(task)
    }

    async fn download(
        &self,
        namespace: &Namespace,
        remote_name: &str,
        destination: &Path,
    ) -> Result<TransferTask> {
        let folder = self.folder_of(namespace)?;
        check_remote_name(remote_name)?;
        let token = self.session.get()?.access_token;

        let (task, reporter) = TransferTask::new(
            TransferDirection::Download,
            destination,
            &format!("{}/{remote_name}", namespace.name),
        );
        let api = Arc::clone(&self.api);
        let name = remote_name.to_string();
        let dest: PathBuf = destination.to_path_buf();
        spawn_transfer(Arc::clone(&self.session), reporter, move |r| {
            let progress = reporter_progress(&r);
            async move {
                run_blocking(move || {
                    let file = api
                        .find_file(&token, &folder, &name)?
                        .ok_or_else(|| CirrusError::NotFound(name.clone()))?;
                    api.download_file(&token, &file.id, &dest, progress)
                })
                .await
            }
        });
        Ok(task)
    }

    async fn object_size(&self, namespace: &Namespace, remote_name: &str) -> Result<u64> {
        let folder = self.folder_of(namespace)?;
        let name = remote_name.to_string();
        self.call(move |api, token| {
            api.find_file(token, &folder, &name)?
                .map(|f| f.size.unwrap_or(0))
                .ok_or(CirrusError::NotFound(name))
        })
        .await
    }

    async fn sign_out(&self) {
        if self.session.invalidate() {
            tracing::info!("Signed out of Google Drive");
        }
    }
}

/// [`DriveApi`] over the Drive v3 REST endpoints.
pub struct GoogleDriveClient {
    http: reqwest::Client,
    api_base: String,
    bridge: BlockingBridge,
}

impl GoogleDriveClient {
    pub const DEFAULT_API_BASE: &'static str = "https://www.googleapis.com";

    /// Must be called from inside a tokio runtime.
    pub fn new(api_base: Option<&str>) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::new(),
            api_base: api_base
                .unwrap_or(Self::DEFAULT_API_BASE)
                .trim_end_matches('/')
                .to_string(),
            bridge: BlockingBridge::current()?,
        })
    }

    fn files_url(&self) -> String {
        format!("{}/drive/v3/files", self.api_base)
    }

    async fn get_json(
        &self,
        token: &str,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<serde_json::Value> {
        let resp = self
            .http
            .get(url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await
            .map_err(http::transport_error)?;
        http::check(resp).await?.json().await.map_err(http::transport_error)
    }

    async fn query_files(&self, token: &str, q: &str, order_by: &str) -> Result<Vec<DriveFile>> {
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![
                ("q", q),
                ("spaces", "drive"),
                ("fields", "nextPageToken,files(id,name,size)"),
                ("orderBy", order_by),
                ("pageSize", "1000"),
            ];
            if let Some(t) = page_token.as_deref() {
                query.push(("pageToken", t));
            }
            let json = self.get_json(token, &self.files_url(), &query).await?;
            files.extend(
                json["files"]
                    .as_array()
                    .map(Vec::as_slice)
                    .unwrap_or_default()
                    .iter()
                    .map(parse_file),
            );
            match json["nextPageToken"].as_str() {
                Some(next) => page_token = Some(next.to_string()),
                None => return Ok(files),
            }
        }
    }
}

fn parse_file(f: &serde_json::Value) -> DriveFile {
    DriveFile {
        id: f["id"].as_str().unwrap_or("").to_string(),
        name: f["name"].as_str().unwrap_or("").to_string(),
        size: f["size"].as_str().and_then(|s| s.parse().ok()),
    }
}

/// Quote a value for a Drive search query.
fn quoted(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

impl DriveApi for GoogleDriveClient {
    fn about(&self, token: &str) -> Result<DriveQuota> {
        self.bridge.block_on(async {
            let url = format!("{}/drive/v3/about", self.api_base);
            let json = self
                .get_json(token, &url, &[("fields", "storageQuota")])
                .await?;
            let quota = &json["storageQuota"];
            Ok(DriveQuota {
                limit: quota["limit"].as_str().and_then(|s| s.parse().ok()),
                usage: quota["usage"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
            })
        })
    }

    fn find_folder(&self, token: &str, name: &str) -> Result<Option<String>> {
        let q = format!(
            "name = {} and mimeType = '{FOLDER_MIME}' and 'root' in parents and trashed = false",
            quoted(name)
        );
        self.bridge.block_on(async {
            let folders = self.query_files(token, &q, "createdTime").await?;
            Ok(folders.into_iter().next().map(|f| f.id))
        })
    }

    fn create_folder(&self, token: &str, name: &str) -> Result<String> {
        self.bridge.block_on(async {
            let resp = self
                .http
                .post(self.files_url())
                .bearer_auth(token)
                .query(&[("fields", "id")])
                .json(&serde_json::json!({
                    "name": name,
                    "mimeType": FOLDER_MIME,
                    "parents": ["root"],
                }))
                .send()
                .await
                .map_err(http::transport_error)?;
            let json: serde_json::Value =
                http::check(resp).await?.json().await.map_err(http::transport_error)?;
            json["id"]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| CirrusError::Provider("folder create returned no id".into()))
        })
    }

    fn list_children(&self, token: &str, folder_id: &str) -> Result<Vec<DriveFile>> {
        let q = format!("{} in parents and trashed = false", quoted(folder_id));
        self.bridge.block_on(self.query_files(token, &q, "name"))
    }

    fn find_file(&self, token: &str, folder_id: &str, name: &str) -> Result<Option<DriveFile>> {
        let q = format!(
            "name = {} and {} in parents and trashed = false",
            quoted(name),
            quoted(folder_id)
        );
        self.bridge.block_on(async {
            let files = self.query_files(token, &q, "modifiedTime desc").await?;
            Ok(files.into_iter().next())
        })
    }

    fn upload_file(
        &self,
        token: &str,
        folder_id: &str,
        name: &str,
        source: &Path,
        size: u64,
        progress: ProgressFn,
    ) -> Result<DriveFile> {
        self.bridge.block_on(async {
            // Resumable session: metadata first, then the bytes in one PUT.
            let resp = self
                .http
                .post(format!("{}/upload/drive/v3/files", self.api_base))
                .bearer_auth(token)
                .query(&[("uploadType", "resumable"), ("fields", "id,name,size")])
                .header("X-Upload-Content-Length", size.to_string())
                .json(&serde_json::json!({ "name": name, "parents": [folder_id] }))
                .send()
                .await
                .map_err(http::transport_error)?;
            let resp = http::check(resp).await?;
            let location = resp
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| CirrusError::Provider("upload session has no location".into()))?
                .to_string();

            let body = http::file_body(source, size, progress).await?;
            let resp = self
                .http
                .put(location)
                .header(reqwest::header::CONTENT_LENGTH, size)
                .body(body)
                .send()
                .await
                .map_err(http::transport_error)?;
            let json: serde_json::Value =
                http::check(resp).await?.json().await.map_err(http::transport_error)?;
            Ok(parse_file(&json))
        })
    }

    fn download_file(
        &self,
        token: &str,
        file_id: &str,
        destination: &Path,
        progress: ProgressFn,
    ) -> Result<u64> {
        self.bridge.block_on(async {
            let resp = self
                .http
                .get(format!("{}/{}", self.files_url(), urlencoding::encode(file_id)))
                .bearer_auth(token)
                .query(&[("alt", "media")])
                .send()
                .await
                .map_err(http::transport_error)?;
            let resp = http::check(resp).await?;
            http::write_body(resp, destination, &progress).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_core::transfer::TransferState;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// In-memory drive: one root level of folders, files inside them.
    #[derive(Default)]
    struct FakeDrive {
        folders: Mutex<Vec<(String, String)>>,
        files: Mutex<Vec<(String, DriveFile, Vec<u8>)>>,
        creates: AtomicUsize,
        calls: AtomicUsize,
        reject_token: Mutex<Option<String>>,
    }

    impl FakeDrive {
        fn enter(&self, token: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.reject_token.lock().unwrap().as_deref() == Some(token) {
                return Err(CirrusError::Auth("token expired".into()));
            }
            Ok(())
        }
    }

    impl DriveApi for FakeDrive {
        fn about(&self, token: &str) -> Result<DriveQuota> {
            self.enter(token)?;
            Ok(DriveQuota {
                limit: Some(1000),
                usage: 400,
            })
        }

        fn find_folder(&self, token: &str, name: &str) -> Result<Option<String>> {
            self.enter(token)?;
            Ok(self
                .folders
                .lock()
                .unwrap()
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, id)| id.clone()))
        }

        fn create_folder(&self, token: &str, name: &str) -> Result<String> {
            self.enter(token)?;
            let n = self.creates.fetch_add(1, Ordering::SeqCst);
            let id = format!("folder-{n}");
            self.folders.lock().unwrap().push((name.into(), id.clone()));
            Ok(id)
        }

        fn list_children(&self, token: &str, folder_id: &str) -> Result<Vec<DriveFile>> {
            self.enter(token)?;
            Ok(self
                .files
                .lock()
                .unwrap()
                .iter()
                .filter(|(parent, _, _)| parent == folder_id)
                .map(|(_, f, _)| f.clone())
                .collect())
        }

        fn find_file(&self, token: &str, folder_id: &str, name: &str) -> Result<Option<DriveFile>> {
            Ok(self
                .list_children(token, folder_id)?
                .into_iter()
                .rev()
                .find(|f| f.name == name))
        }

        fn upload_file(
            &self,
            token: &str,
            folder_id: &str,
            name: &str,
            source: &Path,
            size: u64,
            progress: ProgressFn,
        ) -> Result<DriveFile> {
            self.enter(token)?;
            let data = std::fs::read(source)?;
            progress(size / 2, Some(size));
            progress(size, Some(size));
            let mut files = self.files.lock().unwrap();
            let file = DriveFile {
                id: format!("file-{}", files.len()),
                name: name.into(),
                size: Some(data.len() as u64),
            };
            files.push((folder_id.into(), file.clone(), data));
            Ok(file)
        }

        fn download_file(
            &self,
            token: &str,
            file_id: &str,
            destination: &Path,
            progress: ProgressFn,
        ) -> Result<u64> {
            self.enter(token)?;
            let files = self.files.lock().unwrap();
            let (_, _, data) = files
                .iter()
                .find(|(_, f, _)| f.id == file_id)
                .ok_or_else(|| CirrusError::NotFound(file_id.into()))?;
            std::fs::write(destination, data)?;
            progress(data.len() as u64, Some(data.len() as u64));
            Ok(data.len() as u64)
        }
    }

    fn provider(fake: &Arc<FakeDrive>) -> GoogleDriveProvider {
        let api: Arc<dyn DriveApi> = fake.clone();
        GoogleDriveProvider::new(api, Some("tok".into()), "Cirrus")
    }

    #[tokio::test]
    async fn ensure_namespace_is_idempotent() {
        let fake = Arc::new(FakeDrive::default());
        let drive = provider(&fake);

        let a = drive.ensure_namespace("Cirrus").await.unwrap();
        let b = drive.ensure_namespace("Cirrus").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(fake.creates.load(Ordering::SeqCst), 1);
        assert_eq!(a.folder_id(), Some("folder-0"));
    }

    #[tokio::test]
    async fn upload_download_and_quota() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("chat-1.db");
        std::fs::write(&src, b"0123456789").unwrap();

        let fake = Arc::new(FakeDrive::default());
        let drive = provider(&fake);
        let ns = drive.ensure_namespace("Cirrus").await.unwrap();

        let task = drive
            .upload(&ns, &LocalSource::new(&src), "chat-1.db")
            .await
            .unwrap();
        assert_eq!(task.wait().await, TransferState::Succeeded { bytes: 10 });
        assert_eq!(drive.object_size(&ns, "chat-1.db").await.unwrap(), 10);

        let quota = drive.quota().await.unwrap();
        assert_eq!(quota.total_space(), Some(1000));
        assert_eq!(quota.used_space(), Some(400));
        assert_eq!(quota.app_used_space(), 10);

        let dest = tmp.path().join("restored.db");
        let task = drive.download(&ns, "chat-1.db", &dest).await.unwrap();
        assert_eq!(task.wait().await, TransferState::Succeeded { bytes: 10 });
        assert_eq!(std::fs::read(&dest).unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let fake = Arc::new(FakeDrive::default());
        let drive = provider(&fake);
        let ns = drive.ensure_namespace("Cirrus").await.unwrap();
        let err = drive.object_size(&ns, "nope.db").await.unwrap_err();
        assert!(matches!(err, CirrusError::NotFound(_)));
    }

    #[tokio::test]
    async fn missing_source_fails_fast() {
        let fake = Arc::new(FakeDrive::default());
        let drive = provider(&fake);
        let ns = drive.ensure_namespace("Cirrus").await.unwrap();
        let err = drive
            .upload(&ns, &LocalSource::new("/nonexistent/x.db"), "x.db")
            .await
            .unwrap_err();
        assert!(matches!(err, CirrusError::Precondition(_)));
    }

    #[tokio::test]
    async fn auth_error_requires_new_sign_in() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("a.db");
        std::fs::write(&src, b"a").unwrap();

        let fake = Arc::new(FakeDrive::default());
        let drive = provider(&fake);
        let ns = drive.ensure_namespace("Cirrus").await.unwrap();

        *fake.reject_token.lock().unwrap() = Some("tok".into());
        assert!(drive.quota().await.unwrap_err().is_auth());
        assert!(!drive.is_signed_in());

        let calls = fake.calls.load(Ordering::SeqCst);
        let err = drive
            .upload(&ns, &LocalSource::new(&src), "a.db")
            .await
            .unwrap_err();
        assert!(err.is_auth());
        assert_eq!(fake.calls.load(Ordering::SeqCst), calls, "no vendor call after invalidation");

        drive.sign_in("fresh");
        let task = drive
            .upload(&ns, &LocalSource::new(&src), "a.db")
            .await
            .unwrap();
        assert!(task.wait().await.is_succeeded());
    }

    #[tokio::test]
    async fn foreign_namespace_rejected() {
        let fake = Arc::new(FakeDrive::default());
        let drive = provider(&fake);
        let ns = Namespace::prefix(BackupProviderId::QiniuKodo, "Cirrus");
        let err = drive.object_size(&ns, "a.db").await.unwrap_err();
        assert!(matches!(err, CirrusError::Precondition(_)));
    }

    #[test]
    fn query_values_are_escaped() {
        assert_eq!(quoted("it's"), "'it\\'s'");
    }
}
