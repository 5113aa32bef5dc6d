//! Enterprise drive behind an identity broker.
//!
//! Tokens come from an [`IdentityBroker`] that answers through callbacks on
//! arbitrary threads. Concurrent callers needing a fresh token share one
//! in-flight broker request. An auth failure anywhere drops the session;
//! only an explicit [`OneDriveProvider::sign_in`] establishes a new one.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cirrus_core::completion::CompletionSlot;
use cirrus_core::error::{CirrusError, ErrorKind, Failure, Result};
use cirrus_core::transfer::TransferTask;
use cirrus_core::types::{BackupProviderId, LocalSource, Namespace, QuotaStatus, TransferDirection};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use crate::http;
use crate::provider::{
    BackupProvider, ProgressFn, SessionCell, check_namespace, check_remote_name,
    reporter_progress, spawn_transfer,
};

/// Tokens closer than this to expiry are refreshed before use.
const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerToken {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl BrokerToken {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .is_none_or(|exp| exp - ChronoDuration::seconds(EXPIRY_SKEW_SECS) > now)
    }
}

/// Receives the broker's answer. Invoked from any thread.
pub trait AuthCallback: Send + Sync {
    fn on_success(&self, token: BrokerToken);
    fn on_error(&self, failure: Failure);
    fn on_cancel(&self);
}

/// Identity broker holding the signed-in account.
pub trait IdentityBroker: Send + Sync {
    /// Start a silent token acquisition and return immediately. The answer
    /// arrives later through `callback`.
    fn acquire_token_silent(&self, scopes: &[String], callback: Arc<dyn AuthCallback>);

    /// Forget the signed-in account.
    fn sign_out(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveItem {
    pub id: String,
    pub name: String,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphQuota {
    pub total: u64,
    pub used: u64,
}

/// Drive operations of the graph API.
#[async_trait]
pub trait GraphApi: Send + Sync {
    async fn drive_quota(&self, token: &str) -> Result<GraphQuota>;

    /// Child `name` of the app folder, if it exists.
    async fn app_folder(&self, token: &str, name: &str) -> Result<Option<DriveItem>>;

    /// Create child `name` of the app folder. Fails if it already exists.
    async fn create_app_folder(&self, token: &str, name: &str) -> Result<DriveItem>;

    async fn list_children(&self, token: &str, folder_id: &str) -> Result<Vec<DriveItem>>;

    async fn item_by_name(&self, token: &str, folder_id: &str, name: &str)
    -> Result<Option<DriveItem>>;

    async fn upload(
        &self,
        token: &str,
        folder_id: &str,
        name: &str,
        source: &Path,
        size: u64,
        progress: ProgressFn,
    ) -> Result<DriveItem>;

    async fn download(
        &self,
        token: &str,
        item_id: &str,
        destination: &Path,
        progress: ProgressFn,
    ) -> Result<u64>;
}

type RefreshSlot = CompletionSlot<Uuid, std::result::Result<BrokerToken, Failure>>;

/// Routes one broker answer into the refresh slot under its request tag.
struct SlotCallback {
    slot: Arc<RefreshSlot>,
    tag: Uuid,
}

impl SlotCallback {
    fn deliver(&self, value: std::result::Result<BrokerToken, Failure>) {
        if !self.slot.complete(&self.tag, value) {
            tracing::debug!(request = %self.tag, "Ignored stale or duplicate broker callback");
        }
    }
}

impl AuthCallback for SlotCallback {
    fn on_success(&self, token: BrokerToken) {
        self.deliver(Ok(token));
    }

    fn on_error(&self, failure: Failure) {
        self.deliver(Err(failure));
    }

    fn on_cancel(&self) {
        self.deliver(Err(Failure::new(ErrorKind::Cancelled, "token request cancelled")));
    }
}

pub struct OneDriveProvider {
    broker: Arc<dyn IdentityBroker>,
    graph: Arc<dyn GraphApi>,
    scopes: Vec<String>,
    session: Arc<SessionCell<BrokerToken>>,
    refresh: Arc<RefreshSlot>,
    /// Bumped by `sign_out`; a token from an older generation is discarded.
    generation: Mutex<u64>,
    broker_timeout: Duration,
    root_name: String,
}

impl OneDriveProvider {
    /// Starts signed out; call [`OneDriveProvider::sign_in`] to acquire a token.
    pub fn new(
        broker: Arc<dyn IdentityBroker>,
        graph: Arc<dyn GraphApi>,
        scopes: Vec<String>,
        root_name: &str,
    ) -> Self {
        Self {
            broker,
            graph,
            scopes,
            session: Arc::new(SessionCell::new(BackupProviderId::OneDrive, None)),
            refresh: Arc::new(CompletionSlot::new()),
            generation: Mutex::new(0),
            broker_timeout: Duration::from_secs(60),
            root_name: root_name.to_string(),
        }
    }

    pub fn with_broker_timeout(mut self, timeout: Duration) -> Self {
        self.broker_timeout = timeout;
        self
    }

    fn generation(&self) -> std::sync::MutexGuard<'_, u64> {
        self.generation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire a token from the broker, replacing any invalidated session.
    pub async fn sign_in(&self) -> Result<()> {
        self.acquire().await?;
        tracing::info!("Signed in to OneDrive");
        Ok(())
    }

    /// One broker round trip, shared by every concurrent caller.
    async fn acquire(&self) -> Result<BrokerToken> {
        let generation = *self.generation();
        let (completion, started) = self.refresh.join_or_begin(Uuid::now_v7);
        if started {
            tracing::debug!(request = %completion.tag(), "Requesting token from identity broker");
            let callback = Arc::new(SlotCallback {
                slot: Arc::clone(&self.refresh),
                tag: *completion.tag(),
            });
            self.broker.acquire_token_silent(&self.scopes, callback);
        }

        let outcome = match tokio::time::timeout(self.broker_timeout, completion.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                completion.cancel();
                return Err(CirrusError::Network("identity broker did not answer".into()));
            }
        };
        match outcome {
            Ok(Ok(token)) => {
                let current = self.generation();
                if *current != generation {
                    return Err(CirrusError::Auth("signed out during token refresh".into()));
                }
                self.session.set(token.clone());
                Ok(token)
            }
            Ok(Err(failure)) => self.session.observe(Err(failure.into())),
            Err(_) => Err(CirrusError::Cancelled),
        }
    }

    /// Current access token, refreshed if it is about to expire. Fails
    /// without any broker or network call once the session was dropped.
    async fn access_token(&self) -> Result<String> {
        let token = self.session.get()?;
        if token.is_fresh(Utc::now()) {
            return Ok(token.access_token);
        }
        tracing::debug!("OneDrive token expiring, refreshing");
        Ok(self.acquire().await?.access_token)
    }

    fn folder_of(&self, namespace: &Namespace) -> Result<String> {
        check_namespace(BackupProviderId::OneDrive, namespace)?;
        namespace.folder_id().map(str::to_string).ok_or_else(|| {
            CirrusError::Precondition(format!("namespace {} has no folder id", namespace.name))
        })
    }

    async fn ensure_folder(&self, token: &str, name: &str) -> Result<DriveItem> {
        if let Some(item) = self.graph.app_folder(token, name).await? {
            return Ok(item);
        }
        match self.graph.create_app_folder(token, name).await {
            Ok(item) => Ok(item),
            Err(e) if e.is_auth() => Err(e),
            Err(e) => self.graph.app_folder(token, name).await?.ok_or(e),
        }
    }
}

#[async_trait]
impl BackupProvider for OneDriveProvider {
    fn id(&self) -> BackupProviderId {
        BackupProviderId::OneDrive
    }

    fn name(&self) -> &str {
        "OneDrive"
    }

    fn is_signed_in(&self) -> bool {
        self.session.is_present()
    }

    async fn quota(&self) -> Result<QuotaStatus> {
        let token = self.access_token().await?;
        let result = async {
            let quota = self.graph.drive_quota(&token).await?;
            let app_used = match self.graph.app_folder(&token, &self.root_name).await? {
                Some(folder) => self
                    .graph
                    .list_children(&token, &folder.id)
                    .await?
                    .iter()
                    .filter_map(|i| i.size)
                    .sum(),
                None => 0,
            };
            Ok(QuotaStatus::known(quota.total, quota.used, app_used))
        }
        .await;
        self.session.observe(result)
    }

    async fn ensure_namespace(&self, name: &str) -> Result<Namespace> {
        let token = self.access_token().await?;
        let folder = self.session.observe(self.ensure_folder(&token, name).await)?;
        Ok(Namespace::folder(BackupProviderId::OneDrive, name, &folder.id))
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
        let token = self.access_token().await?;

        let (task, reporter) = TransferTask::new(
            TransferDirection::Upload,
            source.path(),
            &format!("{}/{remote_name}", namespace.name),
        );
        let graph = Arc::clone(&self.graph);
        let path = source.path().to_path_buf();
        let name = remote_name.to_string();
        spawn_transfer(Arc::clone(&self.session), reporter, move |r| {
            let progress = reporter_progress(&r);
            async move {
                graph
                    .upload(&token, &folder, &name, &path, size, progress)
                    .await?;
                Ok(size)
            }
        });
        tracing::info!(task_id = %task.id(), remote = remote_name, size, "OneDrive upload started");
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
        let token = self.access_token().await?;

        let (task, reporter) = TransferTask::new(
            TransferDirection::Download,
            destination,
            &format!("{}/{remote_name}", namespace.name),
        );
        let graph = Arc::clone(&self.graph);
        let name = remote_name.to_string();
        let dest: PathBuf = destination.to_path_buf();
        spawn_transfer(Arc::clone(&self.session), reporter, move |r| {
            let progress = reporter_progress(&r);
            async move {
                let item = graph
                    .item_by_name(&token, &folder, &name)
                    .await?
                    .ok_or_else(|| CirrusError::NotFound(name.clone()))?;
                graph.download(&token, &item.id, &dest, progress).await
            }
        });
        Ok(task)
    }

    async fn object_size(&self, namespace: &Namespace, remote_name: &str) -> Result<u64> {
        let folder = self.folder_of(namespace)?;
        let token = self.access_token().await?;
        let item = self
            .session
            .observe(self.graph.item_by_name(&token, &folder, remote_name).await)?;
        item.map(|i| i.size.unwrap_or(0))
            .ok_or_else(|| CirrusError::NotFound(remote_name.to_string()))
    }

    async fn sign_out(&self) {
        let mut generation = self.generation();
        *generation += 1;
        self.refresh.cancel();
        self.broker.sign_out();
        if self.session.invalidate() {
            tracing::info!("Signed out of OneDrive");
        }
    }
}

/// [`IdentityBroker`] redeeming a stored OAuth refresh token.
pub struct OAuthRefreshBroker {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    refresh_token: Arc<Mutex<Option<String>>>,
}

impl OAuthRefreshBroker {
    pub fn new(tenant: &str, client_id: &str, refresh_token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token_url: format!("https://login.microsoftonline.com/{tenant}/oauth2/v2.0/token"),
            client_id: client_id.to_string(),
            refresh_token: Arc::new(Mutex::new(refresh_token)),
        }
    }

    async fn redeem(
        http: &reqwest::Client,
        token_url: &str,
        client_id: &str,
        refresh_token: &str,
        scopes: &str,
    ) -> Result<(BrokerToken, Option<String>)> {
        let resp = http
            .post(token_url)
            .form(&[
                ("client_id", client_id),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("scope", scopes),
            ])
            .send()
            .await
            .map_err(http::transport_error)?;

        let status = resp.status();
        let json: serde_json::Value = resp.json().await.map_err(http::transport_error)?;
        if !status.is_success() {
            let code = json["error"].as_str().unwrap_or("unknown");
            let detail = json["error_description"].as_str().unwrap_or(code).to_string();
            return Err(match code {
                "invalid_grant" | "interaction_required" | "invalid_client" => {
                    CirrusError::Auth(detail)
                }
                _ => http::status_error(status, &detail),
            });
        }

        let access_token = json["access_token"]
            .as_str()
            .ok_or_else(|| CirrusError::Auth("token response has no access_token".into()))?
            .to_string();
        let expires_at = json["expires_in"]
            .as_i64()
            .map(|secs| Utc::now() + ChronoDuration::seconds(secs));
        let rotated = json["refresh_token"].as_str().map(str::to_string);
        Ok((
            BrokerToken {
                access_token,
                expires_at,
            },
            rotated,
        ))
    }
}

impl IdentityBroker for OAuthRefreshBroker {
    fn acquire_token_silent(&self, scopes: &[String], callback: Arc<dyn AuthCallback>) {
        let current = self
            .refresh_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(refresh_token) = current else {
            callback.on_error(Failure::auth("no account signed in"));
            return;
        };
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(h) => h,
            Err(e) => {
                callback.on_error(Failure::new(ErrorKind::Local, e.to_string()));
                return;
            }
        };

        let http = self.http.clone();
        let token_url = self.token_url.clone();
        let client_id = self.client_id.clone();
        let store = Arc::clone(&self.refresh_token);
        let scopes = scopes.join(" ");
        runtime.spawn(async move {
            match Self::redeem(&http, &token_url, &client_id, &refresh_token, &scopes).await {
                Ok((token, rotated)) => {
                    if let Some(rotated) = rotated {
                        *store.lock().unwrap_or_else(PoisonError::into_inner) = Some(rotated);
                    }
                    callback.on_success(token);
                }
                Err(e) => callback.on_error(Failure::from(e)),
            }
        });
    }

    fn sign_out(&self) {
        *self
            .refresh_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Files up to this size go up in a single PUT.
const SIMPLE_UPLOAD_LIMIT: u64 = 4 * 1024 * 1024;
/// Upload session fragment; a multiple of 320 KiB.
const FRAGMENT: usize = 32 * 320 * 1024;

/// [`GraphApi`] over the Microsoft Graph v1.0 REST endpoints.
pub struct GraphClient {
    http: reqwest::Client,
    base: String,
}

impl Default for GraphClient {
    fn default() -> Self {
        Self::new("https://graph.microsoft.com/v1.0")
    }
}

impl GraphClient {
    pub fn new(base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    async fn get_json(&self, token: &str, url: &str) -> Result<serde_json::Value> {
        let resp = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(http::transport_error)?;
        http::check(resp).await?.json().await.map_err(http::transport_error)
    }

    /// Like `get_json`, with 404 mapped to `None`.
    async fn get_optional(&self, token: &str, url: &str) -> Result<Option<serde_json::Value>> {
        match self.get_json(token, url).await {
            Ok(json) => Ok(Some(json)),
            Err(CirrusError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn parse_item(v: &serde_json::Value) -> DriveItem {
    DriveItem {
        id: v["id"].as_str().unwrap_or("").to_string(),
        name: v["name"].as_str().unwrap_or("").to_string(),
        size: v["size"].as_u64(),
    }
}

#[async_trait]
impl GraphApi for GraphClient {
    async fn drive_quota(&self, token: &str) -> Result<GraphQuota> {
        let json = self
            .get_json(token, &format!("{}/me/drive?$select=quota", self.base))
            .await?;
        Ok(GraphQuota {
            total: json["quota"]["total"].as_u64().unwrap_or(0),
            used: json["quota"]["used"].as_u64().unwrap_or(0),
        })
    }

    async fn app_folder(&self, token: &str, name: &str) -> Result<Option<DriveItem>> {
        let url = format!(
            "{}/me/drive/special/approot:/{}",
            self.base,
            urlencoding::encode(name)
        );
        Ok(self.get_optional(token, &url).await?.as_ref().map(parse_item))
    }

    async fn create_app_folder(&self, token: &str, name: &str) -> Result<DriveItem> {
        let resp = self
            .http
            .post(format!("{}/me/drive/special/approot/children", self.base))
            .bearer_auth(token)
            .json(&serde_json::json!({
                "name": name,
                "folder": {},
                "@microsoft.graph.conflictBehavior": "fail",
            }))
            .send()
            .await
            .map_err(http::transport_error)?;
        let json: serde_json::Value =
            http::check(resp).await?.json().await.map_err(http::transport_error)?;
        Ok(parse_item(&json))
    }

    async fn list_children(&self, token: &str, folder_id: &str) -> Result<Vec<DriveItem>> {
        let mut items = Vec::new();
        let mut next = Some(format!(
            "{}/me/drive/items/{}/children?$select=id,name,size&$top=200",
            self.base,
            urlencoding::encode(folder_id)
        ));
        while let Some(url) = next.take() {
            let json = self.get_json(token, &url).await?;
            if let Some(values) = json["value"].as_array() {
                items.extend(values.iter().map(parse_item));
            }
            next = json["@odata.nextLink"].as_str().map(str::to_string);
        }
        Ok(items)
    }

    async fn item_by_name(
        &self,
        token: &str,
        folder_id: &str,
        name: &str,
    ) -> Result<Option<DriveItem>> {
        let url = format!(
            "{}/me/drive/items/{}:/{}",
            self.base,
            urlencoding::encode(folder_id),
            urlencoding::encode(name)
        );
        Ok(self.get_optional(token, &url).await?.as_ref().map(parse_item))
    }

    async fn upload(
        &self,
        token: &str,
        folder_id: &str,
        name: &str,
        source: &Path,
        size: u64,
        progress: ProgressFn,
    ) -> Result<DriveItem> {
        let item_path = format!(
            "{}/me/drive/items/{}:/{}",
            self.base,
            urlencoding::encode(folder_id),
            urlencoding::encode(name)
        );

        if size <= SIMPLE_UPLOAD_LIMIT {
            let body = http::file_body(source, size, progress).await?;
            let resp = self
                .http
                .put(format!("{item_path}:/content"))
                .bearer_auth(token)
                .header(reqwest::header::CONTENT_LENGTH, size)
                .body(body)
                .send()
                .await
                .map_err(http::transport_error)?;
            let json: serde_json::Value =
                http::check(resp).await?.json().await.map_err(http::transport_error)?;
            return Ok(parse_item(&json));
        }

        let resp = self
            .http
            .post(format!("{item_path}:/createUploadSession"))
            .bearer_auth(token)
            .json(&serde_json::json!({
                "item": { "@microsoft.graph.conflictBehavior": "replace" }
            }))
            .send()
            .await
            .map_err(http::transport_error)?;
        let session: serde_json::Value =
            http::check(resp).await?.json().await.map_err(http::transport_error)?;
        let upload_url = session["uploadUrl"]
            .as_str()
            .ok_or_else(|| CirrusError::Provider("upload session has no uploadUrl".into()))?
            .to_string();

        let mut file = tokio::fs::File::open(source).await?;
        let mut offset = 0u64;
        let mut buf = vec![0u8; FRAGMENT];
        loop {
            let mut filled = 0;
            while filled < buf.len() {
                let n = file.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                return Err(CirrusError::Provider(format!(
                    "{} shrank during upload",
                    source.display()
                )));
            }
            let end = offset + filled as u64 - 1;
            // The upload URL is pre-authenticated; no bearer token.
            let resp = self
                .http
                .put(&upload_url)
                .header(
                    reqwest::header::CONTENT_RANGE,
                    format!("bytes {offset}-{end}/{size}"),
                )
                .header(reqwest::header::CONTENT_LENGTH, filled as u64)
                .body(buf[..filled].to_vec())
                .send()
                .await
                .map_err(http::transport_error)?;
            let resp = http::check(resp).await?;
            offset = end + 1;
            progress(offset, Some(size));

            if offset >= size {
                let json: serde_json::Value = resp.json().await.map_err(http::transport_error)?;
                return Ok(parse_item(&json));
            }
        }
    }

    async fn download(
        &self,
        token: &str,
        item_id: &str,
        destination: &Path,
        progress: ProgressFn,
    ) -> Result<u64> {
        let resp = self
            .http
            .get(format!(
                "{}/me/drive/items/{}/content",
                self.base,
                urlencoding::encode(item_id)
            ))
            .bearer_auth(token)
            .send()
            .await
            .map_err(http::transport_error)?;
        let resp = http::check(resp).await?;
        http::write_body(resp, destination, &progress).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_core::transfer::TransferState;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Clone, Copy, PartialEq)]
    enum BrokerMode {
        Grant,
        GrantTwice,
        Reject,
        Silent,
        /// Keep the callback for the test to answer.
        Held,
    }

    /// Answers from a separate OS thread after a short delay.
    struct FakeBroker {
        mode: Mutex<BrokerMode>,
        requests: AtomicUsize,
        /// Issued tokens expire this many seconds from now.
        lifetime_secs: i64,
        held: Mutex<Option<Arc<dyn AuthCallback>>>,
    }

    impl FakeBroker {
        fn new(mode: BrokerMode, lifetime_secs: i64) -> Arc<Self> {
            Arc::new(Self {
                mode: Mutex::new(mode),
                requests: AtomicUsize::new(0),
                lifetime_secs,
                held: Mutex::new(None),
            })
        }

        fn requests(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }
    }

    impl IdentityBroker for FakeBroker {
        fn acquire_token_silent(&self, _scopes: &[String], callback: Arc<dyn AuthCallback>) {
            let n = self.requests.fetch_add(1, Ordering::SeqCst);
            let mode = *self.mode.lock().unwrap();
            if mode == BrokerMode::Held {
                *self.held.lock().unwrap() = Some(callback);
                return;
            }
            let lifetime = self.lifetime_secs;
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(30));
                let token = |i: usize| BrokerToken {
                    access_token: format!("token-{i}"),
                    expires_at: Some(Utc::now() + ChronoDuration::seconds(lifetime)),
                };
                match mode {
                    BrokerMode::Grant => callback.on_success(token(n)),
                    BrokerMode::GrantTwice => {
                        callback.on_success(token(n));
                        callback.on_success(token(n + 100));
                    }
                    BrokerMode::Reject => callback.on_error(Failure::auth("invalid_grant")),
                    BrokerMode::Silent | BrokerMode::Held => drop(callback),
                }
            });
        }

        fn sign_out(&self) {}
    }

    #[derive(Default)]
    struct FakeGraph {
        folders: Mutex<Vec<DriveItem>>,
        items: Mutex<Vec<(String, DriveItem, Vec<u8>)>>,
        calls: AtomicUsize,
        reject_all: Mutex<bool>,
        race_on_create: Mutex<bool>,
        last_token: Mutex<String>,
    }

    impl FakeGraph {
        fn enter(&self, token: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_token.lock().unwrap() = token.to_string();
            if *self.reject_all.lock().unwrap() {
                return Err(CirrusError::Auth("InvalidAuthenticationToken".into()));
            }
            Ok(())
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GraphApi for FakeGraph {
        async fn drive_quota(&self, token: &str) -> Result<GraphQuota> {
            self.enter(token)?;
            Ok(GraphQuota {
                total: 5_000,
                used: 1_000,
            })
        }

        async fn app_folder(&self, token: &str, name: &str) -> Result<Option<DriveItem>> {
            self.enter(token)?;
            Ok(self
                .folders
                .lock()
                .unwrap()
                .iter()
                .find(|f| f.name == name)
                .cloned())
        }

        async fn create_app_folder(&self, token: &str, name: &str) -> Result<DriveItem> {
            self.enter(token)?;
            let item = DriveItem {
                id: format!("dir-{name}"),
                name: name.into(),
                size: None,
            };
            self.folders.lock().unwrap().push(item.clone());
            if *self.race_on_create.lock().unwrap() {
                return Err(CirrusError::Provider("nameAlreadyExists".into()));
            }
            Ok(item)
        }

        async fn list_children(&self, token: &str, folder_id: &str) -> Result<Vec<DriveItem>> {
            self.enter(token)?;
            Ok(self
                .items
                .lock()
                .unwrap()
                .iter()
                .filter(|(p, _, _)| p == folder_id)
                .map(|(_, i, _)| i.clone())
                .collect())
        }

        async fn item_by_name(
            &self,
            token: &str,
            folder_id: &str,
            name: &str,
        ) -> Result<Option<DriveItem>> {
            Ok(self
                .list_children(token, folder_id)
                .await?
                .into_iter()
                .find(|i| i.name == name))
        }

        async fn upload(
            &self,
            token: &str,
            folder_id: &str,
            name: &str,
            source: &Path,
            size: u64,
            progress: ProgressFn,
        ) -> Result<DriveItem> {
            self.enter(token)?;
            let data = tokio::fs::read(source).await?;
            progress(size, Some(size));
            let item = DriveItem {
                id: format!("item-{name}"),
                name: name.into(),
                size: Some(size),
            };
            let mut items = self.items.lock().unwrap();
            items.retain(|(p, i, _)| !(p == folder_id && i.name == name));
            items.push((folder_id.into(), item.clone(), data));
            Ok(item)
        }

        async fn download(
            &self,
            token: &str,
            item_id: &str,
            destination: &Path,
            progress: ProgressFn,
        ) -> Result<u64> {
            self.enter(token)?;
            let data = self
                .items
                .lock()
                .unwrap()
                .iter()
                .find(|(_, i, _)| i.id == item_id)
                .map(|(_, _, d)| d.clone())
                .ok_or_else(|| CirrusError::NotFound(item_id.into()))?;
            tokio::fs::write(destination, &data).await?;
            progress(data.len() as u64, Some(data.len() as u64));
            Ok(data.len() as u64)
        }
    }

    fn onedrive(broker: &Arc<FakeBroker>, graph: &Arc<FakeGraph>) -> OneDriveProvider {
        let broker: Arc<dyn IdentityBroker> = broker.clone();
        let graph: Arc<dyn GraphApi> = graph.clone();
        OneDriveProvider::new(broker, graph, vec!["Files.ReadWrite".into()], "Cirrus")
    }

    #[tokio::test]
    async fn starts_signed_out() {
        let broker = FakeBroker::new(BrokerMode::Grant, 3600);
        let graph = Arc::new(FakeGraph::default());
        let drive = onedrive(&broker, &graph);

        assert!(!drive.is_signed_in());
        assert!(drive.quota().await.unwrap_err().is_auth());
        assert_eq!(broker.requests(), 0);
        assert_eq!(graph.calls(), 0);
    }

    #[tokio::test]
    async fn concurrent_refresh_is_single_flight() {
        // Tokens are already inside the expiry skew when issued.
        let broker = FakeBroker::new(BrokerMode::Grant, 1);
        let graph = Arc::new(FakeGraph::default());
        let drive = onedrive(&broker, &graph);

        drive.sign_in().await.unwrap();
        assert_eq!(broker.requests(), 1);

        let (a, b, c) = tokio::join!(drive.quota(), drive.quota(), drive.quota());
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(broker.requests(), 2, "one shared refresh for three callers");
    }

    #[tokio::test]
    async fn duplicate_broker_callback_observed_once() {
        let broker = FakeBroker::new(BrokerMode::GrantTwice, 3600);
        let graph = Arc::new(FakeGraph::default());
        let drive = onedrive(&broker, &graph);

        drive.sign_in().await.unwrap();
        // Give the second callback time to land.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        drive.quota().await.unwrap();
        assert_eq!(*graph.last_token.lock().unwrap(), "token-0");
    }

    #[tokio::test]
    async fn broker_rejection_leaves_session_empty() {
        let broker = FakeBroker::new(BrokerMode::Reject, 3600);
        let graph = Arc::new(FakeGraph::default());
        let drive = onedrive(&broker, &graph);

        assert!(drive.sign_in().await.unwrap_err().is_auth());
        assert!(!drive.is_signed_in());
    }

    #[tokio::test]
    async fn silent_broker_times_out() {
        let broker = FakeBroker::new(BrokerMode::Silent, 3600);
        let graph = Arc::new(FakeGraph::default());
        let drive = onedrive(&broker, &graph).with_broker_timeout(Duration::from_millis(100));

        let err = drive.sign_in().await.unwrap_err();
        assert!(matches!(err, CirrusError::Network(_)));
        assert!(!drive.is_signed_in());

        // The abandoned request does not block a retry.
        *broker.mode.lock().unwrap() = BrokerMode::Grant;
        drive.sign_in().await.unwrap();
        assert_eq!(broker.requests(), 2);
    }

    #[tokio::test]
    async fn token_answered_before_sign_out_is_discarded() {
        let broker = FakeBroker::new(BrokerMode::Held, 3600);
        let graph = Arc::new(FakeGraph::default());
        let drive = onedrive(&broker, &graph);

        let mut sign_in = std::pin::pin!(drive.sign_in());
        assert!(futures::poll!(&mut sign_in).is_pending());

        // The broker answers, then sign-out runs before the waiter resumes.
        let callback = broker.held.lock().unwrap().take().unwrap();
        callback.on_success(BrokerToken {
            access_token: "late".into(),
            expires_at: Some(Utc::now() + ChronoDuration::seconds(3600)),
        });
        drive.sign_out().await;

        let err = sign_in.await.unwrap_err();
        assert!(err.is_auth());
        assert!(!drive.is_signed_in());

        *broker.mode.lock().unwrap() = BrokerMode::Grant;
        drive.sign_in().await.unwrap();
        assert!(drive.is_signed_in());
    }

    #[tokio::test]
    async fn auth_failure_fails_fast_until_sign_in() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("chat.db");
        std::fs::write(&src, b"payload").unwrap();

        let broker = FakeBroker::new(BrokerMode::Grant, 3600);
        let graph = Arc::new(FakeGraph::default());
        let drive = onedrive(&broker, &graph);
        drive.sign_in().await.unwrap();
        let ns = drive.ensure_namespace("Cirrus").await.unwrap();

        *graph.reject_all.lock().unwrap() = true;
        assert!(drive.quota().await.unwrap_err().is_auth());
        assert!(!drive.is_signed_in());

        let (graph_calls, broker_calls) = (graph.calls(), broker.requests());
        let err = drive
            .upload(&ns, &LocalSource::new(&src), "chat.db")
            .await
            .unwrap_err();
        assert!(err.is_auth());
        assert_eq!(graph.calls(), graph_calls);
        assert_eq!(broker.requests(), broker_calls);

        *graph.reject_all.lock().unwrap() = false;
        drive.sign_in().await.unwrap();
        let task = drive
            .upload(&ns, &LocalSource::new(&src), "chat.db")
            .await
            .unwrap();
        assert_eq!(task.wait().await, TransferState::Succeeded { bytes: 7 });
    }

    #[tokio::test]
    async fn namespace_create_race_is_tolerated() {
        let broker = FakeBroker::new(BrokerMode::Grant, 3600);
        let graph = Arc::new(FakeGraph::default());
        *graph.race_on_create.lock().unwrap() = true;
        let drive = onedrive(&broker, &graph);
        drive.sign_in().await.unwrap();

        let ns = drive.ensure_namespace("Cirrus").await.unwrap();
        assert_eq!(ns.folder_id(), Some("dir-Cirrus"));
        let again = drive.ensure_namespace("Cirrus").await.unwrap();
        assert_eq!(ns, again);
        assert_eq!(graph.folders.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upload_then_restore() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("chat.db");
        std::fs::write(&src, b"abc").unwrap();

        let broker = FakeBroker::new(BrokerMode::Grant, 3600);
        let graph = Arc::new(FakeGraph::default());
        let drive = onedrive(&broker, &graph);
        drive.sign_in().await.unwrap();
        let ns = drive.ensure_namespace("Cirrus").await.unwrap();

        let up = drive
            .upload(&ns, &LocalSource::new(&src), "chat.db")
            .await
            .unwrap();
        assert!(up.wait().await.is_succeeded());
        assert_eq!(drive.object_size(&ns, "chat.db").await.unwrap(), 3);
        assert_eq!(drive.quota().await.unwrap().app_used_space(), 3);

        let dest = tmp.path().join("out.db");
        let down = drive.download(&ns, "chat.db", &dest).await.unwrap();
        assert_eq!(down.wait().await, TransferState::Succeeded { bytes: 3 });

        let missing = drive.download(&ns, "gone.db", &dest).await.unwrap();
        match missing.wait().await {
            TransferState::Failed { failure, .. } => assert_eq!(failure.kind, ErrorKind::NotFound),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn token_freshness_honours_skew() {
        let now = Utc::now();
        let soon = BrokerToken {
            access_token: "t".into(),
            expires_at: Some(now + ChronoDuration::seconds(30)),
        };
        let later = BrokerToken {
            access_token: "t".into(),
            expires_at: Some(now + ChronoDuration::seconds(3600)),
        };
        assert!(!soon.is_fresh(now));
        assert!(later.is_fresh(now));
    }
}
