//! Object store with a blocking SDK and queue-based downloads.
//!
//! Uploads and metadata calls are blocking [`KodoApi`] calls run off the
//! runtime. Downloads go through a signed private URL handed to a
//! [`DownloadQueue`]; progress comes from polling the queue row.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use cirrus_core::config::KodoConfig;
use cirrus_core::error::{CirrusError, Result};
use cirrus_core::transfer::TransferTask;
use cirrus_core::types::{BackupProviderId, LocalSource, Namespace, QuotaStatus, TransferDirection};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::download_queue::{DownloadId, DownloadQueue, follow_download};
use crate::http::{self, BlockingBridge};
use crate::provider::{
    BackupProvider, ProgressFn, SessionCell, check_namespace, check_remote_name,
    reporter_progress, run_blocking, spawn_transfer,
};

/// Lifetime of signed download URLs and upload tokens.
const SIGNATURE_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KodoEntry {
    pub key: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KodoPage {
    pub items: Vec<KodoEntry>,
    /// Continuation marker; `None` on the last page.
    pub marker: Option<String>,
}

/// Blocking client bound to one bucket.
pub trait KodoApi: Send + Sync + 'static {
    fn put_bytes(&self, key: &str, data: Vec<u8>) -> Result<()>;

    fn put_file(&self, key: &str, source: &Path, size: u64, progress: ProgressFn) -> Result<()>;

    /// Object size, `None` if the key does not exist.
    fn stat(&self, key: &str) -> Result<Option<u64>>;

    fn list(&self, prefix: &str, marker: Option<&str>) -> Result<KodoPage>;

    /// Signed, time-limited download URL for `key`.
    fn private_url(&self, key: &str, ttl: Duration) -> Result<String>;
}

#[derive(Clone)]
struct KodoSession;

/// Removes a queue row when the watching future goes away.
struct QueueRow {
    queue: Arc<dyn DownloadQueue>,
    id: DownloadId,
}

impl Drop for QueueRow {
    fn drop(&mut self) {
        self.queue.remove(self.id);
    }
}

pub struct QiniuKodoProvider {
    api: Arc<dyn KodoApi>,
    queue: Arc<dyn DownloadQueue>,
    session: Arc<SessionCell<KodoSession>>,
    root_name: String,
    poll_interval: Duration,
}

impl QiniuKodoProvider {
    /// Static-key provider: signed in from construction.
    pub fn new(
        api: Arc<dyn KodoApi>,
        queue: Arc<dyn DownloadQueue>,
        root_name: &str,
        poll_interval: Duration,
    ) -> Self {
        Self {
            api,
            queue,
            session: Arc::new(SessionCell::new(BackupProviderId::QiniuKodo, Some(KodoSession))),
            root_name: root_name.to_string(),
            poll_interval,
        }
    }

    /// Re-arm the configured keys after an auth failure or sign-out.
    pub fn sign_in(&self) {
        self.session.set(KodoSession);
        tracing::info!("Qiniu KODO session restored");
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn KodoApi) -> Result<T> + Send + 'static,
    {
        self.session.get()?;
        let api = Arc::clone(&self.api);
        let result = run_blocking(move || f(api.as_ref())).await;
        self.session.observe(result)
    }

    fn key_of(&self, namespace: &Namespace, remote_name: &str) -> Result<String> {
        check_namespace(BackupProviderId::QiniuKodo, namespace)?;
        check_remote_name(remote_name)?;
        namespace.object_key(remote_name).ok_or_else(|| {
            CirrusError::Precondition(format!("namespace {} has no key prefix", namespace.name))
        })
    }
}

#[async_trait]
impl BackupProvider for QiniuKodoProvider {
    fn id(&self) -> BackupProviderId {
        BackupProviderId::QiniuKodo
    }

    fn name(&self) -> &str {
        "Qiniu KODO"
    }

    fn is_signed_in(&self) -> bool {
        self.session.is_present()
    }

    /// No quota concept: lists and sums the root prefix on every call.
    async fn quota(&self) -> Result<QuotaStatus> {
        let prefix = format!("{}/", self.root_name.trim_end_matches('/'));
        self.call(move |api| {
            let mut total = 0u64;
            let mut marker: Option<String> = None;
            loop {
                let page = api.list(&prefix, marker.as_deref())?;
                total += page.items.iter().map(|e| e.size).sum::<u64>();
                match page.marker {
                    Some(next) if !next.is_empty() => marker = Some(next),
                    _ => return Ok(QuotaStatus::app_only(total)),
                }
            }
        })
        .await
    }

    async fn ensure_namespace(&self, name: &str) -> Result<Namespace> {
        let namespace = Namespace::prefix(BackupProviderId::QiniuKodo, name);
        let marker = format!("{}/", namespace.key_prefix().unwrap_or(name));
        let created = self
            .call(move |api| {
                if api.stat(&marker)?.is_some() {
                    return Ok(false);
                }
                match api.put_bytes(&marker, Vec::new()) {
                    Ok(()) => Ok(true),
                    // Lost a race with another creator.
                    Err(e) if !e.is_auth() && api.stat(&marker)?.is_some() => Ok(false),
                    Err(e) => Err(e),
                }
            })
            .await?;
        if created {
            tracing::info!(namespace = name, "Created KODO prefix marker");
        }
        Ok(namespace)
    }

    async fn upload(
        &self,
        namespace: &Namespace,
        source: &LocalSource,
        remote_name: &str,
    ) -> Result<TransferTask> {
        let key = self.key_of(namespace, remote_name)?;
        let size = source.size().await?;
        self.session.get()?;

        let (task, reporter) = TransferTask::new(TransferDirection::Upload, source.path(), &key);
        let api = Arc::clone(&self.api);
        let path = source.path().to_path_buf();
        let upload_key = key.clone();
        spawn_transfer(Arc::clone(&self.session), reporter, move |r| {
            let progress = reporter_progress(&r);
            async move {
                run_blocking(move || {
                    api.put_file(&upload_key, &path, size, progress)?;
                    Ok(size)
                })
                .await
            }
        });
        tracing::info!(task_id = %task.id(), key = %key, size, "KODO upload started");
        Ok(task)
    }

    async fn download(
        &self,
        namespace: &Namespace,
        remote_name: &str,
        destination: &Path,
    ) -> Result<TransferTask> {
        let key = self.key_of(namespace, remote_name)?;
        let url_key = key.clone();
        let url = self
            .call(move |api| api.private_url(&url_key, SIGNATURE_TTL))
            .await?;
        let id = self.queue.enqueue(&url, destination)?;

        let (task, reporter) = TransferTask::new(TransferDirection::Download, destination, &key);
        let queue = Arc::clone(&self.queue);
        let interval = self.poll_interval;
        spawn_transfer(Arc::clone(&self.session), reporter, move |r| async move {
            let row = QueueRow {
                queue: Arc::clone(&queue),
                id,
            };
            let result = follow_download(queue, id, interval, &r).await;
            drop(row);
            result
        });
        tracing::info!(task_id = %task.id(), key = %key, download_id = id, "KODO download queued");
        Ok(task)
    }

    async fn object_size(&self, namespace: &Namespace, remote_name: &str) -> Result<u64> {
        let key = self.key_of(namespace, remote_name)?;
        self.call(move |api| api.stat(&key)?.ok_or(CirrusError::NotFound(key)))
            .await
    }

    async fn sign_out(&self) {
        if self.session.invalidate() {
            tracing::info!("Signed out of Qiniu KODO");
        }
    }
}

type HmacSha1 = Hmac<Sha1>;

/// Request signing with the account's access/secret key pair.
#[derive(Clone)]
pub struct KodoSigner {
    access_key: String,
    secret_key: String,
}

impl KodoSigner {
    pub fn new(access_key: &str, secret_key: &str) -> Self {
        Self {
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
        }
    }

    fn sign(&self, data: &[u8]) -> Result<String> {
        let mut mac = HmacSha1::new_from_slice(self.secret_key.as_bytes())
            .map_err(|e| CirrusError::Config(format!("invalid KODO secret key: {e}")))?;
        mac.update(data);
        Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
    }

    /// `<ak>:<sign>:<encoded policy>` for uploading exactly `bucket:key`.
    pub fn upload_token(&self, bucket: &str, key: &str, deadline: u64) -> Result<String> {
        let policy = serde_json::json!({
            "scope": format!("{bucket}:{key}"),
            "deadline": deadline,
        });
        let encoded = URL_SAFE.encode(serde_json::to_vec(&policy)?);
        let sign = self.sign(encoded.as_bytes())?;
        Ok(format!("{}:{sign}:{encoded}", self.access_key))
    }

    /// `Authorization` header for management requests without a form body.
    pub fn management_auth(&self, path_and_query: &str) -> Result<String> {
        let sign = self.sign(format!("{path_and_query}\n").as_bytes())?;
        Ok(format!("QBox {}:{sign}", self.access_key))
    }

    /// Append the expiry and download token to a resource URL.
    pub fn private_url(&self, base_url: &str, deadline: u64) -> Result<String> {
        let sep = if base_url.contains('?') { '&' } else { '?' };
        let url = format!("{base_url}{sep}e={deadline}");
        let sign = self.sign(url.as_bytes())?;
        Ok(format!("{url}&token={}:{sign}", self.access_key))
    }
}

fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn deadline(ttl: Duration) -> u64 {
    (chrono::Utc::now().timestamp().max(0) as u64) + ttl.as_secs()
}

/// Map service-specific status codes before the generic HTTP ones.
fn kodo_status_error(status: reqwest::StatusCode, body: &str) -> CirrusError {
    match status.as_u16() {
        612 => CirrusError::NotFound(format!("HTTP 612: {body}")),
        614 | 631 => CirrusError::Provider(format!("HTTP {}: {body}", status.as_u16())),
        579 | 599 => CirrusError::Network(format!("HTTP {}: {body}", status.as_u16())),
        _ => http::status_error(status, body),
    }
}

async fn kodo_check(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(kodo_status_error(status, &body))
}

/// [`KodoApi`] over the form upload and management REST endpoints.
pub struct KodoClient {
    http: reqwest::Client,
    signer: KodoSigner,
    bucket: String,
    domain: String,
    upload_host: String,
    rs_host: String,
    rsf_host: String,
    bridge: BlockingBridge,
}

impl KodoClient {
    /// Must be called from inside a tokio runtime.
    pub fn new(config: &KodoConfig) -> Result<Self> {
        let domain = if config.domain.contains("://") {
            config.domain.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", config.domain.trim_end_matches('/'))
        };
        Ok(Self {
            http: reqwest::Client::new(),
            signer: KodoSigner::new(&config.access_key, &config.secret_key),
            bucket: config.bucket.clone(),
            domain,
            upload_host: config.upload_host.trim_end_matches('/').to_string(),
            rs_host: config.rs_host.trim_end_matches('/').to_string(),
            rsf_host: config.rsf_host.trim_end_matches('/').to_string(),
            bridge: BlockingBridge::current()?,
        })
    }

    async fn form_upload(&self, key: &str, part: reqwest::multipart::Part) -> Result<()> {
        let token = self
            .signer
            .upload_token(&self.bucket, key, deadline(SIGNATURE_TTL))?;
        let file_name = key.rsplit('/').next().unwrap_or(key).to_string();
        let form = reqwest::multipart::Form::new()
            .text("token", token)
            .text("key", key.to_string())
            .part("file", part.file_name(file_name));
        let resp = self
            .http
            .post(&self.upload_host)
            .multipart(form)
            .send()
            .await
            .map_err(http::transport_error)?;
        kodo_check(resp).await?;
        Ok(())
    }
}

impl KodoApi for KodoClient {
    fn put_bytes(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.bridge.block_on(self.form_upload(key, reqwest::multipart::Part::bytes(data)))
    }

    fn put_file(&self, key: &str, source: &Path, size: u64, progress: ProgressFn) -> Result<()> {
        self.bridge.block_on(async {
            let body = http::file_body(source, size, progress).await?;
            let part = reqwest::multipart::Part::stream_with_length(body, size);
            self.form_upload(key, part).await
        })
    }

    fn stat(&self, key: &str) -> Result<Option<u64>> {
        let entry = URL_SAFE.encode(format!("{}:{key}", self.bucket));
        let path = format!("/stat/{entry}");
        self.bridge.block_on(async {
            let resp = self
                .http
                .get(format!("{}{path}", self.rs_host))
                .header(reqwest::header::AUTHORIZATION, self.signer.management_auth(&path)?)
                .send()
                .await
                .map_err(http::transport_error)?;
            match kodo_check(resp).await {
                Ok(resp) => {
                    let json: serde_json::Value = resp.json().await.map_err(http::transport_error)?;
                    Ok(Some(json["fsize"].as_u64().unwrap_or(0)))
                }
                Err(CirrusError::NotFound(_)) => Ok(None),
                Err(e) => Err(e),
            }
        })
    }

    fn list(&self, prefix: &str, marker: Option<&str>) -> Result<KodoPage> {
        let mut path = format!(
            "/list?bucket={}&prefix={}&limit=1000",
            urlencoding::encode(&self.bucket),
            urlencoding::encode(prefix)
        );
        if let Some(m) = marker {
            path.push_str(&format!("&marker={}", urlencoding::encode(m)));
        }
        self.bridge.block_on(async {
            let resp = self
                .http
                .post(format!("{}{path}", self.rsf_host))
                .header(reqwest::header::AUTHORIZATION, self.signer.management_auth(&path)?)
                .header(
                    reqwest::header::CONTENT_TYPE,
                    "application/x-www-form-urlencoded",
                )
                .send()
                .await
                .map_err(http::transport_error)?;
            let json: serde_json::Value = kodo_check(resp)
                .await?
                .json()
                .await
                .map_err(http::transport_error)?;
            let items = json["items"]
                .as_array()
                .map(Vec::as_slice)
                .unwrap_or_default()
                .iter()
                .map(|item| KodoEntry {
                    key: item["key"].as_str().unwrap_or("").to_string(),
                    size: item["fsize"].as_u64().unwrap_or(0),
                })
                .collect();
            Ok(KodoPage {
                items,
                marker: json["marker"]
                    .as_str()
                    .filter(|m| !m.is_empty())
                    .map(str::to_string),
            })
        })
    }

    fn private_url(&self, key: &str, ttl: Duration) -> Result<String> {
        let base = format!("{}/{}", self.domain, encode_key(key));
        self.signer.private_url(&base, deadline(ttl))
    }
}
