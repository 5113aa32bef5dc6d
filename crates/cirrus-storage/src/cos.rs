//! S3-compatible object store with a listener-style client.
//!
//! Every vendor call takes a [`CosResultListener`] and returns at once; the
//! listener is invoked later from an arbitrary task or thread. Each call gets
//! its own [`TaggedCompletion`], so a duplicated or late callback can never
//! resolve a different request.

use async_trait::async_trait;
use cirrus_core::completion::TaggedCompletion;
use cirrus_core::error::{CirrusError, Failure, Result};
use cirrus_core::transfer::TransferTask;
use cirrus_core::types::{BackupProviderId, LocalSource, Namespace, QuotaStatus, TransferDirection};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use uuid::Uuid;

use crate::provider::{
    BackupProvider, ProgressFn, SessionCell, check_namespace, check_remote_name,
    reporter_progress, spawn_transfer,
};

#[cfg(feature = "s3")]
pub use inner::S3CosClient;

/// Error returned by the object store service itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CosServiceError {
    pub status: u16,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CosObject {
    pub key: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CosResult {
    Done,
    Head { content_length: Option<u64> },
    Listing { objects: Vec<CosObject>, next_marker: Option<String> },
    Transferred { bytes: u64 },
}

/// Terminal callbacks of one vendor request.
pub trait CosResultListener: Send + Sync {
    fn on_success(&self, result: CosResult);

    /// Exactly one of `client_error` (never reached the service) and
    /// `service_error` is set.
    fn on_fail(&self, client_error: Option<String>, service_error: Option<CosServiceError>);
}

/// Best-effort cancel handle for a vendor transfer.
pub struct TransferControl {
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl TransferControl {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    /// For transfers the vendor cannot cancel.
    pub fn detached() -> Self {
        Self {
            cancel: Mutex::new(None),
        }
    }

    pub fn cancel(&self) {
        let cancel = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(cancel) = cancel {
            cancel();
        }
    }
}

/// Listener-based object store client bound to one bucket.
pub trait CosApi: Send + Sync {
    fn put_object(&self, key: &str, body: Vec<u8>, listener: Arc<dyn CosResultListener>);

    fn head_object(&self, key: &str, listener: Arc<dyn CosResultListener>);

    fn list_objects(
        &self,
        prefix: &str,
        marker: Option<String>,
        listener: Arc<dyn CosResultListener>,
    );

    fn upload(
        &self,
        key: &str,
        source: &Path,
        progress: ProgressFn,
        listener: Arc<dyn CosResultListener>,
    ) -> TransferControl;

    fn download(
        &self,
        key: &str,
        destination: &Path,
        progress: ProgressFn,
        listener: Arc<dyn CosResultListener>,
    ) -> TransferControl;
}

const AUTH_CODES: &[&str] = &[
    "AccessDenied",
    "InvalidAccessKeyId",
    "SignatureDoesNotMatch",
    "ExpiredToken",
    "InvalidToken",
];

/// Client errors never reached the service and are network failures. Service
/// errors are provider failures unless they name a credential problem or a
/// missing object.
pub fn classify(client_error: Option<String>, service_error: Option<CosServiceError>) -> Failure {
    match (client_error, service_error) {
        (_, Some(service)) => {
            let detail = format!("{} ({}): {}", service.code, service.status, service.message);
            if AUTH_CODES.contains(&service.code.as_str()) || service.status == 401 {
                Failure::auth(detail)
            } else if service.status == 404 && service.code != "NoSuchBucket" {
                Failure::not_found(detail)
            } else {
                Failure::provider(detail)
            }
        }
        (Some(client), None) => Failure::network(client),
        (None, None) => Failure::provider("request failed without a cause"),
    }
}

type CosCompletion = TaggedCompletion<Uuid, std::result::Result<CosResult, Failure>>;

struct CompletionListener {
    completion: CosCompletion,
}

impl CompletionListener {
    fn pair() -> (Arc<dyn CosResultListener>, CosCompletion) {
        let completion = TaggedCompletion::new(Uuid::now_v7());
        let listener = Arc::new(CompletionListener {
            completion: completion.clone(),
        });
        (listener, completion)
    }

    fn deliver(&self, value: std::result::Result<CosResult, Failure>) {
        if !self.completion.complete(self.completion.tag(), value) {
            tracing::debug!(request = %self.completion.tag(), "Ignored repeated listener callback");
        }
    }
}

impl CosResultListener for CompletionListener {
    fn on_success(&self, result: CosResult) {
        self.deliver(Ok(result));
    }

    fn on_fail(&self, client_error: Option<String>, service_error: Option<CosServiceError>) {
        self.deliver(Err(classify(client_error, service_error)));
    }
}

/// Cancels the vendor transfer if the waiting future is dropped first.
struct CancelOnDrop {
    control: TransferControl,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.control.cancel();
        }
    }
}

#[derive(Clone)]
struct CosSession {
    access_key: String,
}

pub struct TencentCosProvider {
    api: Arc<dyn CosApi>,
    access_key: String,
    session: Arc<SessionCell<CosSession>>,
    root_name: String,
    call_timeout: Duration,
}

impl TencentCosProvider {
    /// Static-key provider: signed in from construction.
    pub fn new(api: Arc<dyn CosApi>, access_key: &str, root_name: &str) -> Self {
        let session = CosSession {
            access_key: access_key.to_string(),
        };
        Self {
            api,
            access_key: access_key.to_string(),
            session: Arc::new(SessionCell::new(BackupProviderId::TencentCos, Some(session))),
            root_name: root_name.to_string(),
            call_timeout: Duration::from_secs(120),
        }
    }

    /// Re-arm the configured keys after an auth failure or sign-out.
    pub fn sign_in(&self) {
        self.session.set(CosSession {
            access_key: self.access_key.clone(),
        });
        tracing::info!("Tencent COS session restored");
    }

    /// Issue one listener-based request and wait for its terminal callback.
    async fn request(&self, issue: impl FnOnce(Arc<dyn CosResultListener>)) -> Result<CosResult> {
        let session = self.session.get()?;
        let (listener, completion) = CompletionListener::pair();
        tracing::trace!(request = %completion.tag(), key_id = %session.access_key, "COS request");
        issue(listener);

        let outcome = match tokio::time::timeout(self.call_timeout, completion.wait()).await {
            Ok(Ok(outcome)) => outcome.map_err(CirrusError::from),
            Ok(Err(_)) => Err(CirrusError::Cancelled),
            Err(_) => {
                completion.cancel();
                Err(CirrusError::Network("object store did not answer".into()))
            }
        };
        self.session.observe(outcome)
    }

    async fn head(&self, key: &str) -> Result<Option<u64>> {
        match self.request(|l| self.api.head_object(key, l)).await? {
            CosResult::Head { content_length } => Ok(content_length),
            other => Err(unexpected("head", &other)),
        }
    }

    fn key_of(&self, namespace: &Namespace, remote_name: &str) -> Result<String> {
        check_namespace(BackupProviderId::TencentCos, namespace)?;
        check_remote_name(remote_name)?;
        namespace.object_key(remote_name).ok_or_else(|| {
            CirrusError::Precondition(format!("namespace {} has no key prefix", namespace.name))
        })
    }

    /// Start a vendor transfer and drive `reporter` from its listener.
    fn start_transfer(
        &self,
        task_reporter: cirrus_core::transfer::TransferReporter,
        fallback_bytes: u64,
        begin: impl FnOnce(ProgressFn, Arc<dyn CosResultListener>) -> TransferControl,
    ) {
        let (listener, completion) = CompletionListener::pair();
        spawn_transfer(Arc::clone(&self.session), task_reporter, move |r| {
            let control = begin(reporter_progress(&r), listener);
            async move {
                let mut guard = CancelOnDrop {
                    control,
                    armed: true,
                };
                let outcome = completion.wait().await;
                guard.armed = false;
                match outcome {
                    Ok(Ok(CosResult::Transferred { bytes })) => Ok(bytes),
                    Ok(Ok(_)) => Ok(fallback_bytes),
                    Ok(Err(failure)) => Err(failure.into()),
                    Err(_) => Err(CirrusError::Cancelled),
                }
            }
        });
    }
}

fn unexpected(op: &str, result: &CosResult) -> CirrusError {
    CirrusError::Provider(format!("unexpected {op} result: {result:?}"))
}

#[async_trait]
impl BackupProvider for TencentCosProvider {
    fn id(&self) -> BackupProviderId {
        BackupProviderId::TencentCos
    }

    fn name(&self) -> &str {
        "Tencent COS"
    }

    fn is_signed_in(&self) -> bool {
        self.session.is_present()
    }

    /// No quota concept: sums every object under the root prefix.
    async fn quota(&self) -> Result<QuotaStatus> {
        let prefix = format!("{}/", self.root_name.trim_end_matches('/'));
        let mut marker: Option<String> = None;
        let mut total = 0u64;
        loop {
            let page = marker.take();
            match self
                .request(|l| self.api.list_objects(&prefix, page, l))
                .await?
            {
                CosResult::Listing {
                    objects,
                    next_marker,
                } => {
                    total += objects.iter().map(|o| o.size).sum::<u64>();
                    match next_marker {
                        Some(next) => marker = Some(next),
                        None => break,
                    }
                }
                other => return Err(unexpected("list", &other)),
            }
        }
        Ok(QuotaStatus::app_only(total))
    }

    async fn ensure_namespace(&self, name: &str) -> Result<Namespace> {
        let namespace = Namespace::prefix(BackupProviderId::TencentCos, name);
        let marker = format!("{}/", namespace.key_prefix().unwrap_or(name));
        match self.head(&marker).await {
            Ok(_) => {}
            Err(CirrusError::NotFound(_)) => {
                // Zero-byte folder marker; rewriting it is harmless.
                self.request(|l| self.api.put_object(&marker, Vec::new(), l))
                    .await?;
                tracing::info!(namespace = name, "Created COS folder marker");
            }
            Err(e) => return Err(e),
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
        self.start_transfer(reporter, size, move |progress, listener| {
            api.upload(&upload_key, &path, progress, listener)
        });
        tracing::info!(task_id = %task.id(), key = %key, size, "COS upload started");
        Ok(task)
    }

    async fn download(
        &self,
        namespace: &Namespace,
        remote_name: &str,
        destination: &Path,
    ) -> Result<TransferTask> {
        let key = self.key_of(namespace, remote_name)?;
        self.session.get()?;

        let (task, reporter) = TransferTask::new(TransferDirection::Download, destination, &key);
        let api = Arc::clone(&self.api);
        let dest = destination.to_path_buf();
        self.start_transfer(reporter, 0, move |progress, listener| {
            api.download(&key, &dest, progress, listener)
        });
        Ok(task)
    }

    async fn object_size(&self, namespace: &Namespace, remote_name: &str) -> Result<u64> {
        let key = self.key_of(namespace, remote_name)?;
        Ok(self.head(&key).await?.unwrap_or(0))
    }

    async fn sign_out(&self) {
        if self.session.invalidate() {
            tracing::info!("Signed out of Tencent COS");
        }
    }
}

#[cfg(feature = "s3")]
mod inner {
    use aws_sdk_s3::Client;
    use aws_sdk_s3::config::http::HttpResponse;
    use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
    use aws_sdk_s3::primitives::ByteStream;
    use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
    use cirrus_core::config::CosConfig;
    use cirrus_core::error::{CirrusError, Result};
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::runtime::Handle;

    use super::{CosApi, CosObject, CosResult, CosResultListener, CosServiceError, TransferControl};
    use crate::provider::ProgressFn;

    /// Objects above this size go up as multipart uploads of this part size.
    const PART_SIZE: usize = 8 * 1024 * 1024;

    enum CosFailure {
        Client(String),
        Service(CosServiceError),
    }

    impl CosFailure {
        fn deliver(self, listener: &dyn CosResultListener) {
            match self {
                CosFailure::Client(m) => listener.on_fail(Some(m), None),
                CosFailure::Service(s) => listener.on_fail(None, Some(s)),
            }
        }
    }

    fn failure<E>(err: SdkError<E, HttpResponse>) -> CosFailure
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    {
        match &err {
            SdkError::ServiceError(ctx) => CosFailure::Service(CosServiceError {
                status: ctx.raw().status().as_u16(),
                code: ctx.err().code().unwrap_or("Unknown").to_string(),
                message: ctx.err().message().unwrap_or_default().to_string(),
            }),
            _ => CosFailure::Client(DisplayErrorContext(&err).to_string()),
        }
    }

    fn local(err: impl std::fmt::Display) -> CosFailure {
        CosFailure::Client(err.to_string())
    }

    /// [`CosApi`] over the S3-compatible endpoint of the object store.
    pub struct S3CosClient {
        client: Client,
        bucket: String,
        runtime: Handle,
    }

    impl S3CosClient {
        pub async fn new(config: &CosConfig) -> Result<Self> {
            let creds = aws_sdk_s3::config::Credentials::new(
                &config.access_key,
                &config.secret_key,
                None,
                None,
                "cirrus-config",
            );
            let sdk_config = aws_config::from_env()
                .region(aws_config::Region::new(config.region.clone()))
                .credentials_provider(creds)
                .load()
                .await;
            let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
                .endpoint_url(config.endpoint())
                .build();

            let runtime = Handle::try_current().map_err(|e| {
                CirrusError::Precondition(format!("COS client needs a runtime: {e}"))
            })?;
            Ok(Self {
                client: Client::from_conf(s3_config),
                bucket: config.bucket.clone(),
                runtime,
            })
        }

        fn spawn<F>(&self, listener: Arc<dyn CosResultListener>, work: F) -> TransferControl
        where
            F: std::future::Future<Output = std::result::Result<CosResult, CosFailure>>
                + Send
                + 'static,
        {
            let handle = self.runtime.spawn(async move {
                match work.await {
                    Ok(result) => listener.on_success(result),
                    Err(f) => f.deliver(listener.as_ref()),
                }
            });
            let abort = handle.abort_handle();
            TransferControl::new(move || abort.abort())
        }
    }

    async fn upload_file(
        client: Client,
        bucket: String,
        key: String,
        source: PathBuf,
        progress: ProgressFn,
    ) -> std::result::Result<CosResult, CosFailure> {
        let size = tokio::fs::metadata(&source).await.map_err(local)?.len();
        if size <= PART_SIZE as u64 {
            let body = ByteStream::from_path(&source).await.map_err(local)?;
            client
                .put_object()
                .bucket(&bucket)
                .key(&key)
                .body(body)
                .send()
                .await
                .map_err(failure)?;
            progress(size, Some(size));
            return Ok(CosResult::Transferred { bytes: size });
        }

        let created = client
            .create_multipart_upload()
            .bucket(&bucket)
            .key(&key)
            .send()
            .await
            .map_err(failure)?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| local("multipart upload has no id"))?
            .to_string();

        let parts =
            upload_parts(&client, &bucket, &key, &upload_id, &source, size, &progress).await;
        let parts = match parts {
            Ok(parts) => parts,
            Err(e) => {
                if let Err(abort) = client
                    .abort_multipart_upload()
                    .bucket(&bucket)
                    .key(&key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    tracing::warn!(
                        key = %key,
                        error = %DisplayErrorContext(&abort),
                        "Failed to abort multipart upload"
                    );
                }
                return Err(e);
            }
        };

        client
            .complete_multipart_upload()
            .bucket(&bucket)
            .key(&key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(failure)?;
        Ok(CosResult::Transferred { bytes: size })
    }

    async fn upload_parts(
        client: &Client,
        bucket: &str,
        key: &str,
        upload_id: &str,
        source: &Path,
        size: u64,
        progress: &ProgressFn,
    ) -> std::result::Result<Vec<CompletedPart>, CosFailure> {
        let mut file = tokio::fs::File::open(source).await.map_err(local)?;
        let mut parts = Vec::new();
        let mut sent = 0u64;
        let mut part_number = 1;
        loop {
            let mut buf = vec![0u8; PART_SIZE];
            let mut filled = 0;
            while filled < buf.len() {
                let n = file.read(&mut buf[filled..]).await.map_err(local)?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                return Ok(parts);
            }
            buf.truncate(filled);
            let out = client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(buf))
                .send()
                .await
                .map_err(failure)?;
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(out.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
            sent += filled as u64;
            progress(sent, Some(size));
            part_number += 1;
        }
    }

    async fn download_file(
        client: Client,
        bucket: String,
        key: String,
        destination: PathBuf,
        progress: ProgressFn,
    ) -> std::result::Result<CosResult, CosFailure> {
        let out = client
            .get_object()
            .bucket(&bucket)
            .key(&key)
            .send()
            .await
            .map_err(failure)?;
        let total = out.content_length().and_then(|n| u64::try_from(n).ok());
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(local)?;
        }
        let mut file = tokio::fs::File::create(&destination).await.map_err(local)?;
        let mut body = out.body;
        let mut done = 0u64;
        progress(0, total);
        while let Some(chunk) = body.try_next().await.map_err(local)? {
            file.write_all(&chunk).await.map_err(local)?;
            done += chunk.len() as u64;
            progress(done, total);
        }
        file.flush().await.map_err(local)?;
        Ok(CosResult::Transferred { bytes: done })
    }

    impl CosApi for S3CosClient {
        fn put_object(&self, key: &str, body: Vec<u8>, listener: Arc<dyn CosResultListener>) {
            let req = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(ByteStream::from(body));
            self.spawn(listener, async move {
                req.send().await.map_err(failure)?;
                Ok(CosResult::Done)
            });
        }

        fn head_object(&self, key: &str, listener: Arc<dyn CosResultListener>) {
            let req = self.client.head_object().bucket(&self.bucket).key(key);
            self.spawn(listener, async move {
                let out = req.send().await.map_err(failure)?;
                Ok(CosResult::Head {
                    content_length: out.content_length().and_then(|n| u64::try_from(n).ok()),
                })
            });
        }

        fn list_objects(
            &self,
            prefix: &str,
            marker: Option<String>,
            listener: Arc<dyn CosResultListener>,
        ) {
            let req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(marker);
            self.spawn(listener, async move {
                let out = req.send().await.map_err(failure)?;
                let objects = out
                    .contents()
                    .iter()
                    .map(|o| CosObject {
                        key: o.key().unwrap_or_default().to_string(),
                        size: o.size().and_then(|n| u64::try_from(n).ok()).unwrap_or(0),
                    })
                    .collect();
                let next_marker = if out.is_truncated().unwrap_or(false) {
                    out.next_continuation_token().map(str::to_string)
                } else {
                    None
                };
                Ok(CosResult::Listing {
                    objects,
                    next_marker,
                })
            });
        }

        fn upload(
            &self,
            key: &str,
            source: &Path,
            progress: ProgressFn,
            listener: Arc<dyn CosResultListener>,
        ) -> TransferControl {
            self.spawn(
                listener,
                upload_file(
                    self.client.clone(),
                    self.bucket.clone(),
                    key.to_string(),
                    source.to_path_buf(),
                    progress,
                ),
            )
        }

        fn download(
            &self,
            key: &str,
            destination: &Path,
            progress: ProgressFn,
            listener: Arc<dyn CosResultListener>,
        ) -> TransferControl {
            self.spawn(
                listener,
                download_file(
                    self.client.clone(),
                    self.bucket.clone(),
                    key.to_string(),
                    destination.to_path_buf(),
                    progress,
                ),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_core::error::ErrorKind;
    use cirrus_core::transfer::TransferState;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// In-memory bucket answering from a separate thread, like the vendor
    /// SDK's callback executor.
    #[derive(Default)]
    struct FakeCos {
        objects: Mutex<BTreeMap<String, Vec<u8>>>,
        puts: AtomicUsize,
        requests: AtomicUsize,
        duplicate_head: AtomicBool,
        service_error: Mutex<Option<CosServiceError>>,
        client_error: Mutex<Option<String>>,
        hang_transfers: AtomicBool,
        cancelled: Arc<AtomicBool>,
        page_size: usize,
    }

    impl FakeCos {
        fn answer(
            &self,
            listener: Arc<dyn CosResultListener>,
            f: impl FnOnce() -> CosResult + Send + 'static,
        ) {
            self.requests.fetch_add(1, Ordering::SeqCst);
            let service = self.service_error.lock().unwrap().clone();
            let client = self.client_error.lock().unwrap().clone();
            std::thread::spawn(move || {
                if service.is_some() || client.is_some() {
                    listener.on_fail(client, service);
                } else {
                    listener.on_success(f());
                }
            });
        }

        fn requests(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }
    }

    impl CosApi for Arc<FakeCos> {
        fn put_object(&self, key: &str, body: Vec<u8>, listener: Arc<dyn CosResultListener>) {
            self.puts.fetch_add(1, Ordering::SeqCst);
            let me = Arc::clone(self);
            let key = key.to_string();
            self.answer(listener, move || {
                me.objects.lock().unwrap().insert(key, body);
                CosResult::Done
            });
        }

        fn head_object(&self, key: &str, listener: Arc<dyn CosResultListener>) {
            let size = self.objects.lock().unwrap().get(key).map(|d| d.len() as u64);
            if size.is_none() {
                self.requests.fetch_add(1, Ordering::SeqCst);
                listener.on_fail(
                    None,
                    Some(CosServiceError {
                        status: 404,
                        code: "NotFound".into(),
                        message: key.into(),
                    }),
                );
                return;
            }
            if self.duplicate_head.load(Ordering::SeqCst) {
                self.requests.fetch_add(1, Ordering::SeqCst);
                std::thread::spawn(move || {
                    listener.on_success(CosResult::Head { content_length: size });
                    listener.on_success(CosResult::Head {
                        content_length: Some(999_999),
                    });
                });
                return;
            }
            self.answer(listener, move || CosResult::Head { content_length: size });
        }

        fn list_objects(
            &self,
            prefix: &str,
            marker: Option<String>,
            listener: Arc<dyn CosResultListener>,
        ) {
            let page_size = self.page_size.max(1);
            let all: Vec<CosObject> = self
                .objects
                .lock()
                .unwrap()
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .filter(|(k, _)| marker.as_deref().is_none_or(|m| k.as_str() > m))
                .map(|(k, v)| CosObject {
                    key: k.clone(),
                    size: v.len() as u64,
                })
                .collect();
            let page: Vec<CosObject> = all.iter().take(page_size).cloned().collect();
            let next_marker = if all.len() > page_size {
                page.last().map(|o| o.key.clone())
            } else {
                None
            };
            self.answer(listener, move || CosResult::Listing {
                objects: page,
                next_marker,
            });
        }

        fn upload(
            &self,
            key: &str,
            source: &Path,
            progress: ProgressFn,
            listener: Arc<dyn CosResultListener>,
        ) -> TransferControl {
            let cancelled = Arc::clone(&self.cancelled);
            if self.hang_transfers.load(Ordering::SeqCst) {
                return TransferControl::new(move || cancelled.store(true, Ordering::SeqCst));
            }
            let data = std::fs::read(source).unwrap();
            let me = Arc::clone(self);
            let key = key.to_string();
            self.answer(listener, move || {
                let n = data.len() as u64;
                progress(n / 2, Some(n));
                progress(n, Some(n));
                me.objects.lock().unwrap().insert(key, data);
                CosResult::Transferred { bytes: n }
            });
            TransferControl::new(move || cancelled.store(true, Ordering::SeqCst))
        }

        fn download(
            &self,
            key: &str,
            destination: &Path,
            progress: ProgressFn,
            listener: Arc<dyn CosResultListener>,
        ) -> TransferControl {
            let data = self.objects.lock().unwrap().get(key).cloned();
            let dest = destination.to_path_buf();
            let key = key.to_string();
            std::thread::spawn(move || match data {
                Some(data) => {
                    std::fs::write(&dest, &data).unwrap();
                    progress(data.len() as u64, Some(data.len() as u64));
                    listener.on_success(CosResult::Transferred {
                        bytes: data.len() as u64,
                    });
                }
                None => listener.on_fail(
                    None,
                    Some(CosServiceError {
                        status: 404,
                        code: "NoSuchKey".into(),
                        message: key,
                    }),
                ),
            });
            TransferControl::detached()
        }
    }

    fn cos(fake: &Arc<FakeCos>) -> TencentCosProvider {
        let api: Arc<dyn CosApi> = Arc::new(Arc::clone(fake));
        TencentCosProvider::new(api, "AKID", "Cirrus")
    }

    #[tokio::test]
    async fn namespace_marker_created_once() {
        let fake = Arc::new(FakeCos::default());
        let store = cos(&fake);

        let a = store.ensure_namespace("Cirrus").await.unwrap();
        let b = store.ensure_namespace("Cirrus").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.key_prefix(), Some("Cirrus"));
        assert_eq!(fake.puts.load(Ordering::SeqCst), 1);
        assert!(fake.objects.lock().unwrap().contains_key("Cirrus/"));
    }

    #[tokio::test]
    async fn repeated_success_callback_resolves_once() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("a.db");
        std::fs::write(&src, b"12345").unwrap();

        let fake = Arc::new(FakeCos::default());
        let store = cos(&fake);
        let ns = store.ensure_namespace("Cirrus").await.unwrap();
        let task = store
            .upload(&ns, &LocalSource::new(&src), "a.db")
            .await
            .unwrap();
        assert!(task.wait().await.is_succeeded());

        fake.duplicate_head.store(true, Ordering::SeqCst);
        assert_eq!(store.object_size(&ns, "a.db").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn quota_sums_prefix_across_pages() {
        let fake = Arc::new(FakeCos {
            page_size: 2,
            ..Default::default()
        });
        {
            let mut objects = fake.objects.lock().unwrap();
            objects.insert("Cirrus/".into(), Vec::new());
            objects.insert("Cirrus/a".into(), vec![0; 10]);
            objects.insert("Cirrus/b".into(), vec![0; 20]);
            objects.insert("Cirrus/c".into(), vec![0; 30]);
            objects.insert("Other/d".into(), vec![0; 40]);
        }
        let store = cos(&fake);
        let quota = store.quota().await.unwrap();
        assert_eq!(quota.app_used_space(), 60);
        assert_eq!(quota.total_space(), None);
        assert_eq!(quota.used_space(), None);
    }

    #[tokio::test]
    async fn access_denied_invalidates_session() {
        let fake = Arc::new(FakeCos::default());
        let store = cos(&fake);
        *fake.service_error.lock().unwrap() = Some(CosServiceError {
            status: 403,
            code: "AccessDenied".into(),
            message: "denied".into(),
        });
        assert!(store.quota().await.unwrap_err().is_auth());
        assert!(!store.is_signed_in());

        let before = fake.requests();
        assert!(store.quota().await.unwrap_err().is_auth());
        assert_eq!(fake.requests(), before);

        *fake.service_error.lock().unwrap() = None;
        store.sign_in();
        assert!(store.quota().await.is_ok());
    }

    #[tokio::test]
    async fn client_exception_is_network() {
        let fake = Arc::new(FakeCos::default());
        let store = cos(&fake);
        *fake.client_error.lock().unwrap() = Some("connection reset".into());
        let err = store.quota().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(store.is_signed_in());
    }

    #[tokio::test]
    async fn download_of_missing_key_fails_task() {
        let tmp = TempDir::new().unwrap();
        let fake = Arc::new(FakeCos::default());
        let store = cos(&fake);
        let ns = store.ensure_namespace("Cirrus").await.unwrap();

        assert!(matches!(
            store.object_size(&ns, "gone.db").await,
            Err(CirrusError::NotFound(_))
        ));
        let task = store
            .download(&ns, "gone.db", &tmp.path().join("x"))
            .await
            .unwrap();
        match task.wait().await {
            TransferState::Failed { failure, .. } => assert_eq!(failure.kind, ErrorKind::NotFound),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelling_task_cancels_vendor_transfer() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("big.db");
        std::fs::write(&src, b"data").unwrap();

        let fake = Arc::new(FakeCos::default());
        let store = cos(&fake);
        let ns = store.ensure_namespace("Cirrus").await.unwrap();
        fake.hang_transfers.store(true, Ordering::SeqCst);

        let task = store
            .upload(&ns, &LocalSource::new(&src), "big.db")
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert!(task.cancel());
        assert!(matches!(task.wait().await, TransferState::Cancelled { .. }));

        for _ in 0..50 {
            if fake.cancelled.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(fake.cancelled.load(Ordering::SeqCst));
    }

    #[test]
    fn classification() {
        let service = |status, code: &str| {
            Some(CosServiceError {
                status,
                code: code.into(),
                message: String::new(),
            })
        };
        assert_eq!(classify(None, service(403, "SignatureDoesNotMatch")).kind, ErrorKind::Auth);
        assert_eq!(classify(None, service(404, "NoSuchKey")).kind, ErrorKind::NotFound);
        assert_eq!(classify(None, service(404, "NoSuchBucket")).kind, ErrorKind::Provider);
        assert_eq!(classify(None, service(500, "InternalError")).kind, ErrorKind::Provider);
        assert_eq!(classify(Some("dns".into()), None).kind, ErrorKind::Network);
    }
}
