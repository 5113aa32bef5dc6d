//! HTTP plumbing shared by the REST-backed vendor clients.

use cirrus_core::error::{CirrusError, Result};
use reqwest::StatusCode;
use std::future::Future;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::provider::ProgressFn;

const UPLOAD_CHUNK: usize = 256 * 1024;

/// Classify a non-success HTTP response.
pub fn status_error(status: StatusCode, body: &str) -> CirrusError {
    let detail = if body.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {}", truncate(body, 300))
    };
    match status.as_u16() {
        401 => CirrusError::Auth(detail),
        404 => CirrusError::NotFound(detail),
        408 | 429 => CirrusError::Network(detail),
        s if s >= 500 => CirrusError::Network(detail),
        _ => CirrusError::Provider(detail),
    }
}

pub fn transport_error(err: reqwest::Error) -> CirrusError {
    CirrusError::Network(err.to_string())
}

/// Pass a successful response through, classify anything else.
pub async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(status_error(status, &body))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Stream a local file as a request body, reporting bytes read.
pub async fn file_body(path: &Path, size: u64, progress: ProgressFn) -> Result<reqwest::Body> {
    let file = tokio::fs::File::open(path).await?;
    let stream = futures::stream::unfold((file, 0u64), move |(mut file, sent)| {
        let progress = progress.clone();
        async move {
            let mut buf = vec![0u8; UPLOAD_CHUNK];
            match file.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    let sent = sent + n as u64;
                    progress(sent, Some(size));
                    Some((Ok::<_, std::io::Error>(buf), (file, sent)))
                }
                Err(e) => Some((Err(e), (file, sent))),
            }
        }
    });
    Ok(reqwest::Body::wrap_stream(stream))
}

/// Write a response body to `destination`, reporting bytes written.
pub async fn write_body(
    mut resp: reqwest::Response,
    destination: &Path,
    progress: &ProgressFn,
) -> Result<u64> {
    let total = resp.content_length();
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(destination).await?;
    let mut done = 0u64;
    progress(0, total);
    while let Some(chunk) = resp.chunk().await.map_err(transport_error)? {
        file.write_all(&chunk).await?;
        done += chunk.len() as u64;
        progress(done, total);
    }
    file.flush().await?;
    Ok(done)
}

/// Runs async HTTP work to completion from a blocking vendor call.
///
/// Blocking clients are only ever invoked from `spawn_blocking` threads,
/// where entering the runtime with `block_on` is allowed.
#[derive(Clone)]
pub struct BlockingBridge {
    handle: tokio::runtime::Handle,
}

impl BlockingBridge {
    /// Capture the current runtime.
    pub fn current() -> Result<Self> {
        let handle = tokio::runtime::Handle::try_current().map_err(|e| {
            CirrusError::Precondition(format!("blocking client needs a tokio runtime: {e}"))
        })?;
        Ok(Self { handle })
    }

    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.handle.block_on(fut)
    }
}
