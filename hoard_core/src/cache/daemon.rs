//! Cache daemon: a [`BlobCache`] served over HTTP.
//!
//! Routes:
//! ```text
//! GET /blobs/{digest}   200 with the stored value, 404 on a miss
//! PUT /blobs/{digest}   204 once stored, 413 if the value does not fit
//! GET /health           200
//! ```
//!
//! Digests are hex. Clients deflate values before sending them and inflate
//! them on the way back; the daemon stores what it is given.

use super::BlobCache;
use crate::digest::Digest;
use crate::error::{Error, Result};
use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use flate2::Compression;
use flate2::read::{DeflateDecoder, DeflateEncoder};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Largest value accepted on the wire, either direction.
pub const MAX_VALUE_LEN: usize = 1 << 20;

#[derive(Clone)]
struct DaemonState {
    cache: Arc<dyn BlobCache>,
}

/// Daemon-side failure, mapped to an HTTP status.
#[derive(Debug, thiserror::Error)]
enum DaemonError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<Error> for DaemonError {
    fn from(err: Error) -> Self {
        match err {
            Error::ValueTooLarge { .. } => Self::PayloadTooLarge(err.to_string()),
            Error::InvalidDigest { .. } => Self::BadRequest(err.to_string()),
            _ => Self::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for DaemonError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        warn!(status = %status, error = %message, "cache request failed");
        (status, message).into_response()
    }
}

/// Routes serving `cache`.
pub fn router(cache: Arc<dyn BlobCache>) -> Router {
    Router::new()
        .route("/blobs/{digest}", get(get_blob).put(put_blob))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_VALUE_LEN))
        .layer(TraceLayer::new_for_http())
        .with_state(DaemonState { cache })
}

/// Serve `cache` on `listener` until the listener fails.
pub async fn serve(listener: tokio::net::TcpListener, cache: Arc<dyn BlobCache>) -> Result<()> {
    info!(addr = %listener.local_addr()?, "cache daemon listening");
    axum::serve(listener, router(cache)).await?;
    Ok(())
}

async fn health() -> StatusCode {
    StatusCode::OK
}

/// Run a cache operation off the async workers; redb and the LRU lock block.
async fn blocking<T, F>(f: F) -> std::result::Result<T, DaemonError>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DaemonError::Internal(format!("cache task failed: {e}")))?
        .map_err(DaemonError::from)
}

async fn get_blob(
    State(state): State<DaemonState>,
    Path(digest): Path<String>,
) -> std::result::Result<Response, DaemonError> {
    let digest = Digest::from_hex(&digest)?;
    let cache = Arc::clone(&state.cache);
    match blocking(move || cache.get(&digest)).await? {
        Some(value) => Ok((StatusCode::OK, value).into_response()),
        None => Ok(StatusCode::NOT_FOUND.into_response()),
    }
}

async fn put_blob(
    State(state): State<DaemonState>,
    Path(digest): Path<String>,
    body: Bytes,
) -> std::result::Result<StatusCode, DaemonError> {
    let digest = Digest::from_hex(&digest)?;
    let cache = Arc::clone(&state.cache);
    blocking(move || cache.put(&digest, &body)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Blocking client for a cache daemon.
///
/// Every request is a complete HTTP exchange; a connection that fails
/// mid-reply is dropped rather than reused.
pub struct CacheClient {
    agent: ureq::Agent,
    base_url: String,
}

impl CacheClient {
    /// Client for the daemon at `base_url`, e.g. `http://127.0.0.1:7070`.
    pub fn new(base_url: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(Duration::from_secs(30))
            .timeout_write(Duration::from_secs(30))
            .build();
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, digest: &Digest) -> String {
        format!("{}/blobs/{}", self.base_url, digest.to_hex())
    }
}

impl BlobCache for CacheClient {
    fn get(&self, digest: &Digest) -> Result<Option<Vec<u8>>> {
        let url = self.url(digest);
        let resp = match self.agent.get(&url).call() {
            Ok(resp) => resp,
            Err(ureq::Error::Status(404, _)) => return Ok(None),
            Err(err) => return Err(request_error("GET", &url, err)),
        };

        let mut compressed = Vec::new();
        resp.into_reader()
            .take(MAX_VALUE_LEN as u64 + 1)
            .read_to_end(&mut compressed)
            .map_err(|e| Error::rpc(format!("GET {url}: reading reply: {e}")))?;
        if compressed.len() > MAX_VALUE_LEN {
            return Err(Error::rpc(format!(
                "GET {url}: reply exceeds the {MAX_VALUE_LEN} byte wire limit"
            )));
        }
        inflate(&compressed).map(Some)
    }

    fn put(&self, digest: &Digest, value: &[u8]) -> Result<()> {
        let compressed = deflate(value)?;
        if compressed.len() > MAX_VALUE_LEN {
            return Err(Error::value_too_large(format!(
                "cache value of {} bytes exceeds the {} byte wire limit",
                compressed.len(),
                MAX_VALUE_LEN
            )));
        }
        let url = self.url(digest);
        match self.agent.put(&url).send_bytes(&compressed) {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(413, resp)) => Err(Error::value_too_large(format!(
                "PUT {url}: {}",
                resp.into_string().unwrap_or_default()
            ))),
            Err(err) => Err(request_error("PUT", &url, err)),
        }
    }
}

fn request_error(method: &str, url: &str, err: ureq::Error) -> Error {
    match err {
        ureq::Error::Status(code, resp) => Error::rpc(format!(
            "{method} {url}: HTTP {code}: {}",
            resp.into_string().unwrap_or_default()
        )),
        ureq::Error::Transport(transport) => Error::rpc(format!("{method} {url}: {transport}")),
    }
}

fn deflate(value: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    DeflateEncoder::new(value, Compression::fast())
        .read_to_end(&mut out)
        .map_err(|e| Error::compression(format!("deflate failed: {}", e)))?;
    Ok(out)
}

fn inflate(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    DeflateDecoder::new(compressed)
        .take(MAX_VALUE_LEN as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| Error::compression(format!("inflate failed: {}", e)))?;
    if out.len() > MAX_VALUE_LEN {
        return Err(Error::rpc("inflated value exceeds the wire limit"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DiskCache, MemCache};
    use axum::body::Body;
    use axum::http::Request;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread;
    use tower::ServiceExt;

    /// Serve `listener` on a runtime of its own, in a background thread.
    fn serve_in_background(listener: TcpListener, cache: Arc<dyn BlobCache>) {
        thread::spawn(move || {
            listener.set_nonblocking(true).unwrap();
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async move {
                let listener = tokio::net::TcpListener::from_std(listener).unwrap();
                serve(listener, cache).await.unwrap();
            });
        });
    }

    fn spawn_daemon(cache: Arc<dyn BlobCache>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        serve_in_background(listener, cache);
        format!("http://{}", addr)
    }

    async fn send(cache: Arc<dyn BlobCache>, method: &str, uri: &str, body: Vec<u8>) -> Response {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body))
            .unwrap();
        router(cache).oneshot(req).await.unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn test_health() {
        let resp = send(Arc::new(MemCache::new(64)), "GET", "/health", Vec::new()).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let cache: Arc<dyn BlobCache> = Arc::new(MemCache::new(1024));
        let digest = Digest::of(b"stored");
        let uri = format!("/blobs/{}", digest.to_hex());

        let resp = send(cache.clone(), "GET", &uri, Vec::new()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = send(cache.clone(), "PUT", &uri, b"stored".to_vec()).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = send(cache, "GET", &uri, Vec::new()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_bytes(resp).await, b"stored");
    }

    #[tokio::test]
    async fn test_bad_digest_rejected() {
        let resp = send(Arc::new(MemCache::new(64)), "GET", "/blobs/not-hex", Vec::new()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let uri = format!("/blobs/{}", Digest::of(b"x").to_hex());
        let resp = send(
            Arc::new(MemCache::new(1 << 30)),
            "PUT",
            &uri,
            vec![0u8; MAX_VALUE_LEN + 1],
        )
        .await;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_cache_budget_maps_to_413() {
        let uri = format!("/blobs/{}", Digest::of(b"x").to_hex());
        let cache = Arc::new(DiskCache::temporary(4).unwrap());
        let resp = send(cache, "PUT", &uri, vec![1u8; 64]).await;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(String::from_utf8(body_bytes(resp).await).unwrap().contains("cache budget"));
    }

    #[test]
    fn test_client_server_roundtrip() {
        let client = CacheClient::new(&spawn_daemon(Arc::new(MemCache::new(1 << 20))));

        let value = b"cached over the wire, cached over the wire".to_vec();
        let digest = Digest::of(&value);
        assert!(client.get(&digest).unwrap().is_none());
        client.put(&digest, &value).unwrap();
        assert_eq!(client.get(&digest).unwrap().unwrap(), value);
    }

    #[test]
    fn test_daemon_stores_compressed_value() {
        let cache = Arc::new(MemCache::new(1 << 20));
        let client = CacheClient::new(&spawn_daemon(cache.clone()));

        let value = vec![b'z'; 10_000];
        let digest = Digest::of(&value);
        client.put(&digest, &value).unwrap();
        let stored = cache.get(&digest).unwrap().unwrap();
        assert!(stored.len() < value.len());
        assert_eq!(inflate(&stored).unwrap(), value);
    }

    #[test]
    fn test_put_over_budget_reported() {
        let client = CacheClient::new(&spawn_daemon(Arc::new(DiskCache::temporary(4).unwrap())));
        let value: Vec<u8> = (0..=255u8).collect();
        let err = client.put(&Digest::of(&value), &value).unwrap_err();
        assert!(matches!(err, Error::ValueTooLarge { .. }));
        assert!(err.to_string().contains("cache budget"));

        assert!(client.get(&Digest::of(&value)).unwrap().is_none());
    }

    #[test]
    fn test_client_recovers_after_truncated_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let cache: Arc<dyn BlobCache> = Arc::new(MemCache::new(1 << 20));
        let value = b"served after the broken reply".to_vec();
        let digest = Digest::of(&value);

        thread::spawn(move || {
            // First connection: promise a body, send part of it, hang up.
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap() > 0 && line != "\r\n" {
                line.clear();
            }
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\npartial")
                .unwrap();
            drop(stream);
            drop(reader);

            serve_in_background(listener, cache);
        });

        let client = CacheClient::new(&format!("http://{}", addr));
        let err = client.get(&digest).unwrap_err();
        assert!(matches!(err, Error::Rpc { .. } | Error::Compression { .. }));

        // Later requests see whole, correctly framed replies.
        client.put(&digest, &value).unwrap();
        assert_eq!(client.get(&digest).unwrap().unwrap(), value);
        assert!(client.get(&Digest::of(b"absent")).unwrap().is_none());
    }

    #[test]
    fn test_unreachable_daemon_is_rpc_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = CacheClient::new(&format!("http://{}", addr));
        let err = client.get(&Digest::of(b"any")).unwrap_err();
        assert!(matches!(err, Error::Rpc { .. }));
    }
}
