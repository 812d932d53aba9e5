//! In-process HTTP fixture for tests: serves a manifest with ETag handling
//! and gzip blobs with `Range` support and injectable mid-stream failures.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::Url;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

const PREFIX: &str = "game";

pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Compressible test content of roughly `len` bytes
pub fn sample_content(len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + 32);
    let mut i = 0u64;
    while out.len() < len {
        out.extend_from_slice(format!("line {} {}\n", i, i.wrapping_mul(2654435761) % 9973).as_bytes());
        i += 1;
    }
    out.truncate(len);
    out
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub path: String,
    pub range: Option<String>,
    pub if_none_match: Option<String>,
}

#[derive(Default)]
struct FixtureState {
    manifest: Mutex<Option<(String, Option<String>)>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    /// path -> (remaining failures, bytes sent before the cut)
    failures: Mutex<HashMap<String, (u32, usize)>>,
    requests: Mutex<Vec<RecordedRequest>>,
    ignore_ranges: AtomicBool,
    manifest_delay: Mutex<Option<Duration>>,
}

pub struct FixtureServer {
    addr: SocketAddr,
    state: Arc<FixtureState>,
    handle: JoinHandle<()>,
}

impl FixtureServer {
    pub async fn start() -> Self {
        let state = Arc::new(FixtureState::default());
        let app = Router::new().fallback(serve).with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn manifest_url(&self) -> Url {
        Url::parse(&format!("http://{}/{}/manifest.txt", self.addr, PREFIX)).unwrap()
    }

    pub fn set_manifest(&self, body: &str, etag: Option<&str>) {
        *self.state.manifest.lock().unwrap() = Some((body.to_string(), etag.map(str::to_string)));
    }

    /// Gzip `content` and serve it under its SHA-1. Returns the hash.
    pub fn add_blob(&self, content: &[u8]) -> String {
        let hash = sha1_hex(content);
        self.add_raw_blob(&hash, gzip(content));
        hash
    }

    /// Serve arbitrary bytes as the blob for `hash`
    pub fn add_raw_blob(&self, hash: &str, bytes: Vec<u8>) {
        self.state
            .blobs
            .lock()
            .unwrap()
            .insert(blob_path(hash), bytes);
    }

    pub fn blob_bytes(&self, hash: &str) -> Vec<u8> {
        self.state.blobs.lock().unwrap()[&blob_path(hash)].clone()
    }

    /// Cut the next `times` responses for `hash` after `after` bytes.
    pub fn fail_blob(&self, hash: &str, times: u32, after: usize) {
        self.state
            .failures
            .lock()
            .unwrap()
            .insert(blob_path(hash), (times, after));
    }

    /// Hold every manifest response back by `delay`
    pub fn delay_manifest(&self, delay: Duration) {
        *self.state.manifest_delay.lock().unwrap() = Some(delay);
    }

    pub fn ignore_ranges(&self) {
        self.state.ignore_ranges.store(true, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn blob_requests(&self) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.path.ends_with(".gz"))
            .collect()
    }
}

impl Drop for FixtureServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn blob_path(hash: &str) -> String {
    format!("{}/{}.gz", PREFIX, hash)
}

fn header_string(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn serve(State(state): State<Arc<FixtureState>>, uri: Uri, headers: HeaderMap) -> Response {
    let path = uri.path().trim_start_matches('/').to_string();
    let range = header_string(&headers, header::RANGE);
    let if_none_match = header_string(&headers, header::IF_NONE_MATCH);

    state.requests.lock().unwrap().push(RecordedRequest {
        path: path.clone(),
        range: range.clone(),
        if_none_match: if_none_match.clone(),
    });

    if path.ends_with("manifest.txt") {
        let delay = *state.manifest_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let manifest = state.manifest.lock().unwrap().clone();
        let Some((body, etag)) = manifest else {
            return StatusCode::NOT_FOUND.into_response();
        };

        if etag.is_some() && etag == if_none_match {
            return StatusCode::NOT_MODIFIED.into_response();
        }

        let mut response = body.into_response();
        if let Some(tag) = etag {
            response
                .headers_mut()
                .insert(header::ETAG, HeaderValue::from_str(&tag).unwrap());
        }
        return response;
    }

    let data = state.blobs.lock().unwrap().get(&path).cloned();
    let Some(data) = data else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let offset = if state.ignore_ranges.load(Ordering::SeqCst) {
        None
    } else {
        range
            .as_deref()
            .and_then(|r| r.strip_prefix("bytes="))
            .and_then(|r| r.strip_suffix('-'))
            .and_then(|n| n.parse::<usize>().ok())
    };

    let (status, body) = match offset {
        Some(offset) if offset >= data.len() => {
            return StatusCode::RANGE_NOT_SATISFIABLE.into_response();
        }
        Some(offset) => (StatusCode::PARTIAL_CONTENT, data[offset..].to_vec()),
        None => (StatusCode::OK, data),
    };

    let cut = {
        let mut failures = state.failures.lock().unwrap();
        match failures.get_mut(&path) {
            Some((remaining, after)) if *remaining > 0 => {
                *remaining -= 1;
                Some(*after)
            }
            _ => None,
        }
    };

    match cut {
        Some(after) => {
            let head = body[..after.min(body.len())].to_vec();
            let chunks: Vec<Result<Bytes, io::Error>> = vec![
                Ok(Bytes::from(head)),
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "injected failure")),
            ];
            (status, Body::from_stream(futures_util::stream::iter(chunks))).into_response()
        }
        None => (status, body).into_response(),
    }
}
