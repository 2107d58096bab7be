//! Test utilities for app-updater
//!
//! This module provides scripted stand-ins for the seams of the update engine
//! so tests never touch the network or real processes:
//! - [`MockTransport`] answers requests from a route table and records them
//! - [`RecordingAlerts`] and [`RecordingProgress`] capture what the user would see
//! - [`CountingTerminator`] replaces process termination during lock recovery
//! - [`TarBuilder`] and [`gzip`] produce packages byte by byte
//!
//! # Example
//!
//! ```rust,no_run
//! use app_updater::test_utils::{MockTransport, TarBuilder, gzip};
//! use serde_json::json;
//!
//! let package = gzip(&TarBuilder::new().file("bin/app", b"binary").build());
//! let transport = MockTransport::new()
//!     .respond("/check?", 200, json!(false))
//!     .respond_download("/download?", package, Some("app-1.1.0.tar.gz"), None);
//! ```

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::config::UpdaterConfig;
use crate::constants::TAR_BLOCK_SIZE;
use crate::core::UpdaterError;
use crate::upgrade::checker::AlertSink;
use crate::upgrade::lock_recovery::ProcessTerminator;
use crate::upgrade::progress::{ProgressEvent, ProgressSink};
use crate::upgrade::transport::{DownloadResponse, TransportResponse, UpdateTransport};

/// Global flag to ensure logging is only initialized once in tests
static INIT_LOGGING: Once = Once::new();

/// Initialize logging for tests.
///
/// Uses `level` when given, otherwise `RUST_LOG`. With neither, tests run
/// without a subscriber.
///
/// ```bash
/// RUST_LOG=debug cargo test
/// ```
pub fn init_test_logging(level: Option<Level>) {
    INIT_LOGGING.call_once(|| {
        let filter = if let Some(level) = level {
            EnvFilter::new(level.to_string())
        } else if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            return;
        };

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(false)
            .with_ansi(true)
            .try_init();
    });
}

/// Configuration pointing at `http://updates.test` for app `test-app`, with
/// install, work and log directories created under `root`.
pub fn test_config(root: &Path) -> UpdaterConfig {
    let install = root.join("install");
    let work = root.join("work");
    let logs = root.join("logs");
    for dir in [&install, &work, &logs] {
        std::fs::create_dir_all(dir)
            .unwrap_or_else(|e| panic!("Failed to create {}: {e}", dir.display()));
    }

    UpdaterConfig {
        server_url: Some("http://updates.test".to_string()),
        app_name: Some("test-app".to_string()),
        install_path: Some(install.to_string_lossy().into_owned()),
        work_dir: Some(work),
        log_dir: Some(logs),
        check_timeout_secs: 5,
        ..UpdaterConfig::default()
    }
}

enum Reply {
    Buffered {
        status: u16,
        body: Vec<u8>,
    },
    Download {
        status: u16,
        body: Vec<u8>,
        file_name: Option<String>,
        last_modified: Option<DateTime<Utc>>,
        content_length: Option<u64>,
    },
    Fail,
}

struct Route {
    pattern: String,
    reply: Reply,
}

/// Scripted [`UpdateTransport`].
///
/// Each request is answered by the first route whose pattern is a substring
/// of the URL. Unmatched requests answer `404` with an empty body.
#[derive(Default)]
pub struct MockTransport {
    routes: Vec<Route>,
    requests: Mutex<Vec<String>>,
    bodies: Mutex<Vec<serde_json::Value>>,
}

/// Size of the chunks a scripted download body is streamed in.
const DOWNLOAD_CHUNK: usize = 1024;

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers matching requests with `status` and a JSON body.
    pub fn respond(mut self, pattern: &str, status: u16, body: serde_json::Value) -> Self {
        self.routes.push(Route {
            pattern: pattern.to_string(),
            reply: Reply::Buffered {
                status,
                body: body.to_string().into_bytes(),
            },
        });
        self
    }

    /// Answers matching requests with `status` and no body.
    pub fn respond_empty(mut self, pattern: &str, status: u16) -> Self {
        self.routes.push(Route {
            pattern: pattern.to_string(),
            reply: Reply::Buffered {
                status,
                body: Vec::new(),
            },
        });
        self
    }

    /// Fails matching requests with a transport error.
    pub fn fail(mut self, pattern: &str) -> Self {
        self.routes.push(Route {
            pattern: pattern.to_string(),
            reply: Reply::Fail,
        });
        self
    }

    /// Serves `body` as a `200` download with optional headers.
    pub fn respond_download(
        mut self,
        pattern: &str,
        body: Vec<u8>,
        file_name: Option<&str>,
        last_modified: Option<DateTime<Utc>>,
    ) -> Self {
        let content_length = Some(body.len() as u64);
        self.routes.push(Route {
            pattern: pattern.to_string(),
            reply: Reply::Download {
                status: 200,
                body,
                file_name: file_name.map(str::to_string),
                last_modified,
                content_length,
            },
        });
        self
    }

    /// Overrides `Content-Length` of the most recent download route.
    pub fn with_content_length(mut self, length: u64) -> Self {
        let last = self.routes.iter_mut().rev().find_map(|route| match &mut route.reply {
            Reply::Download {
                content_length,
                ..
            } => Some(content_length),
            _ => None,
        });
        if let Some(content_length) = last {
            *content_length = Some(length);
        }
        self
    }

    /// URLs requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    /// Body of the most recent POST.
    pub fn last_body(&self) -> Option<serde_json::Value> {
        self.bodies.lock().unwrap_or_else(std::sync::PoisonError::into_inner).last().cloned()
    }

    fn route(&self, url: &str) -> Option<&Reply> {
        self.requests.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(url.to_string());
        self.routes.iter().find(|route| url.contains(&route.pattern)).map(|route| &route.reply)
    }

    fn buffered(&self, url: &str) -> Result<TransportResponse> {
        match self.route(url) {
            Some(Reply::Buffered {
                status,
                body,
            })
            | Some(Reply::Download {
                status,
                body,
                ..
            }) => Ok(TransportResponse {
                status: *status,
                body: body.clone(),
            }),
            Some(Reply::Fail) => Err(refused(url)),
            None => Ok(TransportResponse {
                status: 404,
                body: Vec::new(),
            }),
        }
    }
}

fn refused(url: &str) -> anyhow::Error {
    UpdaterError::TransportError {
        operation: url.to_string(),
        reason: "connection refused".to_string(),
    }
    .into()
}

fn chunked(body: &[u8]) -> futures::stream::BoxStream<'static, Result<Bytes>> {
    let chunks: Vec<Result<Bytes>> =
        body.chunks(DOWNLOAD_CHUNK).map(|chunk| Ok(Bytes::copy_from_slice(chunk))).collect();
    futures::stream::iter(chunks).boxed()
}

#[async_trait]
impl UpdateTransport for MockTransport {
    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
        _timeout: Option<Duration>,
    ) -> Result<TransportResponse> {
        self.bodies.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(body.clone());
        self.buffered(url)
    }

    async fn get(&self, url: &str, _timeout: Option<Duration>) -> Result<TransportResponse> {
        self.buffered(url)
    }

    async fn download(&self, url: &str) -> Result<DownloadResponse> {
        match self.route(url) {
            Some(Reply::Download {
                status,
                body,
                file_name,
                last_modified,
                content_length,
            }) => Ok(DownloadResponse {
                status: *status,
                content_length: *content_length,
                file_name: file_name.clone(),
                last_modified: *last_modified,
                body: chunked(body),
            }),
            Some(Reply::Buffered {
                status,
                body,
            }) => Ok(DownloadResponse {
                status: *status,
                content_length: Some(body.len() as u64),
                file_name: None,
                last_modified: None,
                body: chunked(body),
            }),
            Some(Reply::Fail) => Err(refused(url)),
            None => Ok(DownloadResponse {
                status: 404,
                content_length: Some(0),
                file_name: None,
                last_modified: None,
                body: chunked(&[]),
            }),
        }
    }
}

/// Alert sink that keeps every message.
#[derive(Debug, Default)]
pub struct RecordingAlerts {
    messages: Mutex<Vec<String>>,
}

impl RecordingAlerts {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }
}

impl AlertSink for RecordingAlerts {
    fn alert(&self, message: &str) {
        self.messages
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(message.to_string());
    }
}

/// Progress sink that keeps every delivered event.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }
}

impl ProgressSink for RecordingProgress {
    fn on_progress(&self, event: ProgressEvent) {
        self.events.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(event);
    }
}

/// Process terminator that only counts how often it was asked to kill.
#[derive(Debug, Default)]
pub struct CountingTerminator {
    calls: AtomicUsize,
    fail: bool,
    clear: bool,
}

impl CountingTerminator {
    /// A terminator whose every call returns an error.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// A terminator that removes a directory blocking the locked path, as if
    /// the holder had exited and released it.
    pub fn clearing() -> Self {
        Self {
            clear: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ProcessTerminator for CountingTerminator {
    fn terminate_holders(&self, path: &Path) -> Result<usize> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(anyhow!("refusing to terminate holders of {}", path.display()));
        }
        if self.clear && path.is_dir() {
            std::fs::remove_dir_all(path)?;
            return Ok(1);
        }
        Ok(0)
    }
}

/// Builds tar streams block by block.
///
/// Headers are ustar with valid checksums unless [`raw_entry`](Self::raw_entry)
/// is used to plant a malformed size field.
#[derive(Debug, Default, Clone)]
pub struct TarBuilder {
    data: Vec<u8>,
    end_marker: bool,
}

impl TarBuilder {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            end_marker: true,
        }
    }

    /// Appends a regular file.
    pub fn file(self, name: &str, contents: &[u8]) -> Self {
        let size = octal_field(contents.len() as u64, 12);
        self.raw_entry(name, &size, b'0', contents)
    }

    /// Appends a directory entry.
    pub fn directory(self, name: &str) -> Self {
        let size = octal_field(0, 12);
        self.raw_entry(name, &size, b'5', &[])
    }

    /// Appends an entry with a caller-supplied size field and type flag.
    pub fn raw_entry(mut self, name: &str, size_field: &[u8], typeflag: u8, payload: &[u8]) -> Self {
        self.data.extend_from_slice(&header_block(name, size_field, typeflag));
        self.push_payload(payload);
        self
    }

    /// Appends a file whose name is carried by a GNU `L` record.
    pub fn gnu_long_file(self, name: &str, contents: &[u8]) -> Self {
        let mut long_name = name.as_bytes().to_vec();
        long_name.push(0);
        let size = octal_field(long_name.len() as u64, 12);
        let truncated: String = name.chars().take(99).collect();

        self.raw_entry("././@LongLink", &size, b'L', &long_name).file(&truncated, contents)
    }

    /// Omits the two zero blocks that normally end the archive.
    pub fn without_end_marker(mut self) -> Self {
        self.end_marker = false;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut data = self.data;
        if self.end_marker {
            data.extend_from_slice(&[0u8; TAR_BLOCK_SIZE * 2]);
        }
        data
    }

    fn push_payload(&mut self, payload: &[u8]) {
        self.data.extend_from_slice(payload);
        let remainder = payload.len() % TAR_BLOCK_SIZE;
        if remainder != 0 {
            self.data.resize(self.data.len() + TAR_BLOCK_SIZE - remainder, 0);
        }
    }
}

/// Zero-padded octal digits followed by a NUL, `width` bytes in total.
fn octal_field(value: u64, width: usize) -> Vec<u8> {
    let mut field = format!("{value:0digits$o}", digits = width - 1).into_bytes();
    field.push(0);
    field
}

fn header_block(name: &str, size_field: &[u8], typeflag: u8) -> [u8; TAR_BLOCK_SIZE] {
    let mut block = [0u8; TAR_BLOCK_SIZE];
    let name = name.as_bytes();
    let name_len = name.len().min(100);
    block[..name_len].copy_from_slice(&name[..name_len]);

    block[100..108].copy_from_slice(&octal_field(0o644, 8));
    block[108..116].copy_from_slice(&octal_field(0, 8));
    block[116..124].copy_from_slice(&octal_field(0, 8));
    let size_len = size_field.len().min(12);
    block[124..124 + size_len].copy_from_slice(&size_field[..size_len]);
    block[136..148].copy_from_slice(&octal_field(1_700_000_000, 12));
    block[156] = typeflag;
    block[257..263].copy_from_slice(b"ustar\0");
    block[263..265].copy_from_slice(b"00");

    block[148..156].fill(b' ');
    let checksum: u64 = block.iter().map(|&b| u64::from(b)).sum();
    let mut field = format!("{checksum:06o}").into_bytes();
    field.extend_from_slice(&[0, b' ']);
    block[148..156].copy_from_slice(&field);
    block
}

/// Gzip-compresses `data` with default settings.
pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap_or_else(|e| panic!("Failed to gzip test data: {e}"));
    encoder.finish().unwrap_or_else(|e| panic!("Failed to finish gzip stream: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tar_builder_layout() {
        let tar = TarBuilder::new().file("a.txt", &[1u8; 600]).build();
        // header + two payload blocks + end marker
        assert_eq!(tar.len(), TAR_BLOCK_SIZE * 5);
        assert_eq!(&tar[124..135], b"00000001130");
    }

    #[test]
    fn test_mock_transport_matches_first_route() {
        let transport = MockTransport::new()
            .respond_empty("/check-upgrades", 204)
            .respond("/check", 200, serde_json::json!(true));

        let response = transport.buffered("http://x/update/a/check-upgrades?p=1").unwrap();
        assert_eq!(response.status, 204);
        let response = transport.buffered("http://x/update/a/check?p=1").unwrap();
        assert_eq!(response.body, b"true");
        assert_eq!(transport.requests().len(), 2);
    }
}
