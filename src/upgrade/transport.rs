//! HTTP transport used by the checker and the downloader.
//!
//! [`UpdateTransport`] is the seam between the protocol logic and the network.
//! [`HttpTransport`] implements it with `reqwest`; tests substitute a scripted
//! transport.
//!
//! Transport failures (DNS, connect, TLS, timeout, broken body) surface as
//! [`UpdaterError::TransportError`]. Non-success status codes are *not* errors at
//! this layer; the caller decides what each status means.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use regex::Regex;
use reqwest::header::{CONTENT_DISPOSITION, LAST_MODIFIED};
use serde::de::DeserializeOwned;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, warn};

use crate::constants::user_agent;
use crate::core::UpdaterError;

/// Buffered response of a check-style request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl TransportResponse {
    /// Deserializes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            UpdaterError::Other {
                message: format!("Malformed response body: {e}"),
            }
            .into()
        })
    }

    /// Body as lossy UTF-8, for log messages.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Streaming response of a download request.
pub struct DownloadResponse {
    /// HTTP status code.
    pub status: u16,
    /// `Content-Length`, when sent.
    pub content_length: Option<u64>,
    /// File name from `Content-Disposition`, when sent.
    pub file_name: Option<String>,
    /// `Last-Modified`, when sent and parseable.
    pub last_modified: Option<DateTime<Utc>>,
    /// Response body chunks.
    pub body: BoxStream<'static, Result<Bytes>>,
}

impl std::fmt::Debug for DownloadResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .field("file_name", &self.file_name)
            .field("last_modified", &self.last_modified)
            .finish_non_exhaustive()
    }
}

/// Network operations needed by the update protocols.
#[async_trait]
pub trait UpdateTransport: Send + Sync {
    /// POSTs a JSON body and buffers the response.
    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<TransportResponse>;

    /// GETs a URL and buffers the response.
    async fn get(&self, url: &str, timeout: Option<Duration>) -> Result<TransportResponse>;

    /// GETs a URL and returns the body as a stream.
    async fn download(&self, url: &str) -> Result<DownloadResponse>;
}

/// `reqwest`-backed transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Builds a transport sending `User-Agent: AppUpdater/<version>`.
    ///
    /// `accept_invalid_certs` disables TLS certificate validation. It exists for
    /// deployments whose server trust is established out of band and must be
    /// enabled explicitly in the configuration.
    pub fn new(accept_invalid_certs: bool) -> Result<Self> {
        let mut builder = reqwest::Client::builder().user_agent(user_agent());

        if accept_invalid_certs {
            warn!("TLS certificate validation is DISABLED (accept_invalid_certs = true)");
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder.build().map_err(|e| UpdaterError::ConfigurationError {
            message: format!("Failed to build HTTP client: {e}"),
        })?;

        Ok(Self {
            client,
        })
    }

    async fn buffer(
        operation: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<TransportResponse> {
        let response = request.send().await.map_err(|e| transport_error(operation, &e))?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| transport_error(operation, &e))?;
        debug!("{operation} answered {status} ({} bytes)", body.len());

        Ok(TransportResponse {
            status,
            body: body.to_vec(),
        })
    }
}

#[async_trait]
impl UpdateTransport for HttpTransport {
    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<TransportResponse> {
        let mut request = self.client.post(url).json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        Self::buffer(url, request).await
    }

    async fn get(&self, url: &str, timeout: Option<Duration>) -> Result<TransportResponse> {
        let mut request = self.client.get(url);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        Self::buffer(url, request).await
    }

    async fn download(&self, url: &str) -> Result<DownloadResponse> {
        let response =
            self.client.get(url).send().await.map_err(|e| transport_error("download", &e))?;

        let headers = response.headers();
        let file_name = headers
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_disposition);
        let last_modified = headers
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date);

        Ok(DownloadResponse {
            status: response.status().as_u16(),
            content_length: response.content_length(),
            file_name,
            last_modified,
            body: response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| transport_error("download", &e).into()))
                .boxed(),
        })
    }
}

fn transport_error(operation: &str, error: &reqwest::Error) -> UpdaterError {
    let reason = if error.is_timeout() {
        "request timed out".to_string()
    } else if error.is_connect() {
        format!("connection failed: {error}")
    } else {
        error.to_string()
    };

    UpdaterError::TransportError {
        operation: operation.to_string(),
        reason,
    }
}

/// Extracts the file name from a `Content-Disposition` header value.
///
/// Supports `filename="x"`, bare `filename=x` and RFC 5987 `filename*=UTF-8''x`,
/// preferring the extended form.
#[must_use]
pub fn parse_content_disposition(value: &str) -> Option<String> {
    static EXTENDED: OnceLock<Option<Regex>> = OnceLock::new();
    static PLAIN: OnceLock<Option<Regex>> = OnceLock::new();

    let extended = EXTENDED
        .get_or_init(|| Regex::new(r#"(?i)filename\*\s*=\s*[^']*'[^']*'([^;]+)"#).ok());
    let plain =
        PLAIN.get_or_init(|| Regex::new(r#"(?i)filename\s*=\s*(?:"([^"]*)"|([^;\s]+))"#).ok());

    if let Some(caps) = extended.as_ref().and_then(|re| re.captures(value)) {
        let name = percent_decode(caps[1].trim());
        if !name.is_empty() {
            return Some(name);
        }
    }

    plain.as_ref().and_then(|re| re.captures(value)).and_then(|caps| {
        caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str().trim().to_string())
    })
    .filter(|name| !name.is_empty())
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let decoded = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = decoded {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parses an HTTP date such as `Wed, 21 Oct 2015 07:28:00 GMT`.
#[must_use]
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|date| date.with_timezone(&Utc))
}
