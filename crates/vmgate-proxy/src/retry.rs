//! Upstream HTTP calls with bounded retry.
//!
//! One logical call makes up to [`MAX_ATTEMPTS`] attempts. Connection
//! failures and 5xx responses are retried after the delays in
//! [`BACKOFF_SCHEDULE`]; every other response is returned as-is.
//! Streaming responses (those with a `Transfer-Encoding` header) are
//! returned without being read, so they are never retried.
//!
//! When a 5xx body looks like an HTML error page (typically a CDN outage
//! page instead of a JSON error), it is written to
//! `{prefix}-error-{YYYYMMDD-HHMMSS}-{status}.html` before retrying.

use crate::config::UPSTREAM_TIMEOUT;
use crate::error::{ProxyError, Result};
use crate::headers::HeaderList;
use bytes::Bytes;
use reqwest::Method;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Delays before the 2nd, 3rd and 4th attempt.
pub const BACKOFF_SCHEDULE: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// One initial attempt plus three retries.
pub const MAX_ATTEMPTS: usize = 4;

/// How many leading bytes are sniffed for an HTML error page.
const HTML_SNIFF_LEN: usize = 256;

/// Retry schedule as data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delays: Vec<Duration>,
    pub max_attempts: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delays: BACKOFF_SCHEDULE.to_vec(),
            max_attempts: MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Same number of attempts with no waiting between them.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            delays: vec![Duration::ZERO],
            max_attempts: MAX_ATTEMPTS,
        }
    }

    /// Delay before retry number `retry` (1-based). Indices past the end
    /// of the schedule reuse its last entry.
    #[must_use]
    pub fn delay_for(&self, retry: usize) -> Duration {
        if self.delays.is_empty() {
            return Duration::ZERO;
        }
        let idx = retry.saturating_sub(1).min(self.delays.len() - 1);
        self.delays[idx]
    }
}

/// Progress of one logical call.
#[derive(Debug, Default)]
pub struct RetryState {
    pub attempt: usize,
    pub last_error: Option<String>,
}

/// Result of a single attempt.
enum AttemptOutcome {
    Success(UpstreamResponse),
    Retryable(String),
    Fatal(ProxyError),
}

/// A request to send upstream.
#[derive(Debug)]
pub struct UpstreamRequest<'a> {
    pub method: &'a str,
    pub url: &'a str,
    pub headers: &'a HeaderList,
    pub body: Option<Bytes>,
    /// Overrides the client's default timeout.
    pub timeout: Option<Duration>,
}

/// Body of an upstream response.
#[derive(Debug)]
pub enum UpstreamBody {
    /// Fully read body.
    Buffered(Bytes),
    /// Unread streaming body, to be relayed chunk by chunk.
    Streaming(reqwest::Response),
}

/// Response from the upstream.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderList,
    pub body: UpstreamBody,
}

impl UpstreamResponse {
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        matches!(self.body, UpstreamBody::Streaming(_))
    }

    /// Read the whole body, waiting for a streaming body to finish.
    pub async fn into_bytes(self) -> Result<Bytes> {
        match self.body {
            UpstreamBody::Buffered(bytes) => Ok(bytes),
            UpstreamBody::Streaming(resp) => resp
                .bytes()
                .await
                .map_err(|e| ProxyError::HttpParse(format!("failed to read upstream body: {}", e))),
        }
    }
}

/// HTTP client shared by all requests of a daemon.
#[derive(Debug, Clone)]
pub struct RetryableClient {
    http: reqwest::Client,
    policy: RetryPolicy,
    service: String,
    error_dir: PathBuf,
    error_prefix: String,
}

impl RetryableClient {
    /// Build a client.
    ///
    /// `service` names the upstream in [`ProxyError::UpstreamUnavailable`];
    /// `error_prefix` and `error_dir` locate HTML error dumps.
    pub fn new(
        service: &str,
        policy: RetryPolicy,
        error_dir: &Path,
        error_prefix: &str,
    ) -> Result<Self> {
        // HTTP/1.1 only: streaming is detected from Transfer-Encoding.
        let http = reqwest::Client::builder()
            .http1_only()
            .no_proxy()
            .timeout(UPSTREAM_TIMEOUT)
            .build()
            .map_err(|e| ProxyError::Config(format!("HTTP client error: {}", e)))?;
        Ok(Self {
            http,
            policy,
            service: service.to_string(),
            error_dir: error_dir.to_path_buf(),
            error_prefix: error_prefix.to_string(),
        })
    }

    /// Perform one logical call, retrying transport failures and 5xx.
    pub async fn call(&self, req: &UpstreamRequest<'_>) -> Result<UpstreamResponse> {
        let method = Method::from_bytes(req.method.as_bytes())
            .map_err(|_| ProxyError::HttpParse(format!("invalid method: {}", req.method)))?;
        let headers = req.headers.to_header_map()?;

        let mut state = RetryState::default();
        while state.attempt < self.policy.max_attempts {
            if state.attempt > 0 {
                let delay = self.policy.delay_for(state.attempt);
                debug!(
                    "retry {}/{} after {:?}",
                    state.attempt,
                    self.policy.max_attempts - 1,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            state.attempt += 1;

            match self.attempt(&method, &headers, req, state.attempt).await {
                AttemptOutcome::Success(resp) => return Ok(resp),
                AttemptOutcome::Retryable(err) => {
                    debug!("upstream attempt {} failed: {}", state.attempt, err);
                    state.last_error = Some(err);
                }
                AttemptOutcome::Fatal(err) => return Err(err),
            }
        }

        let last_error = state
            .last_error
            .unwrap_or_else(|| "no attempts made".to_string());
        warn!(
            "all {} attempts to {} failed: {}",
            state.attempt, self.service, last_error
        );
        Err(ProxyError::UpstreamUnavailable {
            service: self.service.clone(),
            attempts: state.attempt,
            last_error,
        })
    }

    async fn attempt(
        &self,
        method: &Method,
        headers: &reqwest::header::HeaderMap,
        req: &UpstreamRequest<'_>,
        attempt: usize,
    ) -> AttemptOutcome {
        let mut builder = self
            .http
            .request(method.clone(), req.url)
            .headers(headers.clone());
        if let Some(timeout) = req.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = &req.body {
            builder = builder.body(body.clone());
        }

        let started = Instant::now();
        let resp = match builder.send().await {
            Ok(resp) => resp,
            Err(e) if e.is_builder() => {
                return AttemptOutcome::Fatal(ProxyError::HttpParse(format!(
                    "invalid upstream request: {}",
                    e
                )))
            }
            Err(e) => return AttemptOutcome::Retryable(e.to_string()),
        };

        let status = resp.status().as_u16();
        let resp_headers = HeaderList::from_header_map(resp.headers());
        let streaming = resp_headers.contains("transfer-encoding");
        debug!(
            "<<< {} {} ({}ms)",
            status,
            if streaming { "streaming" } else { "complete" },
            started.elapsed().as_millis()
        );

        if streaming {
            return AttemptOutcome::Success(UpstreamResponse {
                status,
                headers: resp_headers,
                body: UpstreamBody::Streaming(resp),
            });
        }

        let body = match resp.bytes().await {
            Ok(body) => body,
            Err(e) => return AttemptOutcome::Retryable(format!("failed to read body: {}", e)),
        };

        if status >= 500 {
            if looks_like_html(&body, &resp_headers) {
                let context = format!(
                    "HTTP {} from {} {} attempt {}",
                    status, req.method, req.url, attempt
                );
                self.save_error_page(status, &body, &context).await;
                return AttemptOutcome::Retryable(format!(
                    "{} returned HTTP {} (HTML error page)",
                    self.service, status
                ));
            }
            return AttemptOutcome::Retryable(format!("{} returned HTTP {}", self.service, status));
        }

        AttemptOutcome::Success(UpstreamResponse {
            status,
            headers: resp_headers,
            body: UpstreamBody::Buffered(body),
        })
    }

    /// Write an HTML error body to the error directory. Failures are logged
    /// and otherwise ignored.
    async fn save_error_page(&self, status: u16, body: &[u8], context: &str) {
        let ts = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let path = self
            .error_dir
            .join(format!("{}-error-{}-{}.html", self.error_prefix, ts, status));
        let mut contents = format!("<!-- {} -->\n", context).into_bytes();
        contents.extend_from_slice(body);
        let target = path.clone();
        match tokio::task::spawn_blocking(move || std::fs::write(target, contents)).await {
            Ok(Ok(())) => debug!("saved error response to {}", path.display()),
            Ok(Err(e)) => debug!("failed to save error response: {}", e),
            Err(e) => debug!("error response writer did not finish: {}", e),
        }
    }
}

/// Whether a response body is an HTML page rather than an API error.
#[must_use]
pub fn looks_like_html(body: &[u8], headers: &HeaderList) -> bool {
    if headers
        .get("content-type")
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("html"))
    {
        return true;
    }
    let prefix = &body[..body.len().min(HTML_SNIFF_LEN)];
    let start = prefix
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(prefix.len());
    let trimmed = &prefix[start..];
    trimmed.starts_with(b"<") || trimmed.starts_with(b"<!DOCTYPE") || trimmed.starts_with(b"<!doctype")
}
