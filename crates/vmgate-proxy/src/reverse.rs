//! Credential-injecting reverse proxy.
//!
//! Each daemon forwards every request from the VM to one fixed upstream.
//! The VM's own `Authorization`/`X-Api-Key` headers are discarded and the
//! daemon's credential is attached instead:
//!
//! - inference: `Authorization: Bearer` plus the OAuth beta flag for OAuth
//!   tokens, or `x-api-key` for a static API key
//! - git: `Authorization: Basic x-access-token:<token>`, but only for paths
//!   under the scoped repository
//! - MCP: `Authorization: Bearer`, after tool-call scope enforcement, with
//!   the `X-MCP-*` filter headers replaced by configured values
//!
//! Upstream responses that carry `Transfer-Encoding` are relayed as they
//! arrive, re-framed as chunked encoding. All other responses are relayed
//! with a `Content-Length`.

use crate::audit;
use crate::config::{ProxyConfig, RepoScope, ServiceConfig, UpstreamConfig, MCP_PATH};
use crate::error::{ProxyError, Result};
use crate::headers::{redact, HeaderList};
use crate::policy::ScopePolicy;
use crate::retry::{RetryableClient, UpstreamBody, UpstreamRequest, UpstreamResponse};
use crate::token::{CredentialKind, ResolvedToken, TokenProvider, OAUTH_BETA};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use std::borrow::Cow;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;
use zeroize::Zeroizing;

/// Maximum request body size (16 MiB). Prevents DoS from malicious Content-Length.
pub(crate) const MAX_REQUEST_BODY: usize = 16 * 1024 * 1024;

/// Largest chunk written to the VM when relaying a stream.
const RELAY_CHUNK_SIZE: usize = 8 * 1024;

/// Inbound headers never forwarded upstream.
const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "authorization",
    "x-api-key",
    "host",
    "content-length",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "proxy-connection",
    "proxy-authorization",
    "expect",
];

/// Upstream response headers replaced by our own framing.
const STRIPPED_RESPONSE_HEADERS: &[&str] = &[
    "transfer-encoding",
    "content-length",
    "connection",
    "keep-alive",
];

/// The credential a daemon injects.
pub enum Credential {
    Inference(TokenProvider),
    Git {
        token: Zeroizing<String>,
        scope: RepoScope,
    },
    Mcp {
        token: Zeroizing<String>,
        policy: ScopePolicy,
    },
}

/// A request read from the VM.
#[derive(Debug)]
pub struct InboundRequest {
    pub method: String,
    pub path: String,
    pub headers: HeaderList,
    pub body: Bytes,
}

/// Forwarding state shared by all connections of one daemon.
pub struct ReverseProxy {
    service: &'static str,
    upstream: UpstreamConfig,
    client: RetryableClient,
    credential: Credential,
}

impl ReverseProxy {
    /// Build the forwarding state for `config.service`.
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let service = &config.service;
        let client = RetryableClient::new(
            service.label(),
            config.retry.clone(),
            &config.error_log_dir,
            service.error_prefix(),
        )?;
        let credential = match service {
            ServiceConfig::Inference(c) => {
                let oauth_client = RetryableClient::new(
                    "OAuth token endpoint",
                    config.retry.clone(),
                    &config.error_log_dir,
                    "oauth",
                )?;
                Credential::Inference(TokenProvider::new(c, oauth_client))
            }
            ServiceConfig::Git(c) => Credential::Git {
                token: c.token.clone(),
                scope: c.scope.clone(),
            },
            ServiceConfig::Mcp(c) => Credential::Mcp {
                token: c.token.clone(),
                policy: ScopePolicy::new(c.scope.clone()),
            },
        };
        Ok(Self {
            service: service.name(),
            upstream: service.upstream().clone(),
            client,
            credential,
        })
    }

    #[must_use]
    pub fn service(&self) -> &'static str {
        self.service
    }

    /// Check that a credential is available before accepting connections.
    pub async fn preflight(&self) -> Result<()> {
        if let Credential::Inference(provider) = &self.credential {
            let resolved = provider.resolve().await?;
            debug!(
                "startup credential: {:?} {}",
                resolved.kind,
                redact(&resolved.token)
            );
        }
        Ok(())
    }

    /// Serve one request whose request line and headers were already read.
    ///
    /// `buffered` holds body bytes the header reader consumed ahead.
    pub async fn handle<S>(
        &self,
        first_line: &str,
        stream: &mut S,
        header_bytes: &[u8],
        buffered: &[u8],
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (method, path, _version) = match parse_request_line(first_line) {
            Ok(parts) => parts,
            Err(e) => {
                self.deny(stream, "-", first_line, &e).await?;
                return Ok(());
            }
        };
        let headers = match HeaderList::parse(header_bytes) {
            Ok(headers) => headers,
            Err(e) => {
                self.deny(stream, &method, &path, &e).await?;
                return Ok(());
            }
        };

        let body = match read_body(stream, &headers, buffered).await {
            Ok(body) => body,
            Err(BodyError::Refused(status, message)) => {
                audit::log_denied(self.service, &method, &path, status, message);
                send_error(stream, status, message).await?;
                return Ok(());
            }
            Err(BodyError::Io(e)) => return Err(e.into()),
        };

        let request = InboundRequest {
            method,
            path,
            headers,
            body,
        };
        debug!(
            ">>> {} {} ({} bytes)",
            request.method,
            request.path,
            request.body.len()
        );
        if matches!(self.credential, Credential::Inference(_)) {
            log_inference_body(&request.body);
        }

        let (response, authed) = match self.forward(&request).await {
            Ok(result) => result,
            Err(e) => {
                self.deny(stream, &request.method, &request.path, &e).await?;
                return Ok(());
            }
        };

        audit::log_forwarded(
            self.service,
            &request.method,
            &request.path,
            response.status,
            authed,
        );
        if let Err(e) = relay(stream, response).await {
            match e {
                ProxyError::StreamInterrupted { bytes, ref reason } => {
                    audit::log_stream_interrupted(self.service, &request.path, bytes, reason);
                }
                other => return Err(other),
            }
        }
        Ok(())
    }

    /// Apply policy and credentials, then call the upstream.
    ///
    /// Returns the response and whether a credential was attached.
    pub async fn forward(&self, request: &InboundRequest) -> Result<(UpstreamResponse, bool)> {
        if !request.path.starts_with('/') {
            return Err(ProxyError::HttpParse(format!(
                "request target must be an absolute path: {}",
                request.path
            )));
        }
        if has_dot_segment(&request.path) {
            return Err(ProxyError::HttpParse(format!(
                "dot segment in request path: {}",
                request.path
            )));
        }
        let target = match &self.credential {
            Credential::Mcp { .. } => mcp_upstream_path(&request.path),
            _ => request.path.clone(),
        };
        let url = self.upstream.url_for(&target)?;

        let body = match &self.credential {
            Credential::Mcp { policy, .. } if !request.body.is_empty() => {
                match policy.enforce(&request.body)? {
                    Cow::Borrowed(_) => request.body.clone(),
                    Cow::Owned(rewritten) => Bytes::from(rewritten),
                }
            }
            _ => request.body.clone(),
        };

        let mut headers = request.headers.clone();
        rewrite_headers(&mut headers, &self.upstream.host);

        let authed = match &self.credential {
            Credential::Inference(provider) => {
                let resolved = provider.resolve().await?;
                inject_inference_credential(&mut headers, &resolved);
                true
            }
            Credential::Git { token, scope } => {
                let authed = git_path_authorized(url.path(), scope);
                if authed {
                    headers.set("Authorization", &git_basic_auth(token));
                }
                debug!("git auth for {}: {}", url.path(), if authed { "yes" } else { "no" });
                authed
            }
            Credential::Mcp { token, policy } => {
                headers.set("Authorization", &format!("Bearer {}", token.as_str()));
                policy.apply_header_lockdown(&mut headers);
                true
            }
        };

        debug!("-> {} {} {:?}", request.method, url, headers);

        let upstream_request = UpstreamRequest {
            method: &request.method,
            url: url.as_str(),
            headers: &headers,
            body: if body.is_empty() { None } else { Some(body) },
            timeout: None,
        };
        let response = self.client.call(&upstream_request).await?;
        Ok((response, authed))
    }

    /// Send the VM-safe form of `err` and record the refusal.
    async fn deny<S>(&self, stream: &mut S, method: &str, path: &str, err: &ProxyError) -> Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        let status = err.status();
        debug!("request failed: {}", err);
        audit::log_denied(self.service, method, path, status, &err.client_message());
        send_error(stream, status, &err.client_message()).await
    }
}

enum BodyError {
    Refused(u16, &'static str),
    Io(std::io::Error),
}

/// Read a `Content-Length`-framed request body.
async fn read_body<S>(
    stream: &mut S,
    headers: &HeaderList,
    buffered: &[u8],
) -> std::result::Result<Bytes, BodyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let len = match headers.get("content-length") {
        Some(value) => value
            .trim()
            .parse::<usize>()
            .map_err(|_| BodyError::Refused(400, "Invalid Content-Length"))?,
        None => {
            if headers
                .get("transfer-encoding")
                .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"))
            {
                return Err(BodyError::Refused(411, "Length Required"));
            }
            0
        }
    };
    if len > MAX_REQUEST_BODY {
        return Err(BodyError::Refused(413, "Payload Too Large"));
    }
    if len == 0 {
        return Ok(Bytes::new());
    }

    let pre = buffered.len().min(len);
    let remaining = len - pre;
    if remaining > 0
        && headers
            .get("expect")
            .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"))
    {
        stream
            .write_all(b"HTTP/1.1 100 Continue\r\n\r\n")
            .await
            .map_err(BodyError::Io)?;
        stream.flush().await.map_err(BodyError::Io)?;
    }

    let mut buf = Vec::with_capacity(len);
    buf.extend_from_slice(&buffered[..pre]);
    if remaining > 0 {
        let mut rest = vec![0u8; remaining];
        stream.read_exact(&mut rest).await.map_err(BodyError::Io)?;
        buf.extend_from_slice(&rest);
    }
    Ok(Bytes::from(buf))
}

/// Parse an HTTP request line into (method, path, version).
pub(crate) fn parse_request_line(line: &str) -> Result<(String, String, String)> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(ProxyError::HttpParse(format!(
            "malformed request line: {}",
            line
        )));
    }
    Ok((
        parts[0].to_string(),
        parts[1].to_string(),
        parts[2].to_string(),
    ))
}

/// Whether a path has a `.` or `..` segment, including percent-encoded
/// dots and separators.
fn has_dot_segment(target: &str) -> bool {
    let path = target.split('?').next().unwrap_or(target);
    let decoded = path
        .to_ascii_lowercase()
        .replace("%2e", ".")
        .replace("%2f", "/")
        .replace("%5c", "/");
    decoded
        .split(|c: char| c == '/' || c == '\\')
        .any(|segment| segment == "." || segment == "..")
}

/// Drop VM credentials and hop-by-hop headers and point `Host` upstream.
fn rewrite_headers(headers: &mut HeaderList, upstream_host: &str) {
    for name in STRIPPED_REQUEST_HEADERS {
        headers.remove(name);
    }
    headers.set("Host", upstream_host);
}

fn inject_inference_credential(headers: &mut HeaderList, resolved: &ResolvedToken) {
    match resolved.kind {
        CredentialKind::OAuth => {
            headers.set("Authorization", &format!("Bearer {}", resolved.token.as_str()));
            headers.merge_token("anthropic-beta", OAUTH_BETA);
            debug!("auth: OAuth Bearer {}", redact(&resolved.token));
        }
        CredentialKind::ApiKey => {
            headers.set("x-api-key", &resolved.token);
            debug!("auth: API key {}", redact(&resolved.token));
        }
    }
}

/// Whether a git request targets the scoped repository.
///
/// The query string is ignored and a trailing `/` is assumed, so both
/// `/{owner}/{repo}` and `/{owner}/{repo}.git/info/refs?...` match.
fn git_path_authorized(path: &str, scope: &RepoScope) -> bool {
    let bare = path.split('?').next().unwrap_or(path);
    let candidate = format!("{}/", bare);
    [
        format!("/{}/{}.git/", scope.owner, scope.repo),
        format!("/{}/{}/", scope.owner, scope.repo),
    ]
    .iter()
    .any(|prefix| candidate.starts_with(prefix.as_str()))
}

fn git_basic_auth(token: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("x-access-token:{}", token)))
}

/// Map an inbound path onto the hosted MCP endpoint.
fn mcp_upstream_path(path: &str) -> String {
    format!("{}{}", MCP_PATH, path.trim_start_matches('/')).replace("//", "/")
}

/// Summarize an inference request body in the debug log.
fn log_inference_body(body: &[u8]) {
    if body.is_empty() {
        return;
    }
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(json) => debug!(
            "> body: model={} stream={} messages={}",
            json.get("model").and_then(|m| m.as_str()).unwrap_or("?"),
            json.get("stream").and_then(|s| s.as_bool()).unwrap_or(false),
            json.get("messages")
                .and_then(|m| m.as_array())
                .map_or(0, Vec::len)
        ),
        Err(_) => debug!("> body: {} bytes (not JSON)", body.len()),
    }
}

/// Status line and headers for a relayed response.
fn response_head(status: u16, headers: &HeaderList, framing: &str) -> String {
    let reason = reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("");
    let mut head = format!("HTTP/1.1 {} {}\r\n", status, reason);
    for (name, value) in headers.iter() {
        if STRIPPED_RESPONSE_HEADERS
            .iter()
            .any(|s| name.eq_ignore_ascii_case(s))
        {
            continue;
        }
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str(framing);
    head.push_str("\r\nConnection: close\r\n\r\n");
    head
}

/// Relay an upstream response to the VM.
async fn relay<W>(stream: &mut W, response: UpstreamResponse) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let UpstreamResponse {
        status,
        headers,
        body,
    } = response;

    match body {
        UpstreamBody::Buffered(data) => {
            let head = response_head(status, &headers, &format!("Content-Length: {}", data.len()));
            stream.write_all(head.as_bytes()).await?;
            stream.write_all(&data).await?;
            stream.flush().await?;
            debug!("<<< {} body: {} bytes", status, data.len());
            Ok(())
        }
        UpstreamBody::Streaming(mut upstream) => {
            let head = response_head(status, &headers, "Transfer-Encoding: chunked");
            stream.write_all(head.as_bytes()).await?;
            stream.flush().await?;

            let mut total: u64 = 0;
            loop {
                let chunk = match upstream.chunk().await {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => break,
                    Err(e) => {
                        return Err(ProxyError::StreamInterrupted {
                            bytes: total,
                            reason: format!("upstream read failed: {}", e),
                        })
                    }
                };
                for piece in chunk.chunks(RELAY_CHUNK_SIZE) {
                    write_chunk(stream, piece)
                        .await
                        .map_err(|e| ProxyError::StreamInterrupted {
                            bytes: total,
                            reason: e.to_string(),
                        })?;
                    total += piece.len() as u64;
                }
            }
            stream
                .write_all(b"0\r\n\r\n")
                .await
                .map_err(|e| ProxyError::StreamInterrupted {
                    bytes: total,
                    reason: e.to_string(),
                })?;
            stream.flush().await?;
            debug!("<<< {} streamed {} bytes", status, total);
            Ok(())
        }
    }
}

/// Write one chunk in HTTP/1.1 chunked framing.
async fn write_chunk<W>(stream: &mut W, data: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(format!("{:x}\r\n", data.len()).as_bytes()).await?;
    stream.write_all(data).await?;
    stream.write_all(b"\r\n").await?;
    stream.flush().await
}

/// Send a JSON error response.
pub(crate) async fn send_error<W>(stream: &mut W, status: u16, message: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(&serde_json::json!({
        "error": {"type": "proxy_error", "message": message}
    }))?;
    let reason = reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Error");
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        reason,
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn split_response(raw: &[u8]) -> (String, Vec<u8>) {
        let pos = raw.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
        (
            String::from_utf8(raw[..pos].to_vec()).unwrap(),
            raw[pos + 4..].to_vec(),
        )
    }

    #[test]
    fn test_parse_request_line() {
        let (method, path, version) =
            parse_request_line("POST /v1/messages?beta=true HTTP/1.1").unwrap();
        assert_eq!(method, "POST");
        assert_eq!(path, "/v1/messages?beta=true");
        assert_eq!(version, "HTTP/1.1");
    }

    #[test]
    fn test_parse_request_line_malformed() {
        assert!(parse_request_line("GET").is_err());
    }

    #[test]
    fn test_rewrite_headers_strips_credentials_and_hop_by_hop() {
        let mut headers = HeaderList::parse(
            b"Host: 127.0.0.1:41234\r\nAuthorization: Bearer vm\r\nX-Api-Key: vm\r\nConnection: keep-alive\r\nContent-Length: 10\r\nContent-Type: application/json\r\n",
        )
        .unwrap();
        rewrite_headers(&mut headers, "api.anthropic.com");
        let entries: Vec<(&str, &str)> = headers.iter().collect();
        assert_eq!(
            entries,
            vec![("Content-Type", "application/json"), ("Host", "api.anthropic.com")]
        );
    }

    #[test]
    fn test_inject_oauth_merges_beta() {
        let mut headers = HeaderList::parse(b"anthropic-beta: tools-2024-04-04\r\n").unwrap();
        let resolved = ResolvedToken {
            token: Zeroizing::new("sk-ant-oat01-abc".to_string()),
            kind: CredentialKind::OAuth,
        };
        inject_inference_credential(&mut headers, &resolved);
        assert_eq!(headers.get("authorization"), Some("Bearer sk-ant-oat01-abc"));
        assert_eq!(
            headers.get("anthropic-beta"),
            Some("tools-2024-04-04,oauth-2025-04-20")
        );
        assert!(!headers.contains("x-api-key"));
    }

    #[test]
    fn test_inject_api_key() {
        let mut headers = HeaderList::new();
        let resolved = ResolvedToken {
            token: Zeroizing::new("sk-ant-api03-key".to_string()),
            kind: CredentialKind::ApiKey,
        };
        inject_inference_credential(&mut headers, &resolved);
        assert_eq!(headers.get("x-api-key"), Some("sk-ant-api03-key"));
        assert!(!headers.contains("authorization"));
        assert!(!headers.contains("anthropic-beta"));
    }

    #[test]
    fn test_git_path_authorized() {
        let scope = RepoScope::new("wirenboard", "agent-vm");
        assert!(git_path_authorized(
            "/wirenboard/agent-vm.git/info/refs?service=git-upload-pack",
            &scope
        ));
        assert!(git_path_authorized("/wirenboard/agent-vm.git/git-receive-pack", &scope));
        assert!(git_path_authorized("/wirenboard/agent-vm", &scope));
        assert!(git_path_authorized("/wirenboard/agent-vm/info/refs", &scope));
        assert!(!git_path_authorized("/wirenboard/agent-vm-fork.git/info/refs", &scope));
        assert!(!git_path_authorized("/wirenboard/other.git/info/refs", &scope));
        assert!(!git_path_authorized("/evil/agent-vm.git/info/refs", &scope));
        assert!(!git_path_authorized("/wirenboard", &scope));
    }

    #[test]
    fn test_has_dot_segment() {
        assert!(has_dot_segment("/wirenboard/agent-vm/../secret.git/info/refs"));
        assert!(has_dot_segment("/wirenboard/agent-vm/%2e%2e/secret.git"));
        assert!(has_dot_segment("/wirenboard/agent-vm/%2E%2e/secret.git"));
        assert!(has_dot_segment("/wirenboard/agent-vm.git/..%2fsecret.git"));
        assert!(has_dot_segment("/wirenboard/agent-vm\\..\\secret.git"));
        assert!(has_dot_segment("/../x"));
        assert!(has_dot_segment("/./x"));
        assert!(!has_dot_segment("/wirenboard/agent-vm.git/info/refs?service=git-upload-pack"));
        assert!(!has_dot_segment("/v1/messages?x=../y"));
        assert!(!has_dot_segment("/wirenboard/repo..name/x"));
    }

    #[test]
    fn test_git_basic_auth() {
        assert_eq!(
            git_basic_auth("ghu_token"),
            format!("Basic {}", STANDARD.encode("x-access-token:ghu_token"))
        );
    }

    #[test]
    fn test_mcp_upstream_path() {
        assert_eq!(mcp_upstream_path("/"), "/mcp/");
        assert_eq!(mcp_upstream_path(""), "/mcp/");
        assert_eq!(mcp_upstream_path("/mcp"), "/mcp/mcp");
        assert_eq!(mcp_upstream_path("//x//y"), "/mcp/x/y");
    }

    #[test]
    fn test_response_head_drops_framing_headers() {
        let headers = HeaderList::parse(
            b"Content-Type: text/event-stream\r\nTransfer-Encoding: chunked\r\nConnection: keep-alive\r\nKeep-Alive: timeout=5\r\nrequest-id: req_1\r\n",
        )
        .unwrap();
        let head = response_head(200, &headers, "Transfer-Encoding: chunked");
        assert_eq!(
            head,
            "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nrequest-id: req_1\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn test_relay_buffered_sets_content_length() {
        let headers = HeaderList::parse(b"Content-Type: application/json\r\nContent-Length: 999\r\n").unwrap();
        let response = UpstreamResponse {
            status: 404,
            headers,
            body: UpstreamBody::Buffered(Bytes::from_static(b"{\"error\":1}")),
        };
        let mut out: Vec<u8> = Vec::new();
        relay(&mut out, response).await.unwrap();
        let (head, body) = split_response(&out);
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(head.contains("Content-Length: 11"));
        assert!(!head.contains("999"));
        assert_eq!(body, b"{\"error\":1}");
    }

    /// Writer that accepts `ok_writes` writes, then fails like a closed socket.
    struct FailingWriter {
        ok_writes: usize,
        written: Vec<u8>,
    }

    impl AsyncWrite for FailingWriter {
        fn poll_write(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            if self.ok_writes == 0 {
                return std::task::Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "client went away",
                )));
            }
            self.ok_writes -= 1;
            self.written.extend_from_slice(buf);
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    /// A streaming upstream response that sends `hello`, pauses, then `world`.
    async fn two_part_stream() -> reqwest::Response {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n",
                )
                .await;
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            let _ = socket.write_all(b"5\r\nworld\r\n0\r\n\r\n").await;
        });
        let client = reqwest::Client::builder().no_proxy().build().unwrap();
        client
            .get(format!("http://{}/stream", addr))
            .send()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_relay_reports_client_drop_mid_stream() {
        let upstream = two_part_stream().await;
        let response = UpstreamResponse {
            status: 200,
            headers: HeaderList::from_header_map(upstream.headers()),
            body: UpstreamBody::Streaming(upstream),
        };
        // Head, then size line, data and CRLF of the first chunk.
        let mut out = FailingWriter {
            ok_writes: 4,
            written: Vec::new(),
        };
        let err = relay(&mut out, response).await.unwrap_err();
        match err {
            ProxyError::StreamInterrupted { bytes, reason } => {
                assert!(bytes >= 5, "bytes relayed: {}", bytes);
                assert!(reason.contains("client went away"), "{}", reason);
            }
            other => panic!("expected StreamInterrupted, got {:?}", other),
        }
        let written = String::from_utf8_lossy(&out.written).to_string();
        assert!(written.contains("5\r\nhello\r\n"));
        assert!(!written.contains("proxy_error"));
    }

    #[tokio::test]
    async fn test_write_chunk_framing() {
        let mut out: Vec<u8> = Vec::new();
        write_chunk(&mut out, &[b'a'; 26]).await.unwrap();
        assert_eq!(out, [b"1a\r\n".as_slice(), &[b'a'; 26], b"\r\n"].concat());
    }

    #[tokio::test]
    async fn test_send_error_json_shape() {
        let mut out: Vec<u8> = Vec::new();
        send_error(&mut out, 403, "Repo scope violation: x").await.unwrap();
        let (head, body) = split_response(&out);
        assert!(head.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(head.contains("Connection: close"));
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], "proxy_error");
        assert_eq!(json["error"]["message"], "Repo scope violation: x");
    }
}
