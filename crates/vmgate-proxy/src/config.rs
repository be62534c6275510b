//! Proxy configuration types.
//!
//! Defines the configuration for each daemon: where it binds, which
//! upstream it forwards to, and which credential and scope it enforces.
//! Configuration is built once at startup and never mutated.

use crate::error::{ProxyError, Result};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use zeroize::Zeroizing;

/// Inference API upstream.
pub const ANTHROPIC_API_URL: &str = "https://api.anthropic.com";

/// GitHub git-over-HTTP upstream.
pub const GITHUB_GIT_URL: &str = "https://github.com";

/// GitHub hosted MCP server upstream.
pub const GITHUB_MCP_URL: &str = "https://api.githubcopilot.com";

/// Path prefix of the hosted MCP endpoint.
pub const MCP_PATH: &str = "/mcp/";

/// OAuth token endpoint used to refresh inference credentials.
pub const OAUTH_TOKEN_URL: &str = "https://platform.claude.com/v1/oauth/token";

/// Public OAuth client id of the interactive login.
pub const OAUTH_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

/// Scopes requested on refresh.
pub const OAUTH_SCOPES: &str = "user:profile user:inference user:sessions:claude_code user:mcp_servers";

/// Toolsets exposed to the VM when none are configured.
pub const DEFAULT_TOOLSETS: &[&str] = &["repos", "issues", "pull_requests", "git", "labels"];

/// Socket timeout for forwarded requests.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeout for the OAuth refresh exchange.
pub const OAUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for one proxy daemon.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Bind address (default: 127.0.0.1)
    pub bind_addr: IpAddr,

    /// Bind port (0 = OS-assigned ephemeral port)
    pub bind_port: u16,

    /// Maximum concurrent connections (0 = unlimited).
    pub max_connections: usize,

    /// Directory that receives HTML error-page dumps from failing upstreams.
    pub error_log_dir: PathBuf,

    /// Retry schedule for upstream calls.
    pub retry: RetryPolicy,

    /// Which daemon this is, with its credential and scope.
    pub service: ServiceConfig,
}

impl ProxyConfig {
    /// Configuration with loopback/ephemeral defaults for `service`.
    #[must_use]
    pub fn new(service: ServiceConfig) -> Self {
        Self {
            bind_addr: default_bind_addr(),
            bind_port: 0,
            max_connections: 256,
            error_log_dir: PathBuf::from("."),
            retry: RetryPolicy::default(),
            service,
        }
    }
}

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
}

/// Per-daemon configuration.
#[derive(Debug, Clone)]
pub enum ServiceConfig {
    /// LLM inference API proxy (API key or OAuth credential file).
    Inference(InferenceConfig),
    /// GitHub git-over-HTTP proxy (Basic auth for the scoped repo only).
    Git(GitConfig),
    /// GitHub MCP proxy (Bearer auth plus tool-call scope enforcement).
    Mcp(McpConfig),
}

impl ServiceConfig {
    /// Short name used in logs and audit events.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServiceConfig::Inference(_) => "inference",
            ServiceConfig::Git(_) => "git",
            ServiceConfig::Mcp(_) => "mcp",
        }
    }

    /// Upstream name used in error messages.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            ServiceConfig::Inference(_) => "Anthropic API",
            ServiceConfig::Git(_) => "GitHub",
            ServiceConfig::Mcp(_) => "GitHub MCP",
        }
    }

    /// Prefix of HTML error dump files.
    #[must_use]
    pub fn error_prefix(&self) -> &'static str {
        match self {
            ServiceConfig::Inference(_) => "claude-vm",
            ServiceConfig::Git(_) => "github-git",
            ServiceConfig::Mcp(_) => "github-mcp",
        }
    }

    #[must_use]
    pub fn upstream(&self) -> &UpstreamConfig {
        match self {
            ServiceConfig::Inference(c) => &c.upstream,
            ServiceConfig::Git(c) => &c.upstream,
            ServiceConfig::Mcp(c) => &c.upstream,
        }
    }

    /// Check required fields before the daemon binds.
    pub fn validate(&self) -> Result<()> {
        match self {
            ServiceConfig::Inference(_) => Ok(()),
            ServiceConfig::Git(c) => {
                require_token(&c.token, "GITHUB_TOKEN (or GITHUB_MCP_TOKEN)")?;
                c.scope.validate()
            }
            ServiceConfig::Mcp(c) => {
                require_token(&c.token, "GITHUB_MCP_TOKEN")?;
                c.scope.validate()
            }
        }
    }
}

fn require_token(token: &Zeroizing<String>, name: &str) -> Result<()> {
    if token.trim().is_empty() {
        return Err(ProxyError::Config(format!("{} is required", name)));
    }
    Ok(())
}

/// Fixed upstream for a daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    /// Scheme, host and optional port, without a trailing slash.
    pub base_url: String,
    /// Value sent as the upstream `Host` header.
    pub host: String,
}

impl UpstreamConfig {
    /// Parse an upstream base URL, deriving the `Host` header from it.
    pub fn parse(url_str: &str) -> Result<Self> {
        let parsed = url::Url::parse(url_str)
            .map_err(|e| ProxyError::Config(format!("invalid upstream URL '{}': {}", url_str, e)))?;

        let scheme = parsed.scheme();
        if scheme != "https" && scheme != "http" {
            return Err(ProxyError::Config(format!(
                "unsupported URL scheme: {}",
                url_str
            )));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| ProxyError::Config(format!("missing host in URL: {}", url_str)))?;
        let host = match parsed.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        Ok(Self {
            base_url: url_str.trim_end_matches('/').to_string(),
            host,
        })
    }

    /// Point at `base_url` while still presenting `host` upstream.
    ///
    /// Used to aim a daemon at a local mock without changing what the
    /// upstream sees in `Host`.
    #[must_use]
    pub fn with_host(base_url: &str, host: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            host: host.to_string(),
        }
    }

    /// Full upstream URL for an origin-form request target.
    ///
    /// The target's path and query are set on the parsed base URL, so
    /// dot segments are resolved. The result always has the base URL's
    /// scheme, host and port.
    pub fn url_for(&self, target: &str) -> Result<url::Url> {
        if !target.starts_with('/') {
            return Err(ProxyError::HttpParse(format!(
                "request target must be an absolute path: {}",
                target
            )));
        }
        let base = url::Url::parse(&self.base_url).map_err(|e| {
            ProxyError::Config(format!("invalid upstream URL '{}': {}", self.base_url, e))
        })?;
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (target, None),
        };

        let mut url = base.clone();
        url.set_path(path);
        url.set_query(query);

        if url.scheme() != base.scheme()
            || url.host_str() != base.host_str()
            || url.port_or_known_default() != base.port_or_known_default()
        {
            return Err(ProxyError::HttpParse(format!(
                "request target changes the upstream authority: {}",
                target
            )));
        }
        Ok(url)
    }
}

/// OAuth refresh endpoint settings.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub token_url: String,
    pub client_id: String,
    pub scopes: String,
    pub timeout: Duration,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            token_url: OAUTH_TOKEN_URL.to_string(),
            client_id: OAUTH_CLIENT_ID.to_string(),
            scopes: OAUTH_SCOPES.to_string(),
            timeout: OAUTH_TIMEOUT,
        }
    }
}

/// Inference proxy configuration.
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub upstream: UpstreamConfig,
    /// Static API key. Takes priority over the credential file.
    pub api_key: Option<Zeroizing<String>>,
    /// On-disk OAuth credential file.
    pub credentials_path: PathBuf,
    pub oauth: OAuthConfig,
}

/// Git proxy configuration.
#[derive(Debug, Clone)]
pub struct GitConfig {
    pub upstream: UpstreamConfig,
    pub token: Zeroizing<String>,
    pub scope: RepoScope,
}

/// MCP proxy configuration.
#[derive(Debug, Clone)]
pub struct McpConfig {
    pub upstream: UpstreamConfig,
    pub token: Zeroizing<String>,
    pub scope: ScopeConfig,
}

/// The single repository a daemon acts on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoScope {
    pub owner: String,
    pub repo: String,
}

impl RepoScope {
    #[must_use]
    pub fn new(owner: &str, repo: &str) -> Self {
        Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.owner.trim().is_empty() || self.repo.trim().is_empty() {
            return Err(ProxyError::Config(
                "GITHUB_MCP_OWNER and GITHUB_MCP_REPO are required".to_string(),
            ));
        }
        Ok(())
    }

    /// `owner/repo`, as used in search qualifiers.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

/// MCP scope and server-side tool filtering.
///
/// The tool-filter values are sent upstream as `X-MCP-*` headers and can
/// never be overridden by the VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeConfig {
    #[serde(flatten)]
    pub repo: RepoScope,
    #[serde(default = "default_toolsets")]
    pub toolsets: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default = "default_lockdown")]
    pub lockdown: bool,
}

impl ScopeConfig {
    /// Scope for `owner/repo` with default toolsets and lockdown enabled.
    #[must_use]
    pub fn new(owner: &str, repo: &str) -> Self {
        Self {
            repo: RepoScope::new(owner, repo),
            toolsets: default_toolsets(),
            tools: Vec::new(),
            readonly: false,
            lockdown: default_lockdown(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.repo.validate()
    }
}

fn default_toolsets() -> Vec<String> {
    DEFAULT_TOOLSETS.iter().map(|s| s.to_string()).collect()
}

fn default_lockdown() -> bool {
    true
}

/// Split a comma-separated list, dropping empty items.
#[must_use]
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
