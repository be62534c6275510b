//! Credential-injecting loopback proxies for an untrusted VM.
//!
//! `vmgate-proxy` runs on the host and gives a VM access to three upstream
//! services without ever handing it a credential:
//!
//! 1. **Inference** - forwards to the LLM inference API with a static API
//!    key or an OAuth access token read from the host's credential file,
//!    refreshing the token when it nears expiry ([`token`]).
//!
//! 2. **Git** - forwards git-over-HTTP to GitHub, attaching the token only
//!    to requests for the one configured repository.
//!
//! 3. **MCP** - forwards to GitHub's hosted MCP server after confining
//!    every tool call to the configured repository ([`policy`]).
//!
//! Each daemon listens on a loopback port, reads one HTTP/1.1 request per
//! connection, rewrites its headers, and relays the upstream response,
//! streaming chunked responses as they arrive ([`reverse`], [`server`]).
//! Upstream calls are retried on transport failures and 5xx responses
//! ([`retry`]).

pub mod audit;
pub mod config;
pub mod credential;
pub mod error;
pub mod headers;
pub mod policy;
pub mod retry;
pub mod reverse;
pub mod server;
pub mod token;

pub use config::{ProxyConfig, ServiceConfig};
pub use error::{ProxyError, Result};
pub use server::{start, ProxyHandle};
