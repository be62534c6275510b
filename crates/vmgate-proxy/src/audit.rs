//! Audit logging for proxy requests.
//!
//! Every forwarded or refused request produces one structured `tracing`
//! event. Credentials, request bodies and tool arguments are never
//! included.

use tracing::{info, warn};

/// Log a request that was forwarded upstream.
pub fn log_forwarded(service: &str, method: &str, path: &str, status: u16, authed: bool) {
    info!(
        target: "vmgate_proxy::audit",
        service = service,
        method = method,
        path = path,
        status = status,
        credential = authed,
        decision = "allow",
        "request forwarded"
    );
}

/// Log a request refused before reaching the upstream.
pub fn log_denied(service: &str, method: &str, path: &str, status: u16, reason: &str) {
    info!(
        target: "vmgate_proxy::audit",
        service = service,
        method = method,
        path = path,
        status = status,
        decision = "deny",
        reason = reason,
        "request denied"
    );
}

/// Log a streaming response cut short after its headers were sent.
pub fn log_stream_interrupted(service: &str, path: &str, bytes: u64, reason: &str) {
    warn!(
        target: "vmgate_proxy::audit",
        service = service,
        path = path,
        bytes = bytes,
        reason = reason,
        "stream interrupted"
    );
}
