//! Proxy server: TCP listener, connection dispatch, and lifecycle.
//!
//! The server binds to `127.0.0.1:0` (OS-assigned port), accepts TCP
//! connections, and serves one request per connection on its own task.
//!
//! CONNECT method -> refused (no tunnelling)
//! Other methods  -> [`reverse`] handler (credential injection)
//!
//! Shutdown stops the accept loop; requests already in flight run to
//! completion before [`ProxyHandle::wait`] returns.

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::reverse::{self, ReverseProxy};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Maximum total size of HTTP headers (64 KiB). Prevents OOM from
/// malicious clients sending unbounded header data.
const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Handle returned when the proxy server starts.
pub struct ProxyHandle {
    /// The actual port the proxy is listening on
    pub port: u16,
    /// Send `true` to trigger graceful shutdown
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ProxyHandle {
    /// Stop accepting connections. In-flight requests keep running.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait until the accept loop has stopped and every in-flight request
    /// has finished.
    pub async fn wait(self) {
        if let Err(e) = self.task.await {
            warn!("Proxy server task failed: {}", e);
        }
    }
}

/// Shared state for the proxy server.
struct ProxyState {
    proxy: ReverseProxy,
    max_connections: usize,
    /// Active connection count for connection limiting.
    active_connections: AtomicUsize,
}

/// Start the proxy server.
///
/// Validates the configuration, checks that a credential is available,
/// then binds to `config.bind_addr:config.bind_port` (port 0 = OS-assigned)
/// and begins accepting connections. Nothing is bound if any of this fails.
pub async fn start(config: ProxyConfig) -> Result<ProxyHandle> {
    config.service.validate()?;
    let proxy = ReverseProxy::new(&config)?;
    proxy.preflight().await?;

    // Bind listener
    let bind_addr = SocketAddr::new(config.bind_addr, config.bind_port);
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| ProxyError::Bind {
            addr: bind_addr.to_string(),
            source: e,
        })?;

    let local_addr = listener.local_addr().map_err(|e| ProxyError::Bind {
        addr: bind_addr.to_string(),
        source: e,
    })?;
    let port = local_addr.port();

    info!(
        "{} proxy listening on {}, forwarding to {}",
        proxy.service(),
        local_addr,
        config.service.upstream().base_url
    );

    // Shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state = Arc::new(ProxyState {
        proxy,
        max_connections: config.max_connections,
        active_connections: AtomicUsize::new(0),
    });

    let task = tokio::spawn(accept_loop(listener, state, shutdown_rx));

    Ok(ProxyHandle {
        port,
        shutdown_tx,
        task,
    })
}

/// Accept loop: listen for connections until shutdown, then drain.
async fn accept_loop(
    listener: TcpListener,
    state: Arc<ProxyState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        // Connection limit enforcement
                        let max = state.max_connections;
                        if max > 0 {
                            let current = state.active_connections.load(Ordering::Relaxed);
                            if current >= max {
                                warn!("Connection limit reached ({}/{}), rejecting {}", current, max, addr);
                                drop(stream);
                                continue;
                            }
                        }
                        state.active_connections.fetch_add(1, Ordering::Relaxed);

                        debug!("Accepted connection from {}", addr);
                        let state = Arc::clone(&state);
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, &state).await {
                                debug!("Connection handler error: {}", e);
                            }
                            state.active_connections.fetch_sub(1, Ordering::Relaxed);
                        });
                    }
                    Err(e) => {
                        warn!("Accept error: {}", e);
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    drop(listener);
    if !connections.is_empty() {
        info!("Proxy server shutting down, draining {} connection(s)", connections.len());
    }
    while connections.join_next().await.is_some() {}
    info!("Proxy server stopped");
}

/// Handle a single client connection.
async fn handle_connection(mut stream: TcpStream, state: &ProxyState) -> Result<()> {
    // Read the first line and headers through a BufReader.
    // We keep the BufReader alive until we've consumed the full header
    // to prevent data loss (BufReader may read ahead into the body).
    let mut buf_reader = BufReader::new(&mut stream);
    let mut first_line = String::new();
    buf_reader.read_line(&mut first_line).await?;

    if first_line.is_empty() {
        return Ok(()); // Client disconnected
    }

    // Read remaining headers (up to empty line), with size limit to prevent OOM.
    let mut header_bytes = Vec::new();
    loop {
        let mut line = String::new();
        let n = buf_reader.read_line(&mut line).await?;
        if n == 0 || line.trim().is_empty() {
            break;
        }
        header_bytes.extend_from_slice(line.as_bytes());
        if header_bytes.len() > MAX_HEADER_SIZE {
            drop(buf_reader);
            reverse::send_error(&mut stream, 431, "Request Header Fields Too Large").await?;
            return Ok(());
        }
    }

    // Body bytes the BufReader read ahead are handed to the handler.
    let buffered = buf_reader.buffer().to_vec();
    drop(buf_reader);

    let first_line = first_line.trim_end();

    if first_line.starts_with("CONNECT ") {
        debug!("Refusing CONNECT: {}", first_line);
        reverse::send_error(&mut stream, 405, "CONNECT is not supported").await?;
        return Ok(());
    }

    state
        .proxy
        .handle(first_line, &mut stream, &header_bytes, &buffered)
        .await
}
