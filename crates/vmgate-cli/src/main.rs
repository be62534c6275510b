//! vmgate CLI - host-side proxy daemons for agent VMs
//!
//! Parses the daemon configuration from flags and environment, starts the
//! proxy, prints its port, and serves until SIGINT or SIGTERM.

mod cli;

use clap::Parser;
use cli::{Cli, Commands, GitArgs, InferenceArgs, LogSettings, McpArgs};
use std::io::Write;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};
use vmgate_proxy::config::{
    split_list, GitConfig, InferenceConfig, McpConfig, OAuthConfig, RepoScope, ScopeConfig,
    UpstreamConfig,
};
use vmgate_proxy::{ProxyConfig, ProxyError, Result, ServiceConfig};
use zeroize::Zeroizing;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn main() {
    let cli = Cli::parse();
    init_logging(&cli.command.log_settings());

    if let Err(e) = run(cli.command) {
        error!("{}", e);
        eprintln!("vmgate: {}", e);
        std::process::exit(1);
    }
}

/// Stderr logging filtered by `RUST_LOG`, plus a debug-level log file when
/// the daemon's debug switch is on.
fn init_logging(settings: &LogSettings) {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")));

    let file_layer = if settings.debug {
        match std::fs::create_dir_all(&settings.dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::never(&settings.dir, settings.file_name);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let _ = LOG_GUARD.set(guard);
                Some(
                    fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_filter(LevelFilter::DEBUG),
                )
            }
            Err(e) => {
                eprintln!(
                    "vmgate: cannot create log directory {}: {}",
                    settings.dir.display(),
                    e
                );
                None
            }
        }
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();
}

fn run(command: Commands) -> Result<()> {
    let config = build_config(command)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| ProxyError::Config(format!("Failed to create async runtime: {}", e)))?;

    rt.block_on(serve(config))
}

async fn serve(config: ProxyConfig) -> Result<()> {
    let service = config.service.name();
    let handle = vmgate_proxy::start(config).await?;

    // The launcher reads the port from the first line of stdout.
    let mut stdout = std::io::stdout();
    writeln!(stdout, "{}", handle.port)?;
    stdout.flush()?;
    info!("{} proxy listening on 127.0.0.1:{}", service, handle.port);

    wait_for_signal().await?;
    info!("{} proxy shutting down", service);
    handle.shutdown();
    handle.wait().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

fn build_config(command: Commands) -> Result<ProxyConfig> {
    let (service, error_log_dir) = match command {
        Commands::Inference(args) => {
            let dir = args.log_dir.clone();
            (inference_service(args)?, dir)
        }
        Commands::Git(args) => {
            let dir = args.log_dir.clone();
            (git_service(args)?, dir)
        }
        Commands::Mcp(args) => {
            let dir = args.log_dir.clone();
            (mcp_service(args)?, dir)
        }
    };

    let mut config = ProxyConfig::new(service);
    config.error_log_dir = error_log_dir;
    Ok(config)
}

fn inference_service(args: InferenceArgs) -> Result<ServiceConfig> {
    let credentials_path = match args.credentials {
        Some(path) => path,
        None => default_credentials_path()?,
    };

    Ok(ServiceConfig::Inference(InferenceConfig {
        upstream: UpstreamConfig::parse(&args.upstream)?,
        api_key: args
            .api_key
            .filter(|k| !k.is_empty())
            .map(Zeroizing::new),
        credentials_path,
        oauth: OAuthConfig::default(),
    }))
}

fn git_service(args: GitArgs) -> Result<ServiceConfig> {
    let token = args.resolved_token().unwrap_or_default().to_string();

    Ok(ServiceConfig::Git(GitConfig {
        upstream: UpstreamConfig::parse(&args.upstream)?,
        token: Zeroizing::new(token),
        scope: RepoScope::new(
            args.owner.as_deref().unwrap_or_default(),
            args.repo.as_deref().unwrap_or_default(),
        ),
    }))
}

fn mcp_service(args: McpArgs) -> Result<ServiceConfig> {
    let mut scope = ScopeConfig::new(
        args.owner.as_deref().unwrap_or_default(),
        args.repo.as_deref().unwrap_or_default(),
    );
    scope.toolsets = split_list(&args.toolsets);
    scope.tools = split_list(&args.tools);
    scope.readonly = args.readonly;
    scope.lockdown = args.lockdown;

    Ok(ServiceConfig::Mcp(McpConfig {
        upstream: UpstreamConfig::parse(&args.upstream)?,
        token: Zeroizing::new(args.token.unwrap_or_default()),
        scope,
    }))
}

fn default_credentials_path() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".claude").join(".credentials.json"))
        .ok_or_else(|| {
            ProxyError::Config(
                "cannot determine home directory; set CLAUDE_CREDENTIALS_PATH".to_string(),
            )
        })
}
