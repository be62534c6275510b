//! CLI argument definitions for vmgate
//!
//! Every option can also come from the environment, so the daemons can be
//! launched by a VM manager that only sets variables.

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;
use vmgate_proxy::config::{ANTHROPIC_API_URL, GITHUB_GIT_URL, GITHUB_MCP_URL};

/// vmgate - credential-injecting proxies for agent VMs
///
/// Each subcommand starts one loopback proxy daemon, prints the port it
/// bound to on stdout, and serves until interrupted.
#[derive(Parser, Debug)]
#[command(name = "vmgate")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Proxy the inference API with an API key or the host's OAuth login
    #[command(after_help = "EXAMPLES:
    # Use the OAuth login in ~/.claude/.credentials.json
    vmgate inference

    # Use a static API key
    ANTHROPIC_API_KEY=sk-ant-... vmgate inference

    # Write a debug log to /var/log/vm
    vmgate inference --debug --log-dir /var/log/vm
")]
    Inference(InferenceArgs),

    /// Proxy git-over-HTTP to GitHub, authenticating only the scoped repository
    #[command(after_help = "EXAMPLES:
    GITHUB_TOKEN=ghu_... vmgate git --owner wirenboard --repo agent-vm
")]
    Git(GitArgs),

    /// Proxy GitHub's MCP server, confining tool calls to one repository
    #[command(after_help = "EXAMPLES:
    # Default toolsets, lockdown on
    GITHUB_MCP_TOKEN=ghu_... vmgate mcp --owner wirenboard --repo agent-vm

    # Read-only, issues only
    vmgate mcp --owner wirenboard --repo agent-vm --toolsets issues --readonly
")]
    Mcp(McpArgs),
}

#[derive(Args, Debug, Clone)]
pub struct InferenceArgs {
    /// Static API key (takes priority over the credential file)
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// OAuth credential file (default: ~/.claude/.credentials.json)
    #[arg(long, env = "CLAUDE_CREDENTIALS_PATH", value_name = "FILE")]
    pub credentials: Option<PathBuf>,

    /// Write a debug log file into the log directory
    #[arg(
        long,
        env = "CLAUDE_VM_PROXY_DEBUG",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        num_args = 0..=1,
        default_missing_value = "true",
        default_value = "false"
    )]
    pub debug: bool,

    /// Directory for the debug log and upstream error dumps
    #[arg(long, env = "CLAUDE_VM_PROXY_LOG_DIR", value_name = "DIR", default_value = ".")]
    pub log_dir: PathBuf,

    #[arg(long, hide = true, default_value = ANTHROPIC_API_URL)]
    pub upstream: String,
}

#[derive(Args, Debug, Clone)]
pub struct GitArgs {
    /// GitHub token injected for the scoped repository
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Fallback token source shared with the MCP daemon
    #[arg(long, env = "GITHUB_MCP_TOKEN", hide = true, hide_env_values = true)]
    pub mcp_token: Option<String>,

    /// Repository owner
    #[arg(long, env = "GITHUB_MCP_OWNER")]
    pub owner: Option<String>,

    /// Repository name
    #[arg(long, env = "GITHUB_MCP_REPO")]
    pub repo: Option<String>,

    /// Write a debug log file into the log directory
    #[arg(
        long,
        env = "GITHUB_GIT_PROXY_DEBUG",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        num_args = 0..=1,
        default_missing_value = "true",
        default_value = "false"
    )]
    pub debug: bool,

    /// Directory for the debug log and upstream error dumps
    #[arg(long, env = "GITHUB_GIT_PROXY_LOG_DIR", value_name = "DIR", default_value = ".")]
    pub log_dir: PathBuf,

    #[arg(long, hide = true, default_value = GITHUB_GIT_URL)]
    pub upstream: String,
}

impl GitArgs {
    /// `--token`, falling back to the MCP token.
    pub fn resolved_token(&self) -> Option<&str> {
        [&self.token, &self.mcp_token]
            .into_iter()
            .filter_map(|t| t.as_deref())
            .find(|t| !t.is_empty())
    }
}

#[derive(Args, Debug, Clone)]
pub struct McpArgs {
    /// GitHub token sent to the MCP server
    #[arg(long, env = "GITHUB_MCP_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Repository owner
    #[arg(long, env = "GITHUB_MCP_OWNER")]
    pub owner: Option<String>,

    /// Repository name
    #[arg(long, env = "GITHUB_MCP_REPO")]
    pub repo: Option<String>,

    /// Comma-separated MCP toolsets
    #[arg(
        long,
        env = "GITHUB_MCP_TOOLSETS",
        default_value = "repos,issues,pull_requests,git,labels"
    )]
    pub toolsets: String,

    /// Comma-separated individual tools
    #[arg(long, env = "GITHUB_MCP_TOOLS", default_value = "")]
    pub tools: String,

    /// Ask the server to expose read-only tools only
    #[arg(
        long,
        env = "GITHUB_MCP_READONLY",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        num_args = 0..=1,
        default_missing_value = "true",
        default_value = "false"
    )]
    pub readonly: bool,

    /// Ask the server to hide content from untrusted authors (0 disables)
    #[arg(
        long,
        env = "GITHUB_MCP_LOCKDOWN",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        num_args = 0..=1,
        default_missing_value = "true",
        default_value = "true"
    )]
    pub lockdown: bool,

    /// Write a debug log file into the log directory
    #[arg(
        long,
        env = "GITHUB_MCP_PROXY_DEBUG",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        num_args = 0..=1,
        default_missing_value = "true",
        default_value = "false"
    )]
    pub debug: bool,

    /// Directory for the debug log and upstream error dumps
    #[arg(long, env = "GITHUB_MCP_PROXY_LOG_DIR", value_name = "DIR", default_value = ".")]
    pub log_dir: PathBuf,

    #[arg(long, hide = true, default_value = GITHUB_MCP_URL)]
    pub upstream: String,
}

/// Debug log settings shared by every daemon.
#[derive(Debug, Clone)]
pub struct LogSettings {
    pub debug: bool,
    pub dir: PathBuf,
    pub file_name: &'static str,
}

impl Commands {
    pub fn log_settings(&self) -> LogSettings {
        let (debug, dir, file_name) = match self {
            Commands::Inference(a) => (a.debug, &a.log_dir, "claude-vm-proxy.log"),
            Commands::Git(a) => (a.debug, &a.log_dir, "github-git-proxy.log"),
            Commands::Mcp(a) => (a.debug, &a.log_dir, "github-mcp-proxy.log"),
        };
        LogSettings {
            debug,
            dir: dir.clone(),
            file_name,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_mcp_flags() {
        let cli = Cli::parse_from([
            "vmgate",
            "mcp",
            "--token",
            "ghu_x",
            "--owner",
            "wirenboard",
            "--repo",
            "agent-vm",
            "--toolsets",
            "issues",
            "--readonly",
            "--lockdown",
            "0",
        ]);
        match cli.command {
            Commands::Mcp(args) => {
                assert_eq!(args.owner.as_deref(), Some("wirenboard"));
                assert_eq!(args.repo.as_deref(), Some("agent-vm"));
                assert_eq!(args.toolsets, "issues");
                assert!(args.readonly);
                assert!(!args.lockdown);
            }
            _ => panic!("Expected Mcp command"),
        }
    }

    #[test]
    fn test_boolish_values() {
        for (value, expected) in [("1", true), ("yes", true), ("0", false), ("false", false)] {
            let cli = Cli::parse_from(["vmgate", "inference", "--debug", value]);
            match cli.command {
                Commands::Inference(args) => assert_eq!(args.debug, expected, "{value}"),
                _ => panic!("Expected Inference command"),
            }
        }
    }

    #[test]
    fn test_git_token_fallback() {
        let cli = Cli::parse_from(["vmgate", "git", "--token", "", "--mcp-token", "ghu_mcp"]);
        match cli.command {
            Commands::Git(args) => assert_eq!(args.resolved_token(), Some("ghu_mcp")),
            _ => panic!("Expected Git command"),
        }

        let cli = Cli::parse_from(["vmgate", "git", "--token", "ghu_git", "--mcp-token", "x"]);
        match cli.command {
            Commands::Git(args) => assert_eq!(args.resolved_token(), Some("ghu_git")),
            _ => panic!("Expected Git command"),
        }
    }

    #[test]
    fn test_log_settings() {
        let cli = Cli::parse_from(["vmgate", "mcp", "--debug", "--log-dir", "/tmp/logs"]);
        let settings = cli.command.log_settings();
        assert!(settings.debug);
        assert_eq!(settings.dir, PathBuf::from("/tmp/logs"));
        assert_eq!(settings.file_name, "github-mcp-proxy.log");
    }

    #[test]
    fn test_unknown_subcommand_rejected() {
        assert!(Cli::try_parse_from(["vmgate", "proxy"]).is_err());
    }
}
