//! Single-repository scope enforcement for MCP tool calls.
//!
//! Every `tools/call` request is classified by tool name. Tools that take
//! `owner`/`repo` arguments are pinned to the configured repository, search
//! tools get a `repo:` qualifier, and tools that cannot be confined to one
//! repository are refused. A tool name that is not classified is refused
//! too, so a tool added upstream stays blocked until it is listed here.
//!
//! Requests that pass unchanged keep their exact bytes.

use crate::config::ScopeConfig;
use crate::error::{ProxyError, Result};
use crate::headers::HeaderList;
use regex::Regex;
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::sync::LazyLock;
use tracing::debug;

/// Tool-filter headers the VM may not set.
pub const MCP_FILTER_HEADERS: &[&str] = &[
    "X-MCP-Toolsets",
    "X-MCP-Tools",
    "X-MCP-Readonly",
    "X-MCP-Lockdown",
];

/// How a tool is confined to the configured repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCategory {
    /// Needs no repository (user metadata).
    Unscoped,
    /// Takes `owner` and `repo` arguments.
    RepoFieldScoped,
    /// Takes a free-text search `query`.
    SearchScoped,
    /// Works across organizations or users; never allowed.
    AlwaysBlocked,
    /// Not classified; never allowed.
    Unknown,
}

impl ToolCategory {
    #[must_use]
    pub fn classify(tool: &str) -> Self {
        match tool {
            "get_me" => ToolCategory::Unscoped,

            "search_code" | "search_repositories" | "search_issues" | "search_pull_requests" => {
                ToolCategory::SearchScoped
            }

            "search_users" | "search_orgs" | "get_teams" | "get_team_members"
            | "list_issue_types" => ToolCategory::AlwaysBlocked,

            // repos
            "create_branch"
            | "create_or_update_file"
            | "create_repository"
            | "delete_file"
            | "fork_repository"
            | "get_commit"
            | "get_file_contents"
            | "get_latest_release"
            | "get_release_by_tag"
            | "get_tag"
            | "list_branches"
            | "list_commits"
            | "list_releases"
            | "list_tags"
            | "push_files"
            // issues
            | "add_issue_comment"
            | "assign_copilot_to_issue"
            | "get_label"
            | "issue_read"
            | "issue_write"
            | "list_issues"
            | "sub_issue_write"
            // pull_requests
            | "add_comment_to_pending_review"
            | "add_reply_to_pull_request_comment"
            | "create_pull_request"
            | "list_pull_requests"
            | "merge_pull_request"
            | "pull_request_read"
            | "pull_request_review_write"
            | "request_copilot_review"
            | "update_pull_request"
            | "update_pull_request_branch"
            // git
            | "get_repository_tree"
            // labels
            | "label_write"
            | "list_label" => ToolCategory::RepoFieldScoped,

            _ => ToolCategory::Unknown,
        }
    }
}

static REPO_QUALIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\brepo:(\S+)").expect("repo qualifier regex is valid"));

static OWNER_QUALIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(org|user):(\S+)").expect("owner qualifier regex is valid")
});

/// Scope enforcement for one MCP daemon.
#[derive(Debug, Clone)]
pub struct ScopePolicy {
    scope: ScopeConfig,
}

impl ScopePolicy {
    #[must_use]
    pub fn new(scope: ScopeConfig) -> Self {
        Self { scope }
    }

    #[must_use]
    pub fn scope(&self) -> &ScopeConfig {
        &self.scope
    }

    /// Check a request body and rewrite it if arguments must be injected.
    ///
    /// Returns the input bytes untouched unless a rewrite was needed.
    /// Bodies that are not JSON, and JSON-RPC methods other than
    /// `tools/call`, pass through.
    pub fn enforce<'a>(&self, body: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        if body.is_empty() {
            return Ok(Cow::Borrowed(body));
        }
        let Ok(mut request) = serde_json::from_slice::<Value>(body) else {
            return Ok(Cow::Borrowed(body));
        };
        if request.get("method").and_then(Value::as_str) != Some("tools/call") {
            return Ok(Cow::Borrowed(body));
        }

        let tool = request
            .pointer("/params/name")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        let category = ToolCategory::classify(&tool);
        match category {
            ToolCategory::Unknown => {
                return Err(violation(format!("unknown tool '{}' is not allowed", tool)))
            }
            ToolCategory::AlwaysBlocked => {
                return Err(violation(format!("{} is not allowed (not repo-scoped)", tool)))
            }
            ToolCategory::Unscoped => {
                debug!("allowed unscoped tool: {}", tool);
                return Ok(Cow::Borrowed(body));
            }
            ToolCategory::RepoFieldScoped | ToolCategory::SearchScoped => {}
        }

        let Some(args) = arguments_mut(&mut request) else {
            return Err(violation(format!("{} arguments must be an object", tool)));
        };
        let modified = match category {
            ToolCategory::SearchScoped => self.enforce_search(&tool, args)?,
            _ => self.enforce_repo_fields(&tool, args)?,
        };

        if modified {
            Ok(Cow::Owned(serde_json::to_vec(&request)?))
        } else {
            Ok(Cow::Borrowed(body))
        }
    }

    /// Pin `owner` and `repo`. Returns whether a field was injected.
    fn enforce_repo_fields(&self, tool: &str, args: &mut Map<String, Value>) -> Result<bool> {
        let mut modified = false;
        for (field, expected) in [
            ("owner", self.scope.repo.owner.as_str()),
            ("repo", self.scope.repo.repo.as_str()),
        ] {
            match args.get(field) {
                Some(Value::String(value)) if value == expected => {}
                Some(value) => {
                    return Err(violation(format!(
                        "{} called with {}={}, expected {:?}",
                        tool, field, value, expected
                    )))
                }
                None => {
                    args.insert(field.to_string(), Value::String(expected.to_string()));
                    debug!("injected {}={:?} for {}", field, expected, tool);
                    modified = true;
                }
            }
        }
        Ok(modified)
    }

    /// Confine a search query to the repository. Returns whether the query
    /// was rewritten.
    fn enforce_search(&self, tool: &str, args: &mut Map<String, Value>) -> Result<bool> {
        let full_name = self.scope.repo.full_name();
        let query = match args.get("query") {
            None => "",
            Some(Value::String(q)) => q.as_str(),
            Some(other) => {
                return Err(violation(format!(
                    "{} called with query={}, expected a string",
                    tool, other
                )))
            }
        };

        for caps in REPO_QUALIFIER.captures_iter(query) {
            let value = &caps[1];
            if value != full_name {
                return Err(violation(format!(
                    "{} query contains repo:{}, expected repo:{}",
                    tool, value, full_name
                )));
            }
        }
        if let Some(caps) = OWNER_QUALIFIER.captures(query) {
            return Err(violation(format!(
                "{} query contains {}:{} (not allowed, use repo: scope)",
                tool, &caps[1], &caps[2]
            )));
        }

        let scope = format!("repo:{}", full_name);
        if query.contains(&scope) {
            return Ok(false);
        }
        let scoped = format!("{} {}", scope, query).trim().to_string();
        debug!("injected scope: {}", scoped);
        args.insert("query".to_string(), Value::String(scoped));
        Ok(true)
    }

    /// Replace any VM-supplied `X-MCP-*` filter headers with configured ones.
    pub fn apply_header_lockdown(&self, headers: &mut HeaderList) {
        for name in MCP_FILTER_HEADERS {
            headers.remove(name);
        }
        if !self.scope.toolsets.is_empty() {
            headers.set("X-MCP-Toolsets", &self.scope.toolsets.join(","));
        }
        if !self.scope.tools.is_empty() {
            headers.set("X-MCP-Tools", &self.scope.tools.join(","));
        }
        if self.scope.readonly {
            headers.set("X-MCP-Readonly", "true");
        }
        if self.scope.lockdown {
            headers.set("X-MCP-Lockdown", "true");
        }
    }
}

/// `params.arguments` as a mutable object, creating it when absent.
fn arguments_mut(request: &mut Value) -> Option<&mut Map<String, Value>> {
    let params = request.get_mut("params")?.as_object_mut()?;
    params
        .entry("arguments")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
}

fn violation(message: String) -> ProxyError {
    debug!("BLOCKED: {}", message);
    ProxyError::ScopeViolation(message)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy() -> ScopePolicy {
        ScopePolicy::new(ScopeConfig::new("wirenboard", "agent-vm"))
    }

    fn call(tool: &str, args: Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {"name": tool, "arguments": args},
        }))
        .unwrap()
    }

    fn arguments(body: &[u8]) -> Value {
        let parsed: Value = serde_json::from_slice(body).unwrap();
        parsed["params"]["arguments"].clone()
    }

    fn rejected(body: &[u8]) -> String {
        match policy().enforce(body) {
            Err(ProxyError::ScopeViolation(msg)) => msg,
            other => panic!("expected scope violation, got {:?}", other.map(|b| b.to_vec())),
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(ToolCategory::classify("get_me"), ToolCategory::Unscoped);
        assert_eq!(ToolCategory::classify("search_code"), ToolCategory::SearchScoped);
        assert_eq!(ToolCategory::classify("search_users"), ToolCategory::AlwaysBlocked);
        assert_eq!(ToolCategory::classify("get_teams"), ToolCategory::AlwaysBlocked);
        assert_eq!(ToolCategory::classify("create_branch"), ToolCategory::RepoFieldScoped);
        assert_eq!(ToolCategory::classify("list_label"), ToolCategory::RepoFieldScoped);
        assert_eq!(ToolCategory::classify("delete_repository"), ToolCategory::Unknown);
        assert_eq!(ToolCategory::classify(""), ToolCategory::Unknown);
    }

    #[test]
    fn test_non_tool_call_passes_through() {
        let body = br#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#;
        let out = policy().enforce(body).unwrap();
        assert!(matches!(out, Cow::Borrowed(_)));
        assert_eq!(&*out, body);
    }

    #[test]
    fn test_malformed_json_passes_through() {
        let body = b"{\"method\": \"tools/call\", ";
        assert_eq!(&*policy().enforce(body).unwrap(), body);
        assert!(policy().enforce(b"").unwrap().is_empty());
    }

    #[test]
    fn test_matching_fields_are_byte_identical() {
        // Whitespace and key order that re-serialization would not reproduce.
        let body = br#"{ "jsonrpc": "2.0", "id": 7, "method": "tools/call",
            "params": { "name": "get_file_contents",
                        "arguments": { "repo": "agent-vm", "path": "README.md", "owner": "wirenboard" } } }"#;
        let out = policy().enforce(body).unwrap();
        assert!(matches!(out, Cow::Borrowed(_)));
        assert_eq!(&*out, &body[..]);
    }

    #[test]
    fn test_missing_fields_are_injected() {
        let body = call("list_issues", json!({"state": "open"}));
        let out = policy().enforce(&body).unwrap();
        assert!(matches!(out, Cow::Owned(_)));
        assert_eq!(
            arguments(&out),
            json!({"state": "open", "owner": "wirenboard", "repo": "agent-vm"})
        );
    }

    #[test]
    fn test_missing_arguments_are_injected() {
        let body = serde_json::to_vec(&json!({
            "jsonrpc": "2.0", "id": 1, "method": "tools/call",
            "params": {"name": "list_branches"},
        }))
        .unwrap();
        let out = policy().enforce(&body).unwrap();
        assert_eq!(
            arguments(&out),
            json!({"owner": "wirenboard", "repo": "agent-vm"})
        );
    }

    #[test]
    fn test_wrong_repo_is_rejected() {
        let msg = rejected(&call(
            "create_branch",
            json!({"owner": "wirenboard", "repo": "other-repo", "branch": "x"}),
        ));
        assert_eq!(
            msg,
            r#"create_branch called with repo="other-repo", expected "agent-vm""#
        );
    }

    #[test]
    fn test_wrong_owner_is_rejected() {
        let msg = rejected(&call("get_commit", json!({"owner": "evil", "repo": "agent-vm"})));
        assert!(msg.contains("owner=\"evil\""));
    }

    #[test]
    fn test_non_string_field_is_rejected() {
        rejected(&call("get_commit", json!({"owner": ["wirenboard"], "repo": "agent-vm"})));
        rejected(&call("get_commit", json!({"owner": null, "repo": "agent-vm"})));
    }

    #[test]
    fn test_non_object_arguments_are_rejected() {
        let msg = rejected(&call("list_issues", json!("wirenboard/other")));
        assert!(msg.contains("must be an object"));
    }

    #[test]
    fn test_unknown_tool_is_rejected() {
        let msg = rejected(&call("delete_repository", json!({"owner": "wirenboard"})));
        assert_eq!(msg, "unknown tool 'delete_repository' is not allowed");
    }

    #[test]
    fn test_missing_tool_name_is_rejected() {
        let body = br#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{}}"#;
        assert!(rejected(body).contains("unknown tool 'unknown'"));
        let body = br#"{"jsonrpc":"2.0","id":1,"method":"tools/call"}"#;
        rejected(body);
    }

    #[test]
    fn test_blocked_tools_are_rejected() {
        for tool in ["search_users", "search_orgs", "get_teams", "get_team_members", "list_issue_types"] {
            let msg = rejected(&call(tool, json!({"query": "x", "org": "wirenboard"})));
            assert_eq!(msg, format!("{} is not allowed (not repo-scoped)", tool));
        }
    }

    #[test]
    fn test_unscoped_tool_passes() {
        let body = call("get_me", json!({}));
        let out = policy().enforce(&body).unwrap();
        assert!(matches!(out, Cow::Borrowed(_)));
    }

    #[test]
    fn test_search_query_gets_repo_qualifier() {
        let body = call("search_code", json!({"query": "def main"}));
        let out = policy().enforce(&body).unwrap();
        assert_eq!(arguments(&out)["query"], "repo:wirenboard/agent-vm def main");
    }

    #[test]
    fn test_search_empty_query_gets_repo_qualifier() {
        let body = call("search_issues", json!({}));
        let out = policy().enforce(&body).unwrap();
        assert_eq!(arguments(&out)["query"], "repo:wirenboard/agent-vm");
    }

    #[test]
    fn test_search_with_correct_qualifier_unchanged() {
        let body = call(
            "search_pull_requests",
            json!({"query": "is:open repo:wirenboard/agent-vm"}),
        );
        let out = policy().enforce(&body).unwrap();
        assert!(matches!(out, Cow::Borrowed(_)));
    }

    #[test]
    fn test_search_other_repo_rejected() {
        let msg = rejected(&call("search_code", json!({"query": "repo:wirenboard/secret token"})));
        assert_eq!(
            msg,
            "search_code query contains repo:wirenboard/secret, expected repo:wirenboard/agent-vm"
        );
    }

    #[test]
    fn test_search_second_repo_rejected() {
        rejected(&call(
            "search_code",
            json!({"query": "repo:wirenboard/agent-vm repo:other/repo x"}),
        ));
    }

    #[test]
    fn test_search_org_and_user_rejected() {
        let msg = rejected(&call("search_repositories", json!({"query": "org:wirenboard"})));
        assert_eq!(
            msg,
            "search_repositories query contains org:wirenboard (not allowed, use repo: scope)"
        );
        rejected(&call(
            "search_issues",
            json!({"query": "repo:wirenboard/agent-vm user:someone"}),
        ));
        rejected(&call("search_code", json!({"query": "ORG:wirenboard"})));
    }

    #[test]
    fn test_search_non_string_query_rejected() {
        rejected(&call("search_code", json!({"query": ["repo:other/x"]})));
    }

    #[test]
    fn test_header_lockdown_replaces_vm_values() {
        let mut scope = ScopeConfig::new("wirenboard", "agent-vm");
        scope.tools = vec!["get_file_contents".to_string(), "issue_read".to_string()];
        scope.readonly = true;
        let policy = ScopePolicy::new(scope);

        let mut headers = HeaderList::parse(
            b"x-mcp-toolsets: all\r\nX-MCP-Lockdown: false\r\nx-mcp-readonly: false\r\nAccept: */*\r\n",
        )
        .unwrap();
        policy.apply_header_lockdown(&mut headers);

        assert_eq!(
            headers.get("X-MCP-Toolsets"),
            Some("repos,issues,pull_requests,git,labels")
        );
        assert_eq!(headers.get("X-MCP-Tools"), Some("get_file_contents,issue_read"));
        assert_eq!(headers.get("X-MCP-Readonly"), Some("true"));
        assert_eq!(headers.get("X-MCP-Lockdown"), Some("true"));
        assert_eq!(headers.get("Accept"), Some("*/*"));
    }

    #[test]
    fn test_header_lockdown_omits_disabled_controls() {
        let mut scope = ScopeConfig::new("wirenboard", "agent-vm");
        scope.toolsets.clear();
        scope.lockdown = false;
        let policy = ScopePolicy::new(scope);

        let mut headers = HeaderList::parse(b"X-MCP-Tools: everything\r\nX-MCP-Lockdown: true\r\n").unwrap();
        policy.apply_header_lockdown(&mut headers);
        assert!(headers.is_empty());
    }
}
