//! The `Session` type and the data that hangs off it.

use std::collections::HashMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::options::SystemPromptConfig;
use crate::options::ToolConfig;

/// A session's status. Monotonic within `{Active} -> {Interrupted | Completed
/// | Error}`; only `resume` may move a session back to `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Error,
    Interrupted,
}

impl SessionStatus {
    /// Whether `self -> next` is a legal transition per the session
    /// lifecycle invariant in spec.md §3(i).
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Active, Completed | Error | Interrupted) => true,
            (Completed | Error | Interrupted, Active) => true,
            (same, next) if same == next => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    Default,
    AcceptEdits,
    BypassPermissions,
    Plan,
}

impl Default for PermissionMode {
    fn default() -> Self {
        PermissionMode::Default
    }
}

impl PermissionMode {
    /// The wire/CLI-flag representation, matching this enum's own
    /// `#[serde(rename_all = "snake_case")]`. Kept as an explicit match
    /// (rather than round-tripping through `serde_json`) so it stays
    /// infallible and allocation-free.
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "accept_edits",
            PermissionMode::BypassPermissions => "bypass_permissions",
            PermissionMode::Plan => "plan",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum McpServerStatus {
    Connected,
    Failed,
    NeedsAuth,
    Pending,
}

/// An MCP server entry as carried on `Session::mcp_servers`. Only the
/// subset needed to serve `mcpServerStatus` is modeled; the orchestrator
/// never speaks MCP itself (the child agent process does).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum McpServerEntry {
    Stdio {
        name: String,
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
        #[serde(default = "default_pending")]
        status: McpServerStatus,
    },
    Sse {
        name: String,
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
        #[serde(default = "default_pending")]
        status: McpServerStatus,
    },
    Http {
        name: String,
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
        #[serde(default = "default_pending")]
        status: McpServerStatus,
    },
}

fn default_pending() -> McpServerStatus {
    McpServerStatus::Pending
}

impl McpServerEntry {
    pub fn name(&self) -> &str {
        match self {
            McpServerEntry::Stdio { name, .. }
            | McpServerEntry::Sse { name, .. }
            | McpServerEntry::Http { name, .. } => name,
        }
    }

    pub fn status(&self) -> &McpServerStatus {
        match self {
            McpServerEntry::Stdio { status, .. }
            | McpServerEntry::Sse { status, .. }
            | McpServerEntry::Http { status, .. } => status,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub supports_thinking: bool,
}

/// A single logical conversation with one agent child process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub cwd: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_model: Option<String>,
    pub system_prompt: SystemPromptConfig,
    pub tools: ToolConfig,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub disallowed_tools: Vec<String>,
    pub permission_mode: PermissionMode,
    #[serde(default)]
    pub turn_count: u64,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerEntry>,
    /// The upstream agent's own session id, used to resume it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
}

impl Session {
    /// Construct a fresh, active session with a newly generated id and
    /// `created_at`/`last_activity_at` set to now.
    pub fn new(cwd: String, model: String, permission_mode: PermissionMode) -> Self {
        let now = Utc::now();
        Session {
            id: Uuid::new_v4(),
            status: SessionStatus::Active,
            created_at: now,
            last_activity_at: now,
            cwd,
            model,
            fallback_model: None,
            system_prompt: SystemPromptConfig::default(),
            tools: ToolConfig::default(),
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            permission_mode,
            turn_count: 0,
            total_cost_usd: 0.0,
            usage: Usage::default(),
            mcp_servers: Vec::new(),
            upstream_session_id: None,
            error: None,
        }
    }

    /// Attempt to move `self.status` to `next`. Returns `false` (and leaves
    /// `status` untouched) if the transition violates the monotonic
    /// lifecycle invariant.
    #[must_use]
    pub fn transition_to(&mut self, next: SessionStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        true
    }

    /// Project the in-memory `Session` to the subset that gets persisted.
    /// `env` never lives on `Session` (it is consumed once at process
    /// start), so this projection only needs to exist for callers who want
    /// a type-level guarantee that secrets never leak into the persisted
    /// record.
    pub fn to_persisted(&self) -> Session {
        self.clone()
    }
}
