//! `createSession` options and the validation rules from spec.md §4.6.

use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

use crate::session::PermissionMode;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SystemPromptConfig {
    Literal { text: String },
    Preset { name: String, append: Option<String> },
}

impl Default for SystemPromptConfig {
    fn default() -> Self {
        SystemPromptConfig::Literal { text: String::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolConfig {
    Explicit { tools: Vec<String> },
    Preset { name: String },
}

impl Default for ToolConfig {
    fn default() -> Self {
        ToolConfig::Explicit { tools: Vec::new() }
    }
}

/// How `createSession` should treat option keys it does not recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionValidationMode {
    /// Reject the request outright.
    Strict,
    /// Log and accept.
    #[default]
    Warn,
    /// Accept silently.
    Silent,
}

/// Raw `createSession` / `query` input, as received over RPC, before
/// validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOptions {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub fallback_model: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub system_prompt: Option<SystemPromptConfig>,
    #[serde(default)]
    pub tools: Option<ToolConfig>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub disallowed_tools: Vec<String>,
    #[serde(default)]
    pub permission_mode: Option<PermissionMode>,
    #[serde(default)]
    pub allow_dangerously_skip_permissions: bool,
    #[serde(default)]
    pub max_turns: Option<f64>,
    #[serde(default)]
    pub max_budget_usd: Option<f64>,
    #[serde(default)]
    pub max_thinking_tokens: Option<u64>,
    #[serde(default)]
    pub mcp_servers: Vec<crate::session::McpServerEntry>,
    #[serde(default)]
    pub sleep_after: Option<u64>,
    #[serde(default)]
    pub keep_alive: Option<bool>,
    #[serde(default)]
    pub include_partial_messages: bool,
    #[serde(default)]
    pub resume: Option<String>,
    #[serde(default)]
    pub r#continue: bool,
    #[serde(default)]
    pub fork_session: bool,
    /// Top-level keys present in the raw request that none of the fields
    /// above claimed. Populated automatically by `#[serde(flatten)]` during
    /// deserialization, so `Strict` mode has something real to reject.
    #[serde(flatten, skip_serializing)]
    pub extra: std::collections::BTreeMap<String, serde_json::Value>,
}

/// One field failed validation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("field `{field}` must be positive, got {value}")]
    MustBePositive { field: &'static str, value: f64 },
    #[error("field `cwd` must be an absolute path free of `..` segments, got `{0}`")]
    UnsafeCwd(String),
    #[error("field `{field}` must match `[A-Za-z0-9._-]+`, got `{value}`")]
    UnsafeToken { field: &'static str, value: String },
    #[error("unknown option key `{0}`")]
    UnknownKey(String),
    #[error("field `{field}` contains a null byte")]
    NullByte { field: &'static str },
}

const TOKEN_RE_CHARS: fn(char) -> bool =
    |c: char| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-';

fn is_shell_safe_token(s: &str) -> bool {
    !s.is_empty() && s.chars().all(TOKEN_RE_CHARS)
}

fn is_safe_cwd(s: &str) -> bool {
    if s.contains('\0') {
        return false;
    }
    !s.split('/').any(|segment| segment == "..")
}

impl SessionOptions {
    /// Validate all option fields per spec.md §4.6. Called before any side
    /// effect of `createSession`.
    pub fn validate(&self, mode: OptionValidationMode) -> Result<(), ValidationError> {
        if let Some(turns) = self.max_turns
            && turns <= 0.0
        {
            return Err(ValidationError::MustBePositive {
                field: "maxTurns",
                value: turns,
            });
        }
        if let Some(budget) = self.max_budget_usd
            && budget <= 0.0
        {
            return Err(ValidationError::MustBePositive {
                field: "maxBudgetUsd",
                value: budget,
            });
        }
        if let Some(cwd) = &self.cwd {
            if cwd.contains('\0') {
                return Err(ValidationError::NullByte { field: "cwd" });
            }
            if !is_safe_cwd(cwd) {
                return Err(ValidationError::UnsafeCwd(cwd.clone()));
            }
        }
        if let Some(model) = &self.model
            && !is_shell_safe_token(model)
        {
            return Err(ValidationError::UnsafeToken {
                field: "model",
                value: model.clone(),
            });
        }
        if let Some(fallback) = &self.fallback_model
            && !is_shell_safe_token(fallback)
        {
            return Err(ValidationError::UnsafeToken {
                field: "fallbackModel",
                value: fallback.clone(),
            });
        }
        if mode == OptionValidationMode::Strict
            && let Some(key) = self.extra.keys().next()
        {
            return Err(ValidationError::UnknownKey(key.clone()));
        }
        Ok(())
    }
}
