//! Wire types shared between the orchestrator core and its RPC transport.
//!
//! Nothing in this crate performs I/O: it is the vocabulary that
//! `orchestrator-core` and `orchestrator-rpc` serialize across the wire.

pub mod derived;
pub mod event;
pub mod options;
pub mod session;

pub use derived::PlanUpdate;
pub use derived::ResultSummary;
pub use derived::TodoItem;
pub use derived::TodoStatus;
pub use derived::TodoUpdate;
pub use derived::ToolUseEvent;
pub use event::ContentBlock;
pub use event::Event;
pub use event::MessageBody;
pub use event::ResultSubtype;
pub use event::UsageCounters;
pub use options::OptionValidationMode;
pub use options::SessionOptions;
pub use options::SystemPromptConfig;
pub use options::ToolConfig;
pub use options::ValidationError;
pub use session::ErrorRecord;
pub use session::McpServerEntry;
pub use session::McpServerStatus;
pub use session::ModelInfo;
pub use session::PermissionMode;
pub use session::Session;
pub use session::SessionStatus;
pub use session::Usage;
