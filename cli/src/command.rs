//! Turns a `Session` plus the configured agent command template into the
//! argv the process manager spawns (spec.md §4.5/§4.6): the template's
//! binary and fixed flags, followed by per-session flags derived from
//! already-validated `SessionOptions` fields. No shell is involved — these
//! are exec argv entries, not a shell command line, so none of
//! `orchestrator_core::shell_safety`'s escaping applies here; it is the
//! validation in `SessionRegistry::create_session` that already rejected
//! anything unsafe to pass through.

use orchestrator_protocol::Session;

pub fn build_command_builder(template: Vec<String>) -> orchestrator_core::registry::CommandBuilder {
    std::sync::Arc::new(move |session: &Session| build(&template, session))
}

fn build(template: &[String], session: &Session) -> Vec<String> {
    let mut command = template.to_vec();
    command.push("--cwd".to_string());
    command.push(session.cwd.clone());
    command.push("--model".to_string());
    command.push(session.model.clone());
    if let Some(fallback) = &session.fallback_model {
        command.push("--fallback-model".to_string());
        command.push(fallback.clone());
    }
    command.push("--permission-mode".to_string());
    command.push(session.permission_mode.as_str().to_string());
    command
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_protocol::PermissionMode;

    #[test]
    fn includes_cwd_and_model_flags() {
        let session = Session::new("/workspace".to_string(), "claude-sonnet".to_string(), PermissionMode::default());
        let command = build(&["agent".to_string()], &session);
        assert_eq!(command[0], "agent");
        assert!(command.windows(2).any(|w| w == ["--cwd", "/workspace"]));
        assert!(command.windows(2).any(|w| w == ["--model", "claude-sonnet"]));
        assert!(command.windows(2).any(|w| w == ["--permission-mode", "default"]));
    }

    #[test]
    fn multi_word_permission_modes_flag_as_snake_case() {
        let mut session = Session::new("/w".to_string(), "m".to_string(), PermissionMode::AcceptEdits);
        let command = build(&["agent".to_string()], &session);
        assert!(command.windows(2).any(|w| w == ["--permission-mode", "accept_edits"]));

        session.permission_mode = PermissionMode::BypassPermissions;
        let command = build(&["agent".to_string()], &session);
        assert!(command.windows(2).any(|w| w == ["--permission-mode", "bypass_permissions"]));
    }
}
