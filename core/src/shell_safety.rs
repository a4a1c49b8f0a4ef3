//! Defensive helpers for embedding untrusted strings in shell commands
//! (spec.md §4.6), in the spirit of `codex-core::exec`'s hardened path to
//! `/usr/bin/sandbox-exec` and `codex-core::is_safe_command`'s refusal to
//! hand-parse shell syntax beyond what it can prove safe.

use crate::error::CoreError;
use crate::error::Result;

/// Single-quote-escape `value` for embedding inside a single-quoted shell
/// literal: every `'` becomes `'\''` (close the quote, emit an escaped
/// quote, reopen the quote).
pub fn shell_escape(value: &str) -> Result<String> {
    if value.contains('\0') {
        return Err(CoreError::invalid_argument(
            "value",
            "must not contain a null byte",
        ));
    }
    let mut escaped = String::with_capacity(value.len() + 2);
    escaped.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            escaped.push_str("'\\''");
        } else {
            escaped.push(ch);
        }
    }
    escaped.push('\'');
    Ok(escaped)
}

/// Build the shell snippet to write `content` to `path` via a
/// here-document with a quoted delimiter, which prevents the shell from
/// expanding `$vars` or backticks inside `content`.
pub fn heredoc_write(path: &str, content: &str) -> Result<String> {
    if path.contains('\0') || content.contains('\0') {
        return Err(CoreError::invalid_argument(
            "path|content",
            "must not contain a null byte",
        ));
    }
    const DELIM: &str = "ORCHESTRATOR_EOF_9f3a";
    if content.lines().any(|l| l == DELIM) {
        return Err(CoreError::invalid_argument(
            "content",
            "collides with heredoc delimiter",
        ));
    }
    let escaped_path = shell_escape(path)?;
    Ok(format!("cat > {escaped_path} <<'{DELIM}'\n{content}\n{DELIM}\n"))
}

/// `model`, `fallbackModel`: matches `[A-Za-z0-9._-]+`.
pub fn is_shell_safe_token(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// `cwd`: a string free of `..` path-traversal segments.
pub fn is_safe_cwd(value: &str) -> bool {
    !value.split('/').any(|segment| segment == "..")
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn escapes_embedded_single_quotes() {
        assert_eq!(shell_escape("it's").unwrap(), r#"'it'\''s'"#);
    }

    #[test]
    fn rejects_null_bytes() {
        assert!(shell_escape("a\0b").is_err());
    }

    #[test]
    fn heredoc_uses_quoted_delimiter_to_block_expansion() {
        let snippet = heredoc_write("/tmp/cfg.json", r#"{"token": "$HOME"}"#).unwrap();
        assert!(snippet.contains("<<'ORCHESTRATOR_EOF_9f3a'"));
        assert!(snippet.contains(r#"{"token": "$HOME"}"#));
    }

    #[test]
    fn shell_safe_token_rejects_special_characters() {
        assert!(is_shell_safe_token("gpt-4.1_turbo"));
        assert!(!is_shell_safe_token("gpt 4"));
        assert!(!is_shell_safe_token(""));
        assert!(!is_shell_safe_token("../etc"));
    }

    #[test]
    fn safe_cwd_rejects_path_traversal() {
        assert!(is_safe_cwd("/workspace/project"));
        assert!(!is_safe_cwd("/workspace/../etc"));
        assert!(!is_safe_cwd(".."));
    }
}
