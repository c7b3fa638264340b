//! Command sanitization and shell quoting utilities
//!
//! Provides functions for validating commands and quoting paths before they
//! are spliced into remote shell commands.

use crate::error::{Result, SshError};

/// Sanitize a command before execution
///
/// This function:
/// - Validates that the command is not empty
/// - Trims whitespace
/// - Checks length against max_chars limit
///
/// # Examples
/// ```
/// use ssh_utils::ssh::sanitize::sanitize_command;
///
/// let cmd = sanitize_command("  ls -la  ", Some(1000)).unwrap();
/// assert_eq!(cmd, "ls -la");
///
/// // Too long command
/// let result = sanitize_command("a".repeat(100).as_str(), Some(50));
/// assert!(result.is_err());
/// ```
pub fn sanitize_command(command: &str, max_chars: Option<usize>) -> Result<String> {
    let trimmed = command.trim();

    if trimmed.is_empty() {
        return Err(SshError::invalid_params("Command cannot be empty"));
    }

    if let Some(max) = max_chars {
        if trimmed.len() > max {
            return Err(SshError::invalid_params(format!(
                "Command is too long (max {} characters, got {})",
                max,
                trimmed.len()
            )));
        }
    }

    Ok(trimmed.to_string())
}

/// Escapes a string for use inside a single-quoted shell string.
///
/// ```
/// use ssh_utils::ssh::sanitize::escape_for_shell;
///
/// assert_eq!(escape_for_shell("it's"), "it'\"'\"'s");
/// ```
pub fn escape_for_shell(s: &str) -> String {
    // 'word' becomes '"'"'word'"'"': end quote, literal quote, reopen
    s.replace('\'', "'\"'\"'")
}

/// Wraps `s` in single quotes so the remote shell reads it as one word.
///
/// ```
/// use ssh_utils::ssh::sanitize::shell_quote;
///
/// assert_eq!(shell_quote("/srv/my app"), "'/srv/my app'");
/// ```
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", escape_for_shell(s))
}

/// Normalizes a remote path to forward slashes
pub fn to_remote_path(path: &str) -> String {
    path.replace('\\', "/")
}

/// Joins a relative path onto a remote root
pub fn join_remote(root: &str, rel: &str) -> String {
    let root = to_remote_path(root);
    let rel = to_remote_path(rel);
    let rel = rel.trim_start_matches('/');
    let root = root.trim_end_matches('/');
    if rel.is_empty() {
        return if root.is_empty() { "/".to_string() } else { root.to_string() };
    }
    format!("{}/{}", root, rel)
}

/// Parent directory of a remote path (`/` for top-level entries)
pub fn remote_parent(path: &str) -> String {
    let path = to_remote_path(path);
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
        None => ".".to_string(),
    }
}

/// Final component of a remote path
pub fn remote_basename(path: &str) -> String {
    let path = to_remote_path(path);
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}
