//! Output classification
//!
//! Everything the engine infers from free text (elevation commands, password
//! prompts, rejected secrets, error codes) goes through [`OutputClassifier`],
//! so prompts in other locales or from other vendors can be supported by
//! swapping the classifier.

use std::fmt;

use regex::Regex;

use crate::error::{ErrorCode, Result, SshError};

/// Pattern-based interpretation of command text and terminal output
pub trait OutputClassifier: Send + Sync + fmt::Debug {
    /// Whether `command` invokes a privilege-elevation program
    fn is_elevation_command(&self, command: &str) -> bool;

    /// Whether an output chunk is an authentication prompt
    fn is_password_prompt(&self, output: &str) -> bool;

    /// Whether the chunk following a supplied secret reports a rejection
    fn is_challenge_failure(&self, output: &str) -> bool;

    /// Classify error-stream text into a known code
    fn error_code(&self, stderr: &str) -> Option<ErrorCode>;
}

/// Regex-driven classifier; the default instance matches English `sudo`/`su`
#[derive(Debug, Clone)]
pub struct PatternClassifier {
    elevation: Regex,
    prompts: Vec<Regex>,
    failures: Vec<Regex>,
    codes: Vec<(Regex, ErrorCode)>,
}

impl PatternClassifier {
    /// Build a classifier from raw patterns
    pub fn new(
        elevation: &str,
        prompts: &[&str],
        failures: &[&str],
        codes: &[(&str, ErrorCode)],
    ) -> Result<Self> {
        let compile = |p: &str| {
            Regex::new(p).map_err(|e| SshError::config(format!("Invalid pattern {:?}: {}", p, e)))
        };

        Ok(Self {
            elevation: compile(elevation)?,
            prompts: prompts.iter().map(|p| compile(p)).collect::<Result<_>>()?,
            failures: failures.iter().map(|p| compile(p)).collect::<Result<_>>()?,
            codes: codes
                .iter()
                .map(|(p, code)| compile(p).map(|re| (re, *code)))
                .collect::<Result<_>>()?,
        })
    }

    /// Add a prompt pattern (e.g. a localized `[sudo] Passwort für`)
    pub fn with_prompt(mut self, pattern: &str) -> Result<Self> {
        self.prompts.push(
            Regex::new(pattern)
                .map_err(|e| SshError::config(format!("Invalid pattern {:?}: {}", pattern, e)))?,
        );
        Ok(self)
    }

    /// Add a rejection pattern
    pub fn with_failure(mut self, pattern: &str) -> Result<Self> {
        self.failures.push(
            Regex::new(pattern)
                .map_err(|e| SshError::config(format!("Invalid pattern {:?}: {}", pattern, e)))?,
        );
        Ok(self)
    }
}

impl Default for PatternClassifier {
    fn default() -> Self {
        let compile = |p: &str| match Regex::new(p) {
            Ok(re) => re,
            Err(e) => unreachable!("built-in pattern {:?} is invalid: {}", p, e),
        };

        Self {
            elevation: compile(r"^su(do\s|\s)"),
            prompts: vec![compile(r"\[sudo\] password"), compile(r"Password:")],
            failures: vec![
                compile(r"Sorry, try again"),
                compile(r"\[sudo\] password"),
                compile(r"Password:"),
                compile(r"incorrect password"),
                compile(r"[Aa]uthentication failure"),
            ],
            codes: vec![
                (compile(r"(?i)no such file"), ErrorCode::NoSuchFile),
                (compile(r"(?i)permission denied"), ErrorCode::PermissionDenied),
                (compile(r"(?i)operation not permitted"), ErrorCode::PermissionDenied),
                (compile(r"(?i)incorrect password"), ErrorCode::AuthenticationFailed),
                (compile(r"(?i)authentication failure"), ErrorCode::AuthenticationFailed),
            ],
        }
    }
}

impl OutputClassifier for PatternClassifier {
    fn is_elevation_command(&self, command: &str) -> bool {
        self.elevation.is_match(command)
    }

    fn is_password_prompt(&self, output: &str) -> bool {
        self.prompts.iter().any(|re| re.is_match(output))
    }

    fn is_challenge_failure(&self, output: &str) -> bool {
        self.failures.iter().any(|re| re.is_match(output))
    }

    fn error_code(&self, stderr: &str) -> Option<ErrorCode> {
        self.codes
            .iter()
            .find(|(re, _)| re.is_match(stderr))
            .map(|(_, code)| *code)
    }
}

/// Attach a code to a failure that does not carry one yet
pub fn classify_error(classifier: &dyn OutputClassifier, err: SshError) -> SshError {
    match err {
        SshError::Transfer {
            path,
            message,
            code: None,
        } => {
            let code = classifier.error_code(&message);
            SshError::Transfer {
                path,
                message,
                code,
            }
        }
        SshError::Command { message, code: None } => {
            let code = classifier.error_code(&message);
            SshError::Command { message, code }
        }
        other => other,
    }
}
