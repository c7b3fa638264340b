//! Remote endpoint credentials
//!
//! Credentials identify one remote endpoint together with the secrets used to
//! authenticate and, optionally, to answer elevation prompts.

use std::fmt;

use serde::Deserialize;

use crate::error::{Result, SshError};

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    22
}

/// Credentials for one remote endpoint
///
/// Deserializes from JSON where the username may be given as `username`,
/// `userName` or `user`.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    /// Remote hostname or IP address
    #[serde(default = "default_host")]
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    #[serde(default, alias = "userName", alias = "user")]
    pub username: String,

    /// Password for password authentication, also used as elevation secret
    #[serde(default)]
    pub password: Option<String>,

    /// Private key content (not path!) for key authentication
    #[serde(default)]
    pub private_key: Option<String>,

    /// Passphrase protecting `private_key`
    #[serde(default)]
    pub passphrase: Option<String>,

    /// Elevation secret when it differs from `password`
    #[serde(default)]
    pub sudo_password: Option<String>,

    /// Pinned SHA-256 host key fingerprint (`SHA256:...`)
    #[serde(default)]
    pub host_fingerprint: Option<String>,
}

impl Credentials {
    /// Create credentials with minimal required fields
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: username.into(),
            password: None,
            private_key: None,
            passphrase: None,
            sudo_password: None,
            host_fingerprint: None,
        }
    }

    /// Set the SSH port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set password authentication
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set private key authentication (key content, not path)
    pub fn with_private_key(mut self, key: impl Into<String>) -> Self {
        self.private_key = Some(key.into());
        self
    }

    /// Set the passphrase for an encrypted private key
    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    /// Set a sudo password distinct from the login password
    pub fn with_sudo_password(mut self, password: impl Into<String>) -> Self {
        self.sudo_password = Some(password.into());
        self
    }

    /// Pin the server's host key fingerprint
    pub fn with_host_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.host_fingerprint = Some(fingerprint.into());
        self
    }

    /// Parse credentials from a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| SshError::config(format!("Invalid credentials document: {}", e)))
    }

    /// The username to authenticate as
    pub fn resolve_username(&self) -> Result<&str> {
        let username = self.username.trim();
        if username.is_empty() {
            return Err(SshError::config(format!(
                "No username for {}:{} (expected username, userName or user)",
                self.host, self.port
            )));
        }
        Ok(username)
    }

    /// Secret answered to an elevation prompt, if any
    pub fn elevation_secret(&self) -> Option<&str> {
        self.sudo_password
            .as_deref()
            .or(self.password.as_deref())
            .filter(|s| !s.is_empty())
    }

    /// `user@host` label used in transcripts and logs
    pub fn label(&self) -> String {
        format!("{}@{}", self.username.trim(), self.host)
    }

    /// Check the credential shape before any network activity
    pub fn validate(&self) -> Result<()> {
        self.resolve_username()?;

        if self.host.trim().is_empty() {
            return Err(SshError::config("Missing host"));
        }

        if self.password.is_none() && self.private_key.is_none() {
            return Err(SshError::config(
                "Must provide either a password or a private key",
            ));
        }

        if let Some(ref key) = self.private_key {
            let parsed = ssh_key::PrivateKey::from_openssh(key.as_bytes())
                .map_err(|e| SshError::config(format!("Failed to parse private key: {}", e)))?;
            if parsed.is_encrypted() && self.passphrase.is_none() {
                return Err(SshError::config(
                    "Private key is encrypted but no passphrase was given",
                ));
            }
        }

        Ok(())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("sudo_password", &self.sudo_password.as_ref().map(|_| "<redacted>"))
            .field("host_fingerprint", &self.host_fingerprint)
            .finish_non_exhaustive()
    }
}
