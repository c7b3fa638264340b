//! SSH client handler implementation
//!
//! Implements the `russh::client::Handler` trait to handle SSH connection events.

use russh::keys::{HashAlg, PublicKey};
use tracing::{debug, warn};

/// SSH client handler for russh
///
/// Accepts any server key unless a SHA-256 fingerprint is pinned, in which
/// case only a matching key is accepted.
#[derive(Debug, Clone, Default)]
pub struct SshHandler {
    pinned_fingerprint: Option<String>,
}

impl SshHandler {
    /// Create a handler accepting any host key
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a handler that only accepts the given fingerprint
    pub fn pinned(fingerprint: impl Into<String>) -> Self {
        Self {
            pinned_fingerprint: Some(fingerprint.into()),
        }
    }

    fn accepts(&self, fingerprint: &str) -> bool {
        match self.pinned_fingerprint {
            Some(ref pinned) => pinned.trim() == fingerprint,
            None => true,
        }
    }
}

impl russh::client::Handler for SshHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        debug!("Server host key {}", fingerprint);

        let accepted = self.accepts(&fingerprint);
        if !accepted {
            warn!(
                "Host key {} does not match pinned fingerprint, rejecting",
                fingerprint
            );
        }
        Ok(accepted)
    }
}
