//! SFTP file-transfer sub-channel

use std::path::Path;

use async_trait::async_trait;
use russh::client::Msg;
use russh::Channel;
use russh_sftp::client::SftpSession;
use tokio::fs as tokiofs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::transport::{EntryKind, FileTransfer, RemoteEntry, RemoteRead};
use crate::error::{Result, SshError};

/// [`FileTransfer`] over a russh-sftp session
pub struct SftpFileTransfer {
    sftp: SftpSession,
}

impl SftpFileTransfer {
    /// Start an SFTP session on a channel with the `sftp` subsystem requested
    pub async fn open(channel: Channel<Msg>) -> Result<Self> {
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SshError::exec(format!("Failed to start sftp session: {}", e)))?;
        Ok(Self { sftp })
    }
}

fn remote_err(path: &str, err: impl std::fmt::Display) -> SshError {
    SshError::transfer(path, err.to_string(), None)
}

fn local_err(path: &Path, err: impl std::fmt::Display) -> SshError {
    SshError::transfer(path.display().to_string(), err.to_string(), None)
}

#[async_trait]
impl FileTransfer for SftpFileTransfer {
    async fn upload(&self, local: &Path, remote: &str) -> Result<u64> {
        let mut source = tokiofs::File::open(local)
            .await
            .map_err(|e| local_err(local, e))?;
        let mut target = self
            .sftp
            .create(remote)
            .await
            .map_err(|e| remote_err(remote, e))?;
        let sent = tokio::io::copy(&mut source, &mut target)
            .await
            .map_err(|e| remote_err(remote, e))?;
        target.shutdown().await.map_err(|e| remote_err(remote, e))?;
        debug!("put {} -> {} ({} bytes)", local.display(), remote, sent);
        Ok(sent)
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<u64> {
        let mut source = self
            .sftp
            .open(remote)
            .await
            .map_err(|e| remote_err(remote, e))?;
        let mut target = tokiofs::File::create(local)
            .await
            .map_err(|e| local_err(local, e))?;
        let received = tokio::io::copy(&mut source, &mut target)
            .await
            .map_err(|e| local_err(local, e))?;
        target.flush().await.map_err(|e| local_err(local, e))?;
        debug!("get {} -> {} ({} bytes)", remote, local.display(), received);
        Ok(received)
    }

    async fn write(&self, remote: &str, content: &[u8]) -> Result<()> {
        let mut target = self
            .sftp
            .create(remote)
            .await
            .map_err(|e| remote_err(remote, e))?;
        target
            .write_all(content)
            .await
            .map_err(|e| remote_err(remote, e))?;
        target.shutdown().await.map_err(|e| remote_err(remote, e))?;
        Ok(())
    }

    async fn open_read(&self, remote: &str) -> Result<RemoteRead> {
        let file = self
            .sftp
            .open(remote)
            .await
            .map_err(|e| remote_err(remote, e))?;
        Ok(Box::new(file))
    }

    async fn exists(&self, remote: &str) -> Result<bool> {
        self.sftp
            .try_exists(remote)
            .await
            .map_err(|e| remote_err(remote, e))
    }

    async fn list_dir(&self, remote: &str) -> Result<Vec<RemoteEntry>> {
        let entries = self
            .sftp
            .read_dir(remote)
            .await
            .map_err(|e| remote_err(remote, e))?;

        Ok(entries
            .filter(|entry| {
                let name = entry.file_name();
                name != "." && name != ".."
            })
            .map(|entry| {
                let file_type = entry.file_type();
                let kind = if file_type.is_dir() {
                    EntryKind::Directory
                } else if file_type.is_file() {
                    EntryKind::File
                } else {
                    EntryKind::Other
                };
                RemoteEntry {
                    name: entry.file_name(),
                    kind,
                }
            })
            .collect())
    }
}
