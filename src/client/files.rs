//! File and tree operations

use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tracing::debug;

use super::SshUtils;
use crate::error::{Result, SshError};
use crate::ssh::classify::classify_error;
use crate::ssh::command::{CommandList, CommandOutput, CommandSequencer};
use crate::ssh::connection::{Lease, Session, Target};
use crate::ssh::sanitize::{remote_parent, shell_quote, to_remote_path};
use crate::ssh::transport::RemoteRead;
use crate::sync::SyncReport;

/// What [`SshUtils::ensure_file_contains`] had to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Containment {
    /// The text was already in the file
    AlreadyPresent,
    /// The text was appended
    Appended,
}

/// A remote file opened for reading
///
/// Keeps its session (and any staged copy) alive until dropped.
pub struct RemoteReader {
    inner: RemoteRead,
    cleanup: Option<Cleanup>,
}

struct Cleanup {
    lease: Lease,
    sequencer: CommandSequencer,
    staging: Option<String>,
}

impl Cleanup {
    async fn run(self) {
        if let Some(staging) = self.staging {
            let commands = CommandList::from(format!("sudo rm -fr {}", shell_quote(&staging)));
            let output = self.sequencer.run(self.lease.session(), &commands, |_| {}).await;
            if let Some(e) = output.error {
                debug!("failed to remove staged copy {}: {}", staging, e);
            }
        }
        self.lease.release().await;
    }
}

impl RemoteReader {
    pub(crate) fn new(
        inner: RemoteRead,
        lease: Lease,
        sequencer: CommandSequencer,
        staging: Option<String>,
    ) -> Self {
        Self {
            inner,
            cleanup: Some(Cleanup {
                lease,
                sequencer,
                staging,
            }),
        }
    }

    /// Release the session (and remove any staged copy) now
    pub async fn close(mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup.run().await;
        }
    }
}

impl AsyncRead for RemoteReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl Drop for RemoteReader {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(cleanup.run());
            }
        }
    }
}

impl std::fmt::Debug for RemoteReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteReader").finish_non_exhaustive()
    }
}

impl SshUtils {
    pub(crate) fn classify(&self, err: SshError) -> SshError {
        classify_error(self.classifier().as_ref(), err)
    }

    /// Run `commands` and turn a failure into a transfer error on `path`
    pub(crate) async fn run_on(&self, session: &Session, path: &str, commands: CommandList) -> Result<String> {
        let commands = commands.sanitized(self.settings.max_chars)?;
        let output = self.sequencer.run(session, &commands, |_| {}).await;
        match output.error {
            Some(e) => Err(e.into_transfer(path)),
            None => Ok(output.stdout),
        }
    }

    pub(crate) async fn mkdir_on(&self, session: &Session, path: &str) -> Result<()> {
        debug!("mkdir {}", path);
        self.run_on(session, path, CommandList::from(format!("mkdir -p {}", shell_quote(path))))
            .await
            .map(|_| ())
    }

    pub(crate) async fn rmdir_on(&self, session: &Session, path: &str) -> Result<()> {
        debug!("rmdir {}", path);
        self.run_on(session, path, CommandList::from(format!("rm -fr {}", shell_quote(path))))
            .await
            .map(|_| ())
    }

    pub(crate) async fn download_on(&self, session: &Session, remote: &str, local: &Path) -> Result<u64> {
        let transfer = session.file_transfer().await?;
        transfer
            .download(remote, local)
            .await
            .map_err(|e| self.classify(e))
    }

    pub(crate) async fn upload_on(&self, session: &Session, local: &Path, remote: &str) -> Result<u64> {
        self.mkdir_on(session, &remote_parent(remote)).await?;
        let transfer = session.file_transfer().await?;
        transfer
            .upload(local, remote)
            .await
            .map_err(|e| self.classify(e))
    }

    pub(crate) async fn write_on(&self, session: &Session, remote: &str, content: &[u8]) -> Result<()> {
        self.mkdir_on(session, &remote_parent(remote)).await?;
        let transfer = session.file_transfer().await?;
        transfer
            .write(remote, content)
            .await
            .map_err(|e| self.classify(e))
    }

    /// Download `remote` to the local file `local`
    pub async fn read_file(
        &self,
        target: impl Into<Target>,
        remote: &str,
        local: &Path,
    ) -> Result<u64> {
        let remote = to_remote_path(remote);
        self.with_session(target.into(), |session| async move {
            self.download_on(&session, &remote, local).await
        })
        .await
    }

    /// Open `remote` for streaming reads
    pub async fn get_file(&self, target: impl Into<Target>, remote: &str) -> Result<RemoteReader> {
        let remote = to_remote_path(remote);
        let lease = self.manager.connect(target.into()).await?;
        let opened = match lease.session().file_transfer().await {
            Ok(transfer) => transfer.open_read(&remote).await.map_err(|e| self.classify(e)),
            Err(e) => Err(e),
        };
        match opened {
            Ok(inner) => Ok(RemoteReader::new(inner, lease, self.sequencer.clone(), None)),
            Err(e) => {
                lease.release().await;
                Err(e)
            }
        }
    }

    /// Upload the local file `local` to `remote`, creating parent directories
    pub async fn put_file(
        &self,
        target: impl Into<Target>,
        local: &Path,
        remote: &str,
    ) -> Result<u64> {
        let remote = to_remote_path(remote);
        self.with_session(target.into(), |session| async move {
            self.upload_on(&session, local, &remote).await
        })
        .await
    }

    /// Create or truncate `remote` with `content`, creating parent directories
    pub async fn write_file(
        &self,
        target: impl Into<Target>,
        remote: &str,
        content: impl AsRef<[u8]>,
    ) -> Result<()> {
        let remote = to_remote_path(remote);
        self.with_session(target.into(), |session| async move {
            self.write_on(&session, &remote, content.as_ref()).await
        })
        .await
    }

    /// Replace the remote directory `remote` with a copy of `local`
    ///
    /// Individual task failures are reported in the [`SyncReport`].
    pub async fn put_dir(
        &self,
        target: impl Into<Target>,
        local: &Path,
        remote: &str,
    ) -> Result<SyncReport> {
        let remote = to_remote_path(remote);
        self.with_session(target.into(), |session| async move {
            self.sync.push(&session, local, &remote).await
        })
        .await
    }

    /// Copy the remote directory `remote` into `local`
    pub async fn get_dir(
        &self,
        target: impl Into<Target>,
        remote: &str,
        local: &Path,
    ) -> Result<SyncReport> {
        let remote = to_remote_path(remote);
        self.with_session(target.into(), |session| async move {
            self.sync.pull(&session, &remote, local).await
        })
        .await
    }

    /// `mkdir -p` on the remote host
    pub async fn mkdir(&self, target: impl Into<Target>, path: &str) -> Result<()> {
        let path = to_remote_path(path);
        self.with_session(target.into(), |session| async move {
            self.mkdir_on(&session, &path).await
        })
        .await
    }

    /// `rm -fr` on the remote host
    pub async fn rmdir(&self, target: impl Into<Target>, path: &str) -> Result<()> {
        let path = to_remote_path(path);
        self.with_session(target.into(), |session| async move {
            self.rmdir_on(&session, &path).await
        })
        .await
    }

    /// Whether `path` exists, as seen by the connecting user
    pub async fn file_exists(&self, target: impl Into<Target>, path: &str) -> Result<bool> {
        let path = to_remote_path(path);
        self.with_session(target.into(), |session| async move {
            let transfer = session.file_transfer().await?;
            transfer.exists(&path).await.map_err(|e| self.classify(e))
        })
        .await
    }

    /// Remove `path` and create it again, empty
    pub async fn ensure_empty_dir(&self, target: impl Into<Target>, path: &str) -> Result<()> {
        let path = to_remote_path(path);
        self.with_session(target.into(), |session| async move {
            self.rmdir_on(&session, &path).await?;
            self.mkdir_on(&session, &path).await
        })
        .await
    }

    /// Append `text` as a line of `path` unless it already occurs in it
    ///
    /// A missing file is created.
    pub async fn ensure_file_contains(
        &self,
        target: impl Into<Target>,
        path: &str,
        text: &str,
    ) -> Result<Containment> {
        let path = to_remote_path(path);
        self.with_session(target.into(), |session| async move {
            self.ensure_contains_on(&session, &path, text, false).await
        })
        .await
    }

    pub(crate) async fn ensure_contains_on(
        &self,
        session: &Session,
        path: &str,
        text: &str,
        sudo: bool,
    ) -> Result<Containment> {
        let prefix = if sudo { "sudo " } else { "" };
        let grep = format!("{}grep -F -- {} {}", prefix, shell_quote(text), shell_quote(path));
        let output = self
            .sequencer
            .run(session, &CommandList::from(grep).sanitized(self.settings.max_chars)?, |_| {})
            .await;
        let matched = output
            .commands
            .first()
            .is_some_and(|report| grep_matched(&report.output, text));
        if matched {
            return Ok(Containment::AlreadyPresent);
        }

        let append = format!("printf '%s\\n' {} >> {}", shell_quote(text), shell_quote(path));
        let append = if sudo {
            format!("sudo sh -c {}", shell_quote(&append))
        } else {
            append
        };
        self.run_on(session, path, CommandList::from(append)).await?;
        Ok(Containment::Appended)
    }
}

/// Whether a `grep -F` run found `text`
///
/// The exit status decides when there is one: under a pseudo-terminal
/// diagnostics land on stdout. Without one, a printed matching line does.
fn grep_matched(output: &CommandOutput, text: &str) -> bool {
    match output.exit_code {
        Some(code) => code == 0,
        None => output
            .stdout
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .any(|line| line.contains(text) && !line.starts_with("grep: ")),
    }
}
