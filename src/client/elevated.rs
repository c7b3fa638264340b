//! Elevated variants of the file and tree operations
//!
//! Commands run under `sudo`. The file-transfer channel cannot elevate, so
//! transfers go through a staging directory under the staging root that
//! belongs to the connecting user; an elevated copy moves the data between
//! the staging directory and its real location.

use std::path::Path;

use tracing::{debug, warn};

use super::files::{Containment, RemoteReader};
use super::SshUtils;
use crate::error::{ErrorCode, Result};
use crate::ssh::command::CommandList;
use crate::ssh::connection::{Session, Target};
use crate::ssh::sanitize::{join_remote, remote_basename, remote_parent, shell_quote, to_remote_path};
use crate::sync::SyncReport;

impl SshUtils {
    fn staging_path(&self, remote: &str) -> String {
        join_remote(&self.settings.staging_root, remote)
    }

    async fn sudo_on(&self, session: &Session, path: &str, command: String) -> Result<String> {
        self.run_on(session, path, CommandList::from(format!("sudo {}", command)))
            .await
    }

    async fn mkdir_sudo_on(&self, session: &Session, path: &str) -> Result<()> {
        debug!("sudo mkdir {}", path);
        self.sudo_on(session, path, format!("mkdir -p {}", shell_quote(path)))
            .await
            .map(|_| ())
    }

    async fn rmdir_sudo_on(&self, session: &Session, path: &str) -> Result<()> {
        debug!("sudo rmdir {}", path);
        self.sudo_on(session, path, format!("rm -fr {}", shell_quote(path)))
            .await
            .map(|_| ())
    }

    async fn ensure_empty_dir_sudo_on(&self, session: &Session, path: &str) -> Result<()> {
        self.rmdir_sudo_on(session, path).await?;
        self.mkdir_sudo_on(session, path).await
    }

    async fn ensure_ownership_on(&self, session: &Session, path: &str) -> Result<()> {
        let user = session.credentials().resolve_username()?.to_string();
        self.sudo_on(
            session,
            path,
            format!("chown -R {}:{} {}", user, user, shell_quote(path)),
        )
        .await
        .map(|_| ())
    }

    /// Fresh, empty staging directory owned by the connecting user
    ///
    /// The whole staging root is handed over, so the user can also remove
    /// and recreate the staging directory itself.
    async fn prepare_staging(&self, session: &Session, staging: &str) -> Result<()> {
        self.ensure_empty_dir_sudo_on(session, staging).await?;
        self.ensure_ownership_on(session, &self.settings.staging_root)
            .await
    }

    async fn drop_staging(&self, session: &Session, staging: &str) {
        if let Err(e) = self.rmdir_sudo_on(session, staging).await {
            warn!("failed to remove staging directory {}: {}", staging, e);
        }
    }

    /// Stage `remote` into a user-owned copy, returning the staging directory
    /// and the staged file path
    async fn stage_remote_file(&self, session: &Session, remote: &str) -> Result<(String, String)> {
        let staging = self.staging_path(&remote_parent(remote));
        self.ensure_empty_dir_sudo_on(session, &staging).await?;
        let staged = join_remote(&staging, &remote_basename(remote));
        let copied = self
            .sudo_on(
                session,
                remote,
                format!("cp {} {}", shell_quote(remote), shell_quote(&staged)),
            )
            .await;
        let owned = match copied {
            Ok(_) => {
                self.ensure_ownership_on(session, &self.settings.staging_root)
                    .await
            }
            Err(e) => Err(e),
        };
        match owned {
            Ok(()) => Ok((staging, staged)),
            Err(e) => {
                self.drop_staging(session, &staging).await;
                Err(e)
            }
        }
    }

    /// Install the staged file `staged` at `remote` with elevated privileges
    async fn install_staged_file(&self, session: &Session, staged: &str, remote: &str) -> Result<()> {
        self.mkdir_sudo_on(session, &remote_parent(remote)).await?;
        self.sudo_on(
            session,
            remote,
            format!("cp {} {}", shell_quote(staged), shell_quote(remote)),
        )
        .await
        .map(|_| ())
    }

    /// [`SshUtils::mkdir`] with elevated privileges
    pub async fn mkdir_sudo(&self, target: impl Into<Target>, path: &str) -> Result<()> {
        let path = to_remote_path(path);
        self.with_session(target.into(), |session| async move {
            self.mkdir_sudo_on(&session, &path).await
        })
        .await
    }

    /// [`SshUtils::rmdir`] with elevated privileges
    pub async fn rmdir_sudo(&self, target: impl Into<Target>, path: &str) -> Result<()> {
        let path = to_remote_path(path);
        self.with_session(target.into(), |session| async move {
            self.rmdir_sudo_on(&session, &path).await
        })
        .await
    }

    /// [`SshUtils::ensure_empty_dir`] with elevated privileges
    pub async fn ensure_empty_dir_sudo(&self, target: impl Into<Target>, path: &str) -> Result<()> {
        let path = to_remote_path(path);
        self.with_session(target.into(), |session| async move {
            self.ensure_empty_dir_sudo_on(&session, &path).await
        })
        .await
    }

    /// Hand `path` and everything below it to the connecting user
    pub async fn ensure_ownership(&self, target: impl Into<Target>, path: &str) -> Result<()> {
        let path = to_remote_path(path);
        self.with_session(target.into(), |session| async move {
            self.ensure_ownership_on(&session, &path).await
        })
        .await
    }

    /// Whether `path` exists, as seen by root
    ///
    /// Lists the parent directory and looks for an exact name match, so it
    /// also sees into directories the connecting user cannot read.
    pub async fn file_exists_sudo(&self, target: impl Into<Target>, path: &str) -> Result<bool> {
        let path = to_remote_path(path);
        self.with_session(target.into(), |session| async move {
            let parent = remote_parent(&path);
            let name = remote_basename(&path);
            match self
                .sudo_on(&session, &parent, format!("ls -1a {}", shell_quote(&parent)))
                .await
            {
                Ok(listing) => Ok(listing.lines().any(|line| line.trim_end_matches('\r') == name)),
                Err(e) if e.code() == Some(ErrorCode::NoSuchFile) => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await
    }

    /// [`SshUtils::ensure_file_contains`] with elevated privileges
    pub async fn ensure_file_contains_sudo(
        &self,
        target: impl Into<Target>,
        path: &str,
        text: &str,
    ) -> Result<Containment> {
        let path = to_remote_path(path);
        self.with_session(target.into(), |session| async move {
            self.ensure_contains_on(&session, &path, text, true).await
        })
        .await
    }

    /// [`SshUtils::put_file`] into a location only root can write
    pub async fn put_file_sudo(
        &self,
        target: impl Into<Target>,
        local: &Path,
        remote: &str,
    ) -> Result<u64> {
        let remote = to_remote_path(remote);
        self.with_session(target.into(), |session| async move {
            let staging = self.staging_path(&remote_parent(&remote));
            self.prepare_staging(&session, &staging).await?;
            let staged = join_remote(&staging, &remote_basename(&remote));

            let result = match self.upload_on(&session, local, &staged).await {
                Ok(sent) => self
                    .install_staged_file(&session, &staged, &remote)
                    .await
                    .map(|_| sent),
                Err(e) => Err(e),
            };
            self.drop_staging(&session, &staging).await;
            result
        })
        .await
    }

    /// [`SshUtils::write_file`] into a location only root can write
    pub async fn write_file_sudo(
        &self,
        target: impl Into<Target>,
        remote: &str,
        content: impl AsRef<[u8]>,
    ) -> Result<()> {
        let remote = to_remote_path(remote);
        self.with_session(target.into(), |session| async move {
            let staging = self.staging_path(&remote_parent(&remote));
            self.prepare_staging(&session, &staging).await?;
            let staged = join_remote(&staging, &remote_basename(&remote));

            let result = match self.write_on(&session, &staged, content.as_ref()).await {
                Ok(()) => self.install_staged_file(&session, &staged, &remote).await,
                Err(e) => Err(e),
            };
            self.drop_staging(&session, &staging).await;
            result
        })
        .await
    }

    /// [`SshUtils::read_file`] for a file only root can read
    pub async fn read_file_sudo(
        &self,
        target: impl Into<Target>,
        remote: &str,
        local: &Path,
    ) -> Result<u64> {
        let remote = to_remote_path(remote);
        self.with_session(target.into(), |session| async move {
            let (staging, staged) = self.stage_remote_file(&session, &remote).await?;
            let result = self.download_on(&session, &staged, local).await;
            self.drop_staging(&session, &staging).await;
            result
        })
        .await
    }

    /// [`SshUtils::get_file`] for a file only root can read
    ///
    /// The staged copy is removed when the reader is dropped or closed.
    pub async fn get_file_sudo(&self, target: impl Into<Target>, remote: &str) -> Result<RemoteReader> {
        let remote = to_remote_path(remote);
        let lease = self.manager.connect(target.into()).await?;
        let session = lease.session().clone();

        let (staging, staged) = match self.stage_remote_file(&session, &remote).await {
            Ok(paths) => paths,
            Err(e) => {
                lease.release().await;
                return Err(e);
            }
        };
        let opened = match session.file_transfer().await {
            Ok(transfer) => transfer.open_read(&staged).await.map_err(|e| self.classify(e)),
            Err(e) => Err(e),
        };
        match opened {
            Ok(inner) => Ok(RemoteReader::new(
                inner,
                lease,
                self.sequencer.clone(),
                Some(staging),
            )),
            Err(e) => {
                self.drop_staging(&session, &staging).await;
                lease.release().await;
                Err(e)
            }
        }
    }

    /// [`SshUtils::put_dir`] into a location only root can write
    ///
    /// The tree is pushed into a staging directory, then copied into place
    /// with `sudo cp -R`, hidden files included.
    pub async fn put_dir_sudo(
        &self,
        target: impl Into<Target>,
        local: &Path,
        remote: &str,
    ) -> Result<SyncReport> {
        let remote = to_remote_path(remote);
        self.with_session(target.into(), |session| async move {
            self.ensure_empty_dir_sudo_on(&session, &remote).await?;
            let staging = self.staging_path(&remote);
            self.prepare_staging(&session, &staging).await?;

            let result = match self.sync.push(&session, local, &staging).await {
                Ok(report) => self
                    .sudo_on(
                        &session,
                        &remote,
                        format!(
                            "cp -R {} {}",
                            shell_quote(&format!("{}/.", staging)),
                            shell_quote(&format!("{}/", remote))
                        ),
                    )
                    .await
                    .map(|_| report),
                Err(e) => Err(e),
            };
            self.drop_staging(&session, &staging).await;
            result
        })
        .await
    }

    /// [`SshUtils::get_dir`] for a tree only root can read
    pub async fn get_dir_sudo(
        &self,
        target: impl Into<Target>,
        remote: &str,
        local: &Path,
    ) -> Result<SyncReport> {
        let remote = to_remote_path(remote);
        self.with_session(target.into(), |session| async move {
            let staging = self.staging_path(&remote);
            self.ensure_empty_dir_sudo_on(&session, &staging).await?;

            let copied = self
                .sudo_on(
                    &session,
                    &remote,
                    format!(
                        "cp -R {} {}",
                        shell_quote(&format!("{}/.", remote)),
                        shell_quote(&format!("{}/", staging))
                    ),
                )
                .await;
            let result = match copied {
                Ok(_) => match self
                    .ensure_ownership_on(&session, &self.settings.staging_root)
                    .await
                {
                    Ok(()) => self.sync.pull(&session, &staging, local).await,
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            self.drop_staging(&session, &staging).await;
            result
        })
        .await
    }
}
