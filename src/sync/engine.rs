//! Two-phase tree synchronization
//!
//! Every directory task settles before the first file task starts. Within a
//! phase tasks run through a bounded pool and failures never cancel their
//! siblings; they are collected into the [`SyncReport`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use super::plan::{scan_local, scan_remote, SyncPlan};
use crate::config::DEFAULT_SYNC_CONCURRENCY;
use crate::error::{Result, SshError};
use crate::ssh::classify::{classify_error, OutputClassifier};
use crate::ssh::command::{CommandList, CommandSequencer};
use crate::ssh::connection::Session;
use crate::ssh::sanitize::{join_remote, shell_quote};

/// Pool settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Most tasks in flight at once within a phase
    pub concurrency: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_SYNC_CONCURRENCY,
        }
    }
}

/// One unit of synchronization work, by relative path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferTask {
    ListDirectory(String),
    CreateDirectory(String),
    TransferFile(String),
}

impl fmt::Display for TransferTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferTask::ListDirectory(rel) => write!(f, "list {}", rel),
            TransferTask::CreateDirectory(rel) => write!(f, "mkdir {}", rel),
            TransferTask::TransferFile(rel) => write!(f, "copy {}", rel),
        }
    }
}

/// A task that failed
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub task: TransferTask,
    pub error: SshError,
}

/// Outcome of a push or pull
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Directory tasks attempted
    pub directories: usize,
    /// File tasks attempted
    pub files: usize,
    pub failures: Vec<TaskFailure>,
}

impl SyncReport {
    pub fn success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Surface failures as a [`SshError::BatchPartialFailure`]
    pub fn into_result(self) -> Result<Self> {
        match self.failures.first() {
            None => Ok(self),
            Some(first) => Err(SshError::BatchPartialFailure {
                failed: self.failures.len(),
                total: self.directories + self.files,
                first: Box::new(first.error.clone()),
            }),
        }
    }
}

/// Copies directory trees between the local machine and a session
#[derive(Debug, Clone, Default)]
pub struct TreeSyncEngine {
    sequencer: CommandSequencer,
    options: SyncOptions,
}

impl TreeSyncEngine {
    pub fn new(sequencer: CommandSequencer, options: SyncOptions) -> Self {
        Self { sequencer, options }
    }

    pub fn options(&self) -> SyncOptions {
        self.options
    }

    fn classifier(&self) -> &Arc<dyn OutputClassifier> {
        self.sequencer.executor().classifier()
    }

    fn concurrency(&self) -> usize {
        self.options.concurrency.max(1)
    }

    /// Replace the remote `dest` with a copy of the local `source` tree
    ///
    /// `dest` is emptied first. Failing to empty it, to scan `source` or to
    /// open the file-transfer channel aborts the push; every other failure
    /// is recorded and the push carries on.
    pub async fn push(&self, session: &Session, source: &Path, dest: &str) -> Result<SyncReport> {
        let plan = scan_local(source).await?;
        info!(
            "push {} -> {}: {} directories, {} files",
            source.display(),
            dest,
            plan.directories.len(),
            plan.files.len()
        );

        let reset = CommandList::new([
            format!("rm -fr {}", shell_quote(dest)),
            format!("mkdir -p {}", shell_quote(dest)),
        ]);
        let output = self.sequencer.run(session, &reset, |_| {}).await;
        if let Some(e) = output.error {
            return Err(e.into_transfer(dest));
        }

        let mut report = SyncReport {
            directories: plan.directories.len(),
            files: plan.files.len(),
            failures: self.push_directories(session, &plan, dest).await,
        };

        let transfer = session.file_transfer().await?;
        let failures = self
            .run_files(&plan, |rel| {
                let transfer = Arc::clone(&transfer);
                let local = local_path(source, rel);
                let remote = join_remote(dest, rel);
                async move { transfer.upload(&local, &remote).await.map(|_| ()) }
            })
            .await;
        report.failures.extend(failures);

        self.finish("push", report)
    }

    /// Copy the remote `source` tree into the local `dest`
    ///
    /// Local directories are created as needed; existing local files are
    /// overwritten. Remote subdirectories that cannot be listed are reported
    /// as failures.
    pub async fn pull(&self, session: &Session, source: &str, dest: &Path) -> Result<SyncReport> {
        let transfer = session.file_transfer().await?;
        let scan = scan_remote(transfer.as_ref(), source, self.concurrency())
            .await
            .map_err(|e| classify_error(self.classifier().as_ref(), e))?;
        let plan = scan.plan;
        info!(
            "pull {} -> {}: {} directories, {} files",
            source,
            dest.display(),
            plan.directories.len(),
            plan.files.len()
        );

        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|e| SshError::transfer(dest.display().to_string(), e.to_string(), None))?;

        let mut report = SyncReport {
            directories: plan.directories.len(),
            files: plan.files.len(),
            failures: scan
                .unlisted
                .into_iter()
                .map(|(rel, error)| TaskFailure {
                    error: classify_error(
                        self.classifier().as_ref(),
                        error.into_transfer(join_remote(source, &rel)),
                    ),
                    task: TransferTask::ListDirectory(rel),
                })
                .collect(),
        };
        report
            .failures
            .extend(self.pull_directories(&plan, dest).await);

        let failures = self
            .run_files(&plan, |rel| {
                let transfer = Arc::clone(&transfer);
                let remote = join_remote(source, rel);
                let local = local_path(dest, rel);
                async move { transfer.download(&remote, &local).await.map(|_| ()) }
            })
            .await;
        report.failures.extend(failures);

        self.finish("pull", report)
    }

    /// Directory phase of a push
    ///
    /// Runs through the command sequencer, so one `mkdir` at a time over
    /// the session's command channel.
    async fn push_directories(
        &self,
        session: &Session,
        plan: &SyncPlan,
        dest: &str,
    ) -> Vec<TaskFailure> {
        let commands = CommandList::new(
            plan.directories
                .iter()
                .map(|rel| format!("mkdir -p {}", shell_quote(&join_remote(dest, rel)))),
        );
        let rels: Vec<&String> = plan.directories.iter().collect();

        let mut failures = Vec::new();
        self.sequencer
            .run(session, &commands, |report| {
                if let Some(ref e) = report.error {
                    let rel = rels[report.index].clone();
                    warn!("failed to create remote directory {}: {}", rel, e);
                    failures.push(TaskFailure {
                        error: e.clone().into_transfer(join_remote(dest, &rel)),
                        task: TransferTask::CreateDirectory(rel),
                    });
                }
            })
            .await;
        failures
    }

    /// Directory phase of a pull
    async fn pull_directories(&self, plan: &SyncPlan, dest: &Path) -> Vec<TaskFailure> {
        let results = stream::iter(plan.directories.iter().map(|rel| async move {
            let path = local_path(dest, rel);
            let result = tokio::fs::create_dir_all(&path).await.map_err(|e| {
                SshError::transfer(path.display().to_string(), e.to_string(), None)
            });
            (rel, result)
        }))
        .buffer_unordered(self.concurrency())
        .collect::<Vec<_>>()
        .await;

        results
            .into_iter()
            .filter_map(|(rel, result)| {
                result.err().map(|error| {
                    warn!("failed to create local directory {}: {}", rel, error);
                    TaskFailure {
                        task: TransferTask::CreateDirectory(rel.clone()),
                        error: classify_error(self.classifier().as_ref(), error),
                    }
                })
            })
            .collect()
    }

    /// File phase
    async fn run_files<F, Fut>(&self, plan: &SyncPlan, task: F) -> Vec<TaskFailure>
    where
        F: Fn(&str) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let results = stream::iter(plan.files.iter().map(|rel| {
            let fut = task(rel);
            async move {
                debug!("copy {}", rel);
                (rel, fut.await)
            }
        }))
        .buffer_unordered(self.concurrency())
        .collect::<Vec<_>>()
        .await;

        results
            .into_iter()
            .filter_map(|(rel, result)| {
                result.err().map(|error| {
                    warn!("failed to copy {}: {}", rel, error);
                    TaskFailure {
                        task: TransferTask::TransferFile(rel.clone()),
                        error: classify_error(self.classifier().as_ref(), error),
                    }
                })
            })
            .collect()
    }

    fn finish(&self, direction: &str, report: SyncReport) -> Result<SyncReport> {
        if report.success() {
            info!(
                "{} done: {} directories, {} files",
                direction, report.directories, report.files
            );
        } else {
            warn!(
                "{} done with {} failure(s) out of {} task(s)",
                direction,
                report.failures.len(),
                report.directories + report.files
            );
        }
        Ok(report)
    }
}

fn local_path(root: &Path, rel: &str) -> PathBuf {
    rel.split('/').fold(root.to_path_buf(), |path, part| path.join(part))
}
