//! Sync planning
//!
//! A [`SyncPlan`] is computed once from a full scan of the source tree,
//! before any transfer starts. Paths in the plan are relative to the scan
//! root and always use `/` separators.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{ErrorCode, Result, SshError};
use crate::ssh::sanitize::join_remote;
use crate::ssh::transport::{EntryKind, FileTransfer};

/// Everything a tree synchronization has to create or copy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    /// Relative directory paths; sorted, so parents precede children
    pub directories: BTreeSet<String>,
    /// Relative file paths
    pub files: BTreeSet<String>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.directories.is_empty() && self.files.is_empty()
    }
}

fn rel_to_slash(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Scan a local directory tree
///
/// Symbolic links are not followed. Entries that cannot be read are logged
/// and skipped.
pub async fn scan_local(root: &Path) -> Result<SyncPlan> {
    let root: PathBuf = root.to_path_buf();
    tokio::task::spawn_blocking(move || scan_local_blocking(&root))
        .await
        .map_err(|e| SshError::Io(format!("local scan task failed: {}", e)))?
}

fn scan_local_blocking(root: &Path) -> Result<SyncPlan> {
    if !root.is_dir() {
        return Err(SshError::transfer(
            root.display().to_string(),
            "No such file or directory",
            Some(ErrorCode::NoSuchFile),
        ));
    }

    let mut plan = SyncPlan::default();
    for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
        let entry = match entry {
            Ok(v) => v,
            Err(e) => {
                warn!("encountered error when enumerating local files: {:?}", e);
                continue;
            }
        };
        let rel = match entry.path().strip_prefix(root) {
            Ok(rel) => rel_to_slash(rel),
            Err(_) => continue,
        };
        if entry.file_type().is_dir() {
            plan.directories.insert(rel);
        } else if entry.file_type().is_file() {
            plan.files.insert(rel);
        } else {
            debug!("skipping {:?}: not a regular file", entry.path());
        }
    }
    Ok(plan)
}

/// Result of a remote scan
#[derive(Debug, Clone, Default)]
pub struct RemoteScan {
    pub plan: SyncPlan,
    /// Relative subdirectories that could not be listed
    pub unlisted: Vec<(String, SshError)>,
}

/// Scan a remote directory tree, one level at a time
///
/// Up to `concurrency` directory listings are in flight at once. Failing to
/// list the root is an error. A subdirectory that cannot be listed stays in
/// the plan without its contents and is reported in
/// [`RemoteScan::unlisted`].
pub async fn scan_remote(
    files: &dyn FileTransfer,
    root: &str,
    concurrency: usize,
) -> Result<RemoteScan> {
    let mut plan = SyncPlan::default();
    let mut unlisted = Vec::new();
    let mut level = vec![String::new()];

    while !level.is_empty() {
        let listings = stream::iter(level.drain(..).map(|rel| async move {
            let listing = files.list_dir(&join_remote(root, &rel)).await;
            (rel, listing)
        }))
        .buffer_unordered(concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

        let mut next = Vec::new();
        for (rel, listing) in listings {
            let entries = match listing {
                Ok(entries) => entries,
                Err(e) if rel.is_empty() => return Err(e),
                Err(e) => {
                    warn!("failed to list remote directory {:?}: {}", rel, e);
                    unlisted.push((rel, e));
                    continue;
                }
            };
            for entry in entries {
                let child = if rel.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{}/{}", rel, entry.name)
                };
                match entry.kind {
                    EntryKind::Directory => {
                        plan.directories.insert(child.clone());
                        next.push(child);
                    }
                    EntryKind::File => {
                        plan.files.insert(child);
                    }
                    EntryKind::Other => debug!("skipping remote {:?}: not a regular file", child),
                }
            }
        }
        level = next;
    }

    unlisted.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(RemoteScan { plan, unlisted })
}
