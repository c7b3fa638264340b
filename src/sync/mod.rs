//! Directory tree synchronization
//!
//! Trees are scanned into a [`SyncPlan`] and executed by the
//! [`TreeSyncEngine`] in two bounded-concurrency phases.

pub mod engine;
pub mod plan;

pub use engine::{SyncOptions, SyncReport, TaskFailure, TransferTask, TreeSyncEngine};
pub use plan::{scan_local, scan_remote, RemoteScan, SyncPlan};
