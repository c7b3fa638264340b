//! ssh-utils - remote command execution, transparent sudo and directory sync
//!
//! This crate runs commands and moves files on remote Linux hosts over SSH.
//! Commands that start with `sudo` or `su` get a pseudo-terminal, and their
//! password prompt is answered from the credentials. Whole directory trees
//! can be pushed and pulled with bounded concurrency, and Ctrl+C is forwarded
//! into every open channel.
//!
//! # Features
//!
//! - One command or a list, run in order on one session (`exec`, `run`)
//! - A list run through a single shell, producing a transcript (`run_multiple`)
//! - File upload, download and streaming reads over SFTP
//! - Directory push and pull
//! - An elevated variant of every file operation, staged through a directory
//!   owned by the connecting user
//!
//! # Example Usage (library)
//!
//! ```no_run
//! use ssh_utils::{Credentials, SshUtils};
//!
//! # async fn demo() -> ssh_utils::Result<()> {
//! let utils = SshUtils::new();
//! let creds = Credentials::new("192.168.1.100", "admin").with_password("secret");
//!
//! let output = utils.exec(creds.clone(), "sudo systemctl restart nginx").await?;
//! println!("{}", output.stdout);
//!
//! let session = utils.connect(&creds).await?;
//! utils.mkdir(&session, "/srv/app").await?;
//! utils.put_dir(&session, "./build".as_ref(), "/srv/app").await?;
//! session.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Example Usage (CLI)
//!
//! ```bash
//! ssh-utils --host=192.168.1.100 --user=admin --password=secret exec 'uname -a'
//! ssh-utils --credentials=web1.json --sudo put-file ./nginx.conf /etc/nginx/nginx.conf
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod ssh;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use client::{Containment, RemoteReader, SshUtils, SshUtilsBuilder};
pub use config::{Args, Config, EngineSettings};
pub use error::{ErrorCode, Result, SshError};
pub use ssh::{
    CancellationBridge, CommandList, CommandOutput, Credentials, OutputClassifier,
    PatternClassifier, RunStream, SequenceOutput, Session, StreamEvent, Target, Transcript,
};
pub use sync::{SyncReport, TreeSyncEngine};
