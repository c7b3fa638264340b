//! SSH session orchestration
//!
//! This module provides session ownership, command channels with transparent
//! privilege elevation, command sequencing and interrupt forwarding.

pub mod cancel;
pub mod channel;
pub mod classify;
pub mod command;
pub mod config;
pub mod connection;
pub mod elevation;
pub mod handler;
pub mod remote;
pub mod sanitize;
pub mod sftp;
pub mod shell;
pub mod transport;

// Re-exports
pub use cancel::CancellationBridge;
pub use channel::{Channel, ChannelExecutor, ChannelHandle};
pub use classify::{OutputClassifier, PatternClassifier};
pub use command::{
    CommandList, CommandOutput, CommandReport, CommandSequencer, RunStream, SequenceOutput,
    StreamEvent, StreamKind,
};
pub use config::Credentials;
pub use connection::{ConnectionManager, Lease, Ownership, Session, Target};
pub use elevation::{ChallengeDetector, ChallengeOutcome, ChallengeState};
pub use handler::SshHandler;
pub use remote::{RusshConnector, RusshTransport};
pub use sanitize::{sanitize_command, shell_quote};
pub use shell::{ScriptedShell, Transcript, TranscriptEntry};
pub use transport::{
    ChannelControl, ChannelEvent, Connector, EntryKind, FileTransfer, RawChannel, RemoteEntry,
    RemoteRead, Transport,
};
