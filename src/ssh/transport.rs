//! Transport abstraction
//!
//! The engine talks to the secure transport and its file-transfer subsystem
//! only through these traits. [`super::remote`] implements them over russh;
//! tests implement them in memory.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

use super::config::Credentials;
use crate::error::Result;

/// Something that arrived from a remote process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Bytes on the output stream
    Stdout(Vec<u8>),
    /// Bytes on the error stream
    Stderr(Vec<u8>),
    /// The remote process reported its exit status
    ExitStatus(u32),
    /// The channel is closed; no further events follow
    Closed,
}

/// Something sent to a remote process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelControl {
    /// Write bytes to the process input
    Write(Vec<u8>),
    /// Deliver SIGINT through the protocol
    Interrupt,
    /// Signal end of input
    Eof,
    /// Close the channel
    Close,
}

/// A freshly opened remote process, as the transport hands it over
#[derive(Debug)]
pub struct RawChannel {
    /// Events from the process, terminated by [`ChannelEvent::Closed`]
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
    /// Input and control requests for the process
    pub control: mpsc::UnboundedSender<ChannelControl>,
}

/// Kind of a remote directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Other,
}

/// One entry of a remote directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Entry name (no directory part)
    pub name: String,
    /// Entry kind
    pub kind: EntryKind,
}

/// Readable remote file handle
pub type RemoteRead = Box<dyn AsyncRead + Send + Unpin>;

/// File-transfer sub-channel of a session
#[async_trait]
pub trait FileTransfer: Send + Sync {
    /// Copy a local file to `remote`, returning the bytes sent
    async fn upload(&self, local: &Path, remote: &str) -> Result<u64>;

    /// Copy `remote` to a local file, returning the bytes received
    async fn download(&self, remote: &str, local: &Path) -> Result<u64>;

    /// Create or truncate `remote` with `content`
    async fn write(&self, remote: &str, content: &[u8]) -> Result<()>;

    /// Open `remote` for streaming reads
    async fn open_read(&self, remote: &str) -> Result<RemoteRead>;

    /// Whether `remote` exists
    async fn exists(&self, remote: &str) -> Result<bool>;

    /// List the entries of a remote directory
    async fn list_dir(&self, remote: &str) -> Result<Vec<RemoteEntry>>;
}

/// An authenticated connection
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start `command` on a new channel, with a pseudo-terminal when `pty`
    async fn open_exec(&self, command: &str, pty: bool) -> Result<RawChannel>;

    /// Open the file-transfer subsystem
    async fn open_file_transfer(&self) -> Result<Arc<dyn FileTransfer>>;

    /// Tear the connection down; open channels close with it
    async fn disconnect(&self);
}

/// Opens authenticated connections
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect and authenticate with `credentials`
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn Transport>>;
}
