//! Command channels
//!
//! [`ChannelExecutor::exec`] opens one remote process on a session and hands
//! back a [`Channel`] whose events arrive asynchronously. Elevation-eligible
//! commands get a pseudo-terminal and a challenge watcher.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::classify::OutputClassifier;
use super::command::CommandOutput;
use super::connection::{Registration, Session};
use super::elevation::{self, ChallengeState};
use super::transport::{ChannelControl, ChannelEvent};
use crate::config::DEFAULT_CHALLENGE_TIMEOUT_MS;
use crate::error::{Result, SshError};

/// ETX, what a terminal sends for Ctrl+C
pub const ETX: u8 = 0x03;

/// Cloneable input/control side of a channel
///
/// Every request is best-effort: once the channel is gone they are dropped.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    tx: mpsc::UnboundedSender<ChannelControl>,
}

impl ChannelHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ChannelControl>) -> Self {
        Self { tx }
    }

    /// Write bytes to the process input
    pub fn write(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        self.tx
            .send(ChannelControl::Write(data.into()))
            .map_err(|_| SshError::exec("channel already closed"))
    }

    /// Deliver SIGINT through the protocol
    pub fn interrupt(&self) -> Result<()> {
        self.tx
            .send(ChannelControl::Interrupt)
            .map_err(|_| SshError::exec("channel already closed"))
    }

    /// Write a raw ETX control byte to the process input
    pub fn send_etx(&self) -> Result<()> {
        self.write(vec![ETX])
    }

    /// Signal end of input
    pub fn eof(&self) -> Result<()> {
        self.tx
            .send(ChannelControl::Eof)
            .map_err(|_| SshError::exec("channel already closed"))
    }

    /// Ask the channel to close
    pub fn close(&self) {
        let _ = self.tx.send(ChannelControl::Close);
    }

    /// Whether the channel has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One remote process invocation bound to a session
pub struct Channel {
    id: u64,
    command: String,
    pty: bool,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    handle: ChannelHandle,
    challenge: Option<watch::Receiver<ChallengeState>>,
    registration: Registration,
    closed: bool,
}

impl Channel {
    /// Id of the channel within its session
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The command the channel runs
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Whether a pseudo-terminal was allocated
    pub fn is_pty(&self) -> bool {
        self.pty
    }

    /// Input/control handle for the running process
    pub fn handle(&self) -> ChannelHandle {
        self.handle.clone()
    }

    /// Write bytes to the process input
    pub fn write(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        self.handle.write(data)
    }

    /// Current elevation challenge state, for PTY channels
    pub fn challenge_state(&self) -> Option<ChallengeState> {
        self.challenge.as_ref().map(|rx| rx.borrow().clone())
    }

    /// Receiver following the challenge state, for PTY channels
    pub fn watch_challenge(&self) -> Option<watch::Receiver<ChallengeState>> {
        self.challenge.clone()
    }

    /// Next event from the process; `None` once the channel has closed
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        if self.closed {
            return None;
        }
        let event = self.events.recv().await.unwrap_or(ChannelEvent::Closed);
        if event == ChannelEvent::Closed {
            self.closed = true;
            self.registration.release();
        }
        Some(event)
    }

    /// Drain the channel until it closes, accumulating both streams
    pub async fn collect(mut self) -> CommandOutput {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        while let Some(event) = self.next_event().await {
            match event {
                ChannelEvent::Stdout(data) => stdout.extend_from_slice(&data),
                ChannelEvent::Stderr(data) => stderr.extend_from_slice(&data),
                ChannelEvent::ExitStatus(code) => exit_code = Some(code),
                ChannelEvent::Closed => break,
            }
        }

        let output = CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        };
        debug!(
            "Command completed: exit_code={:?}, stdout_len={}, stderr_len={}",
            output.exit_code,
            output.stdout.len(),
            output.stderr.len()
        );
        output
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("pty", &self.pty)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Opens command channels
#[derive(Debug, Clone)]
pub struct ChannelExecutor {
    classifier: Arc<dyn OutputClassifier>,
    challenge_timeout: Duration,
}

impl ChannelExecutor {
    /// Create an executor
    pub fn new(classifier: Arc<dyn OutputClassifier>, challenge_timeout: Duration) -> Self {
        Self {
            classifier,
            challenge_timeout,
        }
    }

    /// The classifier used to recognize elevation commands and prompts
    pub fn classifier(&self) -> &Arc<dyn OutputClassifier> {
        &self.classifier
    }

    /// Whether `command` would run with a pseudo-terminal on `session`
    pub fn should_elevate(&self, session: &Session, command: &str) -> bool {
        self.classifier.is_elevation_command(command)
            && session.credentials().elevation_secret().is_some()
    }

    /// Start `command` on `session`
    ///
    /// Returns as soon as the channel is open; output is read from the
    /// returned [`Channel`].
    pub async fn exec(&self, session: &Session, command: &str) -> Result<Channel> {
        let elevate = self.should_elevate(session, command);
        self.start(session, command, elevate, elevate).await
    }

    /// Start `command` on a pseudo-terminal, leaving prompts to the caller
    pub async fn exec_interactive(&self, session: &Session, command: &str) -> Result<Channel> {
        self.start(session, command, true, false).await
    }

    async fn start(
        &self,
        session: &Session,
        command: &str,
        pty: bool,
        watch_prompts: bool,
    ) -> Result<Channel> {
        debug!("cmd {:?}", command);
        debug!("pty {}", pty);

        let raw = session
            .transport()
            .open_exec(command, pty)
            .await
            .map_err(|e| match e {
                SshError::Exec(_) => e,
                other => SshError::exec(other.to_string()),
            })?;

        let handle = ChannelHandle::new(raw.control);
        let registration = session.register(command, handle.clone());

        let (events, challenge) = match session.credentials().elevation_secret() {
            Some(secret) if watch_prompts => {
                let (events, state) = elevation::watch(
                    raw.events,
                    handle.clone(),
                    secret.to_string(),
                    Arc::clone(&self.classifier),
                    self.challenge_timeout,
                );
                (events, Some(state))
            }
            _ => (raw.events, None),
        };

        Ok(Channel {
            id: registration.channel_id(),
            command: command.to_string(),
            pty,
            events,
            handle,
            challenge,
            registration,
            closed: false,
        })
    }
}

impl Default for ChannelExecutor {
    fn default() -> Self {
        Self::new(
            Arc::new(super::classify::PatternClassifier::default()),
            Duration::from_millis(DEFAULT_CHALLENGE_TIMEOUT_MS),
        )
    }
}
