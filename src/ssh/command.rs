//! Command execution over a session
//!
//! Provides [`CommandOutput`], the [`CommandList`] a caller submits, and the
//! [`CommandSequencer`] that runs a list strictly one command at a time.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::channel::{Channel, ChannelExecutor, ChannelHandle};
use super::classify::OutputClassifier;
use super::connection::{Lease, Session};
use super::elevation::ChallengeState;
use super::sanitize::sanitize_command;
use super::transport::ChannelEvent;
use crate::error::{Result, SshError};

/// Output from a command execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output from the command
    pub stdout: String,

    /// Standard error from the command
    pub stderr: String,

    /// Exit code of the command (if available)
    pub exit_code: Option<u32>,
}

impl CommandOutput {
    /// Create a new empty CommandOutput
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if the command succeeded
    ///
    /// Success means the error stream stayed empty. The exit code is not
    /// consulted: remote tools that print warnings and exit 0 count as failed,
    /// and a process that exits non-zero silently counts as succeeded.
    pub fn success(&self) -> bool {
        self.stderr.is_empty()
    }

    /// Get combined output (stdout + stderr)
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }

    /// The command failure this output represents, if any
    pub fn error(&self, classifier: &dyn OutputClassifier) -> Option<SshError> {
        if self.success() {
            return None;
        }
        Some(SshError::Command {
            message: self.stderr.trim().to_string(),
            code: classifier.error_code(&self.stderr),
        })
    }
}

/// Ordered list of commands
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandList(Vec<String>);

impl CommandList {
    /// Build a list from any sequence of commands
    pub fn new<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(commands.into_iter().map(Into::into).collect())
    }

    /// Trim every command, rejecting empty or over-long ones
    pub fn sanitized(&self, max_chars: Option<usize>) -> Result<Self> {
        if self.0.is_empty() {
            return Err(SshError::invalid_params("No command given"));
        }
        let commands = self
            .0
            .iter()
            .map(|command| sanitize_command(command, max_chars))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self(commands))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl From<&str> for CommandList {
    fn from(command: &str) -> Self {
        Self(vec![command.to_string()])
    }
}

impl From<String> for CommandList {
    fn from(command: String) -> Self {
        Self(vec![command])
    }
}

impl From<Vec<String>> for CommandList {
    fn from(commands: Vec<String>) -> Self {
        Self(commands)
    }
}

impl From<Vec<&str>> for CommandList {
    fn from(commands: Vec<&str>) -> Self {
        Self::new(commands)
    }
}

impl From<&[&str]> for CommandList {
    fn from(commands: &[&str]) -> Self {
        Self::new(commands.iter().copied())
    }
}

impl<const N: usize> From<[&str; N]> for CommandList {
    fn from(commands: [&str; N]) -> Self {
        Self::new(commands)
    }
}

/// Result of one command of a sequence
#[derive(Debug, Clone)]
pub struct CommandReport {
    /// Position in the submitted list
    pub index: usize,
    /// The command as run
    pub command: String,
    /// Everything the command printed
    pub output: CommandOutput,
    /// Why the command counts as failed
    pub error: Option<SshError>,
}

/// Aggregate result of a sequence
#[derive(Debug, Clone, Default)]
pub struct SequenceOutput {
    /// Output streams of all commands, concatenated in submission order
    pub stdout: String,
    /// Error streams of all commands, concatenated in submission order
    pub stderr: String,
    /// First per-command error
    pub error: Option<SshError>,
    /// Per-command results, in submission order
    pub commands: Vec<CommandReport>,
}

impl SequenceOutput {
    fn push(&mut self, report: CommandReport) {
        self.stdout.push_str(&report.output.stdout);
        self.stderr.push_str(&report.output.stderr);
        if self.error.is_none() {
            self.error = report.error.clone();
        }
        self.commands.push(report);
    }

    /// Whether every command succeeded
    pub fn success(&self) -> bool {
        self.error.is_none()
    }

    /// Turn a sequence with failures into an error
    ///
    /// A single failed command surfaces its own error; several commands with
    /// at least one failure surface a [`SshError::BatchPartialFailure`].
    pub fn into_result(self) -> Result<Self> {
        let failed = self.commands.iter().filter(|r| r.error.is_some()).count();
        match self.error {
            None => Ok(self),
            Some(first) if self.commands.len() == 1 => Err(first),
            Some(first) => Err(SshError::BatchPartialFailure {
                failed,
                total: self.commands.len(),
                first: Box::new(first),
            }),
        }
    }
}

/// Which stream a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Something that happened while streaming a sequence
#[derive(Debug)]
pub enum StreamEvent {
    /// Command `index` has a channel; `handle` writes to its input
    Started {
        index: usize,
        command: String,
        handle: ChannelHandle,
    },
    /// A chunk of command `index`'s output
    Chunk {
        index: usize,
        kind: StreamKind,
        data: Vec<u8>,
    },
    /// Command `index` closed
    Finished {
        index: usize,
        error: Option<SshError>,
    },
}

/// A sequence running in the background
pub struct RunStream {
    events: mpsc::Receiver<StreamEvent>,
    task: JoinHandle<SequenceOutput>,
}

impl RunStream {
    /// Next event; `None` once the last command has finished
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Wait for the sequence to finish, discarding unread events
    pub async fn finish(self) -> Result<SequenceOutput> {
        drop(self.events);
        self.task
            .await
            .map_err(|e| SshError::exec(format!("command stream task failed: {}", e)))
    }
}

impl std::fmt::Debug for RunStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunStream").finish_non_exhaustive()
    }
}

const STREAM_BUFFER: usize = 64;

/// Runs command lists one command at a time
#[derive(Debug, Clone, Default)]
pub struct CommandSequencer {
    executor: ChannelExecutor,
}

impl CommandSequencer {
    pub fn new(executor: ChannelExecutor) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &ChannelExecutor {
        &self.executor
    }

    fn classifier(&self) -> &Arc<dyn OutputClassifier> {
        self.executor.classifier()
    }

    /// Run `commands` on `session`, in order
    ///
    /// `observer` sees every command's report as its channel closes. A failed
    /// command does not stop the sequence.
    pub async fn run<F>(
        &self,
        session: &Session,
        commands: &CommandList,
        mut observer: F,
    ) -> SequenceOutput
    where
        F: FnMut(&CommandReport),
    {
        let mut output = SequenceOutput::default();
        for (index, command) in commands.iter().enumerate() {
            let report = self.run_one(session, index, command, None).await;
            observer(&report);
            output.push(report);
        }
        output
    }

    /// Run `commands` in the background, re-emitting output as it arrives
    ///
    /// The lease is released once the last command has finished.
    pub fn stream(&self, lease: Lease, commands: CommandList) -> RunStream {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let sequencer = self.clone();

        let task = tokio::spawn(async move {
            let mut output = SequenceOutput::default();
            for (index, command) in commands.iter().enumerate() {
                let report = sequencer
                    .run_one(lease.session(), index, command, Some(&tx))
                    .await;
                let _ = tx
                    .send(StreamEvent::Finished {
                        index,
                        error: report.error.clone(),
                    })
                    .await;
                output.push(report);
            }
            lease.release().await;
            output
        });

        RunStream { events: rx, task }
    }

    async fn run_one(
        &self,
        session: &Session,
        index: usize,
        command: &str,
        sink: Option<&mpsc::Sender<StreamEvent>>,
    ) -> CommandReport {
        debug!("[{}] {}", index, command);
        let (output, error) = match self.executor.exec(session, command).await {
            Ok(channel) => self.drain(channel, index, sink).await,
            Err(e) => {
                warn!("Command {} could not start: {}", index, e);
                (CommandOutput::new(), Some(e))
            }
        };

        CommandReport {
            index,
            command: command.to_string(),
            output,
            error,
        }
    }

    async fn drain(
        &self,
        mut channel: Channel,
        index: usize,
        sink: Option<&mpsc::Sender<StreamEvent>>,
    ) -> (CommandOutput, Option<SshError>) {
        if let Some(sink) = sink {
            let _ = sink
                .send(StreamEvent::Started {
                    index,
                    command: channel.command().to_string(),
                    handle: channel.handle(),
                })
                .await;
        }

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        while let Some(event) = channel.next_event().await {
            let (kind, data) = match event {
                ChannelEvent::Stdout(data) => (StreamKind::Stdout, data),
                ChannelEvent::Stderr(data) => (StreamKind::Stderr, data),
                ChannelEvent::ExitStatus(code) => {
                    exit_code = Some(code);
                    continue;
                }
                ChannelEvent::Closed => break,
            };
            match kind {
                StreamKind::Stdout => stdout.extend_from_slice(&data),
                StreamKind::Stderr => stderr.extend_from_slice(&data),
            }
            if let Some(sink) = sink {
                let _ = sink.send(StreamEvent::Chunk { index, kind, data }).await;
            }
        }

        let output = CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        };

        let challenge_failed = matches!(
            channel.challenge_state(),
            Some(ChallengeState::Resolved(outcome)) if outcome.is_fatal()
        );
        let error = if challenge_failed {
            Some(SshError::challenge_failure(output.stderr.trim()))
        } else {
            output.error(self.classifier().as_ref())
        };
        if let Some(ref e) = error {
            debug!("[{}] failed: {}", index, e);
        }

        (output, error)
    }
}
