//! Scripted shell sessions
//!
//! Feeds a list of commands to one remote `sh` and splits its output back
//! into per-command responses. After each command the shell prints a marker
//! line carrying `$?`, which is how the end of a response is found.
//!
//! A list containing elevation commands runs on a pseudo-terminal, where
//! password prompts are answered as they show up in a command's response.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use super::channel::{Channel, ChannelExecutor};
use super::command::CommandList;
use super::connection::Session;
use super::elevation::{ChallengeDetector, ChallengeOutcome, ChallengeState, Step};
use super::transport::ChannelEvent;
use crate::config::DEFAULT_RESPONSE_TIMEOUT_SECS;
use crate::error::{Result, SshError};

const SHELL: &str = "sh";
const MARKER_PREFIX: &str = "__ssh_utils_done_";
const READY: &str = "ready";

/// Quiets a terminal shell: no echo, no prompts
const TERMINAL_SETUP: &str = "stty -echo\nPS1=\nPS2=\n";

/// One command of a scripted session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub command: String,
    /// Everything the command printed, both streams, trimmed
    pub response: String,
    pub exit_status: Option<i32>,
    /// How a password prompt was handled, for elevation commands
    pub elevation: Option<ChallengeOutcome>,
}

/// Record of a scripted session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    /// `user@host> command` lines, each followed by its response
    pub text: String,
    pub entries: Vec<TranscriptEntry>,
}

impl Transcript {
    fn push(&mut self, prompt: &str, entry: TranscriptEntry) {
        self.text.push_str(&format!("{}> {}\n", prompt, entry.command));
        if !entry.response.is_empty() {
            self.text.push_str(&entry.response);
            self.text.push('\n');
        }
        self.entries.push(entry);
    }
}

fn marker(tag: impl fmt::Display) -> String {
    format!("{}{}__:", MARKER_PREFIX, tag)
}

fn marker_line(tag: impl fmt::Display) -> String {
    format!("printf '\\n{}%s\\n' \"$?\"\n", marker(tag))
}

fn script_line(index: usize, command: &str) -> String {
    format!("{}\n{}", command, marker_line(index))
}

/// Marker on the command's own line; a password prompt flushes typed-ahead input
fn chained_line(index: usize, command: &str) -> String {
    format!("{} ; {}", command, marker_line(index))
}

/// Runs command lists through one interactive shell
#[derive(Debug, Clone)]
pub struct ScriptedShell {
    executor: ChannelExecutor,
    response_timeout: Duration,
}

impl Default for ScriptedShell {
    fn default() -> Self {
        Self::new(
            ChannelExecutor::default(),
            Duration::from_secs(DEFAULT_RESPONSE_TIMEOUT_SECS),
        )
    }
}

impl ScriptedShell {
    /// `response_timeout` bounds the silence between two outputs of a command
    pub fn new(executor: ChannelExecutor, response_timeout: Duration) -> Self {
        Self {
            executor,
            response_timeout,
        }
    }

    /// Run `commands` in one shell on `session`
    ///
    /// `on_complete` fires as each command's response is complete. A command
    /// that stays silent past the response timeout abandons the rest of the
    /// batch with [`SshError::Timeout`].
    pub async fn run<F>(
        &self,
        session: &Session,
        commands: &CommandList,
        mut on_complete: F,
    ) -> Result<Transcript>
    where
        F: FnMut(&TranscriptEntry),
    {
        let prompt = session.credentials().label();
        let classifier = Arc::clone(self.executor.classifier());
        let secret = session
            .credentials()
            .elevation_secret()
            .filter(|_| commands.iter().any(|c| classifier.is_elevation_command(c)))
            .map(str::to_string);

        let channel = match secret {
            Some(_) => self.executor.exec_interactive(session, SHELL).await?,
            None => self.executor.exec(session, SHELL).await?,
        };
        let mut reader = ShellReader {
            channel,
            buffer: String::new(),
            timeout: self.response_timeout,
        };

        let result = async {
            if reader.channel.is_pty() {
                reader.channel.write(format!("{}{}", TERMINAL_SETUP, marker_line(READY)))?;
                reader.response(READY, None).await?;
            }

            let mut transcript = Transcript::default();
            for (index, command) in commands.iter().enumerate() {
                debug!("{}> {}", prompt, command);
                let line = if reader.channel.is_pty() {
                    chained_line(index, command)
                } else {
                    script_line(index, command)
                };
                reader.channel.write(line)?;

                let challenge = secret
                    .as_deref()
                    .filter(|_| classifier.is_elevation_command(command))
                    .map(|secret| (ChallengeDetector::new(Arc::clone(&classifier)), secret));
                let response = reader.response(index, challenge).await.inspect_err(|e| {
                    warn!("{}> {}: {}", prompt, command, e);
                })?;

                let entry = TranscriptEntry {
                    command: command.to_string(),
                    response: response.text,
                    exit_status: response.status,
                    elevation: response.elevation,
                };
                on_complete(&entry);
                transcript.push(&prompt, entry);
            }

            reader.channel.write("exit\n")?;
            reader.channel.handle().eof()?;
            Ok::<_, SshError>(transcript)
        }
        .await;

        match result {
            Ok(transcript) => {
                while reader.channel.next_event().await.is_some() {}
                Ok(transcript)
            }
            Err(e) => {
                reader.channel.handle().close();
                Err(e)
            }
        }
    }
}

struct Response {
    text: String,
    status: Option<i32>,
    elevation: Option<ChallengeOutcome>,
}

struct ShellReader {
    channel: Channel,
    buffer: String,
    timeout: Duration,
}

impl ShellReader {
    async fn next_event(&mut self) -> Result<ChannelEvent> {
        match timeout(self.timeout, self.channel.next_event()).await {
            Ok(event) => Ok(event.unwrap_or(ChannelEvent::Closed)),
            Err(_) => Err(SshError::Timeout(
                u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            )),
        }
    }

    /// Read up to the marker tagged `tag`
    ///
    /// With a detector, a password prompt is answered with the secret and
    /// left out of the response; a rejected secret is aborted with ETX.
    async fn response(
        &mut self,
        tag: impl fmt::Display,
        mut challenge: Option<(ChallengeDetector, &str)>,
    ) -> Result<Response> {
        let marker = format!("\n{}", marker(&tag));
        loop {
            if let Some(start) = self.buffer.find(&marker) {
                let status_start = start + marker.len();
                if let Some(len) = self.buffer[status_start..].find('\n') {
                    let status = self.buffer[status_start..status_start + len]
                        .trim()
                        .parse()
                        .ok();
                    let text = self.buffer[..start].trim().to_string();
                    self.buffer.drain(..status_start + len + 1);
                    let elevation = challenge.map(|(detector, _)| match detector.state() {
                        ChallengeState::Resolved(outcome) => outcome,
                        ChallengeState::Challenged => ChallengeOutcome::Accepted,
                        ChallengeState::Idle => ChallengeOutcome::NoChallenge,
                    });
                    return Ok(Response {
                        text,
                        status,
                        elevation,
                    });
                }
            }

            let data = match self.next_event().await? {
                ChannelEvent::Stdout(data) | ChannelEvent::Stderr(data) => data,
                ChannelEvent::ExitStatus(_) => continue,
                ChannelEvent::Closed => {
                    return Err(SshError::exec(format!(
                        "shell closed before marker {} was printed",
                        tag
                    )));
                }
            };
            let text = String::from_utf8_lossy(&data).into_owned();

            if let Some((detector, secret)) = challenge.as_mut() {
                if !detector.is_resolved() {
                    match detector.on_output(&text) {
                        Step::SendSecret => {
                            self.channel.write(format!("{}\n", secret))?;
                            continue;
                        }
                        Step::Resolved(ChallengeOutcome::Rejected) => {
                            warn!("Elevation secret rejected; probable cause of command failure");
                            let _ = self.channel.handle().send_etx();
                        }
                        Step::Resolved(_) | Step::Ignore => {}
                    }
                }
            }
            self.buffer.push_str(&text);
        }
    }
}
