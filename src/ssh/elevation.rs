//! Privilege elevation challenge handling
//!
//! An elevation command run on a pseudo-terminal may print a password prompt
//! before doing anything else. Nothing in the protocol says so; the prompt
//! has to be recognized in the output text. [`ChallengeDetector`] is the pure
//! state machine, [`watch`] drives it against a live channel without ever
//! holding output back from the caller for longer than one chunk.
//!
//! The challenge timeout only bounds how long the watcher looks for a
//! prompt. A command that stays quiet past it keeps running; only a secret
//! the command rejected aborts it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch as watch_channel};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use super::channel::ChannelHandle;
use super::classify::OutputClassifier;
use super::transport::ChannelEvent;

/// How an elevation exchange ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeOutcome {
    /// The command produced output (or closed) without asking for a secret
    NoChallenge,
    /// A prompt was answered and the secret accepted
    Accepted,
    /// A prompt was answered and the secret rejected
    Rejected,
    /// No output arrived before the challenge timeout
    TimedOut,
}

impl ChallengeOutcome {
    /// Whether the exchange is known to have gone through
    pub fn is_success(self) -> bool {
        matches!(self, ChallengeOutcome::NoChallenge | ChallengeOutcome::Accepted)
    }

    /// Whether the command was aborted because of the exchange
    ///
    /// Only a rejected secret aborts. A timed-out challenge is a diagnostic:
    /// the command keeps running and its own output decides its result.
    pub fn is_fatal(self) -> bool {
        self == ChallengeOutcome::Rejected
    }
}

/// Elevation exchange state of one PTY channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeState {
    /// Waiting for the first output chunk
    Idle,
    /// Prompt seen and secret written
    Challenged,
    /// Exchange finished
    Resolved(ChallengeOutcome),
}

/// What the driver must do after feeding the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Write the secret and a newline to the channel
    SendSecret,
    /// The exchange is over
    Resolved(ChallengeOutcome),
    /// Nothing to do (already resolved)
    Ignore,
}

/// Pure elevation state machine
#[derive(Debug)]
pub struct ChallengeDetector {
    classifier: Arc<dyn OutputClassifier>,
    state: ChallengeState,
}

impl ChallengeDetector {
    pub fn new(classifier: Arc<dyn OutputClassifier>) -> Self {
        Self {
            classifier,
            state: ChallengeState::Idle,
        }
    }

    pub fn state(&self) -> ChallengeState {
        self.state
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.state, ChallengeState::Resolved(_))
    }

    /// Feed one output chunk
    pub fn on_output(&mut self, chunk: &str) -> Step {
        match self.state {
            ChallengeState::Idle => {
                if self.classifier.is_password_prompt(chunk) {
                    debug!("Challenge started...");
                    self.state = ChallengeState::Challenged;
                    Step::SendSecret
                } else {
                    debug!("Login done without a challenge");
                    self.resolve(ChallengeOutcome::NoChallenge)
                }
            }
            ChallengeState::Challenged => {
                if self.classifier.is_challenge_failure(chunk) {
                    debug!("... Failed to resolve the challenge");
                    self.resolve(ChallengeOutcome::Rejected)
                } else {
                    debug!("... Challenge was successfully resolved");
                    self.resolve(ChallengeOutcome::Accepted)
                }
            }
            ChallengeState::Resolved(_) => Step::Ignore,
        }
    }

    /// The channel closed
    ///
    /// Closing before any output means the command needed no secret and
    /// printed nothing. Closing right after the secret was written means the
    /// command accepted it and exited silently; a rejection re-prompts, which
    /// would have arrived as output first.
    pub fn on_close(&mut self) -> Step {
        match self.state {
            ChallengeState::Idle => {
                debug!("Login was done, without a challenge, without a data");
                self.resolve(ChallengeOutcome::NoChallenge)
            }
            ChallengeState::Challenged => self.resolve(ChallengeOutcome::Accepted),
            ChallengeState::Resolved(_) => Step::Ignore,
        }
    }

    /// The challenge timeout elapsed
    ///
    /// Before any output this resolves as timed out, which is only logged:
    /// the command may need no secret and simply be busy. After the secret
    /// it counts as accepted, since a rejection re-prompts right away.
    pub fn on_timeout(&mut self) -> Step {
        match self.state {
            ChallengeState::Idle => {
                debug!("No challenge before the timeout");
                self.resolve(ChallengeOutcome::TimedOut)
            }
            ChallengeState::Challenged => {
                debug!("... Challenge answered, command is quiet");
                self.resolve(ChallengeOutcome::Accepted)
            }
            ChallengeState::Resolved(_) => Step::Ignore,
        }
    }

    fn resolve(&mut self, outcome: ChallengeOutcome) -> Step {
        self.state = ChallengeState::Resolved(outcome);
        Step::Resolved(outcome)
    }
}

/// Failure text placed on the error stream after a rejected secret
pub fn failure_message(output: &str) -> String {
    let detail = output.trim();
    if detail.is_empty() {
        "sudo: authentication failure: incorrect password\n".to_string()
    } else {
        format!("sudo: authentication failure: {}\n", detail)
    }
}

/// Interpose a challenge watcher between a PTY channel and its reader
///
/// Returns the event stream the reader should consume and a receiver that
/// follows the challenge state. The prompt chunk itself is consumed; every
/// other chunk is forwarded as it arrives. After a rejected secret the
/// failure is appended to the error stream and ETX is written so a
/// re-prompting command does not hang. Once the timeout passes the watcher
/// only forwards events.
pub fn watch(
    mut raw: mpsc::UnboundedReceiver<ChannelEvent>,
    handle: ChannelHandle,
    secret: String,
    classifier: Arc<dyn OutputClassifier>,
    timeout: Duration,
) -> (
    mpsc::UnboundedReceiver<ChannelEvent>,
    watch_channel::Receiver<ChallengeState>,
) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch_channel::channel(ChallengeState::Idle);

    tokio::spawn(async move {
        let mut detector = ChallengeDetector::new(classifier);
        let deadline = Instant::now() + timeout;

        loop {
            let event = if detector.is_resolved() {
                raw.recv().await
            } else {
                tokio::select! {
                    event = raw.recv() => event,
                    _ = sleep_until(deadline) => {
                        let step = detector.on_timeout();
                        apply(step, "", &handle, &secret, &out_tx, &state_tx);
                        continue;
                    }
                }
            };

            let event = event.unwrap_or(ChannelEvent::Closed);
            match event {
                ChannelEvent::Stdout(ref data) if !detector.is_resolved() => {
                    let text = String::from_utf8_lossy(data).into_owned();
                    let step = detector.on_output(&text);
                    let consumed = step == Step::SendSecret;
                    if !consumed {
                        let _ = out_tx.send(event);
                    }
                    apply(step, &text, &handle, &secret, &out_tx, &state_tx);
                }
                ChannelEvent::Closed => {
                    let step = detector.on_close();
                    apply(step, "", &handle, &secret, &out_tx, &state_tx);
                    let _ = out_tx.send(ChannelEvent::Closed);
                    return;
                }
                other => {
                    let _ = out_tx.send(other);
                }
            }
        }
    });

    (out_rx, state_rx)
}

fn apply(
    step: Step,
    output: &str,
    handle: &ChannelHandle,
    secret: &str,
    out_tx: &mpsc::UnboundedSender<ChannelEvent>,
    state_tx: &watch_channel::Sender<ChallengeState>,
) {
    match step {
        Step::SendSecret => {
            let _ = state_tx.send(ChallengeState::Challenged);
            if let Err(e) = handle.write(format!("{}\n", secret)) {
                debug!("Failed to send elevation secret: {}", e);
            }
        }
        Step::Resolved(outcome) => {
            let _ = state_tx.send(ChallengeState::Resolved(outcome));
            match outcome {
                ChallengeOutcome::Rejected => {
                    warn!("Elevation secret rejected; probable cause of command failure");
                    let message = failure_message(output);
                    let _ = out_tx.send(ChannelEvent::Stderr(message.into_bytes()));
                    let _ = handle.send_etx();
                }
                ChallengeOutcome::TimedOut => {
                    warn!("No output before the challenge timeout; probable cause if the command fails");
                }
                ChallengeOutcome::NoChallenge | ChallengeOutcome::Accepted => {}
            }
        }
        Step::Ignore => {}
    }
}
