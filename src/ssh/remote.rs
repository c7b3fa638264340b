//! russh-backed transport
//!
//! Connects and authenticates with russh, and pumps each exec channel on its
//! own task so callers see a plain event stream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::keys::PrivateKeyWithHashAlg;
use russh::{Channel, ChannelMsg};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info};

use super::config::Credentials;
use super::handler::SshHandler;
use super::sftp::SftpFileTransfer;
use super::transport::{
    ChannelControl, ChannelEvent, Connector, FileTransfer, RawChannel, Transport,
};
use crate::config::DEFAULT_CONNECT_TIMEOUT_SECS;
use crate::error::{Result, SshError};

/// Opens russh connections
#[derive(Debug, Clone)]
pub struct RusshConnector {
    connect_timeout: Duration,
}

impl RusshConnector {
    /// Create a connector with the given connection timeout
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for RusshConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
    }
}

#[async_trait]
impl Connector for RusshConnector {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn Transport>> {
        let username = credentials.resolve_username()?;
        info!(
            "Connecting to SSH server {}:{}...",
            credentials.host, credentials.port
        );

        let handler = match credentials.host_fingerprint {
            Some(ref fingerprint) => SshHandler::pinned(fingerprint),
            None => SshHandler::new(),
        };

        let ssh_config = Arc::new(client::Config::default());
        let connect_result = timeout(
            self.connect_timeout,
            client::connect(
                ssh_config,
                (credentials.host.as_str(), credentials.port),
                handler,
            ),
        )
        .await;

        let mut session = match connect_result {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                error!("SSH connection failed: {}", e);
                return Err(SshError::connect(e.to_string()));
            }
            Err(_) => {
                error!(
                    "SSH connection timeout after {}s",
                    self.connect_timeout.as_secs()
                );
                return Err(SshError::connect(format!(
                    "Connection timeout after {}s",
                    self.connect_timeout.as_secs()
                )));
            }
        };

        authenticate(&mut session, username, credentials).await?;

        info!(
            "Successfully connected to {}@{}:{}",
            username, credentials.host, credentials.port
        );

        Ok(Arc::new(RusshTransport {
            handle: Mutex::new(Some(session)),
        }))
    }
}

/// Authenticate with the SSH server, password first, then key
async fn authenticate(
    session: &mut Handle<SshHandler>,
    username: &str,
    credentials: &Credentials,
) -> Result<()> {
    if let Some(ref password) = credentials.password {
        debug!("Attempting password authentication for user '{}'", username);
        let auth_result = session
            .authenticate_password(username, password)
            .await
            .map_err(|e| SshError::connect(e.to_string()))?;

        if auth_result.success() {
            info!("Password authentication successful");
            return Ok(());
        }
        if credentials.private_key.is_none() {
            return Err(SshError::connect("Password authentication rejected"));
        }
        debug!("Password rejected, falling back to key authentication");
    }

    if let Some(ref key_content) = credentials.private_key {
        debug!("Attempting key authentication for user '{}'", username);

        let key = russh::keys::decode_secret_key(key_content, credentials.passphrase.as_deref())
            .map_err(|e| SshError::config(format!("Failed to parse private key: {}", e)))?;

        let hash_alg = session
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        let auth_result = session
            .authenticate_publickey(username, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
            .await
            .map_err(|e| SshError::connect(e.to_string()))?;

        if auth_result.success() {
            info!("Key authentication successful");
            return Ok(());
        }
        return Err(SshError::connect("Key authentication rejected"));
    }

    Err(SshError::config(
        "No authentication method available (require password or private_key)",
    ))
}

/// An authenticated russh connection
pub struct RusshTransport {
    handle: Mutex<Option<Handle<SshHandler>>>,
}

impl RusshTransport {
    async fn open_session_channel(&self) -> Result<Channel<Msg>> {
        let guard = self.handle.lock().await;
        let handle = guard
            .as_ref()
            .ok_or_else(|| SshError::connect("SSH connection closed"))?;

        handle
            .channel_open_session()
            .await
            .map_err(|e| SshError::exec(e.to_string()))
    }
}

#[async_trait]
impl Transport for RusshTransport {
    async fn open_exec(&self, command: &str, pty: bool) -> Result<RawChannel> {
        let channel = self.open_session_channel().await?;

        if pty {
            channel
                .request_pty(true, "xterm", 80, 24, 0, 0, &[])
                .await
                .map_err(|e| SshError::exec(format!("Failed to request PTY: {}", e)))?;
        }

        channel
            .exec(true, command)
            .await
            .map_err(|e| SshError::exec(format!("Failed to exec command: {}", e)))?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(channel, event_tx, control_rx));

        Ok(RawChannel {
            events: event_rx,
            control: control_tx,
        })
    }

    async fn open_file_transfer(&self) -> Result<Arc<dyn FileTransfer>> {
        let channel = self.open_session_channel().await?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| SshError::exec(format!("Failed to request sftp subsystem: {}", e)))?;
        let sftp = SftpFileTransfer::open(channel).await?;
        Ok(Arc::new(sftp))
    }

    async fn disconnect(&self) {
        let mut guard = self.handle.lock().await;
        if let Some(session) = guard.take() {
            let _ = session
                .disconnect(russh::Disconnect::ByApplication, "", "")
                .await;
            info!("SSH connection closed");
        }
    }
}

/// Relay one channel between russh and the engine until it closes.
async fn pump(
    mut channel: Channel<Msg>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    mut control: mpsc::UnboundedReceiver<ChannelControl>,
) {
    let mut control_open = true;

    loop {
        tokio::select! {
            msg = channel.wait() => {
                let Some(event) = translate(msg) else {
                    continue;
                };
                let closed = event == ChannelEvent::Closed;
                let _ = events.send(event);
                if closed {
                    return;
                }
            }
            request = control.recv(), if control_open => {
                let outcome = match request {
                    Some(ChannelControl::Write(data)) => channel.data(data.as_slice()).await,
                    Some(ChannelControl::Interrupt) => channel.signal(russh::Sig::INT).await,
                    Some(ChannelControl::Eof) => channel.eof().await,
                    Some(ChannelControl::Close) => channel.close().await,
                    None => {
                        // Handle dropped: nobody reads the output any more.
                        control_open = false;
                        channel.close().await
                    }
                };
                if let Err(e) = outcome {
                    debug!("Channel control request failed: {}", e);
                }
            }
        }
    }
}

fn translate(msg: Option<ChannelMsg>) -> Option<ChannelEvent> {
    match msg {
        Some(ChannelMsg::Data { data }) => Some(ChannelEvent::Stdout(data.to_vec())),
        Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
            Some(ChannelEvent::Stderr(data.to_vec()))
        }
        Some(ChannelMsg::ExtendedData { data, .. }) => Some(ChannelEvent::Stdout(data.to_vec())),
        Some(ChannelMsg::ExitStatus { exit_status }) => Some(ChannelEvent::ExitStatus(exit_status)),
        Some(ChannelMsg::Close) | None => Some(ChannelEvent::Closed),
        Some(_) => None,
    }
}
