//! Session ownership and connection management
//!
//! A [`Target`] names either credentials to connect with or a session the
//! caller already holds. [`ConnectionManager::connect`] resolves it into a
//! [`Lease`]: engine-owned leases close their session on release, caller-owned
//! leases never do.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::cancel::CancellationBridge;
use super::channel::ChannelHandle;
use super::config::Credentials;
use super::transport::{Connector, FileTransfer, Transport};
use crate::error::Result;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Where an operation runs: fresh credentials or an already-open session
#[derive(Debug, Clone)]
pub enum Target {
    /// Connect with these credentials for the duration of the operation
    Credentials(Credentials),
    /// Reuse a session the caller keeps ownership of
    Session(Session),
}

impl From<Credentials> for Target {
    fn from(credentials: Credentials) -> Self {
        Target::Credentials(credentials)
    }
}

impl From<&Credentials> for Target {
    fn from(credentials: &Credentials) -> Self {
        Target::Credentials(credentials.clone())
    }
}

impl From<Session> for Target {
    fn from(session: Session) -> Self {
        Target::Session(session)
    }
}

impl From<&Session> for Target {
    fn from(session: &Session) -> Self {
        Target::Session(session.clone())
    }
}

/// A channel currently open on a session
#[derive(Debug, Clone)]
pub(crate) struct PendingChannel {
    pub(crate) command: String,
    pub(crate) handle: ChannelHandle,
}

pub(crate) struct SessionInner {
    id: u64,
    credentials: Credentials,
    transport: Arc<dyn Transport>,
    file_transfer: OnceCell<Arc<dyn FileTransfer>>,
    pending: Mutex<HashMap<u64, PendingChannel>>,
    next_channel: AtomicU64,
    closed: AtomicBool,
}

/// Handle to an authenticated connection
///
/// Cloning is cheap; clones refer to the same connection.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

impl Session {
    /// Wrap an authenticated transport
    pub fn new(credentials: Credentials, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
                credentials,
                transport,
                file_transfer: OnceCell::new(),
                pending: Mutex::new(HashMap::new()),
                next_channel: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Process-unique session id
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Credentials the session was opened with
    pub fn credentials(&self) -> &Credentials {
        &self.inner.credentials
    }

    /// Whether [`Session::close`] has run
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// The session's file-transfer sub-channel, opened on first use
    pub async fn file_transfer(&self) -> Result<Arc<dyn FileTransfer>> {
        let transport = Arc::clone(&self.inner.transport);
        self.inner
            .file_transfer
            .get_or_try_init(|| async move { transport.open_file_transfer().await })
            .await
            .cloned()
    }

    /// Ids of channels currently open on this session
    pub fn pending_channels(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.pending().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn pending_snapshot(&self) -> Vec<(u64, PendingChannel)> {
        self.pending()
            .iter()
            .map(|(id, channel)| (*id, channel.clone()))
            .collect()
    }

    pub(crate) fn is_pending(&self, channel_id: u64) -> bool {
        self.pending().contains_key(&channel_id)
    }

    pub(crate) fn register(&self, command: &str, handle: ChannelHandle) -> Registration {
        let id = self.inner.next_channel.fetch_add(1, Ordering::Relaxed);
        self.pending().insert(
            id,
            PendingChannel {
                command: command.to_string(),
                handle,
            },
        );
        debug!("session {} channel {} opened: {}", self.inner.id, id, command);
        Registration {
            session: Arc::clone(&self.inner),
            channel_id: id,
            released: false,
        }
    }

    /// Disconnect; channels still open on the session are closed with it
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pending: Vec<PendingChannel> = self.pending().drain().map(|(_, c)| c).collect();
        for channel in pending {
            channel.handle.close();
        }
        self.inner.transport.disconnect().await;
        info!(
            "session {} to {} closed",
            self.inner.id,
            self.inner.credentials.label()
        );
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, PendingChannel>> {
        self.inner.pending_lock()
    }
}

impl SessionInner {
    fn pending_lock(&self) -> MutexGuard<'_, HashMap<u64, PendingChannel>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("target", &self.inner.credentials.label())
            .field("closed", &self.is_closed())
            .field("pending", &self.pending_channels())
            .finish()
    }
}

/// Membership of one channel in its session's pending set
///
/// Dropping or releasing it removes the channel from the set.
pub(crate) struct Registration {
    session: Arc<SessionInner>,
    channel_id: u64,
    released: bool,
}

impl Registration {
    pub(crate) fn channel_id(&self) -> u64 {
        self.channel_id
    }

    pub(crate) fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.session.pending_lock().remove(&self.channel_id);
            debug!(
                "session {} channel {} closed",
                self.session.id, self.channel_id
            );
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.release();
    }
}

/// Who closes a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Opened by the engine for one operation; closed when it finishes
    Engine,
    /// Supplied by the caller; never closed by the engine
    Caller,
}

/// A session resolved for the duration of one operation
#[derive(Debug)]
pub struct Lease {
    session: Session,
    ownership: Ownership,
}

impl Lease {
    /// The leased session
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Who owns the session
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// End the operation, closing the session if the engine opened it
    pub async fn release(self) {
        if self.ownership == Ownership::Engine {
            self.session.close().await;
        }
    }
}

impl Deref for Lease {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

/// Opens or reuses sessions
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    bridge: Arc<CancellationBridge>,
}

impl ConnectionManager {
    /// Create a manager that connects through `connector` and registers every
    /// session it opens with `bridge`
    pub fn new(connector: Arc<dyn Connector>, bridge: Arc<CancellationBridge>) -> Self {
        Self { connector, bridge }
    }

    /// Open a session the caller will own
    pub async fn open(&self, credentials: &Credentials) -> Result<Session> {
        credentials.resolve_username()?;
        let transport = self.connector.connect(credentials).await?;
        let session = Session::new(credentials.clone(), transport);
        self.bridge.track(&session);
        Ok(session)
    }

    /// Resolve a target into a lease
    ///
    /// A session target is handed back as caller-owned and starts being
    /// followed by the bridge, wherever it was built; credentials are
    /// validated and connected, yielding an engine-owned lease.
    pub async fn connect(&self, target: Target) -> Result<Lease> {
        match target {
            Target::Session(session) => {
                debug!("reusing session {}", session.id());
                self.bridge.track(&session);
                Ok(Lease {
                    session,
                    ownership: Ownership::Caller,
                })
            }
            Target::Credentials(credentials) => {
                let session = self.open(&credentials).await?;
                Ok(Lease {
                    session,
                    ownership: Ownership::Engine,
                })
            }
        }
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager").finish_non_exhaustive()
    }
}
