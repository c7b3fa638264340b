//! Interrupt forwarding
//!
//! The bridge keeps weak references to the sessions it has seen, so it never
//! keeps a session alive and forgets it once it is closed or dropped. Each
//! session's own pending-channel set is the only registry consulted.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::connection::{Session, SessionInner};
use crate::config::DEFAULT_INTERRUPT_GRACE_MS;

/// Forwards interrupts into open channels
#[derive(Debug)]
pub struct CancellationBridge {
    sessions: Mutex<Vec<Weak<SessionInner>>>,
    grace: Duration,
}

impl Default for CancellationBridge {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_INTERRUPT_GRACE_MS))
    }
}

impl CancellationBridge {
    /// Create a bridge that force-closes sessions `grace` after interrupting
    pub fn new(grace: Duration) -> Self {
        Self {
            sessions: Mutex::new(Vec::new()),
            grace,
        }
    }

    /// Grace period between the interrupt and the forced close
    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Start following `session`
    ///
    /// The connection manager calls this for every session it opens and for
    /// every caller-supplied session it is handed, so a session built with
    /// [`Session::new`] is followed from its first use. Tracking twice is a
    /// no-op.
    pub fn track(&self, session: &Session) {
        let mut sessions = self.lock();
        sessions.retain(|weak| weak.upgrade().is_some_and(|inner| !inner.is_closed()));
        if !sessions
            .iter()
            .any(|weak| weak.upgrade().is_some_and(|inner| inner.id() == session.id()))
        {
            sessions.push(Arc::downgrade(&session.inner));
        }
    }

    /// Sessions still open
    pub fn sessions(&self) -> Vec<Session> {
        let mut sessions = self.lock();
        let mut live = Vec::with_capacity(sessions.len());
        sessions.retain(|weak| match weak.upgrade() {
            Some(inner) if !inner.is_closed() => {
                live.push(Session { inner });
                true
            }
            _ => false,
        });
        live
    }

    /// Interrupt every channel of every open session
    pub async fn interrupt_all(&self) {
        let sessions = self.sessions();
        info!("Interrupting {} session(s)", sessions.len());
        join_all(sessions.iter().map(|session| self.interrupt(session))).await;
    }

    /// Interrupt every channel open on `session`
    ///
    /// Each channel gets a protocol signal and an ETX byte. Channels still
    /// open after the grace period take the session down with them, whether
    /// or not their output has been read. Returns whether the session had to
    /// be closed.
    pub async fn interrupt(&self, session: &Session) -> bool {
        let pending = session.pending_snapshot();
        if pending.is_empty() {
            return false;
        }

        for (id, channel) in &pending {
            debug!(
                "session {} channel {}: interrupting {:?}",
                session.id(),
                id,
                channel.command
            );
            if let Err(e) = channel.handle.interrupt() {
                debug!("signal delivery failed: {}", e);
            }
            if let Err(e) = channel.handle.send_etx() {
                debug!("ETX delivery failed: {}", e);
            }
        }

        sleep(self.grace).await;

        let survivors = pending
            .iter()
            .filter(|(id, channel)| session.is_pending(*id) && !channel.handle.is_closed())
            .count();
        if survivors == 0 {
            return false;
        }

        warn!(
            "{} channel(s) on session {} ignored the interrupt, closing the session",
            survivors,
            session.id()
        );
        session.close().await;
        true
    }

    /// Forward Ctrl+C into open channels until the returned task is aborted
    pub fn listen(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for interrupts: {}", e);
                    return;
                }
                self.interrupt_all().await;
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Weak<SessionInner>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
