//! Channel session handed to the application layer.
//!
//! A session wraps exactly one established connection-oriented channel,
//! regardless of which role created it, behind a uniform read/write/close
//! contract. The coordinator that negotiated the channel keeps no reference
//! after handing the session over.

use crate::adapter::RawChannel;
use crate::CoordinatorError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// Which side negotiated the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionRole {
    /// Accepted by the advertising/listening side.
    Peripheral,
    /// Opened by the scanning/initiating side.
    Central,
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionRole::Peripheral => write!(f, "peripheral"),
            SessionRole::Central => write!(f, "central"),
        }
    }
}

/// Session lifecycle state. Transitions open→closed exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Open,
    Closed,
}

struct SessionInner {
    channel: Box<dyn RawChannel>,
    // Flipped on close; pending reads and writes race against it.
    closed: watch::Sender<bool>,
    released: AtomicBool,
}

/// One established bidirectional byte stream.
///
/// Cloning yields handles to the same underlying channel. The stream is full
/// duplex: a pending `read` never blocks a concurrent `write`, and `close`
/// cancels any suspended read or write promptly. The channel itself is
/// released exactly once, on the first close (explicit or after a transport
/// failure). The session performs no implicit flush or retry; retry policy
/// belongs to the application layer.
#[derive(Clone)]
pub struct ChannelSession {
    id: Uuid,
    role: SessionRole,
    inner: Arc<SessionInner>,
}

impl ChannelSession {
    pub(crate) fn new(role: SessionRole, channel: Box<dyn RawChannel>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            role,
            inner: Arc::new(SessionInner {
                channel,
                closed,
                released: AtomicBool::new(false),
            }),
        }
    }

    /// Correlation identifier for logging.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Which side negotiated this session.
    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        if *self.inner.closed.borrow() {
            SessionState::Closed
        } else {
            SessionState::Open
        }
    }

    /// Read the next chunk of bytes from the channel.
    ///
    /// A transport failure closes the session; this call surfaces the
    /// failure and subsequent calls fail with `SessionClosed`. A concurrent
    /// `close()` cancels a pending read with `SessionClosed`.
    pub async fn read(&self) -> Result<Vec<u8>, CoordinatorError> {
        let mut closed = self.inner.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(CoordinatorError::SessionClosed);
        }

        tokio::select! {
            result = self.inner.channel.read() => match result {
                Ok(data) => Ok(data),
                Err(error) => {
                    tracing::debug!(session = %self.id, %error, "transport failed during read");
                    self.release().await;
                    Err(CoordinatorError::Adapter(error.to_string()))
                }
            },
            // The guard returned by `wait_for` is not `Send`; drop it inside
            // the block so the whole future stays spawnable.
            _ = async { let _ = closed.wait_for(|c| *c).await; } => Err(CoordinatorError::SessionClosed),
        }
    }

    /// Write bytes to the channel.
    ///
    /// A transport failure closes the session; this call surfaces the
    /// failure and subsequent calls fail with `SessionClosed`. A concurrent
    /// `close()` cancels a pending write with `SessionClosed`.
    pub async fn write(&self, data: &[u8]) -> Result<(), CoordinatorError> {
        let mut closed = self.inner.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(CoordinatorError::SessionClosed);
        }

        tokio::select! {
            result = self.inner.channel.write(data) => match result {
                Ok(()) => Ok(()),
                Err(error) => {
                    tracing::debug!(session = %self.id, %error, "transport failed during write");
                    self.release().await;
                    Err(CoordinatorError::Adapter(error.to_string()))
                }
            },
            _ = async { let _ = closed.wait_for(|c| *c).await; } => Err(CoordinatorError::SessionClosed),
        }
    }

    /// Close the session and release the underlying transport.
    ///
    /// Idempotent: the transport is released exactly once no matter how many
    /// times, or from how many contexts, close is invoked. Pending reads and
    /// writes on other handles complete with `SessionClosed`.
    pub async fn close(&self) {
        if self.release().await {
            tracing::debug!(session = %self.id, role = %self.role, "session closed");
        }
    }

    /// Flip to closed and release the transport. Returns whether this call
    /// was the one that performed the release.
    async fn release(&self) -> bool {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        // Cancel pending reads/writes before touching the transport, so the
        // channel's own close is not stuck behind them.
        self.inner.closed.send_replace(true);
        self.inner.channel.close().await;
        true
    }
}

impl fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSession")
            .field("id", &self.id)
            .field("role", &self.role)
            .finish()
    }
}
