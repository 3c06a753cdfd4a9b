//! Bluetooth radio readiness monitoring.
//!
//! The radio's state is driven solely by the OS and observed, never
//! requested. The monitor gates both role coordinators: any radio-touching
//! operation must see `PoweredOn` first, and state-change events always
//! supersede the last-known value.

use crate::{CoordinatorError, NearbyDelegate};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// State of the local Bluetooth adapter, as reported by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RadioState {
    /// State not yet reported.
    Unknown,
    /// Radio is off.
    PoweredOff,
    /// Radio is on and usable.
    PoweredOn,
    /// The application is not authorized to use Bluetooth.
    Unauthorized,
    /// The device has no usable Bluetooth radio.
    Unsupported,
    /// The OS Bluetooth stack is restarting.
    Resetting,
}

impl RadioState {
    /// Whether radio-touching operations may proceed.
    pub fn is_powered_on(&self) -> bool {
        *self == RadioState::PoweredOn
    }
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RadioState::Unknown => write!(f, "unknown"),
            RadioState::PoweredOff => write!(f, "poweredOff"),
            RadioState::PoweredOn => write!(f, "poweredOn"),
            RadioState::Unauthorized => write!(f, "unauthorized"),
            RadioState::Unsupported => write!(f, "unsupported"),
            RadioState::Resetting => write!(f, "resetting"),
        }
    }
}

/// Observes the adapter-reported radio state and gates coordinator
/// operations on it.
///
/// Transitions are delivered in the order the OS reports them and observed
/// at-most-once per transition (intermediate states may be coalesced if the
/// observer lags). The monitor never retries on behalf of callers; an
/// operation refused with [`CoordinatorError::RadioUnavailable`] must wait
/// for a transition back to `PoweredOn`.
pub struct RadioMonitor {
    rx: watch::Receiver<RadioState>,
    forward_task: Mutex<Option<JoinHandle<()>>>,
}

impl RadioMonitor {
    /// Create a monitor over the adapter's state-change stream.
    pub fn new(rx: watch::Receiver<RadioState>) -> Self {
        Self {
            rx,
            forward_task: Mutex::new(None),
        }
    }

    /// The last-known radio state.
    pub fn current(&self) -> RadioState {
        *self.rx.borrow()
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<RadioState> {
        self.rx.clone()
    }

    /// Refuse with `RadioUnavailable` unless the radio is powered on.
    pub fn ensure_powered_on(&self) -> Result<(), CoordinatorError> {
        let state = self.current();
        if state.is_powered_on() {
            Ok(())
        } else {
            Err(CoordinatorError::RadioUnavailable { state })
        }
    }

    /// Forward every observed transition to the application boundary.
    ///
    /// Must be called from within a tokio runtime. Replaces any previous
    /// forwarding task. Wire this once per process; the forwarded events are
    /// for UI/status purposes only.
    pub fn forward_to(&self, delegate: Arc<dyn NearbyDelegate>) {
        let mut rx = self.rx.clone();
        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                tracing::debug!(%state, "radio state changed");
                delegate.on_radio_state_changed(state);
            }
        });

        if let Some(previous) = self.forward_task.lock().replace(task) {
            previous.abort();
        }
    }
}

impl Drop for RadioMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.forward_task.lock().take() {
            task.abort();
        }
    }
}
