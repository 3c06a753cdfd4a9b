//! Central role coordinator.
//!
//! Owns the "I look for others and initiate connections" side: the scan
//! session, the per-session arena of discovered peripherals, record reads,
//! and opening connection-oriented channels from endpoint hints.

use crate::adapter::{AdapterError, BleAdapter, Sighting};
use crate::radio::{RadioMonitor, RadioState};
use crate::record::DiscoveryRecord;
use crate::session::{ChannelSession, SessionRole};
use crate::{CoordinatorError, NearbyDelegate};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Central coordinator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CentralState {
    Idle,
    Scanning,
}

/// A peripheral sighted during the current scan session.
///
/// The handle is only valid for the scan session that produced it; once that
/// session ends every operation taking the handle fails with
/// [`CoordinatorError::StalePeripheralRef`].
#[derive(Debug, Clone)]
pub struct DiscoveredPeripheralRef {
    /// Platform identifier for the peripheral.
    pub peripheral_id: String,
    /// Most recently seen discovery record, when one has been obtained.
    pub record: Option<DiscoveryRecord>,
    generation: u64,
}

#[derive(Default)]
struct ScanLifecycle {
    scan_task: Option<JoinHandle<()>>,
}

/// The scanning/initiating side of a rendezvous.
pub struct CentralCoordinator {
    adapter: Arc<dyn BleAdapter>,
    delegate: Arc<dyn NearbyDelegate>,
    monitor: Arc<RadioMonitor>,
    state: Arc<RwLock<CentralState>>,
    lifecycle: Mutex<ScanLifecycle>,
    arena: Arc<RwLock<HashMap<String, DiscoveredPeripheralRef>>>,
    // Bumped when a scan session starts or ends; refs from other generations
    // are stale.
    generation: Arc<AtomicU64>,
}

impl CentralCoordinator {
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        delegate: Arc<dyn NearbyDelegate>,
        monitor: Arc<RadioMonitor>,
    ) -> Self {
        Self {
            adapter,
            delegate,
            monitor,
            state: Arc::new(RwLock::new(CentralState::Idle)),
            lifecycle: Mutex::new(ScanLifecycle::default()),
            arena: Arc::new(RwLock::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CentralState {
        *self.state.read()
    }

    /// Begin a scan session for nearby discoverable devices.
    ///
    /// Opens a fresh arena; handles from any previous session become stale.
    /// Calling while already scanning is a no-op.
    pub async fn start_scanning(&self) -> Result<(), CoordinatorError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if *self.state.read() == CentralState::Scanning {
            return Ok(());
        }

        self.monitor.ensure_powered_on()?;

        let sightings = self
            .adapter
            .scan()
            .await
            .map_err(|e| CoordinatorError::ScanFailed(e.to_string()))?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.arena.write().clear();

        lifecycle.scan_task = Some(tokio::spawn(collect_sightings(
            sightings,
            self.arena.clone(),
            generation,
        )));
        *self.state.write() = CentralState::Scanning;
        tracing::info!(generation, "scan session started");
        Ok(())
    }

    /// End the current scan session. Idempotent; all handles from the session
    /// become stale.
    pub async fn stop_scanning(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if *self.state.read() == CentralState::Idle {
            return;
        }

        if let Some(task) = lifecycle.scan_task.take() {
            task.abort();
        }
        self.adapter.stop_scan().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.state.write() = CentralState::Idle;
        tracing::info!("scan session stopped");
    }

    /// Snapshot of the current scan session's discoveries, one entry per
    /// peripheral.
    pub fn peripherals(&self) -> Vec<DiscoveredPeripheralRef> {
        self.arena.read().values().cloned().collect()
    }

    /// Fetch the discovery record of a sighted peripheral.
    ///
    /// Also refreshes the arena entry, so a later [`Self::connect`] can use
    /// the obtained endpoint hint.
    pub async fn read_record(
        &self,
        peripheral: &DiscoveredPeripheralRef,
    ) -> Result<DiscoveryRecord, CoordinatorError> {
        self.ensure_fresh(peripheral)?;
        self.monitor.ensure_powered_on()?;

        let bytes = self
            .adapter
            .read_record(&peripheral.peripheral_id)
            .await
            .map_err(|error| match error {
                AdapterError::PeripheralNotFound(_) => CoordinatorError::StalePeripheralRef,
                other => CoordinatorError::ReadFailed(other.to_string()),
            })?;

        let record = DiscoveryRecord::decode(&bytes)?;
        tracing::debug!(
            peripheral = %peripheral.peripheral_id,
            device = %record.identity,
            "discovery record read"
        );

        let mut arena = self.arena.write();
        if let Some(entry) = arena.get_mut(&peripheral.peripheral_id) {
            entry.record = Some(record.clone());
        }
        Ok(record)
    }

    /// Open a connection-oriented channel to a discovered peripheral using
    /// its endpoint hint.
    ///
    /// The established session is handed to the application boundary exactly
    /// as accepted sessions are on the peripheral side, and also returned to
    /// the caller. A radio loss during the handshake cancels the attempt.
    pub async fn connect(
        &self,
        peripheral: &DiscoveredPeripheralRef,
    ) -> Result<ChannelSession, CoordinatorError> {
        self.ensure_fresh(peripheral)?;
        self.monitor.ensure_powered_on()?;

        // Prefer the freshest record in the arena over the caller's snapshot.
        let record = {
            let arena = self.arena.read();
            arena
                .get(&peripheral.peripheral_id)
                .and_then(|entry| entry.record.clone())
                .or_else(|| peripheral.record.clone())
        };
        let hint = record
            .as_ref()
            .and_then(|r| r.primary_hint())
            .cloned()
            .ok_or(CoordinatorError::MissingEndpoint)?;

        tracing::info!(
            peripheral = %peripheral.peripheral_id,
            port = hint.port,
            "opening channel"
        );

        let opened = tokio::select! {
            result = self.adapter.open_channel(
                &peripheral.peripheral_id,
                hint.address.as_deref(),
                hint.port,
            ) => result,
            _ = radio_lost(self.monitor.subscribe()) => {
                tracing::warn!(
                    peripheral = %peripheral.peripheral_id,
                    "radio lost during channel handshake"
                );
                return Err(CoordinatorError::RadioUnavailable {
                    state: self.monitor.current(),
                });
            }
        };

        let raw = opened.map_err(|error| match error {
            AdapterError::PeripheralNotFound(_) => CoordinatorError::StalePeripheralRef,
            other => CoordinatorError::ConnectFailed(other.to_string()),
        })?;

        let session = ChannelSession::new(SessionRole::Central, raw);
        tracing::info!(session = %session.id(), "outgoing channel established");
        self.delegate
            .on_session_established(session.clone(), SessionRole::Central);
        Ok(session)
    }

    fn ensure_fresh(&self, peripheral: &DiscoveredPeripheralRef) -> Result<(), CoordinatorError> {
        if peripheral.generation != self.generation.load(Ordering::SeqCst)
            || *self.state.read() != CentralState::Scanning
        {
            return Err(CoordinatorError::StalePeripheralRef);
        }
        Ok(())
    }
}

/// Fold the adapter's sighting stream into the arena.
///
/// Repeated sightings of the same peripheral collapse into one entry that
/// keeps the most recent record.
async fn collect_sightings(
    mut sightings: tokio::sync::mpsc::Receiver<Sighting>,
    arena: Arc<RwLock<HashMap<String, DiscoveredPeripheralRef>>>,
    generation: u64,
) {
    while let Some(sighting) = sightings.recv().await {
        let record = sighting
            .record_bytes
            .as_deref()
            .and_then(|bytes| match DiscoveryRecord::decode(bytes) {
                Ok(record) => Some(record),
                Err(error) => {
                    tracing::warn!(
                        peripheral = %sighting.peripheral_id,
                        %error,
                        "discarding malformed discovery record"
                    );
                    None
                }
            });

        let mut arena = arena.write();
        match arena.get_mut(&sighting.peripheral_id) {
            Some(entry) => {
                if record.is_some() {
                    entry.record = record;
                }
            }
            None => {
                tracing::debug!(peripheral = %sighting.peripheral_id, "peripheral sighted");
                arena.insert(
                    sighting.peripheral_id.clone(),
                    DiscoveredPeripheralRef {
                        peripheral_id: sighting.peripheral_id,
                        record,
                        generation,
                    },
                );
            }
        }
    }
}

/// Resolves when the radio leaves `PoweredOn`. Never resolves otherwise.
async fn radio_lost(mut rx: watch::Receiver<RadioState>) {
    loop {
        if !rx.borrow_and_update().is_powered_on() {
            return;
        }
        if rx.changed().await.is_err() {
            // The adapter dropped its state stream; nothing more to observe.
            std::future::pending::<()>().await;
        }
    }
}
