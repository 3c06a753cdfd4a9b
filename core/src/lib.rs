//! NearLink Core: BLE rendezvous and channel bootstrap.
//!
//! Coordinates the BLE-based rendezvous between nearby devices: one side
//! advertises and serves a small discovery record (peripheral role), the
//! other scans, reads that record, and opens a connection-oriented channel
//! from the endpoint hint inside it (central role). Established channels are
//! handed to the application as [`ChannelSession`]s; what flows over them is
//! not this crate's concern.
//!
//! Platform Bluetooth stacks plug in underneath through the [`BleAdapter`]
//! trait; the coordinator logic is identical on every platform.

pub mod adapter;
pub mod central;
pub mod identity;
pub mod peripheral;
pub mod radio;
pub mod record;
pub mod session;


use std::sync::Arc;
use thiserror::Error;

pub use adapter::{
    AdapterError, BleAdapter, ChannelListener, RawChannel, RecordReadRequest, Sighting,
    DISCOVERY_CHARACTERISTIC_UUID, DISCOVERY_SERVICE_UUID,
};
pub use central::{CentralCoordinator, CentralState, DiscoveredPeripheralRef};
pub use identity::{DeviceIdentity, DeviceType};
pub use peripheral::{PeripheralCoordinator, PeripheralState};
pub use radio::{RadioMonitor, RadioState};
pub use record::{build_record, DiscoveryRecord, EndpointHint, MAX_RECORD_SIZE};
pub use session::{ChannelSession, SessionRole, SessionState};

/// Errors surfaced by the role coordinators.
#[derive(Debug, Error, Clone)]
pub enum CoordinatorError {
    /// The radio is not powered on; the operation was refused without
    /// touching the adapter.
    #[error("Radio unavailable (state: {state})")]
    RadioUnavailable { state: RadioState },

    /// Opening the channel listener failed or its port never resolved.
    #[error("Listener setup failed: {0}")]
    ListenerSetupFailed(String),

    /// Registering the discovery service failed.
    #[error("Service registration failed: {0}")]
    ServiceRegistrationFailed(String),

    /// Starting advertising failed.
    #[error("Advertising failed: {0}")]
    AdvertiseFailed(String),

    /// The platform invalidated the channel listener while advertising.
    #[error("Channel listener lost")]
    ListenerLost,

    /// Starting the scan failed.
    #[error("Scan failed: {0}")]
    ScanFailed(String),

    /// The peripheral handle is from an ended scan session, or the
    /// peripheral is no longer reachable.
    #[error("Peripheral reference is stale")]
    StalePeripheralRef,

    /// Reading the discovery record failed.
    #[error("Record read failed: {0}")]
    ReadFailed(String),

    /// No endpoint hint is known for the peripheral; read its record first.
    #[error("No endpoint hint available")]
    MissingEndpoint,

    /// Opening the connection-oriented channel failed.
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// The session is closed; no further reads or writes are possible.
    #[error("Session closed")]
    SessionClosed,

    /// A discovery record would encode beyond the serveable size bound.
    #[error("Record too large: {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Discovery record bytes did not decode.
    #[error("Invalid discovery record: {0}")]
    InvalidRecord(String),

    /// Transport-level failure reported by the platform adapter.
    #[error("Adapter failure: {0}")]
    Adapter(String),
}

/// Application boundary for rendezvous events.
///
/// Implementations must not block: callbacks are invoked from coordinator
/// tasks and a slow delegate stalls session delivery.
pub trait NearbyDelegate: Send + Sync {
    /// An established channel session, from either role. Invoked in
    /// acceptance order on the peripheral side.
    fn on_session_established(&self, session: ChannelSession, role: SessionRole);

    /// The identity to embed in the discovery record, fetched per read so
    /// display-name changes take effect immediately.
    fn on_record_needed(&self) -> DeviceIdentity;

    /// A radio state transition, forwarded when wired via
    /// [`RadioMonitor::forward_to`].
    fn on_radio_state_changed(&self, state: RadioState);
}

/// Convenience pair of role coordinators sharing one adapter and delegate.
pub struct NearbyCoordinator {
    pub peripheral: PeripheralCoordinator,
    pub central: CentralCoordinator,
    monitor: Arc<RadioMonitor>,
}

impl NearbyCoordinator {
    /// Wire both roles over one adapter. Must be called from within a tokio
    /// runtime; radio transitions are forwarded to the delegate from here on.
    pub fn new(adapter: Arc<dyn BleAdapter>, delegate: Arc<dyn NearbyDelegate>) -> Self {
        let monitor = Arc::new(RadioMonitor::new(adapter.subscribe_radio_state()));
        monitor.forward_to(delegate.clone());
        Self {
            peripheral: PeripheralCoordinator::new(
                adapter.clone(),
                delegate.clone(),
                monitor.clone(),
            ),
            central: CentralCoordinator::new(adapter, delegate, monitor.clone()),
            monitor,
        }
    }

    /// The shared radio monitor.
    pub fn radio(&self) -> &RadioMonitor {
        &self.monitor
    }
}

/// Install the process-wide tracing subscriber.
///
/// Honors `RUST_LOG`; defaults to `info`. Safe to call more than once, later
/// calls are no-ops.
pub fn init_logger() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
