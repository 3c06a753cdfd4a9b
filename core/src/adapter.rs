//! Platform BLE adapter boundary.
//!
//! The coordinator core never talks to OS Bluetooth primitives directly. It
//! is polymorphic over the capability traits defined here; platform glue
//! (Android/iOS/Windows Bluetooth stacks) implements them and the same
//! coordinator logic runs unmodified everywhere.

use crate::radio::RadioState;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

/// Discovery service identifier, shared by both roles on every platform.
pub const DISCOVERY_SERVICE_UUID: Uuid = Uuid::from_u128(0x68D6_0EB2_8AAA_4D72_8851_BD6D_64E1_69B7);

/// Read characteristic serving the discovery record, shared by both roles.
pub const DISCOVERY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0BEB_F3FE_9A5E_4ED1_8157_7628_1B3F_0DA5);

/// Errors reported by a platform adapter.
#[derive(Error, Debug, Clone)]
pub enum AdapterError {
    #[error("Listener setup failed: {0}")]
    Listener(String),
    #[error("Listener is no longer valid")]
    ListenerInvalid,
    #[error("Service registration failed: {0}")]
    Service(String),
    #[error("Advertising failed: {0}")]
    Advertise(String),
    #[error("Scan failed: {0}")]
    Scan(String),
    #[error("Peripheral not found: {0}")]
    PeripheralNotFound(String),
    #[error("Record read failed: {0}")]
    Read(String),
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Channel closed")]
    ChannelClosed,
    #[error("I/O failure: {0}")]
    Io(String),
}

/// One scan report for a nearby peripheral.
///
/// The same peripheral is reported repeatedly across sightings; deduplication
/// is the central coordinator's job, not the adapter's.
#[derive(Debug, Clone)]
pub struct Sighting {
    /// Platform identifier for the sighted peripheral. Only valid within the
    /// scan session that produced it.
    pub peripheral_id: String,
    /// Discovery record bytes, when the platform delivered them with the
    /// sighting (e.g. from a cached characteristic read).
    pub record_bytes: Option<Vec<u8>>,
}

/// A pending discovery-record read from a remote central.
///
/// The responder is answered with the current record bytes once they are
/// available; dropping it fails the read on the remote side.
#[derive(Debug)]
pub struct RecordReadRequest {
    pub responder: oneshot::Sender<Vec<u8>>,
}

/// A raw connection-oriented channel (L2CAP) as handed over by the platform.
///
/// The stream is full duplex: implementations own their interior locking and
/// must keep the read and write paths independently serialized, so a pending
/// `read` never blocks a concurrent `write` or `close`.
#[async_trait]
pub trait RawChannel: Send + Sync {
    /// Read the next chunk of bytes. Returns [`AdapterError::ChannelClosed`]
    /// when the peer has closed the channel.
    async fn read(&self) -> Result<Vec<u8>, AdapterError>;

    /// Write bytes to the channel.
    async fn write(&self, data: &[u8]) -> Result<(), AdapterError>;

    /// Release the underlying transport resource.
    async fn close(&self);
}

/// A listening connection-oriented channel endpoint.
#[async_trait]
pub trait ChannelListener: Send + Sync {
    /// The listener's assigned port (PSM). Platforms assign the port
    /// asynchronously, so the value starts as `None` and resolves once
    /// known.
    fn port(&self) -> watch::Receiver<Option<u32>>;

    /// Wait for the next incoming channel. Returns
    /// [`AdapterError::ListenerInvalid`] when the listener itself has been
    /// torn down; other errors are per-connection and recoverable.
    async fn accept(&self) -> Result<Box<dyn RawChannel>, AdapterError>;

    /// Stop listening and release the endpoint.
    async fn close(&self);
}

/// Capability set the platform glue provides to the coordinator core.
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Current adapter-reported radio state.
    fn radio_state(&self) -> RadioState;

    /// State-change notification stream for the radio.
    fn subscribe_radio_state(&self) -> watch::Receiver<RadioState>;

    /// Open a connection-oriented channel listener.
    async fn listen_for_channel(&self) -> Result<Arc<dyn ChannelListener>, AdapterError>;

    /// Register the discovery service and its read characteristic. Incoming
    /// read requests are delivered on the returned stream.
    async fn register_discovery_service(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<mpsc::Receiver<RecordReadRequest>, AdapterError>;

    /// Tear down the discovery service.
    async fn unregister_discovery_service(&self);

    /// Begin advertising the discovery service.
    async fn start_advertising(&self, service: Uuid) -> Result<(), AdapterError>;

    /// Stop advertising.
    async fn stop_advertising(&self);

    /// Start scanning for peripherals advertising the discovery service.
    /// Sightings arrive on the returned stream until [`Self::stop_scan`].
    async fn scan(&self) -> Result<mpsc::Receiver<Sighting>, AdapterError>;

    /// Halt the current scan.
    async fn stop_scan(&self);

    /// Read the discovery record of a sighted peripheral.
    async fn read_record(&self, peripheral_id: &str) -> Result<Vec<u8>, AdapterError>;

    /// Open a connection-oriented channel to a peripheral's advertised port.
    ///
    /// `address` is the hint-supplied peer address when present; when absent
    /// the platform resolves the peer from the transport-level connection
    /// context established during the earlier record read.
    async fn open_channel(
        &self,
        peripheral_id: &str,
        address: Option<&str>,
        port: u32,
    ) -> Result<Box<dyn RawChannel>, AdapterError>;
}
