//! Discovery record construction and parsing.
//!
//! The discovery record is the bounded-size byte blob a discoverable device
//! serves over its read characteristic: the local identity plus the endpoint
//! hints a scanner needs to open a connection-oriented channel. Encoding must
//! be byte-exact across platforms, so both sides use the same bincode layout.

use crate::identity::DeviceIdentity;
use crate::CoordinatorError;
use serde::{Deserialize, Serialize};

/// Upper bound for an encoded discovery record in bytes.
///
/// This is the BLE read payload limit shared by both roles; a record that
/// encodes larger than this cannot be served in a single characteristic read.
pub const MAX_RECORD_SIZE: usize = 512;

/// Connection endpoint advertised inside a discovery record.
///
/// `address` may be `None`: on some platforms the peer's physical address is
/// resolved from the transport-level connection established during the record
/// read, not from the record itself. Consumers must not assume the address is
/// present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointHint {
    /// Optional peer address; empty when the platform resolves it out-of-band.
    pub address: Option<String>,
    /// Connection-oriented channel port (PSM).
    pub port: u32,
}

impl EndpointHint {
    /// Hint carrying only a port, with the address resolved out-of-band.
    pub fn for_port(port: u32) -> Self {
        Self {
            address: None,
            port,
        }
    }

    /// Hint carrying both an explicit address and a port.
    pub fn with_address(address: impl Into<String>, port: u32) -> Self {
        Self {
            address: Some(address.into()),
            port,
        }
    }
}

/// The discovery metadata served to scanners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRecord {
    /// Identity of the advertising device.
    pub identity: DeviceIdentity,
    /// Endpoint hints, in preference order. May be empty while the local
    /// listener has not yet obtained its port.
    pub hints: Vec<EndpointHint>,
}

impl DiscoveryRecord {
    /// Create a new discovery record.
    pub fn new(identity: DeviceIdentity, hints: Vec<EndpointHint>) -> Self {
        Self { identity, hints }
    }

    /// Encode this record to its wire form. See [`build_record`].
    pub fn encode(&self) -> Result<Vec<u8>, CoordinatorError> {
        build_record(&self.identity, &self.hints)
    }

    /// Decode a record from its wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self, CoordinatorError> {
        bincode::deserialize(bytes).map_err(|e| CoordinatorError::InvalidRecord(e.to_string()))
    }

    /// The first usable endpoint hint, if any.
    pub fn primary_hint(&self) -> Option<&EndpointHint> {
        self.hints.first()
    }
}

/// Build the discovery record bytes for `identity` and `hints`.
///
/// Pure and deterministic: identical inputs always produce byte-identical
/// output. Fails with [`CoordinatorError::PayloadTooLarge`] when the encoding
/// exceeds [`MAX_RECORD_SIZE`], producing no partial output; the caller
/// decides whether to truncate the display name or drop optional hints.
pub fn build_record(
    identity: &DeviceIdentity,
    hints: &[EndpointHint],
) -> Result<Vec<u8>, CoordinatorError> {
    let record = DiscoveryRecord {
        identity: identity.clone(),
        hints: hints.to_vec(),
    };

    let bytes =
        bincode::serialize(&record).map_err(|e| CoordinatorError::InvalidRecord(e.to_string()))?;

    if bytes.len() > MAX_RECORD_SIZE {
        return Err(CoordinatorError::PayloadTooLarge {
            size: bytes.len(),
            limit: MAX_RECORD_SIZE,
        });
    }

    Ok(bytes)
}
