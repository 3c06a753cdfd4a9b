//! Local device identity advertised to scanners.
//!
//! The identity is supplied by the application layer and stays immutable for
//! the process lifetime. It is embedded into every discovery record.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse device class, surfaced to remote peers for display purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    Mobile,
    Tablet,
    Desktop,
    Tv,
    Watch,
    Unknown,
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Unknown
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Mobile => write!(f, "Mobile"),
            DeviceType::Tablet => write!(f, "Tablet"),
            DeviceType::Desktop => write!(f, "Desktop"),
            DeviceType::Tv => write!(f, "Tv"),
            DeviceType::Watch => write!(f, "Watch"),
            DeviceType::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Identity of the local device as seen by remote scanners.
///
/// `id` is an opaque, stable identifier (typically a UUID string assigned at
/// install time); `name` is the human-readable display name shown in peer
/// pickers on the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Opaque stable identifier, unique per device installation.
    pub id: String,
    /// Human-readable display name.
    pub name: String,
    /// Device class for remote display.
    pub device_type: DeviceType,
}

impl DeviceIdentity {
    /// Create a new device identity.
    pub fn new(id: impl Into<String>, name: impl Into<String>, device_type: DeviceType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            device_type,
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}
