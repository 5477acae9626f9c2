//! Device Domain Types
//!
//! Raw device bus events, classified devices and the allocatable slots
//! advertised to the kubelet.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// =============================================================================
// Attributes
// =============================================================================

/// Free-form key/value attributes reported for a device
pub type Attributes = BTreeMap<String, String>;

/// Well-known attribute names
pub mod attr {
    pub const ACTION: &str = "ACTION";
    pub const SUBSYSTEM: &str = "SUBSYSTEM";
    pub const DEVPATH: &str = "DEVPATH";
    pub const DEVPATH_OLD: &str = "DEVPATH_OLD";
    pub const DEVNAME: &str = "DEVNAME";
    pub const DEVTYPE: &str = "DEVTYPE";
    pub const DRIVER: &str = "DRIVER";
    pub const SEQNUM: &str = "SEQNUM";
    pub const ID_VENDOR_ID: &str = "ID_VENDOR_ID";
    pub const ID_MODEL_ID: &str = "ID_MODEL_ID";
    pub const ID_VENDOR: &str = "ID_VENDOR";
    pub const ID_MODEL: &str = "ID_MODEL";
    pub const ID_SERIAL: &str = "ID_SERIAL";
}

// =============================================================================
// Raw Events
// =============================================================================

/// Kind of change reported by the device bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Add,
    Remove,
    Change,
}

impl EventKind {
    /// Map a kernel uevent action onto an event kind
    pub fn from_action(action: &str) -> Option<Self> {
        match action {
            "add" => Some(EventKind::Add),
            "remove" => Some(EventKind::Remove),
            "change" | "move" | "bind" | "unbind" | "online" | "offline" => {
                Some(EventKind::Change)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Add => "add",
            EventKind::Remove => "remove",
            EventKind::Change => "change",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An unclassified notification from the device bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: EventKind,
    pub attributes: Attributes,
}

impl RawEvent {
    pub fn new(kind: EventKind, attributes: Attributes) -> Self {
        Self { kind, attributes }
    }

    /// Look up an attribute; empty values count as absent
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Stable identity of the device this event refers to
    pub fn device_id(&self) -> Option<DeviceId> {
        let subsystem = self.get(attr::SUBSYSTEM)?;
        let devpath = self.get(attr::DEVPATH)?;
        Some(DeviceId::derive(subsystem, devpath))
    }

    /// Identity the device had before a `move`
    pub fn previous_device_id(&self) -> Option<DeviceId> {
        let subsystem = self.get(attr::SUBSYSTEM)?;
        let devpath = self.get(attr::DEVPATH_OLD)?;
        Some(DeviceId::derive(subsystem, devpath))
    }
}

// =============================================================================
// Device Identity
// =============================================================================

/// Stable device identifier
///
/// Derived from the subsystem and the sysfs device path, i.e. the bus
/// topology the device hangs off. Replaying or rescanning the bus for the
/// same physical device always yields the same id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the id for a device at `devpath` in `subsystem`
    pub fn derive(subsystem: &str, devpath: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(subsystem.as_bytes());
        hasher.update(b"\0");
        hasher.update(hardware_path(subsystem, devpath).as_bytes());
        let hex = hasher.finalize().to_hex();
        Self(format!("{}-{}", subsystem, &hex.as_str()[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Hardware part of a sysfs device path
///
/// Only layouts with exactly one class device per USB interface lose the
/// kernel assigned name, so renumbering (`ttyUSB0` becoming `ttyUSB1`)
/// keeps the id:
///
/// - usb-serial ports, `<iface>/<name>/<subsystem>/<name>`
/// - CDC ACM ports, `<iface>/tty/ttyACM<n>`
///
/// Every other path is kept whole. Several class devices may share one
/// parent (`drm/card0` and `drm/renderD128`, the `serial8250` ports) and
/// only their name tells them apart.
pub fn hardware_path<'a>(subsystem: &str, devpath: &'a str) -> &'a str {
    let path = devpath.trim_end_matches('/');
    if path.starts_with("/devices/virtual/") {
        return path;
    }
    let Some((rest, name)) = path.rsplit_once('/') else {
        return path;
    };
    let Some((parent, class)) = rest.rsplit_once('/') else {
        return path;
    };
    if class != subsystem || parent.is_empty() {
        return path;
    }
    match parent.rsplit_once('/') {
        Some((iface, port)) if port == name && !iface.is_empty() => iface,
        _ if subsystem == "tty" && is_acm_name(name) => parent,
        _ => path,
    }
}

fn is_acm_name(name: &str) -> bool {
    name.strip_prefix("ttyACM")
        .map(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Health
// =============================================================================

/// Health as reported to the kubelet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Health {
    Healthy,
    Unhealthy,
}

impl Health {
    /// Wire value used by the device plugin API
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Healthy => "Healthy",
            Health::Unhealthy => "Unhealthy",
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, Health::Healthy)
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Device
// =============================================================================

/// A classified device belonging to exactly one pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: DeviceId,
    pub pool: String,
    pub attributes: Attributes,
    pub health: Health,
}

impl Device {
    /// Absolute path of the device node, e.g. `/dev/ttyUSB0`
    pub fn devnode(&self) -> Option<String> {
        let name = self
            .attributes
            .get(attr::DEVNAME)
            .filter(|v| !v.is_empty())?;
        Some(devnode_path(name))
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// Turn a kernel `DEVNAME` into an absolute `/dev` path
pub fn devnode_path(devname: &str) -> String {
    if devname.starts_with('/') {
        devname.to_string()
    } else {
        format!("/dev/{}", devname)
    }
}

// =============================================================================
// Slots
// =============================================================================

/// How many workloads may hold a device at the same time
///
/// Written as `exclusive` or as a count in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "AccessRepr", into = "AccessRepr")]
pub enum Access {
    /// One workload per device
    #[default]
    Exclusive,
    /// Up to `n` workloads per device
    Shared(u8),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum AccessRepr {
    Named(String),
    Count(u64),
}

impl TryFrom<AccessRepr> for Access {
    type Error = String;

    fn try_from(repr: AccessRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            AccessRepr::Named(name) if name == "exclusive" => Ok(Access::Exclusive),
            AccessRepr::Named(name) => Err(format!(
                "unknown access mode {:?}, expected \"exclusive\" or a count",
                name
            )),
            AccessRepr::Count(0) => Err("shared access count must be at least 1".to_string()),
            AccessRepr::Count(1) => Ok(Access::Exclusive),
            AccessRepr::Count(n) => u8::try_from(n)
                .map(Access::Shared)
                .map_err(|_| format!("shared access count {} exceeds 255", n)),
        }
    }
}

impl From<Access> for AccessRepr {
    fn from(access: Access) -> Self {
        match access {
            Access::Exclusive => AccessRepr::Named("exclusive".to_string()),
            Access::Shared(n) => AccessRepr::Count(u64::from(n)),
        }
    }
}

impl Access {
    /// Ids of the slots a device exposes
    pub fn slot_ids(&self, device: &DeviceId) -> Vec<String> {
        match self {
            Access::Exclusive => vec![device.to_string()],
            Access::Shared(n) => (0..*n).map(|i| format!("{}:{}", device, i)).collect(),
        }
    }
}

/// One allocatable unit advertised to the kubelet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    pub id: String,
    pub device_id: DeviceId,
    pub health: Health,
    pub reserved: bool,
}
