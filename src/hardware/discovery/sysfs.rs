//! Sysfs Scanner
//!
//! Enumerates devices already present at startup and enriches device bus
//! events with identification attributes read from the device's sysfs
//! ancestors (USB vendor/product ids, serial numbers, PCI ids).

use crate::domain::{attr, Attributes, EventKind, RawEvent};
use crate::error::{Error, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

// =============================================================================
// Scanner Configuration
// =============================================================================

/// Configuration for the sysfs scanner
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Path to sysfs (for testing)
    pub sysfs_path: PathBuf,
    /// Only enumerate devices that have a device node
    pub require_devnode: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            sysfs_path: PathBuf::from("/sys"),
            require_devnode: true,
        }
    }
}

/// Sysfs attribute file and the event attribute it feeds
struct AttributeSource {
    file: &'static str,
    key: &'static str,
    hex_prefixed: bool,
}

/// Identification attributes collected from the device and its parents
const IDENTIFYING_ATTRIBUTES: &[AttributeSource] = &[
    // USB devices
    AttributeSource { file: "idVendor", key: attr::ID_VENDOR_ID, hex_prefixed: false },
    AttributeSource { file: "idProduct", key: attr::ID_MODEL_ID, hex_prefixed: false },
    AttributeSource { file: "serial", key: attr::ID_SERIAL, hex_prefixed: false },
    AttributeSource { file: "manufacturer", key: attr::ID_VENDOR, hex_prefixed: false },
    AttributeSource { file: "product", key: attr::ID_MODEL, hex_prefixed: false },
    AttributeSource { file: "bInterfaceNumber", key: "ID_USB_INTERFACE_NUM", hex_prefixed: false },
    // PCI devices: "0x10de"
    AttributeSource { file: "vendor", key: attr::ID_VENDOR_ID, hex_prefixed: true },
    AttributeSource { file: "device", key: attr::ID_MODEL_ID, hex_prefixed: true },
    // SCSI / ATA disks
    AttributeSource { file: "vendor", key: attr::ID_VENDOR, hex_prefixed: false },
    AttributeSource { file: "model", key: attr::ID_MODEL, hex_prefixed: false },
];

// =============================================================================
// Sysfs Scanner
// =============================================================================

/// Reads device state from sysfs
#[derive(Debug, Clone)]
pub struct SysfsScanner {
    config: ScannerConfig,
}

impl SysfsScanner {
    /// Create a new sysfs scanner
    pub fn new(config: ScannerConfig) -> Self {
        Self { config }
    }

    /// Create a scanner rooted at `/sys`
    pub fn default_scanner() -> Self {
        Self::new(ScannerConfig::default())
    }

    /// Enumerate every device currently present as an `Add` event
    ///
    /// Walks `class/*/*` and `bus/*/devices/*`, deduplicated by their
    /// canonical location under `devices/`.
    pub fn scan(&self) -> Result<Vec<RawEvent>> {
        let devices_root = self.devices_root()?;
        let mut seen = HashSet::new();
        let mut events = Vec::new();

        for link in self.candidate_links() {
            let Ok(target) = fs::canonicalize(&link) else {
                continue;
            };
            if !target.starts_with(&devices_root) || !seen.insert(target.clone()) {
                continue;
            }
            let Some(devpath) = self.devpath_of(&target) else {
                continue;
            };
            if let Some(mut attributes) = self.read_device(&devpath) {
                if self.config.require_devnode && !attributes.contains_key(attr::DEVNAME) {
                    continue;
                }
                self.enrich(&mut attributes);
                events.push(RawEvent::new(EventKind::Add, attributes));
            }
        }

        events.sort_by(|a, b| a.get(attr::DEVPATH).cmp(&b.get(attr::DEVPATH)));
        info!("Sysfs scan found {} devices", events.len());
        Ok(events)
    }

    /// Read a device's own `uevent` attributes
    pub fn read_device(&self, devpath: &str) -> Option<Attributes> {
        let dir = self.sys_dir(devpath);
        let uevent = fs::read_to_string(dir.join("uevent")).ok()?;

        let mut attributes = parse_uevent_file(&uevent);
        attributes.insert(attr::DEVPATH.to_string(), devpath.to_string());
        attributes.insert(attr::ACTION.to_string(), EventKind::Add.as_str().to_string());
        if let Some(subsystem) = link_name(&dir.join("subsystem")) {
            attributes.insert(attr::SUBSYSTEM.to_string(), subsystem);
        }
        Some(attributes)
    }

    /// Fill in identification attributes from the device and its parents
    ///
    /// The nearest ancestor wins and attributes already present are never
    /// overwritten. Missing files are skipped.
    pub fn enrich(&self, attributes: &mut Attributes) {
        let Some(devpath) = attributes.get(attr::DEVPATH).cloned() else {
            return;
        };
        let root = self.config.sysfs_path.join("devices");
        let mut dir = self.sys_dir(&devpath);

        while dir.starts_with(&root) && dir != root {
            for source in IDENTIFYING_ATTRIBUTES {
                if attributes.contains_key(source.key) {
                    continue;
                }
                if let Some(value) = read_attribute(&dir.join(source.file)) {
                    match (source.hex_prefixed, value.strip_prefix("0x")) {
                        (true, Some(hex)) => {
                            attributes.insert(source.key.to_string(), hex.to_string());
                        }
                        (false, None) => {
                            attributes.insert(source.key.to_string(), value);
                        }
                        _ => {}
                    }
                }
            }
            if !attributes.contains_key(attr::DRIVER) {
                if let Some(driver) = link_name(&dir.join("driver")) {
                    attributes.insert(attr::DRIVER.to_string(), driver);
                }
            }
            if !dir.pop() {
                break;
            }
        }
    }

    fn devices_root(&self) -> Result<PathBuf> {
        let root = self.config.sysfs_path.join("devices");
        fs::canonicalize(&root).map_err(|e| Error::SourceUnavailable {
            reason: format!("cannot read {}: {}", root.display(), e),
        })
    }

    fn candidate_links(&self) -> Vec<PathBuf> {
        let mut links = Vec::new();
        for class in read_dir_paths(&self.config.sysfs_path.join("class")) {
            links.extend(read_dir_paths(&class));
        }
        for bus in read_dir_paths(&self.config.sysfs_path.join("bus")) {
            links.extend(read_dir_paths(&bus.join("devices")));
        }
        debug!("Sysfs scan considering {} entries", links.len());
        links
    }

    fn devpath_of(&self, canonical: &Path) -> Option<String> {
        let sysfs = fs::canonicalize(&self.config.sysfs_path).ok()?;
        let relative = canonical.strip_prefix(&sysfs).ok()?;
        Some(format!("/{}", relative.to_string_lossy()))
    }

    fn sys_dir(&self, devpath: &str) -> PathBuf {
        self.config.sysfs_path.join(devpath.trim_start_matches('/'))
    }
}

/// Parse the `KEY=VALUE` lines of a sysfs `uevent` file
pub fn parse_uevent_file(content: &str) -> Attributes {
    content
        .lines()
        .filter_map(|line| line.split_once('='))
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

fn read_dir_paths(dir: &Path) -> Vec<PathBuf> {
    match fs::read_dir(dir) {
        Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
        Err(_) => Vec::new(),
    }
}

/// Read a regular attribute file; symlinks, directories and blanks are skipped
fn read_attribute(path: &Path) -> Option<String> {
    let meta = fs::symlink_metadata(path).ok()?;
    if !meta.is_file() {
        return None;
    }
    let value = fs::read_to_string(path).ok()?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn link_name(path: &Path) -> Option<String> {
    let target = fs::read_link(path).ok()?;
    Some(target.file_name()?.to_string_lossy().into_owned())
}
