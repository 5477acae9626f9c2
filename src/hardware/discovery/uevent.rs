//! Kernel Uevent Monitor
//!
//! Subscribes to the kernel's `NETLINK_KOBJECT_UEVENT` multicast group and
//! turns every device notification into a [`RawEvent`]. Devices present
//! before the subscription are replayed from sysfs first, so consumers
//! see one continuous stream. After a receive buffer overrun the replay is
//! repeated between markers, letting the consumer drop devices whose
//! `remove` was lost.

use super::sysfs::{ScannerConfig, SysfsScanner};
use crate::domain::{
    attr, Attributes, DeviceEventSource, EventKind, EventSender, EventStream, RawEvent, SourceEvent,
};
use crate::error::{Error, Result};
use netlink_sys::{protocols::NETLINK_KOBJECT_UEVENT, AsyncSocket, AsyncSocketExt, SocketAddr, TokioSocket};
use tracing::{debug, error, info, trace, warn};

// =============================================================================
// Constants
// =============================================================================

/// Multicast group the kernel publishes uevents on
const KERNEL_UEVENT_GROUP: u32 = 1;

/// Header udevd puts on its re-broadcast messages
const LIBUDEV_MAGIC: &[u8] = b"libudev\0";

// =============================================================================
// Wire Format
// =============================================================================

/// Parse one kernel uevent datagram
///
/// The kernel sends `ACTION@DEVPATH` followed by NUL separated `KEY=VALUE`
/// pairs. Returns `Ok(None)` for actions that carry no device change and for
/// udevd re-broadcasts.
pub fn parse_uevent(buf: &[u8]) -> Result<Option<RawEvent>> {
    if buf.starts_with(LIBUDEV_MAGIC) {
        return Ok(None);
    }

    let mut fields = buf
        .split(|b| *b == 0)
        .filter(|f| !f.is_empty())
        .map(String::from_utf8_lossy);

    let header = fields
        .next()
        .ok_or_else(|| Error::MalformedEvent("empty message".into()))?;
    let (action, devpath) = header
        .split_once('@')
        .ok_or_else(|| Error::MalformedEvent(format!("bad header {:?}", header)))?;

    let mut attributes = Attributes::new();
    attributes.insert(attr::ACTION.to_string(), action.to_string());
    attributes.insert(attr::DEVPATH.to_string(), devpath.to_string());
    for field in fields {
        if let Some((key, value)) = field.split_once('=') {
            attributes.insert(key.to_string(), value.to_string());
        }
    }

    let action = attributes
        .get(attr::ACTION)
        .map(String::as_str)
        .unwrap_or(action);
    Ok(EventKind::from_action(action).map(|kind| RawEvent::new(kind, attributes)))
}

// =============================================================================
// Uevent Monitor
// =============================================================================

/// Device event source backed by the kernel uevent netlink socket
#[derive(Debug, Clone)]
pub struct UeventMonitor {
    scanner: SysfsScanner,
    buffer: usize,
}

impl UeventMonitor {
    /// Create a monitor reading sysfs under `config.sysfs_path`
    pub fn new(config: ScannerConfig, buffer: usize) -> Self {
        Self {
            scanner: SysfsScanner::new(config),
            buffer,
        }
    }
}

impl DeviceEventSource for UeventMonitor {
    fn subscribe(self) -> Result<EventStream> {
        let socket = open_socket()?;
        let (tx, stream) = EventStream::channel(self.buffer);
        info!("Subscribed to kernel uevents");

        tokio::spawn(run_monitor(socket, self.scanner, tx));
        Ok(stream)
    }
}

fn open_socket() -> Result<TokioSocket> {
    let unavailable = |e: std::io::Error| Error::SourceUnavailable {
        reason: format!("uevent netlink socket: {}", e),
    };

    let mut socket = TokioSocket::new(NETLINK_KOBJECT_UEVENT).map_err(unavailable)?;
    socket
        .socket_mut()
        .bind(&SocketAddr::new(0, KERNEL_UEVENT_GROUP))
        .map_err(unavailable)?;
    Ok(socket)
}

/// Replay sysfs, then forward live events until the consumer goes away
async fn run_monitor(mut socket: TokioSocket, scanner: SysfsScanner, tx: EventSender) {
    if replay(&scanner, &tx).await.is_err() {
        return;
    }

    loop {
        match socket.recv_from_full().await {
            Ok((buf, addr)) => {
                // Only trust the kernel
                if addr.port_number() != 0 {
                    continue;
                }
                let mut event = match parse_uevent(&buf) {
                    Ok(Some(event)) => event,
                    Ok(None) => continue,
                    Err(e) => {
                        debug!("Skipping uevent: {}", e);
                        continue;
                    }
                };
                if event.kind != EventKind::Remove {
                    scanner.enrich(&mut event.attributes);
                }
                trace!(
                    "uevent {} {}",
                    event.kind,
                    event.get(attr::DEVPATH).unwrap_or_default()
                );
                if tx.send(event.into()).await.is_err() {
                    debug!("Uevent consumer closed");
                    return;
                }
            }
            Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                warn!("Kernel uevent buffer overrun, resyncing from sysfs");
                if replay(&scanner, &tx).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                error!("Uevent socket failed: {}", e);
                return;
            }
        }
    }
}

/// Send an `Add` for every device present in sysfs, between replay markers
///
/// A failed scan sends nothing so the consumer keeps its current view.
async fn replay(scanner: &SysfsScanner, tx: &EventSender) -> std::result::Result<(), ()> {
    let scan = {
        let scanner = scanner.clone();
        tokio::task::spawn_blocking(move || scanner.scan()).await
    };
    let events = match scan {
        Ok(Ok(events)) => events,
        Ok(Err(e)) => {
            warn!("Sysfs scan failed: {}", e);
            return Ok(());
        }
        Err(e) => {
            warn!("Sysfs scan task failed: {}", e);
            return Ok(());
        }
    };

    debug!("Replaying {} devices from sysfs", events.len());
    tx.send(SourceEvent::ReplayStarted).await.map_err(|_| ())?;
    for event in events {
        tx.send(event.into()).await.map_err(|_| ())?;
    }
    tx.send(SourceEvent::ReplayFinished).await.map_err(|_| ())
}
