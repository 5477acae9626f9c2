//! Main Allocation Engine
//!
//! Turns kubelet allocation requests into reserved slots and the container
//! runtime instructions that expose the backing device nodes. Reservations
//! go through the registry; every grant is kept as an [`Allocation`] record
//! until it is released.

use crate::config::{AgentConfig, MountConfig, PoolConfig};
use crate::domain::{Device, DeviceId, Slot};
use crate::error::{Error, Result};
use crate::hardware::registry::DeviceRegistry;
use crate::metrics::{AgentMetrics, Outcome};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Requests and Grants
// =============================================================================

/// Request for one container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationRequest {
    /// Number of slots wanted when no ids are given
    pub count: usize,
    /// Exact slot ids chosen by the kubelet
    pub slot_ids: Vec<String>,
}

impl AllocationRequest {
    pub fn count(count: usize) -> Self {
        Self {
            count,
            slot_ids: Vec::new(),
        }
    }

    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let slot_ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        Self {
            count: slot_ids.len(),
            slot_ids,
        }
    }
}

/// A device node exposed to a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceNode {
    pub host_path: String,
    pub container_path: String,
    pub permissions: String,
}

/// Runtime instructions for one container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerGrant {
    pub envs: BTreeMap<String, String>,
    pub devices: Vec<DeviceNode>,
    pub mounts: Vec<MountConfig>,
}

// =============================================================================
// Allocation Record
// =============================================================================

/// Record of an allocation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    /// Allocation ID
    pub id: String,
    /// Pool the slots belong to
    pub pool: String,
    /// Reserved slots
    pub slot_ids: Vec<String>,
    /// Devices behind the slots, without duplicates
    pub device_ids: Vec<DeviceId>,
    /// What the container runtime was told
    pub grant: ContainerGrant,
    /// Timestamp
    pub allocated_at: DateTime<Utc>,
}

// =============================================================================
// Device Allocator
// =============================================================================

/// Reserves slots and records grants
pub struct DeviceAllocator {
    /// Pool settings keyed by name
    pools: BTreeMap<String, PoolConfig>,
    registry: Arc<DeviceRegistry>,
    metrics: AgentMetrics,
    /// Active allocations
    allocations: DashMap<String, Allocation>,
    /// Allocation counter for generating IDs
    allocation_counter: AtomicU64,
}

impl std::fmt::Debug for DeviceAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceAllocator")
            .field("pools", &self.pools.keys().collect::<Vec<_>>())
            .field("allocations", &self.allocations.len())
            .finish()
    }
}

impl DeviceAllocator {
    /// Create a new allocator
    pub fn new(
        config: &AgentConfig,
        registry: Arc<DeviceRegistry>,
        metrics: AgentMetrics,
    ) -> Arc<Self> {
        Arc::new(Self {
            pools: config
                .pools
                .iter()
                .map(|p| (p.name.clone(), p.clone()))
                .collect(),
            registry,
            metrics,
            allocations: DashMap::new(),
            allocation_counter: AtomicU64::new(0),
        })
    }

    /// Generate a unique allocation ID
    fn generate_allocation_id(&self) -> String {
        let counter = self.allocation_counter.fetch_add(1, Ordering::SeqCst);
        format!("alloc-{:016x}", counter)
    }

    /// Allocate for every container of one kubelet request
    ///
    /// All containers succeed or none do: reservations made for earlier
    /// containers are rolled back when a later one fails.
    pub fn allocate(&self, pool: &str, requests: &[AllocationRequest]) -> Result<Vec<Allocation>> {
        let config = self.pools.get(pool).ok_or_else(|| Error::UnknownPool {
            pool: pool.to_string(),
        })?;

        let result = self.reserve_all(pool, requests).and_then(|reserved| {
            let grants = reserved
                .iter()
                .map(|(_, slots)| self.translate(config, slots))
                .collect::<Result<Vec<_>>>();
            if grants.is_err() {
                self.rollback(&reserved);
            }
            grants.map(|grants| (reserved, grants))
        });

        for _ in requests {
            self.metrics.record_allocation(pool, Outcome::from(&result));
        }

        let (reserved, grants) = result.map_err(|e| {
            warn!(pool = %pool, "Allocation failed: {}", e);
            e
        })?;

        let allocations: Vec<Allocation> = reserved
            .into_iter()
            .zip(grants)
            .map(|((id, slots), (device_ids, grant))| {
                let allocation = Allocation {
                    id,
                    pool: pool.to_string(),
                    slot_ids: slots.into_iter().map(|s| s.id).collect(),
                    device_ids,
                    grant,
                    allocated_at: Utc::now(),
                };
                info!(
                    pool = %pool,
                    allocation = %allocation.id,
                    "Allocated slots {}",
                    allocation.slot_ids.join(",")
                );
                self.allocations
                    .insert(allocation.id.clone(), allocation.clone());
                allocation
            })
            .collect();

        Ok(allocations)
    }

    /// Reserve each container's slots under a fresh allocation id
    fn reserve_all(
        &self,
        pool: &str,
        requests: &[AllocationRequest],
    ) -> Result<Vec<(String, Vec<Slot>)>> {
        let mut reserved: Vec<(String, Vec<Slot>)> = Vec::with_capacity(requests.len());
        for request in requests {
            let id = self.generate_allocation_id();
            let attempt = if request.slot_ids.is_empty() {
                self.registry.try_reserve_for(pool, request.count, &id)
            } else {
                self.registry.try_reserve_ids_for(pool, &request.slot_ids, &id)
            };
            match attempt {
                Ok(slots) => reserved.push((id, slots)),
                Err(e) => {
                    self.rollback(&reserved);
                    return Err(e);
                }
            }
        }
        Ok(reserved)
    }

    fn rollback(&self, reserved: &[(String, Vec<Slot>)]) {
        let released: usize = reserved
            .iter()
            .map(|(owner, slots)| {
                let ids: Vec<String> = slots.iter().map(|s| s.id.clone()).collect();
                self.registry.release_owned(owner, &ids)
            })
            .sum();
        if released > 0 {
            debug!("Rolled back {} reservations", released);
        }
    }

    /// Build the runtime instructions for one container's slots
    fn translate(&self, config: &PoolConfig, slots: &[Slot]) -> Result<(Vec<DeviceId>, ContainerGrant)> {
        let mut seen = BTreeSet::new();
        let mut devices: Vec<Device> = Vec::new();
        for slot in slots {
            if !seen.insert(slot.device_id.clone()) {
                continue;
            }
            let device = self
                .registry
                .device_for_slot(&config.name, &slot.id)
                .ok_or_else(|| Error::DevicesUnavailable {
                    pool: config.name.clone(),
                    ids: vec![slot.id.clone()],
                })?;
            devices.push(device);
        }

        let mut nodes = Vec::with_capacity(devices.len());
        for device in &devices {
            let host_path = device.devnode().ok_or_else(|| Error::DevicesUnavailable {
                pool: config.name.clone(),
                ids: vec![device.id.to_string()],
            })?;
            nodes.push(DeviceNode {
                container_path: container_path(config, &host_path),
                host_path,
                permissions: config.permissions.clone(),
            });
        }

        let env_var = config.env_var();
        let mut envs = BTreeMap::new();
        envs.insert(
            env_var.clone(),
            nodes
                .iter()
                .map(|n| n.container_path.as_str())
                .collect::<Vec<_>>()
                .join(","),
        );
        envs.insert(
            format!("{}_IDS", env_var),
            slots.iter().map(|s| s.id.as_str()).collect::<Vec<_>>().join(","),
        );

        let grant = ContainerGrant {
            envs,
            devices: nodes,
            mounts: config.mounts.clone(),
        };
        Ok((devices.into_iter().map(|d| d.id).collect(), grant))
    }

    // -------------------------------------------------------------------------
    // Records
    // -------------------------------------------------------------------------

    /// Get an allocation by ID
    pub fn get(&self, id: &str) -> Option<Allocation> {
        self.allocations.get(id).map(|a| a.value().clone())
    }

    /// All active allocations, oldest first
    pub fn list(&self) -> Vec<Allocation> {
        let mut all: Vec<Allocation> = self.allocations.iter().map(|a| a.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Release an allocation and its reservations
    pub fn release(&self, id: &str) -> Result<Allocation> {
        let (_, allocation) = self
            .allocations
            .remove(id)
            .ok_or_else(|| Error::AllocationNotFound { id: id.to_string() })?;

        let released = self.registry.release_owned(id, &allocation.slot_ids);
        info!(
            pool = %allocation.pool,
            allocation = %id,
            "Released allocation ({} slots)",
            released
        );
        Ok(allocation)
    }

    /// Release every reservation of a pool, recorded or adopted
    pub fn release_pool(&self, pool: &str) -> Result<usize> {
        let reserved: Vec<String> = self
            .registry
            .snapshot(pool)?
            .into_iter()
            .filter(|s| s.reserved)
            .map(|s| s.id)
            .collect();

        let released = self.registry.release(&reserved);
        self.allocations.retain(|_, a| a.pool != pool);
        info!(pool = %pool, "Released {} slots", released);
        Ok(released)
    }

    /// Drop records that no longer hold any of their slots
    ///
    /// A slot reserved again by another allocation does not keep the old
    /// record alive.
    pub fn prune(&self, pool: &str) -> Result<usize> {
        let owners = self.registry.owners(pool)?;

        let before = self.allocations.len();
        self.allocations.retain(|_, a| {
            a.pool != pool
                || a
                    .slot_ids
                    .iter()
                    .any(|slot| owners.get(slot) == Some(&a.id))
        });
        Ok(before.saturating_sub(self.allocations.len()))
    }
}

/// Container side path of a device node
fn container_path(config: &PoolConfig, host_path: &str) -> String {
    match &config.container_path_prefix {
        Some(prefix) => {
            let relative = host_path.strip_prefix("/dev/").unwrap_or(host_path);
            format!(
                "{}/{}",
                prefix.trim_end_matches('/'),
                relative.trim_start_matches('/')
            )
        }
        None => host_path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigFormat;
    use crate::domain::{attr, Attributes, Health};
    use crate::hardware::registry::DeviceEvent;
    use assert_matches::assert_matches;

    const CONFIG: &str = r#"
pools:
  - name: serial
    permissions: rw
    envVar: SERIAL_PORTS
    mounts:
      - hostPath: /run/udev
        containerPath: /run/udev
        readOnly: true
  - name: coral
    access: 2
    permissions: rwm
    containerPathPrefix: /dev/accel
"#;

    fn setup() -> (Arc<DeviceRegistry>, Arc<DeviceAllocator>) {
        let config = AgentConfig::parse(CONFIG, ConfigFormat::Yaml).unwrap();
        let registry = DeviceRegistry::from_config(&config);
        let allocator =
            DeviceAllocator::new(&config, registry.clone(), AgentMetrics::detached().unwrap());
        (registry, allocator)
    }

    fn add(registry: &DeviceRegistry, pool: &str, id: &str, devname: &str) {
        let mut attributes = Attributes::new();
        attributes.insert(attr::DEVNAME.into(), devname.into());
        registry.apply(DeviceEvent::Add(Device {
            id: DeviceId::new(id),
            pool: pool.to_string(),
            attributes,
            health: Health::Healthy,
        }));
    }

    #[test]
    fn test_allocate_translates_devices() {
        let (registry, allocator) = setup();
        add(&registry, "serial", "tty-a", "ttyUSB0");
        add(&registry, "serial", "tty-b", "ttyUSB1");

        let allocations = allocator
            .allocate("serial", &[AllocationRequest::ids(["tty-b"])])
            .unwrap();
        assert_eq!(allocations.len(), 1);

        let grant = &allocations[0].grant;
        assert_eq!(
            grant.devices,
            vec![DeviceNode {
                host_path: "/dev/ttyUSB1".into(),
                container_path: "/dev/ttyUSB1".into(),
                permissions: "rw".into(),
            }]
        );
        assert_eq!(grant.envs["SERIAL_PORTS"], "/dev/ttyUSB1");
        assert_eq!(grant.envs["SERIAL_PORTS_IDS"], "tty-b");
        assert_eq!(grant.mounts.len(), 1);
        assert!(grant.mounts[0].read_only);

        assert!(allocations[0].id.starts_with("alloc-"));
        assert!(allocator.get(&allocations[0].id).is_some());
    }

    #[test]
    fn test_shared_slots_and_prefix() {
        let (registry, allocator) = setup();
        add(&registry, "coral", "usb-a", "bus/usb/001/004");

        let allocations = allocator
            .allocate("coral", &[AllocationRequest::count(2)])
            .unwrap();
        let allocation = &allocations[0];

        // Both slots of one device expose a single node
        assert_eq!(allocation.slot_ids.len(), 2);
        assert_eq!(allocation.device_ids, vec![DeviceId::new("usb-a")]);
        assert_eq!(allocation.grant.devices.len(), 1);
        assert_eq!(allocation.grant.devices[0].host_path, "/dev/bus/usb/001/004");
        assert_eq!(
            allocation.grant.devices[0].container_path,
            "/dev/accel/bus/usb/001/004"
        );
        assert_eq!(allocation.grant.envs["UDEV_CORAL_DEVICES"], "/dev/accel/bus/usb/001/004");
    }

    #[test]
    fn test_multi_container_rollback() {
        let (registry, allocator) = setup();
        add(&registry, "serial", "tty-a", "ttyUSB0");
        add(&registry, "serial", "tty-b", "ttyUSB1");

        let result = allocator.allocate(
            "serial",
            &[AllocationRequest::count(1), AllocationRequest::count(2)],
        );
        assert_matches!(
            result,
            Err(Error::InsufficientDevices { requested: 2, available: 1, .. })
        );

        // First container's reservation was rolled back
        assert!(registry.snapshot("serial").unwrap().iter().all(|s| !s.reserved));
        assert!(allocator.list().is_empty());
    }

    #[test]
    fn test_unknown_pool_and_busy_ids() {
        let (registry, allocator) = setup();
        add(&registry, "serial", "tty-a", "ttyUSB0");

        assert_matches!(
            allocator.allocate("gpu", &[AllocationRequest::count(1)]),
            Err(Error::UnknownPool { .. })
        );

        allocator
            .allocate("serial", &[AllocationRequest::ids(["tty-a"])])
            .unwrap();
        assert_matches!(
            allocator.allocate("serial", &[AllocationRequest::ids(["tty-a"])]),
            Err(Error::DevicesUnavailable { ids, .. }) if ids == vec!["tty-a".to_string()]
        );
    }

    #[test]
    fn test_release() {
        let (registry, allocator) = setup();
        add(&registry, "serial", "tty-a", "ttyUSB0");

        let id = allocator
            .allocate("serial", &[AllocationRequest::count(1)])
            .unwrap()
            .remove(0)
            .id;

        let released = allocator.release(&id).unwrap();
        assert_eq!(released.slot_ids, vec!["tty-a".to_string()]);
        assert!(!registry.snapshot("serial").unwrap()[0].reserved);
        assert_matches!(allocator.release(&id), Err(Error::AllocationNotFound { .. }));
    }

    #[test]
    fn test_reclaimed_slot_not_released_by_stale_record() {
        let (registry, allocator) = setup();
        add(&registry, "serial", "tty-a", "ttyUSB0");

        let first = allocator
            .allocate("serial", &[AllocationRequest::count(1)])
            .unwrap()
            .remove(0);

        // The reconciler reclaims the slot and the kubelet grants it again
        registry
            .reconcile_reservations("serial", &BTreeSet::new(), std::time::Duration::ZERO)
            .unwrap();
        let second = allocator
            .allocate("serial", &[AllocationRequest::count(1)])
            .unwrap()
            .remove(0);
        assert_eq!(second.slot_ids, first.slot_ids);

        assert_eq!(allocator.prune("serial").unwrap(), 1);
        assert!(allocator.get(&first.id).is_none());
        assert!(allocator.get(&second.id).is_some());
        assert_matches!(allocator.release(&first.id), Err(Error::AllocationNotFound { .. }));

        assert!(registry.snapshot("serial").unwrap()[0].reserved);
        assert_matches!(
            allocator.allocate("serial", &[AllocationRequest::count(1)]),
            Err(Error::InsufficientDevices { .. })
        );
    }

    #[test]
    fn test_stale_record_release_keeps_new_holder() {
        let (registry, allocator) = setup();
        add(&registry, "serial", "tty-a", "ttyUSB0");

        let first = allocator
            .allocate("serial", &[AllocationRequest::count(1)])
            .unwrap()
            .remove(0);
        registry
            .reconcile_reservations("serial", &BTreeSet::new(), std::time::Duration::ZERO)
            .unwrap();
        allocator
            .allocate("serial", &[AllocationRequest::count(1)])
            .unwrap();

        // Released before any prune ran
        allocator.release(&first.id).unwrap();
        assert!(registry.snapshot("serial").unwrap()[0].reserved);
        assert_matches!(
            allocator.allocate("serial", &[AllocationRequest::count(1)]),
            Err(Error::InsufficientDevices { .. })
        );
    }

    #[test]
    fn test_removed_device_keeps_record_until_release() {
        let (registry, allocator) = setup();
        add(&registry, "serial", "tty-a", "ttyUSB0");

        let allocation = allocator
            .allocate("serial", &[AllocationRequest::count(1)])
            .unwrap()
            .remove(0);

        assert!(registry.apply(DeviceEvent::Remove(DeviceId::new("tty-a"))));
        assert!(registry.snapshot("serial").unwrap().is_empty());
        assert!(allocator.get(&allocation.id).is_some());

        let released = allocator.release(&allocation.id).unwrap();
        assert_eq!(released.device_ids, vec![DeviceId::new("tty-a")]);
        assert!(allocator.get(&allocation.id).is_none());
    }

    #[test]
    fn test_release_pool_and_prune() {
        let (registry, allocator) = setup();
        add(&registry, "serial", "tty-a", "ttyUSB0");
        add(&registry, "serial", "tty-b", "ttyUSB1");
        add(&registry, "coral", "usb-a", "bus/usb/001/004");

        allocator
            .allocate("serial", &[AllocationRequest::count(1), AllocationRequest::count(1)])
            .unwrap();
        allocator.allocate("coral", &[AllocationRequest::count(1)]).unwrap();
        assert_eq!(allocator.list().len(), 3);

        assert_eq!(allocator.release_pool("serial").unwrap(), 2);
        assert_eq!(allocator.list().len(), 1);

        // Reservation cleared behind the allocator's back
        registry.release(&["usb-a:0".to_string()]);
        assert_eq!(allocator.prune("coral").unwrap(), 1);
        assert!(allocator.list().is_empty());
    }
}
