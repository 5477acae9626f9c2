//! Device Registry
//!
//! Authoritative in-memory map from pool name to the devices currently
//! present, their health and which of their slots are reserved.
//!
//! All state sits behind a single lock. The event pipeline is the only task
//! that adds, removes or changes the health of devices; Allocate handlers and the
//! reconciler only flip reservation flags. Every externally visible change
//! bumps a per-pool generation on a `watch` channel so ListAndWatch streams
//! wake up without polling.

use crate::config::AgentConfig;
use crate::domain::{Access, Device, DeviceId, Health, Slot};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, warn};

// =============================================================================
// Constants
// =============================================================================

/// Default bound on waiting for the registry lock when reserving
pub const DEFAULT_RESERVE_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Registry Events
// =============================================================================

/// A classified change to apply to the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Device appeared (or was re-reported)
    Add(Device),
    /// Device attributes changed; may move it to another pool
    Change(Device),
    /// Device disappeared
    Remove(DeviceId),
}

/// Result of reconciling reservations against the kubelet's view
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Reservations dropped because no container holds them
    pub released: Vec<String>,
    /// In-use slots that were not marked reserved
    pub adopted: Vec<String>,
}

/// Per-pool counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSummary {
    pub name: String,
    pub devices: usize,
    pub slots: usize,
    pub healthy_slots: usize,
    pub reserved_slots: usize,
}

// =============================================================================
// Pool State
// =============================================================================

#[derive(Debug)]
struct SlotState {
    device_id: DeviceId,
    reserved_at: Option<Instant>,
    /// Allocation holding the reservation; `None` for adopted slots
    owner: Option<String>,
}

impl SlotState {
    fn clear(&mut self) -> bool {
        self.owner = None;
        self.reserved_at.take().is_some()
    }
}

#[derive(Debug)]
struct PoolState {
    access: Access,
    devices: BTreeMap<DeviceId, Device>,
    slots: BTreeMap<String, SlotState>,
    generation: watch::Sender<u64>,
}

impl PoolState {
    fn new(access: Access) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            access,
            devices: BTreeMap::new(),
            slots: BTreeMap::new(),
            generation,
        }
    }

    fn notify(&self) {
        self.generation.send_modify(|g| *g = g.wrapping_add(1));
    }

    fn health_of(&self, device_id: &DeviceId) -> Health {
        self.devices
            .get(device_id)
            .map(|d| d.health)
            .unwrap_or(Health::Unhealthy)
    }

    fn slot(&self, id: &str, state: &SlotState) -> Slot {
        Slot {
            id: id.to_string(),
            device_id: state.device_id.clone(),
            health: self.health_of(&state.device_id),
            reserved: state.reserved_at.is_some(),
        }
    }

    fn is_available(&self, state: &SlotState) -> bool {
        state.reserved_at.is_none() && self.health_of(&state.device_id).is_healthy()
    }

    /// Reserved slot count per device, used to spread shared devices
    fn load(&self) -> HashMap<&DeviceId, usize> {
        let mut load = HashMap::new();
        for state in self.slots.values() {
            let entry = load.entry(&state.device_id).or_insert(0);
            if state.reserved_at.is_some() {
                *entry += 1;
            }
        }
        load
    }

    /// Available slot ids, least loaded devices first
    fn candidates(&self) -> Vec<String> {
        let load = self.load();
        let mut ids: Vec<(&String, usize)> = self
            .slots
            .iter()
            .filter(|(_, state)| self.is_available(state))
            .map(|(id, state)| (id, load.get(&state.device_id).copied().unwrap_or(0)))
            .collect();
        ids.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        ids.into_iter().map(|(id, _)| id.clone()).collect()
    }

    fn insert(&mut self, device: Device) {
        for slot_id in self.access.slot_ids(&device.id) {
            self.slots.entry(slot_id).or_insert_with(|| SlotState {
                device_id: device.id.clone(),
                reserved_at: None,
                owner: None,
            });
        }
        self.devices.insert(device.id.clone(), device);
    }

    fn remove(&mut self, device_id: &DeviceId) -> Option<Device> {
        let device = self.devices.remove(device_id)?;
        self.slots.retain(|_, state| &state.device_id != device_id);
        Some(device)
    }

    fn reserve(&mut self, ids: &[String], now: Instant, owner: Option<&str>) -> Vec<Slot> {
        for id in ids {
            if let Some(state) = self.slots.get_mut(id) {
                assert!(
                    state.reserved_at.is_none(),
                    "slot {} reserved twice; registry mutual exclusion violated",
                    id
                );
                state.reserved_at = Some(now);
                state.owner = owner.map(str::to_string);
            }
        }
        ids.iter()
            .filter_map(|id| self.slots.get(id).map(|state| self.slot(id, state)))
            .collect()
    }
}

// =============================================================================
// Registry State
// =============================================================================

#[derive(Debug, Default)]
struct RegistryState {
    pools: BTreeMap<String, PoolState>,
    /// Which pool each known device lives in
    index: HashMap<DeviceId, String>,
}

impl RegistryState {
    fn pool(&self, name: &str) -> Result<&PoolState> {
        self.pools.get(name).ok_or_else(|| Error::UnknownPool {
            pool: name.to_string(),
        })
    }

    fn pool_mut(&mut self, name: &str) -> Result<&mut PoolState> {
        self.pools.get_mut(name).ok_or_else(|| Error::UnknownPool {
            pool: name.to_string(),
        })
    }

    /// Insert or refresh a device; health set by the probe is kept
    fn upsert(&mut self, mut device: Device) -> bool {
        if !self.pools.contains_key(&device.pool) {
            warn!(
                "Dropping device {} for unconfigured pool {}",
                device.id, device.pool
            );
            return false;
        }

        let mut changed = false;
        if let Some(previous) = self.index.get(&device.id).cloned() {
            if previous != device.pool {
                if let Some(old) = self.pools.get_mut(&previous) {
                    if let Some(moved) = old.remove(&device.id) {
                        device.health = moved.health;
                    }
                    old.notify();
                }
                debug!("Device {} moved from pool {} to {}", device.id, previous, device.pool);
                changed = true;
            }
        }

        let pool = match self.pools.get_mut(&device.pool) {
            Some(pool) => pool,
            None => return changed,
        };
        match pool.devices.get_mut(&device.id) {
            Some(existing) => {
                device.health = existing.health;
                *existing = device.clone();
            }
            None => {
                pool.insert(device.clone());
                changed = true;
            }
        }
        if changed {
            pool.notify();
        }
        self.index.insert(device.id, device.pool);
        changed
    }

    fn remove(&mut self, device_id: &DeviceId) -> bool {
        let Some(pool_name) = self.index.remove(device_id) else {
            return false;
        };
        match self.pools.get_mut(&pool_name) {
            Some(pool) => {
                let removed = pool.remove(device_id).is_some();
                if removed {
                    pool.notify();
                }
                removed
            }
            None => false,
        }
    }
}

// =============================================================================
// Device Registry
// =============================================================================

/// Thread-safe registry of pools, devices and slot reservations
pub struct DeviceRegistry {
    state: RwLock<RegistryState>,
    reserve_timeout: Duration,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("pools", &self.state.read().pools.len())
            .finish()
    }
}

impl DeviceRegistry {
    /// Create a registry with the given pools
    pub fn new<I, S>(pools: I) -> Arc<Self>
    where
        I: IntoIterator<Item = (S, Access)>,
        S: Into<String>,
    {
        Self::with_reserve_timeout(pools, DEFAULT_RESERVE_TIMEOUT)
    }

    /// Create a registry with a custom bound on reservation lock waits
    pub fn with_reserve_timeout<I, S>(pools: I, reserve_timeout: Duration) -> Arc<Self>
    where
        I: IntoIterator<Item = (S, Access)>,
        S: Into<String>,
    {
        let pools = pools
            .into_iter()
            .map(|(name, access)| (name.into(), PoolState::new(access)))
            .collect();

        Arc::new(Self {
            state: RwLock::new(RegistryState {
                pools,
                index: HashMap::new(),
            }),
            reserve_timeout,
        })
    }

    /// Create a registry for every configured pool
    pub fn from_config(config: &AgentConfig) -> Arc<Self> {
        Self::with_reserve_timeout(
            config.pools.iter().map(|p| (p.name.clone(), p.access)),
            config.allocate_timeout(),
        )
    }

    // -------------------------------------------------------------------------
    // Writer operations (event pipeline)
    // -------------------------------------------------------------------------

    /// Apply a device event; returns whether any advertised state changed
    ///
    /// Idempotent: re-adding a known device refreshes its attributes in place
    /// and removing an unknown device does nothing.
    pub fn apply(&self, event: DeviceEvent) -> bool {
        let mut state = self.state.write();
        match event {
            DeviceEvent::Add(device) | DeviceEvent::Change(device) => state.upsert(device),
            DeviceEvent::Remove(id) => state.remove(&id),
        }
    }

    /// Update a device's health; reservations are kept
    pub fn set_health(&self, device_id: &DeviceId, health: Health) -> bool {
        let mut state = self.state.write();
        let Some(pool_name) = state.index.get(device_id).cloned() else {
            return false;
        };
        let Some(pool) = state.pools.get_mut(&pool_name) else {
            return false;
        };
        let changed = match pool.devices.get_mut(device_id) {
            Some(device) if device.health != health => {
                device.health = health;
                true
            }
            _ => false,
        };
        if changed {
            pool.notify();
        }
        changed
    }

    // -------------------------------------------------------------------------
    // Readers
    // -------------------------------------------------------------------------

    /// Consistent point-in-time view of a pool's slots, ordered by id
    pub fn snapshot(&self, pool: &str) -> Result<Vec<Slot>> {
        let state = self.state.read();
        let pool = state.pool(pool)?;
        Ok(pool
            .slots
            .iter()
            .map(|(id, slot)| pool.slot(id, slot))
            .collect())
    }

    /// Devices of a pool, ordered by id
    pub fn devices(&self, pool: &str) -> Result<Vec<Device>> {
        let state = self.state.read();
        Ok(state.pool(pool)?.devices.values().cloned().collect())
    }

    /// Every known device across all pools
    pub fn all_devices(&self) -> Vec<Device> {
        let state = self.state.read();
        state
            .pools
            .values()
            .flat_map(|pool| pool.devices.values().cloned())
            .collect()
    }

    /// Look up the device behind a slot id
    pub fn device_for_slot(&self, pool: &str, slot_id: &str) -> Option<Device> {
        let state = self.state.read();
        let pool = state.pools.get(pool)?;
        let slot = pool.slots.get(slot_id)?;
        pool.devices.get(&slot.device_id).cloned()
    }

    /// Counters for one pool
    pub fn summary(&self, pool: &str) -> Result<PoolSummary> {
        let state = self.state.read();
        let p = state.pool(pool)?;
        Ok(PoolSummary {
            name: pool.to_string(),
            devices: p.devices.len(),
            slots: p.slots.len(),
            healthy_slots: p
                .slots
                .values()
                .filter(|s| p.health_of(&s.device_id).is_healthy())
                .count(),
            reserved_slots: p.slots.values().filter(|s| s.reserved_at.is_some()).count(),
        })
    }

    /// Names of all pools
    pub fn pool_names(&self) -> Vec<String> {
        self.state.read().pools.keys().cloned().collect()
    }

    /// Watch a pool's generation counter; changes on every visible update
    pub fn subscribe(&self, pool: &str) -> Result<watch::Receiver<u64>> {
        let state = self.state.read();
        Ok(state.pool(pool)?.generation.subscribe())
    }

    // -------------------------------------------------------------------------
    // Reservations
    // -------------------------------------------------------------------------

    /// Atomically reserve `count` healthy, unreserved slots
    ///
    /// All or nothing: on `InsufficientDevices` nothing is reserved.
    pub fn try_reserve(&self, pool: &str, count: usize) -> Result<Vec<Slot>> {
        self.reserve_count(pool, count, None)
    }

    /// Like [`try_reserve`](Self::try_reserve), tagging the slots with `owner`
    pub fn try_reserve_for(&self, pool: &str, count: usize, owner: &str) -> Result<Vec<Slot>> {
        self.reserve_count(pool, count, Some(owner))
    }

    /// Atomically reserve exactly the given slots
    ///
    /// Fails with `DevicesUnavailable` naming every slot that is unknown,
    /// unhealthy, already reserved or listed twice.
    pub fn try_reserve_ids(&self, pool: &str, ids: &[String]) -> Result<Vec<Slot>> {
        self.reserve_ids(pool, ids, None)
    }

    /// Like [`try_reserve_ids`](Self::try_reserve_ids), tagging the slots with `owner`
    pub fn try_reserve_ids_for(&self, pool: &str, ids: &[String], owner: &str) -> Result<Vec<Slot>> {
        self.reserve_ids(pool, ids, Some(owner))
    }

    fn reserve_count(&self, pool: &str, count: usize, owner: Option<&str>) -> Result<Vec<Slot>> {
        let mut state = self.lock_for_reserve(pool)?;
        let p = state.pool_mut(pool)?;

        let candidates = p.candidates();
        if candidates.len() < count {
            return Err(Error::InsufficientDevices {
                pool: pool.to_string(),
                requested: count,
                available: candidates.len(),
            });
        }

        let chosen: Vec<String> = candidates.into_iter().take(count).collect();
        Ok(p.reserve(&chosen, Instant::now(), owner))
    }

    fn reserve_ids(&self, pool: &str, ids: &[String], owner: Option<&str>) -> Result<Vec<Slot>> {
        let mut state = self.lock_for_reserve(pool)?;
        let p = state.pool_mut(pool)?;

        let mut seen = BTreeSet::new();
        let unavailable: Vec<String> = ids
            .iter()
            .filter(|id| {
                !seen.insert(id.as_str())
                    || !p.slots.get(id.as_str()).map(|s| p.is_available(s)).unwrap_or(false)
            })
            .cloned()
            .collect();

        if !unavailable.is_empty() {
            return Err(Error::DevicesUnavailable {
                pool: pool.to_string(),
                ids: unavailable,
            });
        }

        Ok(p.reserve(ids, Instant::now(), owner))
    }

    /// Clear reservations; unknown or unreserved ids are ignored
    pub fn release(&self, ids: &[String]) -> usize {
        self.release_matching(ids, |_| true)
    }

    /// Clear only the reservations `owner` still holds
    ///
    /// A slot that was released and handed to someone else since is left
    /// alone.
    pub fn release_owned(&self, owner: &str, ids: &[String]) -> usize {
        self.release_matching(ids, |slot| slot.owner.as_deref() == Some(owner))
    }

    fn release_matching(&self, ids: &[String], holds: impl Fn(&SlotState) -> bool) -> usize {
        let mut state = self.state.write();
        let mut released = 0;
        for id in ids {
            for pool in state.pools.values_mut() {
                if let Some(slot) = pool.slots.get_mut(id) {
                    if holds(slot) && slot.clear() {
                        released += 1;
                    }
                    break;
                }
            }
        }
        released
    }

    /// Owner of every reserved slot of a pool that has one
    pub fn owners(&self, pool: &str) -> Result<BTreeMap<String, String>> {
        let state = self.state.read();
        Ok(state
            .pool(pool)?
            .slots
            .iter()
            .filter(|(_, slot)| slot.reserved_at.is_some())
            .filter_map(|(id, slot)| slot.owner.clone().map(|owner| (id.clone(), owner)))
            .collect())
    }

    /// Pick `size` slots for the kubelet out of `available`
    ///
    /// Read-only. `must_include` comes first, then the least loaded healthy
    /// and unreserved slots. May return fewer than `size`.
    pub fn preferred(
        &self,
        pool: &str,
        available: &[String],
        must_include: &[String],
        size: usize,
    ) -> Result<Vec<String>> {
        let state = self.state.read();
        let p = state.pool(pool)?;

        let offered: BTreeSet<&str> = available.iter().map(String::as_str).collect();
        let mut picked: Vec<String> = Vec::with_capacity(size);
        for id in must_include {
            if !picked.contains(id) {
                picked.push(id.clone());
            }
        }
        for id in p.candidates() {
            if picked.len() >= size {
                break;
            }
            if offered.contains(id.as_str()) && !picked.contains(&id) {
                picked.push(id);
            }
        }
        Ok(picked)
    }

    /// Align reservations with the slots containers actually hold
    ///
    /// Reservations older than `grace` that no container holds are
    /// released; held slots that are not reserved are adopted.
    pub fn reconcile_reservations(
        &self,
        pool: &str,
        in_use: &BTreeSet<String>,
        grace: Duration,
    ) -> Result<ReconcileOutcome> {
        let mut state = self.state.write();
        let p = state.pool_mut(pool)?;
        let now = Instant::now();
        let mut outcome = ReconcileOutcome::default();

        for (id, slot) in p.slots.iter_mut() {
            match slot.reserved_at {
                Some(at) if !in_use.contains(id) && now.duration_since(at) >= grace => {
                    slot.clear();
                    outcome.released.push(id.clone());
                }
                None if in_use.contains(id) => {
                    slot.reserved_at = Some(now);
                    slot.owner = None;
                    outcome.adopted.push(id.clone());
                }
                _ => {}
            }
        }
        Ok(outcome)
    }

    fn lock_for_reserve(
        &self,
        pool: &str,
    ) -> Result<parking_lot::RwLockWriteGuard<'_, RegistryState>> {
        self.state
            .try_write_for(self.reserve_timeout)
            .ok_or_else(|| Error::ReserveTimeout {
                pool: pool.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{attr, Attributes};
    use assert_matches::assert_matches;
    use std::collections::HashSet;

    fn device(pool: &str, n: u32) -> Device {
        let mut attributes = Attributes::new();
        attributes.insert(attr::SUBSYSTEM.into(), "tty".into());
        attributes.insert(attr::DEVNAME.into(), format!("ttyUSB{}", n));
        Device {
            id: DeviceId::new(format!("tty-{:04}", n)),
            pool: pool.to_string(),
            attributes,
            health: Health::Healthy,
        }
    }

    fn registry() -> Arc<DeviceRegistry> {
        DeviceRegistry::new([("serial", Access::Exclusive), ("coral", Access::Shared(2))])
    }

    #[test]
    fn test_scenario_add_allocate_remove() {
        let registry = registry();
        let a = device("serial", 0);

        assert!(registry.apply(DeviceEvent::Add(a.clone())));
        let snapshot = registry.snapshot("serial").unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, a.id.as_str());
        assert_eq!(snapshot[0].health, Health::Healthy);

        let granted = registry.try_reserve("serial", 1).unwrap();
        assert_eq!(granted[0].device_id, a.id);

        assert!(registry.apply(DeviceEvent::Remove(a.id.clone())));
        assert!(registry.snapshot("serial").unwrap().is_empty());
        assert_matches!(
            registry.try_reserve("serial", 1),
            Err(Error::InsufficientDevices { requested: 1, available: 0, .. })
        );
    }

    #[test]
    fn test_add_is_idempotent() {
        let registry = registry();
        let a = device("serial", 0);

        assert!(registry.apply(DeviceEvent::Add(a.clone())));
        let once = registry.snapshot("serial").unwrap();

        let mut refreshed = a.clone();
        refreshed.attributes.insert("ID_SERIAL".into(), "A1".into());
        assert!(!registry.apply(DeviceEvent::Add(refreshed)));

        assert_eq!(registry.snapshot("serial").unwrap(), once);
        let devices = registry.devices("serial").unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].attribute("ID_SERIAL"), Some("A1"));
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let registry = registry();
        assert!(!registry.apply(DeviceEvent::Remove(DeviceId::new("tty-missing"))));
    }

    #[test]
    fn test_change_moves_pool() {
        let registry = DeviceRegistry::new([("a", Access::Exclusive), ("b", Access::Exclusive)]);
        let mut dev = device("a", 1);
        registry.apply(DeviceEvent::Add(dev.clone()));

        dev.pool = "b".into();
        assert!(registry.apply(DeviceEvent::Change(dev.clone())));
        assert!(registry.snapshot("a").unwrap().is_empty());
        assert_eq!(registry.snapshot("b").unwrap().len(), 1);

        // Remove finds it in its new pool
        assert!(registry.apply(DeviceEvent::Remove(dev.id)));
        assert!(registry.snapshot("b").unwrap().is_empty());
    }

    #[test]
    fn test_replay_matches_net_effect() {
        // Deterministic pseudo-random sequence over a small id space
        let registry = registry();
        let mut expected: HashSet<u32> = HashSet::new();
        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;

        for _ in 0..2_000 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let n = ((seed >> 33) % 16) as u32;
            match (seed >> 20) % 3 {
                0 => {
                    registry.apply(DeviceEvent::Add(device("serial", n)));
                    expected.insert(n);
                }
                1 => {
                    registry.apply(DeviceEvent::Change(device("serial", n)));
                    expected.insert(n);
                }
                _ => {
                    registry.apply(DeviceEvent::Remove(device("serial", n).id));
                    expected.remove(&n);
                }
            }
        }

        let mut want: Vec<String> = expected
            .iter()
            .map(|n| device("serial", *n).id.to_string())
            .collect();
        want.sort();
        let got: Vec<String> = registry
            .snapshot("serial")
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(got, want);
    }

    #[test]
    fn test_concurrent_reservations_never_overlap() {
        let registry = registry();
        for n in 0..32 {
            registry.apply(DeviceEvent::Add(device("serial", n)));
        }

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let mut granted = Vec::new();
                    for _ in 0..10 {
                        if let Ok(slots) = registry.try_reserve("serial", 3) {
                            granted.extend(slots.into_iter().map(|s| s.id));
                        }
                    }
                    granted
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }
        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(unique.len(), all.len());
        assert!(all.len() <= 32);
        assert_eq!(all.len(), 30);
    }

    #[test]
    fn test_unhealthy_never_granted_but_reservation_kept() {
        let registry = registry();
        let a = device("serial", 0);
        let b = device("serial", 1);
        registry.apply(DeviceEvent::Add(a.clone()));
        registry.apply(DeviceEvent::Add(b.clone()));

        let granted = registry.try_reserve("serial", 1).unwrap();
        let held = granted[0].device_id.clone();
        let other = if held == a.id { b.id.clone() } else { a.id.clone() };

        assert!(registry.set_health(&held, Health::Unhealthy));
        assert!(registry.set_health(&other, Health::Unhealthy));
        assert!(!registry.set_health(&other, Health::Unhealthy));

        let snapshot = registry.snapshot("serial").unwrap();
        let held_slot = snapshot.iter().find(|s| s.device_id == held).unwrap();
        assert!(held_slot.reserved);
        assert_eq!(held_slot.health, Health::Unhealthy);

        assert_matches!(
            registry.try_reserve("serial", 1),
            Err(Error::InsufficientDevices { .. })
        );
    }

    #[test]
    fn test_release_is_idempotent() {
        let registry = registry();
        registry.apply(DeviceEvent::Add(device("serial", 0)));
        let ids: Vec<String> = registry
            .try_reserve("serial", 1)
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();

        assert_eq!(registry.release(&ids), 1);
        assert_eq!(registry.release(&ids), 0);
        assert_eq!(registry.release(&["unknown".to_string()]), 0);
        assert_eq!(registry.try_reserve("serial", 1).unwrap().len(), 1);
    }

    #[test]
    fn test_release_owned_skips_other_holders() {
        let registry = registry();
        registry.apply(DeviceEvent::Add(device("serial", 0)));
        let ids = vec!["tty-0000".to_string()];

        registry.try_reserve_ids_for("serial", &ids, "alloc-a").unwrap();
        assert_eq!(
            registry.owners("serial").unwrap(),
            BTreeMap::from([("tty-0000".to_string(), "alloc-a".to_string())])
        );

        // Reclaimed, then handed to another allocation
        let outcome = registry
            .reconcile_reservations("serial", &BTreeSet::new(), Duration::ZERO)
            .unwrap();
        assert_eq!(outcome.released, ids);
        assert!(registry.owners("serial").unwrap().is_empty());
        registry.try_reserve_for("serial", 1, "alloc-b").unwrap();

        assert_eq!(registry.release_owned("alloc-a", &ids), 0);
        assert!(registry.snapshot("serial").unwrap()[0].reserved);
        assert_eq!(registry.release_owned("alloc-b", &ids), 1);
        assert!(!registry.snapshot("serial").unwrap()[0].reserved);
    }

    #[test]
    fn test_readd_keeps_current_health() {
        let registry = DeviceRegistry::new([("a", Access::Exclusive), ("b", Access::Exclusive)]);
        let mut dev = device("a", 0);
        registry.apply(DeviceEvent::Add(dev.clone()));
        assert!(registry.set_health(&dev.id, Health::Unhealthy));

        assert!(!registry.apply(DeviceEvent::Add(dev.clone())));
        assert!(!registry.apply(DeviceEvent::Change(dev.clone())));
        assert_eq!(registry.snapshot("a").unwrap()[0].health, Health::Unhealthy);

        dev.pool = "b".into();
        assert!(registry.apply(DeviceEvent::Change(dev.clone())));
        assert_eq!(registry.snapshot("b").unwrap()[0].health, Health::Unhealthy);
        assert_matches!(
            registry.try_reserve("b", 1),
            Err(Error::InsufficientDevices { .. })
        );
    }

    #[test]
    fn test_shared_slots_spread_across_devices() {
        let registry = registry();
        registry.apply(DeviceEvent::Add(device("coral", 0)));
        registry.apply(DeviceEvent::Add(device("coral", 1)));

        let snapshot = registry.snapshot("coral").unwrap();
        assert_eq!(snapshot.len(), 4);
        assert_eq!(snapshot[0].id, "tty-0000:0");

        let first = registry.try_reserve("coral", 1).unwrap();
        let second = registry.try_reserve("coral", 1).unwrap();
        assert_ne!(first[0].device_id, second[0].device_id);

        assert_eq!(registry.try_reserve("coral", 2).unwrap().len(), 2);
        assert_matches!(
            registry.try_reserve("coral", 1),
            Err(Error::InsufficientDevices { .. })
        );
    }

    #[test]
    fn test_reserve_exact_ids() {
        let registry = registry();
        for n in 0..3 {
            registry.apply(DeviceEvent::Add(device("serial", n)));
        }
        let wanted = vec!["tty-0001".to_string(), "tty-0002".to_string()];
        let granted = registry.try_reserve_ids("serial", &wanted).unwrap();
        assert_eq!(granted.iter().map(|s| s.id.clone()).collect::<Vec<_>>(), wanted);

        let err = registry
            .try_reserve_ids("serial", &["tty-0000".to_string(), "tty-0001".to_string()])
            .unwrap_err();
        assert_matches!(err, Error::DevicesUnavailable { ref ids, .. } if ids == &vec!["tty-0001".to_string()]);

        // Nothing was reserved by the failed call
        assert_eq!(registry.summary("serial").unwrap().reserved_slots, 2);

        assert_matches!(
            registry.try_reserve_ids("serial", &["tty-0000".to_string(), "tty-0000".to_string()]),
            Err(Error::DevicesUnavailable { .. })
        );
    }

    #[test]
    fn test_preferred_allocation() {
        let registry = registry();
        for n in 0..4 {
            registry.apply(DeviceEvent::Add(device("serial", n)));
        }
        registry.try_reserve_ids("serial", &["tty-0000".to_string()]).unwrap();

        let available: Vec<String> = (0..4).map(|n| format!("tty-{:04}", n)).collect();
        let picked = registry
            .preferred("serial", &available, &["tty-0003".to_string()], 2)
            .unwrap();
        assert_eq!(picked, vec!["tty-0003".to_string(), "tty-0001".to_string()]);
    }

    #[test]
    fn test_reconcile_releases_and_adopts() {
        let registry = registry();
        for n in 0..3 {
            registry.apply(DeviceEvent::Add(device("serial", n)));
        }
        registry.try_reserve_ids("serial", &["tty-0000".to_string()]).unwrap();
        registry.try_reserve_ids("serial", &["tty-0001".to_string()]).unwrap();

        let in_use: BTreeSet<String> = ["tty-0001".to_string(), "tty-0002".to_string()].into();

        // Within the grace period nothing is released
        let outcome = registry
            .reconcile_reservations("serial", &in_use, Duration::from_secs(3600))
            .unwrap();
        assert!(outcome.released.is_empty());
        assert_eq!(outcome.adopted, vec!["tty-0002".to_string()]);

        let outcome = registry
            .reconcile_reservations("serial", &in_use, Duration::ZERO)
            .unwrap();
        assert_eq!(outcome.released, vec!["tty-0000".to_string()]);
        assert!(outcome.adopted.is_empty());

        let summary = registry.summary("serial").unwrap();
        assert_eq!(summary.reserved_slots, 2);
    }

    #[test]
    fn test_unknown_pool() {
        let registry = registry();
        assert_matches!(registry.snapshot("gpu"), Err(Error::UnknownPool { .. }));
        assert_matches!(registry.try_reserve("gpu", 1), Err(Error::UnknownPool { .. }));
        assert!(!registry.apply(DeviceEvent::Add(device("gpu", 0))));
    }

    #[tokio::test]
    async fn test_subscribers_woken_on_visible_change() {
        let registry = registry();
        let mut rx = registry.subscribe("serial").unwrap();
        let _ = rx.borrow_and_update();

        registry.apply(DeviceEvent::Add(device("serial", 0)));
        assert!(rx.has_changed().unwrap());
        let _ = rx.borrow_and_update();

        // Attribute-only refresh is not advertised
        registry.apply(DeviceEvent::Add(device("serial", 0)));
        assert!(!rx.has_changed().unwrap());

        registry.set_health(&device("serial", 0).id, Health::Unhealthy);
        assert!(rx.has_changed().unwrap());
    }
}
