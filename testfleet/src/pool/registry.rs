//! Device Pool Registry: local device catalog plus the shared lock table
//!
//! Every worker process holds its own `PoolRegistry`. The in-memory view is
//! reconciled from the lock table at initialization and again inside every
//! mutation, which runs as one locked read-merge-write cycle.
//!
//! ## Merge Rules
//!
//! 1. The lock table is authoritative: entries for known devices become the
//!    in-memory allocations, in-memory allocations missing from the table are
//!    dropped (an operator cleared them).
//! 2. Entries for devices this registry does not know are left untouched in
//!    the table; they belong to pools configured elsewhere.
//! 3. If the table cannot be parsed, the in-memory view is the merge base
//!    and the next write replaces the unreadable document.
//! 4. A mutation whose write failed is replayed onto the loaded table before
//!    rule 1 applies, until a later write lands. Allocations that never
//!    reached the table cannot be cleared from it.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::lock_table::{take_stale, LockEntry, LockMap, LockTable, LockTableGuard};
use crate::device::{Allocation, Device, Platform};
use crate::error::{LabError, Result};

/// Devices grouped by platform, each list in registration order
pub type DevicesByPlatform = BTreeMap<Platform, Vec<Device>>;

/// Outcome of reconciling a fresh catalog against the lock table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Allocations restored onto known devices
    pub restored: usize,
    /// Entries ignored because they reference devices outside this pool
    pub dropped: usize,
    /// Entries removed from the table because they outlived the stale TTL
    pub reclaimed: usize,
}

#[derive(Debug, Default)]
struct PoolState {
    /// Registration order is allocation preference order
    devices: Vec<Device>,
    /// test_id → allocation
    allocations: HashMap<String, Allocation>,
    /// Allocations whose lock-table write failed
    unsynced: HashSet<String>,
    /// Releases whose lock-table write failed
    unsynced_releases: HashSet<String>,
}

impl PoolState {
    fn knows(&self, device_id: &str) -> bool {
        self.devices.iter().any(|d| d.id == device_id)
    }

    fn to_lock_map(&self) -> LockMap {
        self.allocations
            .iter()
            .map(|(test_id, a)| (test_id.clone(), lock_entry(a)))
            .collect()
    }

    /// Apply mutations whose write never landed onto freshly loaded entries
    fn replay_unsynced(&self, entries: &mut LockMap) {
        for test_id in &self.unsynced_releases {
            entries.remove(test_id);
        }
        for test_id in &self.unsynced {
            if let Some(allocation) = self.allocations.get(test_id) {
                entries
                    .entry(test_id.clone())
                    .or_insert_with(|| lock_entry(allocation));
            }
        }
    }

    fn mark_synced(&mut self) {
        self.unsynced.clear();
        self.unsynced_releases.clear();
    }

    /// Rebuild allocations and `in_use` flags from table entries.
    /// Returns how many entries referenced unknown devices.
    fn adopt(&mut self, entries: &LockMap) -> usize {
        let mut allocations: HashMap<String, Allocation> = HashMap::new();
        let mut unknown = 0;

        // Unsynced allocations claim their devices first
        let ordered = entries
            .iter()
            .filter(|(test_id, _)| self.unsynced.contains(*test_id))
            .chain(
                entries
                    .iter()
                    .filter(|(test_id, _)| !self.unsynced.contains(*test_id)),
            );

        for (test_id, entry) in ordered {
            let Some(device) = self.devices.iter().find(|d| d.id == entry.device_id) else {
                unknown += 1;
                continue;
            };
            if let Some(holder) = allocations.values().find(|a| a.device_id == device.id) {
                warn!(
                    device = %device.id,
                    test_id = %test_id,
                    holder = %holder.test_id,
                    "Lock table lists device under two tests, keeping first"
                );
                continue;
            }
            allocations.insert(
                test_id.clone(),
                Allocation {
                    test_id: test_id.clone(),
                    platform: device.platform,
                    device_id: device.id.clone(),
                    session_id: None,
                    endpoint: None,
                    allocated_at: entry.timestamp,
                },
            );
        }

        for old in self.allocations.keys() {
            if !allocations.contains_key(old) {
                warn!(test_id = %old, "Allocation no longer in lock table, dropping");
            }
        }

        for device in &mut self.devices {
            device.in_use = allocations.values().any(|a| a.device_id == device.id);
        }
        self.allocations = allocations;
        unknown
    }
}

fn lock_entry(allocation: &Allocation) -> LockEntry {
    LockEntry {
        platform: allocation.platform,
        device_id: allocation.device_id.clone(),
        timestamp: allocation.allocated_at,
    }
}

struct PoolInner {
    table: LockTable,
    stale_ttl: Option<Duration>,
    state: Mutex<PoolState>,
}

/// Local device pool with cross-process allocation through the lock table.
///
/// Cheap to clone; clones share one view.
#[derive(Clone)]
pub struct PoolRegistry {
    inner: Arc<PoolInner>,
}

impl PoolRegistry {
    /// Create an empty registry over `table`. Call [`initialize_pool`] before
    /// allocating.
    ///
    /// [`initialize_pool`]: PoolRegistry::initialize_pool
    pub fn new(table: LockTable) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                table,
                stale_ttl: None,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    /// Create a registry that reclaims lock entries older than `ttl` when the
    /// pool is initialized
    pub fn with_stale_ttl(table: LockTable, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                table,
                stale_ttl: Some(ttl),
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    pub fn lock_table(&self) -> &LockTable {
        &self.inner.table
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Reset the catalog to `devices_by_platform` (all free), then restore
    /// persisted allocations that reference these devices.
    pub fn initialize_pool(&self, devices_by_platform: DevicesByPlatform) -> ReconcileReport {
        let mut state = self.state();
        *state = PoolState::default();

        for (platform, devices) in devices_by_platform {
            for mut device in devices {
                if state.knows(&device.id) {
                    warn!(device = %device.id, "Duplicate device id in pool, skipping");
                    continue;
                }
                if device.platform != platform {
                    warn!(
                        device = %device.id,
                        declared = %device.platform,
                        listed_under = %platform,
                        "Device listed under a different platform, using the list's"
                    );
                    device.platform = platform;
                }
                device.in_use = false;
                state.devices.push(device);
            }
        }

        let mut report = ReconcileReport::default();
        let entries = match self.inner.stale_ttl {
            Some(ttl) => self.reclaim_stale(ttl, &mut report),
            None => self.inner.table.snapshot().map_err(LabError::from),
        };

        match entries {
            Ok(entries) => {
                report.dropped = state.adopt(&entries);
                report.restored = state.allocations.len();
            }
            Err(e) => {
                error!(error = %e, "Could not read lock table, starting with every device free");
            }
        }

        info!(
            devices = state.devices.len(),
            restored = report.restored,
            dropped = report.dropped,
            reclaimed = report.reclaimed,
            "Device pool initialized"
        );
        for allocation in state.allocations.values() {
            info!(
                test_id = %allocation.test_id,
                device = %allocation.device_id,
                "Restored allocation from lock table"
            );
        }

        report
    }

    fn reclaim_stale(&self, ttl: Duration, report: &mut ReconcileReport) -> Result<LockMap> {
        let guard = self.inner.table.lock()?;
        let mut entries = guard.load()?;
        let stale = take_stale(&mut entries, ttl, Utc::now());

        if !stale.is_empty() {
            for (test_id, entry) in &stale {
                warn!(
                    test_id = %test_id,
                    device = %entry.device_id,
                    since = %entry.timestamp,
                    "Reclaiming stale device lock"
                );
            }
            guard.store(&entries)?;
            report.reclaimed = stale.len();
        }

        Ok(entries)
    }

    /// Reserve the first free `platform` device for `test_id`.
    ///
    /// Re-entrant: an allocation for `test_id` still recorded in the lock
    /// table (or not yet written to it) is returned as is.
    pub fn allocate(&self, platform: Platform, test_id: &str) -> Result<Allocation> {
        let mut state = self.state();

        let guard = self.inner.table.lock().map_err(|e| {
            error!(test_id = %test_id, error = %e, "Could not lock device table");
            LabError::from(e)
        })?;
        let mut entries = Self::load_merged(&guard, &mut state);

        if let Some(existing) = state.allocations.get(test_id) {
            debug!(test_id = %test_id, device = %existing.device_id, "Allocation already held");
            return Ok(existing.clone());
        }

        let Some(device) = state
            .devices
            .iter_mut()
            .find(|d| d.platform == platform && !d.in_use)
        else {
            warn!(test_id = %test_id, platform = %platform, "No free device available");
            return Err(LabError::ResourceExhausted { platform });
        };

        device.in_use = true;
        let allocation = Allocation::local(test_id, platform, &device.id);
        info!(
            test_id = %test_id,
            device = %device.id,
            device_name = %device.device_name,
            platform = %platform,
            "Allocated device"
        );

        entries.insert(test_id.to_string(), lock_entry(&allocation));
        state
            .allocations
            .insert(test_id.to_string(), allocation.clone());
        state.unsynced_releases.remove(test_id);

        match guard.store(&entries) {
            Ok(()) => state.mark_synced(),
            Err(e) => {
                error!(
                    test_id = %test_id,
                    error = %e,
                    "Failed to persist lock table, allocation kept in memory only"
                );
                state.unsynced.insert(test_id.to_string());
            }
        }

        Ok(allocation)
    }

    /// Free the device held by `test_id`.
    ///
    /// Returns `Ok(false)` when nothing was held. An `IoFailure` means the
    /// in-memory release happened but the lock table could not be updated;
    /// the removal is replayed on the next successful write.
    pub fn release(&self, test_id: &str) -> Result<bool> {
        let mut state = self.state();

        let guard = match self.inner.table.lock() {
            Ok(guard) => guard,
            Err(e) => {
                let released = Self::release_in_memory(&mut state, test_id);
                if released {
                    state.unsynced_releases.insert(test_id.to_string());
                }
                error!(
                    test_id = %test_id,
                    released = released,
                    error = %e,
                    "Could not lock device table, release applied in memory only"
                );
                return Err(e.into());
            }
        };
        let mut entries = Self::load_merged(&guard, &mut state);

        let in_table = entries.remove(test_id);
        let released = Self::release_in_memory(&mut state, test_id);

        let Some(entry) = in_table else {
            if !released {
                warn!(test_id = %test_id, "Release requested but no device is allocated");
            }
            return Ok(released);
        };

        info!(test_id = %test_id, device = %entry.device_id, "Released device");

        if let Err(e) = guard.store(&entries) {
            error!(test_id = %test_id, error = %e, "Failed to persist lock table after release");
            state.unsynced_releases.insert(test_id.to_string());
            return Err(e.into());
        }
        state.mark_synced();

        Ok(true)
    }

    /// Load the table under `guard`, replay unsynced mutations and adopt it.
    /// An unreadable table falls back to the in-memory view.
    fn load_merged(guard: &LockTableGuard<'_>, state: &mut PoolState) -> LockMap {
        match guard.load() {
            Ok(mut entries) => {
                state.replay_unsynced(&mut entries);
                state.adopt(&entries);
                entries
            }
            Err(e) => {
                error!(error = %e, "Lock table unreadable, merging from in-memory view");
                state.to_lock_map()
            }
        }
    }

    fn release_in_memory(state: &mut PoolState, test_id: &str) -> bool {
        state.unsynced.remove(test_id);
        let Some(allocation) = state.allocations.remove(test_id) else {
            return false;
        };
        if let Some(device) = state
            .devices
            .iter_mut()
            .find(|d| d.id == allocation.device_id)
        {
            device.in_use = false;
        }
        true
    }

    /// Re-read the lock table into the in-memory view without mutating it
    pub fn refresh(&self) -> Result<()> {
        let mut entries = self.inner.table.snapshot()?;
        let mut state = self.state();
        state.replay_unsynced(&mut entries);
        state.adopt(&entries);
        Ok(())
    }

    /// Free devices per platform.
    ///
    /// Diagnostics only: another process may take a listed device before
    /// the next `allocate`.
    pub fn available(&self) -> DevicesByPlatform {
        let state = self.state();
        let mut free = DevicesByPlatform::new();
        for device in state.devices.iter().filter(|d| !d.in_use) {
            free.entry(device.platform).or_default().push(device.clone());
        }
        free
    }

    pub fn is_allocated(&self, test_id: &str) -> bool {
        self.state().allocations.contains_key(test_id)
    }

    pub fn allocation(&self, test_id: &str) -> Option<Allocation> {
        self.state().allocations.get(test_id).cloned()
    }

    pub fn allocations(&self) -> Vec<Allocation> {
        let mut allocations: Vec<Allocation> =
            self.state().allocations.values().cloned().collect();
        allocations.sort_by(|a, b| a.test_id.cmp(&b.test_id));
        allocations
    }

    pub fn device(&self, device_id: &str) -> Option<Device> {
        self.state()
            .devices
            .iter()
            .find(|d| d.id == device_id)
            .cloned()
    }

    /// Every device in registration order
    pub fn devices(&self) -> Vec<Device> {
        self.state().devices.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn android_pool(ids: &[&str]) -> DevicesByPlatform {
        let devices = ids
            .iter()
            .map(|id| Device::new(*id, Platform::Android, format!("Pixel {}", id), "14"))
            .collect();
        DevicesByPlatform::from([(Platform::Android, devices)])
    }

    fn registry(dir: &TempDir) -> PoolRegistry {
        PoolRegistry::new(LockTable::new(
            dir.path().join("locks.json"),
            Duration::from_secs(2),
        ))
    }

    #[test]
    fn test_allocate_release_scenario() {
        let dir = TempDir::new().unwrap();
        let pool = registry(&dir);
        pool.initialize_pool(android_pool(&["A", "B"]));

        assert_eq!(pool.allocate(Platform::Android, "t1").unwrap().device_id, "A");
        assert_eq!(pool.allocate(Platform::Android, "t2").unwrap().device_id, "B");
        assert!(matches!(
            pool.allocate(Platform::Android, "t3"),
            Err(LabError::ResourceExhausted {
                platform: Platform::Android
            })
        ));

        assert!(pool.release("t1").unwrap());
        assert_eq!(pool.allocate(Platform::Android, "t3").unwrap().device_id, "A");
    }

    #[test]
    fn test_allocate_is_reentrant() {
        let dir = TempDir::new().unwrap();
        let pool = registry(&dir);
        pool.initialize_pool(android_pool(&["A", "B"]));

        let first = pool.allocate(Platform::Android, "t1").unwrap();
        let second = pool.allocate(Platform::Android, "t1").unwrap();

        assert_eq!(first, second);
        assert_eq!(pool.available()[&Platform::Android].len(), 1);
    }

    #[test]
    fn test_reentry_after_operator_clear_is_persisted_again() {
        let dir = TempDir::new().unwrap();
        let pool = registry(&dir);
        pool.initialize_pool(android_pool(&["A", "B"]));
        pool.allocate(Platform::Android, "t1").unwrap();

        pool.lock_table().clear(None).unwrap();

        let again = pool.allocate(Platform::Android, "t1").unwrap();
        let entries = pool.lock_table().snapshot().unwrap();
        assert_eq!(entries["t1"].device_id, again.device_id);
        assert_eq!(pool.allocations().len(), 1);
    }

    #[test]
    fn test_release_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let pool = registry(&dir);
        pool.initialize_pool(android_pool(&["A"]));
        pool.allocate(Platform::Android, "t1").unwrap();

        assert!(pool.release("t1").unwrap());
        let after_first = (pool.devices(), pool.lock_table().snapshot().unwrap());

        assert!(!pool.release("t1").unwrap());
        let after_second = (pool.devices(), pool.lock_table().snapshot().unwrap());

        assert_eq!(after_first, after_second);
        assert!(!pool.is_allocated("t1"));
    }

    #[test]
    fn test_platforms_do_not_share_devices() {
        let dir = TempDir::new().unwrap();
        let pool = registry(&dir);
        let mut devices = android_pool(&["A"]);
        devices.insert(
            Platform::Ios,
            vec![Device::new("iphone-1", Platform::Ios, "iPhone 15", "17.2")],
        );
        pool.initialize_pool(devices);

        assert_eq!(pool.allocate(Platform::Ios, "t1").unwrap().device_id, "iphone-1");
        assert!(pool.allocate(Platform::Ios, "t2").is_err());
        assert_eq!(pool.allocate(Platform::Android, "t2").unwrap().device_id, "A");
    }

    #[test]
    fn test_allocation_is_persisted() {
        let dir = TempDir::new().unwrap();
        let pool = registry(&dir);
        pool.initialize_pool(android_pool(&["A"]));
        pool.allocate(Platform::Android, "t1").unwrap();

        let entries = pool.lock_table().snapshot().unwrap();
        assert_eq!(entries["t1"].device_id, "A");
        assert_eq!(entries["t1"].platform, Platform::Android);

        pool.release("t1").unwrap();
        assert!(pool.lock_table().snapshot().unwrap().is_empty());
    }

    #[test]
    fn test_initialize_restores_known_and_drops_unknown() {
        let dir = TempDir::new().unwrap();
        let table = LockTable::new(dir.path().join("locks.json"), Duration::from_secs(2));

        let mut entries = LockMap::new();
        entries.insert(
            "crashed".to_string(),
            LockEntry {
                platform: Platform::Android,
                device_id: "B".to_string(),
                timestamp: Utc::now(),
            },
        );
        entries.insert(
            "elsewhere".to_string(),
            LockEntry {
                platform: Platform::Android,
                device_id: "Z".to_string(),
                timestamp: Utc::now(),
            },
        );
        table.lock().unwrap().store(&entries).unwrap();

        let pool = PoolRegistry::new(table);
        let report = pool.initialize_pool(android_pool(&["A", "B"]));

        assert_eq!(report.restored, 1);
        assert_eq!(report.dropped, 1);
        assert!(pool.is_allocated("crashed"));
        assert!(!pool.is_allocated("elsewhere"));
        assert!(pool.device("B").unwrap().in_use);

        let free: Vec<String> = pool.available()[&Platform::Android]
            .iter()
            .map(|d| d.id.clone())
            .collect();
        assert_eq!(free, vec!["A".to_string()]);
    }

    #[test]
    fn test_unknown_entries_survive_writes() {
        let dir = TempDir::new().unwrap();
        let table = LockTable::new(dir.path().join("locks.json"), Duration::from_secs(2));
        let mut entries = LockMap::new();
        entries.insert(
            "other-pool".to_string(),
            LockEntry {
                platform: Platform::Ios,
                device_id: "ipad-9".to_string(),
                timestamp: Utc::now(),
            },
        );
        table.lock().unwrap().store(&entries).unwrap();

        let pool = PoolRegistry::new(table);
        pool.initialize_pool(android_pool(&["A"]));
        pool.allocate(Platform::Android, "t1").unwrap();
        pool.release("t1").unwrap();

        let persisted = pool.lock_table().snapshot().unwrap();
        assert!(persisted.contains_key("other-pool"));
    }

    #[test]
    fn test_stale_ttl_reclaims_old_entries() {
        let dir = TempDir::new().unwrap();
        let table = LockTable::new(dir.path().join("locks.json"), Duration::from_secs(2));

        let mut entries = LockMap::new();
        entries.insert(
            "stale".to_string(),
            LockEntry {
                platform: Platform::Android,
                device_id: "A".to_string(),
                timestamp: Utc::now() - chrono::Duration::hours(3),
            },
        );
        entries.insert(
            "live".to_string(),
            LockEntry {
                platform: Platform::Android,
                device_id: "B".to_string(),
                timestamp: Utc::now(),
            },
        );
        table.lock().unwrap().store(&entries).unwrap();

        let pool = PoolRegistry::with_stale_ttl(table, Duration::from_secs(3600));
        let report = pool.initialize_pool(android_pool(&["A", "B"]));

        assert_eq!(report.reclaimed, 1);
        assert_eq!(report.restored, 1);
        assert!(!pool.device("A").unwrap().in_use);
        assert!(pool.device("B").unwrap().in_use);
        assert!(!pool.lock_table().snapshot().unwrap().contains_key("stale"));
    }

    #[test]
    fn test_corrupt_table_is_replaced_on_next_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locks.json");
        std::fs::write(&path, "garbage").unwrap();

        let pool = PoolRegistry::new(LockTable::new(&path, Duration::from_secs(2)));
        pool.initialize_pool(android_pool(&["A"]));

        assert_eq!(pool.allocate(Platform::Android, "t1").unwrap().device_id, "A");
        assert_eq!(pool.lock_table().snapshot().unwrap()["t1"].device_id, "A");
    }

    #[test]
    fn test_duplicate_device_ids_are_skipped() {
        let dir = TempDir::new().unwrap();
        let pool = registry(&dir);
        pool.initialize_pool(android_pool(&["A", "A", "B"]));

        let ids: Vec<String> = pool.devices().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn test_reinitialize_resets_catalog() {
        let dir = TempDir::new().unwrap();
        let pool = registry(&dir);
        pool.initialize_pool(android_pool(&["A"]));
        pool.allocate(Platform::Android, "t1").unwrap();
        pool.release("t1").unwrap();

        pool.initialize_pool(android_pool(&["C", "D"]));
        let ids: Vec<String> = pool.devices().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["C".to_string(), "D".to_string()]);
        assert!(pool.devices().iter().all(|d| !d.in_use));
    }
}
