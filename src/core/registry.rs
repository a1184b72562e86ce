//! Pool name to device mapping.
//!
//! One entry per pool. An entry is created on the first readiness report
//! from a pool and replaced wholesale, with a freshly allocated id, when a
//! report shows the pool restarted. Nothing is persisted: a new process
//! starts allocating from the first id after the reserved one.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::allocator::DeviceIdAllocator;
use super::device::{Device, DeviceId, RoundRobinStripingPattern, StripingPattern};

#[derive(Default)]
struct Maps {
    by_pool: HashMap<String, Arc<Device>>,
    by_id: HashMap<DeviceId, String>,
}

pub struct DeviceRegistry {
    allocator: DeviceIdAllocator,
    striping: Arc<dyn StripingPattern>,
    maps: RwLock<Maps>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(Arc::new(RoundRobinStripingPattern))
    }
}

impl DeviceRegistry {
    pub fn new(striping: Arc<dyn StripingPattern>) -> Self {
        Self {
            allocator: DeviceIdAllocator::new(),
            striping,
            maps: RwLock::new(Maps::default()),
        }
    }

    /// Record a readiness report and return the device now serving `pool`.
    pub fn record_ready(&self, pool: &str, addresses: &[SocketAddr], verifier: u64) -> Arc<Device> {
        if let Some(device) = self.maps.read().by_pool.get(pool) {
            if !device.is_restarted(addresses, verifier) {
                return device.clone();
            }
        }

        let mut maps = self.maps.write();
        // re-check: another report may have replaced the entry meanwhile
        let previous = match maps.by_pool.get(pool) {
            Some(device) if !device.is_restarted(addresses, verifier) => return device.clone(),
            Some(device) => Some(device.id),
            None => None,
        };

        let id = self.allocator.next();
        let device = Arc::new(Device::new(
            id,
            self.striping.as_ref(),
            addresses.to_vec(),
            verifier,
        ));

        if let Some(old) = previous {
            maps.by_id.remove(&old);
        }
        maps.by_id.insert(id, pool.to_string());
        maps.by_pool.insert(pool.to_string(), device.clone());
        drop(maps);

        match previous {
            Some(old) => info!(pool, old_id = %old, device_id = %id, "Pool restarted, new device id"),
            None => debug!(pool, device_id = %id, "New pool mapping: {}", device),
        }
        device
    }

    pub fn lookup_by_pool(&self, pool: &str) -> Option<Arc<Device>> {
        self.maps.read().by_pool.get(pool).cloned()
    }

    pub fn lookup_by_id(&self, id: DeviceId) -> Option<Arc<Device>> {
        let maps = self.maps.read();
        let pool = maps.by_id.get(&id)?;
        maps.by_pool.get(pool).cloned()
    }

    /// All entries, sorted by pool name.
    pub fn list(&self) -> Vec<(String, Arc<Device>)> {
        let mut entries: Vec<_> = self
            .maps
            .read()
            .by_pool
            .iter()
            .map(|(name, dev)| (name.clone(), dev.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<_> = self.maps.read().by_id.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Forget the device of `pool`. The next report from it mints a new id.
    pub fn remove(&self, pool: &str) -> Option<Arc<Device>> {
        let mut maps = self.maps.write();
        let device = maps.by_pool.remove(pool)?;
        maps.by_id.remove(&device.id);
        Some(device)
    }

    pub fn len(&self) -> usize {
        self.maps.read().by_pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(list: &[&str]) -> Vec<SocketAddr> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn first_report_mints_id() {
        let reg = DeviceRegistry::default();
        let dev = reg.record_ready("pool-1", &addrs(&["10.0.0.1:2049"]), 7);

        assert_eq!(dev.id, DeviceId(1));
        assert_eq!(reg.lookup_by_pool("pool-1").unwrap().id, DeviceId(1));
        assert_eq!(reg.lookup_by_id(DeviceId(1)).unwrap().addresses, dev.addresses);
    }

    #[test]
    fn same_verifier_reuses_id() {
        let reg = DeviceRegistry::default();
        let a = reg.record_ready("pool-1", &addrs(&["10.0.0.1:2049"]), 7);
        let b = reg.record_ready("pool-1", &addrs(&["10.0.0.1:2049"]), 7);

        assert_eq!(a.id, b.id);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn changed_verifier_mints_new_id() {
        let reg = DeviceRegistry::default();
        let a = reg.record_ready("pool-1", &addrs(&["10.0.0.1:2049"]), 7);
        let b = reg.record_ready("pool-1", &addrs(&["10.0.0.1:2049"]), 9);

        assert_ne!(a.id, b.id);
        assert!(b.id > a.id);
        assert!(reg.lookup_by_id(a.id).is_none());
        assert_eq!(reg.lookup_by_pool("pool-1").unwrap().id, b.id);
        assert_eq!(reg.device_ids(), vec![b.id]);
    }

    #[test]
    fn changed_addresses_mint_new_id_without_verifier() {
        let reg = DeviceRegistry::default();
        let a = reg.record_ready("pool-1", &addrs(&["10.0.0.1:2049"]), 0);
        let same = reg.record_ready("pool-1", &addrs(&["10.0.0.1:2049"]), 0);
        let moved = reg.record_ready("pool-1", &addrs(&["10.0.0.2:2049"]), 0);

        assert_eq!(a.id, same.id);
        assert_ne!(a.id, moved.id);
    }

    #[test]
    fn pools_get_distinct_ids() {
        let reg = DeviceRegistry::default();
        let a = reg.record_ready("pool-a", &addrs(&["10.0.0.1:2049"]), 1);
        let b = reg.record_ready("pool-b", &addrs(&["10.0.0.2:2049"]), 1);

        assert_ne!(a.id, b.id);
        let names: Vec<_> = reg.list().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["pool-a", "pool-b"]);
    }

    #[test]
    fn remove_forgets_mapping() {
        let reg = DeviceRegistry::default();
        let a = reg.record_ready("pool-1", &addrs(&["10.0.0.1:2049"]), 7);

        assert_eq!(reg.remove("pool-1").unwrap().id, a.id);
        assert!(reg.remove("pool-1").is_none());
        assert!(reg.lookup_by_id(a.id).is_none());
        assert!(reg.is_empty());

        let b = reg.record_ready("pool-1", &addrs(&["10.0.0.1:2049"]), 7);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn concurrent_reports_agree_on_one_id() {
        let reg = Arc::new(DeviceRegistry::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = reg.clone();
                std::thread::spawn(move || reg.record_ready("pool-1", &addrs(&["10.0.0.1:2049"]), 3).id)
            })
            .collect();

        let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(reg.device_ids().len(), 1);
    }
}
