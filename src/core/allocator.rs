use std::sync::atomic::{AtomicU32, Ordering};

use super::device::{DeviceId, MDS_DEVICE_ID};

/// Hands out device ids. Never returns the metadata-path id.
#[derive(Debug, Default)]
pub struct DeviceIdAllocator {
    last: AtomicU32,
}

impl DeviceIdAllocator {
    pub fn new() -> Self {
        Self {
            last: AtomicU32::new(MDS_DEVICE_ID.0),
        }
    }

    pub fn next(&self) -> DeviceId {
        loop {
            let id = self.last.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != MDS_DEVICE_ID.0 {
                return DeviceId(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn starts_after_reserved_id() {
        let alloc = DeviceIdAllocator::new();
        assert_eq!(alloc.next(), DeviceId(1));
        assert_eq!(alloc.next(), DeviceId(2));
    }

    #[test]
    fn strictly_increasing() {
        let alloc = DeviceIdAllocator::new();
        let mut prev = alloc.next();
        for _ in 0..1000 {
            let id = alloc.next();
            assert!(id > prev);
            assert!(!id.is_mds());
            prev = id;
        }
    }

    #[test]
    fn skips_reserved_id_on_wrap() {
        let alloc = DeviceIdAllocator {
            last: AtomicU32::new(u32::MAX - 1),
        };
        assert_eq!(alloc.next(), DeviceId(u32::MAX));
        assert_eq!(alloc.next(), DeviceId(1));
    }

    #[test]
    fn concurrent_callers_never_share_an_id() {
        let alloc = Arc::new(DeviceIdAllocator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let alloc = alloc.clone();
                std::thread::spawn(move || (0..500).map(|_| alloc.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {}", id);
            }
        }
        assert_eq!(seen.len(), 8 * 500);
    }
}
