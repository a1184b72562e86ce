//! Active transfers keyed by the client's state id.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::state::StateId;
use super::transfer::Transfer;

#[derive(Default)]
pub struct TransferLedger {
    transfers: DashMap<StateId, Arc<Transfer>>,
}

impl TransferLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the transfer for `state_id`, creating it with `factory` if
    /// there is none. The flag tells whether this call created it; only the
    /// creator goes on to select a pool.
    ///
    /// `factory` runs under the map's shard lock and must not block.
    pub fn get_or_create<F>(&self, state_id: StateId, factory: F) -> (Arc<Transfer>, bool)
    where
        F: FnOnce() -> Transfer,
    {
        match self.transfers.entry(state_id) {
            Entry::Occupied(e) => (e.get().clone(), false),
            Entry::Vacant(e) => {
                let transfer = Arc::new(factory());
                e.insert(transfer.clone());
                (transfer, true)
            }
        }
    }

    pub fn get(&self, state_id: &StateId) -> Option<Arc<Transfer>> {
        self.transfers.get(state_id).map(|t| t.clone())
    }

    pub fn remove(&self, state_id: &StateId) -> Option<Arc<Transfer>> {
        self.transfers.remove(state_id).map(|(_, t)| t)
    }

    /// Remove only if the registered transfer is `transfer` itself.
    pub fn remove_if_same(&self, transfer: &Arc<Transfer>) -> bool {
        self.transfers
            .remove_if(&transfer.state_id(), |_, t| Arc::ptr_eq(t, transfer))
            .is_some()
    }

    /// Snapshot of all registered transfers.
    pub fn values(&self) -> Vec<Arc<Transfer>> {
        self.transfers.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::namespace::{FileHandle, FileId, FileKind, Inode};
    use crate::core::transfer::{IoMode, Subject};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sid(n: u8) -> StateId {
        StateId::new([n; 12], 1)
    }

    fn make(state_id: StateId) -> Transfer {
        Transfer::new(
            state_id,
            Inode {
                id: FileId("0001".into()),
                kind: FileKind::Regular,
                handle: FileHandle(vec![0]),
            },
            IoMode::Read,
            Subject::ROOT,
            "127.0.0.1:700".parse().unwrap(),
        )
    }

    #[test]
    fn second_call_reuses_transfer() {
        let ledger = TransferLedger::new();
        let (a, created_a) = ledger.get_or_create(sid(1), || make(sid(1)));
        let (b, created_b) = ledger.get_or_create(sid(1), || panic!("factory called twice"));

        assert!(created_a);
        assert!(!created_b);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn remove_and_get() {
        let ledger = TransferLedger::new();
        ledger.get_or_create(sid(1), || make(sid(1)));
        ledger.get_or_create(sid(2), || make(sid(2)));

        assert!(ledger.get(&sid(1)).is_some());
        assert!(ledger.remove(&sid(1)).is_some());
        assert!(ledger.remove(&sid(1)).is_none());
        assert!(ledger.get(&sid(1)).is_none());
        assert_eq!(ledger.values().len(), 1);
    }

    #[test]
    fn remove_if_same_ignores_replacement() {
        let ledger = TransferLedger::new();
        let (old, _) = ledger.get_or_create(sid(1), || make(sid(1)));
        ledger.remove(&sid(1));
        let (new, _) = ledger.get_or_create(sid(1), || make(sid(1)));

        assert!(!ledger.remove_if_same(&old));
        assert!(ledger.get(&sid(1)).is_some());
        assert!(ledger.remove_if_same(&new));
        assert!(ledger.is_empty());
    }

    #[test]
    fn concurrent_get_or_create_runs_factory_once() {
        let ledger = Arc::new(TransferLedger::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = ledger.clone();
                let calls = calls.clone();
                std::thread::spawn(move || {
                    ledger
                        .get_or_create(sid(9), || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            make(sid(9))
                        })
                        .0
                })
            })
            .collect();

        let transfers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(transfers.iter().all(|t| Arc::ptr_eq(t, &transfers[0])));
    }
}
