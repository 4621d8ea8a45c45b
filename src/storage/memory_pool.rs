use crate::core::Transaction;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Pending transactions keyed by hex txid. Not persisted.
#[derive(Default)]
pub struct MemoryPool {
    inner: RwLock<HashMap<String, Transaction>>,
}

impl MemoryPool {
    pub fn new() -> MemoryPool {
        MemoryPool::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Transaction>> {
        self.inner.read().unwrap_or_else(|poisoned| {
            log::error!("Memory pool lock poisoned, recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Transaction>> {
        self.inner.write().unwrap_or_else(|poisoned| {
            log::error!("Memory pool lock poisoned, recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    pub fn get(&self, txid_hex: &str) -> Option<Transaction> {
        self.read().get(txid_hex).cloned()
    }

    /// Inserts `tx`; returns false when it was already pending.
    pub fn add(&self, tx: Transaction) -> bool {
        self.write().insert(tx.get_id_hex(), tx).is_none()
    }

    pub fn contains(&self, txid_hex: &str) -> bool {
        self.read().contains_key(txid_hex)
    }

    pub fn remove(&self, txid_hex: &str) -> Option<Transaction> {
        self.write().remove(txid_hex)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn get_all(&self) -> Vec<Transaction> {
        self.read().values().cloned().collect()
    }
}

/// Block hashes announced by a peer and not downloaded yet, in the order
/// the peer listed them.
#[derive(Default)]
pub struct BlockInTransit {
    inner: RwLock<Vec<Vec<u8>>>,
}

impl BlockInTransit {
    pub fn new() -> BlockInTransit {
        BlockInTransit::default()
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Vec<u8>>> {
        self.inner.write().unwrap_or_else(|poisoned| {
            log::error!("Block transit lock poisoned, recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    /// Replaces the queue with a new announcement.
    pub fn replace(&self, blocks: &[Vec<u8>]) {
        *self.write() = blocks.to_vec();
    }

    /// Removes and returns the next hash to request.
    pub fn pop_front(&self) -> Option<Vec<u8>> {
        let mut inner = self.write();
        if inner.is_empty() {
            None
        } else {
            Some(inner.remove(0))
        }
    }

    pub fn len(&self) -> usize {
        self.write().len()
    }

    pub fn is_empty(&self) -> bool {
        self.write().is_empty()
    }
}
