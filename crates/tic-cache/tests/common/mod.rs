//! Shared fixtures: several simulated processes attached to one database
//! through a shared in-process segment store, lock table and inventory.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tic_cache::{DatabaseHandle, TransactionCache};
use tic_inventory::{ControlPage, MemoryInventory};
use tic_lock::{LocalLockOwner, LocalLockTable, LockId, LockManager, LockMode, WaitPolicy};
use tic_shm::MemorySegmentStore;
use tic_types::{AttachmentId, CacheConfig, TxnNumber};

pub const DB: &str = "testdb";
pub const TPB: u64 = 16;

pub fn small_config() -> CacheConfig {
    CacheConfig::default()
        .with_transactions_per_block(TPB)
        .with_initial_snapshot_slots(4)
        .with_max_snapshot_slots(16)
        .with_block_release_timeout(Duration::from_millis(50))
}

/// One database shared by every process attached through it.
#[derive(Clone)]
pub struct Cluster {
    pub store: MemorySegmentStore,
    pub locks: LocalLockTable,
    pub inventory: MemoryInventory,
}

impl Cluster {
    pub fn new() -> Self {
        Self::with_control(ControlPage::default())
    }

    pub fn with_control(control: ControlPage) -> Self {
        Self {
            store: MemorySegmentStore::new(),
            locks: LocalLockTable::new(),
            inventory: MemoryInventory::with_control(control),
        }
    }

    pub fn fixed_size() -> Self {
        Self {
            store: MemorySegmentStore::fixed_size(),
            ..Self::new()
        }
    }

    pub fn attach(&self) -> Process {
        self.attach_with(small_config())
    }

    pub fn attach_with(&self, config: CacheConfig) -> Process {
        let owner = Arc::new(self.locks.owner());
        let handle = self.handle(Arc::clone(&owner));
        let cache = TransactionCache::initialize(&handle, config).unwrap();
        Process { cache, owner }
    }

    pub fn handle(&self, owner: Arc<LocalLockOwner>) -> DatabaseHandle {
        DatabaseHandle::new(
            DB,
            Arc::new(self.store.clone()),
            owner,
            Arc::new(self.inventory.clone()),
        )
    }
}

/// One attached process: its cache and the lock owner its engine uses.
pub struct Process {
    pub cache: TransactionCache,
    pub owner: Arc<LocalLockOwner>,
}

impl Process {
    /// Start a transaction the way the engine does: take a number and hold
    /// its transaction lock.
    pub fn start_transaction(&self) -> TxnNumber {
        let txn = self.cache.next_transaction_id().unwrap();
        assert!(self
            .owner
            .acquire(
                LockId::Transaction(txn),
                LockMode::Exclusive,
                WaitPolicy::NoWait
            )
            .unwrap());
        txn
    }

    pub fn finish_transaction(&self, txn: TxnNumber) {
        self.owner.release(LockId::Transaction(txn)).unwrap();
    }

    /// Open an attachment and hold its lock.
    pub fn attach_connection(&self) -> AttachmentId {
        let att = self.cache.next_attachment_id().unwrap();
        assert!(self
            .owner
            .acquire(
                LockId::Attachment(att),
                LockMode::Exclusive,
                WaitPolicy::NoWait
            )
            .unwrap());
        att
    }

    /// Die without cleaning up: every lock of this process goes away.
    pub fn crash(self) {
        let Process { cache, owner } = self;
        owner.release_all().unwrap();
        drop(cache);
        drop(owner);
    }
}
