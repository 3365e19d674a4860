//! Scenarios with several attached processes: crash recovery through the
//! inventory, shared lifecycle of segments and file-backed attachment.

mod common;

use std::sync::Arc;
use std::thread;

use common::{small_config, Cluster, DB, TPB};
use tic_cache::{names, ActiveSnapshots, DatabaseHandle, TransactionCache};
use tic_error::TicError;
use tic_inventory::{ControlPage, TransactionInventory};
use tic_lock::{LockId, LockManager, LockMode, WaitPolicy};
use tic_shm::SegmentStore;
use tic_types::{BlockNumber, CommitNumber, TxnNumber, TxnState};

// ---------------------------------------------------------------------------
// Crash recovery
// ---------------------------------------------------------------------------

/// While the owner is alive the cached state is authoritative.
#[test]
fn test_snapshot_state_trusts_live_owner() {
    let cluster = Cluster::new();
    let a = cluster.attach();
    let b = cluster.attach();
    let t = b.start_transaction();
    b.cache.set_state(t, TxnState::Limbo).unwrap();

    assert_eq!(a.cache.snapshot_state(t).unwrap(), CommitNumber::LIMBO);
    assert_eq!(b.cache.snapshot_state(t).unwrap(), CommitNumber::LIMBO);
    let active = b.start_transaction();
    assert_eq!(a.cache.snapshot_state(active).unwrap(), CommitNumber::ACTIVE);
    assert_eq!(
        cluster.inventory.read_state(active).unwrap(),
        TxnState::Active,
        "a live transaction must not be touched"
    );
}

/// After a crash the inventory decides: unrecorded transactions die,
/// recorded commits get a fresh number and limbo stays limbo.
#[test]
fn test_snapshot_state_reconciles_after_crash() {
    let cluster = Cluster::new();
    let a = cluster.attach();
    let b = cluster.attach();

    let unrecorded = b.start_transaction();
    let committed = b.start_transaction();
    let limbo = b.start_transaction();
    let dead = b.start_transaction();
    // `b` wrote these outcomes to disk but died before updating the cache.
    cluster
        .inventory
        .write_state(committed, TxnState::Committed)
        .unwrap();
    cluster.inventory.write_state(dead, TxnState::Dead).unwrap();
    cluster.inventory.write_state(limbo, TxnState::Limbo).unwrap();
    b.cache.set_state(limbo, TxnState::Limbo).unwrap();
    let before = a.cache.latest_commit();
    b.crash();

    assert_eq!(a.cache.cache_state(unrecorded).unwrap(), CommitNumber::ACTIVE);
    assert_eq!(
        a.cache.snapshot_state(unrecorded).unwrap(),
        CommitNumber::DEAD
    );
    assert_eq!(
        cluster.inventory.read_state(unrecorded).unwrap(),
        TxnState::Dead
    );

    let cn = a.cache.snapshot_state(committed).unwrap();
    assert!(cn.is_assigned() && cn > before);
    assert_eq!(a.cache.cache_state(committed).unwrap(), cn);
    assert_eq!(a.cache.snapshot_state(committed).unwrap(), cn);

    assert_eq!(a.cache.snapshot_state(limbo).unwrap(), CommitNumber::LIMBO);
    assert_eq!(a.cache.snapshot_state(dead).unwrap(), CommitNumber::DEAD);
}

/// Two survivors reconciling the same orphan agree on its commit number.
#[test]
fn test_reconciliation_races_converge() {
    let cluster = Cluster::new();
    let a = cluster.attach();
    let c = cluster.attach();
    let b = cluster.attach();
    let orphans: Vec<TxnNumber> = (0..10).map(|_| b.start_transaction()).collect();
    for t in &orphans {
        cluster
            .inventory
            .write_state(*t, TxnState::Committed)
            .unwrap();
    }
    b.crash();

    let (seen_a, seen_c) = thread::scope(|s| {
        let ha = s.spawn(|| {
            orphans
                .iter()
                .map(|t| a.cache.snapshot_state(*t).unwrap())
                .collect::<Vec<_>>()
        });
        let hc = s.spawn(|| {
            orphans
                .iter()
                .rev()
                .map(|t| c.cache.snapshot_state(*t).unwrap())
                .collect::<Vec<_>>()
        });
        (ha.join().unwrap(), hc.join().unwrap())
    });
    let seen_c: Vec<CommitNumber> = seen_c.into_iter().rev().collect();
    assert_eq!(seen_a, seen_c);
    assert!(seen_a.iter().all(|cn| cn.is_assigned()));
}

// ---------------------------------------------------------------------------
// Shared lifecycle
// ---------------------------------------------------------------------------

/// State outlives any single process while one stays attached.
#[test]
fn test_state_survives_detach_and_reattach() {
    let cluster = Cluster::new();
    let keeper = cluster.attach();
    let (t, cn) = {
        let p = cluster.attach();
        let t = p.start_transaction();
        let cn = p.cache.set_state(t, TxnState::Committed).unwrap();
        p.cache.finalize().unwrap();
        (t, cn)
    };
    let again = cluster.attach();
    assert_eq!(again.cache.cache_state(t).unwrap(), cn);
    assert_eq!(keeper.cache.cache_state(t).unwrap(), cn);
    assert_eq!(again.cache.latest_commit(), cn);
}

#[test]
fn test_finalized_cache_rejects_operations() {
    let cluster = Cluster::new();
    let p = cluster.attach();
    let att = p.attach_connection();
    p.cache.finalize().unwrap();

    assert!(matches!(
        p.cache.next_transaction_id().unwrap_err(),
        TicError::Finalized
    ));
    assert!(matches!(
        p.cache.begin_snapshot(att).unwrap_err(),
        TicError::Finalized
    ));
    let mut active = ActiveSnapshots::new();
    assert!(matches!(
        p.cache.update_active_snapshots(&mut active).unwrap_err(),
        TicError::Finalized
    ));
    assert!(p.cache.finalize().is_ok());
}

/// Dropping a cache gives up its block locks, so peers can delete blocks
/// without waiting.
#[test]
fn test_dropped_cache_releases_block_locks() {
    let cluster = Cluster::new();
    let a = cluster.attach();
    {
        let b = cluster.attach();
        let t = b.start_transaction();
        b.cache.set_state(t, TxnState::Dead).unwrap();
        assert_eq!(
            cluster.locks.holder_count(LockId::StatusBlock(BlockNumber::new(0))),
            1
        );
    }
    assert_eq!(
        cluster.locks.holder_count(LockId::StatusBlock(BlockNumber::new(0))),
        0
    );
    let horizon = TxnNumber::new(TPB * 4);
    a.cache.update_oldest_transaction(horizon, horizon).unwrap();
    assert!(!cluster
        .store
        .exists(&names::block_segment(DB, BlockNumber::new(0)))
        .unwrap());
}

/// A peer that cannot give up a block makes deletion wait for a later pass.
#[test]
fn test_block_release_deferred_while_peer_holds_lock() {
    let cluster = Cluster::new();
    let a = cluster.attach();
    let stubborn = cluster.locks.owner();
    let zero = LockId::StatusBlock(BlockNumber::new(0));
    let t = a.start_transaction();
    a.cache.set_state(t, TxnState::Committed).unwrap();
    assert!(stubborn
        .acquire(zero, LockMode::Shared, WaitPolicy::NoWait)
        .unwrap());

    let horizon = TxnNumber::new(TPB * 4);
    a.cache.update_oldest_transaction(horizon, horizon).unwrap();
    assert!(cluster
        .store
        .exists(&names::block_segment(DB, BlockNumber::new(0)))
        .unwrap());
    assert!(!a.cache.mapped_blocks().contains(&BlockNumber::new(0)));
    assert_eq!(a.cache.cache_state(t).unwrap(), CommitNumber::PREHISTORIC);

    stubborn.release(zero).unwrap();
    a.cache.update_oldest_transaction(horizon, horizon).unwrap();
    assert!(!cluster
        .store
        .exists(&names::block_segment(DB, BlockNumber::new(0)))
        .unwrap());
}

#[test]
fn test_many_processes_commit_concurrently() {
    let cluster = Cluster::new();
    let processes: Vec<_> = (0..4).map(|_| cluster.attach()).collect();
    let numbers: Vec<CommitNumber> = thread::scope(|s| {
        let handles: Vec<_> = processes
            .iter()
            .map(|p| {
                s.spawn(move || {
                    (0..50)
                        .map(|_| {
                            let t = p.start_transaction();
                            let cn = p.cache.set_state(t, TxnState::Committed).unwrap();
                            p.finish_transaction(t);
                            cn
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect()
    });
    let mut sorted = numbers.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), numbers.len(), "commit numbers were reused");
    assert_eq!(processes[0].cache.latest_commit(), *sorted.last().unwrap());
    // Blocks created by one process are visible to all.
    let blocks = processes[0].cache.next_transaction_id().unwrap().block(TPB);
    assert!(blocks.get() >= 200 / TPB);
}

#[test]
fn test_handle_debug_and_accessors() {
    let cluster = Cluster::new();
    let p = cluster.attach();
    assert_eq!(p.cache.database_id(), DB);
    assert_eq!(p.cache.transactions_per_block(), TPB);
    assert_eq!(p.cache.config(), &small_config());
    assert!(format!("{:?}", p.cache).contains("TransactionCache"));
}

// ---------------------------------------------------------------------------
// File-backed attachment
// ---------------------------------------------------------------------------

#[cfg(unix)]
mod file_backed {
    use super::*;
    use tic_inventory::FileInventory;
    use tic_lock::FileLockTable;
    use tic_shm::FileSegmentStore;

    struct Files {
        _dir: tempfile::TempDir,
        store: Arc<FileSegmentStore>,
        locks: FileLockTable,
        inventory: Arc<FileInventory>,
    }

    fn files() -> Files {
        let dir = tempfile::tempdir().unwrap();
        Files {
            store: Arc::new(FileSegmentStore::new(dir.path().join("shm")).unwrap()),
            locks: FileLockTable::open(dir.path().join("locks")).unwrap(),
            inventory: Arc::new(FileInventory::open(dir.path().join("inventory")).unwrap()),
            _dir: dir,
        }
    }

    fn open(files: &Files) -> (TransactionCache, Arc<dyn LockManager>) {
        let locks: Arc<dyn LockManager> = Arc::new(files.locks.owner());
        let handle = DatabaseHandle::new(
            DB,
            Arc::clone(&files.store) as Arc<dyn SegmentStore>,
            Arc::clone(&locks),
            Arc::clone(&files.inventory) as Arc<dyn TransactionInventory>,
        );
        (TransactionCache::initialize(&handle, small_config()).unwrap(), locks)
    }

    #[test]
    fn test_file_backed_caches_share_state() {
        let files = files();
        let (a, _a_locks) = open(&files);
        let (b, _b_locks) = open(&files);

        let t = a.next_transaction_id().unwrap();
        let cn = a.set_state(t, TxnState::Committed).unwrap();
        assert_eq!(b.cache_state(t).unwrap(), cn);

        let att = b.next_attachment_id().unwrap();
        let (h, seen) = b.begin_snapshot(att).unwrap();
        assert_eq!(seen, cn);
        b.end_snapshot(h).unwrap();
        assert_eq!(a.snapshot_slots_used().unwrap(), 0);
    }

    #[test]
    fn test_file_backed_blocks_are_reclaimed() {
        let files = files();
        let (a, _a_locks) = open(&files);
        let (b, _b_locks) = open(&files);
        let t = a.next_transaction_id().unwrap();
        a.set_state(t, TxnState::Dead).unwrap();
        assert_eq!(b.cache_state(t).unwrap(), CommitNumber::DEAD);

        let horizon = TxnNumber::new(TPB * 4);
        b.update_oldest_transaction(horizon, horizon).unwrap();
        assert!(!files
            .store
            .exists(&names::block_segment(DB, BlockNumber::new(0)))
            .unwrap());
        assert_eq!(a.cache_state(t).unwrap(), CommitNumber::PREHISTORIC);
    }

    /// A cache rebuilt from scratch reads its outcomes back from the file
    /// inventory.
    #[test]
    fn test_file_backed_cache_rebuilds_from_inventory() {
        let files = files();
        let (t, cn) = {
            let (a, _locks) = open(&files);
            let t = a.next_transaction_id().unwrap();
            let cn = a.set_state(t, TxnState::Committed).unwrap();
            files
                .inventory
                .write_state(t, TxnState::Committed)
                .unwrap();
            files
                .inventory
                .write_control(ControlPage {
                    oldest_interesting: t,
                    next_transaction: a.next_transaction_id().unwrap(),
                })
                .unwrap();
            (t, cn)
        };
        for name in [names::header_segment(DB), names::snapshot_segment(DB)] {
            files.store.remove(&name).unwrap();
        }

        let (fresh, _locks) = open(&files);
        assert!(cn.is_assigned());
        assert_eq!(fresh.cache_state(t).unwrap(), CommitNumber::PREHISTORIC);
        assert_eq!(fresh.oldest_transaction(), t);
    }
}
