//! Snapshot list behaviour: allocation, release, growth and the active
//! snapshot view used by garbage collection.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{Cluster, DB, TPB};
use tic_cache::header::GlobalHeader;
use tic_cache::names;
use tic_cache::snapshot_list::SnapshotList;
use tic_cache::ActiveSnapshots;
use tic_error::{ErrorClass, TicError};
use tic_lock::{LockId, LockManager};
use tic_shm::SegmentStore;
use tic_types::{CommitNumber, SnapshotHandle, TxnState};

/// Map the shared header and snapshot list directly, to stage an allocation
/// that stops between its phases.
fn raw_views(cluster: &Cluster) -> (GlobalHeader, SnapshotList) {
    let hdr = cluster
        .store
        .open_existing(&names::header_segment(DB))
        .unwrap()
        .unwrap();
    let snap = cluster
        .store
        .open_existing(&names::snapshot_segment(DB))
        .unwrap()
        .unwrap();
    (
        GlobalHeader::attach(hdr, TPB).unwrap(),
        SnapshotList::attach(snap).unwrap(),
    )
}

fn commit(p: &common::Process) -> CommitNumber {
    let t = p.start_transaction();
    let cn = p.cache.set_state(t, TxnState::Committed).unwrap();
    p.finish_transaction(t);
    cn
}

// ---------------------------------------------------------------------------
// Begin / end
// ---------------------------------------------------------------------------

/// A snapshot is fixed at the latest commit number when it begins.
#[test]
fn test_snapshot_sees_latest_commit() {
    let cluster = Cluster::new();
    let p = cluster.attach();
    let att = p.attach_connection();

    let (_, before_any) = p.cache.begin_snapshot(att).unwrap();
    assert_eq!(before_any, CommitNumber::PREHISTORIC);

    let cn = commit(&p);
    let (_, seen) = p.cache.begin_snapshot(att).unwrap();
    assert_eq!(seen, cn);
    assert!(cn.visible_to(seen));
    assert_eq!(p.cache.snapshot_slots_used().unwrap(), 2);
}

/// Beginning then ending a snapshot leaves the used mark where it was.
#[test]
fn test_begin_end_restores_used_mark() {
    let cluster = Cluster::new();
    let p = cluster.attach();
    let att = p.attach_connection();
    let (_keep, _) = p.cache.begin_snapshot(att).unwrap();
    let before = p.cache.snapshot_slots_used().unwrap();

    let (h, _) = p.cache.begin_snapshot(att).unwrap();
    assert_eq!(p.cache.snapshot_slots_used().unwrap(), before + 1);
    p.cache.end_snapshot(h).unwrap();
    assert_eq!(p.cache.snapshot_slots_used().unwrap(), before);
}

#[test]
fn test_used_mark_drops_over_free_top_slots() {
    let cluster = Cluster::new();
    let p = cluster.attach();
    let att = p.attach_connection();
    let (h0, _) = p.cache.begin_snapshot(att).unwrap();
    let (h1, _) = p.cache.begin_snapshot(att).unwrap();
    let (h2, _) = p.cache.begin_snapshot(att).unwrap();

    p.cache.end_snapshot(h1).unwrap();
    assert_eq!(p.cache.snapshot_slots_used().unwrap(), 3, "hole below top");
    p.cache.end_snapshot(h2).unwrap();
    assert_eq!(p.cache.snapshot_slots_used().unwrap(), 1);

    // The freed slots are reused before the list grows.
    let (again, _) = p.cache.begin_snapshot(att).unwrap();
    assert_eq!(again.slot(), 1);
    p.cache.end_snapshot(again).unwrap();
    p.cache.end_snapshot(h0).unwrap();
    assert_eq!(p.cache.snapshot_slots_used().unwrap(), 0);
}

#[test]
fn test_ending_unknown_snapshot_is_misuse() {
    let cluster = Cluster::new();
    let p = cluster.attach();
    let att = p.attach_connection();
    let (h, _) = p.cache.begin_snapshot(att).unwrap();
    p.cache.end_snapshot(h).unwrap();

    let err = p.cache.end_snapshot(h).unwrap_err();
    assert!(matches!(err, TicError::InvalidSnapshotHandle { .. }));
    assert_eq!(err.class(), ErrorClass::Misuse);

    let err = p
        .cache
        .end_snapshot(SnapshotHandle::new(999, att))
        .unwrap_err();
    assert!(matches!(
        err,
        TicError::InvalidSnapshotHandle { handle: 999 }
    ));
}

#[test]
fn test_concurrent_snapshots_get_distinct_slots() {
    let cluster = Cluster::new();
    let p = Arc::new(cluster.attach());
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let p = Arc::clone(&p);
            thread::spawn(move || {
                let att = p.attach_connection();
                let (h, _) = p.cache.begin_snapshot(att).unwrap();
                h.slot()
            })
        })
        .collect();
    let slots: BTreeSet<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(slots.len(), 8, "two snapshots shared a slot");
    assert_eq!(p.cache.snapshot_slots_used().unwrap(), 8);
}

#[test]
fn test_concurrent_begin_end_settles_to_empty() {
    let cluster = Cluster::new();
    let a = cluster.attach();
    let b = cluster.attach();
    thread::scope(|s| {
        for p in [&a, &b, &a, &b] {
            s.spawn(move || {
                let att = p.attach_connection();
                for _ in 0..200 {
                    let (h, _) = p.cache.begin_snapshot(att).unwrap();
                    p.cache.end_snapshot(h).unwrap();
                }
            });
        }
    });
    assert_eq!(a.cache.snapshot_slots_used().unwrap(), 0);
    assert_eq!(b.cache.snapshot_slots_used().unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Growth
// ---------------------------------------------------------------------------

/// The list doubles when full and peers follow the new size.
#[test]
fn test_snapshot_list_grows_and_peers_remap() {
    let cluster = Cluster::new();
    let a = cluster.attach();
    let b = cluster.attach();
    let att = a.attach_connection();

    let handles: Vec<SnapshotHandle> = (0..5)
        .map(|_| a.cache.begin_snapshot(att).unwrap().0)
        .collect();
    assert_eq!(handles[4].slot(), 4);
    assert_eq!(a.cache.snapshot_slots_used().unwrap(), 5);

    let peer_att = b.attach_connection();
    let (peer, _) = b.cache.begin_snapshot(peer_att).unwrap();
    assert_eq!(peer.slot(), 5);

    let mut active = ActiveSnapshots::new();
    b.cache.update_active_snapshots(&mut active).unwrap();
    assert_eq!(active.len(), 1, "all six snapshots share one commit number");
    assert_eq!(active.slots_used(), 6);
}

#[test]
fn test_fixed_size_store_cannot_grow() {
    let cluster = Cluster::fixed_size();
    let p = cluster.attach();
    let att = p.attach_connection();
    for _ in 0..4 {
        p.cache.begin_snapshot(att).unwrap();
    }
    let err = p.cache.begin_snapshot(att).unwrap_err();
    assert!(
        matches!(err, TicError::CapacityExceeded { limit: 4, .. }),
        "unexpected error: {err}"
    );
    assert_eq!(err.class(), ErrorClass::Resource);
}

#[test]
fn test_growth_stops_at_configured_maximum() {
    let cluster = Cluster::new();
    let p = cluster.attach();
    let att = p.attach_connection();
    let handles: Vec<SnapshotHandle> = (0..16)
        .map(|_| p.cache.begin_snapshot(att).unwrap().0)
        .collect();
    let err = p.cache.begin_snapshot(att).unwrap_err();
    assert!(matches!(
        err,
        TicError::CapacityExceeded { limit: 16, .. }
    ));
    // A release makes room again.
    p.cache.end_snapshot(handles[3]).unwrap();
    let (h, _) = p.cache.begin_snapshot(att).unwrap();
    assert_eq!(h.slot(), 3);
}

// ---------------------------------------------------------------------------
// Active snapshots
// ---------------------------------------------------------------------------

#[test]
fn test_active_snapshots_pick_oldest_seeing_snapshot() {
    let cluster = Cluster::new();
    let p = cluster.attach();
    let att = p.attach_connection();

    let c1 = commit(&p);
    let (_, s1) = p.cache.begin_snapshot(att).unwrap();
    let c2 = commit(&p);
    let (_, s2) = p.cache.begin_snapshot(att).unwrap();
    let c3 = commit(&p);
    assert_eq!((s1, s2), (c1, c2));

    let mut active = ActiveSnapshots::new();
    p.cache.update_active_snapshots(&mut active).unwrap();
    assert_eq!(active.iter().collect::<Vec<_>>(), vec![c1, c2]);
    assert_eq!(active.last_commit(), c3);
    assert_eq!(active.snapshot_for_version(c1), c1);
    assert_eq!(active.snapshot_for_version(c2), c2);
    assert_eq!(active.snapshot_for_version(c3), c3);
    assert_eq!(
        active.snapshot_for_version(CommitNumber::new(c3.get() + 1)),
        CommitNumber::ACTIVE
    );
}

/// Without a release since the last sync the view is left alone; snapshots
/// opened meanwhile only see versions newer than the synced commit.
#[test]
fn test_update_is_skipped_without_releases() {
    let cluster = Cluster::new();
    let p = cluster.attach();
    let att = p.attach_connection();
    let (first, _) = p.cache.begin_snapshot(att).unwrap();

    let mut active = ActiveSnapshots::new();
    p.cache.update_active_snapshots(&mut active).unwrap();
    let synced_at = active.release_count();
    assert_eq!(active.len(), 1);

    let newer = commit(&p);
    let (_, seen) = p.cache.begin_snapshot(att).unwrap();
    assert!(seen > active.last_commit());
    p.cache.update_active_snapshots(&mut active).unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active.snapshot_for_version(newer), CommitNumber::ACTIVE);

    p.cache.end_snapshot(first).unwrap();
    p.cache.update_active_snapshots(&mut active).unwrap();
    assert!(active.release_count() > synced_at);
    assert_eq!(active.iter().collect::<Vec<_>>(), vec![seen]);
}

/// Live attachments keep their snapshots; a dead attachment's slot is freed.
#[test]
fn test_dead_attachment_snapshot_is_freed() {
    let cluster = Cluster::new();
    let a = cluster.attach();
    let b = cluster.attach();

    let live_att = a.attach_connection();
    let (_, live) = a.cache.begin_snapshot(live_att).unwrap();
    commit(&a);
    let dead_att = b.attach_connection();
    let (_, doomed) = b.cache.begin_snapshot(dead_att).unwrap();
    assert!(doomed > live);
    b.crash();

    let mut active = ActiveSnapshots::new();
    a.cache.update_active_snapshots(&mut active).unwrap();
    assert!(active.contains(live));
    assert!(!active.contains(doomed));
    assert_eq!(a.cache.snapshot_slots_used().unwrap(), 1);
}

/// An attachment that closes without ending its snapshot is caught by a sweep.
#[test]
fn test_sweep_frees_abandoned_snapshots() {
    let cluster = Cluster::new();
    let p = cluster.attach();
    let att = p.attach_connection();
    let (_, cn) = p.cache.begin_snapshot(att).unwrap();

    let mut active = ActiveSnapshots::new();
    p.cache.update_active_snapshots(&mut active).unwrap();
    assert!(active.contains(cn));

    p.owner.release(LockId::Attachment(att)).unwrap();
    // No release was published, so the view is still considered current.
    p.cache.update_active_snapshots(&mut active).unwrap();
    assert!(active.contains(cn));

    assert_eq!(p.cache.sweep_dead_snapshots().unwrap(), 1);
    assert_eq!(p.cache.sweep_dead_snapshots().unwrap(), 0);
    p.cache.update_active_snapshots(&mut active).unwrap();
    assert!(active.is_empty());
    assert_eq!(p.cache.snapshot_slots_used().unwrap(), 0);
}

/// A handle whose slot was swept and reused belongs to nobody any more.
#[test]
fn test_stale_handle_cannot_end_reused_slot() {
    let cluster = Cluster::new();
    let p = cluster.attach();
    let first = p.attach_connection();
    let (stale, _) = p.cache.begin_snapshot(first).unwrap();
    p.owner.release(LockId::Attachment(first)).unwrap();
    assert_eq!(p.cache.sweep_dead_snapshots().unwrap(), 1);

    let second = p.attach_connection();
    let (fresh, cn) = p.cache.begin_snapshot(second).unwrap();
    assert_eq!(fresh.slot(), stale.slot());

    let err = p.cache.end_snapshot(stale).unwrap_err();
    assert!(matches!(err, TicError::InvalidSnapshotHandle { .. }));
    let mut active = ActiveSnapshots::new();
    p.cache.update_active_snapshots(&mut active).unwrap();
    assert!(active.contains(cn));
    p.cache.end_snapshot(fresh).unwrap();
}

/// A refresh that meets an allocation between recording its commit and
/// publishing waits for it, even when a commit lands in between.
#[test]
fn test_refresh_waits_for_snapshot_mid_allocation() {
    let cluster = Cluster::new();
    let p = cluster.attach();
    let att = p.attach_connection();
    let (header, list) = raw_views(&cluster);

    commit(&p);
    assert!(list.try_claim(0, att));
    let recorded = list.record_commit(0, &header);
    let newer = commit(&p);
    assert!(newer > recorded);

    let mut active = ActiveSnapshots::new();
    thread::scope(|s| {
        let refresh = s.spawn(|| p.cache.update_active_snapshots(&mut active));
        thread::sleep(Duration::from_millis(20));
        assert!(!refresh.is_finished(), "refresh skipped an unpublished slot");
        assert!(list.publish(0, att));
        refresh.join().unwrap().unwrap();
    });
    assert_eq!(active.last_commit(), newer);
    assert!(active.contains(recorded));
    assert_eq!(active.snapshot_for_version(recorded), recorded);
}

/// An allocator that dies mid-allocation leaves a claim peers revoke.
#[test]
fn test_sweep_revokes_claim_of_dead_allocator() {
    let cluster = Cluster::new();
    let a = cluster.attach();
    let b = cluster.attach();
    let doomed = b.attach_connection();
    let (header, list) = raw_views(&cluster);
    assert!(list.try_claim(0, doomed));
    list.record_commit(0, &header);
    b.crash();

    assert_eq!(a.cache.sweep_dead_snapshots().unwrap(), 1);
    assert_eq!(a.cache.snapshot_slots_used().unwrap(), 0);
    assert!(!list.publish(0, doomed));

    let att = a.attach_connection();
    let (h, _) = a.cache.begin_snapshot(att).unwrap();
    assert_eq!(h.slot(), 0);
}
