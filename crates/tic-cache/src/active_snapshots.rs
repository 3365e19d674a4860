//! Process-local view of the snapshots garbage collection must respect.

use std::collections::BTreeSet;

use tic_types::CommitNumber;

/// Commit numbers of the snapshots that were live at the last sync, plus the
/// counters needed to decide whether a refresh is due.
///
/// A sync waits for every allocation it meets, so a snapshot missing from the
/// set was allocated after the sync read [`last_commit`](Self::last_commit)
/// and carries a commit number at or above it. A version committed at or
/// below that number is judged against the recorded set alone.
#[derive(Debug, Clone, Default)]
pub struct ActiveSnapshots {
    snapshots: BTreeSet<CommitNumber>,
    last_commit: CommitNumber,
    release_count: u64,
    slots_used: u32,
    initialized: bool,
}

impl ActiveSnapshots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Oldest snapshot that sees a version committed at `version`.
    ///
    /// Returns `CommitNumber::ACTIVE` when the version is newer than the last
    /// sync, and `last_commit` when no recorded snapshot sees it (only
    /// snapshots opened later will).
    pub fn snapshot_for_version(&self, version: CommitNumber) -> CommitNumber {
        if version > self.last_commit {
            return CommitNumber::ACTIVE;
        }
        self.snapshots
            .range(version..)
            .next()
            .copied()
            .unwrap_or(self.last_commit)
    }

    pub fn contains(&self, commit: CommitNumber) -> bool {
        self.snapshots.contains(&commit)
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = CommitNumber> + '_ {
        self.snapshots.iter().copied()
    }

    pub fn oldest(&self) -> Option<CommitNumber> {
        self.snapshots.first().copied()
    }

    /// Latest commit number as of the last sync.
    pub fn last_commit(&self) -> CommitNumber {
        self.last_commit
    }

    /// Release counter value the set was synced at.
    pub fn release_count(&self) -> u64 {
        self.release_count
    }

    /// Used-slot mark observed at the last sync.
    pub fn slots_used(&self) -> u32 {
        self.slots_used
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub(crate) fn is_current(&self, release_count: u64) -> bool {
        self.initialized && self.release_count == release_count
    }

    pub(crate) fn replace(
        &mut self,
        snapshots: BTreeSet<CommitNumber>,
        last_commit: CommitNumber,
        release_count: u64,
        slots_used: u32,
    ) {
        self.snapshots = snapshots;
        self.last_commit = last_commit;
        self.release_count = release_count;
        self.slots_used = slots_used;
        self.initialized = true;
    }
}
