use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tic_error::Result;
use tic_types::{AttachmentId, BlockNumber, TxnNumber};

/// Name of a lock in the shared lock namespace of one database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockId {
    /// Held exclusively by the process driving a transaction for its whole
    /// lifetime. Probed to detect owners that died without an outcome.
    Transaction(TxnNumber),
    /// Held by a live attachment. Probed to detect dead snapshot owners.
    Attachment(AttachmentId),
    /// Held shared by every process mapping a status block.
    StatusBlock(BlockNumber),
    /// Serializes first-time initialization of one status block.
    BlockInit(BlockNumber),
    /// Serializes first-time initialization of the global header.
    HeaderInit,
    /// Serializes growth of the snapshot list.
    SnapshotListGrowth,
}

impl LockId {
    /// Largest key that fits next to the kind byte. Transaction and
    /// attachment numbers above it have no byte in a lock file.
    pub const KEY_MASK: u64 = (1 << 56) - 1;

    pub const fn kind(self) -> u8 {
        match self {
            Self::Transaction(_) => 1,
            Self::Attachment(_) => 2,
            Self::StatusBlock(_) => 3,
            Self::BlockInit(_) => 4,
            Self::HeaderInit => 5,
            Self::SnapshotListGrowth => 6,
        }
    }

    pub const fn key(self) -> u64 {
        match self {
            Self::Transaction(txn) => txn.get(),
            Self::Attachment(att) => att.get(),
            Self::StatusBlock(block) | Self::BlockInit(block) => block.get(),
            Self::HeaderInit | Self::SnapshotListGrowth => 0,
        }
    }

    /// A single 64-bit position unique per lock id (kind in the top byte).
    /// `None` when the key does not fit in [`KEY_MASK`](Self::KEY_MASK).
    pub const fn packed(self) -> Option<u64> {
        let key = self.key();
        if key > Self::KEY_MASK {
            return None;
        }
        Some(((self.kind() as u64) << 56) | key)
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transaction(txn) => write!(f, "lock:{txn}"),
            Self::Attachment(att) => write!(f, "lock:{att}"),
            Self::StatusBlock(block) => write!(f, "lock:{block}"),
            Self::BlockInit(block) => write!(f, "lock:init-{block}"),
            Self::HeaderInit => f.write_str("lock:header-init"),
            Self::SnapshotListGrowth => f.write_str("lock:snapshot-growth"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    pub const fn compatible_with(self, other: Self) -> bool {
        matches!((self, other), (Self::Shared, Self::Shared))
    }

    pub const fn strongest(self, other: Self) -> Self {
        match (self, other) {
            (Self::Shared, Self::Shared) => Self::Shared,
            _ => Self::Exclusive,
        }
    }
}

/// How long `acquire` may block on a conflicting holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Fail immediately.
    NoWait,
    /// Block until granted.
    Wait,
    /// Block at most this long.
    Timeout(Duration),
}

/// Callback run when another owner waits on a lock this owner holds.
///
/// Handlers run on the requesting thread and must finish quickly. A handler
/// that decides the lock is no longer needed releases it through its own
/// owner handle; otherwise the requester keeps waiting.
pub type ForcedReleaseHandler = Arc<dyn Fn(LockId) + Send + Sync>;

/// One lock owner (one attached process) in the lock manager.
pub trait LockManager: Send + Sync + fmt::Debug {
    /// Stable id of this owner, unique within its lock table.
    fn owner_id(&self) -> u64;

    /// Acquire `id` in `mode`. Returns `Ok(false)` when the wait policy
    /// expired without a grant.
    ///
    /// Acquiring a lock this owner already holds is re-entrant: the hold
    /// count goes up and the mode is raised to the stronger of the two.
    fn acquire(&self, id: LockId, mode: LockMode, wait: WaitPolicy) -> Result<bool>;

    /// Drop one hold on `id`. Releasing a lock that is not held is a no-op.
    fn release(&self, id: LockId) -> Result<()>;

    /// Mode in which this owner currently holds `id`.
    fn held_mode(&self, id: LockId) -> Option<LockMode>;

    /// Small payload attached to a lock, readable by every owner.
    fn read_associated_data(&self, id: LockId) -> Result<Option<Vec<u8>>>;

    fn write_associated_data(&self, id: LockId, data: &[u8]) -> Result<()>;

    /// Subscribe `handler` to forced-release requests on `id`, replacing any
    /// previous handler of this owner for that lock.
    fn on_forced_release(&self, id: LockId, handler: ForcedReleaseHandler);

    fn clear_forced_release(&self, id: LockId);

    /// Release every lock held by this owner.
    fn release_all(&self) -> Result<()>;

    /// Liveness probe: true if nobody holds `id`.
    ///
    /// Takes and immediately drops a shared lock without waiting. A lock held
    /// by this owner itself is never vacant.
    fn probe_vacant(&self, id: LockId) -> Result<bool> {
        if self.held_mode(id).is_some() {
            return Ok(false);
        }
        if self.acquire(id, LockMode::Shared, WaitPolicy::NoWait)? {
            self.release(id)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
