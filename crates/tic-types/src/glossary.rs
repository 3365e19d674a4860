//! Glossary types.
//!
//! Transaction numbers, commit numbers and the other identifiers the cache
//! stores in shared memory. Every type is a transparent wrapper around the raw
//! word that lives in a segment, so conversion to and from shared memory is a
//! plain `get`/`new`.

use std::fmt;
use std::num::NonZeroU64;

/// Monotonically generated transaction number. Never reused.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct TxnNumber(u64);

impl TxnNumber {
    pub const ZERO: Self = Self(0);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The status block holding this transaction's cell.
    #[inline]
    pub const fn block(self, txns_per_block: u64) -> BlockNumber {
        BlockNumber(self.0 / txns_per_block)
    }

    /// Index of this transaction's cell inside its status block.
    #[inline]
    pub const fn offset_in_block(self, txns_per_block: u64) -> u64 {
        self.0 % txns_per_block
    }
}

impl fmt::Display for TxnNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn#{}", self.0)
    }
}

/// Commit number stored in a status cell.
///
/// Real commit numbers are strictly increasing and never reused. Four values
/// are reserved as sentinels: [`ACTIVE`](Self::ACTIVE),
/// [`PREHISTORIC`](Self::PREHISTORIC), [`LIMBO`](Self::LIMBO) and
/// [`DEAD`](Self::DEAD).
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct CommitNumber(u64);

impl CommitNumber {
    /// Transaction has not reached an outcome yet.
    pub const ACTIVE: Self = Self(0);
    /// Older than the horizon; assumed committed and visible to everyone.
    pub const PREHISTORIC: Self = Self(1);
    /// Prepared by two-phase commit, outcome undecided.
    pub const LIMBO: Self = Self(u64::MAX - 1);
    /// Rolled back.
    pub const DEAD: Self = Self(u64::MAX - 2);
    /// Largest value a real commit may take.
    pub const MAX_ASSIGNED: Self = Self(u64::MAX - 3);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Whether this value is an outcome (committed, prehistoric or dead).
    ///
    /// Once a cell holds a terminal value it never changes again.
    #[inline]
    pub const fn is_terminal(self) -> bool {
        self.0 != Self::ACTIVE.0 && self.0 != Self::LIMBO.0
    }

    /// Whether this value means "committed" (a real number or prehistoric).
    #[inline]
    pub const fn is_committed(self) -> bool {
        self.is_terminal() && self.0 != Self::DEAD.0
    }

    /// Whether this is a real assigned commit number rather than a sentinel.
    #[inline]
    pub const fn is_assigned(self) -> bool {
        self.0 > Self::PREHISTORIC.0 && self.0 <= Self::MAX_ASSIGNED.0
    }

    /// Visibility rule: a version committed at `self` is seen by a snapshot
    /// fixed at `snapshot`.
    #[inline]
    pub const fn visible_to(self, snapshot: Self) -> bool {
        self.is_committed() && self.0 <= snapshot.0
    }

    /// Short human-readable name for logs and errors.
    pub fn describe(self) -> String {
        match self {
            Self::ACTIVE => "active".to_owned(),
            Self::PREHISTORIC => "prehistoric".to_owned(),
            Self::LIMBO => "limbo".to_owned(),
            Self::DEAD => "dead".to_owned(),
            Self(raw) => format!("committed@{raw}"),
        }
    }
}

impl fmt::Display for CommitNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ACTIVE => f.write_str("cn:active"),
            Self::PREHISTORIC => f.write_str("cn:prehistoric"),
            Self::LIMBO => f.write_str("cn:limbo"),
            Self::DEAD => f.write_str("cn:dead"),
            Self(raw) => write!(f, "cn#{raw}"),
        }
    }
}

/// Attachment (connection) identifier.
///
/// Domain: `1..=(2^63 - 1)`. The top bit is reserved for the snapshot-slot
/// claim tag, and zero marks a free slot.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct AttachmentId(NonZeroU64);

impl AttachmentId {
    /// Maximum raw value representable by a real attachment id.
    pub const MAX_RAW: u64 = (1_u64 << 63) - 1;

    /// Construct an `AttachmentId` if `raw` is in-domain.
    #[inline]
    pub const fn new(raw: u64) -> Option<Self> {
        if raw > Self::MAX_RAW {
            return None;
        }
        match NonZeroU64::new(raw) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for AttachmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "att#{}", self.get())
    }
}

/// Statement identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct StatementId(u64);

impl StatementId {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Number of a status block: `txn / transactions_per_block`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct BlockNumber(u64);

impl BlockNumber {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// First transaction number covered by this block.
    #[inline]
    pub const fn first_txn(self, txns_per_block: u64) -> TxnNumber {
        TxnNumber(self.0 * txns_per_block)
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blk#{}", self.0)
    }
}

/// Handle to an allocated snapshot: its slot in the snapshot list and the
/// attachment that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotHandle {
    slot: u32,
    attachment: AttachmentId,
}

impl SnapshotHandle {
    #[inline]
    pub const fn new(slot: u32, attachment: AttachmentId) -> Self {
        Self { slot, attachment }
    }

    #[inline]
    pub const fn slot(self) -> u32 {
        self.slot
    }

    #[inline]
    pub const fn attachment(self) -> AttachmentId {
        self.attachment
    }
}

impl fmt::Display for SnapshotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "snap#{}/{}", self.slot, self.attachment)
    }
}

/// Transaction state as recorded by the authoritative inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TxnState {
    Active,
    Limbo,
    Dead,
    Committed,
}

impl TxnState {
    pub const ALL: [Self; 4] = [Self::Active, Self::Limbo, Self::Dead, Self::Committed];

    /// Two-bit encoding used by the inventory file.
    #[inline]
    pub const fn to_bits(self) -> u8 {
        match self {
            Self::Active => 0,
            Self::Limbo => 1,
            Self::Dead => 2,
            Self::Committed => 3,
        }
    }

    /// Decode the low two bits of `bits`.
    #[inline]
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::Active,
            1 => Self::Limbo,
            2 => Self::Dead,
            _ => Self::Committed,
        }
    }

    /// The inventory state a cached commit number corresponds to.
    pub const fn from_commit(cn: CommitNumber) -> Self {
        match cn {
            CommitNumber::ACTIVE => Self::Active,
            CommitNumber::LIMBO => Self::Limbo,
            CommitNumber::DEAD => Self::Dead,
            _ => Self::Committed,
        }
    }

    /// Value loaded into a status cell when the cache is repopulated from the
    /// inventory. Committed transactions predate every snapshot taken in the
    /// new cache lifetime, so they load as prehistoric.
    pub const fn reload_value(self) -> CommitNumber {
        match self {
            Self::Active => CommitNumber::ACTIVE,
            Self::Limbo => CommitNumber::LIMBO,
            Self::Dead => CommitNumber::DEAD,
            Self::Committed => CommitNumber::PREHISTORIC,
        }
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::Limbo => "limbo",
            Self::Dead => "dead",
            Self::Committed => "committed",
        })
    }
}
