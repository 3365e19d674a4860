use thiserror::Error;

/// Primary error type for transaction inventory cache operations.
///
/// Variants fall into the classes reported by [`TicError::class`]: engine
/// logic bugs that must terminate the operation, resource failures that are
/// surfaced to the calling transaction or attachment, initialization failures,
/// and API misuse. A stale cached read is never an error.
#[derive(Error, Debug)]
pub enum TicError {
    // === Fatal (engine logic bugs) ===
    /// A state transition the status-cell invariant forbids.
    #[error("illegal state transition for transaction {txn}: {from} -> {to}")]
    IllegalTransition {
        txn: u64,
        from: String,
        to: String,
    },

    /// Attempt to release a status block the live horizon still covers.
    #[error("status block {block} is still within the live horizon (oldest transaction {horizon})")]
    ReleaseWithinHorizon { block: u64, horizon: u64 },

    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),

    // === Resource errors ===
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A shared-memory segment could not be created or mapped.
    #[error("cannot map shared memory segment '{name}': {detail}")]
    MapFailed { name: String, detail: String },

    /// A fixed capacity limit was reached.
    #[error("{what} capacity exceeded (limit {limit})")]
    CapacityExceeded { what: &'static str, limit: u64 },

    /// The segment store cannot grow mappings in place.
    #[error("segment '{name}' cannot grow: store has no growable mappings")]
    GrowthUnsupported { name: String },

    /// An identifier generator ran out of values.
    #[error("{what} identifier space exhausted")]
    IdExhausted { what: &'static str },

    /// Lock manager failure.
    #[error("lock manager error: {detail}")]
    LockFailed { detail: String },

    /// A bounded lock wait expired before the lock was granted.
    #[error("timed out waiting for lock {lock}")]
    LockTimeout { lock: String },

    /// The authoritative transaction inventory could not be read or written.
    #[error("transaction inventory error: {detail}")]
    Inventory { detail: String },

    // === Initialization errors ===
    /// Cache initialization failed.
    #[error("transaction cache initialization failed: {detail}")]
    InitFailed { detail: String },

    /// A segment exists but its header is not a valid layout.
    #[error("shared memory segment '{name}' is malformed: {detail}")]
    SegmentCorrupt { name: String, detail: String },

    /// A peer created the shared state with an incompatible layout.
    #[error("layout mismatch for '{name}': expected {expected}, found {found}")]
    LayoutMismatch {
        name: String,
        expected: String,
        found: String,
    },

    /// Configuration rejected by validation.
    #[error("invalid configuration: {detail}")]
    InvalidConfig { detail: String },

    // === Misuse ===
    /// Snapshot handle does not refer to an allocated slot.
    #[error("invalid snapshot handle {handle}")]
    InvalidSnapshotHandle { handle: u32 },

    /// The cache was already finalized.
    #[error("transaction cache has been finalized")]
    Finalized,
}

/// Coarse classification of a [`TicError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Engine logic bug: terminate the operation, never correct silently.
    Fatal,
    /// Resource failure surfaced to the caller; the process keeps running.
    Resource,
    /// The shared state could not be set up or attached.
    Init,
    /// The API was used incorrectly.
    Misuse,
}

impl TicError {
    /// Classify this error.
    #[allow(clippy::match_same_arms)]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::IllegalTransition { .. } | Self::ReleaseWithinHorizon { .. } | Self::Internal(_) => {
                ErrorClass::Fatal
            }
            Self::Io(_)
            | Self::MapFailed { .. }
            | Self::CapacityExceeded { .. }
            | Self::GrowthUnsupported { .. }
            | Self::IdExhausted { .. }
            | Self::LockFailed { .. }
            | Self::LockTimeout { .. }
            | Self::Inventory { .. } => ErrorClass::Resource,
            Self::InitFailed { .. }
            | Self::SegmentCorrupt { .. }
            | Self::LayoutMismatch { .. }
            | Self::InvalidConfig { .. } => ErrorClass::Init,
            Self::InvalidSnapshotHandle { .. } | Self::Finalized => ErrorClass::Misuse,
        }
    }

    /// Whether this error indicates an engine bug.
    pub const fn is_fatal(&self) -> bool {
        matches!(self.class(), ErrorClass::Fatal)
    }

    /// Whether this is a transient error that may succeed on retry.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    /// Create an illegal-transition error.
    pub fn illegal_transition(txn: u64, from: impl ToString, to: impl ToString) -> Self {
        Self::IllegalTransition {
            txn,
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a lock manager error.
    pub fn lock(detail: impl Into<String>) -> Self {
        Self::LockFailed {
            detail: detail.into(),
        }
    }

    /// Create an inventory error.
    pub fn inventory(detail: impl Into<String>) -> Self {
        Self::Inventory {
            detail: detail.into(),
        }
    }

    /// Create a mapping error for the named segment.
    pub fn map_failed(name: impl Into<String>, detail: impl ToString) -> Self {
        Self::MapFailed {
            name: name.into(),
            detail: detail.to_string(),
        }
    }

    /// Create a segment-corruption error for the named segment.
    pub fn corrupt(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::SegmentCorrupt {
            name: name.into(),
            detail: detail.into(),
        }
    }

    /// Create an initialization error.
    pub fn init(detail: impl Into<String>) -> Self {
        Self::InitFailed {
            detail: detail.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(detail: impl Into<String>) -> Self {
        Self::InvalidConfig {
            detail: detail.into(),
        }
    }
}

/// Result type alias using `TicError`.
pub type Result<T> = std::result::Result<T, TicError>;
