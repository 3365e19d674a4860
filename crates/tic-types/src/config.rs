//! Cache configuration.

use std::time::Duration;

use tic_error::{Result, TicError};

/// Words reserved at the start of every status block for its header.
pub const BLOCK_HEADER_WORDS: usize = 8;

/// Smallest status block the cache accepts (header plus 8 cells).
pub const MIN_BLOCK_BYTES: usize = (BLOCK_HEADER_WORDS + 8) * 8;

/// Tunables for a transaction inventory cache.
///
/// Every process attached to the same database must use the same
/// `block_bytes`; the first opener records the derived transactions-per-block
/// in the shared header and later openers are rejected on mismatch.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Size of one status block segment in bytes.
    pub block_bytes: usize,
    /// Snapshot slots allocated when the snapshot list is first created.
    pub initial_snapshot_slots: u32,
    /// Hard cap on snapshot slots, even on stores with growable mappings.
    pub max_snapshot_slots: u32,
    /// Blocks kept mapped below the horizon before reclamation.
    pub safety_margin_blocks: u64,
    /// Bounded wait for the exclusive lock that deletes a status block.
    pub block_release_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_bytes: 64 * 1024,
            initial_snapshot_slots: 256,
            max_snapshot_slots: 65_536,
            safety_margin_blocks: 1,
            block_release_timeout: Duration::from_millis(500),
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn with_block_bytes(mut self, bytes: usize) -> Self {
        self.block_bytes = bytes;
        self
    }

    /// Size blocks so each one holds exactly `txns` cells.
    #[must_use]
    pub fn with_transactions_per_block(mut self, txns: u64) -> Self {
        let txns = usize::try_from(txns).unwrap_or(usize::MAX / 8 - BLOCK_HEADER_WORDS);
        self.block_bytes = (BLOCK_HEADER_WORDS + txns) * 8;
        self
    }

    #[must_use]
    pub fn with_initial_snapshot_slots(mut self, slots: u32) -> Self {
        self.initial_snapshot_slots = slots;
        self
    }

    #[must_use]
    pub fn with_max_snapshot_slots(mut self, slots: u32) -> Self {
        self.max_snapshot_slots = slots;
        self
    }

    #[must_use]
    pub fn with_safety_margin_blocks(mut self, blocks: u64) -> Self {
        self.safety_margin_blocks = blocks;
        self
    }

    #[must_use]
    pub fn with_block_release_timeout(mut self, timeout: Duration) -> Self {
        self.block_release_timeout = timeout;
        self
    }

    /// Number of status cells in one block.
    pub const fn transactions_per_block(&self) -> u64 {
        (self.block_bytes / 8).saturating_sub(BLOCK_HEADER_WORDS) as u64
    }

    /// Reject configurations the cache cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.block_bytes < MIN_BLOCK_BYTES {
            return Err(TicError::config(format!(
                "block_bytes {} is below the minimum of {MIN_BLOCK_BYTES}",
                self.block_bytes
            )));
        }
        if self.block_bytes % 8 != 0 {
            return Err(TicError::config(format!(
                "block_bytes {} is not a multiple of 8",
                self.block_bytes
            )));
        }
        if self.initial_snapshot_slots == 0 {
            return Err(TicError::config("initial_snapshot_slots must be at least 1"));
        }
        if self.max_snapshot_slots < self.initial_snapshot_slots {
            return Err(TicError::config(format!(
                "max_snapshot_slots {} is below initial_snapshot_slots {}",
                self.max_snapshot_slots, self.initial_snapshot_slots
            )));
        }
        if self.safety_margin_blocks == 0 {
            return Err(TicError::config("safety_margin_blocks must be at least 1"));
        }
        Ok(())
    }
}
