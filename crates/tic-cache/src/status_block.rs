//! Status block segments.
//!
//! A status block covers `txns_per_block` consecutive transaction numbers.
//! Each transaction owns one atomic cell holding its commit number. The
//! block header is written once by the process that creates the segment
//! (under `LockId::BlockInit`), magic last.

use std::sync::atomic::{AtomicU64, Ordering};

use tic_error::{Result, TicError};
use tic_shm::ShmSegment;
use tic_types::config::BLOCK_HEADER_WORDS;
use tic_types::{BlockNumber, CommitNumber, TxnNumber};

mod offsets {
    pub const MAGIC: usize = 0;
    pub const BLOCK_NUMBER: usize = 1;
    pub const TXNS_PER_BLOCK: usize = 2;
}

const BLOCK_MAGIC: u64 = u64::from_le_bytes(*b"TICBLK\0\x01");

#[derive(Debug)]
pub struct StatusBlock {
    number: BlockNumber,
    txns_per_block: u64,
    seg: ShmSegment,
}

impl StatusBlock {
    /// Words a block segment needs for `txns_per_block` cells.
    pub fn words_for(txns_per_block: u64) -> usize {
        BLOCK_HEADER_WORDS + usize::try_from(txns_per_block).unwrap_or(usize::MAX / 8)
    }

    /// Wrap a mapped segment. Fails if the mapping cannot hold every cell.
    pub fn new(number: BlockNumber, txns_per_block: u64, seg: ShmSegment) -> Result<Self> {
        if seg.word_count() < Self::words_for(txns_per_block) {
            return Err(TicError::corrupt(
                seg.name(),
                format!(
                    "status block holds {} words, need {}",
                    seg.word_count(),
                    Self::words_for(txns_per_block)
                ),
            ));
        }
        Ok(Self {
            number,
            txns_per_block,
            seg,
        })
    }

    pub fn number(&self) -> BlockNumber {
        self.number
    }

    pub fn name(&self) -> &str {
        self.seg.name()
    }

    pub fn is_initialized(&self) -> bool {
        self.seg.word(offsets::MAGIC).load(Ordering::Acquire) == BLOCK_MAGIC
    }

    /// Write the block header. Only the creating process calls this.
    pub fn initialize(&self) {
        self.seg
            .word(offsets::BLOCK_NUMBER)
            .store(self.number.get(), Ordering::Relaxed);
        self.seg
            .word(offsets::TXNS_PER_BLOCK)
            .store(self.txns_per_block, Ordering::Relaxed);
        self.seg
            .word(offsets::MAGIC)
            .store(BLOCK_MAGIC, Ordering::Release);
    }

    /// Check an initialized header against the expected geometry.
    pub fn validate(&self) -> Result<()> {
        let number = self.seg.word(offsets::BLOCK_NUMBER).load(Ordering::Relaxed);
        let tpb = self.seg.word(offsets::TXNS_PER_BLOCK).load(Ordering::Relaxed);
        if number != self.number.get() || tpb != self.txns_per_block {
            return Err(TicError::LayoutMismatch {
                name: self.name().to_owned(),
                expected: format!("{} with {} cells", self.number, self.txns_per_block),
                found: format!("block #{number} with {tpb} cells"),
            });
        }
        Ok(())
    }

    /// Reset every cell and the header to zero. Used only while repopulating
    /// a cache no peer is attached to yet.
    pub fn clear(&self) {
        for i in 0..Self::words_for(self.txns_per_block) {
            self.seg.word(i).store(0, Ordering::Relaxed);
        }
    }

    fn cell(&self, txn: TxnNumber) -> &AtomicU64 {
        debug_assert_eq!(txn.block(self.txns_per_block), self.number);
        let offset = usize::try_from(txn.offset_in_block(self.txns_per_block))
            .unwrap_or(usize::MAX);
        self.seg.word(BLOCK_HEADER_WORDS + offset)
    }

    pub fn load(&self, txn: TxnNumber) -> CommitNumber {
        CommitNumber::new(self.cell(txn).load(Ordering::Acquire))
    }

    /// Unconditional store. Only for repopulation.
    pub fn store(&self, txn: TxnNumber, value: CommitNumber) {
        self.cell(txn).store(value.get(), Ordering::Release);
    }

    /// Replace `current` with `new`. On failure returns the value observed.
    pub fn compare_exchange(
        &self,
        txn: TxnNumber,
        current: CommitNumber,
        new: CommitNumber,
    ) -> std::result::Result<(), CommitNumber> {
        self.cell(txn)
            .compare_exchange(current.get(), new.get(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(CommitNumber::new)
    }

    /// Whether every transaction in this block is older than `horizon` by at
    /// least `margin_blocks` whole blocks.
    pub fn reclaimable(
        number: BlockNumber,
        horizon: TxnNumber,
        txns_per_block: u64,
        margin_blocks: u64,
    ) -> bool {
        number
            .get()
            .saturating_add(1)
            .saturating_add(margin_blocks)
            .saturating_mul(txns_per_block)
            <= horizon.get()
    }

    /// First block number that is not reclaimable at `horizon`.
    pub fn first_retained(horizon: TxnNumber, txns_per_block: u64, margin_blocks: u64) -> BlockNumber {
        BlockNumber::new((horizon.get() / txns_per_block).saturating_sub(margin_blocks))
    }
}
