//! Global header segment.
//!
//! One small segment per database holding the counters every attached
//! process shares:
//!
//! - Immutable fields: magic, layout version, transactions per block.
//! - Atomic counters: latest commit number, horizon (oldest interesting
//!   transaction), snapshot release count, the three id generators and the
//!   oldest-unreclaimed-block cursor.
//! - An xxh3_64 checksum over the immutable fields.
//!
//! The first opener writes every field and publishes the magic last with
//! release ordering. Reattachers only validate; they never write a field
//! they did not allocate through a counter.

use std::sync::atomic::{AtomicU64, Ordering};

use tic_error::{Result, TicError};
use tic_inventory::ControlPage;
use tic_shm::ShmSegment;
use tic_types::{AttachmentId, BlockNumber, CommitNumber, StatementId, TxnNumber};
use xxhash_rust::xxh3::xxh3_64;

/// Word offsets inside the header segment.
mod offsets {
    /// `"TICHDR"` tag plus layout marker. Written last by the initializer.
    pub const MAGIC: usize = 0;
    pub const VERSION: usize = 1;
    pub const TXNS_PER_BLOCK: usize = 2;
    /// Last commit number handed out.
    pub const LATEST_COMMIT: usize = 3;
    /// Oldest interesting transaction. Never decreases.
    pub const OLDEST_TXN: usize = 4;
    /// Bumped whenever a snapshot slot is freed.
    pub const RELEASE_COUNT: usize = 5;
    pub const NEXT_TXN: usize = 6;
    pub const NEXT_ATTACHMENT: usize = 7;
    pub const NEXT_STATEMENT: usize = 8;
    /// Lowest status block whose segment has not been removed yet.
    pub const OLDEST_BLOCK: usize = 9;
    pub const CHECKSUM: usize = 10;
    /// Total words, including reserved padding.
    pub const WORDS: usize = 16;
}

const MAGIC: u64 = u64::from_le_bytes(*b"TICHDR\0\x01");
const LAYOUT_VERSION: u64 = 1;

fn checksum(tpb: u64) -> u64 {
    let mut data = Vec::with_capacity(24);
    data.extend_from_slice(&MAGIC.to_le_bytes());
    data.extend_from_slice(&LAYOUT_VERSION.to_le_bytes());
    data.extend_from_slice(&tpb.to_le_bytes());
    xxh3_64(&data)
}

/// Allocate from a counter holding the next value to hand out.
fn alloc_next(word: &AtomicU64, max: u64) -> Option<u64> {
    loop {
        let current = word.load(Ordering::Acquire);
        if current > max {
            return None;
        }
        let next = current.checked_add(1)?;
        if word
            .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return Some(current);
        }
    }
}

#[derive(Debug)]
pub struct GlobalHeader {
    seg: ShmSegment,
    txns_per_block: u64,
}

impl GlobalHeader {
    pub const BYTES: usize = offsets::WORDS * 8;

    /// Whether a peer already published this header.
    pub fn is_published(seg: &ShmSegment) -> bool {
        seg.word_count() >= offsets::WORDS
            && seg.word(offsets::MAGIC).load(Ordering::Acquire) == MAGIC
    }

    /// Write every field of a fresh header, seeded from the inventory's
    /// control page. The header stays invisible to peers until
    /// [`publish`](Self::publish).
    pub fn prepare(seg: ShmSegment, txns_per_block: u64, control: ControlPage) -> Result<Self> {
        check_size(&seg)?;
        let horizon = control.oldest_interesting;
        let fields = [
            (offsets::VERSION, LAYOUT_VERSION),
            (offsets::TXNS_PER_BLOCK, txns_per_block),
            (offsets::LATEST_COMMIT, CommitNumber::PREHISTORIC.get()),
            (offsets::OLDEST_TXN, horizon.get()),
            (offsets::RELEASE_COUNT, 0),
            (
                offsets::NEXT_TXN,
                control.next_transaction.get().max(horizon.get()),
            ),
            (offsets::NEXT_ATTACHMENT, 1),
            (offsets::NEXT_STATEMENT, 1),
            (
                offsets::OLDEST_BLOCK,
                horizon.block(txns_per_block).get(),
            ),
            (offsets::CHECKSUM, checksum(txns_per_block)),
        ];
        for (offset, value) in fields {
            seg.word(offset).store(value, Ordering::Relaxed);
        }
        Ok(Self {
            seg,
            txns_per_block,
        })
    }

    /// Make the header visible to peers.
    pub fn publish(&self) {
        self.word(offsets::MAGIC).store(MAGIC, Ordering::Release);
    }

    /// Validate a header published by a peer.
    pub fn attach(seg: ShmSegment, txns_per_block: u64) -> Result<Self> {
        check_size(&seg)?;
        let name = seg.name().to_owned();
        if seg.word(offsets::MAGIC).load(Ordering::Acquire) != MAGIC {
            return Err(TicError::corrupt(name, "header magic not published"));
        }
        let version = seg.word(offsets::VERSION).load(Ordering::Relaxed);
        if version != LAYOUT_VERSION {
            return Err(TicError::LayoutMismatch {
                name,
                expected: format!("version {LAYOUT_VERSION}"),
                found: format!("version {version}"),
            });
        }
        let stored_tpb = seg.word(offsets::TXNS_PER_BLOCK).load(Ordering::Relaxed);
        if seg.word(offsets::CHECKSUM).load(Ordering::Relaxed) != checksum(stored_tpb) {
            return Err(TicError::corrupt(name, "header checksum mismatch"));
        }
        if stored_tpb != txns_per_block {
            return Err(TicError::LayoutMismatch {
                name,
                expected: format!("{txns_per_block} transactions per block"),
                found: format!("{stored_tpb} transactions per block"),
            });
        }
        Ok(Self {
            seg,
            txns_per_block,
        })
    }

    fn word(&self, offset: usize) -> &AtomicU64 {
        self.seg.word(offset)
    }

    pub fn txns_per_block(&self) -> u64 {
        self.txns_per_block
    }

    pub fn latest_commit(&self) -> CommitNumber {
        CommitNumber::new(self.word(offsets::LATEST_COMMIT).load(Ordering::SeqCst))
    }

    /// Draw a fresh commit number, strictly above every earlier one.
    pub fn alloc_commit(&self) -> Result<CommitNumber> {
        let word = self.word(offsets::LATEST_COMMIT);
        loop {
            let current = word.load(Ordering::SeqCst);
            if current >= CommitNumber::MAX_ASSIGNED.get() {
                return Err(TicError::IdExhausted {
                    what: "commit number",
                });
            }
            if word
                .compare_exchange_weak(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Ok(CommitNumber::new(current + 1));
            }
        }
    }

    pub fn oldest_transaction(&self) -> TxnNumber {
        TxnNumber::new(self.word(offsets::OLDEST_TXN).load(Ordering::Acquire))
    }

    /// Raise the horizon to `target` if it is higher. Returns the previous
    /// horizon.
    pub fn advance_horizon(&self, target: TxnNumber) -> TxnNumber {
        TxnNumber::new(
            self.word(offsets::OLDEST_TXN)
                .fetch_max(target.get(), Ordering::AcqRel),
        )
    }

    pub fn release_count(&self) -> u64 {
        self.word(offsets::RELEASE_COUNT).load(Ordering::Acquire)
    }

    pub fn bump_release_count(&self) -> u64 {
        self.word(offsets::RELEASE_COUNT)
            .fetch_add(1, Ordering::AcqRel)
            + 1
    }

    /// Next transaction number that will be handed out.
    pub fn next_transaction(&self) -> TxnNumber {
        TxnNumber::new(self.word(offsets::NEXT_TXN).load(Ordering::Acquire))
    }

    pub fn alloc_transaction(&self) -> Result<TxnNumber> {
        alloc_next(self.word(offsets::NEXT_TXN), u64::MAX - 1)
            .map(TxnNumber::new)
            .ok_or(TicError::IdExhausted {
                what: "transaction number",
            })
    }

    pub fn alloc_attachment(&self) -> Result<AttachmentId> {
        alloc_next(self.word(offsets::NEXT_ATTACHMENT), AttachmentId::MAX_RAW)
            .and_then(AttachmentId::new)
            .ok_or(TicError::IdExhausted {
                what: "attachment id",
            })
    }

    pub fn alloc_statement(&self) -> Result<StatementId> {
        alloc_next(self.word(offsets::NEXT_STATEMENT), u64::MAX - 1)
            .map(StatementId::new)
            .ok_or(TicError::IdExhausted {
                what: "statement id",
            })
    }

    pub fn oldest_block(&self) -> BlockNumber {
        BlockNumber::new(self.word(offsets::OLDEST_BLOCK).load(Ordering::Acquire))
    }

    /// Move the reclamation cursor from `from` to `to`. Fails if a peer moved
    /// it first.
    pub fn advance_oldest_block(&self, from: BlockNumber, to: BlockNumber) -> bool {
        self.word(offsets::OLDEST_BLOCK)
            .compare_exchange(from.get(), to.get(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

fn check_size(seg: &ShmSegment) -> Result<()> {
    if seg.word_count() < offsets::WORDS {
        return Err(TicError::corrupt(
            seg.name(),
            format!(
                "header segment holds {} words, need {}",
                seg.word_count(),
                offsets::WORDS
            ),
        ));
    }
    Ok(())
}
