//! Snapshot list segment.
//!
//! A header followed by an array of two-word slots
//! `[attachment, snapshot commit]`. A slot is free when its attachment word
//! is zero. Allocation follows a three-phase protocol:
//!
//! 1. **Claim:** CAS the attachment word from 0 to `CLAIM_TAG | attachment`.
//!    Scanners treat tagged slots as not yet valid.
//! 2. **Record:** raise the used mark, read the latest commit number and
//!    store it in the commit word.
//! 3. **Publish:** CAS the attachment word from the tagged value to the bare
//!    attachment id. The CAS fails if a peer revoked the claim because the
//!    attachment died.
//!
//! Only the owner of a claim writes the commit word. Freeing clears the
//! attachment word and leaves the stale commit behind, so a scanner that
//! re-reads the attachment word after the commit word never pairs a live
//! attachment with a commit it did not record.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use tic_error::{Result, TicError};
use tic_shm::ShmSegment;
use tic_types::{AttachmentId, CommitNumber};

use crate::header::GlobalHeader;

mod offsets {
    pub const MAGIC: usize = 0;
    pub const VERSION: usize = 1;
    /// Slots the segment has been sized for.
    pub const ALLOCATED: usize = 2;
    /// One past the highest slot that may be occupied.
    pub const USED: usize = 3;
    pub const HEADER_WORDS: usize = 8;
}

const MAGIC: u64 = u64::from_le_bytes(*b"TICSNAP\x01");
const LAYOUT_VERSION: u64 = 1;

/// Marks a slot claimed by an allocator that has not published it yet.
pub const CLAIM_TAG: u64 = 1 << 63;

/// Times a scanner re-reads a claimed slot before checking its owner.
const CLAIM_SPIN_LIMIT: u32 = 64;

/// What a scanner sees in one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRead {
    Free,
    /// Claimed by an allocator that has not published yet.
    Claimed(AttachmentId),
    Live(AttachmentId, CommitNumber),
}

#[derive(Debug)]
pub struct SnapshotList {
    seg: ShmSegment,
}

impl SnapshotList {
    /// Segment size holding `slots` slots.
    pub fn bytes_for(slots: u32) -> usize {
        (offsets::HEADER_WORDS + 2 * slots as usize) * 8
    }

    pub fn is_published(seg: &ShmSegment) -> bool {
        seg.word_count() >= offsets::HEADER_WORDS
            && seg.word(offsets::MAGIC).load(Ordering::Acquire) == MAGIC
    }

    /// Initialize a fresh list with `slots` slots, all free.
    pub fn initialize(seg: ShmSegment, slots: u32) -> Result<Self> {
        if seg.word_count() * 8 < Self::bytes_for(slots) {
            return Err(TicError::corrupt(
                seg.name(),
                format!("snapshot list too small for {slots} slots"),
            ));
        }
        seg.word(offsets::VERSION)
            .store(LAYOUT_VERSION, Ordering::Relaxed);
        seg.word(offsets::ALLOCATED)
            .store(u64::from(slots), Ordering::Relaxed);
        seg.word(offsets::USED).store(0, Ordering::Relaxed);
        seg.word(offsets::MAGIC).store(MAGIC, Ordering::Release);
        Ok(Self { seg })
    }

    /// Wrap a list published by a peer.
    pub fn attach(seg: ShmSegment) -> Result<Self> {
        if !Self::is_published(&seg) {
            return Err(TicError::corrupt(
                seg.name(),
                "snapshot list magic not published",
            ));
        }
        let version = seg.word(offsets::VERSION).load(Ordering::Relaxed);
        if version != LAYOUT_VERSION {
            return Err(TicError::LayoutMismatch {
                name: seg.name().to_owned(),
                expected: format!("version {LAYOUT_VERSION}"),
                found: format!("version {version}"),
            });
        }
        Ok(Self { seg })
    }

    pub fn segment(&self) -> &ShmSegment {
        &self.seg
    }

    /// Slots the shared header says exist.
    pub fn allocated(&self) -> u32 {
        let raw = self.seg.word(offsets::ALLOCATED).load(Ordering::Acquire);
        u32::try_from(raw).unwrap_or(u32::MAX)
    }

    /// Slots this mapping can address. Lower than `allocated` when a peer
    /// grew the list after this mapping was made.
    pub fn capacity(&self) -> u32 {
        let mapped = (self.seg.word_count() - offsets::HEADER_WORDS) / 2;
        let mapped = u32::try_from(mapped).unwrap_or(u32::MAX);
        mapped.min(self.allocated())
    }

    pub fn is_stale(&self) -> bool {
        self.capacity() < self.allocated()
    }

    /// Record growth to `slots`. Call only after the segment was extended.
    pub fn set_allocated(&self, slots: u32) {
        self.seg
            .word(offsets::ALLOCATED)
            .fetch_max(u64::from(slots), Ordering::AcqRel);
    }

    pub fn used(&self) -> u32 {
        let raw = self.seg.word(offsets::USED).load(Ordering::SeqCst);
        u32::try_from(raw).unwrap_or(u32::MAX)
    }

    fn attachment_word(&self, slot: u32) -> &AtomicU64 {
        self.seg.word(offsets::HEADER_WORDS + 2 * slot as usize)
    }

    fn commit_word(&self, slot: u32) -> &AtomicU64 {
        self.seg.word(offsets::HEADER_WORDS + 2 * slot as usize + 1)
    }

    /// Phase 1: claim a free slot for `attachment`.
    pub fn try_claim(&self, slot: u32, attachment: AttachmentId) -> bool {
        self.attachment_word(slot)
            .compare_exchange(
                0,
                CLAIM_TAG | attachment.get(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Phase 2 on a claimed slot. Returns the snapshot's commit number.
    ///
    /// The used mark is raised before the latest commit is read, so a scanner
    /// that missed this slot because of a low used mark started its scan
    /// before this snapshot existed and synced a commit number no newer than
    /// the one recorded here.
    pub fn record_commit(&self, slot: u32, header: &GlobalHeader) -> CommitNumber {
        self.seg
            .word(offsets::USED)
            .fetch_max(u64::from(slot) + 1, Ordering::SeqCst);
        let commit = header.latest_commit();
        self.commit_word(slot).store(commit.get(), Ordering::Release);
        commit
    }

    /// Phase 3: make a recorded claim visible. False if the claim was
    /// revoked in the meantime.
    pub fn publish(&self, slot: u32, attachment: AttachmentId) -> bool {
        self.attachment_word(slot)
            .compare_exchange(
                CLAIM_TAG | attachment.get(),
                attachment.get(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Read one slot. Retries while the slot changes under the read.
    pub fn read(&self, slot: u32) -> SlotRead {
        loop {
            let att = self.attachment_word(slot).load(Ordering::Acquire);
            if att == 0 {
                return SlotRead::Free;
            }
            let Some(id) = AttachmentId::new(att & !CLAIM_TAG) else {
                return SlotRead::Free;
            };
            if att & CLAIM_TAG != 0 {
                return SlotRead::Claimed(id);
            }
            let commit = self.commit_word(slot).load(Ordering::Acquire);
            if self.attachment_word(slot).load(Ordering::Acquire) == att {
                return SlotRead::Live(id, CommitNumber::new(commit));
            }
        }
    }

    /// Read a slot, giving an in-flight allocation a short time to publish.
    /// May still return [`SlotRead::Claimed`].
    pub fn read_settled(&self, slot: u32) -> SlotRead {
        let mut read = self.read(slot);
        for _ in 0..CLAIM_SPIN_LIMIT {
            if !matches!(read, SlotRead::Claimed(_)) {
                break;
            }
            thread::yield_now();
            read = self.read(slot);
        }
        read
    }

    /// Free `slot` only if it is published for `attachment`.
    pub fn release_if_owned(&self, slot: u32, attachment: AttachmentId) -> bool {
        self.attachment_word(slot)
            .compare_exchange(attachment.get(), 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Revoke a claim whose allocator died before publishing it.
    pub fn revoke_claim(&self, slot: u32, attachment: AttachmentId) -> bool {
        self.attachment_word(slot)
            .compare_exchange(
                CLAIM_TAG | attachment.get(),
                0,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Lower the used mark over free slots at the top.
    ///
    /// An allocator that claims the topmost slot while the mark is being
    /// lowered raises it again with `fetch_max`; the re-check after each
    /// successful CAS restores the mark if the claim landed in between.
    pub fn lower_used(&self) {
        let used = self.seg.word(offsets::USED);
        loop {
            let current = used.load(Ordering::SeqCst);
            if current == 0 {
                return;
            }
            let Ok(top) = u32::try_from(current - 1) else {
                return;
            };
            if top >= self.capacity() || self.attachment_word(top).load(Ordering::SeqCst) != 0 {
                return;
            }
            if used
                .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
                && self.attachment_word(top).load(Ordering::SeqCst) != 0
            {
                used.fetch_max(current, Ordering::SeqCst);
                return;
            }
        }
    }
}
