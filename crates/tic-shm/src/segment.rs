//! Word-addressed view of one shared-memory segment.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use memmap2::MmapMut;

/// Backing storage of a mapped segment.
enum Backing {
    /// Fixed-size chunks shared with every other view of an in-process
    /// region. Growth appends chunks, so earlier words never move.
    Chunks {
        chunks: Vec<Arc<[AtomicU64]>>,
        chunk_words: usize,
    },
    /// A file mapping. `base` points at the first byte of `map`.
    Mapped { map: MmapMut, base: NonNull<u8> },
}

/// A mapped segment exposing its contents as an array of `AtomicU64` words.
///
/// All reads and writes of shared cache state go through [`word`](Self::word)
/// so every access is atomic, regardless of which process wrote the word.
pub struct ShmSegment {
    name: String,
    backing: Backing,
    word_count: usize,
    created: bool,
}

// SAFETY: `Backing::Mapped::base` points into `map`, which is owned by the
// segment and outlives every reference handed out by `word`. All access to the
// mapped bytes goes through `AtomicU64`, which is `Sync`.
unsafe impl Send for ShmSegment {}
// SAFETY: see above; `&ShmSegment` only yields `&AtomicU64`.
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// A private zero-filled segment not registered with any store.
    pub fn heap(name: &str, bytes: usize) -> Self {
        let words = bytes.div_ceil(8).max(1);
        Self::from_chunks(name, vec![new_chunk(words)], words, true)
    }

    pub(crate) fn from_chunks(
        name: &str,
        chunks: Vec<Arc<[AtomicU64]>>,
        chunk_words: usize,
        created: bool,
    ) -> Self {
        let word_count = chunks.len() * chunk_words;
        Self {
            name: name.to_owned(),
            backing: Backing::Chunks {
                chunks,
                chunk_words,
            },
            word_count,
            created,
        }
    }

    pub(crate) fn from_mmap(name: &str, mut map: MmapMut, created: bool) -> Self {
        let word_count = map.len() / 8;
        let base = NonNull::new(map.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Self {
            name: name.to_owned(),
            backing: Backing::Mapped { map, base },
            word_count,
            created,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of addressable words.
    pub fn word_count(&self) -> usize {
        self.word_count
    }

    pub fn len_bytes(&self) -> usize {
        self.word_count * 8
    }

    /// True if the open that produced this view created the backing storage.
    pub fn is_new(&self) -> bool {
        self.created
    }

    /// The word at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= word_count()`. Callers size their layouts before
    /// indexing, so an out-of-range index is a layout bug.
    pub fn word(&self, index: usize) -> &AtomicU64 {
        assert!(
            index < self.word_count,
            "word {index} out of range for segment {} ({} words)",
            self.name,
            self.word_count
        );
        match &self.backing {
            Backing::Chunks {
                chunks,
                chunk_words,
            } => &chunks[index / chunk_words][index % chunk_words],
            Backing::Mapped { base, .. } => {
                // SAFETY: the mapping is page aligned, so every 8-byte offset
                // is aligned for `AtomicU64`. `index < word_count` keeps the
                // word inside the mapping. `AtomicU64` has the same size and
                // in-memory representation as `u64`, and the mapping lives as
                // long as `&self`.
                unsafe { &*base.as_ptr().cast::<AtomicU64>().add(index) }
            }
        }
    }

    /// Flush a file mapping to its backing file. No-op for memory regions.
    pub fn flush(&self) -> std::io::Result<()> {
        match &self.backing {
            Backing::Chunks { .. } => Ok(()),
            Backing::Mapped { map, .. } => map.flush(),
        }
    }
}

impl fmt::Debug for ShmSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.backing {
            Backing::Chunks { .. } => "memory",
            Backing::Mapped { .. } => "file",
        };
        f.debug_struct("ShmSegment")
            .field("name", &self.name)
            .field("kind", &kind)
            .field("word_count", &self.word_count)
            .field("created", &self.created)
            .finish()
    }
}

pub(crate) fn new_chunk(words: usize) -> Arc<[AtomicU64]> {
    (0..words).map(|_| AtomicU64::new(0)).collect()
}
