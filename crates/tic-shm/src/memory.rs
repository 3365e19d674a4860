//! In-process segment store.
//!
//! Regions are shared by every store handle cloned from the same
//! [`MemorySegmentStore`], which lets tests simulate several attached
//! processes inside one address space.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use parking_lot::Mutex;
use tic_error::{Result, TicError};
use tracing::{debug, trace};

use crate::segment::{new_chunk, ShmSegment};
use crate::traits::SegmentStore;

/// Words per chunk when a region is created with fewer words than this.
const DEFAULT_CHUNK_WORDS: usize = 512;

#[derive(Debug)]
struct Region {
    chunk_words: usize,
    chunks: Vec<Arc<[AtomicU64]>>,
}

impl Region {
    fn with_words(words: usize) -> Self {
        let chunk_words = words.clamp(1, DEFAULT_CHUNK_WORDS);
        let mut region = Self {
            chunk_words,
            chunks: Vec::new(),
        };
        region.extend_to(words);
        region
    }

    fn words(&self) -> usize {
        self.chunks.len() * self.chunk_words
    }

    fn extend_to(&mut self, words: usize) {
        while self.words() < words.max(1) {
            self.chunks.push(new_chunk(self.chunk_words));
        }
    }

    fn view(&self, name: &str, created: bool) -> ShmSegment {
        ShmSegment::from_chunks(name, self.chunks.clone(), self.chunk_words, created)
    }
}

/// Named regions living in this process's heap.
#[derive(Debug, Clone)]
pub struct MemorySegmentStore {
    regions: Arc<Mutex<HashMap<String, Region>>>,
    growable: bool,
}

impl Default for MemorySegmentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySegmentStore {
    /// A store whose segments can grow after creation.
    pub fn new() -> Self {
        Self {
            regions: Arc::new(Mutex::new(HashMap::new())),
            growable: true,
        }
    }

    /// A store that refuses to grow segments, modelling fixed-size mappings.
    pub fn fixed_size() -> Self {
        Self {
            growable: false,
            ..Self::new()
        }
    }

    /// Number of live regions.
    pub fn len(&self) -> usize {
        self.regions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of all live regions, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.regions.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl SegmentStore for MemorySegmentStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn can_grow(&self) -> bool {
        self.growable
    }

    fn open_or_create(&self, name: &str, bytes: usize) -> Result<ShmSegment> {
        let words = bytes.div_ceil(8);
        let mut regions = self.regions.lock();
        if let Some(region) = regions.get_mut(name) {
            region.extend_to(words);
            trace!(name, words = region.words(), "memory segment reopened");
            return Ok(region.view(name, false));
        }
        let region = Region::with_words(words);
        let seg = region.view(name, true);
        regions.insert(name.to_owned(), region);
        debug!(name, words, "memory segment created");
        Ok(seg)
    }

    fn open_existing(&self, name: &str) -> Result<Option<ShmSegment>> {
        Ok(self
            .regions
            .lock()
            .get(name)
            .map(|region| region.view(name, false)))
    }

    fn grow(&self, segment: &ShmSegment, bytes: usize) -> Result<ShmSegment> {
        if !self.growable {
            return Err(TicError::GrowthUnsupported {
                name: segment.name().to_owned(),
            });
        }
        let mut regions = self.regions.lock();
        let region = regions.get_mut(segment.name()).ok_or_else(|| {
            TicError::map_failed(segment.name(), "segment was removed before growth")
        })?;
        region.extend_to(bytes.div_ceil(8));
        debug!(
            name = segment.name(),
            words = region.words(),
            "memory segment grown"
        );
        Ok(region.view(segment.name(), false))
    }

    fn remove(&self, name: &str) -> Result<()> {
        if self.regions.lock().remove(name).is_some() {
            debug!(name, "memory segment removed");
        }
        Ok(())
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.regions.lock().contains_key(name))
    }
}
