//! File-backed segment store.
//!
//! Each segment is a file under one directory, mapped shared with `memmap2`.
//! Every process that maps the same file sees the same words, which makes
//! this the store for real multi-process attachment. Growth extends the file
//! and remaps; old mappings keep covering the prefix they mapped.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use tic_error::{Result, TicError};
use tracing::{debug, trace};

use crate::segment::ShmSegment;
use crate::traits::SegmentStore;

#[derive(Debug, Clone)]
pub struct FileSegmentStore {
    dir: PathBuf,
}

impl FileSegmentStore {
    /// A store rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn map(name: &str, file: &File, created: bool) -> Result<ShmSegment> {
        // SAFETY: the file is opened read-write and mapped shared. Other
        // processes may modify it concurrently, which is why the segment only
        // exposes the bytes as atomics. Truncation below a mapped length does
        // not happen: files only grow until they are unlinked.
        let map = unsafe { MmapMut::map_mut(file) }.map_err(|e| TicError::map_failed(name, e))?;
        Ok(ShmSegment::from_mmap(name, map, created))
    }
}

fn open_rw(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).open(path)
}

fn round_to_word(bytes: usize) -> u64 {
    (bytes.div_ceil(8).max(1) * 8) as u64
}

impl SegmentStore for FileSegmentStore {
    fn name(&self) -> &'static str {
        "file"
    }

    fn can_grow(&self) -> bool {
        true
    }

    fn open_or_create(&self, name: &str, bytes: usize) -> Result<ShmSegment> {
        let path = self.path(name);
        let (file, created) = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => (file, true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => (open_rw(&path)?, false),
            Err(e) => return Err(e.into()),
        };
        let want = round_to_word(bytes);
        if file.metadata()?.len() < want {
            file.set_len(want)?;
        }
        if created {
            debug!(name, bytes = want, "file segment created");
        } else {
            trace!(name, "file segment reopened");
        }
        Self::map(name, &file, created)
    }

    fn open_existing(&self, name: &str) -> Result<Option<ShmSegment>> {
        let file = match open_rw(&self.path(name)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        // A creator that has not sized the file yet has nothing to map.
        if file.metadata()?.len() < 8 {
            return Ok(None);
        }
        Self::map(name, &file, false).map(Some)
    }

    fn grow(&self, segment: &ShmSegment, bytes: usize) -> Result<ShmSegment> {
        let file = match open_rw(&self.path(segment.name())) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(TicError::map_failed(
                    segment.name(),
                    "segment was removed before growth",
                ))
            }
            Err(e) => return Err(e.into()),
        };
        let want = round_to_word(bytes);
        if file.metadata()?.len() < want {
            file.set_len(want)?;
            debug!(name = segment.name(), bytes = want, "file segment grown");
        }
        Self::map(segment.name(), &file, false)
    }

    fn remove(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.path(name)) {
            Ok(()) => {
                debug!(name, "file segment removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.path(name).exists())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;

    #[test]
    fn two_mappings_of_one_file_share_words() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSegmentStore::new(dir.path()).unwrap();
        let a = store.open_or_create("seg", 128).unwrap();
        assert!(a.is_new());
        assert_eq!(a.word_count(), 16);
        let b = FileSegmentStore::new(dir.path())
            .unwrap()
            .open_existing("seg")
            .unwrap()
            .unwrap();
        a.word(4).store(0xABCD, Ordering::Release);
        assert_eq!(b.word(4).load(Ordering::Acquire), 0xABCD);
    }

    #[test]
    fn reopen_is_not_new() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSegmentStore::new(dir.path()).unwrap();
        let _a = store.open_or_create("seg", 64).unwrap();
        let b = store.open_or_create("seg", 64).unwrap();
        assert!(!b.is_new());
    }

    #[test]
    fn growth_preserves_contents() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSegmentStore::new(dir.path()).unwrap();
        let small = store.open_or_create("seg", 64).unwrap();
        small.word(7).store(99, Ordering::Release);
        let big = store.grow(&small, 4096).unwrap();
        assert_eq!(big.word_count(), 512);
        assert_eq!(big.word(7).load(Ordering::Acquire), 99);
        big.word(3).store(5, Ordering::Release);
        assert_eq!(small.word(3).load(Ordering::Acquire), 5);
    }

    #[test]
    fn remove_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSegmentStore::new(dir.path()).unwrap();
        assert!(store.open_existing("seg").unwrap().is_none());
        let seg = store.open_or_create("seg", 64).unwrap();
        assert!(store.exists("seg").unwrap());
        store.remove("seg").unwrap();
        assert!(!store.exists("seg").unwrap());
        store.remove("seg").unwrap();
        assert!(store.grow(&seg, 128).is_err());
    }

    #[test]
    fn unsized_file_is_not_opened() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSegmentStore::new(dir.path()).unwrap();
        File::create(dir.path().join("seg")).unwrap();
        assert!(store.open_existing("seg").unwrap().is_none());
    }
}
