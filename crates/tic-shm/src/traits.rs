use std::fmt;

use tic_error::Result;

use crate::segment::ShmSegment;

/// A namespace of named shared-memory segments.
///
/// Every process attached to a database opens the same names through its own
/// store instance; a segment opened twice (in one process or in two) must
/// expose the same words. Backends: in-process regions for tests and
/// single-process embedding ([`MemorySegmentStore`]) and file-backed mappings
/// visible to every process on the machine ([`FileSegmentStore`]).
///
/// [`MemorySegmentStore`]: crate::memory::MemorySegmentStore
/// [`FileSegmentStore`]: crate::file::FileSegmentStore
pub trait SegmentStore: Send + Sync + fmt::Debug {
    /// The name of this backend (e.g. "memory", "file").
    fn name(&self) -> &'static str;

    /// Whether [`grow`](Self::grow) can extend a segment after creation.
    ///
    /// Stores without growable mappings fail `grow` with
    /// `TicError::GrowthUnsupported`; callers fall back to a capacity error.
    fn can_grow(&self) -> bool;

    /// Open `name`, creating it zero-filled with at least `bytes` if absent.
    ///
    /// The returned segment reports [`ShmSegment::is_new`] when this call
    /// created the backing storage. Creation does not initialize any header;
    /// callers serialize first-time initialization themselves.
    fn open_or_create(&self, name: &str, bytes: usize) -> Result<ShmSegment>;

    /// Open `name` if it exists, mapping its current full size.
    fn open_existing(&self, name: &str) -> Result<Option<ShmSegment>>;

    /// Extend the backing storage of `segment` to at least `bytes` and return
    /// a fresh mapping. Views obtained earlier stay valid and coherent for the
    /// words they already covered.
    fn grow(&self, segment: &ShmSegment, bytes: usize) -> Result<ShmSegment>;

    /// Remove the backing storage. Existing mappings remain usable until
    /// dropped; later opens see no segment.
    fn remove(&self, name: &str) -> Result<()>;

    /// Whether a segment named `name` currently exists.
    fn exists(&self, name: &str) -> Result<bool>;
}
