pub mod file;
pub mod memory;
pub mod segment;
pub mod traits;

pub use file::FileSegmentStore;
pub use memory::MemorySegmentStore;
pub use segment::ShmSegment;
pub use traits::SegmentStore;
