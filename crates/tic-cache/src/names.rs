//! Segment names for one database.

use tic_types::BlockNumber;

pub fn header_segment(db: &str) -> String {
    format!("{db}.tic-hdr")
}

pub fn snapshot_segment(db: &str) -> String {
    format!("{db}.tic-snap")
}

pub fn block_segment(db: &str, block: BlockNumber) -> String {
    format!("{db}.tic-blk-{:010}", block.get())
}
