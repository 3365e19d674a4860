//! Transaction inventory cache.
//!
//! A cross-process, memory-mapped cache of transaction outcomes for an MVCC
//! engine whose server processes attach to the same database. Visibility
//! checks read a status cell with one atomic load; the lock manager is only
//! involved when segments are created or deleted and when a transaction's
//! owner may have died.
//!
//! Shared state per database:
//!
//! - a global header with the commit counter, the horizon and id generators
//!   ([`header`]),
//! - status blocks holding one commit-number cell per transaction
//!   ([`status_block`]),
//! - a snapshot list recording the commit number of every open snapshot
//!   ([`snapshot_list`]).
//!
//! [`TransactionCache`] is the per-process handle over all three.

pub mod active_snapshots;
pub mod header;
pub mod manager;
pub mod names;
pub mod snapshot_list;
pub mod status_block;

pub use active_snapshots::ActiveSnapshots;
pub use manager::{DatabaseHandle, TransactionCache};
