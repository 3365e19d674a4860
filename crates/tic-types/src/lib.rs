//! Core value types shared by every transaction inventory cache crate.
//!
//! - [`glossary`]: transaction, commit, attachment, statement and block
//!   identifiers, plus the commit-number sentinels.
//! - [`config`]: the tunables a cache is initialized with.

pub mod config;
pub mod glossary;

pub use config::CacheConfig;
pub use glossary::{
    AttachmentId, BlockNumber, CommitNumber, SnapshotHandle, StatementId, TxnNumber, TxnState,
};
