//! The authoritative transaction inventory.
//!
//! The inventory is the durable record of every transaction's outcome. The
//! cache repopulates from it after a total loss and consults it when a
//! transaction's owner vanished without recording an outcome. Reads of the
//! inventory are slow relative to the cache and never sit on the hot path.

use std::fmt;

use tic_error::Result;
use tic_types::{TxnNumber, TxnState};

pub mod file;
pub mod memory;

pub use file::FileInventory;
pub use memory::MemoryInventory;

/// Global counters kept on the inventory's control page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlPage {
    /// Oldest transaction whose outcome still matters to anyone.
    pub oldest_interesting: TxnNumber,
    /// Next transaction number to hand out.
    pub next_transaction: TxnNumber,
}

pub trait TransactionInventory: Send + Sync + fmt::Debug {
    /// Recorded state of `txn`. Transactions with no record read as active.
    fn read_state(&self, txn: TxnNumber) -> Result<TxnState>;

    fn write_state(&self, txn: TxnNumber, state: TxnState) -> Result<()>;

    fn read_control(&self) -> Result<ControlPage>;

    fn write_control(&self, page: ControlPage) -> Result<()>;
}
