use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tic_error::Result;
use tic_types::{TxnNumber, TxnState};

use crate::{ControlPage, TransactionInventory};

#[derive(Debug, Default)]
struct State {
    states: HashMap<TxnNumber, TxnState>,
    control: ControlPage,
}

/// Heap-resident inventory. Clones share the same records, so several
/// simulated processes can attach to one inventory.
#[derive(Debug, Clone, Default)]
pub struct MemoryInventory {
    state: Arc<RwLock<State>>,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// An inventory whose control page starts at `page`.
    pub fn with_control(page: ControlPage) -> Self {
        let inventory = Self::new();
        inventory.state.write().control = page;
        inventory
    }

    /// Number of transactions with an explicit record.
    pub fn recorded(&self) -> usize {
        self.state.read().states.len()
    }
}

impl TransactionInventory for MemoryInventory {
    fn read_state(&self, txn: TxnNumber) -> Result<TxnState> {
        Ok(self
            .state
            .read()
            .states
            .get(&txn)
            .copied()
            .unwrap_or(TxnState::Active))
    }

    fn write_state(&self, txn: TxnNumber, state: TxnState) -> Result<()> {
        self.state.write().states.insert(txn, state);
        Ok(())
    }

    fn read_control(&self) -> Result<ControlPage> {
        Ok(self.state.read().control)
    }

    fn write_control(&self, page: ControlPage) -> Result<()> {
        self.state.write().control = page;
        Ok(())
    }
}
