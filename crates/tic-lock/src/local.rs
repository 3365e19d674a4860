//! In-process lock table.
//!
//! Each [`LocalLockOwner`] stands in for one attached process. Owners created
//! from the same [`LocalLockTable`] conflict with each other exactly as
//! separate processes would under a distributed lock manager, which makes the
//! table the backend for single-process embedding and for tests that model
//! several processes with threads.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tic_error::Result;
use tracing::{debug, trace};

use crate::traits::{ForcedReleaseHandler, LockId, LockManager, LockMode, WaitPolicy};

#[derive(Debug, Clone, Copy)]
struct Hold {
    mode: LockMode,
    count: u32,
}

#[derive(Debug, Default)]
struct LockEntry {
    holders: HashMap<u64, Hold>,
    data: Option<Vec<u8>>,
}

impl LockEntry {
    fn grantable(&self, owner: u64, mode: LockMode) -> bool {
        self.holders
            .iter()
            .filter(|(holder, _)| **holder != owner)
            .all(|(_, hold)| mode.compatible_with(hold.mode))
    }

    fn is_unused(&self) -> bool {
        self.holders.is_empty() && self.data.is_none()
    }
}

#[derive(Default)]
struct TableState {
    locks: HashMap<LockId, LockEntry>,
    handlers: HashMap<(u64, LockId), ForcedReleaseHandler>,
    next_owner: u64,
}

impl TableState {
    fn try_grant(&mut self, id: LockId, owner: u64, mode: LockMode) -> bool {
        let entry = self.locks.entry(id).or_default();
        if !entry.grantable(owner, mode) {
            return false;
        }
        entry
            .holders
            .entry(owner)
            .and_modify(|hold| {
                hold.mode = hold.mode.strongest(mode);
                hold.count += 1;
            })
            .or_insert(Hold { mode, count: 1 });
        true
    }

    /// Drop one hold. Returns true if the owner no longer holds `id`.
    fn release_one(&mut self, id: LockId, owner: u64) -> bool {
        let Some(entry) = self.locks.get_mut(&id) else {
            return false;
        };
        let Some(hold) = entry.holders.get_mut(&owner) else {
            return false;
        };
        hold.count -= 1;
        let gone = hold.count == 0;
        if gone {
            entry.holders.remove(&owner);
            if entry.is_unused() {
                self.locks.remove(&id);
            }
        }
        gone
    }

    fn conflicting_handlers(
        &self,
        id: LockId,
        owner: u64,
        mode: LockMode,
    ) -> Vec<ForcedReleaseHandler> {
        let Some(entry) = self.locks.get(&id) else {
            return Vec::new();
        };
        entry
            .holders
            .iter()
            .filter(|(holder, hold)| **holder != owner && !mode.compatible_with(hold.mode))
            .filter_map(|(holder, _)| self.handlers.get(&(*holder, id)).cloned())
            .collect()
    }

    fn strongest_mode(&self, id: LockId) -> Option<LockMode> {
        self.locks
            .get(&id)?
            .holders
            .values()
            .map(|hold| hold.mode)
            .reduce(LockMode::strongest)
    }
}

struct TableInner {
    state: Mutex<TableState>,
    released: Condvar,
}

/// A lock namespace shared by any number of in-process owners.
#[derive(Clone)]
pub struct LocalLockTable {
    inner: Arc<TableInner>,
}

impl Default for LocalLockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LocalLockTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("LocalLockTable")
            .field("locks", &state.locks.len())
            .field("owners_created", &state.next_owner)
            .finish()
    }
}

impl LocalLockTable {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TableInner {
                state: Mutex::new(TableState::default()),
                released: Condvar::new(),
            }),
        }
    }

    /// Register a new owner (one simulated process).
    pub fn owner(&self) -> LocalLockOwner {
        let id = {
            let mut state = self.inner.state.lock();
            state.next_owner += 1;
            state.next_owner
        };
        debug!(owner = id, "lock owner registered");
        LocalLockOwner {
            table: Arc::clone(&self.inner),
            owner: id,
        }
    }

    /// Strongest mode any owner holds `id` in.
    pub fn strongest_mode(&self, id: LockId) -> Option<LockMode> {
        self.inner.state.lock().strongest_mode(id)
    }

    /// Number of owners currently holding `id`.
    pub fn holder_count(&self, id: LockId) -> usize {
        self.inner
            .state
            .lock()
            .locks
            .get(&id)
            .map_or(0, |entry| entry.holders.len())
    }
}

/// One owner in a [`LocalLockTable`]. Dropping it releases everything it
/// holds, the way a process exit releases its locks.
pub struct LocalLockOwner {
    table: Arc<TableInner>,
    owner: u64,
}

impl fmt::Debug for LocalLockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalLockOwner")
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl LocalLockOwner {
    /// The table this owner belongs to.
    pub fn table(&self) -> LocalLockTable {
        LocalLockTable {
            inner: Arc::clone(&self.table),
        }
    }

    /// Every lock this owner holds, with its mode and hold count.
    pub fn held(&self) -> Vec<(LockId, LockMode, u32)> {
        let state = self.table.state.lock();
        state
            .locks
            .iter()
            .filter_map(|(id, entry)| {
                entry
                    .holders
                    .get(&self.owner)
                    .map(|hold| (*id, hold.mode, hold.count))
            })
            .collect()
    }

    fn wait_for_release(
        &self,
        state: &mut MutexGuard<'_, TableState>,
        deadline: Option<Instant>,
    ) -> bool {
        match deadline {
            None => {
                self.table.released.wait(state);
                true
            }
            Some(deadline) => !self.table.released.wait_until(state, deadline).timed_out(),
        }
    }
}

impl LockManager for LocalLockOwner {
    fn owner_id(&self) -> u64 {
        self.owner
    }

    fn acquire(&self, id: LockId, mode: LockMode, wait: WaitPolicy) -> Result<bool> {
        let deadline = match wait {
            WaitPolicy::Timeout(timeout) => Some(Instant::now() + timeout),
            WaitPolicy::NoWait | WaitPolicy::Wait => None,
        };
        let mut state = self.table.state.lock();
        let mut notified = false;
        loop {
            if state.try_grant(id, self.owner, mode) {
                trace!(owner = self.owner, %id, ?mode, "lock granted");
                return Ok(true);
            }
            if wait == WaitPolicy::NoWait {
                return Ok(false);
            }
            if !notified {
                notified = true;
                let handlers = state.conflicting_handlers(id, self.owner, mode);
                if !handlers.is_empty() {
                    debug!(
                        owner = self.owner,
                        %id,
                        holders = handlers.len(),
                        "requesting forced release"
                    );
                    MutexGuard::unlocked(&mut state, || {
                        for handler in &handlers {
                            handler(id);
                        }
                    });
                    continue;
                }
            }
            if !self.wait_for_release(&mut state, deadline) {
                let granted = state.try_grant(id, self.owner, mode);
                if !granted {
                    debug!(owner = self.owner, %id, ?mode, "lock wait timed out");
                }
                return Ok(granted);
            }
        }
    }

    fn release(&self, id: LockId) -> Result<()> {
        let mut state = self.table.state.lock();
        if state.release_one(id, self.owner) {
            trace!(owner = self.owner, %id, "lock released");
            self.table.released.notify_all();
        }
        Ok(())
    }

    fn held_mode(&self, id: LockId) -> Option<LockMode> {
        let state = self.table.state.lock();
        state
            .locks
            .get(&id)?
            .holders
            .get(&self.owner)
            .map(|hold| hold.mode)
    }

    fn read_associated_data(&self, id: LockId) -> Result<Option<Vec<u8>>> {
        let state = self.table.state.lock();
        Ok(state.locks.get(&id).and_then(|entry| entry.data.clone()))
    }

    fn write_associated_data(&self, id: LockId, data: &[u8]) -> Result<()> {
        let mut state = self.table.state.lock();
        state.locks.entry(id).or_default().data = Some(data.to_vec());
        Ok(())
    }

    fn on_forced_release(&self, id: LockId, handler: ForcedReleaseHandler) {
        self.table
            .state
            .lock()
            .handlers
            .insert((self.owner, id), handler);
    }

    fn clear_forced_release(&self, id: LockId) {
        self.table.state.lock().handlers.remove(&(self.owner, id));
    }

    fn release_all(&self) -> Result<()> {
        let mut state = self.table.state.lock();
        let owner = self.owner;
        let mut released = 0_usize;
        state.locks.retain(|_, entry| {
            if entry.holders.remove(&owner).is_some() {
                released += 1;
            }
            !entry.is_unused()
        });
        state.handlers.retain(|(holder, _), _| *holder != owner);
        if released > 0 {
            debug!(owner, released, "released all locks");
            self.table.released.notify_all();
        }
        Ok(())
    }
}

impl Drop for LocalLockOwner {
    fn drop(&mut self) {
        let _ = self.release_all();
    }
}
