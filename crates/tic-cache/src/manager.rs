//! The per-process cache manager.
//!
//! [`TransactionCache`] maps the shared segments of one database and runs
//! every cache operation against them. Shared state lives entirely in the
//! segments; the manager keeps only local mappings, the lock handle and the
//! bookkeeping needed to create and grow segments.
//!
//! Locks are used for segment lifecycle and liveness probing only:
//!
//! - `HeaderInit` serializes first-time creation of the shared state.
//! - `BlockInit(n)` serializes creation of status block `n`.
//! - `StatusBlock(n)` is held shared for as long as block `n` is mapped, and
//!   taken exclusively (bounded wait) to delete it.
//! - `SnapshotListGrowth` serializes growth of the snapshot list.
//! - `Transaction(t)` and `Attachment(a)` are held by the engine; the cache
//!   only probes them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tic_error::{Result, TicError};
use tic_inventory::{ControlPage, TransactionInventory};
use tic_lock::{LockId, LockManager, LockMode, WaitPolicy};
use tic_shm::SegmentStore;
use tic_types::{
    AttachmentId, BlockNumber, CacheConfig, CommitNumber, SnapshotHandle, StatementId, TxnNumber,
    TxnState,
};
use tracing::{debug, error, info, trace, warn};

use crate::active_snapshots::ActiveSnapshots;
use crate::header::GlobalHeader;
use crate::names;
use crate::snapshot_list::{SlotRead, SnapshotList};
use crate::status_block::StatusBlock;

/// The collaborators of one attached database.
#[derive(Debug, Clone)]
pub struct DatabaseHandle {
    /// Stable identifier every segment name is derived from.
    pub unique_id: String,
    pub store: Arc<dyn SegmentStore>,
    /// Lock owner of this process. Must not be shared with another cache
    /// instance of the same database.
    pub locks: Arc<dyn LockManager>,
    pub inventory: Arc<dyn TransactionInventory>,
}

impl DatabaseHandle {
    pub fn new(
        unique_id: impl Into<String>,
        store: Arc<dyn SegmentStore>,
        locks: Arc<dyn LockManager>,
        inventory: Arc<dyn TransactionInventory>,
    ) -> Self {
        Self {
            unique_id: unique_id.into(),
            store,
            locks,
            inventory,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    /// Requested by the process driving the transaction.
    Strict,
    /// Written back after reconciling with the inventory. A peer may have
    /// recorded an outcome first.
    Reconcile,
}

enum Lookup {
    Mapped(Arc<StatusBlock>),
    Initializing,
    Missing,
}

struct CacheInner {
    db_id: String,
    config: CacheConfig,
    txns_per_block: u64,
    store: Arc<dyn SegmentStore>,
    locks: Arc<dyn LockManager>,
    inventory: Arc<dyn TransactionInventory>,
    header: GlobalHeader,
    snapshots: RwLock<Option<Arc<SnapshotList>>>,
    snapshot_growth: Mutex<()>,
    blocks: RwLock<BTreeMap<BlockNumber, Arc<StatusBlock>>>,
    block_creation: Mutex<()>,
    finalized: AtomicBool,
}

/// Cross-process transaction inventory cache for one database.
pub struct TransactionCache {
    inner: Arc<CacheInner>,
}

impl fmt::Debug for TransactionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionCache")
            .field("db", &self.inner.db_id)
            .field("txns_per_block", &self.inner.txns_per_block)
            .field("mapped_blocks", &self.inner.blocks.read().len())
            .field("finalized", &self.inner.finalized.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Initialization
// ---------------------------------------------------------------------------

fn init_error(name: &str, err: TicError) -> TicError {
    match err {
        TicError::Io(_) | TicError::MapFailed { .. } => {
            let err = TicError::init(format!("cannot map {name}: {err}"));
            error!(segment = name, error = %err, "shared memory unavailable");
            err
        }
        other => other,
    }
}

fn open_snapshot_list(
    db: &DatabaseHandle,
    config: &CacheConfig,
    fresh: bool,
) -> Result<SnapshotList> {
    let name = names::snapshot_segment(&db.unique_id);
    if fresh {
        db.store.remove(&name)?;
    }
    let seg = db
        .store
        .open_or_create(&name, SnapshotList::bytes_for(config.initial_snapshot_slots))
        .map_err(|e| init_error(&name, e))?;
    if SnapshotList::is_published(&seg) {
        SnapshotList::attach(seg)
    } else {
        SnapshotList::initialize(seg, config.initial_snapshot_slots)
    }
}

/// Rebuild status blocks for `[horizon, next)` from the inventory and drop
/// leftovers of an earlier cache lifetime. Returns the number of blocks
/// written.
fn repopulate(
    db: &DatabaseHandle,
    config: &CacheConfig,
    txns_per_block: u64,
    control: ControlPage,
) -> Result<u64> {
    let horizon = control.oldest_interesting;
    let next = control.next_transaction.max(horizon);
    let first = horizon.block(txns_per_block);
    let last = next.block(txns_per_block);

    for raw in first.get()..=last.get() {
        let number = BlockNumber::new(raw);
        let name = names::block_segment(&db.unique_id, number);
        let seg = db
            .store
            .open_or_create(&name, config.block_bytes)
            .map_err(|e| init_error(&name, e))?;
        let block = StatusBlock::new(number, txns_per_block, seg)?;
        block.clear();
        let lo = horizon.get().max(number.first_txn(txns_per_block).get());
        let hi = next.get().min(number.next().first_txn(txns_per_block).get());
        for raw_txn in lo..hi {
            let txn = TxnNumber::new(raw_txn);
            let value = db.inventory.read_state(txn)?.reload_value();
            if value != CommitNumber::ACTIVE {
                block.store(txn, value);
            }
        }
        block.initialize();
    }

    let stale = |raw: u64| names::block_segment(&db.unique_id, BlockNumber::new(raw));
    let mut above = last.get() + 1;
    while db.store.exists(&stale(above))? {
        db.store.remove(&stale(above))?;
        above += 1;
    }
    let mut below = first.get();
    while below > 0 && db.store.exists(&stale(below - 1))? {
        below -= 1;
        db.store.remove(&stale(below))?;
    }
    if above > last.get() + 1 || below < first.get() {
        debug!(
            db = %db.unique_id,
            removed = (above - last.get() - 1) + (first.get() - below),
            "stale status blocks removed"
        );
    }
    Ok(last.get() - first.get() + 1)
}

fn open_shared_state(
    db: &DatabaseHandle,
    config: &CacheConfig,
    txns_per_block: u64,
) -> Result<(GlobalHeader, SnapshotList)> {
    let header_name = names::header_segment(&db.unique_id);
    let seg = db
        .store
        .open_or_create(&header_name, GlobalHeader::BYTES)
        .map_err(|e| init_error(&header_name, e))?;

    if GlobalHeader::is_published(&seg) {
        let header = GlobalHeader::attach(seg, txns_per_block)?;
        let snapshots = open_snapshot_list(db, config, false)?;
        debug!(
            db = %db.unique_id,
            horizon = %header.oldest_transaction(),
            latest = %header.latest_commit(),
            "attached to existing cache"
        );
        return Ok((header, snapshots));
    }

    let control = db.inventory.read_control()?;
    let header = GlobalHeader::prepare(seg, txns_per_block, control)?;
    let snapshots = open_snapshot_list(db, config, true)?;
    let blocks = repopulate(db, config, txns_per_block, control)?;
    header.publish();
    info!(
        db = %db.unique_id,
        horizon = %control.oldest_interesting,
        next = %control.next_transaction,
        blocks,
        "cache created from inventory"
    );
    Ok((header, snapshots))
}

impl TransactionCache {
    /// Attach to the cache of `db`, creating the shared state if this is the
    /// first opener.
    pub fn initialize(db: &DatabaseHandle, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let txns_per_block = config.transactions_per_block();
        if !db
            .locks
            .acquire(LockId::HeaderInit, LockMode::Exclusive, WaitPolicy::Wait)?
        {
            return Err(TicError::lock("header initialization lock not granted"));
        }
        let opened = open_shared_state(db, &config, txns_per_block);
        db.locks.release(LockId::HeaderInit)?;
        let (header, snapshots) = opened?;

        info!(
            db = %db.unique_id,
            owner = db.locks.owner_id(),
            txns_per_block,
            store = db.store.name(),
            "transaction cache initialized"
        );
        Ok(Self {
            inner: Arc::new(CacheInner {
                db_id: db.unique_id.clone(),
                config,
                txns_per_block,
                store: Arc::clone(&db.store),
                locks: Arc::clone(&db.locks),
                inventory: Arc::clone(&db.inventory),
                header,
                snapshots: RwLock::new(Some(Arc::new(snapshots))),
                snapshot_growth: Mutex::new(()),
                blocks: RwLock::new(BTreeMap::new()),
                block_creation: Mutex::new(()),
                finalized: AtomicBool::new(false),
            }),
        })
    }

    /// Release every lock the cache holds and unmap status blocks and the
    /// snapshot list. The header mapping goes with the last handle. The
    /// caller guarantees no other operation runs concurrently.
    pub fn finalize(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.finalized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let blocks = std::mem::take(&mut *inner.blocks.write());
        let mut first_err = None;
        for number in blocks.keys() {
            let id = LockId::StatusBlock(*number);
            inner.locks.clear_forced_release(id);
            if let Err(e) = inner.locks.release(id) {
                first_err.get_or_insert(e);
            }
        }
        inner.snapshots.write().take();
        info!(db = %inner.db_id, unmapped = blocks.len(), "transaction cache finalized");
        first_err.map_or(Ok(()), Err)
    }

    // -----------------------------------------------------------------------
    // Transaction state
    // -----------------------------------------------------------------------

    /// Cached state of `txn`. Never blocks and never creates a block.
    ///
    /// May return a stale `ACTIVE` or `LIMBO`; use
    /// [`snapshot_state`](Self::snapshot_state) when the answer must be
    /// authoritative.
    pub fn cache_state(&self, txn: TxnNumber) -> Result<CommitNumber> {
        self.inner.ensure_live()?;
        self.inner.cache_state(txn)
    }

    /// Record an outcome for `txn`. Returns the value now in its cell, which
    /// for a commit is the assigned commit number.
    pub fn set_state(&self, txn: TxnNumber, state: TxnState) -> Result<CommitNumber> {
        let inner = &self.inner;
        inner.ensure_live()?;
        if txn < inner.header.oldest_transaction() {
            return match state {
                TxnState::Committed => Ok(CommitNumber::PREHISTORIC),
                _ => Err(inner.illegal(txn, CommitNumber::PREHISTORIC, state)),
            };
        }
        let block = inner.get_or_create_block(txn.block(inner.txns_per_block))?;
        inner.transition(&block, txn, state, Transition::Strict)
    }

    /// Authoritative state of `txn`.
    ///
    /// An `ACTIVE` or `LIMBO` cell whose transaction lock is vacant belongs
    /// to a process that died without recording an outcome; the inventory
    /// decides, and the result is written back to the cell.
    pub fn snapshot_state(&self, txn: TxnNumber) -> Result<CommitNumber> {
        let inner = &self.inner;
        inner.ensure_live()?;
        let cached = inner.cache_state(txn)?;
        if cached.is_terminal() {
            return Ok(cached);
        }
        if !inner.locks.probe_vacant(LockId::Transaction(txn))? {
            return Ok(cached);
        }
        let recorded = inner.inventory.read_state(txn)?;
        warn!(
            txn = %txn,
            cached = %cached,
            recorded = %recorded,
            "transaction owner vanished, reconciling with inventory"
        );
        let resolved = match recorded {
            TxnState::Active => {
                inner.inventory.write_state(txn, TxnState::Dead)?;
                TxnState::Dead
            }
            other => other,
        };
        if resolved == TxnState::Limbo && cached == CommitNumber::LIMBO {
            return Ok(cached);
        }
        let block = inner.get_or_create_block(txn.block(inner.txns_per_block))?;
        inner.transition(&block, txn, resolved, Transition::Reconcile)
    }

    /// Advance the horizon to `min(oldest_interesting, oldest_snapshot)` and
    /// release status blocks that fell behind it.
    pub fn update_oldest_transaction(
        &self,
        oldest_interesting: TxnNumber,
        oldest_snapshot: TxnNumber,
    ) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_live()?;
        let target = oldest_interesting.min(oldest_snapshot);
        let previous = inner.header.advance_horizon(target);
        let horizon = inner.header.oldest_transaction();
        if horizon > previous {
            debug!(from = %previous, to = %horizon, "horizon advanced");
        }
        inner.release_obsolete_blocks(horizon)
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    /// Register a snapshot for `attachment`. Returns its handle and the
    /// commit number fixing its visibility.
    pub fn begin_snapshot(&self, attachment: AttachmentId) -> Result<(SnapshotHandle, CommitNumber)> {
        let inner = &self.inner;
        inner.ensure_live()?;
        loop {
            let list = inner.snapshot_list()?;
            for slot in 0..list.capacity() {
                if !list.try_claim(slot, attachment) {
                    continue;
                }
                let commit = list.record_commit(slot, &inner.header);
                if list.publish(slot, attachment) {
                    trace!(slot, attachment = %attachment, commit = %commit, "snapshot begun");
                    return Ok((SnapshotHandle::new(slot, attachment), commit));
                }
                warn!(slot, attachment = %attachment, "snapshot claim revoked by a peer");
            }
            inner.grow_snapshot_list(&list)?;
        }
    }

    /// Release a snapshot. Fails if the slot no longer belongs to the
    /// handle's attachment, e.g. after a sweep freed it and another
    /// attachment took it over.
    pub fn end_snapshot(&self, handle: SnapshotHandle) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_live()?;
        let list = inner.snapshot_list()?;
        let slot = handle.slot();
        if slot >= list.capacity() || !list.release_if_owned(slot, handle.attachment()) {
            return Err(TicError::InvalidSnapshotHandle { handle: slot });
        }
        list.lower_used();
        inner.header.bump_release_count();
        trace!(slot, "snapshot ended");
        Ok(())
    }

    /// Refresh `active` if any snapshot was released since its last sync.
    ///
    /// Slots of attachments whose lock is vacant are freed on the way.
    pub fn update_active_snapshots(&self, active: &mut ActiveSnapshots) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_live()?;
        let release_count = inner.header.release_count();
        if active.is_current(release_count) {
            return Ok(());
        }
        let list = inner.snapshot_list()?;
        let last_commit = inner.header.latest_commit();
        let used = list.used();
        let scan_to = if active.is_initialized() {
            used.min(list.capacity())
        } else {
            list.capacity()
        };
        let (snapshots, freed) = inner.scan_snapshots(&list, scan_to)?;
        active.replace(snapshots, last_commit, release_count, used);
        debug!(
            live = active.len(),
            freed,
            last_commit = %last_commit,
            "active snapshots refreshed"
        );
        Ok(())
    }

    /// Free every snapshot slot whose attachment is dead. Returns the number
    /// of slots freed.
    pub fn sweep_dead_snapshots(&self) -> Result<usize> {
        let inner = &self.inner;
        inner.ensure_live()?;
        let list = inner.snapshot_list()?;
        let (_, freed) = inner.scan_snapshots(&list, list.capacity())?;
        Ok(freed)
    }

    // -----------------------------------------------------------------------
    // Identifiers
    // -----------------------------------------------------------------------

    /// Issue a transaction number. Its status block exists on return.
    pub fn next_transaction_id(&self) -> Result<TxnNumber> {
        let inner = &self.inner;
        inner.ensure_live()?;
        let txn = inner.header.alloc_transaction()?;
        inner.get_or_create_block(txn.block(inner.txns_per_block))?;
        trace!(txn = %txn, "transaction number issued");
        Ok(txn)
    }

    pub fn next_attachment_id(&self) -> Result<AttachmentId> {
        self.inner.ensure_live()?;
        self.inner.header.alloc_attachment()
    }

    pub fn next_statement_id(&self) -> Result<StatementId> {
        self.inner.ensure_live()?;
        self.inner.header.alloc_statement()
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn latest_commit(&self) -> CommitNumber {
        self.inner.header.latest_commit()
    }

    pub fn oldest_transaction(&self) -> TxnNumber {
        self.inner.header.oldest_transaction()
    }

    pub fn transactions_per_block(&self) -> u64 {
        self.inner.txns_per_block
    }

    /// Status blocks this process currently maps, ascending.
    pub fn mapped_blocks(&self) -> Vec<BlockNumber> {
        self.inner.blocks.read().keys().copied().collect()
    }

    pub fn snapshot_slots_used(&self) -> Result<u32> {
        Ok(self.inner.snapshot_list()?.used())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn database_id(&self) -> &str {
        &self.inner.db_id
    }
}

impl Drop for TransactionCache {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            warn!(db = %self.inner.db_id, error = %e, "finalize on drop failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

impl CacheInner {
    fn ensure_live(&self) -> Result<()> {
        if self.finalized.load(Ordering::Acquire) {
            return Err(TicError::Finalized);
        }
        Ok(())
    }

    fn illegal(&self, txn: TxnNumber, from: CommitNumber, to: TxnState) -> TicError {
        error!(db = %self.db_id, txn = %txn, from = %from, to = %to, "illegal state transition");
        TicError::illegal_transition(txn.get(), from.describe(), to)
    }

    fn cache_state(self: &Arc<Self>, txn: TxnNumber) -> Result<CommitNumber> {
        if txn < self.header.oldest_transaction() {
            return Ok(CommitNumber::PREHISTORIC);
        }
        Ok(match self.lookup_block(txn.block(self.txns_per_block))? {
            Lookup::Mapped(block) => block.load(txn),
            Lookup::Initializing => CommitNumber::ACTIVE,
            Lookup::Missing => CommitNumber::PREHISTORIC,
        })
    }

    fn transition(
        &self,
        block: &StatusBlock,
        txn: TxnNumber,
        state: TxnState,
        mode: Transition,
    ) -> Result<CommitNumber> {
        let mut current = block.load(txn);
        loop {
            let target = match (current, state) {
                (CommitNumber::ACTIVE | CommitNumber::LIMBO, TxnState::Committed) => {
                    self.header.alloc_commit()?
                }
                (CommitNumber::ACTIVE | CommitNumber::LIMBO, TxnState::Dead) => CommitNumber::DEAD,
                (CommitNumber::ACTIVE, TxnState::Limbo) => CommitNumber::LIMBO,
                (done, TxnState::Committed) if done.is_committed() => return Ok(done),
                (done, _)
                    if mode == Transition::Reconcile
                        && (done.is_terminal() || done == CommitNumber::LIMBO) =>
                {
                    return Ok(done)
                }
                (from, to) => return Err(self.illegal(txn, from, to)),
            };
            match block.compare_exchange(txn, current, target) {
                Ok(()) => {
                    debug!(txn = %txn, from = %current, to = %target, "state recorded");
                    return Ok(target);
                }
                Err(observed) => {
                    trace!(txn = %txn, expected = %current, observed = %observed, "state raced");
                    current = observed;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Status block mapping
    // -----------------------------------------------------------------------

    fn block_name(&self, number: BlockNumber) -> String {
        names::block_segment(&self.db_id, number)
    }

    fn local_block(&self, number: BlockNumber) -> Option<Arc<StatusBlock>> {
        self.blocks.read().get(&number).cloned()
    }

    /// Find a block without creating it.
    fn lookup_block(self: &Arc<Self>, number: BlockNumber) -> Result<Lookup> {
        if let Some(block) = self.local_block(number) {
            return Ok(Lookup::Mapped(block));
        }
        let id = LockId::StatusBlock(number);
        if !self.locks.acquire(id, LockMode::Shared, WaitPolicy::NoWait)? {
            trace!(block = %number, "status block is being released");
            return Ok(Lookup::Missing);
        }
        let seg = match self.store.open_existing(&self.block_name(number)) {
            Ok(Some(seg)) => seg,
            Ok(None) => {
                self.locks.release(id)?;
                return Ok(Lookup::Missing);
            }
            Err(e) => {
                self.locks.release(id)?;
                return Err(e);
            }
        };
        let block = match StatusBlock::new(number, self.txns_per_block, seg) {
            Ok(block) if block.is_initialized() => block,
            Ok(_) => {
                self.locks.release(id)?;
                return Ok(Lookup::Initializing);
            }
            Err(e) => {
                self.locks.release(id)?;
                return Err(e);
            }
        };
        if let Err(e) = block.validate() {
            self.locks.release(id)?;
            return Err(e);
        }
        self.install_block(block).map(Lookup::Mapped)
    }

    /// Find or create a block.
    fn get_or_create_block(self: &Arc<Self>, number: BlockNumber) -> Result<Arc<StatusBlock>> {
        if let Some(block) = self.local_block(number) {
            return Ok(block);
        }
        let _creating = self.block_creation.lock();
        if let Some(block) = self.local_block(number) {
            return Ok(block);
        }
        let id = LockId::StatusBlock(number);
        let wait = WaitPolicy::Timeout(self.config.block_release_timeout);
        if !self.locks.acquire(id, LockMode::Shared, wait)? {
            return Err(TicError::LockTimeout {
                lock: id.to_string(),
            });
        }
        match self.create_block(number) {
            Ok(block) => self.install_block(block),
            Err(e) => {
                if let Err(release_err) = self.locks.release(id) {
                    warn!(block = %number, error = %release_err, "lock release failed");
                }
                Err(e)
            }
        }
    }

    fn create_block(&self, number: BlockNumber) -> Result<StatusBlock> {
        let init = LockId::BlockInit(number);
        let wait = WaitPolicy::Timeout(self.config.block_release_timeout);
        if !self.locks.acquire(init, LockMode::Exclusive, wait)? {
            return Err(TicError::LockTimeout {
                lock: init.to_string(),
            });
        }
        let name = self.block_name(number);
        let mut opened = self.open_block(number, &name);
        // A peer may have finished creating the segment between our attempts.
        if opened.is_err() {
            match self.store.exists(&name) {
                Ok(true) => opened = self.open_block(number, &name),
                Ok(false) => {}
                Err(e) => {
                    warn!(block = %number, segment = %name, error = %e, "status block probe failed");
                    opened = Err(e);
                }
            }
        }
        self.locks.release(init)?;
        opened
    }

    fn open_block(&self, number: BlockNumber, name: &str) -> Result<StatusBlock> {
        let seg = self.store.open_or_create(name, self.config.block_bytes)?;
        let block = StatusBlock::new(number, self.txns_per_block, seg)?;
        if block.is_initialized() {
            block.validate()?;
        } else {
            block.initialize();
            debug!(block = %number, segment = name, "status block created");
        }
        Ok(block)
    }

    /// Add a mapped block to the local directory. The caller holds one shared
    /// hold on the block lock, which the directory entry takes over.
    fn install_block(self: &Arc<Self>, block: StatusBlock) -> Result<Arc<StatusBlock>> {
        let number = block.number();
        let id = LockId::StatusBlock(number);
        let mut blocks = self.blocks.write();
        if let Some(existing) = blocks.get(&number) {
            let existing = Arc::clone(existing);
            drop(blocks);
            self.locks.release(id)?;
            return Ok(existing);
        }
        let block = Arc::new(block);
        blocks.insert(number, Arc::clone(&block));
        drop(blocks);

        let weak = Arc::downgrade(self);
        self.locks.on_forced_release(
            id,
            Arc::new(move |lock| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_forced_release(lock);
                }
            }),
        );
        debug!(block = %number, "status block mapped");
        Ok(block)
    }

    /// Forced-release request from a peer that wants to delete a block.
    fn on_forced_release(&self, lock: LockId) {
        let LockId::StatusBlock(number) = lock else {
            return;
        };
        let horizon = self.header.oldest_transaction();
        if StatusBlock::reclaimable(
            number,
            horizon,
            self.txns_per_block,
            self.config.safety_margin_blocks,
        ) {
            self.unmap_block(number);
        } else {
            trace!(block = %number, "status block still in use, keeping it");
        }
    }

    fn unmap_block(&self, number: BlockNumber) {
        if self.blocks.write().remove(&number).is_none() {
            return;
        }
        let id = LockId::StatusBlock(number);
        self.locks.clear_forced_release(id);
        if let Err(e) = self.locks.release(id) {
            warn!(block = %number, error = %e, "lock release failed");
        }
        debug!(block = %number, "status block unmapped");
    }

    fn release_obsolete_blocks(&self, horizon: TxnNumber) -> Result<()> {
        let margin = self.config.safety_margin_blocks;
        let first_retained = StatusBlock::first_retained(horizon, self.txns_per_block, margin);

        let unmapped: Vec<BlockNumber> = {
            let blocks = self.blocks.read();
            blocks.range(..first_retained).map(|(n, _)| *n).collect()
        };
        for number in &unmapped {
            self.unmap_block(*number);
        }

        let mut removed = 0_u64;
        loop {
            let cursor = self.header.oldest_block();
            if cursor >= first_retained {
                break;
            }
            if !StatusBlock::reclaimable(cursor, horizon, self.txns_per_block, margin) {
                let err = TicError::ReleaseWithinHorizon {
                    block: cursor.get(),
                    horizon: horizon.get(),
                };
                error!(block = %cursor, horizon = %horizon, "release of a live status block");
                return Err(err);
            }
            let id = LockId::StatusBlock(cursor);
            let wait = WaitPolicy::Timeout(self.config.block_release_timeout);
            if !self.locks.acquire(id, LockMode::Exclusive, wait)? {
                warn!(block = %cursor, "status block still mapped by a peer, deferring release");
                break;
            }
            let outcome = self.store.remove(&self.block_name(cursor));
            self.locks.release(id)?;
            outcome?;
            if self.header.advance_oldest_block(cursor, cursor.next()) {
                removed += 1;
                debug!(block = %cursor, "status block removed");
            }
        }

        if removed > 0 {
            info!(
                horizon = %horizon,
                removed,
                unmapped = unmapped.len(),
                "obsolete status blocks released"
            );
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Snapshot list mapping
    // -----------------------------------------------------------------------

    /// Current mapping of the snapshot list, remapped if a peer grew it.
    fn snapshot_list(&self) -> Result<Arc<SnapshotList>> {
        let list = self.snapshots.read().clone().ok_or(TicError::Finalized)?;
        if !list.is_stale() {
            return Ok(list);
        }
        let name = names::snapshot_segment(&self.db_id);
        let seg = self
            .store
            .open_existing(&name)?
            .ok_or_else(|| TicError::corrupt(name.as_str(), "snapshot list disappeared"))?;
        let fresh = Arc::new(SnapshotList::attach(seg)?);
        let mut current = self.snapshots.write();
        match current.as_ref() {
            None => Err(TicError::Finalized),
            Some(mapped) if mapped.capacity() >= fresh.capacity() => Ok(Arc::clone(mapped)),
            Some(_) => {
                debug!(slots = fresh.capacity(), "snapshot list remapped");
                *current = Some(Arc::clone(&fresh));
                Ok(fresh)
            }
        }
    }

    fn grow_snapshot_list(&self, seen: &SnapshotList) -> Result<()> {
        let _growing = self.snapshot_growth.lock();
        if self.snapshot_list()?.capacity() > seen.capacity() {
            return Ok(());
        }
        if !self
            .locks
            .acquire(LockId::SnapshotListGrowth, LockMode::Exclusive, WaitPolicy::Wait)?
        {
            return Err(TicError::lock("snapshot list growth lock not granted"));
        }
        let grown = self.grow_snapshot_list_locked(seen.capacity());
        self.locks.release(LockId::SnapshotListGrowth)?;
        grown
    }

    fn grow_snapshot_list_locked(&self, seen_capacity: u32) -> Result<()> {
        let current = self.snapshot_list()?;
        if current.capacity() > seen_capacity {
            return Ok(());
        }
        let allocated = current.allocated();
        let max = self.config.max_snapshot_slots;
        if allocated >= max {
            return Err(self.snapshot_capacity_exceeded(max));
        }
        if !self.store.can_grow() {
            return Err(self.snapshot_capacity_exceeded(allocated));
        }
        let target = allocated.saturating_mul(2).min(max);
        let seg = match self
            .store
            .grow(current.segment(), SnapshotList::bytes_for(target))
        {
            Ok(seg) => seg,
            Err(TicError::GrowthUnsupported { .. }) => {
                return Err(self.snapshot_capacity_exceeded(allocated))
            }
            Err(e) => return Err(e),
        };
        let grown = SnapshotList::attach(seg)?;
        grown.set_allocated(target);
        let mut mapped = self.snapshots.write();
        if mapped.is_none() {
            return Err(TicError::Finalized);
        }
        *mapped = Some(Arc::new(grown));
        debug!(from = allocated, to = target, "snapshot list grown");
        Ok(())
    }

    fn snapshot_capacity_exceeded(&self, limit: u32) -> TicError {
        warn!(db = %self.db_id, limit, "snapshot list is full");
        TicError::CapacityExceeded {
            what: "snapshot slots",
            limit: u64::from(limit),
        }
    }

    /// Wait for an allocation in `slot` to publish. A claim whose attachment
    /// died is revoked and counted in `freed`; a live allocator is always
    /// waited for, since its commit number may be older than the scan.
    fn settle_slot(&self, list: &SnapshotList, slot: u32, freed: &mut usize) -> Result<SlotRead> {
        loop {
            let attachment = match list.read_settled(slot) {
                SlotRead::Claimed(attachment) => attachment,
                settled => return Ok(settled),
            };
            if !self.locks.probe_vacant(LockId::Attachment(attachment))? {
                trace!(slot, attachment = %attachment, "waiting for snapshot allocation");
                continue;
            }
            if list.revoke_claim(slot, attachment) {
                *freed += 1;
                warn!(slot, attachment = %attachment, "revoked snapshot claim of dead attachment");
            }
        }
    }

    /// Collect live snapshots in `[0, upto)`, freeing slots of dead
    /// attachments. Returns the live commit numbers and the number freed.
    fn scan_snapshots(
        &self,
        list: &SnapshotList,
        upto: u32,
    ) -> Result<(BTreeSet<CommitNumber>, usize)> {
        let mut live = BTreeSet::new();
        let mut freed = 0_usize;
        for slot in 0..upto {
            match self.settle_slot(list, slot, &mut freed)? {
                SlotRead::Free | SlotRead::Claimed(_) => {}
                SlotRead::Live(attachment, commit) => {
                    if !self.locks.probe_vacant(LockId::Attachment(attachment))? {
                        live.insert(commit);
                    } else if list.release_if_owned(slot, attachment) {
                        freed += 1;
                        warn!(
                            slot,
                            attachment = %attachment,
                            commit = %commit,
                            "freed snapshot of dead attachment"
                        );
                    }
                }
            }
        }
        if freed > 0 {
            list.lower_used();
            self.header.bump_release_count();
        }
        Ok((live, freed))
    }
}
