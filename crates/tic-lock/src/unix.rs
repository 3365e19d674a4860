//! Cross-process lock manager over POSIX `fcntl` byte-range locks.
//!
//! Every lock id maps to one byte of a shared lock file (see
//! [`LockId::packed`]). A shared hold takes `F_RDLCK` on that byte and an
//! exclusive hold takes `F_WRLCK`, so locks conflict between processes the
//! way the lock manager contract requires.
//!
//! **Key constraint:** `fcntl` locks belong to the process, not the file
//! descriptor, and closing *any* descriptor of the file drops all of them.
//! Owners inside one process therefore share a single descriptor, and an
//! in-process [`LocalLockTable`] arbitrates between them. The byte lock a
//! process holds always reflects the strongest mode any of its owners holds.
//! Open one [`FileLockTable`] per lock file per process.
//!
//! Forced-release handlers are delivered to in-process holders only; a waiter
//! in another process just polls until the holder lets go.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, AsRawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tic_error::{Result, TicError};
use tracing::{debug, trace};

use crate::local::{LocalLockOwner, LocalLockTable};
use crate::traits::{ForcedReleaseHandler, LockId, LockManager, LockMode, WaitPolicy};

/// Delay between `F_SETLK` attempts while waiting on another process.
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Attempt a non-blocking POSIX advisory lock on one byte via `F_SETLK`.
///
/// Returns `Ok(false)` if another process holds a conflicting lock.
#[allow(clippy::cast_possible_wrap)]
fn posix_lock(file: &impl AsFd, lock_type: libc::c_int, offset: u64) -> Result<bool> {
    let flock = libc::flock {
        l_type: lock_type as libc::c_short,
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: offset as libc::off_t,
        l_len: 1,
        l_pid: 0,
    };
    match nix::fcntl::fcntl(
        file.as_fd().as_raw_fd(),
        nix::fcntl::FcntlArg::F_SETLK(&flock),
    ) {
        Ok(_) => Ok(true),
        Err(nix::errno::Errno::EACCES | nix::errno::Errno::EAGAIN) => Ok(false),
        Err(e) => Err(TicError::Io(e.into())),
    }
}

fn byte_offset(id: LockId) -> Result<u64> {
    id.packed()
        .ok_or_else(|| TicError::lock(format!("{id} is outside the lock file key range")))
}

const fn lock_type(mode: Option<LockMode>) -> libc::c_int {
    match mode {
        None => libc::F_UNLCK,
        Some(LockMode::Shared) => libc::F_RDLCK,
        Some(LockMode::Exclusive) => libc::F_WRLCK,
    }
}

struct FileTableInner {
    file: File,
    data_dir: PathBuf,
    local: LocalLockTable,
    /// Serializes "compute strongest local mode, apply it with fcntl" so two
    /// owners never apply stale modes out of order.
    sync: Mutex<()>,
}

impl FileTableInner {
    /// Bring the process-level byte lock for `id` in line with the local
    /// holders. Returns false if another process blocks the required mode.
    fn sync_byte(&self, id: LockId) -> Result<bool> {
        let offset = byte_offset(id)?;
        let _guard = self.sync.lock();
        let mode = self.local.strongest_mode(id);
        let granted = posix_lock(&self.file, lock_type(mode), offset)?;
        trace!(%id, ?mode, granted, "fcntl lock synced");
        Ok(granted)
    }

    fn data_path(&self, id: LockId) -> PathBuf {
        self.data_dir
            .join(format!("{}-{:016x}", id.kind(), id.key()))
    }
}

/// A lock file shared by every process attached to one database.
#[derive(Clone)]
pub struct FileLockTable {
    inner: Arc<FileTableInner>,
}

impl std::fmt::Debug for FileLockTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLockTable")
            .field("data_dir", &self.inner.data_dir)
            .finish_non_exhaustive()
    }
}

impl FileLockTable {
    /// Open (creating if needed) the lock file at `path`. Associated data is
    /// kept in a sibling directory named `<path>.data`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let mut data_dir = path.as_os_str().to_owned();
        data_dir.push(".data");
        let data_dir = PathBuf::from(data_dir);
        fs::create_dir_all(&data_dir)?;
        debug!(path = %path.display(), "lock file opened");
        Ok(Self {
            inner: Arc::new(FileTableInner {
                file,
                data_dir,
                local: LocalLockTable::new(),
                sync: Mutex::new(()),
            }),
        })
    }

    pub fn owner(&self) -> FileLockOwner {
        FileLockOwner {
            inner: Arc::clone(&self.inner),
            local: self.inner.local.owner(),
        }
    }
}

/// One owner of a [`FileLockTable`].
pub struct FileLockOwner {
    inner: Arc<FileTableInner>,
    local: LocalLockOwner,
}

impl std::fmt::Debug for FileLockOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLockOwner")
            .field("owner", &self.local.owner_id())
            .finish_non_exhaustive()
    }
}

impl FileLockOwner {
    fn release_inner(&self, id: LockId) -> Result<()> {
        self.local.release(id)?;
        // Downgrading or unlocking never conflicts with another process.
        self.inner.sync_byte(id)?;
        Ok(())
    }
}

impl LockManager for FileLockOwner {
    fn owner_id(&self) -> u64 {
        self.local.owner_id()
    }

    fn acquire(&self, id: LockId, mode: LockMode, wait: WaitPolicy) -> Result<bool> {
        byte_offset(id)?;
        let deadline = match wait {
            WaitPolicy::Timeout(timeout) => Some(Instant::now() + timeout),
            WaitPolicy::NoWait | WaitPolicy::Wait => None,
        };
        if !self.local.acquire(id, mode, wait)? {
            return Ok(false);
        }
        loop {
            if self.inner.sync_byte(id)? {
                return Ok(true);
            }
            let expired = match (wait, deadline) {
                (WaitPolicy::NoWait, _) => true,
                (_, Some(deadline)) => Instant::now() >= deadline,
                (_, None) => false,
            };
            if expired {
                self.release_inner(id)?;
                debug!(%id, ?mode, "lock held by another process");
                return Ok(false);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn release(&self, id: LockId) -> Result<()> {
        if self.local.held_mode(id).is_none() {
            return Ok(());
        }
        self.release_inner(id)
    }

    fn held_mode(&self, id: LockId) -> Option<LockMode> {
        self.local.held_mode(id)
    }

    fn read_associated_data(&self, id: LockId) -> Result<Option<Vec<u8>>> {
        match fs::read(self.inner.data_path(id)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_associated_data(&self, id: LockId, data: &[u8]) -> Result<()> {
        let path = self.inner.data_path(id);
        let mut tmp = path.clone().into_os_string();
        tmp.push(format!(".{}.tmp", std::process::id()));
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn on_forced_release(&self, id: LockId, handler: ForcedReleaseHandler) {
        self.local.on_forced_release(id, handler);
    }

    fn clear_forced_release(&self, id: LockId) {
        self.local.clear_forced_release(id);
    }

    fn release_all(&self) -> Result<()> {
        let held = self.local.held();
        self.local.release_all()?;
        for (id, _, _) in held {
            self.inner.sync_byte(id)?;
        }
        Ok(())
    }
}

impl Drop for FileLockOwner {
    fn drop(&mut self) {
        let _ = self.release_all();
    }
}
