//! File-backed transaction inventory.
//!
//! The file is a 40-byte header followed by a packed state array with two
//! bits per transaction (four transactions per byte). Bytes past the end of
//! the file read as zero, which decodes as `Active`.
//!
//! Header (little-endian):
//!
//! - `[u8;8]` magic `"TICINV\0\0"`
//! - `u32` layout version, `u32` reserved
//! - `u64` oldest interesting transaction
//! - `u64` next transaction
//! - `u64` xxh3_64 checksum over the preceding 32 bytes

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tic_error::{Result, TicError};
use tic_types::{TxnNumber, TxnState};
use tracing::{debug, trace};
use xxhash_rust::xxh3::xxh3_64;

use crate::{ControlPage, TransactionInventory};

mod offsets {
    pub const MAGIC: usize = 0;
    pub const MAGIC_LEN: usize = 8;
    pub const VERSION: usize = 8;
    pub const OLDEST: usize = 16;
    pub const NEXT: usize = 24;
    pub const CHECKSUM: usize = 32;
    pub const HEADER_SIZE: usize = 40;
}

const MAGIC: [u8; 8] = *b"TICINV\0\0";
const LAYOUT_VERSION: u32 = 1;
const STATES_PER_BYTE: u64 = 4;

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut word = [0_u8; 8];
    word.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(word)
}

fn encode_header(page: ControlPage) -> [u8; offsets::HEADER_SIZE] {
    let mut buf = [0_u8; offsets::HEADER_SIZE];
    buf[offsets::MAGIC..offsets::MAGIC + offsets::MAGIC_LEN].copy_from_slice(&MAGIC);
    buf[offsets::VERSION..offsets::VERSION + 4].copy_from_slice(&LAYOUT_VERSION.to_le_bytes());
    buf[offsets::OLDEST..offsets::OLDEST + 8]
        .copy_from_slice(&page.oldest_interesting.get().to_le_bytes());
    buf[offsets::NEXT..offsets::NEXT + 8]
        .copy_from_slice(&page.next_transaction.get().to_le_bytes());
    let checksum = xxh3_64(&buf[..offsets::CHECKSUM]);
    buf[offsets::CHECKSUM..offsets::CHECKSUM + 8].copy_from_slice(&checksum.to_le_bytes());
    buf
}

/// Byte offset and bit shift of a transaction's two-bit state.
fn locate(txn: TxnNumber) -> (u64, u32) {
    let byte = offsets::HEADER_SIZE as u64 + txn.get() / STATES_PER_BYTE;
    #[allow(clippy::cast_possible_truncation)]
    let shift = ((txn.get() % STATES_PER_BYTE) * 2) as u32;
    (byte, shift)
}

/// Inventory stored in a single file.
///
/// Writes are serialized within this process. Processes sharing the file
/// must not write states of the same transaction concurrently, which holds
/// because only the process driving a transaction records its outcome.
#[derive(Debug)]
pub struct FileInventory {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileInventory {
    /// Open the inventory at `path`, creating an empty one if absent.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if file.metadata()?.len() == 0 {
            file.write_all(&encode_header(ControlPage::default()))?;
            file.sync_data()?;
            debug!(path = %path.display(), "inventory created");
        } else {
            let mut buf = [0_u8; offsets::HEADER_SIZE];
            file.read_exact(&mut buf)
                .map_err(|e| corrupt(&path, format!("short header: {e}")))?;
            Self::validate(&path, &buf)?;
            debug!(path = %path.display(), "inventory opened");
        }
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn validate(path: &Path, buf: &[u8; offsets::HEADER_SIZE]) -> Result<()> {
        if buf[offsets::MAGIC..offsets::MAGIC + offsets::MAGIC_LEN] != MAGIC {
            return Err(corrupt(path, "bad magic"));
        }
        let mut version = [0_u8; 4];
        version.copy_from_slice(&buf[offsets::VERSION..offsets::VERSION + 4]);
        let version = u32::from_le_bytes(version);
        if version != LAYOUT_VERSION {
            return Err(corrupt(path, format!("unsupported version {version}")));
        }
        let stored = read_u64(buf, offsets::CHECKSUM);
        if stored != xxh3_64(&buf[..offsets::CHECKSUM]) {
            return Err(corrupt(path, "header checksum mismatch"));
        }
        Ok(())
    }

    fn read_byte(file: &mut File, at: u64) -> io::Result<u8> {
        if at >= file.metadata()?.len() {
            return Ok(0);
        }
        file.seek(SeekFrom::Start(at))?;
        let mut byte = [0_u8; 1];
        file.read_exact(&mut byte)?;
        Ok(byte[0])
    }
}

fn corrupt(path: &Path, detail: impl Into<String>) -> TicError {
    TicError::corrupt(path.display().to_string(), detail)
}

impl TransactionInventory for FileInventory {
    fn read_state(&self, txn: TxnNumber) -> Result<TxnState> {
        let (at, shift) = locate(txn);
        let byte = Self::read_byte(&mut self.file.lock(), at)?;
        Ok(TxnState::from_bits(byte >> shift))
    }

    fn write_state(&self, txn: TxnNumber, state: TxnState) -> Result<()> {
        let (at, shift) = locate(txn);
        let mut file = self.file.lock();
        let old = Self::read_byte(&mut file, at)?;
        let new = (old & !(0b11 << shift)) | (state.to_bits() << shift);
        file.seek(SeekFrom::Start(at))?;
        file.write_all(&[new])?;
        trace!(%txn, %state, "inventory state written");
        Ok(())
    }

    fn read_control(&self) -> Result<ControlPage> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        let mut buf = [0_u8; offsets::HEADER_SIZE];
        file.read_exact(&mut buf)?;
        Self::validate(&self.path, &buf)?;
        Ok(ControlPage {
            oldest_interesting: TxnNumber::new(read_u64(&buf, offsets::OLDEST)),
            next_transaction: TxnNumber::new(read_u64(&buf, offsets::NEXT)),
        })
    }

    fn write_control(&self, page: ControlPage) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&encode_header(page))?;
        file.sync_data()?;
        Ok(())
    }
}
