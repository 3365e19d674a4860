pub mod local;
pub mod traits;
#[cfg(unix)]
pub mod unix;

pub use local::{LocalLockOwner, LocalLockTable};
pub use traits::{ForcedReleaseHandler, LockId, LockManager, LockMode, WaitPolicy};
#[cfg(unix)]
pub use unix::{FileLockOwner, FileLockTable};
