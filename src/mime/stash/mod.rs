//! Per-ordinal storage for part bodies that have been read ahead.
//!
//! A stash manager owns at most one buffer per ordinal. Once a body is
//! handed to [`StashManager::stash`] the manager owns it until
//! [`StashManager::unstash`] or [`StashManager::close`]. A failed stash is
//! remembered: every later recall of that ordinal returns the same error.
//!
//! Readers returned by [`StashManager::recall`] borrow the manager, so none
//! can outlive a `close()`.

pub mod file;
pub mod hybrid;
pub mod memory;

pub use file::FileStash;
pub use hybrid::HybridStash;
pub use memory::MemoryStash;

use std::io::Read;

use bytes::Bytes;

use crate::error::{MimeError, MimeResult as Result};

/// Storage strategy for stashed part bodies.
///
/// Implementations are not meant to be shared between threads; a body and
/// its stash are used by one caller at a time.
pub trait StashManager: Send {
    /// Drain `source` and store it under `ordinal`, replacing any previous entry.
    fn stash(&mut self, ordinal: usize, source: &mut dyn Read) -> Result<()>;

    /// Store an in-memory buffer under `ordinal`.
    fn stash_bytes(&mut self, ordinal: usize, bytes: Bytes) -> Result<()>;

    /// Release whatever is held for `ordinal`. Idempotent.
    fn unstash(&mut self, ordinal: usize);

    /// Stored size, or `None` when nothing usable is stashed.
    fn size(&self, ordinal: usize) -> Option<u64>;

    /// True when something (possibly a failure) is recorded for `ordinal`.
    fn peek(&self, ordinal: usize) -> bool;

    /// True when [`StashManager::recall_bytes`] is cheap for `ordinal`.
    fn is_byte_array_available(&self, ordinal: usize) -> bool;

    /// Replay the stored body.
    fn recall(&self, ordinal: usize) -> Result<Box<dyn Read + Send + '_>>;

    /// The stored body as one buffer.
    fn recall_bytes(&self, ordinal: usize) -> Result<Bytes>;

    /// Highest ordinal with an entry.
    fn max_ordinal(&self) -> Option<usize>;

    /// Release everything. The manager stays usable but empty.
    fn close(&mut self);
}

/// Entry for one ordinal: stored data or the error that prevented storing it.
#[derive(Debug)]
pub(crate) enum Slot<T> {
    Stored(T),
    Failed(MimeError),
}

impl<T> Slot<T> {
    pub(crate) fn stored(&self) -> Result<&T> {
        match self {
            Slot::Stored(value) => Ok(value),
            Slot::Failed(e) => Err(e.clone()),
        }
    }

    pub(crate) fn as_stored(&self) -> Option<&T> {
        match self {
            Slot::Stored(value) => Some(value),
            Slot::Failed(_) => None,
        }
    }
}

pub(crate) fn not_stashed(ordinal: usize) -> MimeError {
    MimeError::NoSuchPart {
        ordinal: Some(ordinal),
        content_id: None,
        reason: format!("Nothing is stashed for part #{ordinal}"),
    }
}
