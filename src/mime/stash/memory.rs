//! In-memory stash.

use std::collections::BTreeMap;
use std::io::{self, Cursor, Read};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use super::{not_stashed, Slot, StashManager};
use crate::error::{MimeError, MimeResult as Result};

/// Stash keeping every body in a reference-counted buffer.
///
/// `recall_bytes` hands out the stored buffer itself (a cheap clone of a
/// [`Bytes`]), never a copy.
#[derive(Debug, Default)]
pub struct MemoryStash {
    slots: BTreeMap<usize, Slot<Bytes>>,
}

impl MemoryStash {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `error` as the outcome of stashing `ordinal`.
    pub(crate) fn fail(&mut self, ordinal: usize, error: MimeError) {
        self.slots.insert(ordinal, Slot::Failed(error));
    }

    /// Total bytes currently held.
    pub fn total_size(&self) -> u64 {
        self.slots
            .values()
            .filter_map(Slot::as_stored)
            .map(|b| b.len() as u64)
            .sum()
    }
}

impl StashManager for MemoryStash {
    fn stash(&mut self, ordinal: usize, source: &mut dyn Read) -> Result<()> {
        self.unstash(ordinal);
        let mut writer = BytesMut::with_capacity(4096).writer();
        match io::copy(source, &mut writer) {
            Ok(n) => {
                debug!(ordinal, size = n, "Stashed part in memory");
                self.slots
                    .insert(ordinal, Slot::Stored(writer.into_inner().freeze()));
                Ok(())
            }
            Err(e) => {
                let e = MimeError::from(e);
                self.slots.insert(ordinal, Slot::Failed(e.clone()));
                Err(e)
            }
        }
    }

    fn stash_bytes(&mut self, ordinal: usize, bytes: Bytes) -> Result<()> {
        self.slots.insert(ordinal, Slot::Stored(bytes));
        Ok(())
    }

    fn unstash(&mut self, ordinal: usize) {
        self.slots.remove(&ordinal);
    }

    fn size(&self, ordinal: usize) -> Option<u64> {
        self.slots
            .get(&ordinal)
            .and_then(Slot::as_stored)
            .map(|b| b.len() as u64)
    }

    fn peek(&self, ordinal: usize) -> bool {
        self.slots.contains_key(&ordinal)
    }

    fn is_byte_array_available(&self, ordinal: usize) -> bool {
        self.size(ordinal).is_some()
    }

    fn recall(&self, ordinal: usize) -> Result<Box<dyn Read + Send + '_>> {
        Ok(Box::new(Cursor::new(self.recall_bytes(ordinal)?)))
    }

    fn recall_bytes(&self, ordinal: usize) -> Result<Bytes> {
        let slot = self.slots.get(&ordinal).ok_or_else(|| not_stashed(ordinal))?;
        slot.stored().cloned()
    }

    fn max_ordinal(&self) -> Option<usize> {
        self.slots.keys().next_back().copied()
    }

    fn close(&mut self) {
        self.slots.clear();
    }
}
