//! Memory-first stash that spills to disk past a size limit.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::PathBuf;

use bytes::Bytes;
use tracing::info;

use super::{FileStash, MemoryStash, StashManager};
use crate::error::MimeResult as Result;

/// Keeps bodies in memory until their combined size would pass `limit`.
///
/// The stash that crosses the limit, and every stash after it, goes to a
/// [`FileStash`] created on first need. Bytes already buffered for the
/// crossing stash are written ahead of the rest of its source. Once spilled,
/// the stash never returns to memory mode.
pub struct HybridStash {
    limit: u64,
    total: u64,
    sizes: HashMap<usize, u64>,
    memory: MemoryStash,
    file: Option<FileStash>,
    dir: PathBuf,
    prefix: String,
}

impl HybridStash {
    pub fn new(limit: u64, dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            limit,
            total: 0,
            sizes: HashMap::new(),
            memory: MemoryStash::new(),
            file: None,
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    /// True once bodies are going to disk.
    pub fn is_spilled(&self) -> bool {
        self.file.is_some()
    }

    /// Bytes currently stashed across both backends.
    pub fn total_size(&self) -> u64 {
        self.total
    }

    fn file_stash(&mut self) -> Result<&mut FileStash> {
        let file = match self.file.take() {
            Some(file) => file,
            None => {
                info!(
                    limit = self.limit,
                    dir = %self.dir.display(),
                    "Stash size limit exceeded, spilling parts to disk"
                );
                FileStash::new(&self.dir, self.prefix.as_str())?
            }
        };
        Ok(self.file.insert(file))
    }

    fn spill(&mut self, ordinal: usize, source: &mut dyn Read) -> Result<()> {
        let file = match self.file_stash() {
            Ok(file) => file,
            Err(e) => {
                // Replayed by recall until the ordinal is stashed again.
                self.memory.fail(ordinal, e.clone());
                return Err(e);
            }
        };
        file.stash(ordinal, source)?;
        self.record(ordinal);
        Ok(())
    }

    fn record(&mut self, ordinal: usize) {
        if let Some(size) = self.size(ordinal) {
            self.sizes.insert(ordinal, size);
            self.total += size;
        }
    }

    fn backend(&self, ordinal: usize) -> Option<&dyn StashManager> {
        if self.memory.peek(ordinal) {
            return Some(&self.memory);
        }
        match &self.file {
            Some(file) if file.peek(ordinal) => Some(file),
            _ => None,
        }
    }
}

impl StashManager for HybridStash {
    fn stash(&mut self, ordinal: usize, source: &mut dyn Read) -> Result<()> {
        self.unstash(ordinal);
        if self.is_spilled() {
            return self.spill(ordinal, source);
        }

        let remaining = self.limit.saturating_sub(self.total);
        let mut head = (&mut *source).take(remaining.saturating_add(1));
        self.memory.stash(ordinal, &mut head)?;
        let buffered = self.memory.size(ordinal).unwrap_or(0);
        if buffered <= remaining {
            self.record(ordinal);
            return Ok(());
        }

        let head = self.memory.recall_bytes(ordinal)?;
        self.memory.unstash(ordinal);
        let mut spliced = Cursor::new(head).chain(source);
        self.spill(ordinal, &mut spliced)
    }

    fn stash_bytes(&mut self, ordinal: usize, bytes: Bytes) -> Result<()> {
        self.unstash(ordinal);
        if !self.is_spilled() && self.total + bytes.len() as u64 <= self.limit {
            self.memory.stash_bytes(ordinal, bytes)?;
            self.record(ordinal);
            return Ok(());
        }
        self.spill(ordinal, &mut &bytes[..])
    }

    fn unstash(&mut self, ordinal: usize) {
        if let Some(size) = self.sizes.remove(&ordinal) {
            self.total = self.total.saturating_sub(size);
        }
        self.memory.unstash(ordinal);
        if let Some(file) = self.file.as_mut() {
            file.unstash(ordinal);
        }
    }

    fn size(&self, ordinal: usize) -> Option<u64> {
        self.backend(ordinal)?.size(ordinal)
    }

    fn peek(&self, ordinal: usize) -> bool {
        self.backend(ordinal).is_some()
    }

    fn is_byte_array_available(&self, ordinal: usize) -> bool {
        self.memory.is_byte_array_available(ordinal)
    }

    fn recall(&self, ordinal: usize) -> Result<Box<dyn Read + Send + '_>> {
        match self.backend(ordinal) {
            Some(backend) => backend.recall(ordinal),
            None => self.memory.recall(ordinal),
        }
    }

    fn recall_bytes(&self, ordinal: usize) -> Result<Bytes> {
        match self.backend(ordinal) {
            Some(backend) => backend.recall_bytes(ordinal),
            None => self.memory.recall_bytes(ordinal),
        }
    }

    fn max_ordinal(&self) -> Option<usize> {
        let file_max = self.file.as_ref().and_then(FileStash::max_ordinal);
        self.memory.max_ordinal().max(file_max)
    }

    fn close(&mut self) {
        self.memory.close();
        if let Some(file) = self.file.as_mut() {
            file.close();
        }
        self.sizes.clear();
        self.total = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn file_count(dir: &Path) -> usize {
        fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_stays_in_memory_up_to_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut stash = HybridStash::new(10, dir.path(), "h");
        stash.stash(0, &mut &b"12345"[..]).unwrap();
        stash.stash(1, &mut &b"67890"[..]).unwrap();
        assert!(!stash.is_spilled());
        assert_eq!(stash.total_size(), 10);
        assert_eq!(file_count(dir.path()), 0);
        assert!(stash.is_byte_array_available(1));
    }

    #[test]
    fn test_crossing_the_limit_spills_permanently() {
        let dir = tempfile::tempdir().unwrap();
        let mut stash = HybridStash::new(8, dir.path(), "h");
        stash.stash(0, &mut &b"1234"[..]).unwrap();
        stash.stash(1, &mut &b"abcdefgh"[..]).unwrap();
        assert!(stash.is_spilled());
        assert_eq!(file_count(dir.path()), 1);
        // No bytes lost while splicing the buffered head back in front.
        assert_eq!(&stash.recall_bytes(1).unwrap()[..], b"abcdefgh");
        assert_eq!(stash.size(1), Some(8));

        // Even a tiny part now goes to disk.
        stash.unstash(1);
        assert_eq!(stash.total_size(), 4);
        stash.stash(2, &mut &b"z"[..]).unwrap();
        assert!(!stash.is_byte_array_available(2));
        assert_eq!(file_count(dir.path()), 1);
        assert_eq!(&stash.recall_bytes(0).unwrap()[..], b"1234");
    }

    #[test]
    fn test_stash_bytes_respects_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut stash = HybridStash::new(4, dir.path(), "h");
        stash.stash_bytes(0, Bytes::from_static(b"abcd")).unwrap();
        assert!(!stash.is_spilled());
        stash.stash_bytes(1, Bytes::from_static(b"e")).unwrap();
        assert!(stash.is_spilled());
        assert_eq!(stash.max_ordinal(), Some(1));
    }

    #[test]
    fn test_failed_spill_is_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone");
        let mut stash = HybridStash::new(2, &missing, "h");
        stash.stash(0, &mut &b"ab"[..]).unwrap();

        let err = stash.stash(1, &mut &b"too long"[..]).unwrap_err().to_string();
        assert!(stash.peek(1));
        assert_eq!(stash.size(1), None);
        assert_eq!(stash.recall_bytes(1).unwrap_err().to_string(), err);
        assert_eq!(stash.recall_bytes(1).unwrap_err().to_string(), err);
        assert!(err.contains("does not exist"), "{err}");
        assert_eq!(&stash.recall_bytes(0).unwrap()[..], b"ab");

        fs::create_dir(&missing).unwrap();
        stash.stash(1, &mut &b"too long"[..]).unwrap();
        assert_eq!(&stash.recall_bytes(1).unwrap()[..], b"too long");
    }

    #[test]
    fn test_close_removes_spilled_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut stash = HybridStash::new(0, dir.path(), "h");
        stash.stash(0, &mut &b"spill"[..]).unwrap();
        assert_eq!(file_count(dir.path()), 1);
        stash.close();
        assert_eq!(file_count(dir.path()), 0);
        assert_eq!(stash.total_size(), 0);
    }
}
