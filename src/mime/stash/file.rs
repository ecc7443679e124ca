//! File-backed stash: one file per ordinal.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{debug, warn};

use super::{not_stashed, Slot, StashManager};
use crate::error::{MimeError, MimeResult as Result};

#[derive(Debug)]
struct StashedFile {
    path: PathBuf,
    size: u64,
}

/// Stash writing each body to `{dir}/{prefix}-{ordinal}.part`.
///
/// The directory must already exist. The prefix must be unique among
/// stashes sharing the directory. Files are removed on `unstash`, `close`
/// and drop.
#[derive(Debug)]
pub struct FileStash {
    dir: PathBuf,
    prefix: String,
    slots: BTreeMap<usize, Slot<StashedFile>>,
}

impl FileStash {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(MimeError::io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("stash directory does not exist: {}", dir.display()),
            )));
        }
        Ok(Self {
            dir,
            prefix: prefix.into(),
            slots: BTreeMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, ordinal: usize) -> PathBuf {
        self.dir.join(format!("{}-{}.part", self.prefix, ordinal))
    }

    fn write_file(path: &Path, source: &mut dyn Read) -> io::Result<u64> {
        let mut out = BufWriter::new(File::create(path)?);
        let size = io::copy(source, &mut out)?;
        out.flush()?;
        Ok(size)
    }
}

impl StashManager for FileStash {
    fn stash(&mut self, ordinal: usize, source: &mut dyn Read) -> Result<()> {
        self.unstash(ordinal);
        let path = self.path_for(ordinal);
        match Self::write_file(&path, source) {
            Ok(size) => {
                debug!(ordinal, size, path = %path.display(), "Stashed part to file");
                self.slots.insert(ordinal, Slot::Stored(StashedFile { path, size }));
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(&path);
                let e = MimeError::from(e);
                self.slots.insert(ordinal, Slot::Failed(e.clone()));
                Err(e)
            }
        }
    }

    fn stash_bytes(&mut self, ordinal: usize, bytes: Bytes) -> Result<()> {
        self.stash(ordinal, &mut &bytes[..])
    }

    fn unstash(&mut self, ordinal: usize) {
        if let Some(Slot::Stored(file)) = self.slots.remove(&ordinal) {
            if let Err(e) = fs::remove_file(&file.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %file.path.display(), error = %e, "Failed to delete stash file");
                }
            }
        }
    }

    fn size(&self, ordinal: usize) -> Option<u64> {
        self.slots
            .get(&ordinal)
            .and_then(Slot::as_stored)
            .map(|f| f.size)
    }

    fn peek(&self, ordinal: usize) -> bool {
        self.slots.contains_key(&ordinal)
    }

    fn is_byte_array_available(&self, _ordinal: usize) -> bool {
        false
    }

    fn recall(&self, ordinal: usize) -> Result<Box<dyn Read + Send + '_>> {
        let slot = self.slots.get(&ordinal).ok_or_else(|| not_stashed(ordinal))?;
        let file = slot.stored()?;
        let handle = File::open(&file.path).map_err(MimeError::from)?;
        Ok(Box::new(BufReader::new(handle)))
    }

    fn recall_bytes(&self, ordinal: usize) -> Result<Bytes> {
        let slot = self.slots.get(&ordinal).ok_or_else(|| not_stashed(ordinal))?;
        let file = slot.stored()?;
        Ok(Bytes::from(fs::read(&file.path).map_err(MimeError::from)?))
    }

    fn max_ordinal(&self) -> Option<usize> {
        self.slots.keys().next_back().copied()
    }

    fn close(&mut self) {
        let ordinals: Vec<usize> = self.slots.keys().copied().collect();
        for ordinal in ordinals {
            self.unstash(ordinal);
        }
    }
}

impl Drop for FileStash {
    fn drop(&mut self) {
        self.close();
    }
}
