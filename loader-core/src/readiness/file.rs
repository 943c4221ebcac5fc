//! File-backed handshake slot.
//!
//! Stands in for the named memory segment where the platform has none: a
//! 4-byte file named after the segment in the temporary directory.

use super::{segment_name, SlotStorage, SLOT_SIZE};
use crate::error::ReadinessError;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Handshake slot stored in a small file.
///
/// The creating side removes the file when dropped.
pub struct FileSlot {
    path: PathBuf,
    file: Mutex<File>,
    owner: bool,
}

impl FileSlot {
    /// Create (or reuse) the slot for `pid` inside `dir`.
    pub fn create_in(dir: &Path, pid: u32) -> Result<Self, ReadinessError> {
        let path = dir.join(segment_name(pid));
        let name = segment_name(pid);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| ReadinessError::SegmentCreateFailed {
                name: name.clone(),
                source,
            })?;

        file.set_len(SLOT_SIZE as u64)
            .map_err(|source| ReadinessError::SegmentCreateFailed { name, source })?;

        log::debug!("Created handshake file {}", path.display());

        Ok(Self {
            path,
            file: Mutex::new(file),
            owner: true,
        })
    }

    /// Open the slot for `pid` inside `dir` without creating it.
    pub fn open_in(dir: &Path, pid: u32) -> Result<Self, ReadinessError> {
        let path = dir.join(segment_name(pid));

        let file = OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(|source| ReadinessError::SegmentOpenFailed { pid, source })?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            owner: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SlotStorage for FileSlot {
    fn create(pid: u32) -> Result<Self, ReadinessError> {
        Self::create_in(&std::env::temp_dir(), pid)
    }

    fn open(pid: u32) -> Result<Self, ReadinessError> {
        Self::open_in(&std::env::temp_dir(), pid)
    }

    fn store(&self, value: i32) -> Result<(), ReadinessError> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&value.to_le_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    fn load(&self) -> Result<i32, ReadinessError> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let mut bytes = [0u8; SLOT_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut bytes)?;
        Ok(i32::from_le_bytes(bytes))
    }
}

impl Drop for FileSlot {
    fn drop(&mut self) {
        if !self.owner {
            return;
        }

        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!(
                "Failed to remove handshake file {}: {}",
                self.path.display(),
                e
            );
        }
    }
}
