//! Highest commit log offset confirmed by the sink.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// File name inside the commit log directory.
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Persisted confirmation mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Every entry up to and including this offset reached the sink.
    pub offset: u64,
    /// Unix millis of the update.
    pub updated_at: i64,
}

impl Checkpoint {
    /// Marks `offset` as confirmed now.
    #[must_use]
    pub fn new(offset: u64) -> Self {
        Self {
            offset,
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// First offset that still has to be delivered.
    #[must_use]
    pub const fn next(&self) -> u64 {
        self.offset + 1
    }

    fn path(dir: &Path) -> PathBuf {
        dir.join(CHECKPOINT_FILE)
    }

    /// Reads the checkpoint of `dir`, if one was written.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = Self::path(dir);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read(&path)?;
        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|e| Error::CommitLog(format!("unreadable checkpoint {}: {e}", path.display())))
    }

    /// Writes the checkpoint next to a temporary file and renames it into
    /// place, so a crash leaves either the old or the new mark.
    pub fn store(&self, dir: &Path) -> Result<()> {
        let path = Self::path(dir);
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&serde_json::to_vec(self)?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}
