//! Binlog compaction
//!
//! Removed and rewritten events leave dead frames behind. Once enough of the
//! file is dead, the live events are written to a sibling file which then
//! replaces the log.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Configuration for binlog compaction
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Minimum number of dead frames before compaction
    pub min_dead_records: usize,
    /// Minimum fraction of dead frames before compaction
    pub dead_ratio: f64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            min_dead_records: 512,
            dead_ratio: 0.5,
        }
    }
}

impl CompactionConfig {
    /// Never compact automatically
    pub fn disabled() -> Self {
        Self {
            min_dead_records: usize::MAX,
            dead_ratio: 1.0,
        }
    }

    pub fn should_compact(&self, records: usize, live: usize) -> bool {
        let dead = records.saturating_sub(live);
        if records == 0 || dead < self.min_dead_records {
            return false;
        }
        dead as f64 / records as f64 >= self.dead_ratio
    }
}

/// Result of a compaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionResult {
    pub records_before: usize,
    pub records_after: usize,
    pub bytes_freed: u64,
}

/// Write `frames` to a temporary sibling and swap it in
///
/// Returns the reopened log positioned at its end, and its size.
pub(super) fn rewrite_file(path: &Path, frames: &[Vec<u8>]) -> Result<(File, u64), StorageError> {
    let tmp_path = path.with_extension("compact");
    let mut size = 0u64;
    {
        let mut tmp = File::create(&tmp_path)?;
        for frame in frames {
            tmp.write_all(frame)?;
            size += frame.len() as u64;
        }
        tmp.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;

    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    file.seek(SeekFrom::End(0))?;
    Ok((file, size))
}
