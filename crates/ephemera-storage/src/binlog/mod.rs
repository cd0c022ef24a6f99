//! File-backed mutation log
//!
//! Each record is a frame of `[4-byte BE length][postcard BinlogRecord]`.
//! Appending an event writes an `Event` frame, rewriting writes another
//! `Event` frame with the same id, and removing writes an `Erase` frame. The
//! live set is rebuilt at open time by replaying the file front to back.
//!
//! Recovery is best-effort: a frame that fails to decode is skipped, and a
//! torn tail left by a crash mid-write is cut off so later appends land on a
//! clean boundary.

mod compaction;

pub use compaction::{CompactionConfig, CompactionResult};

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::StorageError;
use crate::{LogEvent, LogEventId, LogEventKind, LogEventStore};

/// Largest frame accepted on replay
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Configuration for the binlog
#[derive(Debug, Clone)]
pub struct BinlogConfig {
    /// Path of the log file
    pub path: PathBuf,
    /// Whether to fsync after every record
    pub sync_on_write: bool,
    pub compaction: CompactionConfig,
}

impl Default for BinlogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/stories.binlog"),
            sync_on_write: true,
            compaction: CompactionConfig::default(),
        }
    }
}

impl BinlogConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum BinlogRecord {
    Event(LogEvent),
    Erase(LogEventId),
}

/// Outcome of scanning a binlog image
#[derive(Debug, Default)]
struct Replayed {
    live: BTreeMap<LogEventId, LogEvent>,
    next_id: u64,
    records: usize,
    corrupt: usize,
    /// Length of the prefix made of complete frames
    valid_len: u64,
}

fn encode_frame(record: &BinlogRecord) -> Result<Vec<u8>, StorageError> {
    let body =
        postcard::to_allocvec(record).map_err(|e| StorageError::serialization(e.to_string()))?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn replay_frames(data: &[u8]) -> Replayed {
    let mut replayed = Replayed {
        next_id: 1,
        ..Default::default()
    };
    let mut offset = 0usize;

    while offset < data.len() {
        let Some(len_buf) = data.get(offset..offset + 4) else {
            warn!(offset = offset, "Truncated frame header, stopping replay");
            break;
        };
        let frame_len = u32::from_be_bytes([len_buf[0], len_buf[1], len_buf[2], len_buf[3]]) as usize;
        if frame_len == 0 || frame_len > MAX_FRAME_LEN {
            warn!(offset = offset, len = frame_len, "Invalid frame length, stopping replay");
            break;
        }
        let Some(body) = data.get(offset + 4..offset + 4 + frame_len) else {
            warn!(offset = offset, len = frame_len, "Truncated frame, stopping replay");
            break;
        };

        replayed.records += 1;
        match postcard::from_bytes::<BinlogRecord>(body) {
            Ok(BinlogRecord::Event(event)) => {
                replayed.next_id = replayed.next_id.max(event.id.0 + 1);
                replayed.live.insert(event.id, event);
            }
            Ok(BinlogRecord::Erase(id)) => {
                replayed.next_id = replayed.next_id.max(id.0 + 1);
                replayed.live.remove(&id);
            }
            Err(e) => {
                warn!(offset = offset, error = %e, "Skipping corrupt binlog frame");
                replayed.corrupt += 1;
            }
        }

        offset += 4 + frame_len;
        replayed.valid_len = offset as u64;
    }

    replayed
}

struct BinlogState {
    file: File,
    live: BTreeMap<LogEventId, LogEvent>,
    next_id: u64,
    /// Frames currently in the file
    records: usize,
    size: u64,
}

/// Mutation log persisted to a single file
pub struct FileLogEventStore {
    config: BinlogConfig,
    state: Mutex<BinlogState>,
}

impl FileLogEventStore {
    /// Open or create the log and replay it
    #[instrument(skip(config), fields(path = %config.path.display()))]
    pub fn open(config: BinlogConfig) -> Result<Self, StorageError> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&config.path)?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        let replayed = replay_frames(&data);

        if replayed.valid_len < data.len() as u64 {
            warn!(
                valid = replayed.valid_len,
                size = data.len(),
                "Cutting torn binlog tail"
            );
            file.set_len(replayed.valid_len)?;
        }
        file.seek(SeekFrom::End(0))?;

        info!(
            live = replayed.live.len(),
            records = replayed.records,
            corrupt = replayed.corrupt,
            "Replayed binlog"
        );

        Ok(Self {
            config,
            state: Mutex::new(BinlogState {
                file,
                live: replayed.live,
                next_id: replayed.next_id,
                records: replayed.records,
                size: replayed.valid_len,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, BinlogState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_record(&self, state: &mut BinlogState, record: &BinlogRecord) -> Result<(), StorageError> {
        let frame = encode_frame(record)?;
        state.file.write_all(&frame)?;
        if self.config.sync_on_write {
            state.file.sync_data()?;
        }
        state.size += frame.len() as u64;
        state.records += 1;
        Ok(())
    }

    /// Number of live events
    pub fn len(&self) -> usize {
        self.state().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current file size in bytes
    pub fn size(&self) -> u64 {
        self.state().size
    }

    /// Rewrite the file with only the live events
    pub fn compact(&self) -> Result<CompactionResult, StorageError> {
        let mut state = self.state();
        self.compact_locked(&mut state)
    }

    fn compact_locked(&self, state: &mut BinlogState) -> Result<CompactionResult, StorageError> {
        let frames = state
            .live
            .values()
            .map(|event| encode_frame(&BinlogRecord::Event(event.clone())))
            .collect::<Result<Vec<_>, _>>()?;
        let (file, size) = compaction::rewrite_file(&self.config.path, &frames)?;

        let result = CompactionResult {
            records_before: state.records,
            records_after: frames.len(),
            bytes_freed: state.size.saturating_sub(size),
        };
        state.file = file;
        state.size = size;
        state.records = frames.len();

        debug!(
            before = result.records_before,
            after = result.records_after,
            freed = result.bytes_freed,
            "Compacted binlog"
        );
        Ok(result)
    }
}

impl LogEventStore for FileLogEventStore {
    fn append(&self, kind: LogEventKind, payload: Bytes) -> Result<LogEventId, StorageError> {
        let mut state = self.state();
        let id = LogEventId(state.next_id);
        let event = LogEvent { id, kind, payload };
        self.write_record(&mut state, &BinlogRecord::Event(event.clone()))?;
        state.next_id += 1;
        state.live.insert(id, event);
        debug!(id = %id, kind = kind.name(), "Appended log event");
        Ok(id)
    }

    fn rewrite(
        &self,
        id: LogEventId,
        kind: LogEventKind,
        payload: Bytes,
    ) -> Result<(), StorageError> {
        let mut state = self.state();
        if !state.live.contains_key(&id) {
            return Err(StorageError::not_found(id.to_string()));
        }
        let event = LogEvent { id, kind, payload };
        self.write_record(&mut state, &BinlogRecord::Event(event.clone()))?;
        state.live.insert(id, event);
        Ok(())
    }

    fn remove(&self, id: LogEventId) -> Result<(), StorageError> {
        let mut state = self.state();
        if !state.live.contains_key(&id) {
            debug!(id = %id, "Log event already removed");
            return Ok(());
        }
        self.write_record(&mut state, &BinlogRecord::Erase(id))?;
        state.live.remove(&id);

        if self
            .config
            .compaction
            .should_compact(state.records, state.live.len())
        {
            self.compact_locked(&mut state)?;
        }
        Ok(())
    }

    fn replay_all(&self) -> Result<Vec<LogEvent>, StorageError> {
        Ok(self.state().live.values().cloned().collect())
    }
}
