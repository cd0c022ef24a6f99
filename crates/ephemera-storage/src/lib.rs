//! # Ephemera Storage
//!
//! Persistence for the Ephemera story engine.
//!
//! Two contracts are exposed, both synchronous since the engine runs on a
//! single logical thread:
//!
//! - [`LogEventStore`]: durable log of in-flight mutations, replayed once at
//!   startup in append order
//! - [`StoryDatabase`]: byte-level key-value records for story blobs,
//!   active-story snapshots and list pagination state
//!
//! ## Backends
//!
//! - [`FileLogEventStore`]: length-prefixed postcard frames with compaction
//! - [`RedbStoryDatabase`]: one redb table per record kind
//! - [`InMemoryLogEventStore`] / [`InMemoryStoryDatabase`]: tests and simulation
//!
//! ## Example
//!
//! ```rust,ignore
//! use ephemera_storage::{InMemoryLogEventStore, LogEventKind, LogEventStore};
//!
//! let log = InMemoryLogEventStore::new();
//! let id = log.append(LogEventKind::SendStory, payload)?;
//! // ... the send completes
//! log.remove(id)?;
//! ```

pub mod binlog;
pub mod error;
pub mod memory;
pub mod structured;

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use ephemera_core::{OwnerId, StoryFullId, StoryListId};

pub use binlog::{BinlogConfig, CompactionConfig, FileLogEventStore};
pub use error::StorageError;
pub use memory::{InMemoryLogEventStore, InMemoryStoryDatabase};
pub use structured::{RedbStoryDatabase, RedbStoryDatabaseConfig, ScanResults};

/// Kinds of durable mutation records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogEventKind {
    SendStory,
    EditStory,
    DeleteStoryOnServer,
    ReadStoriesOnServer,
    LoadExpiringStories,
}

impl LogEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            LogEventKind::SendStory => "send_story",
            LogEventKind::EditStory => "edit_story",
            LogEventKind::DeleteStoryOnServer => "delete_story_on_server",
            LogEventKind::ReadStoriesOnServer => "read_stories_on_server",
            LogEventKind::LoadExpiringStories => "load_expiring_stories",
        }
    }
}

/// Identifier of a log event, increasing in append order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogEventId(pub u64);

impl fmt::Display for LogEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "log{}", self.0)
    }
}

/// A replayed log event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub id: LogEventId,
    pub kind: LogEventKind,
    pub payload: Bytes,
}

/// Durable log of in-flight mutations
///
/// An event stays in the log until it is removed; `replay_all` returns the
/// live events ordered by id, which is the order they were first appended.
/// Rewriting an event keeps its position.
pub trait LogEventStore: Send + Sync {
    fn append(&self, kind: LogEventKind, payload: Bytes) -> Result<LogEventId, StorageError>;

    fn rewrite(&self, id: LogEventId, kind: LogEventKind, payload: Bytes)
    -> Result<(), StorageError>;

    fn remove(&self, id: LogEventId) -> Result<(), StorageError>;

    fn replay_all(&self) -> Result<Vec<LogEvent>, StorageError>;
}

/// Tables of the story database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordTable {
    Stories,
    ActiveStories,
    StoryLists,
}

impl RecordTable {
    pub const ALL: [RecordTable; 3] = [
        RecordTable::Stories,
        RecordTable::ActiveStories,
        RecordTable::StoryLists,
    ];

    pub fn index(self) -> usize {
        match self {
            RecordTable::Stories => 0,
            RecordTable::ActiveStories => 1,
            RecordTable::StoryLists => 2,
        }
    }
}

/// Composite key of a database record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKey {
    /// Story blob
    Story(StoryFullId),
    /// Active-story snapshot of an owner
    ActiveStories(OwnerId),
    /// Pagination state of a global list
    StoryList(StoryListId),
}

impl RecordKey {
    pub fn table(&self) -> RecordTable {
        match self {
            RecordKey::Story(_) => RecordTable::Stories,
            RecordKey::ActiveStories(_) => RecordTable::ActiveStories,
            RecordKey::StoryList(_) => RecordTable::StoryLists,
        }
    }

    /// Key bytes within the record's table
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            RecordKey::Story(id) => id.to_key_bytes().to_vec(),
            RecordKey::ActiveStories(owner) => owner.to_key_bytes().to_vec(),
            RecordKey::StoryList(list) => vec![list.key_byte()],
        }
    }

    /// Decode key bytes read back from `table`
    pub fn from_bytes(table: RecordTable, bytes: &[u8]) -> Result<Self, StorageError> {
        let key = match table {
            RecordTable::Stories => RecordKey::Story(StoryFullId::from_key_bytes(bytes)?),
            RecordTable::ActiveStories => RecordKey::ActiveStories(OwnerId::from_key_bytes(bytes)?),
            RecordTable::StoryLists => match bytes {
                [byte] => RecordKey::StoryList(StoryListId::from_key_byte(*byte)?),
                _ => {
                    return Err(StorageError::InvalidKey(format!(
                        "story list key {}",
                        hex::encode(bytes)
                    )));
                }
            },
        };
        Ok(key)
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Story(id) => write!(f, "story:{id}"),
            RecordKey::ActiveStories(owner) => write!(f, "active:{owner}"),
            RecordKey::StoryList(list) => write!(f, "list:{list}"),
        }
    }
}

/// Byte-level story database
pub trait StoryDatabase: Send + Sync {
    fn get(&self, key: &RecordKey) -> Result<Option<Vec<u8>>, StorageError>;

    fn put(&self, key: &RecordKey, value: &[u8]) -> Result<(), StorageError>;

    /// Returns whether a record was removed
    fn delete(&self, key: &RecordKey) -> Result<bool, StorageError>;

    /// All records of a table in key order
    fn scan(&self, table: RecordTable) -> Result<ScanResults, StorageError>;
}
