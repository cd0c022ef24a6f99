//! In-memory storage implementations
//!
//! Suitable for tests and simulation. A single instance can be handed to two
//! successive engines to model a process restart.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use tracing::trace;

use crate::error::StorageError;
use crate::structured::ScanResults;
use crate::{LogEvent, LogEventId, LogEventKind, LogEventStore, RecordKey, RecordTable, StoryDatabase};

/// In-memory mutation log
#[derive(Debug)]
pub struct InMemoryLogEventStore {
    events: Mutex<BTreeMap<LogEventId, LogEvent>>,
    next_id: AtomicU64,
}

impl Default for InMemoryLogEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLogEventStore {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live events of one kind
    pub fn events_of(&self, kind: LogEventKind) -> Vec<LogEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|event| event.kind == kind)
            .cloned()
            .collect()
    }
}

impl LogEventStore for InMemoryLogEventStore {
    fn append(&self, kind: LogEventKind, payload: Bytes) -> Result<LogEventId, StorageError> {
        let id = LogEventId(self.next_id.fetch_add(1, Ordering::SeqCst));
        trace!(id = %id, kind = kind.name(), "Appending log event");
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, LogEvent { id, kind, payload });
        Ok(id)
    }

    fn rewrite(
        &self,
        id: LogEventId,
        kind: LogEventKind,
        payload: Bytes,
    ) -> Result<(), StorageError> {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        match events.get_mut(&id) {
            Some(event) => {
                event.kind = kind;
                event.payload = payload;
                Ok(())
            }
            None => Err(StorageError::not_found(id.to_string())),
        }
    }

    fn remove(&self, id: LogEventId) -> Result<(), StorageError> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        Ok(())
    }

    fn replay_all(&self) -> Result<Vec<LogEvent>, StorageError> {
        Ok(self
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect())
    }
}

/// In-memory story database
///
/// One `DashMap` per table; scans sort by key to match the on-disk backend.
#[derive(Debug)]
pub struct InMemoryStoryDatabase {
    tables: [DashMap<Vec<u8>, Vec<u8>>; 3],
}

impl Default for InMemoryStoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStoryDatabase {
    pub fn new() -> Self {
        Self {
            tables: [DashMap::new(), DashMap::new(), DashMap::new()],
        }
    }

    fn table(&self, table: RecordTable) -> &DashMap<Vec<u8>, Vec<u8>> {
        &self.tables[table.index()]
    }

    pub fn count(&self, table: RecordTable) -> usize {
        self.table(table).len()
    }

    /// Store raw bytes, bypassing any encoding; used to plant corrupt records
    pub fn put_raw(&self, key: &RecordKey, value: Vec<u8>) {
        self.table(key.table()).insert(key.to_bytes(), value);
    }
}

impl StoryDatabase for InMemoryStoryDatabase {
    fn get(&self, key: &RecordKey) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .table(key.table())
            .get(&key.to_bytes())
            .map(|entry| entry.value().clone()))
    }

    fn put(&self, key: &RecordKey, value: &[u8]) -> Result<(), StorageError> {
        self.table(key.table()).insert(key.to_bytes(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &RecordKey) -> Result<bool, StorageError> {
        Ok(self.table(key.table()).remove(&key.to_bytes()).is_some())
    }

    fn scan(&self, table: RecordTable) -> Result<ScanResults, StorageError> {
        let mut results: ScanResults = self
            .table(table)
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        results.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ephemera_core::{OwnerId, StoryListId};

    #[test]
    fn test_log_replays_in_append_order() {
        let log = InMemoryLogEventStore::new();
        let a = log.append(LogEventKind::SendStory, Bytes::from_static(b"a")).unwrap();
        let b = log
            .append(LogEventKind::ReadStoriesOnServer, Bytes::from_static(b"b"))
            .unwrap();
        let c = log.append(LogEventKind::SendStory, Bytes::from_static(b"c")).unwrap();
        log.remove(b).unwrap();

        let ids: Vec<_> = log.replay_all().unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![a, c]);
        assert_eq!(log.events_of(LogEventKind::SendStory).len(), 2);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let log = InMemoryLogEventStore::new();
        let id = log.append(LogEventKind::EditStory, Bytes::new()).unwrap();
        log.remove(id).unwrap();
        log.remove(id).unwrap();
        assert!(log.is_empty());
    }

    #[test]
    fn test_database_tables() {
        let db = InMemoryStoryDatabase::new();
        db.put(&RecordKey::ActiveStories(OwnerId(2)), b"b").unwrap();
        db.put(&RecordKey::ActiveStories(OwnerId(1)), b"a").unwrap();
        db.put(&RecordKey::StoryList(StoryListId::Main), b"l").unwrap();

        let scanned = db.scan(RecordTable::ActiveStories).unwrap();
        assert_eq!(scanned.len(), 2);
        assert_eq!(scanned[0].1, b"a".to_vec());
        assert_eq!(db.count(RecordTable::StoryLists), 1);
        assert!(db.delete(&RecordKey::StoryList(StoryListId::Main)).unwrap());
        assert_eq!(db.get(&RecordKey::StoryList(StoryListId::Main)).unwrap(), None);
    }
}
