//! redb table definitions and the story database

use std::path::PathBuf;
use std::sync::Arc;

use redb::{Builder, Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use tracing::{debug, info, instrument};

use crate::error::StorageError;
use crate::{RecordKey, RecordTable, StoryDatabase};

/// Type alias for scan results to simplify complex type
pub type ScanResults = Vec<(Vec<u8>, Vec<u8>)>;

// Key: (owner, story_id) big-endian, Value: serialized Story
pub const STORIES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("stories");

// Key: owner big-endian, Value: serialized active-story snapshot
pub const ACTIVE_STORIES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("active_stories");

// Key: list byte, Value: serialized list pagination state
pub const STORY_LISTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("story_lists");

fn table_def(table: RecordTable) -> TableDefinition<'static, &'static [u8], &'static [u8]> {
    match table {
        RecordTable::Stories => STORIES,
        RecordTable::ActiveStories => ACTIVE_STORIES,
        RecordTable::StoryLists => STORY_LISTS,
    }
}

fn db_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Database(e.to_string())
}

/// Configuration for the redb story database
#[derive(Debug, Clone)]
pub struct RedbStoryDatabaseConfig {
    /// Path to the database file
    pub db_path: PathBuf,
    /// Cache size in bytes
    pub cache_size: usize,
}

impl Default for RedbStoryDatabaseConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/stories.redb"),
            cache_size: 16 * 1024 * 1024, // 16MB
        }
    }
}

/// Story database backed by redb
pub struct RedbStoryDatabase {
    db: Arc<Database>,
    config: RedbStoryDatabaseConfig,
}

impl RedbStoryDatabase {
    /// Open or create the database
    #[instrument(skip(config), fields(path = %config.db_path.display()))]
    pub fn open(config: RedbStoryDatabaseConfig) -> Result<Self, StorageError> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Builder::new()
            .set_cache_size(config.cache_size)
            .create(&config.db_path)
            .map_err(db_err)?;

        info!("Opened story database");

        let storage = Self {
            db: Arc::new(db),
            config,
        };
        storage.init_tables()?;
        Ok(storage)
    }

    fn init_tables(&self) -> Result<(), StorageError> {
        let write_txn = self.db.begin_write().map_err(db_err)?;
        for table in RecordTable::ALL {
            write_txn.open_table(table_def(table)).map_err(db_err)?;
        }
        write_txn.commit().map_err(db_err)?;

        debug!("Initialized story tables");
        Ok(())
    }

    pub fn config(&self) -> &RedbStoryDatabaseConfig {
        &self.config
    }

    /// Number of records in a table
    pub fn count(&self, table: RecordTable) -> Result<u64, StorageError> {
        let read_txn = self.db.begin_read().map_err(db_err)?;
        let table = read_txn.open_table(table_def(table)).map_err(db_err)?;
        table.len().map_err(db_err)
    }
}

impl StoryDatabase for RedbStoryDatabase {
    fn get(&self, key: &RecordKey) -> Result<Option<Vec<u8>>, StorageError> {
        let read_txn = self.db.begin_read().map_err(db_err)?;
        let table = read_txn.open_table(table_def(key.table())).map_err(db_err)?;
        let value = table
            .get(key.to_bytes().as_slice())
            .map_err(db_err)?
            .map(|v| v.value().to_vec());
        Ok(value)
    }

    fn put(&self, key: &RecordKey, value: &[u8]) -> Result<(), StorageError> {
        let write_txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = write_txn.open_table(table_def(key.table())).map_err(db_err)?;
            table
                .insert(key.to_bytes().as_slice(), value)
                .map_err(db_err)?;
        }
        write_txn.commit().map_err(db_err)?;
        Ok(())
    }

    fn delete(&self, key: &RecordKey) -> Result<bool, StorageError> {
        let write_txn = self.db.begin_write().map_err(db_err)?;
        let removed = {
            let mut table = write_txn.open_table(table_def(key.table())).map_err(db_err)?;
            table
                .remove(key.to_bytes().as_slice())
                .map_err(db_err)?
                .is_some()
        };
        write_txn.commit().map_err(db_err)?;
        Ok(removed)
    }

    fn scan(&self, table: RecordTable) -> Result<ScanResults, StorageError> {
        let read_txn = self.db.begin_read().map_err(db_err)?;
        let table = read_txn.open_table(table_def(table)).map_err(db_err)?;

        let mut results = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            let (key, value) = entry.map_err(db_err)?;
            results.push((key.value().to_vec(), value.value().to_vec()));
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ephemera_core::{OwnerId, StoryFullId, StoryId, StoryListId};
    use tempfile::TempDir;

    fn create_test_db() -> (RedbStoryDatabase, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = RedbStoryDatabaseConfig {
            db_path: temp_dir.path().join("test.redb"),
            ..Default::default()
        };
        (RedbStoryDatabase::open(config).unwrap(), temp_dir)
    }

    #[test]
    fn test_put_get_delete() {
        let (db, _temp) = create_test_db();
        let key = RecordKey::Story(StoryFullId::new(OwnerId(1), StoryId(2)));

        db.put(&key, b"blob").unwrap();
        assert_eq!(db.get(&key).unwrap(), Some(b"blob".to_vec()));

        assert!(db.delete(&key).unwrap());
        assert!(!db.delete(&key).unwrap());
        assert_eq!(db.get(&key).unwrap(), None);
    }

    #[test]
    fn test_tables_are_separate() {
        let (db, _temp) = create_test_db();
        db.put(&RecordKey::ActiveStories(OwnerId(7)), b"snapshot")
            .unwrap();
        db.put(&RecordKey::StoryList(StoryListId::Main), b"state")
            .unwrap();

        assert_eq!(db.count(RecordTable::Stories).unwrap(), 0);
        assert_eq!(db.count(RecordTable::ActiveStories).unwrap(), 1);
        assert_eq!(db.scan(RecordTable::StoryLists).unwrap().len(), 1);
    }

    #[test]
    fn test_scan_in_key_order() {
        let (db, _temp) = create_test_db();
        for id in [3, 1, 2] {
            let key = RecordKey::Story(StoryFullId::new(OwnerId(5), StoryId(id)));
            db.put(&key, &[id as u8]).unwrap();
        }
        let values: Vec<u8> = db
            .scan(RecordTable::Stories)
            .unwrap()
            .into_iter()
            .map(|(_, v)| v[0])
            .collect();
        assert_eq!(values, vec![1, 2, 3]);
    }
}
