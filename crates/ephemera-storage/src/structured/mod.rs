//! Structured storage using redb
//!
//! One table per record kind:
//! - Story blobs keyed by `(owner, story_id)`
//! - Active-story snapshots keyed by owner
//! - List pagination state keyed by list

mod tables;

pub use tables::{
    ACTIVE_STORIES, RedbStoryDatabase, RedbStoryDatabaseConfig, STORIES, STORY_LISTS, ScanResults,
};
