//! # Ephemera Stories
//!
//! Client-side state engine for ephemeral stories: short-lived media posts
//! that expire after a fixed period.
//!
//! The engine keeps a cache of stories, sends and edits the local user's own
//! stories in submission order, orders owners with active stories into two
//! global lists, runs expiry and polling timers, and survives restarts by
//! replaying a durable mutation log.
//!
//! ## Components
//!
//! - [`cache`]: The story cache and server merge rules
//! - [`upload`]: Send and edit sequencing
//! - [`active`]: Per-owner active stories and the global lists
//! - [`scheduler`]: Timeout wheels for expiry, reloads and polling
//! - [`log_event`]: Durable mutation records
//! - [`manager`]: The [`StoryManager`] tying everything together
//! - [`service`]: Async driver running a manager on a tokio task
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ephemera_core::{BroadcastSink, SystemClock};
//! use ephemera_storage::{InMemoryLogEventStore, InMemoryStoryDatabase};
//! use ephemera_stories::{StoryConfig, StoryManager, StoryService};
//!
//! let manager = StoryManager::new(
//!     StoryConfig::for_owner(me),
//!     Arc::new(SystemClock),
//!     Arc::new(InMemoryLogEventStore::new()),
//!     Arc::new(InMemoryStoryDatabase::new()),
//!     sink,
//!     resolver,
//! )?;
//! let (_task, stories) = StoryService::spawn(manager, remote, files);
//! let id = stories.send_story(me, new_story).await?;
//! ```
//!
//! ## Driving the manager directly
//!
//! [`StoryManager`] performs no I/O. Work it wants done is drained with
//! [`StoryManager::take_outbound`], and results are fed back with
//! [`StoryManager::handle_inbound`]. Timers fire on [`StoryManager::tick`].
//! This is how the tests drive it deterministically.

pub mod active;
pub mod cache;
pub mod config;
pub mod error;
pub mod log_event;
pub mod manager;
pub mod outbound;
pub mod promise;
pub mod scheduler;
pub mod service;
pub mod upload;

// Re-export main types
pub use active::{
    ActiveSource, ActiveStories, ActiveStoriesView, ActiveStoryIndex, OrderKey, StoryList,
};
pub use cache::{MergeKind, MergeOutcome, StoryCache};
pub use config::{CacheConfig, ConfigWarning, ListConfig, PollingConfig, StoryConfig, UploadConfig};
pub use error::{StoryError, StoryResult};
pub use manager::{CachedStoryViewers, FoundStories, NewStory, PendingStoryViews, StoryManager};
pub use outbound::{Inbound, Outbound, QueryId, UploadId};
pub use promise::{Deferred, Promise};
pub use scheduler::{MultiTimeout, Scheduler, TimerEvent};
pub use service::{StoryHandle, StoryService};
pub use upload::{PendingKind, PendingStory, UploadPipeline};
