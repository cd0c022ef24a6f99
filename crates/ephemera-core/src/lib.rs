//! # Ephemera Core
//!
//! Core types, collaborator traits and errors for the Ephemera story engine.
//!
//! The engine itself lives in `ephemera-stories`; this crate carries what
//! every layer needs to agree on, so that storage backends, drivers and test
//! harnesses can be written without depending on the engine.
//!
//! ## Key Traits
//!
//! - [`RemoteService`]: Issues story requests to the server
//! - [`FileTransfer`]: Uploads story media
//! - [`NotificationSink`]: Receives [`StoryUpdate`]s
//! - [`DependencyResolver`]: Loads users and conversations referenced by updates
//! - [`Clock`]: Time abstraction for testability
//!
//! ## Key Types
//!
//! - [`StoryFullId`]: Owner plus story id
//! - [`Story`]: The cached story entity
//! - [`RemoteStoryItem`]: Full, skipped or deleted story from the server

pub mod error;
pub mod identity;
pub mod story;
pub mod remote;
pub mod transfer;
pub mod event;
pub mod traits;
pub mod mock;

// Re-export main types
pub use error::*;
pub use identity::*;
pub use story::*;
pub use remote::*;
pub use transfer::*;
pub use event::*;
pub use traits::*;
pub use mock::*;
