//! # Ephemera simulation
//!
//! Scripted runs of the story engine against in-memory collaborators.
//!
//! ## Architecture
//!
//! - **World** (`world.rs`): a [`StoryManager`](ephemera_stories::StoryManager)
//!   on a manual clock, answering remote requests from
//!   [`MockRemoteService`](ephemera_core::MockRemoteService) and parking
//!   uploads until the driver finishes them
//! - **Scenarios** (`scenarios.rs`): pre-built runs covering ordered sends,
//!   restart recovery, the global feed, expiry, a randomized stress run and
//!   the async service
//!
//! ## Example
//!
//! ```rust,ignore
//! use ephemera_simulation::*;
//!
//! let mut world = World::new(SimConfig::default())?;
//! let me = world.config.self_owner;
//! let story = world.next_story();
//! let sent = world.manager.send_story(me, story);
//! world.pump().await;
//! world.finish_all_uploads().await;
//! println!("sent {}", sent.await?);
//! ```

pub mod scenarios;
pub mod world;

#[cfg(test)]
mod integration_scenarios;

pub use scenarios::{
    ChaosReport, ExpiryReport, FeedReport, OrderedSendsReport, RestartReport, ServiceReport,
    run_chaos, run_expiry, run_feed, run_ordered_sends, run_restart_recovery, run_service,
};
pub use world::{SimConfig, SimStats, Storage, World};
