//! Collaborator contracts consumed by the story engine
//!
//! The engine never reaches for ambient globals. Every external effect goes
//! through one of these traits, injected at construction time.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::error::{RemoteError, UploadError};
use crate::event::StoryUpdate;
use crate::identity::{OwnerId, UserId};
use crate::remote::{RemoteRequest, RemoteResponse};
use crate::transfer::{UploadRequest, UploadedFile};

/// Time abstraction for testability
pub trait Clock: Send + Sync {
    /// Current wall-clock time
    fn now(&self) -> DateTime<Utc>;
}

/// Real clock implementation using system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Receives updates produced by the engine
///
/// Delivery is fire-and-forget. Implementations must not call back into the
/// engine synchronously.
pub trait NotificationSink: Send + Sync {
    fn publish(&self, update: StoryUpdate);
}

/// Sink fanning updates out over a tokio broadcast channel
pub struct BroadcastSink {
    tx: broadcast::Sender<StoryUpdate>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoryUpdate> {
        self.tx.subscribe()
    }
}

impl NotificationSink for BroadcastSink {
    fn publish(&self, update: StoryUpdate) {
        // No receivers is fine
        let _ = self.tx.send(update);
    }
}

/// Ids referenced by an update that must be known before it is dispatched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dependencies {
    users: BTreeSet<UserId>,
    owners: BTreeSet<OwnerId>,
}

impl Dependencies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&mut self, user_id: UserId) {
        if user_id.0 > 0 {
            self.users.insert(user_id);
        }
    }

    pub fn add_owner(&mut self, owner: OwnerId) {
        if !owner.is_valid() {
            return;
        }
        match owner.as_user() {
            Some(user_id) => {
                self.users.insert(user_id);
            }
            None => {
                self.owners.insert(owner);
            }
        }
    }

    pub fn users(&self) -> &BTreeSet<UserId> {
        &self.users
    }

    pub fn owners(&self) -> &BTreeSet<OwnerId> {
        &self.owners
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.owners.is_empty()
    }
}

/// Ensures referenced users and conversations are loaded
pub trait DependencyResolver: Send + Sync {
    /// Returns false when some dependency could not be resolved
    fn resolve(&self, dependencies: &Dependencies, source: &'static str) -> bool;
}

/// Remote story service
#[async_trait]
pub trait RemoteService: Send + Sync {
    async fn execute(&self, request: RemoteRequest) -> Result<RemoteResponse, RemoteError>;
}

/// File upload layer
#[async_trait]
pub trait FileTransfer: Send + Sync {
    /// Upload a file, or only the listed parts of it
    async fn upload(&self, request: UploadRequest) -> Result<UploadedFile, UploadError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependencies_split_users_and_chats() {
        let mut deps = Dependencies::new();
        deps.add_owner(OwnerId(5));
        deps.add_owner(OwnerId(-100));
        deps.add_owner(OwnerId(0));
        deps.add_user(UserId(0));

        assert!(deps.users().contains(&UserId(5)));
        assert!(deps.owners().contains(&OwnerId(-100)));
        assert_eq!(deps.users().len(), 1);
        assert_eq!(deps.owners().len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_sink_delivers() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();
        sink.publish(StoryUpdate::StoryListCountChanged {
            list: crate::identity::StoryListId::Main,
            count: 3,
        });
        let update = rx.recv().await.unwrap();
        assert_eq!(update.event_type(), "story_list_count_changed");
    }
}
