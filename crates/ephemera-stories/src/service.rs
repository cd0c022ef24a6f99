//! Async driver for the story manager
//!
//! [`StoryService`] owns a [`StoryManager`] on a single task. Commands reach
//! it through a [`StoryHandle`]; remote requests and uploads queued by the
//! manager run on spawned tasks and report back over a channel, so one slow
//! request never blocks the others.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use ephemera_core::{
    Caption, FileTransfer, OwnerId, RemoteService, Story, StoryContent, StoryFullId, StoryId,
    StoryListId,
};

use crate::active::ActiveStoriesView;
use crate::error::{StoryError, StoryResult};
use crate::manager::{NewStory, StoryManager};
use crate::outbound::{Inbound, Outbound};
use crate::promise::Deferred;

type Command = Box<dyn FnOnce(&mut StoryManager) + Send>;

/// Background task driving a [`StoryManager`]
pub struct StoryService {
    manager: StoryManager,
    remote: Arc<dyn RemoteService>,
    files: Arc<dyn FileTransfer>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl StoryService {
    /// Spawn the service; dropping every handle or calling
    /// [`StoryHandle::shutdown`] stops it
    pub fn spawn(
        manager: StoryManager,
        remote: Arc<dyn RemoteService>,
        files: Arc<dyn FileTransfer>,
    ) -> (JoinHandle<()>, StoryHandle) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let service = Self {
            manager,
            remote,
            files,
            commands_rx,
            inbound_tx,
            inbound_rx,
            shutdown_rx,
        };
        let handle = StoryHandle {
            commands: commands_tx,
            shutdown: shutdown_tx,
        };
        let task = tokio::spawn(async move {
            service.run().await;
        });
        (task, handle)
    }

    async fn run(mut self) {
        info!(self_owner = %self.manager.config().self_owner, "Story service started");
        self.dispatch();

        loop {
            let delay = self.manager.next_deadline().map(|deadline| {
                (deadline - self.manager.now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
            });
            let timer = async {
                match delay {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("Story service shutting down");
                    break;
                }
                command = self.commands_rx.recv() => match command {
                    Some(command) => command(&mut self.manager),
                    None => {
                        debug!("All story handles dropped");
                        break;
                    }
                },
                Some(inbound) = self.inbound_rx.recv() => self.manager.handle_inbound(inbound),
                _ = timer => self.manager.tick(),
            }
            self.dispatch();
        }

        self.manager.teardown();
    }

    /// Start every queued request and upload
    fn dispatch(&mut self) {
        for outbound in self.manager.take_outbound() {
            let inbound_tx = self.inbound_tx.clone();
            match outbound {
                Outbound::Remote { query_id, request } => {
                    trace!(query = %query_id, request = request.name(), "Executing remote request");
                    let remote = self.remote.clone();
                    tokio::spawn(async move {
                        let result = remote.execute(request).await;
                        // Service may have stopped meanwhile
                        let _ = inbound_tx.send(Inbound::Remote { query_id, result });
                    });
                }
                Outbound::Upload { upload_id, request } => {
                    trace!(upload = %upload_id, file = %request.file_id, "Starting upload");
                    let files = self.files.clone();
                    tokio::spawn(async move {
                        let result = files.upload(request).await;
                        let _ = inbound_tx.send(Inbound::Upload { upload_id, result });
                    });
                }
            }
        }
    }
}

/// Cloneable entry point to a running [`StoryService`]
#[derive(Clone)]
pub struct StoryHandle {
    commands: mpsc::UnboundedSender<Command>,
    shutdown: broadcast::Sender<()>,
}

impl StoryHandle {
    /// Run a closure on the manager and return its value
    pub async fn with<R, F>(&self, f: F) -> StoryResult<R>
    where
        F: FnOnce(&mut StoryManager) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Box::new(move |manager: &mut StoryManager| {
                let _ = tx.send(f(manager));
            }))
            .map_err(|_| StoryError::Canceled)?;
        rx.await.map_err(|_| StoryError::Canceled)
    }

    /// Run a command and wait for its deferred result
    pub async fn call<T, F>(&self, f: F) -> StoryResult<T>
    where
        F: FnOnce(&mut StoryManager) -> Deferred<T> + Send + 'static,
        T: Send + 'static,
    {
        self.with(f).await?.await
    }

    pub async fn send_story(&self, owner: OwnerId, story: NewStory) -> StoryResult<StoryFullId> {
        self.call(move |manager| manager.send_story(owner, story)).await
    }

    pub async fn get_story(&self, owner: OwnerId, story_id: StoryId) -> StoryResult<Story> {
        self.call(move |manager| manager.get_story(owner, story_id)).await
    }

    pub async fn edit_story(
        &self,
        story_id: StoryId,
        content: Option<StoryContent>,
        caption: Option<Caption>,
    ) -> StoryResult<()> {
        self.call(move |manager| manager.edit_story(story_id, content, caption))
            .await
    }

    pub async fn delete_story(&self, story_id: StoryId) -> StoryResult<()> {
        self.call(move |manager| manager.delete_story(story_id)).await
    }

    pub async fn open_story(&self, owner: OwnerId, story_id: StoryId) -> StoryResult<()> {
        self.call(move |manager| manager.open_story(owner, story_id)).await
    }

    pub async fn close_story(&self, owner: OwnerId, story_id: StoryId) -> StoryResult<()> {
        self.call(move |manager| manager.close_story(owner, story_id)).await
    }

    pub async fn load_active_stories(&self, list: StoryListId) -> StoryResult<()> {
        self.call(move |manager| manager.load_active_stories(list)).await
    }

    pub async fn get_expiring_stories(&self, owner: OwnerId) -> StoryResult<ActiveStoriesView> {
        self.call(move |manager| manager.get_expiring_stories(owner)).await
    }

    /// Current view of an owner, without loading anything
    pub async fn active_stories(&self, owner: OwnerId) -> StoryResult<ActiveStoriesView> {
        self.with(move |manager| manager.active_stories(owner)).await
    }

    /// Stop the service; pending commands resolve as canceled
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}
