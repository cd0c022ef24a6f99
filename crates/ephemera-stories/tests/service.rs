//! The async service against in-memory collaborators

mod common;

use std::sync::Arc;
use std::time::Duration;

use ephemera_core::{
    AcceptAllResolver, BroadcastSink, FileId, MockFileTransfer, MockRemoteService, StoryUpdate,
    SystemClock,
};
use ephemera_storage::{InMemoryLogEventStore, InMemoryStoryDatabase};
use ephemera_stories::{StoryConfig, StoryError, StoryManager, StoryService};

use common::{ME, new_story};

struct Running {
    task: tokio::task::JoinHandle<()>,
    stories: ephemera_stories::StoryHandle,
    remote: Arc<MockRemoteService>,
    files: Arc<MockFileTransfer>,
    sink: Arc<BroadcastSink>,
}

fn start() -> Running {
    let remote = Arc::new(MockRemoteService::new());
    let files = Arc::new(MockFileTransfer::new());
    let sink = Arc::new(BroadcastSink::new(64));
    let manager = StoryManager::new(
        StoryConfig::testing(ME),
        Arc::new(SystemClock),
        Arc::new(InMemoryLogEventStore::new()),
        Arc::new(InMemoryStoryDatabase::new()),
        sink.clone(),
        Arc::new(AcceptAllResolver::new()),
    )
    .unwrap();
    let (task, stories) = StoryService::spawn(manager, remote.clone(), files.clone());
    Running {
        task,
        stories,
        remote,
        files,
        sink,
    }
}

#[tokio::test]
async fn test_service_sends_in_order_despite_slow_first_upload() {
    let running = start();
    running.files.hold(FileId(1));

    let (first, second) = running
        .stories
        .with(|manager| {
            (
                manager.send_story(ME, new_story(1)),
                manager.send_story(ME, new_story(2)),
            )
        })
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while !running.files.completed().contains(&FileId(2)) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(running.remote.requests_named("send_story").is_empty());

    running.files.release(FileId(1));
    let first = tokio::time::timeout(Duration::from_secs(5), first)
        .await
        .unwrap()
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), second)
        .await
        .unwrap()
        .unwrap();
    assert!(first.story_id < second.story_id);
    assert_eq!(running.files.completed(), vec![FileId(2), FileId(1)]);

    let view = running.stories.active_stories(ME).await.unwrap();
    assert_eq!(view.stories.len(), 2);

    running.stories.shutdown();
    running.task.await.unwrap();
}

#[tokio::test]
async fn test_service_publishes_updates() {
    let running = start();
    let mut updates = running.sink.subscribe();

    let id = running.stories.send_story(ME, new_story(3)).await.unwrap();

    let succeeded = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match updates.recv().await {
                Ok(StoryUpdate::StorySendSucceeded { story_full_id, .. }) => break story_full_id,
                Ok(_) => continue,
                Err(e) => panic!("update stream closed: {e}"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(succeeded, id);

    let story = running.stories.get_story(ME, id.story_id).await.unwrap();
    assert_eq!(story.caption.text, "story 3");

    running.stories.shutdown();
    running.task.await.unwrap();
}

#[tokio::test]
async fn test_commands_after_shutdown_are_canceled() {
    let running = start();
    running.files.hold(FileId(4));
    let pending = running
        .stories
        .with(|manager| manager.send_story(ME, new_story(4)))
        .await
        .unwrap();

    running.stories.shutdown();
    running.task.await.unwrap();

    assert!(matches!(pending.await, Err(StoryError::Canceled)));
    let after = running.stories.active_stories(ME).await;
    assert!(matches!(after, Err(StoryError::Canceled)));
    running.files.release(FileId(4));
}
