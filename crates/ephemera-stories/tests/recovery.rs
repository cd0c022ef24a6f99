//! Restart recovery through the mutation log

mod common;

use common::*;

use ephemera_core::{Caption, FileId, RemoteError, RemoteRequest, StoryId, StoryListId};
use ephemera_storage::{LogEventKind, LogEventStore};
use ephemera_stories::StoryError;

fn pending_kinds(harness: &Harness) -> Vec<LogEventKind> {
    harness
        .log
        .replay_all()
        .unwrap()
        .into_iter()
        .map(|event| event.kind)
        .collect()
}

#[tokio::test]
async fn test_unsent_story_is_resent_after_restart_with_same_random_id() {
    let mut harness = Harness::new();
    harness
        .remote
        .fail_next("send_story", RemoteError::Network("offline".into()));
    let mut sent = harness.manager.send_story(ME, new_story(11));
    harness.pump().await;
    harness.finish_upload(FileId(11)).await;
    assert_eq!(pending_kinds(&harness), vec![LogEventKind::SendStory]);

    let mut harness = harness.restart();
    assert!(matches!(sent.try_take(), Some(Err(StoryError::Canceled))));
    assert_eq!(harness.manager.pipeline().yet_unsent(), vec![1]);

    harness.pump().await;
    harness.finish_all_uploads().await;

    let random_ids: Vec<i64> = harness
        .remote
        .requests_named("send_story")
        .into_iter()
        .filter_map(|request| match request {
            RemoteRequest::SendStory { random_id, .. } => Some(random_id),
            _ => None,
        })
        .collect();
    assert_eq!(random_ids.len(), 2);
    assert_eq!(random_ids[0], random_ids[1]);
    assert_eq!(harness.sink.count_of("story_send_succeeded"), 1);
    assert!(pending_kinds(&harness).is_empty());
    assert_eq!(harness.manager.active_stories(ME).stories.len(), 1);
}

#[tokio::test]
async fn test_new_sends_after_restart_are_numbered_after_replayed_ones() {
    let mut harness = Harness::new();
    let _first = harness.manager.send_story(ME, new_story(11));
    let _second = harness.manager.send_story(ME, new_story(12));
    harness.pump().await;

    let mut harness = harness.restart();
    harness.pump().await;
    let third = harness.manager.send_story(ME, new_story(13));
    harness.pump().await;
    assert_eq!(harness.manager.pipeline().yet_unsent(), vec![1, 2, 3]);

    harness.finish_upload(FileId(13)).await;
    assert!(harness.remote.requests_named("send_story").is_empty());
    harness.finish_all_uploads().await;
    assert!(third.await.is_ok());
    assert_eq!(harness.remote.requests_named("send_story").len(), 3);
}

#[tokio::test]
async fn test_server_delete_survives_restart() {
    let mut harness = Harness::new();
    let sent = harness.manager.send_story(ME, new_story(11));
    harness.pump().await;
    harness.finish_upload(FileId(11)).await;
    let id = sent.await.unwrap();

    harness
        .remote
        .fail_next("delete_stories", RemoteError::Network("offline".into()));
    harness.manager.delete_story(id.story_id).await.unwrap();
    harness.pump().await;
    assert!(harness.remote.has_story(id));
    assert_eq!(pending_kinds(&harness), vec![LogEventKind::DeleteStoryOnServer]);

    let mut harness = harness.restart();
    harness.pump().await;
    assert!(!harness.remote.has_story(id));
    assert!(pending_kinds(&harness).is_empty());
    assert!(harness.manager.cache().is_deleted(id));
}

#[tokio::test]
async fn test_read_mark_is_reapplied_after_restart() {
    let mut harness = Harness::new();
    harness.remote.insert_story(ALICE, server_story(7, 60, 86400));
    let loaded = harness.manager.get_expiring_stories(ALICE);
    harness.pump().await;
    loaded.await.unwrap();

    harness
        .remote
        .fail_next("read_stories", RemoteError::Network("offline".into()));
    harness.manager.open_story(ALICE, StoryId(7)).await.unwrap();
    harness.pump().await;
    assert!(pending_kinds(&harness).contains(&LogEventKind::ReadStoriesOnServer));

    let mut harness = harness.restart();
    assert_eq!(harness.manager.index().max_read_story_id(ALICE), StoryId(7));
    harness.pump().await;
    assert_eq!(harness.remote.requests_named("read_stories").len(), 2);
    assert!(!pending_kinds(&harness).contains(&LogEventKind::ReadStoriesOnServer));
}

#[tokio::test]
async fn test_interrupted_edit_is_resumed() {
    let mut harness = Harness::new();
    let sent = harness.manager.send_story(ME, new_story(11));
    harness.pump().await;
    harness.finish_upload(FileId(11)).await;
    let id = sent.await.unwrap();

    let _edited = harness.manager.edit_story(
        id.story_id,
        Some(photo(21)),
        Some(Caption::plain("after restart")),
    );
    harness.pump().await;
    assert_eq!(pending_kinds(&harness), vec![LogEventKind::EditStory]);

    let mut harness = harness.restart();
    harness.pump().await;
    harness.finish_upload(FileId(21)).await;

    let story = harness.manager.cache().get(id).unwrap();
    assert_eq!(story.content.as_ref(), Some(&photo(21)));
    assert_eq!(story.caption.text, "after restart");
    assert!(pending_kinds(&harness).is_empty());
}

#[tokio::test]
async fn test_list_state_is_restored_after_restart() {
    let mut harness = Harness::new();
    harness.remote.insert_story(ALICE, server_story(1, 60, 86400));
    let loaded = harness.manager.load_active_stories(StoryListId::Main);
    harness.pump().await;
    loaded.await.unwrap();
    assert!(harness.manager.index().list(StoryListId::Main).is_fully_loaded());

    let mut harness = harness.restart();
    let main = harness.manager.index().list(StoryListId::Main);
    assert!(main.is_fully_loaded());
    assert!(!main.state.is_empty());

    // Persisted snapshots come back from the database first
    let loaded = harness.manager.load_active_stories(StoryListId::Main);
    harness.pump().await;
    loaded.await.unwrap();
    assert!(harness.manager.index().is_from_database(ALICE));
    assert_eq!(harness.remote.requests_named("get_all_stories").len(), 1);
}

#[tokio::test]
async fn test_stories_restored_from_database_still_expire() {
    let mut harness = Harness::new();
    harness.remote.insert_story(ALICE, server_story(1, 60, 3600));
    let loaded = harness.manager.load_active_stories(StoryListId::Main);
    harness.pump().await;
    loaded.await.unwrap();

    let mut harness = harness.restart();
    let loaded = harness.manager.load_active_stories(StoryListId::Main);
    harness.pump().await;
    loaded.await.unwrap();
    assert!(harness.manager.index().is_from_database(ALICE));
    assert_eq!(harness.manager.active_stories(ALICE).stories.len(), 1);

    harness.advance(4000).await;
    let view = harness.manager.active_stories(ALICE);
    assert!(view.stories.is_empty());
    assert_eq!(view.list, None);
}
