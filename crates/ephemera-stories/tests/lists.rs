//! Global lists, single story loads and expiry

mod common;

use common::*;

use ephemera_core::{OwnerId, RemoteError, StoryFullId, StoryId, StoryListId, StoryUpdate};
use ephemera_storage::RecordTable;
use ephemera_stories::StoryError;

fn main_list(harness: &Harness) -> Vec<OwnerId> {
    harness
        .manager
        .index()
        .list(StoryListId::Main)
        .owners()
        .collect()
}

fn last_count(harness: &Harness, list: StoryListId) -> Option<u32> {
    harness
        .sink
        .updates()
        .into_iter()
        .rev()
        .find_map(|update| match update {
            StoryUpdate::StoryListCountChanged { list: l, count } if l == list => Some(count),
            _ => None,
        })
}

#[tokio::test]
async fn test_main_list_orders_by_newest_unread_story() {
    let mut harness = Harness::new();
    harness.remote.insert_story(ALICE, server_story(1, 600, 86400));
    harness.remote.insert_story(BOB, server_story(2, 60, 86400));

    let loaded = harness.manager.load_active_stories(StoryListId::Main);
    harness.pump().await;
    loaded.await.unwrap();

    assert_eq!(main_list(&harness), vec![BOB, ALICE]);
    assert_eq!(last_count(&harness, StoryListId::Main), Some(2));
    assert!(harness.manager.active_stories(BOB).order > 0);

    // Reading Bob's only story drops him below Alice's unread one
    harness.manager.open_story(BOB, StoryId(2)).await.unwrap();
    harness.pump().await;
    assert_eq!(main_list(&harness), vec![ALICE, BOB]);

    let exhausted = harness.manager.load_active_stories(StoryListId::Main).await;
    assert!(matches!(exhausted, Err(StoryError::NotFound(_))));
}

#[tokio::test]
async fn test_own_stories_lead_the_main_list() {
    let mut harness = Harness::new();
    harness.remote.insert_story(ALICE, server_story(1, 10, 86400));
    harness.remote.insert_story(ME, server_story(2, 3600, 86400));

    let loaded = harness.manager.load_active_stories(StoryListId::Main);
    harness.pump().await;
    loaded.await.unwrap();

    assert_eq!(main_list(&harness), vec![ME, ALICE]);
}

#[tokio::test]
async fn test_hidden_owner_moves_to_archive_list() {
    let mut harness = Harness::new();
    harness.remote.insert_story(ALICE, server_story(1, 60, 86400));
    let loaded = harness.manager.load_active_stories(StoryListId::Main);
    harness.pump().await;
    loaded.await.unwrap();

    let hidden = harness.manager.toggle_stories_hidden(ALICE, true);
    harness.pump().await;
    hidden.await.unwrap();

    assert!(main_list(&harness).is_empty());
    let view = harness.manager.active_stories(ALICE);
    assert_eq!(view.list, Some(StoryListId::Archive));
    let active = harness.manager.index().get(ALICE).unwrap();
    assert_eq!(active.public_order, 0);
    assert!(active.private_order > 0);

    let own = harness.manager.toggle_stories_hidden(ME, true).await;
    assert!(matches!(own, Err(StoryError::InvalidArgument(_))));
}

fn archive_list(harness: &Harness) -> Vec<OwnerId> {
    harness
        .manager
        .index()
        .list(StoryListId::Archive)
        .owners()
        .collect()
}

#[tokio::test]
async fn test_archive_page_fills_archive_list() {
    let mut harness = Harness::new();
    harness.remote.insert_story(ALICE, server_story(1, 60, 86400));
    harness.remote.insert_story(BOB, server_story(2, 30, 86400));
    harness.remote.hide_owner(ALICE);

    let loaded = harness.manager.load_active_stories(StoryListId::Archive);
    harness.pump().await;
    loaded.await.unwrap();

    assert_eq!(archive_list(&harness), vec![ALICE]);
    assert!(main_list(&harness).is_empty());
    assert!(harness.manager.index().is_hidden(ALICE));
    let view = harness.manager.active_stories(ALICE);
    assert_eq!(view.list, Some(StoryListId::Archive));
    assert!(view.order > 0);
    assert_eq!(harness.manager.index().get(ALICE).unwrap().public_order, 0);
    assert_eq!(last_count(&harness, StoryListId::Archive), Some(1));

    // Reloading both lists keeps each owner where the server filed it
    let reloaded = harness.manager.reload_active_stories();
    harness.pump().await;
    reloaded.await.unwrap();
    assert_eq!(main_list(&harness), vec![BOB]);
    assert_eq!(archive_list(&harness), vec![ALICE]);
}

#[tokio::test]
async fn test_main_page_brings_owner_back_from_archive() {
    let mut harness = Harness::new();
    harness.remote.insert_story(ALICE, server_story(1, 60, 86400));
    harness.remote.hide_owner(ALICE);
    let loaded = harness.manager.load_active_stories(StoryListId::Archive);
    harness.pump().await;
    loaded.await.unwrap();
    assert_eq!(archive_list(&harness), vec![ALICE]);

    let shown = harness.manager.toggle_stories_hidden(ALICE, false);
    harness.pump().await;
    shown.await.unwrap();
    assert!(!harness.remote.is_hidden(ALICE));
    assert_eq!(main_list(&harness), vec![ALICE]);
    assert!(archive_list(&harness).is_empty());

    let reloaded = harness.manager.reload_active_stories();
    harness.pump().await;
    reloaded.await.unwrap();
    assert_eq!(main_list(&harness), vec![ALICE]);
    assert!(archive_list(&harness).is_empty());
}

#[tokio::test]
async fn test_get_story_loads_once_then_serves_from_cache() {
    let mut harness = Harness::new();
    harness.remote.insert_story(ALICE, server_story(5, 60, 86400));

    let first = harness.manager.get_story(ALICE, StoryId(5));
    let second = harness.manager.get_story(ALICE, StoryId(5));
    harness.pump().await;
    assert_eq!(first.await.unwrap().caption.text, "server story 5");
    assert!(second.await.is_ok());
    assert_eq!(harness.remote.requests_named("get_stories_by_id").len(), 1);

    let cached = harness.manager.get_story(ALICE, StoryId(5)).await.unwrap();
    assert!(cached.is_loaded());
    assert_eq!(harness.remote.requests_named("get_stories_by_id").len(), 1);
}

#[tokio::test]
async fn test_get_story_missing_on_server_is_not_found() {
    let mut harness = Harness::new();
    let missing = harness.manager.get_story(ALICE, StoryId(99));
    harness.pump().await;
    assert!(matches!(missing.await, Err(StoryError::NotFound(_))));

    let invalid = harness.manager.get_story(ALICE, StoryId(0)).await;
    assert!(matches!(invalid, Err(StoryError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_transient_reload_failures_retry() {
    let mut harness = Harness::new();
    harness.remote.insert_story(ALICE, server_story(5, 60, 86400));
    harness
        .remote
        .fail_next("get_stories_by_id", RemoteError::Network("reset".into()));

    let story = harness.manager.get_story(ALICE, StoryId(5));
    harness.pump().await;
    harness.advance(2).await;
    assert!(story.await.is_ok());
    assert_eq!(harness.remote.requests_named("get_stories_by_id").len(), 2);
}

#[tokio::test]
async fn test_expired_story_leaves_active_list_once() {
    let mut harness = Harness::new();
    harness.remote.insert_story(ALICE, server_story(5, 0, 100));
    let loaded = harness.manager.get_expiring_stories(ALICE);
    harness.pump().await;
    assert_eq!(loaded.await.unwrap().stories.len(), 1);
    harness.sink.take();

    harness.advance(101).await;
    let view = harness.manager.active_stories(ALICE);
    assert!(view.stories.is_empty());
    assert_eq!(view.list, None);
    assert_eq!(harness.sink.count_of("active_stories_changed"), 1);

    harness.advance(1000).await;
    assert_eq!(harness.sink.count_of("active_stories_changed"), 1);
}

#[tokio::test]
async fn test_expired_story_records_are_purged() {
    let mut harness = Harness::new();
    harness.remote.insert_story(ALICE, server_story(5, 60, 3600));
    let loaded = harness.manager.get_expiring_stories(ALICE);
    harness.pump().await;
    loaded.await.unwrap();
    assert_eq!(harness.database.count(RecordTable::Stories), 1);

    // Expiry first, then the next collection drops the story from memory and disk
    harness.advance(4000).await;
    assert!(harness.manager.active_stories(ALICE).stories.is_empty());
    harness.advance(400).await;
    let id = StoryFullId::new(ALICE, StoryId(5));
    assert!(harness.manager.cache().get(id).is_none());
    assert_eq!(harness.database.count(RecordTable::Stories), 0);
}

#[tokio::test]
async fn test_expiring_stories_loads_are_coalesced() {
    let mut harness = Harness::new();
    harness.remote.insert_story(BOB, server_story(3, 60, 86400));

    let first = harness.manager.get_expiring_stories(BOB);
    let second = harness.manager.get_expiring_stories(BOB);
    harness.pump().await;
    assert_eq!(first.await.unwrap(), second.await.unwrap());
    assert_eq!(harness.remote.requests_named("get_owner_stories").len(), 1);

    // Known from the server now; answered without a request
    harness.manager.get_expiring_stories(BOB).await.unwrap();
    assert_eq!(harness.remote.requests_named("get_owner_stories").len(), 1);
}
