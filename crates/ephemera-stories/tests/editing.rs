//! Edits, privacy, pinning and deletion of own stories

mod common;

use common::*;

use ephemera_core::{
    Caption, FileId, RemoteError, RemoteRequest, StoryFullId, StoryPrivacySettings, StoryUpdate,
};
use ephemera_storage::LogEventStore;
use ephemera_stories::StoryError;

async fn sent_story(harness: &mut Harness, file: u64) -> StoryFullId {
    let sent = harness.manager.send_story(ME, new_story(file));
    harness.pump().await;
    harness.finish_upload(FileId(file)).await;
    sent.await.unwrap()
}

#[tokio::test]
async fn test_caption_edit_applies_after_server_confirms() {
    let mut harness = Harness::new();
    let id = sent_story(&mut harness, 11).await;
    harness.sink.take();

    let edited = harness
        .manager
        .edit_story(id.story_id, None, Some(Caption::plain("new caption")));
    assert_eq!(harness.manager.cache().get(id).unwrap().caption.text, "story 11");
    harness.pump().await;
    edited.await.unwrap();

    let story = harness.manager.cache().get(id).unwrap();
    assert_eq!(story.caption.text, "new caption");
    assert!(story.is_edited);
    assert_eq!(harness.sink.count_of("story_changed"), 1);
    assert!(harness.log.replay_all().unwrap().is_empty());
}

#[tokio::test]
async fn test_newer_edit_supersedes_one_in_flight() {
    let mut harness = Harness::new();
    let id = sent_story(&mut harness, 11).await;

    let first = harness.manager.edit_story(id.story_id, Some(photo(21)), None);
    harness.pump().await;
    let second = harness
        .manager
        .edit_story(id.story_id, None, Some(Caption::plain("both")));
    harness.pump().await;
    assert_eq!(harness.pending_uploads().len(), 2);

    // The first upload belongs to the superseded generation
    harness.finish_upload(FileId(21)).await;
    assert!(harness.remote.requests_named("edit_story").is_empty());

    harness.finish_upload(FileId(21)).await;
    first.await.unwrap();
    second.await.unwrap();

    let edits = harness.remote.requests_named("edit_story");
    assert_eq!(edits.len(), 1);
    let RemoteRequest::EditStory {
        file,
        content,
        caption,
        ..
    } = &edits[0]
    else {
        panic!("expected an edit request");
    };
    assert!(file.is_some());
    assert_eq!(content.as_ref(), Some(&photo(21)));
    assert_eq!(caption.as_ref().map(|c| c.text.as_str()), Some("both"));

    let story = harness.manager.cache().get(id).unwrap();
    assert_eq!(story.content.as_ref(), Some(&photo(21)));
    assert_eq!(story.caption.text, "both");
}

#[tokio::test]
async fn test_older_edit_answer_arriving_last_is_ignored() {
    let mut harness = Harness::new();
    let id = sent_story(&mut harness, 11).await;
    harness.sink.take();

    let first = harness
        .manager
        .edit_story(id.story_id, None, Some(Caption::plain("first")));
    let mut held = harness.hold_requests();
    let second = harness
        .manager
        .edit_story(id.story_id, None, Some(Caption::plain("second")));
    held.extend(harness.hold_requests());
    assert_eq!(held.len(), 2);

    let (older_query, older_request) = held.remove(0);
    let (newer_query, newer_request) = held.remove(0);
    harness.answer(newer_query, newer_request).await;
    first.await.unwrap();
    second.await.unwrap();
    assert_eq!(harness.manager.cache().get(id).unwrap().caption.text, "second");

    harness.answer(older_query, older_request).await;
    let story = harness.manager.cache().get(id).unwrap();
    assert_eq!(story.caption.text, "second");
    assert_eq!(harness.sink.count_of("story_changed"), 1);
    assert_eq!(harness.remote.requests_named("edit_story").len(), 2);
    assert!(harness.log.replay_all().unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_edit_leaves_story_untouched() {
    let mut harness = Harness::new();
    let id = sent_story(&mut harness, 11).await;
    harness.remote.fail_next(
        "edit_story",
        RemoteError::Rejected {
            code: 400,
            message: "caption invalid".into(),
        },
    );

    let edited = harness
        .manager
        .edit_story(id.story_id, None, Some(Caption::plain("nope")));
    harness.pump().await;

    assert!(edited.await.is_err());
    let story = harness.manager.cache().get(id).unwrap();
    assert_eq!(story.caption.text, "story 11");
    assert!(!story.is_edited);
    assert!(harness.manager.pipeline().being_edited(id).is_none());
}

#[tokio::test]
async fn test_edit_reuploads_parts_the_server_lost() {
    let mut harness = Harness::new();
    let id = sent_story(&mut harness, 11).await;
    harness
        .remote
        .fail_next("edit_story", RemoteError::FilePartsMissing(vec![2]));

    let edited = harness.manager.edit_story(id.story_id, Some(photo(21)), None);
    harness.pump().await;
    harness.finish_upload(FileId(21)).await;

    let uploads = harness.pending_uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].file_id, FileId(21));
    assert_eq!(uploads[0].bad_parts, vec![2]);

    harness.finish_upload(FileId(21)).await;
    edited.await.unwrap();
    assert_eq!(harness.remote.requests_named("edit_story").len(), 2);
    let story = harness.manager.cache().get(id).unwrap();
    assert_eq!(story.content.as_ref(), Some(&photo(21)));
    assert!(harness.manager.pipeline().being_edited(id).is_none());
}

#[tokio::test]
async fn test_edit_reuploads_are_capped() {
    let mut harness = Harness::new();
    let id = sent_story(&mut harness, 11).await;
    for _ in 0..4 {
        harness
            .remote
            .fail_next("edit_story", RemoteError::FilePartsMissing(vec![1]));
    }

    let edited = harness.manager.edit_story(id.story_id, Some(photo(21)), None);
    harness.pump().await;
    for _ in 0..4 {
        harness.finish_upload(FileId(21)).await;
    }

    assert!(harness.pending_uploads().is_empty());
    assert!(matches!(
        edited.await,
        Err(StoryError::FilePartsMissing(parts)) if parts == vec![1]
    ));
    assert_eq!(harness.remote.requests_named("edit_story").len(), 4);
    assert_eq!(harness.manager.cache().get(id).unwrap().content.as_ref(), Some(&photo(11)));
}

#[tokio::test]
async fn test_edit_arguments_are_checked() {
    let mut harness = Harness::new();
    let id = sent_story(&mut harness, 11).await;

    let nothing = harness.manager.edit_story(id.story_id, None, None).await;
    assert!(matches!(nothing, Err(StoryError::InvalidArgument(_))));

    let unknown = harness
        .manager
        .edit_story(ephemera_core::StoryId(999), None, Some(Caption::plain("x")))
        .await;
    assert!(matches!(unknown, Err(StoryError::NotFound(_))));
}

#[tokio::test]
async fn test_privacy_change_updates_visibility() {
    let mut harness = Harness::new();
    let id = sent_story(&mut harness, 11).await;
    assert!(harness.manager.cache().get(id).unwrap().is_public);

    let changed = harness
        .manager
        .set_story_privacy_settings(id.story_id, StoryPrivacySettings::CloseFriends);
    harness.pump().await;
    changed.await.unwrap();

    let story = harness.manager.cache().get(id).unwrap();
    assert!(!story.is_public);
    assert!(story.is_for_close_friends);
    let view = harness.manager.active_stories(ME);
    assert!(view.stories[0].is_for_close_friends);
}

#[tokio::test]
async fn test_toggle_pinned() {
    let mut harness = Harness::new();
    let id = sent_story(&mut harness, 11).await;

    let pinned = harness.manager.toggle_story_is_pinned(id.story_id, true);
    harness.pump().await;
    pinned.await.unwrap();
    assert!(harness.manager.cache().get(id).unwrap().is_pinned);

    let found = harness.manager.get_pinned_stories(ME, ephemera_core::StoryId(0), 10);
    harness.pump().await;
    let found = found.await.unwrap();
    assert_eq!(found.stories, vec![id]);
}

#[tokio::test]
async fn test_delete_removes_story_everywhere() {
    let mut harness = Harness::new();
    let id = sent_story(&mut harness, 11).await;
    harness.sink.take();

    harness.manager.delete_story(id.story_id).await.unwrap();
    assert!(harness.manager.cache().get(id).is_none());
    assert!(harness.manager.active_stories(ME).stories.is_empty());
    assert!(harness.sink.updates().iter().any(|update| matches!(
        update,
        StoryUpdate::StoryDeleted { story_full_id } if *story_full_id == id
    )));

    harness.pump().await;
    assert!(!harness.remote.has_story(id));
    assert!(harness.log.replay_all().unwrap().is_empty());

    let again = harness.manager.get_story(ME, id.story_id).await;
    assert!(again.is_err());
}
