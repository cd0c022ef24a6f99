//! Durable mutation records
//!
//! One payload type per [`LogEventKind`]. Payloads are postcard-encoded and
//! must stay idempotent against re-application: a send carries its random id
//! so the server can recognise a resend after restart.

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use ephemera_core::{Caption, OwnerId, Story, StoryContent, StoryFullId, StoryId};
use ephemera_storage::LogEventKind;

use crate::error::{StoryError, StoryResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendStoryLogEvent {
    pub owner: OwnerId,
    pub send_story_num: u32,
    pub random_id: i64,
    pub active_period_secs: u32,
    pub story: Story,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditStoryLogEvent {
    pub story_full_id: StoryFullId,
    pub content: Option<StoryContent>,
    pub caption: Option<Caption>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteStoryOnServerLogEvent {
    pub story_full_id: StoryFullId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadStoriesOnServerLogEvent {
    pub owner: OwnerId,
    pub max_story_id: StoryId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadExpiringStoriesLogEvent {
    pub owner: OwnerId,
}

/// Payload types with a fixed log event kind
pub trait LogEventPayload: Serialize + DeserializeOwned {
    const KIND: LogEventKind;

    fn encode(&self) -> StoryResult<Bytes> {
        postcard::to_allocvec(self)
            .map(Bytes::from)
            .map_err(|e| StoryError::Storage(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> StoryResult<Self> {
        postcard::from_bytes(bytes).map_err(StoryError::from)
    }
}

impl LogEventPayload for SendStoryLogEvent {
    const KIND: LogEventKind = LogEventKind::SendStory;
}

impl LogEventPayload for EditStoryLogEvent {
    const KIND: LogEventKind = LogEventKind::EditStory;
}

impl LogEventPayload for DeleteStoryOnServerLogEvent {
    const KIND: LogEventKind = LogEventKind::DeleteStoryOnServer;
}

impl LogEventPayload for ReadStoriesOnServerLogEvent {
    const KIND: LogEventKind = LogEventKind::ReadStoriesOnServer;
}

impl LogEventPayload for LoadExpiringStoriesLogEvent {
    const KIND: LogEventKind = LogEventKind::LoadExpiringStories;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ephemera_core::{FileId, PhotoContent, unix_time};

    #[test]
    fn test_send_payload_keeps_random_id() {
        let mut story = Story::placeholder(unix_time(10), unix_time(20), unix_time(10));
        story.content = Some(StoryContent::Photo(PhotoContent {
            file_id: FileId(3),
            width: 10,
            height: 20,
        }));
        let event = SendStoryLogEvent {
            owner: OwnerId(1),
            send_story_num: 4,
            random_id: -991,
            active_period_secs: 86400,
            story,
        };
        let decoded = SendStoryLogEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_corrupt_payload_is_reported() {
        let err = EditStoryLogEvent::decode(&[0xff, 0xff]).unwrap_err();
        assert!(matches!(err, StoryError::CorruptPersistedState(_)));
    }
}
