//! Updates published to the notification sink

use serde::{Deserialize, Serialize};

use crate::identity::{MessageFullId, OwnerId, StoryFullId, StoryId, StoryListId};
use crate::story::{Story, StoryInfo};

/// Fire-and-forget notification about story state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoryUpdate {
    StoryChanged {
        story_full_id: StoryFullId,
        story: Box<Story>,
    },
    StoryDeleted {
        story_full_id: StoryFullId,
    },
    ActiveStoriesChanged {
        owner: OwnerId,
        list: Option<StoryListId>,
        order: i64,
        max_read_story_id: StoryId,
        stories: Vec<StoryInfo>,
    },
    StoryListCountChanged {
        list: StoryListId,
        count: u32,
    },
    StorySendSucceeded {
        send_story_num: u32,
        story_full_id: StoryFullId,
    },
    StorySendFailed {
        send_story_num: u32,
        owner: OwnerId,
        reason: String,
    },
    /// Messages embedding the story must refresh their preview
    StoryMessagesInvalidated {
        story_full_id: StoryFullId,
        messages: Vec<MessageFullId>,
    },
}

impl StoryUpdate {
    /// Event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            StoryUpdate::StoryChanged { .. } => "story_changed",
            StoryUpdate::StoryDeleted { .. } => "story_deleted",
            StoryUpdate::ActiveStoriesChanged { .. } => "active_stories_changed",
            StoryUpdate::StoryListCountChanged { .. } => "story_list_count_changed",
            StoryUpdate::StorySendSucceeded { .. } => "story_send_succeeded",
            StoryUpdate::StorySendFailed { .. } => "story_send_failed",
            StoryUpdate::StoryMessagesInvalidated { .. } => "story_messages_invalidated",
        }
    }

    /// Owner the update concerns, if any
    pub fn owner(&self) -> Option<OwnerId> {
        match self {
            StoryUpdate::StoryChanged { story_full_id, .. }
            | StoryUpdate::StoryDeleted { story_full_id }
            | StoryUpdate::StorySendSucceeded { story_full_id, .. }
            | StoryUpdate::StoryMessagesInvalidated { story_full_id, .. } => {
                Some(story_full_id.owner)
            }
            StoryUpdate::ActiveStoriesChanged { owner, .. }
            | StoryUpdate::StorySendFailed { owner, .. } => Some(*owner),
            StoryUpdate::StoryListCountChanged { .. } => None,
        }
    }
}
