//! Remote story service protocol
//!
//! Requests and responses are plain values. Wire encoding belongs to the
//! [`RemoteService`](crate::traits::RemoteService) implementation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{OwnerId, StoryId, StoryListId, UserId};
use crate::story::{Caption, InteractionInfo, PrivacyRules, StoryContent, StoryVisibility};
use crate::transfer::UploadedFile;

/// A full story as returned by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryItem {
    pub id: StoryId,
    pub date: DateTime<Utc>,
    pub expire_date: DateTime<Utc>,
    /// Minimal items omit privacy rules and interaction info
    pub is_min: bool,
    pub is_edited: bool,
    pub is_pinned: bool,
    pub noforwards: bool,
    pub visibility: StoryVisibility,
    pub content: StoryContent,
    pub caption: Caption,
    pub privacy_rules: Option<PrivacyRules>,
    pub interaction_info: Option<InteractionInfo>,
}

/// The three shapes a story can take in a server response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteStoryItem {
    Full(StoryItem),
    /// Pagination placeholder carrying only identity and dates
    Skipped {
        id: StoryId,
        date: DateTime<Utc>,
        expire_date: DateTime<Utc>,
        is_for_close_friends: bool,
    },
    /// Tombstone
    Deleted { id: StoryId },
}

impl RemoteStoryItem {
    pub fn id(&self) -> StoryId {
        match self {
            RemoteStoryItem::Full(item) => item.id,
            RemoteStoryItem::Skipped { id, .. } | RemoteStoryItem::Deleted { id } => *id,
        }
    }
}

/// One page of an owner's stories
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoriesPage {
    pub total_count: u32,
    pub items: Vec<RemoteStoryItem>,
}

/// Active stories of one owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerStories {
    pub owner: OwnerId,
    pub max_read_story_id: StoryId,
    pub items: Vec<RemoteStoryItem>,
}

/// Response to a global list page request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AllStories {
    NotModified {
        state: String,
    },
    Page {
        state: String,
        has_more: bool,
        total_count: u32,
        owners: Vec<OwnerStories>,
    },
}

/// A user who viewed a story
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryViewer {
    pub user_id: UserId,
    pub date: DateTime<Utc>,
}

/// One page of viewers, newest first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewersPage {
    pub total_count: u32,
    pub viewers: Vec<StoryViewer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportReason {
    Spam,
    Violence,
    Pornography,
    Copyright,
    Other(String),
}

/// Requests issued to the remote story service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteRequest {
    SendStory {
        owner: OwnerId,
        random_id: i64,
        file: UploadedFile,
        content: StoryContent,
        caption: Caption,
        privacy_rules: PrivacyRules,
        active_period_secs: u32,
        is_pinned: bool,
        noforwards: bool,
    },
    EditStory {
        owner: OwnerId,
        story_id: StoryId,
        file: Option<UploadedFile>,
        content: Option<StoryContent>,
        caption: Option<Caption>,
        privacy_rules: Option<PrivacyRules>,
    },
    TogglePinned {
        owner: OwnerId,
        story_ids: Vec<StoryId>,
        is_pinned: bool,
    },
    DeleteStories {
        owner: OwnerId,
        story_ids: Vec<StoryId>,
    },
    GetStoriesById {
        owner: OwnerId,
        story_ids: Vec<StoryId>,
    },
    GetPinnedStories {
        owner: OwnerId,
        from_story_id: StoryId,
        limit: u32,
    },
    GetArchive {
        owner: OwnerId,
        from_story_id: StoryId,
        limit: u32,
    },
    GetOwnerStories {
        owner: OwnerId,
    },
    GetAllStories {
        list: StoryListId,
        is_next: bool,
        state: Option<String>,
    },
    ReadStories {
        owner: OwnerId,
        max_story_id: StoryId,
    },
    /// Read marks of every owner with active stories
    GetAllReadStories,
    IncrementViews {
        owner: OwnerId,
        story_ids: Vec<StoryId>,
    },
    GetViewers {
        story_id: StoryId,
        offset_date: Option<DateTime<Utc>>,
        offset_user: Option<UserId>,
        limit: u32,
    },
    GetStoriesViews {
        story_ids: Vec<StoryId>,
    },
    Report {
        owner: OwnerId,
        story_ids: Vec<StoryId>,
        reason: ReportReason,
    },
    ToggleHidden {
        owner: OwnerId,
        hidden: bool,
    },
}

impl RemoteRequest {
    /// Short request name for logs
    pub fn name(&self) -> &'static str {
        match self {
            RemoteRequest::SendStory { .. } => "send_story",
            RemoteRequest::EditStory { .. } => "edit_story",
            RemoteRequest::TogglePinned { .. } => "toggle_pinned",
            RemoteRequest::DeleteStories { .. } => "delete_stories",
            RemoteRequest::GetStoriesById { .. } => "get_stories_by_id",
            RemoteRequest::GetPinnedStories { .. } => "get_pinned_stories",
            RemoteRequest::GetArchive { .. } => "get_archive",
            RemoteRequest::GetOwnerStories { .. } => "get_owner_stories",
            RemoteRequest::GetAllStories { .. } => "get_all_stories",
            RemoteRequest::ReadStories { .. } => "read_stories",
            RemoteRequest::GetAllReadStories => "get_all_read_stories",
            RemoteRequest::IncrementViews { .. } => "increment_views",
            RemoteRequest::GetViewers { .. } => "get_viewers",
            RemoteRequest::GetStoriesViews { .. } => "get_stories_views",
            RemoteRequest::Report { .. } => "report",
            RemoteRequest::ToggleHidden { .. } => "toggle_hidden",
        }
    }
}

/// Successful responses from the remote story service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteResponse {
    Done,
    StorySent { random_id: i64, item: StoryItem },
    Story(RemoteStoryItem),
    Stories(StoriesPage),
    OwnerStories(OwnerStories),
    AllStories(AllStories),
    Viewers(ViewersPage),
    StoryViews(Vec<(StoryId, InteractionInfo)>),
    ReadMarks(Vec<(OwnerId, StoryId)>),
}

impl RemoteResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            RemoteResponse::Done => "done",
            RemoteResponse::StorySent { .. } => "story_sent",
            RemoteResponse::Story(_) => "story",
            RemoteResponse::Stories(_) => "stories",
            RemoteResponse::OwnerStories(_) => "owner_stories",
            RemoteResponse::AllStories(_) => "all_stories",
            RemoteResponse::Viewers(_) => "viewers",
            RemoteResponse::StoryViews(_) => "story_views",
            RemoteResponse::ReadMarks(_) => "read_marks",
        }
    }
}
