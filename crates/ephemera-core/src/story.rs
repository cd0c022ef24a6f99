//! Story entity model
//!
//! [`Story`] is the canonical cached entity. Content is a closed tagged union
//! ([`StoryContent`]) so that every consumer dispatches on the variant rather
//! than on a trait object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{FileId, OwnerId, StoryGlobalId, StoryId, UserId};
use crate::traits::Dependencies;

/// A photo story
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoContent {
    pub file_id: FileId,
    pub width: u32,
    pub height: u32,
}

/// A video story
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoContent {
    pub file_id: FileId,
    pub duration_secs: f64,
    pub width: u32,
    pub height: u32,
}

/// Story media
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoryContent {
    Photo(PhotoContent),
    Video(VideoContent),
    /// Content kind this client does not understand
    Unsupported { version: u32 },
}

/// Discriminant of [`StoryContent`], handy for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Photo,
    Video,
    Unsupported,
}

impl StoryContent {
    pub fn kind(&self) -> ContentKind {
        match self {
            StoryContent::Photo(_) => ContentKind::Photo,
            StoryContent::Video(_) => ContentKind::Video,
            StoryContent::Unsupported { .. } => ContentKind::Unsupported,
        }
    }

    /// The file that has to be uploaded to send this content
    pub fn main_file_id(&self) -> Option<FileId> {
        match self {
            StoryContent::Photo(photo) => Some(photo.file_id),
            StoryContent::Video(video) => Some(video.file_id),
            StoryContent::Unsupported { .. } => None,
        }
    }

    /// All files referenced by the content
    pub fn file_ids(&self) -> Vec<FileId> {
        self.main_file_id().into_iter().collect()
    }

    /// Playback duration, for video stories
    pub fn duration_secs(&self) -> Option<f64> {
        match self {
            StoryContent::Video(video) => Some(video.duration_secs),
            _ => None,
        }
    }
}

/// Story caption with the users it mentions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caption {
    pub text: String,
    pub mentions: Vec<UserId>,
}

impl Caption {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            mentions: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn len(&self) -> usize {
        self.text.chars().count()
    }
}

/// A single privacy rule, evaluated in order by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrivacyRule {
    AllowAll,
    AllowContacts,
    AllowCloseFriends,
    AllowUsers(Vec<UserId>),
    AllowChatMembers(Vec<OwnerId>),
    RestrictUsers(Vec<UserId>),
    RestrictChatMembers(Vec<OwnerId>),
}

/// Ordered privacy rule set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivacyRules(pub Vec<PrivacyRule>);

impl PrivacyRules {
    pub fn rules(&self) -> &[PrivacyRule] {
        &self.0
    }

    /// Add every user and conversation the rules refer to
    pub fn add_dependencies(&self, dependencies: &mut Dependencies) {
        for rule in &self.0 {
            match rule {
                PrivacyRule::AllowUsers(users) | PrivacyRule::RestrictUsers(users) => {
                    for user in users {
                        dependencies.add_user(*user);
                    }
                }
                PrivacyRule::AllowChatMembers(owners) | PrivacyRule::RestrictChatMembers(owners) => {
                    for owner in owners {
                        dependencies.add_owner(*owner);
                    }
                }
                PrivacyRule::AllowAll | PrivacyRule::AllowContacts | PrivacyRule::AllowCloseFriends => {}
            }
        }
    }

    /// Visibility flags implied by the rules
    pub fn visibility(&self) -> StoryVisibility {
        let mut visibility = StoryVisibility::default();
        for rule in &self.0 {
            match rule {
                PrivacyRule::AllowAll => visibility.is_public = true,
                PrivacyRule::AllowContacts => visibility.is_for_contacts = true,
                PrivacyRule::AllowCloseFriends => visibility.is_for_close_friends = true,
                PrivacyRule::AllowUsers(_) | PrivacyRule::AllowChatMembers(_) => {
                    visibility.is_for_selected_contacts = true
                }
                PrivacyRule::RestrictUsers(_) | PrivacyRule::RestrictChatMembers(_) => {}
            }
        }
        visibility
    }
}

/// User-facing privacy choice for a new or existing story
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoryPrivacySettings {
    Everyone { except: Vec<UserId> },
    Contacts { except: Vec<UserId> },
    CloseFriends,
    SelectedUsers { users: Vec<UserId> },
}

impl StoryPrivacySettings {
    /// Lower the setting to a rule set the server understands
    pub fn to_rules(&self) -> PrivacyRules {
        let rules = match self {
            StoryPrivacySettings::Everyone { except } => {
                let mut rules = Vec::new();
                if !except.is_empty() {
                    rules.push(PrivacyRule::RestrictUsers(except.clone()));
                }
                rules.push(PrivacyRule::AllowAll);
                rules
            }
            StoryPrivacySettings::Contacts { except } => {
                let mut rules = Vec::new();
                if !except.is_empty() {
                    rules.push(PrivacyRule::RestrictUsers(except.clone()));
                }
                rules.push(PrivacyRule::AllowContacts);
                rules
            }
            StoryPrivacySettings::CloseFriends => vec![PrivacyRule::AllowCloseFriends],
            StoryPrivacySettings::SelectedUsers { users } => {
                vec![PrivacyRule::AllowUsers(users.clone())]
            }
        };
        PrivacyRules(rules)
    }
}

/// Visibility flags stored on a story
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryVisibility {
    pub is_public: bool,
    pub is_for_close_friends: bool,
    pub is_for_contacts: bool,
    pub is_for_selected_contacts: bool,
}

/// View counters of a story
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionInfo {
    pub view_count: u32,
    pub recent_viewers: Vec<UserId>,
}

impl InteractionInfo {
    pub fn is_empty(&self) -> bool {
        self.view_count == 0 && self.recent_viewers.is_empty()
    }

    /// True when every viewer is listed and `user` is not one of them
    pub fn definitely_lacks_viewer(&self, user: UserId) -> bool {
        self.view_count as usize == self.recent_viewers.len() && !self.recent_viewers.contains(&user)
    }

    pub fn add_dependencies(&self, dependencies: &mut Dependencies) {
        for user in &self.recent_viewers {
            dependencies.add_user(*user);
        }
    }
}

/// A cached story
///
/// `global_id` and `is_update_sent` are process-local and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub date: DateTime<Utc>,
    pub expire_date: DateTime<Utc>,
    pub receive_date: DateTime<Utc>,
    pub is_edited: bool,
    pub is_pinned: bool,
    pub is_public: bool,
    pub is_for_close_friends: bool,
    pub is_for_contacts: bool,
    pub is_for_selected_contacts: bool,
    pub noforwards: bool,
    pub interaction_info: InteractionInfo,
    pub privacy_rules: PrivacyRules,
    /// `None` while only a skipped placeholder is known
    pub content: Option<StoryContent>,
    pub caption: Caption,
    #[serde(skip)]
    pub global_id: Option<StoryGlobalId>,
    #[serde(skip)]
    pub is_update_sent: bool,
}

impl Story {
    /// A story with only its dates known
    pub fn placeholder(date: DateTime<Utc>, expire_date: DateTime<Utc>, receive_date: DateTime<Utc>) -> Self {
        Self {
            date,
            expire_date,
            receive_date,
            is_edited: false,
            is_pinned: false,
            is_public: false,
            is_for_close_friends: false,
            is_for_contacts: false,
            is_for_selected_contacts: false,
            noforwards: false,
            interaction_info: InteractionInfo::default(),
            privacy_rules: PrivacyRules::default(),
            content: None,
            caption: Caption::default(),
            global_id: None,
            is_update_sent: false,
        }
    }

    /// Whether the story is still within its active period at `now`
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expire_date
    }

    /// Whether the full content has been received
    pub fn is_loaded(&self) -> bool {
        self.content.is_some()
    }

    pub fn apply_visibility(&mut self, visibility: StoryVisibility) {
        self.is_public = visibility.is_public;
        self.is_for_close_friends = visibility.is_for_close_friends;
        self.is_for_contacts = visibility.is_for_contacts;
        self.is_for_selected_contacts = visibility.is_for_selected_contacts;
    }

    pub fn file_ids(&self) -> Vec<FileId> {
        self.content
            .as_ref()
            .map(StoryContent::file_ids)
            .unwrap_or_default()
    }

    pub fn info(&self, story_id: StoryId) -> StoryInfo {
        StoryInfo {
            story_id,
            date: self.date,
            expire_date: self.expire_date,
            is_for_close_friends: self.is_for_close_friends,
        }
    }

    /// Collect the users and conversations this story refers to
    pub fn add_dependencies(&self, dependencies: &mut Dependencies) {
        self.privacy_rules.add_dependencies(dependencies);
        self.interaction_info.add_dependencies(dependencies);
        for user in &self.caption.mentions {
            dependencies.add_user(*user);
        }
    }
}

/// Lightweight projection kept in active-story snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryInfo {
    pub story_id: StoryId,
    pub date: DateTime<Utc>,
    pub expire_date: DateTime<Utc>,
    pub is_for_close_friends: bool,
}

/// Build a UTC timestamp from unix seconds, saturating on out-of-range input
pub fn unix_time(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_viewer_absence_needs_a_complete_list() {
        let info = InteractionInfo {
            view_count: 2,
            recent_viewers: vec![UserId(7), UserId(8)],
        };
        assert!(info.definitely_lacks_viewer(UserId(9)));
        assert!(!info.definitely_lacks_viewer(UserId(7)));

        let partial = InteractionInfo {
            view_count: 5,
            ..info
        };
        assert!(!partial.definitely_lacks_viewer(UserId(9)));
    }

    fn photo() -> StoryContent {
        StoryContent::Photo(PhotoContent {
            file_id: FileId(5),
            width: 1080,
            height: 1920,
        })
    }

    #[test]
    fn test_privacy_settings_lowering() {
        let rules = StoryPrivacySettings::Everyone {
            except: vec![UserId(3)],
        }
        .to_rules();
        assert_eq!(
            rules.rules(),
            &[
                PrivacyRule::RestrictUsers(vec![UserId(3)]),
                PrivacyRule::AllowAll
            ]
        );
        assert!(rules.visibility().is_public);

        let visibility = StoryPrivacySettings::CloseFriends.to_rules().visibility();
        assert!(visibility.is_for_close_friends);
        assert!(!visibility.is_public);
    }

    #[test]
    fn test_dependencies_cover_rules_mentions_and_viewers() {
        let mut story = Story::placeholder(unix_time(10), unix_time(100), unix_time(10));
        story.privacy_rules = PrivacyRules(vec![
            PrivacyRule::AllowUsers(vec![UserId(1)]),
            PrivacyRule::RestrictChatMembers(vec![OwnerId(-5)]),
        ]);
        story.caption.mentions.push(UserId(2));
        story.interaction_info.recent_viewers.push(UserId(4));

        let mut deps = Dependencies::new();
        story.add_dependencies(&mut deps);
        assert!(deps.users().contains(&UserId(1)));
        assert!(deps.users().contains(&UserId(2)));
        assert!(deps.users().contains(&UserId(4)));
        assert!(deps.owners().contains(&OwnerId(-5)));
    }

    #[test]
    fn test_story_activity_window() {
        let story = Story::placeholder(unix_time(10), unix_time(100), unix_time(10));
        assert!(story.is_active(unix_time(99)));
        assert!(!story.is_active(unix_time(100)));
        assert!(!story.is_loaded());
    }

    #[test]
    fn test_content_files_and_duration() {
        assert_eq!(photo().file_ids(), vec![FileId(5)]);
        assert_eq!(photo().duration_secs(), None);
        let video = StoryContent::Video(VideoContent {
            file_id: FileId(6),
            duration_secs: 12.5,
            width: 720,
            height: 1280,
        });
        assert_eq!(video.duration_secs(), Some(12.5));
        assert!(StoryContent::Unsupported { version: 2 }.main_file_id().is_none());
    }

    #[test]
    fn test_process_local_fields_not_persisted() {
        let mut story = Story::placeholder(unix_time(10), unix_time(100), unix_time(10));
        story.content = Some(photo());
        story.global_id = Some(StoryGlobalId(9));
        story.is_update_sent = true;

        let bytes = postcard::to_allocvec(&story).unwrap();
        let decoded: Story = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.global_id, None);
        assert!(!decoded.is_update_sent);
        assert_eq!(decoded.content, story.content);
    }
}
