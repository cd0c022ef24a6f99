//! Identifiers used across the story engine
//!
//! Every identifier is a small `Copy` newtype so that the cache, the ordering
//! indices and the timeout wheels can key on them without borrowing entities.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::error::IdentityError;

/// Conversation or user a story belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub i64);

impl OwnerId {
    /// Owner identity of a user
    pub fn from_user(user_id: UserId) -> Self {
        Self(user_id.0)
    }

    /// Whether the identifier can refer to an existing owner
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }

    /// Owners with a positive identifier are users
    pub fn as_user(&self) -> Option<UserId> {
        (self.0 > 0).then_some(UserId(self.0))
    }

    /// Big-endian key bytes
    pub fn to_key_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Decode from big-endian key bytes
    pub fn from_key_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        let raw: [u8; 8] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidKeyLength {
                expected: 8,
                actual: bytes.len(),
            })?;
        Ok(Self(i64::from_be_bytes(raw)))
    }
}

impl Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user referenced by privacy rules, mentions or viewer lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub i64);

impl Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user{}", self.0)
    }
}

/// Story identifier, unique within an owner
///
/// Server-assigned identifiers are positive. Zero is the placeholder used by
/// stories that are still being sent.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct StoryId(pub i32);

impl StoryId {
    /// Placeholder for a story the server has not numbered yet
    pub const fn placeholder() -> Self {
        Self(0)
    }

    /// Whether the identifier was assigned by the server
    pub fn is_server(&self) -> bool {
        self.0 > 0
    }
}

impl Display for StoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique story identity: owner plus story id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StoryFullId {
    pub owner: OwnerId,
    pub story_id: StoryId,
}

impl StoryFullId {
    pub fn new(owner: OwnerId, story_id: StoryId) -> Self {
        Self { owner, story_id }
    }

    /// Whether both halves are usable
    pub fn is_server(&self) -> bool {
        self.owner.is_valid() && self.story_id.is_server()
    }

    /// 12-byte key: owner then story id, both big-endian
    pub fn to_key_bytes(&self) -> [u8; 12] {
        let mut bytes = [0u8; 12];
        bytes[..8].copy_from_slice(&self.owner.to_key_bytes());
        bytes[8..].copy_from_slice(&self.story_id.0.to_be_bytes());
        bytes
    }

    /// Decode from a 12-byte key
    pub fn from_key_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        if bytes.len() != 12 {
            return Err(IdentityError::InvalidKeyLength {
                expected: 12,
                actual: bytes.len(),
            });
        }
        let owner = OwnerId::from_key_bytes(&bytes[..8])?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&bytes[8..]);
        Ok(Self::new(owner, StoryId(i32::from_be_bytes(raw))))
    }
}

impl Display for StoryFullId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.owner, self.story_id)
    }
}

/// A message displaying a story inside a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageFullId {
    pub conversation: OwnerId,
    pub message_id: i64,
}

impl MessageFullId {
    pub fn new(conversation: OwnerId, message_id: i64) -> Self {
        Self {
            conversation,
            message_id,
        }
    }
}

impl Display for MessageFullId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.conversation, self.message_id)
    }
}

/// Process-local story sequence id used to key timeout wheels
///
/// Assigned when a story enters the cache and never reused for the lifetime
/// of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StoryGlobalId(pub u64);

impl Display for StoryGlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Local file handle known to the file transfer layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(pub u64);

impl Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file{}", self.0)
    }
}

/// Handle used by the file layer to re-fetch a story's file references
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileSourceId(pub u64);

/// The two global orderable story lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StoryListId {
    /// Stories of subscribed owners
    Main,
    /// Stories of owners the user chose to hide
    Archive,
}

impl StoryListId {
    pub const ALL: [StoryListId; 2] = [StoryListId::Main, StoryListId::Archive];

    pub fn index(self) -> usize {
        match self {
            StoryListId::Main => 0,
            StoryListId::Archive => 1,
        }
    }

    pub fn key_byte(self) -> u8 {
        self.index() as u8
    }

    pub fn from_key_byte(byte: u8) -> Result<Self, IdentityError> {
        match byte {
            0 => Ok(StoryListId::Main),
            1 => Ok(StoryListId::Archive),
            other => Err(IdentityError::InvalidFormat(format!(
                "unknown story list {other}"
            ))),
        }
    }
}

impl Display for StoryListId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoryListId::Main => write!(f, "main"),
            StoryListId::Archive => write!(f, "archive"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_story_full_id_key_roundtrip() {
        let id = StoryFullId::new(OwnerId(-1001), StoryId(42));
        let decoded = StoryFullId::from_key_bytes(&id.to_key_bytes()).unwrap();
        assert_eq!(id, decoded);
    }

    #[test]
    fn test_story_full_id_key_length_checked() {
        let err = StoryFullId::from_key_bytes(&[0u8; 5]).unwrap_err();
        assert!(matches!(
            err,
            IdentityError::InvalidKeyLength {
                expected: 12,
                actual: 5
            }
        ));
    }

    #[test]
    fn test_placeholder_is_not_server() {
        assert!(!StoryId::placeholder().is_server());
        assert!(StoryId(1).is_server());
        assert!(!StoryFullId::new(OwnerId(0), StoryId(3)).is_server());
    }

    #[test]
    fn test_owner_user_mapping() {
        assert_eq!(OwnerId(7).as_user(), Some(UserId(7)));
        assert_eq!(OwnerId(-7).as_user(), None);
        assert_eq!(OwnerId::from_user(UserId(9)), OwnerId(9));
    }

    #[test]
    fn test_story_list_key_byte() {
        for list in StoryListId::ALL {
            assert_eq!(StoryListId::from_key_byte(list.key_byte()).unwrap(), list);
        }
        assert!(StoryListId::from_key_byte(9).is_err());
    }
}
