//! Story entity cache
//!
//! Canonical in-memory store of stories keyed by [`StoryFullId`], with a
//! read-through path to the story database and the id-keyed side indices:
//!
//! - global id -> story, for timeout wheels
//! - story -> messages and message -> story, for preview invalidation
//! - story -> file source, for file reference refresh
//!
//! Cross-references are plain id sets. Either side can be torn down without
//! leaving anything dangling.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use ephemera_core::{
    Dependencies, FileSourceId, MessageFullId, OwnerId, RemoteStoryItem, Story, StoryFullId,
    StoryGlobalId, StoryItem,
};
use ephemera_storage::{RecordKey, RecordTable, StoryDatabase};

use crate::config::to_delta;
use crate::error::{StoryError, StoryResult};

/// What a merge did to the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    Full,
    Skipped,
    Deleted,
}

/// Result of merging a server item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    pub story_full_id: StoryFullId,
    pub kind: MergeKind,
    /// The story was not cached before
    pub is_new: bool,
    /// Listeners must be told
    pub notify: bool,
    /// The database copy is stale
    pub persist: bool,
    /// Date or expiry moved, so timeouts and orderings need a refresh
    pub dates_changed: bool,
    /// Some fields are still missing and a reload is worthwhile
    pub is_partial: bool,
}

impl MergeOutcome {
    fn new(story_full_id: StoryFullId, kind: MergeKind) -> Self {
        Self {
            story_full_id,
            kind,
            is_new: false,
            notify: false,
            persist: false,
            dates_changed: false,
            is_partial: false,
        }
    }
}

/// Canonical store of story entities
pub struct StoryCache {
    stories: HashMap<StoryFullId, Story>,
    by_global_id: HashMap<StoryGlobalId, StoryFullId>,
    max_global_id: u64,
    /// Wall-clock time a story became inaccessible
    inaccessible: HashMap<StoryFullId, DateTime<Utc>>,
    deleted: HashSet<StoryFullId>,
    failed_to_load: HashSet<StoryFullId>,
    story_messages: HashMap<StoryFullId, BTreeSet<MessageFullId>>,
    message_story: HashMap<MessageFullId, StoryFullId>,
    file_sources: HashMap<StoryFullId, FileSourceId>,
    next_file_source: u64,
    /// Stories given a global id since the last [`StoryCache::take_entered`]
    entered: Vec<StoryFullId>,
    database: Arc<dyn StoryDatabase>,
}

impl StoryCache {
    pub fn new(database: Arc<dyn StoryDatabase>) -> Self {
        Self {
            stories: HashMap::new(),
            by_global_id: HashMap::new(),
            max_global_id: 0,
            inaccessible: HashMap::new(),
            deleted: HashSet::new(),
            failed_to_load: HashSet::new(),
            story_messages: HashMap::new(),
            message_story: HashMap::new(),
            file_sources: HashMap::new(),
            next_file_source: 1,
            entered: Vec::new(),
            database,
        }
    }

    pub fn len(&self) -> usize {
        self.stories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stories.is_empty()
    }

    pub fn get(&self, id: StoryFullId) -> Option<&Story> {
        self.stories.get(&id)
    }

    pub fn get_editable(&mut self, id: StoryFullId) -> Option<&mut Story> {
        self.stories.get_mut(&id)
    }

    pub fn have_story(&self, id: StoryFullId) -> bool {
        self.stories.contains_key(&id)
    }

    /// Look in memory, then in the database
    ///
    /// Fails with `NotFound` if the story is absent everywhere. A record that
    /// does not decode is deleted and treated as absent.
    pub fn get_force(&mut self, id: StoryFullId) -> StoryResult<&Story> {
        if !self.stories.contains_key(&id) {
            if self.deleted.contains(&id) {
                return Err(StoryError::not_found(id.to_string()));
            }
            let story = self
                .load_from_database(id)?
                .ok_or_else(|| StoryError::not_found(id.to_string()))?;
            self.insert(id, story);
        }
        self.stories
            .get(&id)
            .ok_or_else(|| StoryError::not_found(id.to_string()))
    }

    pub fn have_story_force(&mut self, id: StoryFullId) -> bool {
        self.get_force(id).is_ok()
    }

    fn load_from_database(&self, id: StoryFullId) -> StoryResult<Option<Story>> {
        let key = RecordKey::Story(id);
        let Some(bytes) = self.database.get(&key)? else {
            return Ok(None);
        };
        match postcard::from_bytes::<Story>(&bytes) {
            Ok(story) => {
                trace!(story = %id, "Loaded story from database");
                Ok(Some(story))
            }
            Err(e) => {
                warn!(story = %id, error = %e, "Dropping corrupt story record");
                self.database.delete(&key)?;
                Ok(None)
            }
        }
    }

    /// Insert or replace a story, assigning a global id on first insertion
    pub fn insert(&mut self, id: StoryFullId, mut story: Story) -> StoryGlobalId {
        let global_id = match self.stories.get(&id).and_then(|old| old.global_id) {
            Some(global_id) => global_id,
            None => {
                self.max_global_id += 1;
                self.entered.push(id);
                StoryGlobalId(self.max_global_id)
            }
        };
        story.global_id = Some(global_id);
        self.by_global_id.insert(global_id, id);
        self.deleted.remove(&id);
        self.failed_to_load.remove(&id);
        self.stories.insert(id, story);
        global_id
    }

    /// Drain the stories that entered memory since the last call
    pub fn take_entered(&mut self) -> Vec<StoryFullId> {
        std::mem::take(&mut self.entered)
    }

    pub fn resolve_global_id(&self, global_id: StoryGlobalId) -> Option<StoryFullId> {
        self.by_global_id.get(&global_id).copied()
    }

    pub fn save(&self, id: StoryFullId) -> StoryResult<()> {
        let Some(story) = self.stories.get(&id) else {
            return Ok(());
        };
        let bytes =
            postcard::to_allocvec(story).map_err(|e| StoryError::Storage(e.to_string()))?;
        self.database.put(&RecordKey::Story(id), &bytes)?;
        Ok(())
    }

    /// Merge a server-provided story
    pub fn on_get_story(
        &mut self,
        owner: OwnerId,
        item: RemoteStoryItem,
        now: DateTime<Utc>,
    ) -> MergeOutcome {
        match item {
            RemoteStoryItem::Full(item) => self.merge_full(owner, item, now),
            RemoteStoryItem::Skipped {
                id,
                date,
                expire_date,
                is_for_close_friends,
            } => {
                let story_full_id = StoryFullId::new(owner, id);
                let mut outcome = MergeOutcome::new(story_full_id, MergeKind::Skipped);
                match self.stories.get_mut(&story_full_id) {
                    Some(story) => {
                        if story.date != date || story.expire_date != expire_date {
                            story.date = date;
                            story.expire_date = expire_date;
                            outcome.dates_changed = true;
                            outcome.persist = true;
                            outcome.notify = story.is_loaded();
                        }
                        if story.is_for_close_friends != is_for_close_friends {
                            story.is_for_close_friends = is_for_close_friends;
                            outcome.persist = true;
                            outcome.notify = story.is_loaded();
                        }
                        outcome.is_partial = !story.is_loaded();
                    }
                    None => {
                        let mut story = Story::placeholder(date, expire_date, now);
                        story.is_for_close_friends = is_for_close_friends;
                        self.insert(story_full_id, story);
                        outcome.is_new = true;
                        outcome.dates_changed = true;
                        outcome.is_partial = true;
                    }
                }
                outcome
            }
            RemoteStoryItem::Deleted { id } => {
                let story_full_id = StoryFullId::new(owner, id);
                let mut outcome = MergeOutcome::new(story_full_id, MergeKind::Deleted);
                outcome.notify = self.on_delete(story_full_id);
                outcome
            }
        }
    }

    fn merge_full(&mut self, owner: OwnerId, item: StoryItem, now: DateTime<Utc>) -> MergeOutcome {
        let story_full_id = StoryFullId::new(owner, item.id);
        let mut outcome = MergeOutcome::new(story_full_id, MergeKind::Full);
        self.inaccessible.remove(&story_full_id);
        outcome.is_partial = item.is_min;

        let Some(story) = self.stories.get_mut(&story_full_id) else {
            let mut story = Story::placeholder(item.date, item.expire_date, now);
            story.is_edited = item.is_edited;
            story.is_pinned = item.is_pinned;
            story.noforwards = item.noforwards;
            story.apply_visibility(item.visibility);
            story.content = Some(item.content);
            story.caption = item.caption;
            story.privacy_rules = item.privacy_rules.unwrap_or_default();
            story.interaction_info = item.interaction_info.unwrap_or_default();
            self.insert(story_full_id, story);

            outcome.is_new = true;
            outcome.notify = true;
            outcome.persist = true;
            outcome.dates_changed = true;
            return outcome;
        };

        let mut changed = false;
        if story.date != item.date || story.expire_date != item.expire_date {
            story.date = item.date;
            story.expire_date = item.expire_date;
            outcome.dates_changed = true;
            changed = true;
        }
        if story.is_edited != item.is_edited
            || story.is_pinned != item.is_pinned
            || story.noforwards != item.noforwards
        {
            story.is_edited = item.is_edited;
            story.is_pinned = item.is_pinned;
            story.noforwards = item.noforwards;
            changed = true;
        }
        let visibility = item.visibility;
        if story.is_public != visibility.is_public
            || story.is_for_close_friends != visibility.is_for_close_friends
            || story.is_for_contacts != visibility.is_for_contacts
            || story.is_for_selected_contacts != visibility.is_for_selected_contacts
        {
            story.apply_visibility(visibility);
            changed = true;
        }
        if story.content.as_ref() != Some(&item.content) {
            story.content = Some(item.content);
            changed = true;
        }
        if story.caption != item.caption {
            story.caption = item.caption;
            changed = true;
        }
        // Minimal items carry no privacy or interaction data
        if let Some(rules) = item.privacy_rules
            && story.privacy_rules != rules
        {
            story.privacy_rules = rules;
            changed = true;
        }
        if let Some(info) = item.interaction_info
            && story.interaction_info != info
        {
            story.interaction_info = info;
            changed = true;
        }

        if changed {
            outcome.notify = true;
            outcome.persist = true;
        }
        // Receive date is bookkeeping only
        if story.receive_date < now {
            story.receive_date = now;
            outcome.persist = true;
        }
        outcome
    }

    /// Remove a story for good; true only on the first call for that story
    pub fn on_delete(&mut self, id: StoryFullId) -> bool {
        if !self.deleted.insert(id) {
            return false;
        }
        self.inaccessible.remove(&id);
        if let Some(story) = self.stories.remove(&id)
            && let Some(global_id) = story.global_id
        {
            self.by_global_id.remove(&global_id);
        }
        if let Err(e) = self.database.delete(&RecordKey::Story(id)) {
            warn!(story = %id, error = %e, "Failed to delete story record");
        }
        debug!(story = %id, "Story deleted");
        true
    }

    pub fn is_deleted(&self, id: StoryFullId) -> bool {
        self.deleted.contains(&id)
    }

    /// Mark a cached story inaccessible; true only on the first call
    pub fn mark_inaccessible(&mut self, id: StoryFullId, now: DateTime<Utc>) -> bool {
        if !self.stories.contains_key(&id) || self.inaccessible.contains_key(&id) {
            return false;
        }
        self.inaccessible.insert(id, now);
        debug!(story = %id, "Story became inaccessible");
        true
    }

    pub fn is_inaccessible_story(&self, id: StoryFullId) -> bool {
        self.inaccessible.contains_key(&id)
    }

    pub fn mark_failed_to_load(&mut self, id: StoryFullId) {
        self.failed_to_load.insert(id);
    }

    pub fn is_failed_to_load(&self, id: StoryFullId) -> bool {
        self.failed_to_load.contains(&id)
    }

    /// Drop stories from memory
    ///
    /// Inaccessible stories past the grace period are deleted outright.
    /// Expired, unpinned stories nobody references are evicted from memory
    /// only. `keep` vetoes stories still in use elsewhere.
    pub fn collect_garbage(
        &mut self,
        now: DateTime<Utc>,
        grace: Duration,
        limit: usize,
        keep: impl Fn(StoryFullId) -> bool,
    ) -> Vec<StoryFullId> {
        let grace = to_delta(grace);
        let mut doomed: Vec<StoryFullId> = self
            .inaccessible
            .iter()
            .filter(|(id, since)| {
                now.signed_duration_since(**since) >= grace && !keep(**id)
            })
            .map(|(id, _)| *id)
            .collect();
        doomed.sort();
        doomed.truncate(limit);

        let mut evicted: Vec<StoryFullId> = self
            .stories
            .iter()
            .filter(|(id, story)| {
                !story.is_active(now)
                    && !story.is_pinned
                    && !self.inaccessible.contains_key(id)
                    && !self.story_messages.contains_key(id)
                    && !keep(**id)
            })
            .map(|(id, _)| *id)
            .collect();
        evicted.sort();
        evicted.truncate(limit.saturating_sub(doomed.len()));

        for id in &doomed {
            self.on_delete(*id);
        }
        for id in &evicted {
            if let Some(story) = self.stories.remove(id)
                && let Some(global_id) = story.global_id
            {
                self.by_global_id.remove(&global_id);
            }
        }

        if !doomed.is_empty() || !evicted.is_empty() {
            debug!(
                deleted = doomed.len(),
                evicted = evicted.len(),
                "Collected story garbage"
            );
        }
        doomed.extend(evicted);
        doomed
    }

    /// Delete expired, unpinned story records that are not in memory
    ///
    /// Stories still referenced by a message or vetoed by `keep` stay on
    /// disk. Returns the ids whose records were removed, at most `limit`.
    pub fn purge_expired_records(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        keep: impl Fn(StoryFullId) -> bool,
    ) -> StoryResult<Vec<StoryFullId>> {
        let mut purged = Vec::new();
        for (key_bytes, value) in self.database.scan(RecordTable::Stories)? {
            if purged.len() >= limit {
                break;
            }
            let Ok(RecordKey::Story(id)) = RecordKey::from_bytes(RecordTable::Stories, &key_bytes)
            else {
                continue;
            };
            if self.stories.contains_key(&id) || self.story_messages.contains_key(&id) || keep(id) {
                continue;
            }
            let expired = match postcard::from_bytes::<Story>(&value) {
                Ok(story) => !story.is_active(now) && !story.is_pinned,
                // Undecodable records are never readable again
                Err(_) => true,
            };
            if expired && self.database.delete(&RecordKey::Story(id))? {
                purged.push(id);
            }
        }
        if !purged.is_empty() {
            debug!(purged = purged.len(), "Purged expired story records");
        }
        Ok(purged)
    }

    // ------------------------------------------------------------------
    // Message registry
    // ------------------------------------------------------------------

    /// Record that a message displays a story
    pub fn register_story(&mut self, story: StoryFullId, message: MessageFullId) {
        if let Some(previous) = self.message_story.insert(message, story)
            && previous != story
        {
            self.detach_message(previous, message);
        }
        self.story_messages.entry(story).or_default().insert(message);
    }

    pub fn unregister_story(&mut self, story: StoryFullId, message: MessageFullId) {
        if self.message_story.get(&message) == Some(&story) {
            self.message_story.remove(&message);
        }
        self.detach_message(story, message);
    }

    fn detach_message(&mut self, story: StoryFullId, message: MessageFullId) {
        if let Some(messages) = self.story_messages.get_mut(&story) {
            messages.remove(&message);
            if messages.is_empty() {
                self.story_messages.remove(&story);
            }
        }
    }

    pub fn messages_of(&self, story: StoryFullId) -> Vec<MessageFullId> {
        self.story_messages
            .get(&story)
            .map(|messages| messages.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn story_of_message(&self, message: MessageFullId) -> Option<StoryFullId> {
        self.message_story.get(&message).copied()
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    /// Users and conversations the story refers to, its owner included
    pub fn add_story_dependencies(&self, dependencies: &mut Dependencies, id: StoryFullId) {
        dependencies.add_owner(id.owner);
        if let Some(story) = self.stories.get(&id) {
            story.add_dependencies(dependencies);
        }
    }

    /// File source of a story, assigned on first request
    pub fn get_story_file_source_id(&mut self, id: StoryFullId) -> Option<FileSourceId> {
        if !id.is_server() {
            return None;
        }
        let next = &mut self.next_file_source;
        Some(*self.file_sources.entry(id).or_insert_with(|| {
            let source = FileSourceId(*next);
            *next += 1;
            source
        }))
    }

    /// Playback duration of a cached video story
    pub fn get_story_duration(&self, id: StoryFullId) -> Option<f64> {
        self.stories
            .get(&id)?
            .content
            .as_ref()?
            .duration_secs()
    }

    /// Ids of cached stories of one owner
    pub fn story_ids_of(&self, owner: OwnerId) -> Vec<StoryFullId> {
        let mut ids: Vec<StoryFullId> = self
            .stories
            .keys()
            .filter(|id| id.owner == owner)
            .copied()
            .collect();
        ids.sort();
        ids
    }
}
