//! Active-story ordering
//!
//! Per-owner active story lists and the two global [`StoryList`]s. An owner
//! sits in at most one list, keyed by [`OrderKey`]. Owners whose key lies
//! beyond the loaded part of a list are reported with order 0 until
//! pagination reaches them.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use ephemera_core::{OwnerId, RemoteStoryItem, StoryFullId, StoryId, StoryInfo, StoryListId};
use ephemera_storage::{RecordKey, RecordTable, StoryDatabase};

use crate::cache::StoryCache;
use crate::error::StoryResult;
use crate::promise::Promise;

const UNREAD_BIT: i64 = 1 << 33;
const SELF_OWNER_BIT: i64 = 1 << 34;

/// Active stories of one owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveStories {
    pub max_read_story_id: StoryId,
    /// Newest first
    pub story_ids: Vec<StoryId>,
    pub list: Option<StoryListId>,
    /// Always current while the owner has active stories
    pub private_order: i64,
    /// Zero unless the owner is in the main list
    pub public_order: i64,
}

impl ActiveStories {
    /// Key used inside the owner's list
    pub fn list_order(&self) -> i64 {
        match self.list {
            Some(StoryListId::Main) => self.public_order,
            Some(StoryListId::Archive) => self.private_order,
            None => 0,
        }
    }
}

/// Position of an owner in a list
///
/// Sorts by descending order, ties broken by descending owner, so two owners
/// never compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderKey {
    pub order: i64,
    pub owner: OwnerId,
}

impl Ord for OrderKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .order
            .cmp(&self.order)
            .then_with(|| other.owner.cmp(&self.owner))
    }
}

impl PartialOrd for OrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Where an active-story update comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveSource {
    /// Live change: send, expiry, read mark, per-owner reload
    Live,
    /// A page of the global list from the server
    ServerPage,
    /// A persisted snapshot; superseded by anything else
    Database,
}

/// Persisted pagination state of a list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryListState {
    pub state: String,
    pub total_count: i32,
    pub has_more: bool,
}

/// Persisted active stories of an owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveStoriesSnapshot {
    pub max_read_story_id: StoryId,
    pub list: Option<StoryListId>,
    pub order: i64,
    pub stories: Vec<StoryInfo>,
}

/// What listeners see for an owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveStoriesView {
    pub owner: OwnerId,
    pub list: Option<StoryListId>,
    pub order: i64,
    pub max_read_story_id: StoryId,
    pub stories: Vec<StoryInfo>,
}

/// One of the two global lists
#[derive(Debug)]
pub struct StoryList {
    /// Server continuation token, empty before the first load
    pub state: String,
    /// -1 while unknown
    pub server_total_count: i32,
    /// Last published total, -1 if none
    pub sent_total_count: i32,
    pub server_has_more: bool,
    pub database_has_more: bool,
    ordered: BTreeSet<OrderKey>,
    pub last_loaded_database_key: Option<OrderKey>,
    /// Furthest key loaded so far
    pub boundary: Option<OrderKey>,
    pub pending_loads: Vec<Promise<()>>,
    pub server_load_in_flight: bool,
}

impl Default for StoryList {
    fn default() -> Self {
        Self {
            state: String::new(),
            server_total_count: -1,
            sent_total_count: -1,
            server_has_more: true,
            database_has_more: true,
            ordered: BTreeSet::new(),
            last_loaded_database_key: None,
            boundary: None,
            pending_loads: Vec::new(),
            server_load_in_flight: false,
        }
    }
}

impl StoryList {
    pub fn is_fully_loaded(&self) -> bool {
        !self.server_has_more
    }

    /// Whether pagination has nothing left to offer
    pub fn is_exhausted(&self) -> bool {
        !self.server_has_more && !self.database_has_more
    }

    pub fn is_visible(&self, key: &OrderKey) -> bool {
        self.is_fully_loaded() || self.boundary.is_some_and(|boundary| *key <= boundary)
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Owners in list order
    pub fn owners(&self) -> impl Iterator<Item = OwnerId> + '_ {
        self.ordered.iter().map(|key| key.owner)
    }

    fn contains(&self, key: &OrderKey) -> bool {
        self.ordered.contains(key)
    }

    fn total_count(&self) -> Option<u32> {
        let loaded = self.ordered.len() as i32;
        if self.is_fully_loaded() {
            Some(loaded as u32)
        } else if self.server_total_count < 0 {
            None
        } else {
            Some(self.server_total_count.max(loaded) as u32)
        }
    }

    fn visible_owners(&self) -> HashSet<OwnerId> {
        self.ordered
            .iter()
            .filter(|key| self.is_visible(key))
            .map(|key| key.owner)
            .collect()
    }
}

/// Per-owner active stories and the global lists
pub struct ActiveStoryIndex {
    active: HashMap<OwnerId, ActiveStories>,
    /// Survives the owner running out of active stories
    max_read: HashMap<OwnerId, StoryId>,
    hidden: HashSet<OwnerId>,
    /// Owners known only from persisted snapshots
    database_owners: HashSet<OwnerId>,
    lists: [StoryList; 2],
    self_owner: OwnerId,
    database: Arc<dyn StoryDatabase>,
}

impl ActiveStoryIndex {
    pub fn new(self_owner: OwnerId, database: Arc<dyn StoryDatabase>) -> Self {
        Self {
            active: HashMap::new(),
            max_read: HashMap::new(),
            hidden: HashSet::new(),
            database_owners: HashSet::new(),
            lists: [StoryList::default(), StoryList::default()],
            self_owner,
            database,
        }
    }

    /// Restore list pagination state
    pub fn load_list_states(&mut self) -> StoryResult<()> {
        for list in StoryListId::ALL {
            let key = RecordKey::StoryList(list);
            let Some(bytes) = self.database.get(&key)? else {
                continue;
            };
            match postcard::from_bytes::<StoryListState>(&bytes) {
                Ok(saved) => {
                    let story_list = &mut self.lists[list.index()];
                    story_list.state = saved.state;
                    story_list.server_total_count = saved.total_count;
                    story_list.server_has_more = saved.has_more;
                    debug!(list = %list, total = saved.total_count, "Restored story list state");
                }
                Err(e) => {
                    warn!(list = %list, error = %e, "Dropping corrupt story list state");
                    self.database.delete(&key)?;
                }
            }
        }
        Ok(())
    }

    pub fn save_list_state(&self, list: StoryListId) {
        let story_list = &self.lists[list.index()];
        let saved = StoryListState {
            state: story_list.state.clone(),
            total_count: story_list.server_total_count,
            has_more: story_list.server_has_more,
        };
        let result = postcard::to_allocvec(&saved)
            .map_err(|e| e.to_string())
            .and_then(|bytes| {
                self.database
                    .put(&RecordKey::StoryList(list), &bytes)
                    .map_err(|e| e.to_string())
            });
        if let Err(e) = result {
            warn!(list = %list, error = %e, "Failed to save story list state");
        }
    }

    pub fn get(&self, owner: OwnerId) -> Option<&ActiveStories> {
        self.active.get(&owner)
    }

    pub fn list(&self, list: StoryListId) -> &StoryList {
        &self.lists[list.index()]
    }

    pub fn list_mut(&mut self, list: StoryListId) -> &mut StoryList {
        &mut self.lists[list.index()]
    }

    pub fn is_hidden(&self, owner: OwnerId) -> bool {
        self.hidden.contains(&owner)
    }

    pub fn is_from_database(&self, owner: OwnerId) -> bool {
        self.database_owners.contains(&owner)
    }

    pub fn max_read_story_id(&self, owner: OwnerId) -> StoryId {
        self.max_read.get(&owner).copied().unwrap_or_default()
    }

    pub fn owners(&self) -> impl Iterator<Item = OwnerId> + '_ {
        self.active.keys().copied()
    }

    /// Order listeners see for an owner
    fn visible_order(&self, owner: OwnerId, active: &ActiveStories) -> i64 {
        let Some(list) = active.list else {
            return 0;
        };
        let key = OrderKey {
            order: active.list_order(),
            owner,
        };
        if self.lists[list.index()].is_visible(&key) {
            key.order
        } else {
            0
        }
    }

    pub fn view(&self, cache: &StoryCache, owner: OwnerId) -> ActiveStoriesView {
        match self.active.get(&owner) {
            Some(active) => ActiveStoriesView {
                owner,
                list: active.list,
                order: self.visible_order(owner, active),
                max_read_story_id: active.max_read_story_id,
                stories: active
                    .story_ids
                    .iter()
                    .filter_map(|id| {
                        cache
                            .get(StoryFullId::new(owner, *id))
                            .map(|story| story.info(*id))
                    })
                    .collect(),
            },
            None => ActiveStoriesView {
                owner,
                list: None,
                order: 0,
                max_read_story_id: self.max_read_story_id(owner),
                stories: Vec::new(),
            },
        }
    }

    fn compute_order(
        &self,
        owner: OwnerId,
        newest: DateTime<Utc>,
        story_ids: &[StoryId],
        max_read: StoryId,
    ) -> i64 {
        let mut order = newest.timestamp();
        if story_ids.iter().any(|id| *id > max_read) {
            order += UNREAD_BIT;
        }
        if owner == self.self_owner {
            order += SELF_OWNER_BIT;
        }
        order
    }

    /// Replace an owner's active stories
    ///
    /// Ids that are not cached, not server-assigned or no longer active are
    /// dropped. Returns whether anything listeners can see changed.
    pub fn on_update_active_stories(
        &mut self,
        cache: &StoryCache,
        owner: OwnerId,
        max_read_story_id: StoryId,
        story_ids: &[StoryId],
        now: DateTime<Utc>,
        source: ActiveSource,
    ) -> bool {
        let before = self.view(cache, owner);

        let mut entries: Vec<(DateTime<Utc>, StoryId)> = story_ids
            .iter()
            .filter(|id| id.is_server())
            .filter_map(|id| {
                let story = cache.get(StoryFullId::new(owner, *id))?;
                story.is_active(now).then_some((story.date, *id))
            })
            .collect();
        entries.sort_unstable_by(|a, b| b.cmp(a));
        entries.dedup();
        let ids: Vec<StoryId> = entries.iter().map(|(_, id)| *id).collect();

        let max_read = self.max_read_story_id(owner).max(max_read_story_id);
        if max_read.is_server() {
            self.max_read.insert(owner, max_read);
        }

        let updated = entries.first().map(|(newest, _)| {
            let list = if self.hidden.contains(&owner) {
                StoryListId::Archive
            } else {
                StoryListId::Main
            };
            let private_order = self.compute_order(owner, *newest, &ids, max_read);
            ActiveStories {
                max_read_story_id: max_read,
                story_ids: ids,
                list: Some(list),
                private_order,
                public_order: if list == StoryListId::Main {
                    private_order
                } else {
                    0
                },
            }
        });

        let old_key = self.active.get(&owner).and_then(|active| {
            active.list.map(|list| {
                (
                    list,
                    OrderKey {
                        order: active.list_order(),
                        owner,
                    },
                )
            })
        });
        let new_key = updated.as_ref().and_then(|active| {
            active.list.map(|list| {
                (
                    list,
                    OrderKey {
                        order: active.list_order(),
                        owner,
                    },
                )
            })
        });
        self.reposition(old_key, new_key, source);

        match updated {
            Some(active) => {
                self.active.insert(owner, active);
            }
            None => {
                self.active.remove(&owner);
            }
        }
        if source == ActiveSource::Database {
            self.database_owners.insert(owner);
        } else {
            self.database_owners.remove(&owner);
        }

        let changed = before != self.view(cache, owner);
        if changed && source != ActiveSource::Database {
            self.save_snapshot(cache, owner);
        }
        trace!(owner = %owner, changed, ?source, "Updated active stories");
        changed
    }

    /// Move an owner between list positions in one step
    fn reposition(
        &mut self,
        old: Option<(StoryListId, OrderKey)>,
        new: Option<(StoryListId, OrderKey)>,
        source: ActiveSource,
    ) {
        if old == new {
            return;
        }
        let counted = source != ActiveSource::Database;
        if let Some((list, key)) = old {
            let story_list = &mut self.lists[list.index()];
            story_list.ordered.remove(&key);
            let leaves = new.is_none_or(|(new_list, _)| new_list != list);
            if counted && leaves && story_list.server_total_count > 0 {
                story_list.server_total_count -= 1;
            }
        }
        if let Some((list, key)) = new {
            let story_list = &mut self.lists[list.index()];
            let joins = old.is_none_or(|(old_list, _)| old_list != list);
            if counted && joins && story_list.server_total_count >= 0 {
                story_list.server_total_count += 1;
            }
            story_list.ordered.insert(key);
        }
    }

    /// Recompute an owner from its current ids, dropping expired stories
    pub fn refresh(&mut self, cache: &StoryCache, owner: OwnerId, now: DateTime<Utc>) -> bool {
        let Some(active) = self.active.get(&owner) else {
            return false;
        };
        let ids = active.story_ids.clone();
        let max_read = active.max_read_story_id;
        self.on_update_active_stories(cache, owner, max_read, &ids, now, ActiveSource::Live)
    }

    /// Add a newly committed story
    pub fn add_story(&mut self, cache: &StoryCache, id: StoryFullId, now: DateTime<Utc>) -> bool {
        let (mut ids, max_read) = match self.active.get(&id.owner) {
            Some(active) => (active.story_ids.clone(), active.max_read_story_id),
            None => (Vec::new(), self.max_read_story_id(id.owner)),
        };
        ids.push(id.story_id);
        self.on_update_active_stories(cache, id.owner, max_read, &ids, now, ActiveSource::Live)
    }

    pub fn remove_story(&mut self, cache: &StoryCache, id: StoryFullId, now: DateTime<Utc>) -> bool {
        let Some(active) = self.active.get(&id.owner) else {
            return false;
        };
        if !active.story_ids.contains(&id.story_id) {
            return false;
        }
        let ids: Vec<StoryId> = active
            .story_ids
            .iter()
            .copied()
            .filter(|story_id| *story_id != id.story_id)
            .collect();
        let max_read = active.max_read_story_id;
        self.on_update_active_stories(cache, id.owner, max_read, &ids, now, ActiveSource::Live)
    }

    /// Raise the read mark; lower marks are ignored
    pub fn on_update_read_stories(
        &mut self,
        cache: &StoryCache,
        owner: OwnerId,
        max_read_story_id: StoryId,
        now: DateTime<Utc>,
    ) -> bool {
        if max_read_story_id <= self.max_read_story_id(owner) {
            return false;
        }
        match self.active.get(&owner) {
            Some(active) => {
                let ids = active.story_ids.clone();
                self.on_update_active_stories(
                    cache,
                    owner,
                    max_read_story_id,
                    &ids,
                    now,
                    ActiveSource::Live,
                )
            }
            None => {
                self.max_read.insert(owner, max_read_story_id);
                false
            }
        }
    }

    /// Hide an owner from the main list or bring it back
    pub fn set_hidden(
        &mut self,
        cache: &StoryCache,
        owner: OwnerId,
        hidden: bool,
        now: DateTime<Utc>,
    ) -> bool {
        let toggled = if hidden {
            self.hidden.insert(owner)
        } else {
            self.hidden.remove(&owner)
        };
        if !toggled {
            return false;
        }
        debug!(owner = %owner, hidden, "Story visibility toggled");
        self.refresh(cache, owner, now)
    }

    /// Follow the list a server page filed an owner under
    ///
    /// An archive page hides the owner, a main page shows it again. Takes
    /// effect on the owner's next update.
    pub fn on_server_list(&mut self, owner: OwnerId, list: StoryListId) {
        let changed = match list {
            StoryListId::Archive => self.hidden.insert(owner),
            StoryListId::Main => self.hidden.remove(&owner),
        };
        if changed {
            debug!(owner = %owner, list = %list, "Owner moved by server list page");
        }
    }

    /// Move a list boundary further down; returns owners that became visible
    pub fn advance_boundary(
        &mut self,
        list: StoryListId,
        last: Option<OrderKey>,
        has_more: Option<bool>,
    ) -> Vec<OwnerId> {
        let story_list = &mut self.lists[list.index()];
        let before = story_list.visible_owners();
        if let Some(last) = last
            && story_list.boundary.is_none_or(|boundary| last > boundary)
        {
            story_list.boundary = Some(last);
        }
        if let Some(has_more) = has_more {
            story_list.server_has_more = has_more;
        }
        let mut revealed: Vec<OwnerId> = story_list
            .visible_owners()
            .difference(&before)
            .copied()
            .collect();
        revealed.sort();
        revealed
    }

    /// List key of an owner, if it is in a list
    pub fn key_of(&self, owner: OwnerId) -> Option<(StoryListId, OrderKey)> {
        let active = self.active.get(&owner)?;
        let list = active.list?;
        let key = OrderKey {
            order: active.list_order(),
            owner,
        };
        self.lists[list.index()].contains(&key).then_some((list, key))
    }

    /// Load the next page of persisted snapshots of a list
    ///
    /// Owners already known from the server or from live updates are left
    /// alone. Returns the owners loaded.
    pub fn load_database_page(
        &mut self,
        cache: &mut StoryCache,
        list: StoryListId,
        page_size: usize,
        now: DateTime<Utc>,
    ) -> StoryResult<Vec<OwnerId>> {
        let after = self.lists[list.index()].last_loaded_database_key;
        let mut page: Vec<(OrderKey, ActiveStoriesSnapshot)> = Vec::new();
        for (key_bytes, value) in self.database.scan(RecordTable::ActiveStories)? {
            let key = match RecordKey::from_bytes(RecordTable::ActiveStories, &key_bytes) {
                Ok(key) => key,
                Err(e) => {
                    warn!(error = %e, "Skipping active stories record with bad key");
                    continue;
                }
            };
            let RecordKey::ActiveStories(owner) = key else {
                continue;
            };
            let snapshot = match postcard::from_bytes::<ActiveStoriesSnapshot>(&value) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(owner = %owner, error = %e, "Dropping corrupt active stories snapshot");
                    self.database.delete(&key)?;
                    continue;
                }
            };
            if snapshot.list != Some(list) {
                continue;
            }
            let order_key = OrderKey {
                order: snapshot.order,
                owner,
            };
            if after.is_some_and(|after| order_key <= after) {
                continue;
            }
            page.push((order_key, snapshot));
        }
        page.sort_by(|a, b| a.0.cmp(&b.0));
        let exhausted = page.len() <= page_size;
        page.truncate(page_size);

        let mut loaded = Vec::new();
        let mut last = None;
        for (order_key, snapshot) in page {
            last = Some(order_key);
            let owner = order_key.owner;
            if self.active.contains_key(&owner) && !self.database_owners.contains(&owner) {
                continue;
            }
            let mut story_ids = Vec::with_capacity(snapshot.stories.len());
            for info in &snapshot.stories {
                let id = StoryFullId::new(owner, info.story_id);
                if !cache.have_story_force(id) {
                    cache.on_get_story(
                        owner,
                        RemoteStoryItem::Skipped {
                            id: info.story_id,
                            date: info.date,
                            expire_date: info.expire_date,
                            is_for_close_friends: info.is_for_close_friends,
                        },
                        now,
                    );
                }
                story_ids.push(info.story_id);
            }
            if list == StoryListId::Archive {
                self.hidden.insert(owner);
            }
            self.on_update_active_stories(
                cache,
                owner,
                snapshot.max_read_story_id,
                &story_ids,
                now,
                ActiveSource::Database,
            );
            loaded.push(owner);
        }

        let story_list = &mut self.lists[list.index()];
        if last.is_some() {
            story_list.last_loaded_database_key = last;
        }
        if exhausted {
            story_list.database_has_more = false;
        }
        debug!(list = %list, loaded = loaded.len(), exhausted, "Loaded story list page from database");
        Ok(loaded)
    }

    fn save_snapshot(&self, cache: &StoryCache, owner: OwnerId) {
        let key = RecordKey::ActiveStories(owner);
        let result = match self.active.get(&owner) {
            Some(active) => {
                let snapshot = ActiveStoriesSnapshot {
                    max_read_story_id: active.max_read_story_id,
                    list: active.list,
                    order: active.list_order(),
                    stories: self.view(cache, owner).stories,
                };
                postcard::to_allocvec(&snapshot)
                    .map_err(|e| e.to_string())
                    .and_then(|bytes| self.database.put(&key, &bytes).map_err(|e| e.to_string()))
            }
            None => self.database.delete(&key).map(|_| ()).map_err(|e| e.to_string()),
        };
        if let Err(e) = result {
            warn!(owner = %owner, error = %e, "Failed to persist active stories");
        }
    }

    /// List totals that changed since last published
    pub fn take_count_updates(&mut self) -> Vec<(StoryListId, u32)> {
        let mut updates = Vec::new();
        for list in StoryListId::ALL {
            let story_list = &mut self.lists[list.index()];
            let Some(total) = story_list.total_count() else {
                continue;
            };
            if story_list.sent_total_count != total as i32 {
                story_list.sent_total_count = total as i32;
                updates.push((list, total));
            }
        }
        updates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ephemera_core::{Story, StoryGlobalId, unix_time};
    use ephemera_storage::InMemoryStoryDatabase;

    const OWNER: OwnerId = OwnerId(5);
    const SELF: OwnerId = OwnerId(1);

    struct Fixture {
        cache: StoryCache,
        index: ActiveStoryIndex,
        db: Arc<InMemoryStoryDatabase>,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(InMemoryStoryDatabase::new());
        Fixture {
            cache: StoryCache::new(db.clone()),
            index: ActiveStoryIndex::new(SELF, db.clone()),
            db,
        }
    }

    fn add(f: &mut Fixture, owner: OwnerId, id: i32, date: i64) {
        let story = Story::placeholder(unix_time(date), unix_time(date + 1000), unix_time(date));
        f.cache.insert(StoryFullId::new(owner, StoryId(id)), story);
    }

    fn ids(f: &Fixture, owner: OwnerId) -> Vec<i32> {
        f.index
            .get(owner)
            .map(|active| active.story_ids.iter().map(|id| id.0).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_story_ids_sorted_newest_first() {
        let mut f = fixture();
        add(&mut f, OWNER, 1, 100);
        add(&mut f, OWNER, 2, 200);
        let changed = f.index.on_update_active_stories(
            &f.cache,
            OWNER,
            StoryId(0),
            &[StoryId(2), StoryId(1)],
            unix_time(150),
            ActiveSource::Live,
        );
        assert!(changed);
        assert_eq!(ids(&f, OWNER), vec![2, 1]);

        // Unordered input with duplicates and a local id
        f.index.on_update_active_stories(
            &f.cache,
            OWNER,
            StoryId(0),
            &[StoryId(1), StoryId(2), StoryId(1), StoryId(0)],
            unix_time(150),
            ActiveSource::Live,
        );
        assert_eq!(ids(&f, OWNER), vec![2, 1]);
    }

    #[test]
    fn test_same_date_breaks_ties_by_id() {
        let mut f = fixture();
        add(&mut f, OWNER, 3, 100);
        add(&mut f, OWNER, 7, 100);
        f.index.on_update_active_stories(
            &f.cache,
            OWNER,
            StoryId(0),
            &[StoryId(3), StoryId(7)],
            unix_time(100),
            ActiveSource::Live,
        );
        assert_eq!(ids(&f, OWNER), vec![7, 3]);
    }

    #[test]
    fn test_order_key_bits() {
        let mut f = fixture();
        add(&mut f, OWNER, 1, 100);
        add(&mut f, SELF, 1, 100);
        f.index.on_update_active_stories(&f.cache, OWNER, StoryId(0), &[StoryId(1)], unix_time(100), ActiveSource::Live);
        f.index.on_update_active_stories(&f.cache, SELF, StoryId(1), &[StoryId(1)], unix_time(100), ActiveSource::Live);

        let other = f.index.get(OWNER).unwrap();
        assert_eq!(other.private_order, 100 + UNREAD_BIT);
        assert_eq!(other.public_order, other.private_order);
        let own = f.index.get(SELF).unwrap();
        assert_eq!(own.private_order, 100 + SELF_OWNER_BIT);

        // Reading clears the unread bit
        assert!(f.index.on_update_read_stories(&f.cache, OWNER, StoryId(1), unix_time(100)));
        assert_eq!(f.index.get(OWNER).unwrap().private_order, 100);
        // Read marks never move back
        assert!(!f.index.on_update_read_stories(&f.cache, OWNER, StoryId(0), unix_time(100)));
    }

    #[test]
    fn test_hidden_owner_keeps_private_order() {
        let mut f = fixture();
        add(&mut f, OWNER, 1, 100);
        f.index.on_update_active_stories(&f.cache, OWNER, StoryId(1), &[StoryId(1)], unix_time(100), ActiveSource::Live);
        assert_eq!(f.index.list(StoryListId::Main).len(), 1);

        assert!(f.index.set_hidden(&f.cache, OWNER, true, unix_time(100)));
        let active = f.index.get(OWNER).unwrap();
        assert_eq!(active.list, Some(StoryListId::Archive));
        assert_eq!(active.private_order, 100);
        assert_eq!(active.public_order, 0);
        assert!(f.index.list(StoryListId::Main).is_empty());
        assert_eq!(f.index.list(StoryListId::Archive).len(), 1);

        assert!(!f.index.set_hidden(&f.cache, OWNER, true, unix_time(100)));
        f.index.set_hidden(&f.cache, OWNER, false, unix_time(100));
        assert_eq!(f.index.get(OWNER).unwrap().public_order, 100);
        assert!(f.index.list(StoryListId::Archive).is_empty());
    }

    #[test]
    fn test_reposition_never_duplicates_owner() {
        let mut f = fixture();
        for (id, date) in [(1, 100), (2, 300), (3, 200)] {
            add(&mut f, OWNER, id, date);
        }
        for ids in [vec![1], vec![1, 2], vec![1, 2, 3], vec![3]] {
            let ids: Vec<StoryId> = ids.into_iter().map(StoryId).collect();
            f.index.on_update_active_stories(&f.cache, OWNER, StoryId(9), &ids, unix_time(100), ActiveSource::Live);
            assert_eq!(f.index.list(StoryListId::Main).len(), 1);
        }
        let key = f.index.key_of(OWNER).unwrap().1;
        assert_eq!(key.order, 200);
    }

    #[test]
    fn test_expired_stories_drop_out_once() {
        let mut f = fixture();
        add(&mut f, OWNER, 1, 100);
        add(&mut f, OWNER, 2, 500);
        f.index.on_update_active_stories(&f.cache, OWNER, StoryId(0), &[StoryId(1), StoryId(2)], unix_time(100), ActiveSource::Live);

        // Story 1 expires at 1100
        assert!(f.index.refresh(&f.cache, OWNER, unix_time(1200)));
        assert_eq!(ids(&f, OWNER), vec![2]);
        assert!(!f.index.refresh(&f.cache, OWNER, unix_time(1200)));

        assert!(f.index.refresh(&f.cache, OWNER, unix_time(1600)));
        assert!(f.index.get(OWNER).is_none());
        assert!(f.index.list(StoryListId::Main).is_empty());
    }

    #[test]
    fn test_boundary_hides_unloaded_owners() {
        let mut f = fixture();
        add(&mut f, OwnerId(10), 1, 300);
        add(&mut f, OwnerId(11), 1, 100);
        for owner in [OwnerId(10), OwnerId(11)] {
            f.index.on_update_active_stories(&f.cache, owner, StoryId(1), &[StoryId(1)], unix_time(100), ActiveSource::ServerPage);
        }
        assert_eq!(f.index.view(&f.cache, OwnerId(10)).order, 0);

        let first = f.index.key_of(OwnerId(10)).map(|(_, key)| key);
        let revealed = f.index.advance_boundary(StoryListId::Main, first, Some(true));
        assert_eq!(revealed, vec![OwnerId(10)]);
        assert_eq!(f.index.view(&f.cache, OwnerId(10)).order, 300);
        assert_eq!(f.index.view(&f.cache, OwnerId(11)).order, 0);

        let revealed = f.index.advance_boundary(StoryListId::Main, None, Some(false));
        assert_eq!(revealed, vec![OwnerId(11)]);
    }

    #[test]
    fn test_counts_published_only_on_change() {
        let mut f = fixture();
        f.index.list_mut(StoryListId::Main).server_total_count = 5;
        f.index.list_mut(StoryListId::Archive).server_total_count = 0;
        assert_eq!(
            f.index.take_count_updates(),
            vec![(StoryListId::Main, 5), (StoryListId::Archive, 0)]
        );
        assert!(f.index.take_count_updates().is_empty());

        add(&mut f, OWNER, 1, 100);
        f.index.on_update_active_stories(&f.cache, OWNER, StoryId(0), &[StoryId(1)], unix_time(100), ActiveSource::Live);
        assert_eq!(f.index.take_count_updates(), vec![(StoryListId::Main, 6)]);

        f.index.set_hidden(&f.cache, OWNER, true, unix_time(100));
        let updates = f.index.take_count_updates();
        assert!(updates.contains(&(StoryListId::Main, 5)));
        assert!(updates.contains(&(StoryListId::Archive, 1)));
    }

    #[test]
    fn test_database_page_is_superseded_by_server() {
        let mut f = fixture();
        add(&mut f, OWNER, 1, 100);
        add(&mut f, OwnerId(6), 1, 200);
        for owner in [OWNER, OwnerId(6)] {
            f.index.on_update_active_stories(&f.cache, owner, StoryId(0), &[StoryId(1)], unix_time(100), ActiveSource::Live);
        }
        assert_eq!(f.db.count(RecordTable::ActiveStories), 2);

        // Fresh process: snapshots only
        let mut cache = StoryCache::new(f.db.clone());
        let mut index = ActiveStoryIndex::new(SELF, f.db.clone());
        let loaded = index
            .load_database_page(&mut cache, StoryListId::Main, 1, unix_time(100))
            .unwrap();
        assert_eq!(loaded, vec![OwnerId(6)]);
        assert!(index.is_from_database(OwnerId(6)));
        assert!(index.list(StoryListId::Main).database_has_more);

        let loaded = index
            .load_database_page(&mut cache, StoryListId::Main, 1, unix_time(100))
            .unwrap();
        assert_eq!(loaded, vec![OWNER]);
        let loaded = index
            .load_database_page(&mut cache, StoryListId::Main, 1, unix_time(100))
            .unwrap();
        assert!(loaded.is_empty());
        assert!(!index.list(StoryListId::Main).database_has_more);

        index.on_update_active_stories(&cache, OWNER, StoryId(1), &[StoryId(1)], unix_time(100), ActiveSource::ServerPage);
        assert!(!index.is_from_database(OWNER));
        assert_eq!(ids_of(&index, OWNER), vec![1]);
        assert!(cache.get(StoryFullId::new(OWNER, StoryId(1))).unwrap().global_id > Some(StoryGlobalId(0)));
    }

    fn ids_of(index: &ActiveStoryIndex, owner: OwnerId) -> Vec<i32> {
        index
            .get(owner)
            .map(|active| active.story_ids.iter().map(|id| id.0).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_corrupt_snapshot_is_dropped() {
        let mut f = fixture();
        f.db.put_raw(&RecordKey::ActiveStories(OWNER), vec![0xff, 0xff, 0xff]);
        let loaded = f
            .index
            .load_database_page(&mut f.cache, StoryListId::Main, 10, unix_time(0))
            .unwrap();
        assert!(loaded.is_empty());
        assert_eq!(f.db.count(RecordTable::ActiveStories), 0);
    }

    #[test]
    fn test_list_state_survives_restart() {
        let mut f = fixture();
        {
            let list = f.index.list_mut(StoryListId::Archive);
            list.state = "s1".into();
            list.server_total_count = 4;
            list.server_has_more = false;
        }
        f.index.save_list_state(StoryListId::Archive);

        let mut index = ActiveStoryIndex::new(SELF, f.db.clone());
        index.load_list_states().unwrap();
        let list = index.list(StoryListId::Archive);
        assert_eq!(list.state, "s1");
        assert_eq!(list.server_total_count, 4);
        assert!(list.is_fully_loaded());
        assert!(!index.list(StoryListId::Main).is_fully_loaded());
    }
}
