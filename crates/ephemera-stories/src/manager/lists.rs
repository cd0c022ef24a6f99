//! Story reloads, per-owner active stories and global list pagination

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use ephemera_core::{
    AllStories, OwnerId, OwnerStories, RemoteError, RemoteRequest, RemoteResponse, Story,
    StoryFullId, StoryId, StoryListId,
};
use ephemera_storage::LogEventId;

use super::{FoundStories, PendingQuery, StoryManager, expect_done};
use crate::active::{ActiveSource, ActiveStoriesView};
use crate::cache::MergeKind;
use crate::config::deadline_after;
use crate::error::{StoryError, StoryResult};
use crate::log_event::{LoadExpiringStoriesLogEvent, ReadStoriesOnServerLogEvent};
use crate::promise::{Promise, resolve_all};
use crate::upload::retry_delay;

impl StoryManager {
    /// Recompute an owner's active stories and publish if they changed
    pub(super) fn update_active(&mut self, owner: OwnerId, now: DateTime<Utc>) {
        if self.index.refresh(&self.cache, owner, now) {
            self.publish_active(owner);
        }
    }

    /// Merge an owner's stories and replace its active set
    ///
    /// `list` is the global list whose page carried the owner, if any.
    fn apply_owner_stories(
        &mut self,
        stories: OwnerStories,
        list: Option<StoryListId>,
        now: DateTime<Utc>,
        source: ActiveSource,
    ) -> bool {
        let owner = stories.owner;
        if let Some(list) = list {
            self.index.on_server_list(owner, list);
        }
        let mut story_ids = Vec::with_capacity(stories.items.len());
        for item in stories.items {
            let story_id = item.id();
            if self.merge_story(owner, item, now).kind != MergeKind::Deleted {
                story_ids.push(story_id);
            }
        }
        self.index.on_update_active_stories(
            &self.cache,
            owner,
            stories.max_read_story_id,
            &story_ids,
            now,
            source,
        )
    }

    // ------------------------------------------------------------------
    // Single story reloads
    // ------------------------------------------------------------------

    /// Fetch a story from the server; concurrent reloads share one request
    pub(super) fn reload_story(&mut self, id: StoryFullId, promise: Option<Promise<Story>>) {
        let state = self.reloads.entry(id).or_default();
        state.waiters.extend(promise);
        if state.in_flight {
            return;
        }
        state.in_flight = true;
        self.scheduler.reload_retry.cancel(id);
        self.issue(
            RemoteRequest::GetStoriesById {
                owner: id.owner,
                story_ids: vec![id.story_id],
            },
            PendingQuery::Reload { story_full_id: id },
        );
    }

    /// Re-issue a reload that failed transiently
    pub(super) fn retry_reload(&mut self, id: StoryFullId) {
        match self.reloads.get(&id) {
            Some(state) if !state.in_flight => self.reload_story(id, None),
            _ => {}
        }
    }

    pub(super) fn on_reload_result(
        &mut self,
        id: StoryFullId,
        result: Result<RemoteResponse, RemoteError>,
    ) {
        let now = self.now();
        let page = match result {
            Ok(RemoteResponse::Stories(page)) => page,
            Ok(other) => {
                warn!(story = %id, response = other.kind(), "Unexpected reload response");
                self.finish_reload(id, Err(RemoteError::UnexpectedResponse("get_stories_by_id").into()));
                return;
            }
            Err(e) if e.is_transient() => {
                let state = self.reloads.entry(id).or_default();
                state.in_flight = false;
                state.attempts += 1;
                let attempts = state.attempts;
                if attempts < self.config.cache.max_reload_attempts {
                    let delay = retry_delay(
                        attempts,
                        self.config.upload.retry_backoff_base,
                        self.config.upload.retry_backoff_max,
                    );
                    debug!(story = %id, attempts, error = %e, "Story reload failed, retrying");
                    self.scheduler.reload_retry.set(id, deadline_after(now, delay));
                } else {
                    self.cache.mark_failed_to_load(id);
                    self.finish_reload(id, Err(e.into()));
                }
                return;
            }
            Err(e) => {
                self.cache.mark_failed_to_load(id);
                self.finish_reload(id, Err(e.into()));
                return;
            }
        };

        let Some(item) = page.items.into_iter().find(|item| item.id() == id.story_id) else {
            // Missing from the answer: no longer accessible to us
            if self.cache.mark_inaccessible(id, now) {
                info!(story = %id, "Story is no longer accessible");
            }
            if self.index.remove_story(&self.cache, id, now) {
                self.publish_active(id.owner);
            }
            self.finish_reload(id, Err(StoryError::not_found(id.to_string())));
            return;
        };
        let outcome = self.merge_story(id.owner, item, now);
        let result = match self.cache.get(id) {
            Some(story) if outcome.kind != MergeKind::Deleted => Ok(story.clone()),
            _ => Err(StoryError::not_found(id.to_string())),
        };
        self.finish_reload(id, result);
    }

    fn finish_reload(&mut self, id: StoryFullId, result: StoryResult<Story>) {
        self.scheduler.reload_retry.cancel(id);
        if let Some(state) = self.reloads.remove(&id) {
            resolve_all(state.waiters, result);
        }
    }

    // ------------------------------------------------------------------
    // Active stories of one owner
    // ------------------------------------------------------------------

    /// Fetch an owner's active stories; concurrent loads share one request
    pub(super) fn load_expiring_stories(
        &mut self,
        owner: OwnerId,
        promise: Option<Promise<ActiveStoriesView>>,
        replayed: Option<LogEventId>,
    ) {
        if self.expiring_loads.contains_key(&owner) {
            // Superseded by the load already running
            self.remove_log_event(replayed);
            if let Some((waiters, _)) = self.expiring_loads.get_mut(&owner) {
                waiters.extend(promise);
            }
            return;
        }
        let log_event_id = match replayed {
            Some(id) => Some(id),
            None => match self.write_log_event(None, &LoadExpiringStoriesLogEvent { owner }) {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(owner = %owner, error = %e, "Failed to log active stories load");
                    None
                }
            },
        };
        self.expiring_loads
            .insert(owner, (promise.into_iter().collect(), log_event_id));
        self.issue(
            RemoteRequest::GetOwnerStories { owner },
            PendingQuery::OwnerStories { owner },
        );
    }

    pub(super) fn on_owner_stories_result(
        &mut self,
        owner: OwnerId,
        result: Result<RemoteResponse, RemoteError>,
    ) {
        let (waiters, log_event_id) = self.expiring_loads.remove(&owner).unwrap_or_default();
        match result {
            Ok(RemoteResponse::OwnerStories(stories)) => {
                let now = self.now();
                if stories.owner != owner {
                    warn!(owner = %owner, answered = %stories.owner, "Active stories for another owner");
                }
                let owner = stories.owner;
                if self.apply_owner_stories(stories, None, now, ActiveSource::Live) {
                    self.publish_active(owner);
                }
                self.remove_log_event(log_event_id);
                resolve_all(waiters, Ok(self.active_stories(owner)));
            }
            Ok(other) => {
                warn!(owner = %owner, response = other.kind(), "Unexpected active stories response");
                self.remove_log_event(log_event_id);
                resolve_all(
                    waiters,
                    Err(RemoteError::UnexpectedResponse("get_owner_stories").into()),
                );
            }
            Err(e) => {
                if !e.is_transient() {
                    self.remove_log_event(log_event_id);
                }
                warn!(owner = %owner, error = %e, "Failed to load active stories");
                resolve_all(waiters, Err(e.into()));
            }
        }
    }

    /// Raise the read mark locally and on the server
    pub(super) fn read_stories(&mut self, owner: OwnerId, story_id: StoryId, now: DateTime<Utc>) {
        if story_id <= self.index.max_read_story_id(owner) {
            return;
        }
        if self
            .index
            .on_update_read_stories(&self.cache, owner, story_id, now)
        {
            self.publish_active(owner);
        }
        let event = ReadStoriesOnServerLogEvent {
            owner,
            max_story_id: story_id,
        };
        let existing = self.read_log_events.get(&owner).map(|(id, _)| *id);
        match self.write_log_event(existing, &event) {
            Ok(log_event_id) => {
                self.read_log_events.insert(owner, (log_event_id, story_id));
            }
            Err(e) => warn!(owner = %owner, error = %e, "Failed to log read stories"),
        }
        self.issue_read_stories(owner, story_id);
    }

    pub(super) fn issue_read_stories(&mut self, owner: OwnerId, max_story_id: StoryId) {
        self.issue(
            RemoteRequest::ReadStories {
                owner,
                max_story_id,
            },
            PendingQuery::ReadStories {
                owner,
                max_story_id,
            },
        );
    }

    pub(super) fn on_read_stories_result(
        &mut self,
        owner: OwnerId,
        max_story_id: StoryId,
        result: Result<RemoteResponse, RemoteError>,
    ) {
        match expect_done(result, "read_stories") {
            Ok(()) => self.release_read_log_event(owner, max_story_id),
            Err(StoryError::TransientNetwork(e)) => {
                warn!(owner = %owner, error = %e, "Read stories failed, kept for next start");
            }
            Err(e) => {
                warn!(owner = %owner, error = %e, "Server rejected read stories");
                self.release_read_log_event(owner, max_story_id);
            }
        }
    }

    /// Erase the owner's read event unless a higher mark is still pending
    fn release_read_log_event(&mut self, owner: OwnerId, max_story_id: StoryId) {
        let Some((log_event_id, logged)) = self.read_log_events.get(&owner).copied() else {
            return;
        };
        if logged <= max_story_id {
            self.read_log_events.remove(&owner);
            self.remove_log_event(Some(log_event_id));
        }
    }

    /// Ask the server for every owner's read mark
    pub(super) fn request_all_read_stories(&mut self, promise: Promise<()>) {
        self.issue(
            RemoteRequest::GetAllReadStories,
            PendingQuery::AllReadStories { promise },
        );
    }

    pub(super) fn on_all_read_stories_result(
        &mut self,
        promise: Promise<()>,
        result: Result<RemoteResponse, RemoteError>,
    ) {
        let marks = match result {
            Ok(RemoteResponse::ReadMarks(marks)) => marks,
            Ok(other) => {
                warn!(response = other.kind(), "Unexpected read marks response");
                promise.set_error(RemoteError::UnexpectedResponse("get_all_read_stories").into());
                return;
            }
            Err(e) => {
                promise.set_error(e.into());
                return;
            }
        };
        let now = self.now();
        let mut raised = 0usize;
        for (owner, max_story_id) in marks {
            if self
                .index
                .on_update_read_stories(&self.cache, owner, max_story_id, now)
            {
                self.publish_active(owner);
                raised += 1;
            }
        }
        debug!(raised, "Reloaded read marks");
        promise.set_value(());
    }

    /// Merge a page of pinned or archived stories
    pub(super) fn on_stories_page(
        &mut self,
        owner: OwnerId,
        request: &'static str,
        result: Result<RemoteResponse, RemoteError>,
    ) -> StoryResult<FoundStories> {
        let RemoteResponse::Stories(page) = result? else {
            return Err(RemoteError::UnexpectedResponse(request).into());
        };
        let now = self.now();
        let mut stories = Vec::with_capacity(page.items.len());
        for item in page.items {
            let story_id = item.id();
            if self.merge_story(owner, item, now).kind != MergeKind::Deleted {
                stories.push(StoryFullId::new(owner, story_id));
            }
        }
        Ok(FoundStories {
            total_count: page.total_count,
            stories,
        })
    }

    pub(super) fn on_toggle_hidden_result(
        &mut self,
        owner: OwnerId,
        hidden: bool,
        promise: Promise<()>,
        result: Result<RemoteResponse, RemoteError>,
    ) {
        if let Err(e) = expect_done(result, "toggle_hidden") {
            promise.set_error(e);
            return;
        }
        let now = self.now();
        if self.index.set_hidden(&self.cache, owner, hidden, now) {
            self.publish_active(owner);
        }
        promise.set_value(());
    }

    // ------------------------------------------------------------------
    // Global lists
    // ------------------------------------------------------------------

    /// Serve the next page from the database, or ask the server
    pub(super) fn load_next_page(&mut self, list: StoryListId) {
        let now = self.now();
        if self.index.list(list).database_has_more {
            let page_size = self.config.lists.database_page_size;
            match self
                .index
                .load_database_page(&mut self.cache, list, page_size, now)
            {
                Ok(loaded) => {
                    self.watch_entered_stories(now);
                    let last = self.index.list(list).last_loaded_database_key;
                    let mut changed: BTreeSet<OwnerId> = loaded.iter().copied().collect();
                    changed.extend(self.index.advance_boundary(list, last, None));
                    for owner in &changed {
                        self.publish_active(*owner);
                    }
                    if !loaded.is_empty() {
                        let loads = std::mem::take(&mut self.index.list_mut(list).pending_loads);
                        resolve_all(loads, Ok(()));
                        return;
                    }
                }
                Err(e) => {
                    warn!(list = %list, error = %e, "Failed to read story list from database");
                    self.index.list_mut(list).database_has_more = false;
                }
            }
        }
        if self.index.list(list).server_has_more {
            self.request_list_page(list, true);
        } else {
            let loads = std::mem::take(&mut self.index.list_mut(list).pending_loads);
            resolve_all(loads, Ok(()));
        }
    }

    /// Ask the server for a page of a list; one request per list at a time
    pub(super) fn request_list_page(&mut self, list: StoryListId, is_next: bool) {
        let story_list = self.index.list_mut(list);
        if story_list.server_load_in_flight {
            return;
        }
        story_list.server_load_in_flight = true;
        let state = (!story_list.state.is_empty()).then(|| story_list.state.clone());
        self.issue(
            RemoteRequest::GetAllStories {
                list,
                is_next: is_next && state.is_some(),
                state,
            },
            PendingQuery::AllStories { list },
        );
    }

    pub(super) fn on_all_stories_result(
        &mut self,
        list: StoryListId,
        result: Result<RemoteResponse, RemoteError>,
    ) {
        let story_list = self.index.list_mut(list);
        story_list.server_load_in_flight = false;
        let loads = std::mem::take(&mut story_list.pending_loads);

        let page = match result {
            Ok(RemoteResponse::AllStories(page)) => page,
            Ok(other) => {
                warn!(list = %list, response = other.kind(), "Unexpected story list response");
                resolve_all(
                    loads,
                    Err(RemoteError::UnexpectedResponse("get_all_stories").into()),
                );
                return;
            }
            Err(e) => {
                warn!(list = %list, error = %e, "Failed to load story list");
                resolve_all(loads, Err(e.into()));
                return;
            }
        };

        let mut changed = BTreeSet::new();
        match page {
            AllStories::NotModified { state } => {
                debug!(list = %list, "Story list not modified");
                self.index.list_mut(list).state = state;
                changed.extend(self.index.advance_boundary(list, None, Some(false)));
            }
            AllStories::Page {
                state,
                has_more,
                total_count,
                owners,
            } => {
                let now = self.now();
                let mut last = None;
                for stories in owners {
                    let owner = stories.owner;
                    if self.apply_owner_stories(stories, Some(list), now, ActiveSource::ServerPage) {
                        changed.insert(owner);
                    }
                    if let Some((owner_list, key)) = self.index.key_of(owner)
                        && owner_list == list
                        && last.is_none_or(|last| key > last)
                    {
                        last = Some(key);
                    }
                }
                let story_list = self.index.list_mut(list);
                story_list.state = state;
                story_list.server_total_count = i32::try_from(total_count).unwrap_or(i32::MAX);
                changed.extend(self.index.advance_boundary(list, last, Some(has_more)));
                debug!(list = %list, total_count, has_more, changed = changed.len(), "Loaded story list page");
            }
        }
        self.index.save_list_state(list);
        for owner in changed {
            self.publish_active(owner);
        }
        resolve_all(loads, Ok(()));
    }
}
