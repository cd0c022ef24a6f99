//! Command surface
//!
//! Every command returns a [`Deferred`]. Argument and permission checks fail
//! immediately, before anything reaches the network.

use tracing::{debug, info, instrument};

use ephemera_core::{
    Caption, MessageFullId, OwnerId, RemoteRequest, ReportReason, Story, StoryContent,
    StoryFullId, StoryId, StoryListId, StoryPrivacySettings, UserId, ViewersPage,
};

use super::{
    FoundStories, NewStory, PendingQuery, StoryManager, check_content, report_reason_name,
};
use crate::active::ActiveStoriesView;
use crate::config::{deadline_after, to_delta};
use crate::error::StoryError;
use crate::promise::{Deferred, pair};

impl StoryManager {
    /// Fetch a story, from memory, the database or the server
    #[instrument(skip(self), fields(owner = %owner, story_id = %story_id))]
    pub fn get_story(&mut self, owner: OwnerId, story_id: StoryId) -> Deferred<Story> {
        if !owner.is_valid() || !story_id.is_server() {
            return Deferred::failed(StoryError::invalid(format!("story {owner}/{story_id}")));
        }
        let id = StoryFullId::new(owner, story_id);
        let cached = if self.cache.is_inaccessible_story(id) {
            None
        } else {
            self.cache.get_force(id).ok().filter(|story| story.is_loaded()).cloned()
        };
        let now = self.now();
        self.watch_entered_stories(now);
        if let Some(story) = cached {
            return Deferred::ready(Ok(story));
        }
        let (promise, deferred) = pair();
        self.reload_story(id, Some(promise));
        deferred
    }

    /// Queue a new story of the local user
    #[instrument(skip(self, story), fields(owner = %owner, period = story.active_period_secs))]
    pub fn send_story(&mut self, owner: OwnerId, story: NewStory) -> Deferred<StoryFullId> {
        if owner != self.config.self_owner {
            return Deferred::failed(StoryError::denied(format!("cannot post as {owner}")));
        }
        if let Err(e) = check_content(&story.content) {
            return Deferred::failed(e);
        }
        if let Err(e) = self.check_caption(&story.caption) {
            return Deferred::failed(e);
        }
        if !self
            .config
            .upload
            .allowed_active_periods
            .contains(&story.active_period_secs)
        {
            return Deferred::failed(StoryError::invalid(format!(
                "active period {}s",
                story.active_period_secs
            )));
        }

        let (promise, deferred) = pair();
        self.start_send(owner, story, promise);
        deferred
    }

    /// Replace content and/or caption of an own story
    #[instrument(skip(self, content, caption), fields(story_id = %story_id))]
    pub fn edit_story(
        &mut self,
        story_id: StoryId,
        content: Option<StoryContent>,
        caption: Option<Caption>,
    ) -> Deferred<()> {
        if content.is_none() && caption.is_none() {
            return Deferred::failed(StoryError::invalid("nothing to edit"));
        }
        if let Some(content) = &content
            && let Err(e) = check_content(content)
        {
            return Deferred::failed(e);
        }
        if let Some(caption) = &caption
            && let Err(e) = self.check_caption(caption)
        {
            return Deferred::failed(e);
        }
        let id = match self.own_story(story_id) {
            Ok(id) => id,
            Err(e) => return Deferred::failed(e),
        };

        let (promise, deferred) = pair();
        self.start_edit(id, content, caption, Some(promise), None);
        deferred
    }

    #[instrument(skip(self, settings), fields(story_id = %story_id))]
    pub fn set_story_privacy_settings(
        &mut self,
        story_id: StoryId,
        settings: StoryPrivacySettings,
    ) -> Deferred<()> {
        let id = match self.own_story(story_id) {
            Ok(id) => id,
            Err(e) => return Deferred::failed(e),
        };
        let (promise, deferred) = pair();
        self.issue(
            RemoteRequest::EditStory {
                owner: id.owner,
                story_id,
                file: None,
                content: None,
                caption: None,
                privacy_rules: Some(settings.to_rules()),
            },
            PendingQuery::SetPrivacy {
                story_full_id: id,
                settings,
                promise,
            },
        );
        deferred
    }

    #[instrument(skip(self), fields(story_id = %story_id))]
    pub fn toggle_story_is_pinned(&mut self, story_id: StoryId, is_pinned: bool) -> Deferred<()> {
        let id = match self.own_story(story_id) {
            Ok(id) => id,
            Err(e) => return Deferred::failed(e),
        };
        let (promise, deferred) = pair();
        self.issue(
            RemoteRequest::TogglePinned {
                owner: id.owner,
                story_ids: vec![story_id],
                is_pinned,
            },
            PendingQuery::TogglePinned {
                story_full_id: id,
                is_pinned,
                promise,
            },
        );
        deferred
    }

    /// Delete an own story locally and, durably, on the server
    #[instrument(skip(self), fields(story_id = %story_id))]
    pub fn delete_story(&mut self, story_id: StoryId) -> Deferred<()> {
        let id = match self.own_story(story_id) {
            Ok(id) => id,
            Err(e) => return Deferred::failed(e),
        };
        let now = self.now();
        if let Some(global_id) = self.cache.get(id).and_then(|story| story.global_id) {
            self.scheduler.cancel_story(global_id);
        }
        self.pipeline.finish_edit(id);
        if self.cache.on_delete(id) {
            self.on_story_removed(id, now);
        }
        info!(story = %id, "Story deleted locally");
        Deferred::ready(self.delete_story_on_server(id, None))
    }

    /// Load the next page of a global list
    ///
    /// Fails with `NotFound` once both the database and the server are
    /// exhausted.
    #[instrument(skip(self), fields(list = %list))]
    pub fn load_active_stories(&mut self, list: StoryListId) -> Deferred<()> {
        if self.index.list(list).is_exhausted() {
            return Deferred::failed(StoryError::not_found(format!("more stories in {list}")));
        }
        let (promise, deferred) = pair();
        self.index.list_mut(list).pending_loads.push(promise);
        self.load_next_page(list);
        deferred
    }

    /// Re-read both lists from the top
    #[instrument(skip(self))]
    pub fn reload_active_stories(&mut self) -> Deferred<()> {
        let (promise, deferred) = pair();
        for list in StoryListId::ALL {
            self.request_list_page(list, false);
        }
        self.index
            .list_mut(StoryListId::Main)
            .pending_loads
            .push(promise);
        deferred
    }

    /// Hide an owner's stories from the main list or show them again
    #[instrument(skip(self), fields(owner = %owner, hidden))]
    pub fn toggle_stories_hidden(&mut self, owner: OwnerId, hidden: bool) -> Deferred<()> {
        if !owner.is_valid() || owner == self.config.self_owner {
            return Deferred::failed(StoryError::invalid(format!("cannot hide {owner}")));
        }
        let (promise, deferred) = pair();
        self.issue(
            RemoteRequest::ToggleHidden { owner, hidden },
            PendingQuery::ToggleHidden {
                owner,
                hidden,
                promise,
            },
        );
        deferred
    }

    #[instrument(skip(self), fields(owner = %owner, from = %from_story_id, limit))]
    pub fn get_pinned_stories(
        &mut self,
        owner: OwnerId,
        from_story_id: StoryId,
        limit: u32,
    ) -> Deferred<FoundStories> {
        if !owner.is_valid() || limit == 0 {
            return Deferred::failed(StoryError::invalid("bad pinned stories query"));
        }
        let (promise, deferred) = pair();
        self.issue(
            RemoteRequest::GetPinnedStories {
                owner,
                from_story_id,
                limit,
            },
            PendingQuery::Pinned { owner, promise },
        );
        deferred
    }

    /// Own stories, expired ones included
    #[instrument(skip(self), fields(from = %from_story_id, limit))]
    pub fn get_archive(&mut self, from_story_id: StoryId, limit: u32) -> Deferred<FoundStories> {
        if limit == 0 {
            return Deferred::failed(StoryError::invalid("limit must be positive"));
        }
        let (promise, deferred) = pair();
        self.issue(
            RemoteRequest::GetArchive {
                owner: self.config.self_owner,
                from_story_id,
                limit,
            },
            PendingQuery::Archive { promise },
        );
        deferred
    }

    /// Active stories of one owner, loading them if unknown
    #[instrument(skip(self), fields(owner = %owner))]
    pub fn get_expiring_stories(&mut self, owner: OwnerId) -> Deferred<ActiveStoriesView> {
        if !owner.is_valid() {
            return Deferred::failed(StoryError::invalid(format!("owner {owner}")));
        }
        if self.index.get(owner).is_some() && !self.index.is_from_database(owner) {
            return Deferred::ready(Ok(self.active_stories(owner)));
        }
        let (promise, deferred) = pair();
        self.load_expiring_stories(owner, Some(promise), None);
        deferred
    }

    /// Start a viewing session
    ///
    /// Own stories get their viewers polled while open. Stories of others
    /// are counted as viewed and marked read.
    #[instrument(skip(self), fields(owner = %owner, story_id = %story_id))]
    pub fn open_story(&mut self, owner: OwnerId, story_id: StoryId) -> Deferred<()> {
        if !story_id.is_server() {
            return Deferred::failed(StoryError::invalid(format!("story id {story_id}")));
        }
        let id = StoryFullId::new(owner, story_id);
        let now = self.now();
        let (global_id, is_active) = match self.cache.get_force(id) {
            Ok(story) => (story.global_id, story.is_active(now)),
            Err(e) => return Deferred::failed(e),
        };
        self.watch_entered_stories(now);

        if owner == self.config.self_owner {
            *self.opened.entry(id).or_insert(0) += 1;
            if let Some(global_id) = global_id {
                self.scheduler.viewers.set(global_id, now);
            }
            return Deferred::ready(Ok(()));
        }

        if is_active {
            let views = self.pending_views.entry(owner).or_default();
            views.story_ids.insert(story_id);
            if !self.scheduler.has_view_flush() {
                let at = deadline_after(now, self.config.polling.view_flush_delay);
                self.scheduler.schedule_view_flush(at);
            }
            self.read_stories(owner, story_id, now);
        }
        Deferred::ready(Ok(()))
    }

    #[instrument(skip(self), fields(owner = %owner, story_id = %story_id))]
    pub fn close_story(&mut self, owner: OwnerId, story_id: StoryId) -> Deferred<()> {
        let id = StoryFullId::new(owner, story_id);
        if owner != self.config.self_owner {
            return Deferred::ready(Ok(()));
        }
        let Some(count) = self.opened.get_mut(&id) else {
            return Deferred::failed(StoryError::invalid(format!("story {id} is not open")));
        };
        *count -= 1;
        if *count == 0 {
            self.opened.remove(&id);
            let now = self.now();
            self.schedule_viewers_poll(id, now);
        }
        Deferred::ready(Ok(()))
    }

    /// Viewers of an own story, newest first
    #[instrument(skip(self), fields(story_id = %story_id, limit))]
    pub fn get_story_viewers(
        &mut self,
        story_id: StoryId,
        offset_date: Option<chrono::DateTime<chrono::Utc>>,
        offset_user: Option<UserId>,
        limit: u32,
    ) -> Deferred<ViewersPage> {
        if limit == 0 {
            return Deferred::failed(StoryError::invalid("limit must be positive"));
        }
        let id = match self.own_story(story_id) {
            Ok(id) => id,
            Err(e) => return Deferred::failed(e),
        };
        let first_page = offset_date.is_none() && offset_user.is_none();
        let now = self.now();
        if first_page
            && let Some(cached) = self.viewers.get(&id)
            && now < deadline_after(cached.fetched_at, self.config.polling.viewers_cache_lifetime)
            && (cached.viewers.len() >= limit as usize
                || cached.viewers.len() as u32 == cached.total_count)
        {
            debug!(story = %id, "Serving viewers from cache");
            return Deferred::ready(Ok(ViewersPage {
                total_count: cached.total_count,
                viewers: cached.viewers.iter().take(limit as usize).cloned().collect(),
            }));
        }

        let (promise, deferred) = pair();
        self.issue(
            RemoteRequest::GetViewers {
                story_id,
                offset_date,
                offset_user,
                limit,
            },
            PendingQuery::Viewers {
                story_full_id: id,
                first_page,
                promise: Some(promise),
            },
        );
        deferred
    }

    #[instrument(skip(self, reason), fields(owner = %owner, story_id = %story_id, reason = report_reason_name(&reason)))]
    pub fn report_story(
        &mut self,
        owner: OwnerId,
        story_id: StoryId,
        reason: ReportReason,
    ) -> Deferred<()> {
        if !owner.is_valid() || !story_id.is_server() {
            return Deferred::failed(StoryError::invalid(format!("story {owner}/{story_id}")));
        }
        if owner == self.config.self_owner {
            return Deferred::failed(StoryError::invalid("cannot report own story"));
        }
        let (promise, deferred) = pair();
        self.issue(
            RemoteRequest::Report {
                owner,
                story_ids: vec![story_id],
                reason,
            },
            PendingQuery::Report { promise },
        );
        deferred
    }

    /// Record that a message displays a story
    pub fn register_story(&mut self, story_full_id: StoryFullId, message: MessageFullId) {
        self.cache.register_story(story_full_id, message);
    }

    pub fn unregister_story(&mut self, story_full_id: StoryFullId, message: MessageFullId) {
        self.cache.unregister_story(story_full_id, message);
    }

    /// A message showing the story came on screen
    ///
    /// Unknown stories, and stories last received more than a viewer-poll
    /// period ago, are reloaded in the background.
    #[instrument(skip(self), fields(story = %story_full_id))]
    pub fn view_story_message(&mut self, story_full_id: StoryFullId) -> Deferred<()> {
        if !story_full_id.story_id.is_server() {
            return Deferred::failed(StoryError::invalid(format!("story {story_full_id}")));
        }
        let now = self.now();
        let stale_before = now - to_delta(self.config.polling.viewed_story_poll_period);
        let is_fresh = self
            .cache
            .get_force(story_full_id)
            .is_ok_and(|story| story.is_loaded() && story.receive_date >= stale_before);
        self.watch_entered_stories(now);
        if !is_fresh {
            debug!(story = %story_full_id, "Refreshing story shown in a message");
            self.reload_story(story_full_id, None);
        }
        Deferred::ready(Ok(()))
    }

    /// Someone replied to an own story
    ///
    /// Views are refetched when the reply proves the cached viewer list
    /// incomplete.
    #[instrument(skip(self), fields(story = %story_full_id, replier = %replier))]
    pub fn on_story_replied(&mut self, story_full_id: StoryFullId, replier: UserId) {
        let owner = self.config.self_owner;
        if story_full_id.owner != owner || !story_full_id.story_id.is_server() {
            return;
        }
        let now = self.now();
        let viewers_until = self.config.polling.viewers_expire_period;
        let needs_refresh = self.cache.get_force(story_full_id).is_ok_and(|story| {
            story.content.is_some()
                && now < deadline_after(story.expire_date, viewers_until)
                && story.interaction_info.definitely_lacks_viewer(replier)
        });
        self.watch_entered_stories(now);
        if needs_refresh {
            self.issue(
                RemoteRequest::GetStoriesViews {
                    story_ids: vec![story_full_id.story_id],
                },
                PendingQuery::StoryViews { owner },
            );
        }
    }

    /// Refresh every owner's read mark from the server
    #[instrument(skip(self))]
    pub fn reload_all_read_stories(&mut self) -> Deferred<()> {
        let (promise, deferred) = pair();
        self.request_all_read_stories(promise);
        deferred
    }
}
