//! Timer handling, view batching and viewer polling

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use ephemera_core::{
    InteractionInfo, OwnerId, RemoteError, RemoteRequest, RemoteResponse, StoryFullId, StoryGlobalId,
    StoryId, ViewersPage,
};

use super::{CachedStoryViewers, PendingQuery, StoryManager, expect_done};
use crate::config::deadline_after;
use crate::promise::Promise;
use crate::scheduler::TimerEvent;

/// Viewers fetched by a background poll
const VIEWERS_POLL_LIMIT: u32 = 50;
/// Viewers kept in a story's interaction info
const RECENT_VIEWERS: usize = 3;

impl StoryManager {
    pub(super) fn on_timer(&mut self, event: TimerEvent, now: DateTime<Utc>) {
        trace!(?event, "Timer fired");
        match event {
            TimerEvent::Expire(global_id) => self.on_expire_timeout(global_id, now),
            TimerEvent::Reload(global_id) => {
                if let Some(id) = self.cache.resolve_global_id(global_id) {
                    self.reload_story(id, None);
                }
            }
            TimerEvent::RetryReload(id) => self.retry_reload(id),
            TimerEvent::PollViewers(global_id) => self.on_viewers_timeout(global_id, now),
            TimerEvent::FlushViews => self.flush_views(),
            TimerEvent::RefreshInteractionInfo => self.refresh_interaction_info(now),
            TimerEvent::RetrySend => {
                self.pipeline.resume_sending();
                self.try_send_next();
            }
            TimerEvent::CollectGarbage => self.collect_garbage(now),
        }
    }

    /// Drop an expired story from its owner's active list
    fn on_expire_timeout(&mut self, global_id: StoryGlobalId, now: DateTime<Utc>) {
        let Some(id) = self.cache.resolve_global_id(global_id) else {
            return;
        };
        let Some(story) = self.cache.get(id) else {
            return;
        };
        if story.is_active(now) {
            // Expiry moved later since this timer was set
            let expire_date = story.expire_date;
            self.scheduler.expire.set(global_id, expire_date);
            return;
        }
        debug!(story = %id, "Story expired");
        let listed = self
            .index
            .get(id.owner)
            .is_some_and(|active| active.story_ids.contains(&id.story_id));
        if listed {
            self.update_active(id.owner, now);
        }
    }

    // ------------------------------------------------------------------
    // Viewers of own stories
    // ------------------------------------------------------------------

    /// Schedule the next viewer poll of an own story
    ///
    /// Polling is faster while the story is open and stops once viewers can
    /// no longer be fetched.
    pub(super) fn schedule_viewers_poll(&mut self, id: StoryFullId, now: DateTime<Utc>) {
        let Some(story) = self.cache.get(id) else {
            return;
        };
        let Some(global_id) = story.global_id else {
            return;
        };
        let polling = &self.config.polling;
        let period = if self.opened.contains_key(&id) {
            polling.opened_story_poll_period
        } else {
            polling.viewed_story_poll_period
        };
        let until = deadline_after(story.expire_date, polling.viewers_expire_period);
        let at = deadline_after(now, period);
        if at > until {
            self.scheduler.viewers.cancel(global_id);
            return;
        }
        self.scheduler.viewers.set(global_id, at);
    }

    fn on_viewers_timeout(&mut self, global_id: StoryGlobalId, now: DateTime<Utc>) {
        let Some(id) = self.cache.resolve_global_id(global_id) else {
            return;
        };
        if id.owner != self.config.self_owner {
            return;
        }
        self.issue(
            RemoteRequest::GetViewers {
                story_id: id.story_id,
                offset_date: None,
                offset_user: None,
                limit: VIEWERS_POLL_LIMIT,
            },
            PendingQuery::Viewers {
                story_full_id: id,
                first_page: true,
                promise: None,
            },
        );
        self.schedule_viewers_poll(id, now);
    }

    pub(super) fn on_viewers_result(
        &mut self,
        id: StoryFullId,
        first_page: bool,
        promise: Option<Promise<ViewersPage>>,
        result: Result<RemoteResponse, RemoteError>,
    ) {
        let page = match result {
            Ok(RemoteResponse::Viewers(page)) => page,
            Ok(other) => {
                warn!(story = %id, response = other.kind(), "Unexpected viewers response");
                if let Some(promise) = promise {
                    promise.set_error(RemoteError::UnexpectedResponse("get_viewers").into());
                }
                return;
            }
            Err(e) => {
                debug!(story = %id, error = %e, "Failed to fetch story viewers");
                if let Some(promise) = promise {
                    promise.set_error(e.into());
                }
                return;
            }
        };

        if first_page {
            let now = self.now();
            self.viewers.insert(
                id,
                CachedStoryViewers {
                    total_count: page.total_count,
                    viewers: page.viewers.clone(),
                    fetched_at: now,
                },
            );
            let info = InteractionInfo {
                view_count: page.total_count,
                recent_viewers: page
                    .viewers
                    .iter()
                    .take(RECENT_VIEWERS)
                    .map(|viewer| viewer.user_id)
                    .collect(),
            };
            self.apply_interaction_info(id, info);
        }
        if let Some(promise) = promise {
            promise.set_value(page);
        }
    }

    fn apply_interaction_info(&mut self, id: StoryFullId, info: InteractionInfo) {
        let changed = match self.cache.get_editable(id) {
            Some(story) if story.interaction_info != info => {
                story.interaction_info = info;
                true
            }
            _ => false,
        };
        if !changed {
            return;
        }
        if let Err(e) = self.cache.save(id) {
            warn!(story = %id, error = %e, "Failed to persist interaction info");
        }
        self.send_update_story(id);
    }

    fn refresh_interaction_info(&mut self, now: DateTime<Utc>) {
        let owner = self.config.self_owner;
        let story_ids: Vec<StoryId> = self
            .index
            .get(owner)
            .map(|active| active.story_ids.clone())
            .unwrap_or_default();
        if story_ids.is_empty() {
            return;
        }
        self.issue(
            RemoteRequest::GetStoriesViews { story_ids },
            PendingQuery::StoryViews { owner },
        );
        self.scheduler.schedule_interaction_refresh(deadline_after(
            now,
            self.config.polling.interaction_refresh_period,
        ));
    }

    pub(super) fn on_story_views_result(
        &mut self,
        owner: OwnerId,
        result: Result<RemoteResponse, RemoteError>,
    ) {
        match result {
            Ok(RemoteResponse::StoryViews(views)) => {
                for (story_id, info) in views {
                    self.apply_interaction_info(StoryFullId::new(owner, story_id), info);
                }
            }
            Ok(other) => {
                warn!(owner = %owner, response = other.kind(), "Unexpected story views response");
            }
            Err(e) => debug!(owner = %owner, error = %e, "Failed to refresh story views"),
        }
    }

    // ------------------------------------------------------------------
    // View batching
    // ------------------------------------------------------------------

    /// One view-increment request per owner with nothing in flight
    fn flush_views(&mut self) {
        let batch = self.config.polling.max_view_batch.max(1);
        let owners: Vec<OwnerId> = self
            .pending_views
            .iter()
            .filter(|(_, views)| !views.has_query && !views.story_ids.is_empty())
            .map(|(owner, _)| *owner)
            .collect();
        for owner in owners {
            let Some(views) = self.pending_views.get_mut(&owner) else {
                continue;
            };
            let story_ids: Vec<StoryId> = views.story_ids.iter().take(batch).copied().collect();
            for story_id in &story_ids {
                views.story_ids.remove(story_id);
            }
            views.has_query = true;
            debug!(owner = %owner, count = story_ids.len(), "Reporting story views");
            self.issue(
                RemoteRequest::IncrementViews { owner, story_ids },
                PendingQuery::IncrementViews { owner },
            );
        }
    }

    pub(super) fn on_increment_views_result(
        &mut self,
        owner: OwnerId,
        result: Result<RemoteResponse, RemoteError>,
    ) {
        if let Err(e) = expect_done(result, "increment_views") {
            warn!(owner = %owner, error = %e, "Failed to report story views");
        }
        let Some(views) = self.pending_views.get_mut(&owner) else {
            return;
        };
        views.has_query = false;
        if views.story_ids.is_empty() {
            self.pending_views.remove(&owner);
        } else {
            // Opened while the request was in flight
            let at = deadline_after(self.now(), self.config.polling.view_flush_delay);
            self.scheduler.schedule_view_flush(at);
        }
    }

    // ------------------------------------------------------------------
    // Garbage collection
    // ------------------------------------------------------------------

    fn collect_garbage(&mut self, now: DateTime<Utc>) {
        let mut in_use: HashSet<StoryFullId> = HashSet::new();
        for owner in self.index.owners() {
            if let Some(active) = self.index.get(owner) {
                in_use.extend(
                    active
                        .story_ids
                        .iter()
                        .map(|story_id| StoryFullId::new(owner, *story_id)),
                );
            }
        }
        let pipeline = &self.pipeline;
        let opened = &self.opened;
        let reloads = &self.reloads;
        let removed = self.cache.collect_garbage(
            now,
            self.config.cache.inaccessible_grace_period,
            self.config.cache.gc_batch_limit,
            |id| {
                in_use.contains(&id)
                    || opened.contains_key(&id)
                    || reloads.contains_key(&id)
                    || pipeline.being_edited(id).is_some()
            },
        );
        for id in &removed {
            self.viewers.remove(id);
        }

        // Own expired stories stay on disk for the archive
        let self_owner = self.config.self_owner;
        match self.cache.purge_expired_records(
            now,
            self.config.cache.gc_batch_limit,
            |id| id.owner == self_owner || in_use.contains(&id),
        ) {
            Ok(purged) => {
                for id in &purged {
                    self.viewers.remove(id);
                }
            }
            Err(e) => warn!(error = %e, "Failed to purge expired story records"),
        }

        let lifetime = self.config.polling.viewers_cache_lifetime;
        self.viewers
            .retain(|_, cached| now < deadline_after(cached.fetched_at, lifetime));
        self.scheduler
            .schedule_gc(deadline_after(now, self.config.cache.gc_interval));
    }
}
