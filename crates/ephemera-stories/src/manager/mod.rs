//! The story manager
//!
//! [`StoryManager`] is a synchronous state machine. Commands and completions
//! mutate it through `&mut self`; network and upload work leaves it as
//! [`Outbound`] items and comes back as [`Inbound`] results. Whoever drives it
//! (the [`StoryService`](crate::service::StoryService) actor, or a test)
//! decides how and when that work runs.
//!
//! The implementation is split by concern:
//! - `commands`: the public command surface
//! - `sending`: uploads, sends and edits
//! - `lists`: story reloads, active stories and global list pagination
//! - `timers`: timer handling, view batching and viewer polling
//! - `replay`: startup replay of the mutation log

mod commands;
mod lists;
mod replay;
mod sending;
mod timers;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, trace, warn};

use ephemera_core::{
    Caption, Clock, Dependencies, DependencyResolver, NotificationSink, OwnerId, RemoteError,
    RemoteRequest, RemoteResponse, ReportReason, Story, StoryContent, StoryFullId, StoryId,
    StoryPrivacySettings, StoryUpdate, StoryViewer, ViewersPage,
};
use ephemera_storage::{LogEventId, LogEventStore, StoryDatabase};

use crate::active::{ActiveStoriesView, ActiveStoryIndex};
use crate::cache::{MergeKind, MergeOutcome, StoryCache};
use crate::config::{StoryConfig, deadline_after};
use crate::error::{StoryError, StoryResult};
use crate::log_event::LogEventPayload;
use crate::outbound::{Inbound, Outbound, QueryId};
use crate::promise::Promise;
use crate::scheduler::Scheduler;
use crate::upload::{ReadyToSendStory, UploadPipeline};

/// A story to send
#[derive(Debug, Clone)]
pub struct NewStory {
    pub content: StoryContent,
    pub caption: Caption,
    pub privacy: StoryPrivacySettings,
    pub active_period_secs: u32,
    pub is_pinned: bool,
    pub noforwards: bool,
}

/// A page of pinned or archived stories
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundStories {
    pub total_count: u32,
    pub stories: Vec<StoryFullId>,
}

/// Opened stories of an owner waiting for a view-increment request
#[derive(Debug, Default)]
pub struct PendingStoryViews {
    pub story_ids: BTreeSet<StoryId>,
    pub has_query: bool,
}

/// First page of viewers of an own story
#[derive(Debug, Clone)]
pub struct CachedStoryViewers {
    pub total_count: u32,
    pub viewers: Vec<StoryViewer>,
    pub fetched_at: DateTime<Utc>,
}

/// Reload of one story, shared by every waiter
#[derive(Debug, Default)]
struct ReloadState {
    waiters: Vec<Promise<Story>>,
    attempts: u32,
    in_flight: bool,
}

/// Continuation of a remote request
#[derive(Debug)]
enum PendingQuery {
    Reload {
        story_full_id: StoryFullId,
    },
    Send {
        ready: Box<ReadyToSendStory>,
    },
    Edit {
        story_full_id: StoryFullId,
        generation: u32,
    },
    SetPrivacy {
        story_full_id: StoryFullId,
        settings: StoryPrivacySettings,
        promise: Promise<()>,
    },
    TogglePinned {
        story_full_id: StoryFullId,
        is_pinned: bool,
        promise: Promise<()>,
    },
    DeleteOnServer {
        story_full_id: StoryFullId,
        log_event_id: Option<LogEventId>,
    },
    AllStories {
        list: ephemera_core::StoryListId,
    },
    OwnerStories {
        owner: OwnerId,
    },
    ReadStories {
        owner: OwnerId,
        max_story_id: StoryId,
    },
    AllReadStories {
        promise: Promise<()>,
    },
    IncrementViews {
        owner: OwnerId,
    },
    Viewers {
        story_full_id: StoryFullId,
        first_page: bool,
        promise: Option<Promise<ViewersPage>>,
    },
    StoryViews {
        owner: OwnerId,
    },
    Pinned {
        owner: OwnerId,
        promise: Promise<FoundStories>,
    },
    Archive {
        promise: Promise<FoundStories>,
    },
    Report {
        promise: Promise<()>,
    },
    ToggleHidden {
        owner: OwnerId,
        hidden: bool,
        promise: Promise<()>,
    },
}

/// Client-side story state engine
pub struct StoryManager {
    config: StoryConfig,
    clock: Arc<dyn Clock>,
    log: Arc<dyn LogEventStore>,
    sink: Arc<dyn NotificationSink>,
    resolver: Arc<dyn DependencyResolver>,

    cache: StoryCache,
    index: ActiveStoryIndex,
    pipeline: UploadPipeline,
    scheduler: Scheduler,

    outbound: VecDeque<Outbound>,
    pending: HashMap<QueryId, PendingQuery>,
    next_query_id: u64,

    reloads: HashMap<StoryFullId, ReloadState>,
    expiring_loads: HashMap<OwnerId, (Vec<Promise<ActiveStoriesView>>, Option<LogEventId>)>,
    pending_views: BTreeMap<OwnerId, PendingStoryViews>,
    /// Logged read mark per owner, rewritten in place as the mark rises
    read_log_events: HashMap<OwnerId, (LogEventId, StoryId)>,
    /// Open count of own stories, by story
    opened: HashMap<StoryFullId, u32>,
    viewers: HashMap<StoryFullId, CachedStoryViewers>,

    torn_down: bool,
}

impl StoryManager {
    /// Build a manager and replay the mutation log
    ///
    /// Replay happens before the manager is handed out, so no command can
    /// observe a half-restored state.
    pub fn new(
        config: StoryConfig,
        clock: Arc<dyn Clock>,
        log: Arc<dyn LogEventStore>,
        database: Arc<dyn StoryDatabase>,
        sink: Arc<dyn NotificationSink>,
        resolver: Arc<dyn DependencyResolver>,
    ) -> StoryResult<Self> {
        for warning in config.validate() {
            warn!(%warning, "Story configuration warning");
        }

        let mut manager = Self {
            cache: StoryCache::new(database.clone()),
            index: ActiveStoryIndex::new(config.self_owner, database),
            pipeline: UploadPipeline::new(),
            scheduler: Scheduler::new(),
            config,
            clock,
            log,
            sink,
            resolver,
            outbound: VecDeque::new(),
            pending: HashMap::new(),
            next_query_id: 0,
            reloads: HashMap::new(),
            expiring_loads: HashMap::new(),
            pending_views: BTreeMap::new(),
            read_log_events: HashMap::new(),
            opened: HashMap::new(),
            viewers: HashMap::new(),
            torn_down: false,
        };

        manager.index.load_list_states()?;
        manager.replay_log_events()?;

        let now = manager.now();
        manager.watch_entered_stories(now);
        manager
            .scheduler
            .schedule_gc(deadline_after(now, manager.config.cache.gc_interval));
        info!(
            self_owner = %manager.config.self_owner,
            pending_sends = manager.pipeline.yet_unsent().len(),
            "Story manager started"
        );
        Ok(manager)
    }

    pub fn config(&self) -> &StoryConfig {
        &self.config
    }

    pub fn cache(&self) -> &StoryCache {
        &self.cache
    }

    pub fn index(&self) -> &ActiveStoryIndex {
        &self.index
    }

    pub fn pipeline(&self) -> &UploadPipeline {
        &self.pipeline
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn pending_views(&self, owner: OwnerId) -> Option<&PendingStoryViews> {
        self.pending_views.get(&owner)
    }

    pub fn cached_viewers(&self, story_full_id: StoryFullId) -> Option<&CachedStoryViewers> {
        self.viewers.get(&story_full_id)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Active stories of an owner as listeners see them
    pub fn active_stories(&self, owner: OwnerId) -> ActiveStoriesView {
        self.index.view(&self.cache, owner)
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ------------------------------------------------------------------
    // Driver interface
    // ------------------------------------------------------------------

    /// Drain work queued for the driver
    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        self.outbound.drain(..).collect()
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Earliest time [`tick`](Self::tick) has something to do
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        if self.torn_down {
            return None;
        }
        self.scheduler.next_deadline()
    }

    /// Fire due timers
    pub fn tick(&mut self) {
        if self.torn_down {
            return;
        }
        let now = self.now();
        for event in self.scheduler.due(now) {
            self.on_timer(event, now);
        }
        self.watch_entered_stories(now);
        self.publish_counts();
    }

    /// Feed back a completed request or upload
    pub fn handle_inbound(&mut self, inbound: Inbound) {
        if self.torn_down {
            trace!("Ignoring completion after teardown");
            return;
        }
        match inbound {
            Inbound::Remote { query_id, result } => {
                let Some(query) = self.pending.remove(&query_id) else {
                    debug!(query = %query_id, "Completion for unknown query");
                    return;
                };
                self.on_remote_result(query, result);
            }
            Inbound::Upload { upload_id, result } => self.on_upload_result(upload_id, result),
        }
        let now = self.now();
        self.watch_entered_stories(now);
        self.publish_counts();
    }

    /// Drop timers and in-flight work; every waiter resolves as canceled
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.outbound.clear();
        self.pending.clear();
        self.pipeline.clear();
        self.scheduler.clear();
        self.reloads.clear();
        self.expiring_loads.clear();
        self.pending_views.clear();
        for list in ephemera_core::StoryListId::ALL {
            self.index.list_mut(list).pending_loads.clear();
        }
        info!("Story manager torn down");
    }

    fn issue(&mut self, request: RemoteRequest, query: PendingQuery) -> QueryId {
        self.next_query_id += 1;
        let query_id = QueryId(self.next_query_id);
        trace!(query = %query_id, request = request.name(), "Queueing remote request");
        self.pending.insert(query_id, query);
        self.outbound.push_back(Outbound::Remote { query_id, request });
        query_id
    }

    fn on_remote_result(&mut self, query: PendingQuery, result: Result<RemoteResponse, RemoteError>) {
        match query {
            PendingQuery::Reload { story_full_id } => self.on_reload_result(story_full_id, result),
            PendingQuery::Send { ready } => self.on_send_result(*ready, result),
            PendingQuery::Edit {
                story_full_id,
                generation,
            } => self.on_edit_result(story_full_id, generation, result),
            PendingQuery::SetPrivacy {
                story_full_id,
                settings,
                promise,
            } => self.on_set_privacy_result(story_full_id, settings, promise, result),
            PendingQuery::TogglePinned {
                story_full_id,
                is_pinned,
                promise,
            } => self.on_toggle_pinned_result(story_full_id, is_pinned, promise, result),
            PendingQuery::DeleteOnServer {
                story_full_id,
                log_event_id,
            } => self.on_delete_on_server_result(story_full_id, log_event_id, result),
            PendingQuery::AllStories { list } => self.on_all_stories_result(list, result),
            PendingQuery::OwnerStories { owner } => self.on_owner_stories_result(owner, result),
            PendingQuery::ReadStories {
                owner,
                max_story_id,
            } => self.on_read_stories_result(owner, max_story_id, result),
            PendingQuery::AllReadStories { promise } => {
                self.on_all_read_stories_result(promise, result)
            }
            PendingQuery::IncrementViews { owner } => self.on_increment_views_result(owner, result),
            PendingQuery::Viewers {
                story_full_id,
                first_page,
                promise,
            } => self.on_viewers_result(story_full_id, first_page, promise, result),
            PendingQuery::StoryViews { owner } => self.on_story_views_result(owner, result),
            PendingQuery::Pinned { owner, promise } => {
                let found = self.on_stories_page(owner, "get_pinned_stories", result);
                promise.set_result(found);
            }
            PendingQuery::Archive { promise } => {
                let owner = self.config.self_owner;
                let found = self.on_stories_page(owner, "get_archive", result);
                promise.set_result(found);
            }
            PendingQuery::Report { promise } => {
                promise.set_result(expect_done(result, "report"));
            }
            PendingQuery::ToggleHidden {
                owner,
                hidden,
                promise,
            } => self.on_toggle_hidden_result(owner, hidden, promise, result),
        }
    }

    // ------------------------------------------------------------------
    // Merging and notifications
    // ------------------------------------------------------------------

    /// Merge a server item and run its side effects
    fn merge_story(
        &mut self,
        owner: OwnerId,
        item: ephemera_core::RemoteStoryItem,
        now: DateTime<Utc>,
    ) -> MergeOutcome {
        let outcome = self.cache.on_get_story(owner, item, now);
        self.after_merge(outcome, now);
        outcome
    }

    fn after_merge(&mut self, outcome: MergeOutcome, now: DateTime<Utc>) {
        let id = outcome.story_full_id;
        if outcome.kind == MergeKind::Deleted {
            if outcome.notify {
                self.on_story_removed(id, now);
            }
            return;
        }
        if outcome.persist
            && let Err(e) = self.cache.save(id)
        {
            warn!(story = %id, error = %e, "Failed to persist story");
        }
        if outcome.dates_changed {
            self.schedule_expire(id);
        }
        if outcome.is_partial
            && let Some(global_id) = self.cache.get(id).and_then(|story| story.global_id)
        {
            let at = deadline_after(now, self.config.cache.stale_story_reload_delay);
            self.scheduler.reload.set_if_earlier(global_id, at);
        }
        if outcome.notify {
            self.send_update_story(id);
            if outcome.dates_changed && self.index.get(id.owner).is_some() {
                self.update_active(id.owner, now);
            }
        }
    }

    /// Arm expiry, and a reload for placeholders, on stories new to memory
    ///
    /// Merges arm their own timers. This covers stories read back from the
    /// database, which never pass through a merge.
    fn watch_entered_stories(&mut self, now: DateTime<Utc>) {
        for id in self.cache.take_entered() {
            let Some(story) = self.cache.get(id) else {
                continue;
            };
            let (Some(global_id), true) = (story.global_id, id.is_server()) else {
                continue;
            };
            self.scheduler.expire.set(global_id, story.expire_date);
            if !story.is_loaded() {
                let at = deadline_after(now, self.config.cache.stale_story_reload_delay);
                self.scheduler.reload.set_if_earlier(global_id, at);
            }
        }
    }

    fn schedule_expire(&mut self, id: StoryFullId) {
        let Some(story) = self.cache.get(id) else {
            return;
        };
        let Some(global_id) = story.global_id else {
            return;
        };
        if id.is_server() {
            self.scheduler.expire.set(global_id, story.expire_date);
        }
    }

    /// Story gone for good: listeners, lists and previews
    fn on_story_removed(&mut self, id: StoryFullId, now: DateTime<Utc>) {
        self.viewers.remove(&id);
        self.opened.remove(&id);
        self.sink.publish(StoryUpdate::StoryDeleted { story_full_id: id });
        self.invalidate_messages(id);
        if self.index.remove_story(&self.cache, id, now) {
            self.publish_active(id.owner);
        }
    }

    fn invalidate_messages(&self, id: StoryFullId) {
        let messages = self.cache.messages_of(id);
        if !messages.is_empty() {
            self.sink.publish(StoryUpdate::StoryMessagesInvalidated {
                story_full_id: id,
                messages,
            });
        }
    }

    /// Publish the current state of a story
    ///
    /// Placeholders are not published. The delivered flag is set right after
    /// the update goes out.
    fn send_update_story(&mut self, id: StoryFullId) {
        let Some(story) = self.cache.get(id) else {
            return;
        };
        if !story.is_loaded() {
            return;
        }
        let mut dependencies = Dependencies::new();
        self.cache.add_story_dependencies(&mut dependencies, id);
        if !self.resolver.resolve(&dependencies, "send_update_story") {
            warn!(story = %id, "Unresolved dependencies, story update not sent");
            return;
        }
        self.sink.publish(StoryUpdate::StoryChanged {
            story_full_id: id,
            story: Box::new(story.clone()),
        });
        if let Some(story) = self.cache.get_editable(id) {
            story.is_update_sent = true;
        }
        self.invalidate_messages(id);
    }

    fn publish_active(&self, owner: OwnerId) {
        let view = self.index.view(&self.cache, owner);
        let mut dependencies = Dependencies::new();
        dependencies.add_owner(owner);
        if !self.resolver.resolve(&dependencies, "publish_active_stories") {
            warn!(owner = %owner, "Unresolved owner, active stories update not sent");
            return;
        }
        self.sink.publish(StoryUpdate::ActiveStoriesChanged {
            owner,
            list: view.list,
            order: view.order,
            max_read_story_id: view.max_read_story_id,
            stories: view.stories,
        });
    }

    fn publish_counts(&mut self) {
        for (list, count) in self.index.take_count_updates() {
            debug!(list = %list, count, "Story list count changed");
            self.sink
                .publish(StoryUpdate::StoryListCountChanged { list, count });
        }
    }

    fn remove_log_event(&self, log_event_id: Option<LogEventId>) {
        if let Some(id) = log_event_id
            && let Err(e) = self.log.remove(id)
        {
            warn!(log_event = %id, error = %e, "Failed to erase log event");
        }
    }

    /// Append a log event, or rewrite it in place if it already exists
    fn write_log_event<P: LogEventPayload>(
        &self,
        existing: Option<LogEventId>,
        payload: &P,
    ) -> StoryResult<LogEventId> {
        let bytes = payload.encode()?;
        match existing {
            Some(id) => {
                self.log.rewrite(id, P::KIND, bytes)?;
                Ok(id)
            }
            None => Ok(self.log.append(P::KIND, bytes)?),
        }
    }

    fn own_story(&mut self, story_id: StoryId) -> StoryResult<StoryFullId> {
        if !story_id.is_server() {
            return Err(StoryError::invalid(format!("story id {story_id}")));
        }
        let id = StoryFullId::new(self.config.self_owner, story_id);
        self.cache.get_force(id)?;
        let now = self.now();
        self.watch_entered_stories(now);
        Ok(id)
    }

    fn check_caption(&self, caption: &Caption) -> StoryResult<()> {
        if caption.len() > self.config.upload.max_caption_length {
            return Err(StoryError::invalid(format!(
                "caption of {} characters exceeds {}",
                caption.len(),
                self.config.upload.max_caption_length
            )));
        }
        Ok(())
    }
}

fn check_content(content: &StoryContent) -> StoryResult<()> {
    if content.main_file_id().is_none() {
        return Err(StoryError::invalid(format!(
            "unsupported content {:?}",
            content.kind()
        )));
    }
    Ok(())
}

fn expect_done(result: Result<RemoteResponse, RemoteError>, request: &'static str) -> StoryResult<()> {
    match result? {
        RemoteResponse::Done => Ok(()),
        _ => Err(RemoteError::UnexpectedResponse(request).into()),
    }
}

fn report_reason_name(reason: &ReportReason) -> &'static str {
    match reason {
        ReportReason::Spam => "spam",
        ReportReason::Violence => "violence",
        ReportReason::Pornography => "pornography",
        ReportReason::Copyright => "copyright",
        ReportReason::Other(_) => "other",
    }
}
