//! In-memory collaborators for tests and simulations
//!
//! [`MockRemoteService`] keeps a tiny server-side story table so that sends,
//! reloads and deletes behave plausibly. [`MockFileTransfer`] can hold an
//! upload until it is released, which is how tests force out-of-order
//! completions.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ephemera_core::{FileId, MockFileTransfer};
//!
//! let transfer = MockFileTransfer::new();
//! transfer.hold(FileId(1));
//! // ... start uploads of FileId(1) and FileId(2); the second completes first
//! transfer.release(FileId(1));
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::{DashMap, DashSet};
use tokio::sync::Notify;

use crate::error::{RemoteError, UploadError};
use crate::event::StoryUpdate;
use crate::identity::{FileId, OwnerId, StoryFullId, StoryId, StoryListId};
use crate::remote::{
    AllStories, OwnerStories, RemoteRequest, RemoteResponse, RemoteStoryItem, StoriesPage,
    StoryItem, ViewersPage,
};
use crate::story::InteractionInfo;
use crate::traits::{
    Clock, Dependencies, DependencyResolver, FileTransfer, NotificationSink, RemoteService,
    SystemClock,
};
use crate::transfer::{UploadRequest, UploadedFile};

/// Clock driven by the test
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

type Handler =
    Box<dyn Fn(&RemoteRequest) -> Option<Result<RemoteResponse, RemoteError>> + Send + Sync>;

/// Scriptable in-memory remote story service
pub struct MockRemoteService {
    clock: Arc<dyn Clock>,
    /// Every request in arrival order
    requests: Mutex<Vec<RemoteRequest>>,
    /// Server-side story table
    stories: DashMap<StoryFullId, StoryItem>,
    /// Idempotency: random_id -> story assigned on first send
    sent: DashMap<i64, StoryFullId>,
    next_story_id: AtomicI32,
    /// Owners filed under the archive list
    hidden: DashSet<OwnerId>,
    read_marks: DashMap<OwnerId, StoryId>,
    /// Queued failures: (request name, error), consumed in order
    failures: Mutex<VecDeque<(&'static str, RemoteError)>>,
    handler: Mutex<Option<Handler>>,
}

impl Default for MockRemoteService {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRemoteService {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            requests: Mutex::new(Vec::new()),
            stories: DashMap::new(),
            sent: DashMap::new(),
            next_story_id: AtomicI32::new(1),
            hidden: DashSet::new(),
            read_marks: DashMap::new(),
            failures: Mutex::new(VecDeque::new()),
            handler: Mutex::new(None),
        }
    }

    /// Seed a story on the server side
    pub fn insert_story(&self, owner: OwnerId, item: StoryItem) {
        let next = item.id.0 + 1;
        self.next_story_id.fetch_max(next, Ordering::SeqCst);
        self.stories.insert(StoryFullId::new(owner, item.id), item);
    }

    pub fn remove_story(&self, story_full_id: StoryFullId) {
        self.stories.remove(&story_full_id);
    }

    pub fn has_story(&self, story_full_id: StoryFullId) -> bool {
        self.stories.contains_key(&story_full_id)
    }

    /// File an owner under the archive list
    pub fn hide_owner(&self, owner: OwnerId) {
        self.hidden.insert(owner);
    }

    pub fn is_hidden(&self, owner: OwnerId) -> bool {
        self.hidden.contains(&owner)
    }

    /// Raise an owner's read mark, as a read from another device would
    pub fn mark_read(&self, owner: OwnerId, max_story_id: StoryId) {
        let mut mark = self.read_marks.entry(owner).or_insert(max_story_id);
        if *mark < max_story_id {
            *mark = max_story_id;
        }
    }

    pub fn read_mark(&self, owner: OwnerId) -> Option<StoryId> {
        self.read_marks.get(&owner).map(|mark| *mark)
    }

    /// Fail the next request with the given name
    pub fn fail_next(&self, request_name: &'static str, error: RemoteError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back((request_name, error));
    }

    /// Override responses; returning `None` falls through to the defaults
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&RemoteRequest) -> Option<Result<RemoteResponse, RemoteError>> + Send + Sync + 'static,
    {
        *self.handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(handler));
    }

    pub fn requests(&self) -> Vec<RemoteRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Requests with the given name, in arrival order
    pub fn requests_named(&self, name: &str) -> Vec<RemoteRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.name() == name)
            .collect()
    }

    fn take_failure(&self, name: &'static str) -> Option<RemoteError> {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let position = failures.iter().position(|(n, _)| *n == name)?;
        failures.remove(position).map(|(_, error)| error)
    }

    fn owner_items(&self, owner: OwnerId) -> Vec<StoryItem> {
        let mut items: Vec<StoryItem> = self
            .stories
            .iter()
            .filter(|entry| entry.key().owner == owner)
            .map(|entry| entry.value().clone())
            .collect();
        items.sort_by(|a, b| b.id.cmp(&a.id));
        items
    }

    fn active_items(&self, owner: OwnerId) -> Vec<RemoteStoryItem> {
        let now = self.clock.now();
        self.owner_items(owner)
            .into_iter()
            .filter(|item| item.expire_date > now)
            .map(RemoteStoryItem::Full)
            .collect()
    }

    fn respond(&self, request: &RemoteRequest) -> Result<RemoteResponse, RemoteError> {
        match request {
            RemoteRequest::SendStory {
                owner,
                random_id,
                content,
                caption,
                privacy_rules,
                active_period_secs,
                is_pinned,
                noforwards,
                ..
            } => {
                if let Some(existing) = self.sent.get(random_id) {
                    let item = self
                        .stories
                        .get(existing.value())
                        .map(|entry| entry.value().clone())
                        .ok_or_else(|| RemoteError::NotFound("resent story".into()))?;
                    return Ok(RemoteResponse::StorySent {
                        random_id: *random_id,
                        item,
                    });
                }
                let now = self.clock.now();
                let id = StoryId(self.next_story_id.fetch_add(1, Ordering::SeqCst));
                let item = StoryItem {
                    id,
                    date: now,
                    expire_date: now + Duration::seconds(i64::from(*active_period_secs)),
                    is_min: false,
                    is_edited: false,
                    is_pinned: *is_pinned,
                    noforwards: *noforwards,
                    visibility: privacy_rules.visibility(),
                    content: content.clone(),
                    caption: caption.clone(),
                    privacy_rules: Some(privacy_rules.clone()),
                    interaction_info: Some(InteractionInfo::default()),
                };
                let full_id = StoryFullId::new(*owner, id);
                self.stories.insert(full_id, item.clone());
                self.sent.insert(*random_id, full_id);
                Ok(RemoteResponse::StorySent {
                    random_id: *random_id,
                    item,
                })
            }
            RemoteRequest::EditStory {
                owner,
                story_id,
                content,
                caption,
                privacy_rules,
                ..
            } => {
                let full_id = StoryFullId::new(*owner, *story_id);
                let mut entry = self
                    .stories
                    .get_mut(&full_id)
                    .ok_or_else(|| RemoteError::NotFound(full_id.to_string()))?;
                if let Some(content) = content {
                    entry.content = content.clone();
                }
                if let Some(caption) = caption {
                    entry.caption = caption.clone();
                }
                if let Some(rules) = privacy_rules {
                    entry.visibility = rules.visibility();
                    entry.privacy_rules = Some(rules.clone());
                }
                entry.is_edited = true;
                Ok(RemoteResponse::Done)
            }
            RemoteRequest::TogglePinned {
                owner,
                story_ids,
                is_pinned,
            } => {
                for story_id in story_ids {
                    if let Some(mut entry) = self.stories.get_mut(&StoryFullId::new(*owner, *story_id))
                    {
                        entry.is_pinned = *is_pinned;
                    }
                }
                Ok(RemoteResponse::Done)
            }
            RemoteRequest::DeleteStories { owner, story_ids } => {
                for story_id in story_ids {
                    self.stories.remove(&StoryFullId::new(*owner, *story_id));
                }
                Ok(RemoteResponse::Done)
            }
            RemoteRequest::GetStoriesById { owner, story_ids } => {
                let items: Vec<RemoteStoryItem> = story_ids
                    .iter()
                    .filter_map(|id| self.stories.get(&StoryFullId::new(*owner, *id)))
                    .map(|entry| RemoteStoryItem::Full(entry.value().clone()))
                    .collect();
                Ok(RemoteResponse::Stories(StoriesPage {
                    total_count: items.len() as u32,
                    items,
                }))
            }
            RemoteRequest::GetPinnedStories {
                owner,
                from_story_id,
                limit,
            }
            | RemoteRequest::GetArchive {
                owner,
                from_story_id,
                limit,
            } => {
                let pinned_only = matches!(request, RemoteRequest::GetPinnedStories { .. });
                let all: Vec<StoryItem> = self
                    .owner_items(*owner)
                    .into_iter()
                    .filter(|item| !pinned_only || item.is_pinned)
                    .collect();
                let total_count = all.len() as u32;
                let items = all
                    .into_iter()
                    .filter(|item| !from_story_id.is_server() || item.id < *from_story_id)
                    .take(*limit as usize)
                    .map(RemoteStoryItem::Full)
                    .collect();
                Ok(RemoteResponse::Stories(StoriesPage { total_count, items }))
            }
            RemoteRequest::GetOwnerStories { owner } => {
                Ok(RemoteResponse::OwnerStories(OwnerStories {
                    owner: *owner,
                    max_read_story_id: StoryId::placeholder(),
                    items: self.active_items(*owner),
                }))
            }
            RemoteRequest::GetAllStories { list, .. } => {
                let archived = *list == StoryListId::Archive;
                let mut owners: Vec<OwnerId> = self
                    .stories
                    .iter()
                    .map(|entry| entry.key().owner)
                    .filter(|owner| self.hidden.contains(owner) == archived)
                    .collect();
                owners.sort();
                owners.dedup();
                let owners: Vec<OwnerStories> = owners
                    .into_iter()
                    .map(|owner| OwnerStories {
                        owner,
                        max_read_story_id: StoryId::placeholder(),
                        items: self.active_items(owner),
                    })
                    .filter(|owner_stories| !owner_stories.items.is_empty())
                    .collect();
                Ok(RemoteResponse::AllStories(AllStories::Page {
                    state: format!("state-{}", owners.len()),
                    has_more: false,
                    total_count: owners.len() as u32,
                    owners,
                }))
            }
            RemoteRequest::GetViewers { .. } => Ok(RemoteResponse::Viewers(ViewersPage::default())),
            RemoteRequest::GetStoriesViews { story_ids } => Ok(RemoteResponse::StoryViews(
                story_ids
                    .iter()
                    .map(|id| (*id, InteractionInfo::default()))
                    .collect(),
            )),
            RemoteRequest::ToggleHidden { owner, hidden } => {
                if *hidden {
                    self.hidden.insert(*owner);
                } else {
                    self.hidden.remove(owner);
                }
                Ok(RemoteResponse::Done)
            }
            RemoteRequest::ReadStories {
                owner,
                max_story_id,
            } => {
                self.mark_read(*owner, *max_story_id);
                Ok(RemoteResponse::Done)
            }
            RemoteRequest::GetAllReadStories => {
                let mut marks: Vec<(OwnerId, StoryId)> = self
                    .read_marks
                    .iter()
                    .map(|entry| (*entry.key(), *entry.value()))
                    .collect();
                marks.sort();
                Ok(RemoteResponse::ReadMarks(marks))
            }
            RemoteRequest::IncrementViews { .. }
            | RemoteRequest::Report { .. } => Ok(RemoteResponse::Done),
        }
    }
}

#[async_trait]
impl RemoteService for MockRemoteService {
    async fn execute(&self, request: RemoteRequest) -> Result<RemoteResponse, RemoteError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        if let Some(error) = self.take_failure(request.name()) {
            return Err(error);
        }
        let scripted = self
            .handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(|handler| handler(&request));
        match scripted {
            Some(result) => result,
            None => self.respond(&request),
        }
    }
}

/// In-memory file transfer with per-file hold gates
pub struct MockFileTransfer {
    gates: DashMap<FileId, Arc<Notify>>,
    failures: DashMap<FileId, UploadError>,
    uploads: Mutex<Vec<UploadRequest>>,
    completed: Mutex<Vec<FileId>>,
    next_handle: AtomicU64,
}

impl Default for MockFileTransfer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFileTransfer {
    pub fn new() -> Self {
        Self {
            gates: DashMap::new(),
            failures: DashMap::new(),
            uploads: Mutex::new(Vec::new()),
            completed: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Uploads of `file_id` block until [`release`](Self::release)
    pub fn hold(&self, file_id: FileId) {
        self.gates.insert(file_id, Arc::new(Notify::new()));
    }

    pub fn release(&self, file_id: FileId) {
        if let Some((_, gate)) = self.gates.remove(&file_id) {
            gate.notify_one();
        }
    }

    /// Fail the next upload of `file_id`
    pub fn fail(&self, file_id: FileId, error: UploadError) {
        self.failures.insert(file_id, error);
    }

    pub fn uploads(&self) -> Vec<UploadRequest> {
        self.uploads.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Files in completion order
    pub fn completed(&self) -> Vec<FileId> {
        self.completed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl FileTransfer for MockFileTransfer {
    async fn upload(&self, request: UploadRequest) -> Result<UploadedFile, UploadError> {
        self.uploads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        let gate = self.gates.get(&request.file_id).map(|gate| gate.clone());
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some((_, error)) = self.failures.remove(&request.file_id) {
            return Err(error);
        }

        self.completed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.file_id);
        Ok(UploadedFile {
            file_id: request.file_id,
            handle: self.next_handle.fetch_add(1, Ordering::SeqCst),
            parts: 1,
        })
    }
}

/// Sink that keeps every update
#[derive(Default)]
pub struct RecordingSink {
    updates: Mutex<Vec<StoryUpdate>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<StoryUpdate> {
        self.updates.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Drain recorded updates
    pub fn take(&self) -> Vec<StoryUpdate> {
        std::mem::take(&mut *self.updates.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn count_of(&self, event_type: &str) -> usize {
        self.updates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|update| update.event_type() == event_type)
            .count()
    }
}

impl NotificationSink for RecordingSink {
    fn publish(&self, update: StoryUpdate) {
        self.updates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(update);
    }
}

/// Resolver that accepts everything and counts calls
#[derive(Default)]
pub struct AcceptAllResolver {
    calls: AtomicUsize,
}

impl AcceptAllResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DependencyResolver for AcceptAllResolver {
    fn resolve(&self, _dependencies: &Dependencies, _source: &'static str) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::story::{Caption, PhotoContent, PrivacyRules, StoryContent, unix_time};

    fn send_request(random_id: i64) -> RemoteRequest {
        RemoteRequest::SendStory {
            owner: OwnerId(1),
            random_id,
            file: UploadedFile {
                file_id: FileId(1),
                handle: 1,
                parts: 1,
            },
            content: StoryContent::Photo(PhotoContent {
                file_id: FileId(1),
                width: 1,
                height: 1,
            }),
            caption: Caption::default(),
            privacy_rules: PrivacyRules::default(),
            active_period_secs: 86400,
            is_pinned: false,
            noforwards: false,
        }
    }

    #[tokio::test]
    async fn test_send_is_idempotent_by_random_id() {
        let clock = Arc::new(ManualClock::new(unix_time(1_000)));
        let remote = MockRemoteService::with_clock(clock);

        let first = remote.execute(send_request(77)).await.unwrap();
        let second = remote.execute(send_request(77)).await.unwrap();
        let (RemoteResponse::StorySent { item: a, .. }, RemoteResponse::StorySent { item: b, .. }) =
            (first, second)
        else {
            panic!("expected StorySent responses");
        };
        assert_eq!(a.id, b.id);
        assert_eq!(a.expire_date, unix_time(1_000 + 86400));
    }

    #[tokio::test]
    async fn test_fail_next_consumes_once() {
        let remote = MockRemoteService::new();
        remote.fail_next("send_story", RemoteError::Network("down".into()));

        assert!(remote.execute(send_request(1)).await.is_err());
        assert!(remote.execute(send_request(1)).await.is_ok());
        assert_eq!(remote.requests_named("send_story").len(), 2);
    }

    #[tokio::test]
    async fn test_held_upload_completes_after_release() {
        let transfer = Arc::new(MockFileTransfer::new());
        transfer.hold(FileId(1));

        let held = {
            let transfer = transfer.clone();
            tokio::spawn(async move { transfer.upload(UploadRequest::fresh(FileId(1))).await })
        };
        transfer.upload(UploadRequest::fresh(FileId(2))).await.unwrap();
        transfer.release(FileId(1));
        held.await.unwrap().unwrap();

        assert_eq!(transfer.completed(), vec![FileId(2), FileId(1)]);
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(unix_time(10));
        clock.advance(Duration::seconds(5));
        assert_eq!(clock.now(), unix_time(15));
    }
}
