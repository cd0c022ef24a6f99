//! Send and edit pipeline state
//!
//! A send moves through `queued -> uploading -> ready -> sending ->
//! committed`, or fails from any of those. Uploads complete in any order;
//! finished ones wait in `ready_to_send` until their number is the lowest
//! unsent one, and at most one send request is in flight.
//!
//! Edits carry a per-story generation. Only the newest generation's
//! completions are applied.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use tracing::{debug, trace};

use ephemera_core::{Caption, OwnerId, Story, StoryContent, StoryFullId, StoryId, UploadRequest, UploadedFile};
use ephemera_storage::LogEventId;

use crate::error::{StoryError, StoryResult};
use crate::outbound::UploadId;
use crate::promise::Promise;

/// What a pending story is waiting to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    Send { send_story_num: u32, random_id: i64 },
    Edit { generation: u32 },
}

/// A send or edit in flight
#[derive(Debug, Clone)]
pub struct PendingStory {
    pub owner: OwnerId,
    /// Placeholder until the server numbers a sent story
    pub story_id: StoryId,
    pub kind: PendingKind,
    pub log_event_id: Option<LogEventId>,
    pub was_reuploaded: bool,
    pub reupload_attempts: u32,
    pub send_attempts: u32,
    pub active_period_secs: u32,
    pub story: Story,
}

impl PendingStory {
    pub fn send_story_num(&self) -> Option<u32> {
        match self.kind {
            PendingKind::Send { send_story_num, .. } => Some(send_story_num),
            PendingKind::Edit { .. } => None,
        }
    }

    pub fn story_full_id(&self) -> StoryFullId {
        StoryFullId::new(self.owner, self.story_id)
    }
}

/// A send whose file is uploaded
#[derive(Debug, Clone)]
pub struct ReadyToSendStory {
    pub pending: PendingStory,
    pub file: UploadedFile,
}

/// Draft of an edit in progress
#[derive(Debug)]
pub struct BeingEditedStory {
    pub content: Option<StoryContent>,
    pub caption: Caption,
    pub edit_caption: bool,
    pub promises: Vec<Promise<()>>,
    pub log_event_id: Option<LogEventId>,
    /// Missing-parts re-uploads of the current content
    pub reupload_attempts: u32,
}

/// Sequencing state of sends and edits
#[derive(Debug, Default)]
pub struct UploadPipeline {
    send_story_count: u32,
    yet_unsent: BTreeSet<u32>,
    being_uploaded: HashMap<UploadId, PendingStory>,
    ready_to_send: BTreeMap<u32, ReadyToSendStory>,
    /// Number of the send request in flight
    sending: Option<u32>,
    /// Set while a failed send waits for its retry
    send_paused: bool,
    send_promises: HashMap<u32, Promise<StoryFullId>>,
    being_edited: HashMap<StoryFullId, BeingEditedStory>,
    edit_generations: HashMap<StoryFullId, u32>,
    next_upload_id: u64,
}

impl UploadPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next submission number, strictly increasing
    pub fn next_send_story_num(&mut self) -> u32 {
        self.send_story_count += 1;
        self.send_story_count
    }

    /// Keep numbering above a replayed send
    pub fn observe_send_story_num(&mut self, send_story_num: u32) {
        self.send_story_count = self.send_story_count.max(send_story_num);
    }

    /// Queue a send and start its upload
    pub fn enqueue_send(
        &mut self,
        pending: PendingStory,
        promise: Option<Promise<StoryFullId>>,
    ) -> Option<(UploadId, UploadRequest)> {
        let send_story_num = pending.send_story_num()?;
        let file_id = pending.story.content.as_ref()?.main_file_id()?;
        self.yet_unsent.insert(send_story_num);
        if let Some(promise) = promise {
            self.send_promises.insert(send_story_num, promise);
        }
        Some(self.start_upload(pending, UploadRequest::fresh(file_id)))
    }

    /// Hand a pending story to the file layer
    pub fn start_upload(&mut self, pending: PendingStory, request: UploadRequest) -> (UploadId, UploadRequest) {
        self.next_upload_id += 1;
        let upload_id = UploadId(self.next_upload_id);
        trace!(
            upload = %upload_id,
            file = %request.file_id,
            parts = request.bad_parts.len(),
            "Starting story upload"
        );
        self.being_uploaded.insert(upload_id, pending);
        (upload_id, request)
    }

    /// Take the story whose upload finished; unknown ids yield `None`
    pub fn on_upload_done(&mut self, upload_id: UploadId) -> Option<PendingStory> {
        self.being_uploaded.remove(&upload_id)
    }

    /// Park an uploaded send until its turn comes
    pub fn park_ready(&mut self, ready: ReadyToSendStory) {
        if let Some(send_story_num) = ready.pending.send_story_num() {
            trace!(send_story_num, "Story ready to send");
            self.ready_to_send.insert(send_story_num, ready);
        }
    }

    /// The lowest unsent story, if it is ready and nothing is in flight
    pub fn take_next_to_send(&mut self) -> Option<ReadyToSendStory> {
        if self.sending.is_some() || self.send_paused {
            return None;
        }
        let head = *self.yet_unsent.first()?;
        let ready = self.ready_to_send.remove(&head)?;
        self.sending = Some(head);
        debug!(send_story_num = head, "Sending story");
        Some(ready)
    }

    /// Put a send back after a transient failure; sending pauses until
    /// [`resume_sending`](Self::resume_sending)
    pub fn requeue(&mut self, ready: ReadyToSendStory) {
        self.sending = None;
        self.send_paused = true;
        self.park_ready(ready);
    }

    /// Free the send slot while the in-flight story re-uploads missing parts
    ///
    /// The story keeps its place in the order; later stories wait for it.
    pub fn release_sending(&mut self) {
        self.sending = None;
    }

    pub fn resume_sending(&mut self) {
        self.send_paused = false;
    }

    /// Retire a send, successful or not; returns its caller
    pub fn finish_send(&mut self, send_story_num: u32) -> Option<Promise<StoryFullId>> {
        self.yet_unsent.remove(&send_story_num);
        self.ready_to_send.remove(&send_story_num);
        if self.sending == Some(send_story_num) {
            self.sending = None;
        }
        self.send_promises.remove(&send_story_num)
    }

    pub fn is_sending(&self) -> bool {
        self.sending.is_some()
    }

    /// Submission numbers not yet committed, lowest first
    pub fn yet_unsent(&self) -> Vec<u32> {
        self.yet_unsent.iter().copied().collect()
    }

    pub fn ready_count(&self) -> usize {
        self.ready_to_send.len()
    }

    pub fn uploading_count(&self) -> usize {
        self.being_uploaded.len()
    }

    /// Start or extend an edit; returns the new generation
    ///
    /// A newer edit absorbs the draft and waiters of one still in flight.
    pub fn begin_edit(
        &mut self,
        id: StoryFullId,
        content: Option<StoryContent>,
        caption: Option<Caption>,
        promise: Option<Promise<()>>,
    ) -> u32 {
        let edit = self.being_edited.entry(id).or_insert_with(|| BeingEditedStory {
            content: None,
            caption: Caption::default(),
            edit_caption: false,
            promises: Vec::new(),
            log_event_id: None,
            reupload_attempts: 0,
        });
        if content.is_some() {
            edit.content = content;
            edit.reupload_attempts = 0;
        }
        if let Some(caption) = caption {
            edit.caption = caption;
            edit.edit_caption = true;
        }
        edit.promises.extend(promise);

        let generation = self.edit_generations.entry(id).or_insert(0);
        *generation += 1;
        debug!(story = %id, generation = *generation, "Editing story");
        *generation
    }

    pub fn being_edited(&self, id: StoryFullId) -> Option<&BeingEditedStory> {
        self.being_edited.get(&id)
    }

    pub fn being_edited_mut(&mut self, id: StoryFullId) -> Option<&mut BeingEditedStory> {
        self.being_edited.get_mut(&id)
    }

    pub fn edit_generation(&self, id: StoryFullId) -> u32 {
        self.edit_generations.get(&id).copied().unwrap_or(0)
    }

    /// Whether a completion for `generation` is still wanted
    pub fn is_current_edit(&self, id: StoryFullId, generation: u32) -> bool {
        self.being_edited.contains_key(&id) && self.edit_generation(id) == generation
    }

    /// `StaleCompletion` unless `generation` is the newest edit in flight
    pub fn check_edit_generation(&self, id: StoryFullId, generation: u32) -> StoryResult<()> {
        if self.is_current_edit(id, generation) {
            Ok(())
        } else {
            Err(StoryError::StaleCompletion)
        }
    }

    /// End the current edit of a story
    pub fn finish_edit(&mut self, id: StoryFullId) -> Option<BeingEditedStory> {
        self.being_edited.remove(&id)
    }

    /// Drop everything; dropped promises resolve as canceled
    pub fn clear(&mut self) {
        self.yet_unsent.clear();
        self.being_uploaded.clear();
        self.ready_to_send.clear();
        self.sending = None;
        self.send_paused = false;
        self.send_promises.clear();
        self.being_edited.clear();
    }
}

/// Exponential backoff for the given 1-based attempt
pub fn retry_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}
