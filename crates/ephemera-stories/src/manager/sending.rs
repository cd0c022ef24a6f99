//! Uploads, sends and edits

use chrono::Duration;
use tracing::{debug, info, warn};

use ephemera_core::{
    Caption, OwnerId, RemoteError, RemoteRequest, RemoteResponse, RemoteStoryItem, Story,
    StoryContent, StoryFullId, StoryId, StoryItem, StoryPrivacySettings, StoryUpdate, UploadError,
    UploadRequest, UploadedFile,
};
use ephemera_storage::LogEventId;

use super::{NewStory, PendingQuery, StoryManager, expect_done};
use crate::config::deadline_after;
use crate::error::{StoryError, StoryResult};
use crate::log_event::{DeleteStoryOnServerLogEvent, EditStoryLogEvent, SendStoryLogEvent};
use crate::outbound::{Outbound, UploadId};
use crate::promise::{Promise, resolve_all};
use crate::upload::{PendingKind, PendingStory, ReadyToSendStory, retry_delay};

impl StoryManager {
    pub(super) fn start_send(&mut self, owner: OwnerId, new: NewStory, promise: Promise<StoryFullId>) {
        let now = self.now();
        let rules = new.privacy.to_rules();
        let expire_date = now + Duration::seconds(i64::from(new.active_period_secs));
        let mut story = Story::placeholder(now, expire_date, now);
        story.apply_visibility(rules.visibility());
        story.privacy_rules = rules;
        story.is_pinned = new.is_pinned;
        story.noforwards = new.noforwards;
        story.content = Some(new.content);
        story.caption = new.caption;

        let send_story_num = self.pipeline.next_send_story_num();
        let random_id = loop {
            let id = rand::random::<i64>();
            if id != 0 {
                break id;
            }
        };
        let event = SendStoryLogEvent {
            owner,
            send_story_num,
            random_id,
            active_period_secs: new.active_period_secs,
            story,
        };
        let log_event_id = match self.write_log_event(None, &event) {
            Ok(id) => id,
            Err(e) => {
                warn!(send_story_num, error = %e, "Failed to log story send");
                promise.set_error(e);
                return;
            }
        };
        info!(send_story_num, owner = %owner, "Queued story send");

        let pending = PendingStory {
            owner,
            story_id: StoryId::placeholder(),
            kind: PendingKind::Send {
                send_story_num,
                random_id,
            },
            log_event_id: Some(log_event_id),
            was_reuploaded: false,
            reupload_attempts: 0,
            send_attempts: 0,
            active_period_secs: event.active_period_secs,
            story: event.story,
        };
        self.enqueue_pending_send(pending, Some(promise));
    }

    /// Queue a send for upload; false if the story has nothing to upload
    pub(super) fn enqueue_pending_send(
        &mut self,
        pending: PendingStory,
        promise: Option<Promise<StoryFullId>>,
    ) -> bool {
        match self.pipeline.enqueue_send(pending, promise) {
            Some((upload_id, request)) => {
                self.outbound.push_back(Outbound::Upload { upload_id, request });
                true
            }
            None => false,
        }
    }

    pub(super) fn on_upload_result(
        &mut self,
        upload_id: UploadId,
        result: Result<UploadedFile, UploadError>,
    ) {
        let Some(pending) = self.pipeline.on_upload_done(upload_id) else {
            debug!(upload = %upload_id, "Completion for unknown upload");
            return;
        };
        match pending.kind {
            PendingKind::Send { .. } => match result {
                Ok(file) => {
                    self.pipeline.park_ready(ReadyToSendStory { pending, file });
                    self.try_send_next();
                }
                Err(e) => self.fail_send(pending, e.into()),
            },
            PendingKind::Edit { generation } => {
                let id = pending.story_full_id();
                if let Err(e) = self.pipeline.check_edit_generation(id, generation) {
                    debug!(story = %id, generation, error = %e, "Dropping edit upload");
                    return;
                }
                match result {
                    Ok(file) => self.issue_edit(id, generation, Some(file)),
                    Err(e) => self.fail_edit(id, e.into()),
                }
            }
        }
    }

    /// Send the lowest unsent story if it is uploaded and nothing is in flight
    pub(super) fn try_send_next(&mut self) {
        let Some(ready) = self.pipeline.take_next_to_send() else {
            return;
        };
        let PendingKind::Send { random_id, .. } = ready.pending.kind else {
            return;
        };
        let story = &ready.pending.story;
        let Some(content) = story.content.clone() else {
            let pending = ready.pending;
            self.fail_send(pending, StoryError::invalid("story has no content"));
            return;
        };
        let request = RemoteRequest::SendStory {
            owner: ready.pending.owner,
            random_id,
            file: ready.file.clone(),
            content,
            caption: story.caption.clone(),
            privacy_rules: story.privacy_rules.clone(),
            active_period_secs: ready.pending.active_period_secs,
            is_pinned: story.is_pinned,
            noforwards: story.noforwards,
        };
        self.issue(
            request,
            PendingQuery::Send {
                ready: Box::new(ready),
            },
        );
    }

    pub(super) fn on_send_result(
        &mut self,
        mut ready: ReadyToSendStory,
        result: Result<RemoteResponse, RemoteError>,
    ) {
        let Some(send_story_num) = ready.pending.send_story_num() else {
            return;
        };
        match result {
            Ok(RemoteResponse::StorySent { item, .. }) => self.commit_send(ready.pending, item),
            Ok(other) => {
                warn!(send_story_num, response = other.kind(), "Unexpected send response");
                self.fail_send(
                    ready.pending,
                    RemoteError::UnexpectedResponse("send_story").into(),
                );
            }
            Err(RemoteError::FilePartsMissing(parts)) => {
                if ready.pending.reupload_attempts >= self.config.upload.max_reupload_attempts {
                    self.fail_send(ready.pending, StoryError::FilePartsMissing(parts));
                    return;
                }
                info!(send_story_num, parts = ?parts, "Re-uploading missing file parts");
                let file_id = ready.file.file_id;
                let mut pending = ready.pending;
                pending.reupload_attempts += 1;
                pending.was_reuploaded = true;
                self.pipeline.release_sending();
                let (upload_id, request) = self.pipeline.start_upload(
                    pending,
                    UploadRequest {
                        file_id,
                        bad_parts: parts,
                    },
                );
                self.outbound.push_back(Outbound::Upload { upload_id, request });
            }
            Err(e) if e.is_transient() => {
                ready.pending.send_attempts += 1;
                let attempts = ready.pending.send_attempts;
                if attempts > self.config.upload.max_send_retries {
                    self.fail_send(ready.pending, e.into());
                    return;
                }
                let delay = retry_delay(
                    attempts,
                    self.config.upload.retry_backoff_base,
                    self.config.upload.retry_backoff_max,
                );
                warn!(send_story_num, attempts, delay_ms = delay.as_millis() as u64, error = %e, "Story send failed, retrying");
                let at = deadline_after(self.now(), delay);
                self.pipeline.requeue(ready);
                self.scheduler.schedule_send_retry(at);
            }
            Err(e) => self.fail_send(ready.pending, e.into()),
        }
    }

    fn commit_send(&mut self, pending: PendingStory, item: StoryItem) {
        let Some(send_story_num) = pending.send_story_num() else {
            return;
        };
        let now = self.now();
        let owner = pending.owner;
        let id = StoryFullId::new(owner, item.id);

        self.merge_story(owner, RemoteStoryItem::Full(item), now);
        if self.index.add_story(&self.cache, id, now) {
            self.publish_active(owner);
        }
        self.remove_log_event(pending.log_event_id);
        info!(send_story_num, story = %id, reuploaded = pending.was_reuploaded, "Story sent");
        self.sink.publish(StoryUpdate::StorySendSucceeded {
            send_story_num,
            story_full_id: id,
        });
        if let Some(promise) = self.pipeline.finish_send(send_story_num) {
            promise.set_value(id);
        }
        self.scheduler.schedule_interaction_refresh(deadline_after(
            now,
            self.config.polling.interaction_refresh_period,
        ));
        self.try_send_next();
    }

    /// Retire a send for good and move on to the next one
    fn fail_send(&mut self, pending: PendingStory, error: StoryError) {
        let Some(send_story_num) = pending.send_story_num() else {
            return;
        };
        warn!(send_story_num, error = %error, "Story send failed");
        self.remove_log_event(pending.log_event_id);
        self.sink.publish(StoryUpdate::StorySendFailed {
            send_story_num,
            owner: pending.owner,
            reason: error.to_string(),
        });
        if let Some(promise) = self.pipeline.finish_send(send_story_num) {
            promise.set_error(error);
        }
        self.try_send_next();
    }

    // ------------------------------------------------------------------
    // Edits
    // ------------------------------------------------------------------

    /// Start or extend an edit and persist its draft
    pub(super) fn start_edit(
        &mut self,
        id: StoryFullId,
        content: Option<StoryContent>,
        caption: Option<Caption>,
        promise: Option<Promise<()>>,
        replayed: Option<LogEventId>,
    ) {
        let generation = self.pipeline.begin_edit(id, content, caption, promise);
        let Some(edit) = self.pipeline.being_edited(id) else {
            return;
        };
        let event = EditStoryLogEvent {
            story_full_id: id,
            content: edit.content.clone(),
            caption: edit.edit_caption.then(|| edit.caption.clone()),
        };
        let existing = edit.log_event_id.or(replayed);
        let draft_content = edit.content.clone();
        match self.write_log_event(existing, &event) {
            Ok(log_event_id) => {
                if let Some(edit) = self.pipeline.being_edited_mut(id) {
                    edit.log_event_id = Some(log_event_id);
                }
            }
            Err(e) => warn!(story = %id, error = %e, "Failed to log story edit"),
        }

        let Some(file_id) = draft_content.as_ref().and_then(StoryContent::main_file_id) else {
            self.issue_edit(id, generation, None);
            return;
        };
        let Some(story) = self.cache.get(id).cloned() else {
            self.fail_edit(id, StoryError::not_found(id.to_string()));
            return;
        };
        let pending = PendingStory {
            owner: id.owner,
            story_id: id.story_id,
            kind: PendingKind::Edit { generation },
            log_event_id: None,
            was_reuploaded: false,
            reupload_attempts: 0,
            send_attempts: 0,
            active_period_secs: 0,
            story,
        };
        let (upload_id, request) = self
            .pipeline
            .start_upload(pending, UploadRequest::fresh(file_id));
        self.outbound.push_back(Outbound::Upload { upload_id, request });
    }

    fn issue_edit(&mut self, id: StoryFullId, generation: u32, file: Option<UploadedFile>) {
        let Some(edit) = self.pipeline.being_edited(id) else {
            return;
        };
        let request = RemoteRequest::EditStory {
            owner: id.owner,
            story_id: id.story_id,
            file,
            content: edit.content.clone(),
            caption: edit.edit_caption.then(|| edit.caption.clone()),
            privacy_rules: None,
        };
        self.issue(
            request,
            PendingQuery::Edit {
                story_full_id: id,
                generation,
            },
        );
    }

    pub(super) fn on_edit_result(
        &mut self,
        id: StoryFullId,
        generation: u32,
        result: Result<RemoteResponse, RemoteError>,
    ) {
        if let Err(e) = self.pipeline.check_edit_generation(id, generation) {
            debug!(story = %id, generation, error = %e, "Dropping edit completion");
            return;
        }
        if let Err(RemoteError::FilePartsMissing(parts)) = result {
            self.reupload_edit(id, generation, parts);
            return;
        }
        if let Err(e) = expect_done(result, "edit_story") {
            self.fail_edit(id, e);
            return;
        }
        let Some(edit) = self.pipeline.finish_edit(id) else {
            return;
        };
        if let Some(story) = self.cache.get_editable(id) {
            if let Some(content) = edit.content {
                story.content = Some(content);
            }
            if edit.edit_caption {
                story.caption = edit.caption;
            }
            story.is_edited = true;
        }
        if let Err(e) = self.cache.save(id) {
            warn!(story = %id, error = %e, "Failed to persist edited story");
        }
        self.send_update_story(id);
        self.remove_log_event(edit.log_event_id);
        info!(story = %id, generation, "Story edited");
        resolve_all(edit.promises, Ok(()));
    }

    /// Upload the parts the server lost, then resend the same generation
    fn reupload_edit(&mut self, id: StoryFullId, generation: u32, parts: Vec<u32>) {
        let max_attempts = self.config.upload.max_reupload_attempts;
        let Some(edit) = self.pipeline.being_edited_mut(id) else {
            return;
        };
        let file_id = edit.content.as_ref().and_then(StoryContent::main_file_id);
        let (Some(file_id), true) = (file_id, edit.reupload_attempts < max_attempts) else {
            self.fail_edit(id, StoryError::FilePartsMissing(parts));
            return;
        };
        edit.reupload_attempts += 1;
        let attempts = edit.reupload_attempts;
        let Some(story) = self.cache.get(id).cloned() else {
            self.fail_edit(id, StoryError::not_found(id.to_string()));
            return;
        };
        info!(story = %id, generation, attempts, parts = ?parts, "Re-uploading missing parts of edit");
        let pending = PendingStory {
            owner: id.owner,
            story_id: id.story_id,
            kind: PendingKind::Edit { generation },
            log_event_id: None,
            was_reuploaded: true,
            reupload_attempts: attempts,
            send_attempts: 0,
            active_period_secs: 0,
            story,
        };
        let (upload_id, request) = self.pipeline.start_upload(
            pending,
            UploadRequest {
                file_id,
                bad_parts: parts,
            },
        );
        self.outbound.push_back(Outbound::Upload { upload_id, request });
    }

    fn fail_edit(&mut self, id: StoryFullId, error: StoryError) {
        let Some(edit) = self.pipeline.finish_edit(id) else {
            return;
        };
        warn!(story = %id, error = %error, "Story edit failed");
        self.remove_log_event(edit.log_event_id);
        resolve_all(edit.promises, Err(error));
    }

    // ------------------------------------------------------------------
    // Privacy, pinning and deletion
    // ------------------------------------------------------------------

    pub(super) fn on_set_privacy_result(
        &mut self,
        id: StoryFullId,
        settings: StoryPrivacySettings,
        promise: Promise<()>,
        result: Result<RemoteResponse, RemoteError>,
    ) {
        if let Err(e) = expect_done(result, "edit_story") {
            promise.set_error(e);
            return;
        }
        let now = self.now();
        if let Some(story) = self.cache.get_editable(id) {
            let rules = settings.to_rules();
            story.apply_visibility(rules.visibility());
            story.privacy_rules = rules;
        }
        if let Err(e) = self.cache.save(id) {
            warn!(story = %id, error = %e, "Failed to persist story privacy");
        }
        self.send_update_story(id);
        if self.index.get(id.owner).is_some() {
            self.update_active(id.owner, now);
        }
        promise.set_value(());
    }

    pub(super) fn on_toggle_pinned_result(
        &mut self,
        id: StoryFullId,
        is_pinned: bool,
        promise: Promise<()>,
        result: Result<RemoteResponse, RemoteError>,
    ) {
        if let Err(e) = expect_done(result, "toggle_pinned") {
            promise.set_error(e);
            return;
        }
        let changed = match self.cache.get_editable(id) {
            Some(story) if story.is_pinned != is_pinned => {
                story.is_pinned = is_pinned;
                true
            }
            _ => false,
        };
        if changed {
            if let Err(e) = self.cache.save(id) {
                warn!(story = %id, error = %e, "Failed to persist pinned flag");
            }
            self.send_update_story(id);
        }
        promise.set_value(());
    }

    /// Delete a story on the server, durably
    ///
    /// Replay passes the event it found so the same record is reused.
    pub(super) fn delete_story_on_server(
        &mut self,
        id: StoryFullId,
        replayed: Option<LogEventId>,
    ) -> StoryResult<()> {
        let log_event_id = match replayed {
            Some(log_event_id) => log_event_id,
            None => self.write_log_event(None, &DeleteStoryOnServerLogEvent { story_full_id: id })?,
        };
        self.issue(
            RemoteRequest::DeleteStories {
                owner: id.owner,
                story_ids: vec![id.story_id],
            },
            PendingQuery::DeleteOnServer {
                story_full_id: id,
                log_event_id: Some(log_event_id),
            },
        );
        Ok(())
    }

    pub(super) fn on_delete_on_server_result(
        &mut self,
        id: StoryFullId,
        log_event_id: Option<LogEventId>,
        result: Result<RemoteResponse, RemoteError>,
    ) {
        match expect_done(result, "delete_stories") {
            Ok(()) => {
                debug!(story = %id, "Story deleted on server");
                self.remove_log_event(log_event_id);
            }
            Err(StoryError::TransientNetwork(e)) => {
                // Kept in the log; the next start retries
                warn!(story = %id, error = %e, "Server delete failed");
            }
            Err(e) => {
                warn!(story = %id, error = %e, "Server rejected story delete");
                self.remove_log_event(log_event_id);
            }
        }
    }
}
