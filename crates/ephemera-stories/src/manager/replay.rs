//! Startup replay of the mutation log

use tracing::{info, warn};

use ephemera_core::StoryId;
use ephemera_storage::{LogEvent, LogEventId, LogEventKind};

use super::StoryManager;
use crate::error::{StoryError, StoryResult};
use crate::log_event::{
    DeleteStoryOnServerLogEvent, EditStoryLogEvent, LoadExpiringStoriesLogEvent, LogEventPayload,
    ReadStoriesOnServerLogEvent, SendStoryLogEvent,
};
use crate::upload::{PendingKind, PendingStory};

impl StoryManager {
    /// Resume every mutation that was in flight at shutdown
    ///
    /// Events are replayed in append order. One that cannot be decoded or no
    /// longer applies is erased; it never stops the rest of the replay.
    pub(super) fn replay_log_events(&mut self) -> StoryResult<()> {
        let events = self.log.replay_all()?;
        let total = events.len();
        let mut dropped = 0;
        for event in events {
            let LogEvent { id, kind, payload } = event;
            let replayed = match kind {
                LogEventKind::SendStory => self.replay_send(id, &payload),
                LogEventKind::EditStory => self.replay_edit(id, &payload),
                LogEventKind::DeleteStoryOnServer => self.replay_delete(id, &payload),
                LogEventKind::ReadStoriesOnServer => self.replay_read(id, &payload),
                LogEventKind::LoadExpiringStories => self.replay_load_expiring(id, &payload),
            };
            if let Err(e) = replayed {
                warn!(log_event = %id, kind = kind.name(), error = %e, "Dropping log event");
                self.remove_log_event(Some(id));
                dropped += 1;
            }
        }
        if total > 0 {
            info!(total, dropped, "Replayed story log events");
        }
        Ok(())
    }

    fn replay_send(&mut self, id: LogEventId, payload: &[u8]) -> StoryResult<()> {
        let event = SendStoryLogEvent::decode(payload)?;
        self.pipeline.observe_send_story_num(event.send_story_num);
        let pending = PendingStory {
            owner: event.owner,
            story_id: StoryId::placeholder(),
            kind: PendingKind::Send {
                send_story_num: event.send_story_num,
                random_id: event.random_id,
            },
            log_event_id: Some(id),
            was_reuploaded: false,
            reupload_attempts: 0,
            send_attempts: 0,
            active_period_secs: event.active_period_secs,
            story: event.story,
        };
        if !self.enqueue_pending_send(pending, None) {
            return Err(StoryError::CorruptPersistedState(format!(
                "send {} has no file",
                event.send_story_num
            )));
        }
        Ok(())
    }

    fn replay_edit(&mut self, id: LogEventId, payload: &[u8]) -> StoryResult<()> {
        let event = EditStoryLogEvent::decode(payload)?;
        let story_full_id = event.story_full_id;
        if event.content.is_none() && event.caption.is_none() {
            return Err(StoryError::invalid("empty edit"));
        }
        self.cache.get_force(story_full_id)?;
        self.start_edit(story_full_id, event.content, event.caption, None, Some(id));
        Ok(())
    }

    fn replay_delete(&mut self, id: LogEventId, payload: &[u8]) -> StoryResult<()> {
        let event = DeleteStoryOnServerLogEvent::decode(payload)?;
        self.cache.on_delete(event.story_full_id);
        self.delete_story_on_server(event.story_full_id, Some(id))
    }

    fn replay_read(&mut self, id: LogEventId, payload: &[u8]) -> StoryResult<()> {
        let event = ReadStoriesOnServerLogEvent::decode(payload)?;
        let now = self.now();
        self.index
            .on_update_read_stories(&self.cache, event.owner, event.max_story_id, now);
        // One event per owner; an older log may still hold several
        match self.read_log_events.get(&event.owner).copied() {
            Some((_, logged)) if logged >= event.max_story_id => {
                self.remove_log_event(Some(id));
                return Ok(());
            }
            Some((older, _)) => self.remove_log_event(Some(older)),
            None => {}
        }
        self.read_log_events
            .insert(event.owner, (id, event.max_story_id));
        self.issue_read_stories(event.owner, event.max_story_id);
        Ok(())
    }

    fn replay_load_expiring(
        &mut self,
        id: LogEventId,
        payload: &[u8],
    ) -> StoryResult<()> {
        let event = LoadExpiringStoriesLogEvent::decode(payload)?;
        self.load_expiring_stories(event.owner, None, Some(id));
        Ok(())
    }
}
