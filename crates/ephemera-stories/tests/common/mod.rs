//! Deterministic driver for story manager tests
//!
//! Remote requests are answered by [`MockRemoteService`] as soon as they are
//! queued. Uploads are parked until the test completes them, so tests choose
//! the order in which files finish.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::Duration;

use ephemera_core::{
    AcceptAllResolver, Caption, FileId, ManualClock, MockRemoteService, OwnerId, PhotoContent,
    RecordingSink, RemoteRequest, RemoteService, StoryContent, StoryId, StoryItem, StoryPrivacySettings,
    StoryVisibility, UploadError, UploadRequest, UploadedFile, unix_time,
};
use ephemera_storage::{InMemoryLogEventStore, InMemoryStoryDatabase};
use ephemera_stories::{
    Inbound, NewStory, Outbound, QueryId, StoryConfig, StoryManager, UploadId,
};

pub const ME: OwnerId = OwnerId(1);
pub const ALICE: OwnerId = OwnerId(2);
pub const BOB: OwnerId = OwnerId(3);
pub const START: i64 = 1_700_000_000;
pub const DAY: u32 = 86400;

pub struct Harness {
    pub manager: StoryManager,
    pub clock: Arc<ManualClock>,
    pub remote: Arc<MockRemoteService>,
    pub sink: Arc<RecordingSink>,
    pub log: Arc<InMemoryLogEventStore>,
    pub database: Arc<InMemoryStoryDatabase>,
    pub config: StoryConfig,
    uploads: Vec<(UploadId, UploadRequest)>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(StoryConfig::for_owner(ME))
    }

    pub fn with_config(config: StoryConfig) -> Self {
        let clock = Arc::new(ManualClock::new(unix_time(START)));
        let remote = Arc::new(MockRemoteService::with_clock(clock.clone()));
        let log = Arc::new(InMemoryLogEventStore::new());
        let database = Arc::new(InMemoryStoryDatabase::new());
        Self::assemble(config, clock, remote, log, database)
    }

    fn assemble(
        config: StoryConfig,
        clock: Arc<ManualClock>,
        remote: Arc<MockRemoteService>,
        log: Arc<InMemoryLogEventStore>,
        database: Arc<InMemoryStoryDatabase>,
    ) -> Self {
        let sink = Arc::new(RecordingSink::new());
        let manager = StoryManager::new(
            config.clone(),
            clock.clone(),
            log.clone(),
            database.clone(),
            sink.clone(),
            Arc::new(AcceptAllResolver::new()),
        )
        .expect("manager starts");
        Self {
            manager,
            clock,
            remote,
            sink,
            log,
            database,
            config,
            uploads: Vec::new(),
        }
    }

    /// Simulate a process restart: same log, database, server and clock
    pub fn restart(self) -> Self {
        let Harness {
            mut manager,
            clock,
            remote,
            log,
            database,
            config,
            ..
        } = self;
        manager.teardown();
        drop(manager);
        Self::assemble(config, clock, remote, log, database)
    }

    /// Answer queued requests until the manager has nothing more to say
    pub async fn pump(&mut self) {
        loop {
            let outbound = self.manager.take_outbound();
            if outbound.is_empty() {
                break;
            }
            for item in outbound {
                match item {
                    Outbound::Remote { query_id, request } => {
                        let result = self.remote.execute(request).await;
                        self.manager
                            .handle_inbound(Inbound::Remote { query_id, result });
                    }
                    Outbound::Upload { upload_id, request } => {
                        self.uploads.push((upload_id, request));
                    }
                }
            }
        }
    }

    /// Take queued requests without answering them; uploads are parked
    pub fn hold_requests(&mut self) -> Vec<(QueryId, RemoteRequest)> {
        let mut held = Vec::new();
        for item in self.manager.take_outbound() {
            match item {
                Outbound::Remote { query_id, request } => held.push((query_id, request)),
                Outbound::Upload { upload_id, request } => self.uploads.push((upload_id, request)),
            }
        }
        held
    }

    /// Answer one held request, then everything it triggers
    pub async fn answer(&mut self, query_id: QueryId, request: RemoteRequest) {
        let result = self.remote.execute(request).await;
        self.manager
            .handle_inbound(Inbound::Remote { query_id, result });
        self.pump().await;
    }

    /// Files with an upload waiting for completion, in start order
    pub fn pending_uploads(&self) -> Vec<UploadRequest> {
        self.uploads.iter().map(|(_, request)| request.clone()).collect()
    }

    fn take_upload(&mut self, file_id: FileId) -> (UploadId, UploadRequest) {
        let position = self
            .uploads
            .iter()
            .position(|(_, request)| request.file_id == file_id)
            .expect("upload of file is pending");
        self.uploads.remove(position)
    }

    pub async fn finish_upload(&mut self, file_id: FileId) {
        let (upload_id, _) = self.take_upload(file_id);
        self.manager.handle_inbound(Inbound::Upload {
            upload_id,
            result: Ok(UploadedFile {
                file_id,
                handle: upload_id.0,
                parts: 1,
            }),
        });
        self.pump().await;
    }

    pub async fn fail_upload(&mut self, file_id: FileId) {
        let (upload_id, _) = self.take_upload(file_id);
        self.manager.handle_inbound(Inbound::Upload {
            upload_id,
            result: Err(UploadError::Failed("disk gone".into())),
        });
        self.pump().await;
    }

    pub async fn finish_all_uploads(&mut self) {
        while let Some((_, request)) = self.uploads.first() {
            let file_id = request.file_id;
            self.finish_upload(file_id).await;
        }
    }

    /// Move the clock and fire due timers, leaving their requests queued
    pub fn advance_held(&mut self, secs: i64) {
        self.clock.advance(Duration::seconds(secs));
        self.manager.tick();
    }

    /// Move the clock forward and fire due timers
    pub async fn advance(&mut self, secs: i64) {
        self.clock.advance(Duration::seconds(secs));
        self.manager.tick();
        self.pump().await;
    }
}

pub fn photo(file: u64) -> StoryContent {
    StoryContent::Photo(PhotoContent {
        file_id: FileId(file),
        width: 1080,
        height: 1920,
    })
}

pub fn new_story(file: u64) -> NewStory {
    NewStory {
        content: photo(file),
        caption: Caption::plain(format!("story {file}")),
        privacy: StoryPrivacySettings::Everyone { except: Vec::new() },
        active_period_secs: DAY,
        is_pinned: false,
        noforwards: false,
    }
}

/// A server-side story posted `age` seconds before the test start
pub fn server_story(id: i32, age: i64, period: i64) -> StoryItem {
    let date = unix_time(START - age);
    StoryItem {
        id: StoryId(id),
        date,
        expire_date: date + Duration::seconds(period),
        is_min: false,
        is_edited: false,
        is_pinned: false,
        noforwards: false,
        visibility: StoryVisibility {
            is_public: true,
            ..Default::default()
        },
        content: photo(1000 + id as u64),
        caption: Caption::plain(format!("server story {id}")),
        privacy_rules: None,
        interaction_info: None,
    }
}
