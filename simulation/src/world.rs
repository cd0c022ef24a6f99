//! Deterministic story engine world
//!
//! A [`World`] wires a [`StoryManager`] to a manual clock, a scripted remote
//! service and either in-memory or on-disk stores. Remote requests are
//! answered as soon as the manager queues them. Uploads are parked until the
//! driver completes them, in whatever order it likes.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::Duration;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info};

use ephemera_core::{
    AcceptAllResolver, Caption, Clock, FileId, ManualClock, MockRemoteService, OwnerId,
    PhotoContent, RecordingSink, RemoteError, RemoteService, StoryContent, StoryId, StoryItem,
    StoryListId, StoryPrivacySettings, StoryVisibility, UploadError, UploadRequest, UploadedFile,
    unix_time,
};
use ephemera_storage::{
    BinlogConfig, FileLogEventStore, InMemoryLogEventStore, InMemoryStoryDatabase, LogEventStore,
    RedbStoryDatabase, RedbStoryDatabaseConfig, StoryDatabase,
};
use ephemera_stories::{
    Inbound, NewStory, Outbound, StoryConfig, StoryManager, UploadId,
};

/// Where the mutation log and the story database live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Storage {
    Memory,
    /// Binlog and redb files under the directory
    Disk(PathBuf),
}

/// Configuration for a simulated world
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// The local account
    pub self_owner: OwnerId,
    /// Unix time the clock starts at
    pub start_time: i64,
    /// Probability that a remote request fails with a network error
    pub network_failure_rate: f64,
    /// Probability that an upload fails
    pub upload_failure_rate: f64,
    pub seed: u64,
    pub storage: Storage,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            self_owner: OwnerId(1),
            start_time: 1_700_000_000,
            network_failure_rate: 0.0,
            upload_failure_rate: 0.0,
            seed: 42,
            storage: Storage::Memory,
        }
    }
}

/// Counters collected while the world runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SimStats {
    pub sends_requested: u64,
    pub uploads_completed: u64,
    pub uploads_failed: u64,
    pub injected_failures: u64,
    pub seconds_elapsed: i64,
    pub restarts: u64,
}

/// Network failure injection shared with the remote handler
struct Faults {
    rate: Mutex<f64>,
    rng: Mutex<StdRng>,
    injected: AtomicU64,
}

impl Faults {
    fn should_fail(&self) -> bool {
        let rate = *self.rate.lock().unwrap_or_else(|e| e.into_inner());
        if rate <= 0.0 {
            return false;
        }
        let fail = self
            .rng
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .random_bool(rate.min(1.0));
        if fail {
            self.injected.fetch_add(1, Ordering::Relaxed);
        }
        fail
    }
}

pub struct World {
    pub config: SimConfig,
    pub story_config: StoryConfig,
    pub manager: StoryManager,
    pub clock: Arc<ManualClock>,
    pub remote: Arc<MockRemoteService>,
    pub sink: Arc<RecordingSink>,
    log: Arc<dyn LogEventStore>,
    database: Arc<dyn StoryDatabase>,
    uploads: VecDeque<(UploadId, UploadRequest)>,
    faults: Arc<Faults>,
    rng: StdRng,
    next_file: u64,
    pub stats: SimStats,
}

impl World {
    pub fn new(config: SimConfig) -> anyhow::Result<Self> {
        let story_config = StoryConfig::for_owner(config.self_owner);
        let clock = Arc::new(ManualClock::new(unix_time(config.start_time)));
        let remote = Arc::new(MockRemoteService::with_clock(clock.clone()));
        let faults = Arc::new(Faults {
            rate: Mutex::new(config.network_failure_rate),
            rng: Mutex::new(StdRng::seed_from_u64(config.seed.wrapping_add(1))),
            injected: AtomicU64::new(0),
        });
        let handler_faults = faults.clone();
        remote.set_handler(move |request| {
            handler_faults
                .should_fail()
                .then(|| Err(RemoteError::Network(format!("injected: {}", request.name()))))
        });

        let (log, database) = open_stores(&config.storage)?;
        let sink = Arc::new(RecordingSink::new());
        let manager = start_manager(&story_config, &clock, &log, &database, &sink)?;

        Ok(Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            story_config,
            manager,
            clock,
            remote,
            sink,
            log,
            database,
            uploads: VecDeque::new(),
            faults,
            next_file: 1,
            stats: SimStats::default(),
        })
    }

    /// Tear the engine down and start a new one on the same stores and server
    ///
    /// Uploads in flight are lost, as they would be in a crashed process.
    pub fn restart(self) -> anyhow::Result<Self> {
        let World {
            config,
            story_config,
            mut manager,
            clock,
            remote,
            sink,
            log,
            database,
            faults,
            rng,
            next_file,
            mut stats,
            ..
        } = self;

        manager.teardown();
        drop(manager);
        let (log, database) = match &config.storage {
            Storage::Memory => (log, database),
            Storage::Disk(_) => {
                // The redb file stays locked while any handle is alive
                drop(log);
                drop(database);
                open_stores(&config.storage)?
            }
        };

        let manager = start_manager(&story_config, &clock, &log, &database, &sink)?;
        stats.restarts += 1;
        info!(restarts = stats.restarts, "Engine restarted");

        Ok(Self {
            config,
            story_config,
            manager,
            clock,
            remote,
            sink,
            log,
            database,
            uploads: VecDeque::new(),
            faults,
            rng,
            next_file,
            stats,
        })
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
                        debug!(upload = %upload_id, file = %request.file_id, "Upload parked");
                        self.uploads.push_back((upload_id, request));
                    }
                }
            }
        }
        self.stats.injected_failures = self.faults.injected.load(Ordering::Relaxed);
    }

    /// Files with an upload waiting for completion, in start order
    pub fn pending_uploads(&self) -> Vec<FileId> {
        self.uploads.iter().map(|(_, request)| request.file_id).collect()
    }

    /// Finish the oldest upload of `file_id`; false if none is parked
    pub async fn finish_upload(&mut self, file_id: FileId) -> bool {
        let Some(position) = self
            .uploads
            .iter()
            .position(|(_, request)| request.file_id == file_id)
        else {
            return false;
        };
        let Some((upload_id, _)) = self.uploads.remove(position) else {
            return false;
        };

        let fails = self.config.upload_failure_rate > 0.0
            && self
                .rng
                .random_bool(self.config.upload_failure_rate.min(1.0));
        let result = if fails {
            self.stats.uploads_failed += 1;
            Err(UploadError::Failed("simulated transfer failure".into()))
        } else {
            self.stats.uploads_completed += 1;
            Ok(UploadedFile {
                file_id,
                handle: upload_id.0,
                parts: 1,
            })
        };
        self.manager
            .handle_inbound(Inbound::Upload { upload_id, result });
        self.pump().await;
        true
    }

    /// Finish every parked upload in shuffled order, including re-uploads
    /// started along the way
    pub async fn finish_all_uploads(&mut self) -> usize {
        let mut finished = 0;
        while !self.uploads.is_empty() {
            let mut files = self.pending_uploads();
            files.shuffle(&mut self.rng);
            for file_id in files {
                if self.finish_upload(file_id).await {
                    finished += 1;
                }
            }
        }
        finished
    }

    /// Move the clock forward and fire due timers
    pub async fn advance(&mut self, secs: i64) {
        self.clock.advance(Duration::seconds(secs));
        self.stats.seconds_elapsed += secs;
        self.manager.tick();
        self.pump().await;
    }

    /// Change the injected network failure rate
    pub fn set_network_failure_rate(&self, rate: f64) {
        *self.faults.rate.lock().unwrap_or_else(|e| e.into_inner()) = rate;
    }

    /// A fresh photo story of the local account
    pub fn next_story(&mut self) -> NewStory {
        let file = self.next_file;
        self.next_file += 1;
        self.stats.sends_requested += 1;
        NewStory {
            content: photo(file),
            caption: Caption::plain(format!("story {file}")),
            privacy: StoryPrivacySettings::Everyone { except: Vec::new() },
            active_period_secs: 86400,
            is_pinned: false,
            noforwards: false,
        }
    }

    /// Put `count` stories of `owner` on the server, posted `spacing`
    /// seconds apart and ending `newest_age` seconds ago
    pub fn seed_owner(
        &self,
        owner: OwnerId,
        first_id: i32,
        count: i32,
        newest_age: i64,
        spacing: i64,
    ) {
        let now = self.clock.now().timestamp();
        for n in 0..count {
            let age = newest_age + spacing * i64::from(count - 1 - n);
            let date = now - age;
            self.remote
                .insert_story(owner, server_story(StoryId(first_id + n), date, 86400));
        }
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Mutation log events still waiting for the server
    pub fn pending_log_events(&self) -> usize {
        self.log.replay_all().map(|events| events.len()).unwrap_or(0)
    }

    pub fn state_summary(&self) -> String {
        let index = self.manager.index();
        format!(
            "t=+{}s cache={} main={} archive={} unsent={} uploads={} log={}",
            self.stats.seconds_elapsed,
            self.manager.cache().len(),
            index.list(StoryListId::Main).len(),
            index.list(StoryListId::Archive).len(),
            self.manager.pipeline().yet_unsent().len(),
            self.uploads.len(),
            self.pending_log_events(),
        )
    }
}

fn open_stores(
    storage: &Storage,
) -> anyhow::Result<(Arc<dyn LogEventStore>, Arc<dyn StoryDatabase>)> {
    match storage {
        Storage::Memory => Ok((
            Arc::new(InMemoryLogEventStore::new()),
            Arc::new(InMemoryStoryDatabase::new()),
        )),
        Storage::Disk(dir) => {
            let log = FileLogEventStore::open(BinlogConfig::at(dir.join("stories.binlog")))
                .context("opening the story binlog")?;
            let database = RedbStoryDatabase::open(RedbStoryDatabaseConfig {
                db_path: dir.join("stories.redb"),
                ..Default::default()
            })
            .context("opening the story database")?;
            Ok((Arc::new(log), Arc::new(database)))
        }
    }
}

fn start_manager(
    config: &StoryConfig,
    clock: &Arc<ManualClock>,
    log: &Arc<dyn LogEventStore>,
    database: &Arc<dyn StoryDatabase>,
    sink: &Arc<RecordingSink>,
) -> anyhow::Result<StoryManager> {
    StoryManager::new(
        config.clone(),
        clock.clone(),
        log.clone(),
        database.clone(),
        sink.clone(),
        Arc::new(AcceptAllResolver::new()),
    )
    .context("starting the story manager")
}

pub fn photo(file: u64) -> StoryContent {
    StoryContent::Photo(PhotoContent {
        file_id: FileId(file),
        width: 1080,
        height: 1920,
    })
}

/// A public server-side story posted at unix time `date`
pub fn server_story(id: StoryId, date: i64, period: i64) -> StoryItem {
    let posted = unix_time(date);
    StoryItem {
        id,
        date: posted,
        expire_date: posted + Duration::seconds(period),
        is_min: false,
        is_edited: false,
        is_pinned: false,
        noforwards: false,
        visibility: StoryVisibility {
            is_public: true,
            ..Default::default()
        },
        content: photo(10_000 + id.0 as u64),
        caption: Caption::plain(format!("server story {}", id.0)),
        privacy_rules: None,
        interaction_info: None,
    }
}
