//! Scripted scenarios for the story engine
//!
//! Each scenario drives a [`World`] (or a live [`StoryService`]) through one
//! behaviour of the engine, prints what happened and returns a report that
//! the tests check.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use rand::Rng;
use rand::seq::IndexedRandom;
use serde::Serialize;
use tracing::info;

use ephemera_core::{
    AcceptAllResolver, BroadcastSink, Caption, FileId, MockFileTransfer, MockRemoteService,
    OwnerId, RemoteError, RemoteRequest, StoryFullId, StoryId, StoryListId,
    StoryPrivacySettings, StoryUpdate, SystemClock,
};
use ephemera_storage::{InMemoryLogEventStore, InMemoryStoryDatabase};
use ephemera_stories::{NewStory, StoryConfig, StoryError, StoryManager, StoryService};

use crate::world::{SimConfig, SimStats, Storage, World, photo, server_story};

/// Outcome of [`run_ordered_sends`]
#[derive(Debug, Clone, Serialize)]
pub struct OrderedSendsReport {
    /// Story ids in submission order
    pub story_ids: Vec<StoryId>,
    /// Files in the order their uploads finished
    pub upload_order: Vec<FileId>,
}

/// Send several stories and finish their uploads newest first
///
/// The server still numbers them in submission order.
pub async fn run_ordered_sends(count: u32) -> anyhow::Result<OrderedSendsReport> {
    info!(count, "=== Running Ordered Sends Scenario ===");
    let mut world = World::new(SimConfig::default())?;
    let me = world.config.self_owner;

    let mut sends = Vec::new();
    for _ in 0..count {
        let story = world.next_story();
        sends.push(world.manager.send_story(me, story));
    }
    world.pump().await;
    println!("  {}", world.state_summary());

    let mut upload_order = world.pending_uploads();
    upload_order.reverse();
    for file_id in &upload_order {
        world.finish_upload(*file_id).await;
        println!("  upload of {file_id} finished: {}", world.state_summary());
    }

    let mut story_ids = Vec::new();
    for send in sends {
        let id = send.await.context("send should succeed")?;
        story_ids.push(id.story_id);
    }
    println!("\n  story ids in submission order: {story_ids:?}");

    Ok(OrderedSendsReport {
        story_ids,
        upload_order,
    })
}

/// Outcome of [`run_restart_recovery`]
#[derive(Debug, Clone, Serialize)]
pub struct RestartReport {
    pub log_events_before_restart: usize,
    pub log_events_after_recovery: usize,
    /// `random_id` of every send request the server saw
    pub send_random_ids: Vec<i64>,
    pub stories_sent: usize,
}

impl RestartReport {
    /// Whether the interrupted send reused its random id after the restart
    pub fn resent_idempotently(&self) -> bool {
        match self.send_random_ids.as_slice() {
            [first, second, ..] => first == second,
            _ => false,
        }
    }
}

/// Interrupt two sends with a network failure, restart and recover them
///
/// With `data_dir` set, the binlog and database live on disk.
pub async fn run_restart_recovery(data_dir: Option<PathBuf>) -> anyhow::Result<RestartReport> {
    info!("=== Running Restart Recovery Scenario ===");
    let storage = data_dir.map_or(Storage::Memory, Storage::Disk);
    let mut world = World::new(SimConfig {
        storage,
        ..SimConfig::default()
    })?;
    let me = world.config.self_owner;

    println!("\n--- Step 1: two sends, the first hits a dead network ---");
    world
        .remote
        .fail_next("send_story", RemoteError::Network("link down".into()));
    for _ in 0..2 {
        let story = world.next_story();
        // Dropped: the engine keeps going without a listener
        let _ = world.manager.send_story(me, story);
    }
    world.pump().await;
    world.finish_all_uploads().await;
    let log_events_before_restart = world.pending_log_events();
    println!("  {}", world.state_summary());

    println!("\n--- Step 2: the process restarts before the retry ---");
    let mut world = world.restart()?;
    world.pump().await;
    println!("  {}", world.state_summary());

    println!("\n--- Step 3: uploads finish again, sends resume in order ---");
    world.finish_all_uploads().await;
    println!("  {}", world.state_summary());

    let send_random_ids: Vec<i64> = world
        .remote
        .requests_named("send_story")
        .into_iter()
        .filter_map(|request| match request {
            RemoteRequest::SendStory { random_id, .. } => Some(random_id),
            _ => None,
        })
        .collect();
    let report = RestartReport {
        log_events_before_restart,
        log_events_after_recovery: world.pending_log_events(),
        send_random_ids,
        stories_sent: world.manager.active_stories(me).stories.len(),
    };
    println!("\n  resent idempotently: {}", report.resent_idempotently());
    Ok(report)
}

/// Outcome of [`run_feed`]
#[derive(Debug, Clone, Serialize)]
pub struct FeedReport {
    pub order_before: Vec<OwnerId>,
    pub order_after: Vec<OwnerId>,
    /// Owner whose stories were read between the two snapshots
    pub read_owner: Option<OwnerId>,
    pub pages_loaded: usize,
}

/// Load the main list for `owners` followed accounts and read one of them
pub async fn run_feed(owners: usize) -> anyhow::Result<FeedReport> {
    info!(owners, "=== Running Feed Scenario ===");
    let mut world = World::new(SimConfig::default())?;
    let me = world.config.self_owner;

    world.seed_owner(me, 1, 1, 7200, 60);
    let mut next_id = 100;
    for n in 0..owners {
        let owner = OwnerId(2 + n as i64);
        let count = 1 + (n % 3) as i32;
        world.seed_owner(owner, next_id, count, 60 * (n as i64 + 1), 300);
        next_id += count;
    }

    let mut pages_loaded = 0;
    loop {
        let page = world.manager.load_active_stories(StoryListId::Main);
        world.pump().await;
        match page.await {
            Ok(()) => pages_loaded += 1,
            Err(StoryError::NotFound(_)) => break,
            Err(e) => bail!("loading the main list failed: {e}"),
        }
        if pages_loaded > owners + 1 {
            bail!("main list never reported the end");
        }
    }
    let order_before = main_list(&world);
    println!("  main list: {order_before:?}");

    let read_owner = order_before.iter().copied().find(|owner| *owner != me);
    if let Some(owner) = read_owner {
        let view = world.manager.active_stories(owner);
        if let Some(newest) = view.stories.first() {
            world.manager.open_story(owner, newest.story_id).await?;
            world.manager.close_story(owner, newest.story_id).await?;
            world.pump().await;
            println!("  read every story of {owner}");
        }
    }
    let order_after = main_list(&world);
    println!("  main list: {order_after:?}");

    Ok(FeedReport {
        order_before,
        order_after,
        read_owner,
        pages_loaded,
    })
}

fn main_list(world: &World) -> Vec<OwnerId> {
    world
        .manager
        .index()
        .list(StoryListId::Main)
        .owners()
        .collect()
}

/// Outcome of [`run_expiry`]
#[derive(Debug, Clone, Serialize)]
pub struct ExpiryReport {
    /// `(seconds elapsed, owners with live stories)` per step
    pub timeline: Vec<(i64, usize)>,
}

/// Watch stories with staggered lifetimes drop out as the clock runs
pub async fn run_expiry() -> anyhow::Result<ExpiryReport> {
    info!("=== Running Expiry Scenario ===");
    let mut world = World::new(SimConfig::default())?;
    let now = world.config.start_time;
    let owners = [OwnerId(2), OwnerId(3), OwnerId(4)];

    for (n, owner) in owners.iter().enumerate() {
        let period = 100 * (n as i64 + 1);
        world
            .remote
            .insert_story(*owner, server_story(StoryId(n as i32 + 1), now, period));
        let loaded = world.manager.get_expiring_stories(*owner);
        world.pump().await;
        loaded.await?;
    }

    let live = |world: &World| {
        owners
            .iter()
            .filter(|owner| !world.manager.active_stories(**owner).stories.is_empty())
            .count()
    };

    let mut timeline = vec![(0, live(&world))];
    for _ in 0..7 {
        world.advance(50).await;
        let step = (world.stats.seconds_elapsed, live(&world));
        println!("  t=+{}s owners with live stories: {}", step.0, step.1);
        timeline.push(step);
    }

    Ok(ExpiryReport { timeline })
}

/// Outcome of [`run_chaos`]
#[derive(Debug, Clone, Serialize)]
pub struct ChaosReport {
    pub stats: SimStats,
    pub sends_succeeded: usize,
    pub sends_failed: usize,
    pub updates_published: usize,
    /// Broken invariants, empty when the engine behaved
    pub violations: Vec<String>,
}

/// Random mix of sends, edits, deletes, list loads and story views under
/// injected failures, followed by a quiet period and an invariant check
pub async fn run_chaos(ticks: u64, config: SimConfig) -> anyhow::Result<ChaosReport> {
    info!(ticks, seed = config.seed, "=== Running Chaos Scenario ===");
    let mut world = World::new(config)?;
    let me = world.config.self_owner;

    let mut next_id = 100;
    for n in 0..5 {
        world.seed_owner(OwnerId(2 + n), next_id, 2, 120 * (n + 1), 600);
        next_id += 2;
    }

    for tick in 0..ticks {
        let roll = world.rng().random_range(0..100);
        match roll {
            0..20 => {
                let story = world.next_story();
                let _ = world.manager.send_story(me, story);
            }
            20..35 => {
                let _ = world.manager.load_active_stories(StoryListId::Main);
            }
            35..55 => {
                let owners: Vec<OwnerId> = world.manager.index().owners().collect();
                if let Some(owner) = owners.choose(world.rng()).copied() {
                    let view = world.manager.active_stories(owner);
                    if let Some(info) = view.stories.choose(world.rng()) {
                        let _ = world.manager.open_story(owner, info.story_id);
                    }
                }
            }
            55..65 => {
                if let Some(story_id) = random_own_story(&mut world, me) {
                    let caption = Caption::plain(format!("edited at tick {tick}"));
                    let _ = world.manager.edit_story(story_id, None, Some(caption));
                }
            }
            65..70 => {
                if let Some(story_id) = random_own_story(&mut world, me) {
                    let _ = world.manager.delete_story(story_id);
                }
            }
            _ => {
                world.finish_all_uploads().await;
            }
        }
        world.pump().await;
        let secs = world.rng().random_range(1..30);
        world.advance(secs).await;

        if tick % 25 == 0 {
            println!("  tick {tick}: {}", world.state_summary());
        }
    }

    println!("\n--- Quiet period: failures off, timers drain ---");
    world.set_network_failure_rate(0.0);
    for _ in 0..5 {
        world.finish_all_uploads().await;
        world.advance(120).await;
    }
    println!("  {}", world.state_summary());

    let sends_succeeded = world.sink.count_of("story_send_succeeded");
    let sends_failed = world.sink.count_of("story_send_failed");
    let violations = check_invariants(&world, sends_succeeded + sends_failed);
    for violation in &violations {
        println!("  VIOLATION: {violation}");
    }

    Ok(ChaosReport {
        stats: world.stats.clone(),
        sends_succeeded,
        sends_failed,
        updates_published: world.sink.updates().len(),
        violations,
    })
}

fn random_own_story(world: &mut World, me: OwnerId) -> Option<StoryId> {
    let view = world.manager.active_stories(me);
    view.stories.choose(world.rng()).map(|info| info.story_id)
}

fn check_invariants(world: &World, sends_resolved: usize) -> Vec<String> {
    let mut violations = Vec::new();

    if sends_resolved as u64 != world.stats.sends_requested {
        violations.push(format!(
            "{} sends requested but {sends_resolved} resolved",
            world.stats.sends_requested
        ));
    }
    let unsent = world.manager.pipeline().yet_unsent();
    if !unsent.is_empty() {
        violations.push(format!("sends still queued: {unsent:?}"));
    }

    let index = world.manager.index();
    for list in [StoryListId::Main, StoryListId::Archive] {
        let orders: Vec<i64> = index
            .list(list)
            .owners()
            .filter_map(|owner| index.get(owner).map(|active| active.list_order()))
            .collect();
        if orders.windows(2).any(|pair| pair[0] < pair[1]) {
            violations.push(format!("{list:?} list out of order: {orders:?}"));
        }
    }

    for owner in index.owners() {
        let view = world.manager.active_stories(owner);
        if view.stories.windows(2).any(|pair| pair[0].date < pair[1].date) {
            violations.push(format!("stories of {owner} not newest first"));
        }
    }

    violations
}

/// Outcome of [`run_service`]
#[derive(Debug, Clone, Serialize)]
pub struct ServiceReport {
    pub sent: Vec<StoryFullId>,
    pub upload_order: Vec<FileId>,
    pub updates_seen: usize,
}

/// Send through the async service with real time, holding the first upload
/// back until the others are done
pub async fn run_service(count: u64) -> anyhow::Result<ServiceReport> {
    info!(count, "=== Running Service Scenario ===");
    let me = OwnerId(1);
    let remote = Arc::new(MockRemoteService::new());
    let files = Arc::new(MockFileTransfer::new());
    let sink = Arc::new(BroadcastSink::new(256));
    let mut updates = sink.subscribe();

    let manager = StoryManager::new(
        StoryConfig::testing(me),
        Arc::new(SystemClock),
        Arc::new(InMemoryLogEventStore::new()),
        Arc::new(InMemoryStoryDatabase::new()),
        sink.clone(),
        Arc::new(AcceptAllResolver::new()),
    )?;
    let (task, stories) = StoryService::spawn(manager, remote.clone(), files.clone());

    files.hold(FileId(1));
    let mut updates_seen = 0;
    let sends = stories
        .with(move |manager| {
            (1..=count)
                .map(|file| {
                    manager.send_story(
                        me,
                        NewStory {
                            content: photo(file),
                            caption: Caption::plain(format!("live story {file}")),
                            privacy: StoryPrivacySettings::Everyone { except: Vec::new() },
                            active_period_secs: 86400,
                            is_pinned: false,
                            noforwards: false,
                        },
                    )
                })
                .collect::<Vec<_>>()
        })
        .await?;

    // Everything but the held file finishes first
    tokio::time::timeout(Duration::from_secs(5), async {
        while files.completed().len() + 1 < count as usize {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .context("uploads never finished")?;
    files.release(FileId(1));

    let mut sent = Vec::new();
    for send in sends {
        let id = tokio::time::timeout(Duration::from_secs(5), send)
            .await
            .context("send never resolved")??;
        sent.push(id);
    }

    while let Ok(update) = updates.try_recv() {
        if let StoryUpdate::StorySendSucceeded { story_full_id, .. } = update {
            println!("  sent {story_full_id}");
        }
        updates_seen += 1;
    }

    stories.shutdown();
    task.await?;

    Ok(ServiceReport {
        sent,
        upload_order: files.completed(),
        updates_seen,
    })
}
