//! Scenario runs checked end to end

use ephemera_core::{FileId, OwnerId};

use crate::scenarios::*;
use crate::world::{SimConfig, Storage};

#[tokio::test]
async fn test_ordered_sends_are_numbered_in_submission_order() {
    let report = run_ordered_sends(4).await.unwrap();

    assert_eq!(
        report.upload_order,
        vec![FileId(4), FileId(3), FileId(2), FileId(1)]
    );
    assert_eq!(report.story_ids.len(), 4);
    assert!(report.story_ids.windows(2).all(|pair| pair[0] < pair[1]));
}

#[tokio::test]
async fn test_restart_recovers_in_memory() {
    let report = run_restart_recovery(None).await.unwrap();

    assert_eq!(report.log_events_before_restart, 2);
    assert_eq!(report.send_random_ids.len(), 3);
    assert!(report.resent_idempotently());
    assert_eq!(report.stories_sent, 2);
    assert_eq!(report.log_events_after_recovery, 0);
}

#[tokio::test]
async fn test_restart_recovers_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let report = run_restart_recovery(Some(dir.path().to_path_buf()))
        .await
        .unwrap();

    assert!(report.resent_idempotently());
    assert_eq!(report.stories_sent, 2);
    assert_eq!(report.log_events_after_recovery, 0);
    assert!(dir.path().join("stories.binlog").exists());
}

#[tokio::test]
async fn test_feed_puts_own_stories_first_and_read_owners_last() {
    let report = run_feed(4).await.unwrap();

    assert_eq!(report.pages_loaded, 1);
    assert_eq!(report.order_before.len(), 5);
    assert_eq!(report.order_before[0], OwnerId(1));

    let read = report.read_owner.unwrap();
    assert_ne!(read, OwnerId(1));
    assert_eq!(report.order_after.last(), Some(&read));
    assert_eq!(report.order_after[0], OwnerId(1));
}

#[tokio::test]
async fn test_expiry_drains_owners() {
    let report = run_expiry().await.unwrap();

    assert_eq!(report.timeline.first(), Some(&(0, 3)));
    assert_eq!(report.timeline.last().map(|step| step.1), Some(0));
    assert!(
        report
            .timeline
            .windows(2)
            .all(|pair| pair[0].1 >= pair[1].1)
    );
}

#[tokio::test]
async fn test_chaos_without_faults_sends_everything() {
    let report = run_chaos(150, SimConfig::default()).await.unwrap();

    assert!(report.violations.is_empty(), "{:?}", report.violations);
    assert_eq!(report.sends_failed, 0);
    assert_eq!(report.sends_succeeded as u64, report.stats.sends_requested);
    assert_eq!(report.stats.injected_failures, 0);
}

#[tokio::test]
async fn test_chaos_with_faults_resolves_every_send() {
    let config = SimConfig {
        network_failure_rate: 0.2,
        upload_failure_rate: 0.1,
        seed: 7,
        storage: Storage::Memory,
        ..SimConfig::default()
    };
    let report = run_chaos(200, config).await.unwrap();

    assert!(report.violations.is_empty(), "{:?}", report.violations);
    assert_eq!(
        (report.sends_succeeded + report.sends_failed) as u64,
        report.stats.sends_requested
    );
    assert!(report.stats.injected_failures > 0);
}

#[tokio::test]
async fn test_service_delivers_in_order_with_real_time() {
    let report = run_service(3).await.unwrap();

    assert_eq!(report.sent.len(), 3);
    assert!(report.sent.windows(2).all(|pair| pair[0].story_id < pair[1].story_id));
    assert_eq!(report.upload_order.last(), Some(&FileId(1)));
    assert!(report.updates_seen >= 3);
}
