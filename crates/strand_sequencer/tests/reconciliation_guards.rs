//! Guard rails of the reconciliation pipeline: gates, loop prevention,
//! terminal conditions and request-bridge edge cases.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{attrs, RotatingSelector, SlowSelector, TestCluster};
use strand_sequencer::{
    request_notify_completion, request_schedule, request_snapshot, Epoch, LogId,
    RendezvousNodeSetSelector, SequencerState, Settings, Status,
};

#[tokio::test]
async fn reprovisioning_waits_for_metadata_log_writeout() {
    let log_id = LogId(3);
    let cluster = TestCluster::builder().log(log_id, attrs(2)).build();
    let sequencer = cluster.add_active_log_unwritten(log_id, Epoch(1));

    // A params change is pending, but the current record has not reached
    // the metadata log, so nothing may be written yet.
    cluster
        .config
        .update_settings(|s| s.epoch_metadata_use_new_storage_set_format = true);
    request_schedule(&cluster.processor, vec![log_id]);
    cluster
        .wait_for_stats("gated recheck to finish", |s| s.completed == 1)
        .await;
    cluster.wait_idle().await;
    assert_eq!(cluster.store.write_count(), 0);
    assert_eq!(cluster.stats().metadata_updates_without_reactivation, 0);

    // The metadata-log writer reports the write-out and re-schedules.
    sequencer.note_written_in_metadata_log();
    request_schedule(&cluster.processor, vec![log_id]);
    cluster
        .wait_for_stats("params update after write-out", |s| {
            s.metadata_updates_without_reactivation == 1 && s.completed == 2
        })
        .await;
    cluster.wait_idle().await;
    assert_eq!(
        cluster
            .store
            .metadata(log_id)
            .unwrap()
            .nodeset_params
            .format_version,
        1
    );
}

#[tokio::test]
async fn unstable_selector_cancels_the_update() {
    let log_id = LogId(4);
    let selector = Arc::new(RotatingSelector::new(vec![
        vec![1, 2],
        vec![2, 3],
        vec![1, 3],
    ]));
    let cluster = TestCluster::builder()
        .selector(selector)
        .log(log_id, attrs(2))
        .build();
    let sequencer = cluster.add_active_log(log_id, Epoch(1));

    request_schedule(&cluster.processor, vec![log_id]);
    cluster
        .wait_for_stats("cancelled update to finish", |s| s.completed == 1)
        .await;
    cluster.wait_idle().await;

    // The selector kept flip-flopping, so no update and no reactivation
    // was issued at all.
    let stats = cluster.stats();
    assert_eq!(stats.reactivations_for_metadata_update, 0);
    assert_eq!(stats.metadata_updates_without_reactivation, 0);
    assert_eq!(cluster.store.write_count(), 0);
    assert_eq!(sequencer.current_epoch(), Some(Epoch(1)));
    assert_eq!(sequencer.state(), SequencerState::Active);
}

#[tokio::test]
async fn epoch_exhaustion_is_terminal() {
    let log_id = LogId(6);
    let cluster = TestCluster::builder().log(log_id, attrs(2)).build();
    let sequencer = cluster.add_active_log(log_id, Epoch(u32::MAX - 2));

    // Even with a pending option change there is no epoch left to move to.
    cluster.config.update_cluster(|c| {
        c.logs.get_mut(&log_id).unwrap().max_writes_in_flight = 512;
    });
    request_schedule(&cluster.processor, vec![log_id]);
    cluster
        .wait_for_stats("exhausted log to finish", |s| s.completed == 1)
        .await;
    cluster.wait_idle().await;

    assert_eq!(cluster.stats().reactivations_for_metadata_update, 0);
    assert_eq!(cluster.store.write_count(), 0);
    assert_eq!(sequencer.current_epoch(), Some(Epoch(u32::MAX - 2)));
}

#[tokio::test]
async fn losing_sequencer_membership_deactivates_the_sequencer() {
    let log_id = LogId(8);
    let cluster = TestCluster::builder().log(log_id, attrs(2)).build();
    let sequencer = cluster.add_active_log(log_id, Epoch(1));

    cluster.drop_sequencer_node(1);
    request_schedule(&cluster.processor, vec![log_id]);
    cluster
        .wait_for_stats("deactivation recheck to finish", |s| s.completed == 1)
        .await;
    cluster.wait_idle().await;

    assert_eq!(sequencer.state(), SequencerState::Deactivated);
    assert_eq!(cluster.store.write_count(), 0);
}

#[tokio::test]
async fn log_removed_from_config_is_done_without_retry() {
    let log_id = LogId(2);
    let cluster = TestCluster::builder().log(log_id, attrs(2)).build();
    let sequencer = cluster.add_active_log(log_id, Epoch(1));

    cluster.config.update_cluster(|c| {
        c.logs.remove(&log_id);
    });
    request_schedule(&cluster.processor, vec![log_id]);
    cluster
        .wait_for_stats("removed log to finish", |s| s.completed == 1)
        .await;
    cluster.wait_idle().await;

    assert_eq!(sequencer.current_epoch(), Some(Epoch(1)));
    assert_eq!(cluster.store.write_count(), 0);
}

#[tokio::test]
async fn scheduling_is_idempotent_while_pending() {
    let log_id = LogId(12);
    let settings = Settings {
        max_sequencer_background_activations_in_flight: 0,
        ..Settings::default()
    };
    let cluster = TestCluster::builder()
        .settings(settings)
        .log(log_id, attrs(2))
        .build();
    cluster.add_active_log(log_id, Epoch(1));

    // With a zero budget the log stays pending; re-scheduling it must not
    // duplicate queue entries or counters.
    request_schedule(&cluster.processor, vec![log_id]);
    request_schedule(&cluster.processor, vec![log_id]);
    let snapshot = cluster.snapshot().await;
    assert_eq!(snapshot.queued, 1);
    assert_eq!(snapshot.limit, 0);
    let stats = cluster.stats();
    assert_eq!(stats.scheduled, 1);
    assert_eq!(stats.completed, 0);

    // Raising the limit is picked up by the next pump.
    cluster
        .config
        .update_settings(|s| s.max_sequencer_background_activations_in_flight = 4);
    request_schedule(&cluster.processor, vec![log_id]);
    cluster
        .wait_for_stats("pending log to drain", |s| s.completed == 1)
        .await;
    cluster.wait_idle().await;
    assert_eq!(cluster.stats().scheduled, 1);
}

#[tokio::test]
async fn completion_without_a_token_just_reenqueues() {
    let log_id = LogId(13);
    let cluster = TestCluster::builder().log(log_id, attrs(2)).build();
    cluster.add_active_log(log_id, Epoch(1));

    request_notify_completion(&cluster.processor, log_id, Status::Ok);
    cluster
        .wait_for_stats("re-enqueued recheck to finish", |s| s.completed == 1)
        .await;
    cluster.wait_idle().await;

    // The completion counted as a fresh schedule, not as a completion of
    // anything the activator issued.
    assert_eq!(cluster.stats().scheduled, 1);
}

#[tokio::test]
async fn completions_for_unknown_and_metadata_logs_are_ignored() {
    let cluster = TestCluster::builder().log(LogId(1), attrs(2)).build();

    request_notify_completion(&cluster.processor, LogId(999), Status::Ok);
    request_notify_completion(&cluster.processor, LogId(1).metadata_log(), Status::Ok);

    let snapshot = cluster.snapshot().await;
    assert_eq!(snapshot.queued, 0);
    assert_eq!(cluster.stats(), Default::default());
}

#[tokio::test]
async fn shutdown_swallows_request_posting() {
    let log_id = LogId(14);
    let cluster = TestCluster::builder().log(log_id, attrs(2)).build();
    cluster.add_active_log(log_id, Epoch(1));

    cluster.processor.shutdown();
    assert!(cluster.processor.is_shutting_down());

    // Posting after shutdown is tolerated and dropped.
    request_schedule(&cluster.processor, vec![log_id]);
    request_notify_completion(&cluster.processor, log_id, Status::Ok);
    assert!(request_snapshot(&cluster.processor).await.is_none());
}

#[tokio::test]
async fn slow_reconciliations_yield_and_resume() {
    let logs = [LogId(1), LogId(2), LogId(3)];
    let selector = Arc::new(SlowSelector {
        inner: RendezvousNodeSetSelector,
        delay: Duration::from_millis(3),
    });
    let mut builder = TestCluster::builder().selector(selector);
    for log_id in logs {
        builder = builder.log(log_id, attrs(2));
    }
    let cluster = builder.build();
    for log_id in logs {
        cluster.add_active_log(log_id, Epoch(1));
    }

    // Each reconciliation alone overruns the pump's time slice; the queue
    // still drains via the yield timer.
    request_schedule(&cluster.processor, logs.to_vec());
    cluster
        .wait_for_stats("sliced pumps to drain the queue", |s| s.completed == 3)
        .await;
    cluster.wait_idle().await;
    assert_eq!(cluster.stats().scheduled, 3);
}
