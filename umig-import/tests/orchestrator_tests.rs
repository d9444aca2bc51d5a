//! Admission control, queueing, cancellation and recovery
//!
//! Inputs come from gated readers so batches stay active until the test
//! opens the gate.

mod helpers;

use helpers::{count_rows, teams_csv, test_env, test_env_with, test_parameters, users_csv, Gate, ACTOR};
use std::sync::Arc;
use std::time::Duration;
use umig_common::events::ImportEvent;
use umig_import::models::{BatchStatus, EntityType, ImportKind, ImportParameters, ImportRequest, SourceFormat, SourceInput};
use umig_import::services::{AuditLog, BatchTracker, CancelOutcome, LeaseManager, SubmitOptions, INTERRUPTED_REASON};
use umig_import::ImportError;

fn gated_request(gate: &Gate, prefix: &str, rows: usize, priority: i32) -> ImportRequest {
    ImportRequest::new(ImportKind::CsvImport, format!("{prefix}.csv"), ACTOR)
        .with_priority(priority)
        .with_input(SourceInput::new(
            format!("{prefix}.csv"),
            SourceFormat::Csv(EntityType::Team),
            gate.reader(teams_csv(prefix, rows)),
        ))
}

fn serial_parameters() -> ImportParameters {
    ImportParameters {
        max_concurrent_imports: 1,
        queue_capacity: 10,
        ..test_parameters()
    }
}

#[tokio::test]
async fn test_three_active_seven_queued_rest_rejected() {
    let env = test_env().await;
    let gate = Gate::new();

    let mut submissions = Vec::new();
    for i in 0..10 {
        let submission = env
            .service
            .submit(gated_request(&gate, &format!("B{i}"), 3, 0))
            .await
            .unwrap();
        assert_eq!(submission.queued, i >= 3, "submission {i}");
        submissions.push(submission);
    }

    for i in 10..14 {
        let err = env
            .service
            .submit(gated_request(&gate, &format!("B{i}"), 3, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::QueueFull { capacity: 10 }), "submission {i}: {err}");
        assert!(err.is_retryable());
    }

    let snapshot = env.service.orchestrator_status().await;
    assert_eq!(snapshot.active.len(), 3);
    assert_eq!(snapshot.queued.len(), 7);
    assert_eq!(
        snapshot.queued.iter().map(|q| q.position).collect::<Vec<_>>(),
        (1..=7).collect::<Vec<_>>()
    );
    // Rejected submissions leave no batch behind
    assert_eq!(count_rows(&env.pool, "import_batches").await, 10);

    gate.open();
    for submission in submissions {
        let report = submission.wait().await.unwrap();
        assert_eq!(report.batch.status, BatchStatus::Completed);
        assert_eq!(report.batch.statistics.succeeded, 3);
    }
    assert_eq!(count_rows(&env.pool, "teams").await, 30);

    let snapshot = env.service.orchestrator_status().await;
    assert!(snapshot.active.is_empty());
    assert!(snapshot.queued.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_batches_promote_side_by_side() {
    let env = test_env_with(ImportParameters {
        chunk_size: 5,
        chunk_fan_out: 4,
        max_concurrent_imports: 3,
        queue_capacity: 10,
        lease_timeout_ms: 10_000,
        db_max_lock_wait_ms: 10_000,
        ..test_parameters()
    })
    .await;

    let team = env
        .service
        .import_csv(EntityType::Team, "teams.csv", "team_name\nOps\n".into(), ACTOR, SubmitOptions::default())
        .await
        .unwrap();
    assert!(team.success);

    let mut submissions = Vec::new();
    for prefix in ["A", "B", "C"] {
        let request = ImportRequest::new(ImportKind::CsvImport, format!("{prefix}-users.csv"), ACTOR).with_input(
            SourceInput::from_text(
                format!("{prefix}-users.csv"),
                SourceFormat::Csv(EntityType::User),
                users_csv(prefix, 300, "Ops"),
            ),
        );
        let submission = env.service.submit(request).await.unwrap();
        assert!(!submission.queued);
        submissions.push(submission);
    }

    for submission in submissions {
        let report = submission.wait().await.unwrap();
        assert_eq!(
            report.batch.status,
            BatchStatus::Completed,
            "{}: {:?}",
            report.batch.source,
            report.batch.status_reason
        );
        assert_eq!(report.batch.statistics.processed, 300);
        assert_eq!(report.batch.statistics.succeeded, 300);
        assert!(report.errors.is_empty(), "{:?}", report.errors);
    }
    assert_eq!(count_rows(&env.pool, "users").await, 900);
}

#[tokio::test]
async fn test_status_stays_responsive_while_submission_waits_on_database() {
    let env = test_env().await;
    let writer = env.pool.begin_with("BEGIN IMMEDIATE").await.unwrap();

    let service = env.service.clone();
    let pending = tokio::spawn(async move {
        service
            .import_csv(EntityType::Team, "teams.csv", teams_csv("W", 3), ACTOR, SubmitOptions::default())
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let snapshot = tokio::time::timeout(Duration::from_millis(500), env.service.orchestrator_status())
        .await
        .expect("orchestrator status blocked behind a database write");
    assert!(snapshot.active.is_empty());
    assert!(snapshot.queued.is_empty());

    writer.rollback().await.unwrap();
    let response = pending.await.unwrap().unwrap();
    assert!(response.success);
    assert_eq!(count_rows(&env.pool, "teams").await, 3);
}

#[tokio::test]
async fn test_priority_then_fifo_admission() {
    let env = test_env_with(serial_parameters()).await;
    let mut events = env.service.event_bus().subscribe();
    let gate = Gate::new();

    let first = env.service.submit(gated_request(&gate, "first", 1, 0)).await.unwrap();
    let low = env.service.submit(gated_request(&gate, "low", 1, 0)).await.unwrap();
    let high = env.service.submit(gated_request(&gate, "high", 1, 5)).await.unwrap();
    let low_too = env.service.submit(gated_request(&gate, "low-too", 1, 0)).await.unwrap();

    let snapshot = env.service.orchestrator_status().await;
    let queued: Vec<_> = snapshot.queued.iter().map(|q| q.batch_id).collect();
    assert_eq!(queued, vec![high.batch_id, low.batch_id, low_too.batch_id]);

    let expected = vec![first.batch_id, high.batch_id, low.batch_id, low_too.batch_id];
    gate.open();
    for submission in [first, low, high, low_too] {
        submission.wait().await.unwrap();
    }

    let mut admitted = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ImportEvent::BatchAdmitted { batch_id, .. } = event {
            admitted.push(batch_id);
        }
    }
    assert_eq!(admitted, expected);
}

#[tokio::test]
async fn test_cancel_queued_batch() {
    let env = test_env_with(serial_parameters()).await;
    let gate = Gate::new();

    let running = env.service.submit(gated_request(&gate, "run", 2, 0)).await.unwrap();
    let waiting = env.service.submit(gated_request(&gate, "wait", 2, 0)).await.unwrap();
    let waiting_id = waiting.batch_id;

    let outcome = env.service.cancel(waiting_id, "operator").await.unwrap();
    assert_eq!(outcome, CancelOutcome::RemovedFromQueue);

    let report = waiting.wait().await.unwrap();
    assert_eq!(report.batch.status, BatchStatus::Failed);
    let reason = report.batch.status_reason.clone().unwrap();
    assert!(reason.contains("cancelled before admission by operator"), "{reason}");
    assert!(env.service.orchestrator_status().await.queued.is_empty());

    // Finished batches cannot be cancelled again
    let err = env.service.cancel(waiting_id, "operator").await.unwrap_err();
    assert!(matches!(err, ImportError::InvalidTransition { .. }));

    gate.open();
    let report = running.wait().await.unwrap();
    assert_eq!(report.batch.status, BatchStatus::Completed);
    assert_eq!(count_rows(&env.pool, "teams").await, 2);
}

#[tokio::test]
async fn test_cancel_running_batch() {
    let env = test_env().await;
    let gate = Gate::new();

    let submission = env.service.submit(gated_request(&gate, "C", 40, 0)).await.unwrap();
    let batch_id = submission.batch_id;

    let outcome = env.service.cancel(batch_id, "operator").await.unwrap();
    assert_eq!(outcome, CancelOutcome::StopRequested);

    gate.open();
    let report = submission.wait().await.unwrap();
    assert_eq!(report.batch.status, BatchStatus::Failed);
    assert_eq!(report.batch.status_reason.as_deref(), Some("cancelled by operator"));
    assert_eq!(report.batch.statistics.processed, 0);
    assert_eq!(count_rows(&env.pool, "teams").await, 0);

    let trail = env.service.audit_trail(batch_id).await.unwrap();
    assert!(trail
        .iter()
        .any(|e| e.kind == umig_import::models::AuditEventKind::BatchCancelled && e.actor == "operator"));
}

#[tokio::test]
async fn test_override_refused_while_tracked() {
    let env = test_env().await;
    let gate = Gate::new();
    let submission = env.service.submit(gated_request(&gate, "O", 1, 0)).await.unwrap();

    let err = env
        .service
        .update_status(submission.batch_id, BatchStatus::Failed, None, "admin", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ImportError::Conflict(_)));

    gate.open();
    submission.wait().await.unwrap();
}

#[tokio::test]
async fn test_rollback_of_active_batch_cancels_first() {
    let env = test_env().await;
    let gate = Gate::new();
    let submission = env.service.submit(gated_request(&gate, "R", 5, 0)).await.unwrap();
    let batch_id = submission.batch_id;

    let service = env.service.clone();
    let rollback = tokio::spawn(async move { service.rollback(batch_id, None, "admin").await });
    gate.open();

    let result = rollback.await.unwrap().unwrap();
    assert!(!result.already_rolled_back);
    assert_eq!(env.service.batch(batch_id).await.unwrap().status, BatchStatus::RolledBack);
    assert_eq!(count_rows(&env.pool, "teams").await, 0);
}

#[tokio::test]
async fn test_chunk_size_shrinks_under_memory_pressure() {
    let env = test_env().await;
    env.gauge.set(0.05);

    let response = env
        .service
        .import_csv(EntityType::Team, "teams.csv", teams_csv("M", 40), ACTOR, SubmitOptions::default())
        .await
        .unwrap();
    assert!(response.success);
    assert_eq!(response.records_imported, 40);

    let progress = env.service.progress(response.batch_id, 0).await.unwrap();
    assert_eq!(progress.performance.current_chunk_size, 2);
    assert!(progress.performance.chunk_size_adjustments >= 2);
    assert!(progress
        .entries
        .iter()
        .any(|e| matches!(e.event, ImportEvent::ChunkSizeAdjusted { .. })));
}

#[tokio::test]
async fn test_recover_interrupted_batches() {
    let env = test_env().await;
    let audit = AuditLog::new(env.pool.clone(), 1000);
    let stale_tracker = BatchTracker::new(
        env.pool.clone(),
        Arc::new(LeaseManager::new(Duration::from_secs(1))),
        audit,
        1000,
    );
    let stale = stale_tracker
        .create_batch(ImportKind::JsonImport, "before-restart.json", ACTOR)
        .await
        .unwrap();

    let recovered = env.service.recover_interrupted().await.unwrap();
    assert_eq!(recovered, vec![stale.batch_id]);

    let batch = env.service.batch(stale.batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Failed);
    assert_eq!(batch.status_reason.as_deref(), Some(INTERRUPTED_REASON));

    assert!(env.service.recover_interrupted().await.unwrap().is_empty());
}
