//! JSON step and master plan imports

mod helpers;

use helpers::{count_rows, test_env, ACTOR};
use serde_json::json;
use umig_import::models::{AuditEventKind, BatchStatus, EntityType, RecordErrorCode};
use umig_import::services::SubmitOptions;

#[tokio::test]
async fn test_two_character_step_type_is_rejected() {
    let env = test_env().await;
    let content = json!({
        "step_type": "TR",
        "step_number": 1,
        "title": "Stop services"
    })
    .to_string();

    let response = env
        .service
        .import_json("step.json", content, ACTOR, SubmitOptions::default())
        .await
        .unwrap();

    // Default acceptance threshold tolerates total record failure
    assert_eq!(response.status, BatchStatus::Completed);
    assert_eq!(response.statistics.processed, 1);
    assert_eq!(response.statistics.succeeded, 0);
    assert_eq!(response.statistics.failed, 1);
    assert_eq!(response.errors.len(), 1);
    let error = &response.errors[0];
    assert_eq!(error.code, RecordErrorCode::ValidationError);
    assert!(error.message.contains("exactly 3 characters"), "{}", error.message);
    assert_eq!(count_rows(&env.pool, "steps").await, 0);
}

#[tokio::test]
async fn test_steps_with_instructions_are_promoted() {
    let env = test_env().await;
    env.service
        .import_csv(
            EntityType::Team,
            "teams.csv",
            "team_name\nDBA\n".into(),
            ACTOR,
            SubmitOptions::default(),
        )
        .await
        .unwrap();

    let content = json!([
        {
            "step_type": "TRT",
            "step_number": 1,
            "title": "Freeze batch jobs",
            "team": "DBA",
            "instructions": [
                {"instruction_id": "1.1", "instruction_title": "Stop scheduler", "duration_minutes": 5},
                {"instruction_id": "1.2", "instruction_title": "Confirm queues empty", "nominated_team": "DBA"}
            ]
        },
        {
            "step_type": "TRT",
            "step_number": 2,
            "title": "Backup",
            "task_list": [
                {"instruction_id": "2.1", "instruction_title": "Full backup"}
            ]
        }
    ])
    .to_string();

    let response = env
        .service
        .import_json("runbook.json", content, ACTOR, SubmitOptions::default())
        .await
        .unwrap();

    assert!(response.success, "{:?}", response.errors);
    assert_eq!(response.statistics.succeeded, 2);
    assert_eq!(count_rows(&env.pool, "steps").await, 2);
    assert_eq!(count_rows(&env.pool, "instructions").await, 3);
}

#[tokio::test]
async fn test_duplicate_step_is_conflict_others_commit() {
    let env = test_env().await;
    let content = json!([
        {"step_type": "CHK", "step_number": 1, "title": "One"},
        {"step_type": "CHK", "step_number": 2, "title": "Two"},
        {"step_type": "CHK", "step_number": 1, "title": "One again"},
        {"step_type": "CHK", "step_number": 3, "title": "Three"}
    ])
    .to_string();

    let response = env
        .service
        .import_json("steps.json", content, ACTOR, SubmitOptions::default())
        .await
        .unwrap();

    assert!(response.success);
    assert_eq!(response.statistics.succeeded, 3);
    assert_eq!(response.statistics.failed, 1);
    assert_eq!(
        response
            .errors
            .iter()
            .filter(|e| e.code == RecordErrorCode::ConflictError)
            .count(),
        1
    );
    assert_eq!(count_rows(&env.pool, "steps").await, 3);

    let trail = env.service.audit_trail(response.batch_id).await.unwrap();
    assert_eq!(
        trail.iter().filter(|e| e.kind == AuditEventKind::RecordPromoted).count(),
        3
    );
    assert!(trail.iter().any(|e| e.kind == AuditEventKind::RecordRejected));
    assert_eq!(trail.first().unwrap().kind, AuditEventKind::BatchStarted);
    assert_eq!(trail.last().unwrap().kind, AuditEventKind::BatchCompleted);
}

#[tokio::test]
async fn test_truncated_json_fails_batch() {
    let env = test_env().await;
    let content = r#"[{"step_type": "TRT", "step_number": 1, "title": "ok"}, {"step_type": "TR"#.to_string();

    let response = env
        .service
        .import_json("broken.json", content, ACTOR, SubmitOptions::default())
        .await
        .unwrap();

    assert!(!response.success);
    assert_eq!(response.status, BatchStatus::Failed);
    assert!(response
        .errors
        .iter()
        .any(|e| e.code == RecordErrorCode::ParseError));

    // Staging of a failed batch is purged
    let (staged,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM staging_records WHERE batch_id = ?")
        .bind(response.batch_id.to_string())
        .fetch_one(&env.pool)
        .await
        .unwrap();
    assert_eq!(staged, 0);
}

#[tokio::test]
async fn test_scalar_top_level_is_framing_error() {
    let env = test_env().await;

    let response = env
        .service
        .import_json("scalar.json", "42".into(), ACTOR, SubmitOptions::default())
        .await
        .unwrap();

    assert_eq!(response.status, BatchStatus::Failed);
    assert_eq!(response.statistics.processed, 0);
}

#[tokio::test]
async fn test_multi_file_batch_reports_per_file() {
    let env = test_env().await;
    let files = vec![
        (
            "a.json".to_string(),
            json!([
                {"step_type": "AAA", "step_number": 1, "title": "a1"},
                {"step_type": "AAA", "step_number": 2, "title": "a2"}
            ])
            .to_string(),
        ),
        (
            "b.json".to_string(),
            json!({"step_type": "BB", "step_number": 1, "title": "bad type"}).to_string(),
        ),
    ];

    let response = env
        .service
        .import_json_batch(files, ACTOR, SubmitOptions::default())
        .await
        .unwrap();

    assert!(response.success);
    assert_eq!(response.files_processed, 2);
    assert_eq!(response.overall_statistics.processed, 3);
    assert_eq!(response.overall_statistics.succeeded, 2);
    assert_eq!(response.file_results[0].source, "a.json");
    assert_eq!(response.file_results[0].statistics.succeeded, 2);
    assert_eq!(response.file_results[1].source, "b.json");
    assert_eq!(response.file_results[1].statistics.failed, 1);
    assert_eq!(response.file_results[1].error_count, 1);
}

#[tokio::test]
async fn test_master_plan_defaults_status() {
    let env = test_env().await;
    let content = json!([
        {"plan_name": "Cutover 2024", "plan_description": "Main event"},
        {"plan_name": "Rehearsal", "plan_status": "ACTIVE"}
    ])
    .to_string();

    let response = env
        .service
        .import_master_plan("plans.json", content, ACTOR, SubmitOptions::default())
        .await
        .unwrap();
    assert!(response.success);
    assert_eq!(response.statistics.succeeded, 2);

    let (status,): (String,) = sqlx::query_as("SELECT plan_status FROM plans WHERE plan_name = 'Cutover 2024'")
        .fetch_one(&env.pool)
        .await
        .unwrap();
    assert_eq!(status, "DRAFT");

    let batch = env.service.batch(response.batch_id).await.unwrap();
    assert_eq!(batch.kind, umig_import::models::ImportKind::MasterPlan);
}
