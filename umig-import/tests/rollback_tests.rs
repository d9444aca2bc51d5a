//! Rollback, status override and deletion

mod helpers;

use helpers::{count_rows, teams_csv, test_env, ACTOR};
use umig_import::models::{AuditEventKind, BatchStatistics, BatchStatus, EntityType};
use umig_import::services::SubmitOptions;
use umig_import::ImportError;
use uuid::Uuid;

async fn import_teams(env: &helpers::TestEnv, prefix: &str, count: usize) -> Uuid {
    let response = env
        .service
        .import_csv(
            EntityType::Team,
            "teams.csv",
            teams_csv(prefix, count),
            ACTOR,
            SubmitOptions::default(),
        )
        .await
        .unwrap();
    assert!(response.success);
    response.batch_id
}

#[tokio::test]
async fn test_rollback_completed_batch() {
    let env = test_env().await;
    let batch_id = import_teams(&env, "R", 25).await;
    assert_eq!(count_rows(&env.pool, "teams").await, 25);

    let result = env
        .service
        .rollback(batch_id, Some("wrong file"), "admin")
        .await
        .unwrap();

    assert!(!result.already_rolled_back);
    assert_eq!(result.records_deleted, 25);
    assert!(result.actions.contains(&"Deleted 25 teams".to_string()));
    assert!(result
        .actions
        .contains(&"Status changed from COMPLETED to ROLLED_BACK".to_string()));
    assert_eq!(count_rows(&env.pool, "teams").await, 0);

    let batch = env.service.batch(batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::RolledBack);
    let record = batch.rollback.unwrap();
    assert_eq!(record.rolled_back_by, "admin");
    assert_eq!(record.reason.as_deref(), Some("wrong file"));

    let trail = env.service.audit_trail(batch_id).await.unwrap();
    let rollbacks: Vec<_> = trail
        .iter()
        .filter(|e| e.kind == AuditEventKind::RollbackExecuted)
        .collect();
    assert_eq!(rollbacks.len(), 1);
    assert_eq!(rollbacks[0].summary, "Deleted 25 records.");
    assert_eq!(rollbacks[0].actor, "admin");
}

#[tokio::test]
async fn test_rollback_is_idempotent() {
    let env = test_env().await;
    let batch_id = import_teams(&env, "I", 5).await;

    let first = env.service.rollback(batch_id, None, ACTOR).await.unwrap();
    // Same names again under a new batch; a second rollback must not touch them
    let other = import_teams(&env, "I", 5).await;

    let second = env.service.rollback(batch_id, None, ACTOR).await.unwrap();
    assert!(second.already_rolled_back);
    assert_eq!(second.actions, first.actions);
    assert_eq!(second.records_deleted, first.records_deleted);
    assert_eq!(count_rows(&env.pool, "teams").await, 5);

    let trail = env.service.audit_trail(batch_id).await.unwrap();
    assert_eq!(
        trail.iter().filter(|e| e.kind == AuditEventKind::RollbackExecuted).count(),
        1
    );
    assert_eq!(env.service.batch(other).await.unwrap().status, BatchStatus::Completed);
}

#[tokio::test]
async fn test_rollback_only_touches_own_batch() {
    let env = test_env().await;
    let keep = import_teams(&env, "Keep", 4).await;
    let drop = import_teams(&env, "Drop", 6).await;

    let result = env.service.rollback(drop, None, ACTOR).await.unwrap();
    assert_eq!(result.records_deleted, 6);
    assert_eq!(count_rows(&env.pool, "teams").await, 4);
    assert_eq!(env.service.batch(keep).await.unwrap().status, BatchStatus::Completed);
}

#[tokio::test]
async fn test_rollback_unknown_batch() {
    let env = test_env().await;
    let err = env.service.rollback(Uuid::new_v4(), None, ACTOR).await.unwrap_err();
    assert!(matches!(err, ImportError::NotFound(_)));
}

#[tokio::test]
async fn test_rolled_back_is_terminal() {
    let env = test_env().await;
    let batch_id = import_teams(&env, "T", 2).await;
    env.service.rollback(batch_id, None, ACTOR).await.unwrap();

    for status in [BatchStatus::Completed, BatchStatus::Failed, BatchStatus::InProgress] {
        let err = env
            .service
            .update_status(batch_id, status, None, "admin", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::InvalidTransition { .. }), "{status}: {err}");
    }
    assert_eq!(env.service.batch(batch_id).await.unwrap().status, BatchStatus::RolledBack);
}

#[tokio::test]
async fn test_status_override_rules() {
    let env = test_env().await;
    let batch_id = import_teams(&env, "O", 3).await;

    // ROLLED_BACK is only reachable through rollback
    let err = env
        .service
        .update_status(batch_id, BatchStatus::RolledBack, None, "admin", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ImportError::InvalidTransition { .. }));

    let failed = env
        .service
        .update_status(batch_id, BatchStatus::Failed, None, "admin", Some("bad data upstream"))
        .await
        .unwrap();
    assert_eq!(failed.status, BatchStatus::Failed);
    assert_eq!(failed.status_reason.as_deref(), Some("bad data upstream"));

    let inconsistent = BatchStatistics {
        processed: 3,
        succeeded: 3,
        failed: 1,
    };
    let err = env
        .service
        .update_status(batch_id, BatchStatus::Completed, Some(inconsistent), "admin", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ImportError::Validation(_)));

    let restored = env
        .service
        .update_status(batch_id, BatchStatus::Completed, Some(BatchStatistics::new(3, 0)), "admin", None)
        .await
        .unwrap();
    assert_eq!(restored.status, BatchStatus::Completed);
    assert_eq!(restored.statistics.processed, 3);

    let trail = env.service.audit_trail(batch_id).await.unwrap();
    assert_eq!(
        trail.iter().filter(|e| e.kind == AuditEventKind::StatusOverridden).count(),
        2
    );
}

#[tokio::test]
async fn test_delete_requires_rollback_and_keeps_audit() {
    let env = test_env().await;
    let batch_id = import_teams(&env, "D", 3).await;

    let err = env.service.delete_batch(batch_id, "admin").await.unwrap_err();
    assert!(matches!(err, ImportError::Conflict(_)));

    env.service.rollback(batch_id, None, "admin").await.unwrap();
    env.service.delete_batch(batch_id, "admin").await.unwrap();

    assert!(matches!(
        env.service.batch(batch_id).await.unwrap_err(),
        ImportError::NotFound(_)
    ));
    let (entries,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM import_audit WHERE batch_id = ? AND kind = 'BATCH_DELETED'")
        .bind(batch_id.to_string())
        .fetch_one(&env.pool)
        .await
        .unwrap();
    assert_eq!(entries, 1);
}

#[tokio::test]
async fn test_rollback_blocked_by_dependent_batch() {
    let env = test_env().await;
    let teams = import_teams(&env, "Ops", 1).await;

    let users = env
        .service
        .import_csv(
            EntityType::User,
            "users.csv",
            "user_code,first_name,last_name,user_email,team_name\nU1,Ann,Lee,ann@example.com,Ops-0\n".into(),
            ACTOR,
            SubmitOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(users.records_imported, 1);

    let err = env.service.rollback(teams, None, ACTOR).await.unwrap_err();
    assert!(matches!(err, ImportError::Conflict(_)), "{err}");
    // Nothing was deleted and the batch is unchanged
    assert_eq!(count_rows(&env.pool, "teams").await, 1);
    assert_eq!(env.service.batch(teams).await.unwrap().status, BatchStatus::Completed);

    env.service.rollback(users.batch_id, None, ACTOR).await.unwrap();
    let result = env.service.rollback(teams, None, ACTOR).await.unwrap();
    assert_eq!(result.records_deleted, 1);
}

#[tokio::test]
async fn test_rollback_and_override_release_lease_entries() {
    let env = test_env().await;
    let overridden = import_teams(&env, "L", 3).await;
    let rolled_back = import_teams(&env, "M", 3).await;
    assert_eq!(env.service.orchestrator_status().await.tracked_leases, 0);

    env.service
        .update_status(overridden, BatchStatus::Failed, None, "admin", Some("manual check"))
        .await
        .unwrap();
    assert_eq!(env.service.orchestrator_status().await.tracked_leases, 0);

    env.service.rollback(rolled_back, None, "admin").await.unwrap();
    env.service.rollback(rolled_back, None, "admin").await.unwrap();
    assert_eq!(env.service.orchestrator_status().await.tracked_leases, 0);

    // Failed attempts release their entry too
    let err = env
        .service
        .update_status(rolled_back, BatchStatus::Completed, None, "admin", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ImportError::InvalidTransition { .. }));
    assert_eq!(env.service.orchestrator_status().await.tracked_leases, 0);
}
