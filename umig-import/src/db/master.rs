//! Master table writes
//!
//! Only the promotion engine calls the insert functions, and only rollback
//! calls `delete_for_batch`.

use chrono::Utc;
use sqlx::{SqliteConnection, SqliteExecutor};
use uuid::Uuid;

use super::format_timestamp;
use crate::error::{ImportError, ImportResult};
use crate::models::{
    ApplicationRecord, EntityRecord, EnvironmentRecord, PlanRecord, StepRecord, TeamRecord,
    UserRecord,
};

/// Map constraint violations to `Conflict`, everything else to `Storage`
fn classify(err: sqlx::Error, what: &str) -> ImportError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return ImportError::Conflict(format!("{} already exists", what));
        }
        if db_err.is_foreign_key_violation() {
            return ImportError::Conflict(format!("{} references a missing record", what));
        }
        if db_err.is_check_violation() {
            return ImportError::Conflict(format!("{} violates a table constraint", what));
        }
    }
    err.into()
}

/// Insert one validated record; returns the number of master rows written
pub async fn insert_entity(
    conn: &mut SqliteConnection,
    batch_id: Uuid,
    record: &EntityRecord,
) -> ImportResult<u64> {
    match record {
        EntityRecord::Team(team) => insert_team(conn, batch_id, team).await.map(|_| 1),
        EntityRecord::User(user) => insert_user(conn, batch_id, user).await.map(|_| 1),
        EntityRecord::Application(app) => insert_application(conn, batch_id, app).await.map(|_| 1),
        EntityRecord::Environment(env) => insert_environment(conn, batch_id, env).await.map(|_| 1),
        EntityRecord::Plan(plan) => insert_plan(conn, batch_id, plan).await.map(|_| 1),
        EntityRecord::Step(step) => insert_step(conn, batch_id, step).await,
    }
}

pub async fn team_id_by_name(conn: &mut SqliteConnection, team_name: &str) -> ImportResult<Option<i64>> {
    let id = sqlx::query_scalar("SELECT team_id FROM teams WHERE team_name = ?")
        .bind(team_name)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(id)
}

async fn require_team(conn: &mut SqliteConnection, team_name: &str) -> ImportResult<i64> {
    team_id_by_name(conn, team_name)
        .await?
        .ok_or_else(|| ImportError::Conflict(format!("team '{}' does not exist", team_name)))
}

async fn insert_team(conn: &mut SqliteConnection, batch_id: Uuid, team: &TeamRecord) -> ImportResult<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO teams (team_name, team_description, team_email, batch_id, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&team.team_name)
    .bind(&team.team_description)
    .bind(&team.team_email)
    .bind(batch_id.to_string())
    .bind(format_timestamp(&Utc::now()))
    .execute(&mut *conn)
    .await
    .map_err(|e| classify(e, &format!("team '{}'", team.team_name)))?;

    Ok(result.last_insert_rowid())
}

async fn insert_user(conn: &mut SqliteConnection, batch_id: Uuid, user: &UserRecord) -> ImportResult<i64> {
    let team_id = match &user.team_name {
        Some(name) => Some(require_team(conn, name).await?),
        None => None,
    };

    let result = sqlx::query(
        r#"
        INSERT INTO users (user_code, first_name, last_name, user_email, team_id, is_admin, batch_id, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&user.user_code)
    .bind(&user.first_name)
    .bind(&user.last_name)
    .bind(&user.user_email)
    .bind(team_id)
    .bind(user.is_admin)
    .bind(batch_id.to_string())
    .bind(format_timestamp(&Utc::now()))
    .execute(&mut *conn)
    .await
    .map_err(|e| classify(e, &format!("user '{}'", user.user_code)))?;

    Ok(result.last_insert_rowid())
}

async fn insert_application(
    conn: &mut SqliteConnection,
    batch_id: Uuid,
    app: &ApplicationRecord,
) -> ImportResult<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO applications (app_code, app_name, app_description, batch_id, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&app.app_code)
    .bind(&app.app_name)
    .bind(&app.app_description)
    .bind(batch_id.to_string())
    .bind(format_timestamp(&Utc::now()))
    .execute(&mut *conn)
    .await
    .map_err(|e| classify(e, &format!("application '{}'", app.app_code)))?;

    Ok(result.last_insert_rowid())
}

async fn insert_environment(
    conn: &mut SqliteConnection,
    batch_id: Uuid,
    env: &EnvironmentRecord,
) -> ImportResult<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO environments (env_code, env_name, env_description, batch_id, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&env.env_code)
    .bind(&env.env_name)
    .bind(&env.env_description)
    .bind(batch_id.to_string())
    .bind(format_timestamp(&Utc::now()))
    .execute(&mut *conn)
    .await
    .map_err(|e| classify(e, &format!("environment '{}'", env.env_code)))?;

    Ok(result.last_insert_rowid())
}

async fn insert_plan(conn: &mut SqliteConnection, batch_id: Uuid, plan: &PlanRecord) -> ImportResult<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO plans (plan_name, plan_description, plan_status, batch_id, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&plan.plan_name)
    .bind(&plan.plan_description)
    .bind(&plan.plan_status)
    .bind(batch_id.to_string())
    .bind(format_timestamp(&Utc::now()))
    .execute(&mut *conn)
    .await
    .map_err(|e| classify(e, &format!("plan '{}'", plan.plan_name)))?;

    Ok(result.last_insert_rowid())
}

/// Step plus its instructions
async fn insert_step(conn: &mut SqliteConnection, batch_id: Uuid, step: &StepRecord) -> ImportResult<u64> {
    let step_label = format!("step {}-{}", step.step_type, step.step_number);
    let team_id = match &step.team {
        Some(name) => Some(require_team(conn, name).await?),
        None => None,
    };
    let created_at = format_timestamp(&Utc::now());

    let step_id = sqlx::query(
        r#"
        INSERT INTO steps (step_type, step_number, title, description, team_id, batch_id, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&step.step_type)
    .bind(step.step_number as i64)
    .bind(&step.title)
    .bind(&step.description)
    .bind(team_id)
    .bind(batch_id.to_string())
    .bind(&created_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| classify(e, &step_label))?
    .last_insert_rowid();

    for instruction in &step.instructions {
        let team_id = match &instruction.nominated_team {
            Some(name) => Some(require_team(conn, name).await?),
            None => None,
        };

        sqlx::query(
            r#"
            INSERT INTO instructions (
                step_id, instruction_code, title, body, team_id, duration_minutes, batch_id, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(step_id)
        .bind(&instruction.instruction_id)
        .bind(&instruction.instruction_title)
        .bind(&instruction.body)
        .bind(team_id)
        .bind(instruction.duration_minutes.map(i64::from))
        .bind(batch_id.to_string())
        .bind(&created_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            classify(
                e,
                &format!("instruction '{}' of {}", instruction.instruction_id, step_label),
            )
        })?;
    }

    Ok(1 + step.instructions.len() as u64)
}

/// Delete rows created by `batch_id` from one master table
///
/// `table` must come from `schema::MASTER_DELETE_ORDER`.
pub async fn delete_for_batch(conn: &mut SqliteConnection, table: &str, batch_id: Uuid) -> ImportResult<u64> {
    let result = sqlx::query(&format!("DELETE FROM {} WHERE batch_id = ?", table))
        .bind(batch_id.to_string())
        .execute(&mut *conn)
        .await
        .map_err(|e| match classify(e, &format!("{} of batch {}", table, batch_id)) {
            ImportError::Conflict(_) => ImportError::Conflict(format!(
                "{} created by batch {} are still referenced by records of another batch",
                table, batch_id
            )),
            other => other,
        })?;

    Ok(result.rows_affected())
}

pub async fn count_for_batch<'e>(
    executor: impl SqliteExecutor<'e>,
    table: &str,
    batch_id: Uuid,
) -> ImportResult<u64> {
    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {} WHERE batch_id = ?", table))
        .bind(batch_id.to_string())
        .fetch_one(executor)
        .await?;

    Ok(count as u64)
}
