//! Table definitions
//!
//! Every master table carries `batch_id`, the batch that created the row, so
//! rollback can find exactly what an import promoted.

use sqlx::SqlitePool;

use crate::error::ImportResult;
use crate::models::EntityType;

const TABLES: &[(&str, &str)] = &[
    (
        "import_batches",
        r#"
        CREATE TABLE IF NOT EXISTS import_batches (
            batch_id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            kind TEXT NOT NULL,
            status TEXT NOT NULL
                CHECK (status IN ('IN_PROGRESS', 'COMPLETED', 'FAILED', 'ROLLED_BACK')),
            actor TEXT NOT NULL,
            started_at TEXT NOT NULL,
            ended_at TEXT,
            records_processed INTEGER NOT NULL DEFAULT 0,
            records_succeeded INTEGER NOT NULL DEFAULT 0,
            records_failed INTEGER NOT NULL DEFAULT 0,
            errors TEXT NOT NULL DEFAULT '[]',
            status_reason TEXT,
            rollback TEXT,
            CHECK (records_succeeded + records_failed = records_processed)
        )
        "#,
    ),
    (
        "staging_records",
        r#"
        CREATE TABLE IF NOT EXISTS staging_records (
            staged_id INTEGER PRIMARY KEY AUTOINCREMENT,
            batch_id TEXT NOT NULL REFERENCES import_batches(batch_id),
            entity_type TEXT NOT NULL,
            source TEXT NOT NULL,
            raw TEXT NOT NULL,
            outcome TEXT NOT NULL DEFAULT 'PENDING'
                CHECK (outcome IN ('PENDING', 'VALID', 'INVALID')),
            reason TEXT,
            promoted INTEGER NOT NULL DEFAULT 0,
            staged_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "import_audit",
        r#"
        CREATE TABLE IF NOT EXISTS import_audit (
            audit_id INTEGER PRIMARY KEY AUTOINCREMENT,
            batch_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            actor TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            summary TEXT NOT NULL,
            detail TEXT NOT NULL DEFAULT 'null'
        )
        "#,
    ),
    (
        "teams",
        r#"
        CREATE TABLE IF NOT EXISTS teams (
            team_id INTEGER PRIMARY KEY AUTOINCREMENT,
            team_name TEXT NOT NULL UNIQUE,
            team_description TEXT,
            team_email TEXT,
            batch_id TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "users",
        r#"
        CREATE TABLE IF NOT EXISTS users (
            user_id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_code TEXT NOT NULL UNIQUE,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            user_email TEXT NOT NULL,
            team_id INTEGER REFERENCES teams(team_id),
            is_admin INTEGER NOT NULL DEFAULT 0,
            batch_id TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "applications",
        r#"
        CREATE TABLE IF NOT EXISTS applications (
            app_id INTEGER PRIMARY KEY AUTOINCREMENT,
            app_code TEXT NOT NULL UNIQUE,
            app_name TEXT NOT NULL,
            app_description TEXT,
            batch_id TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "environments",
        r#"
        CREATE TABLE IF NOT EXISTS environments (
            env_id INTEGER PRIMARY KEY AUTOINCREMENT,
            env_code TEXT NOT NULL UNIQUE,
            env_name TEXT NOT NULL,
            env_description TEXT,
            batch_id TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "plans",
        r#"
        CREATE TABLE IF NOT EXISTS plans (
            plan_id INTEGER PRIMARY KEY AUTOINCREMENT,
            plan_name TEXT NOT NULL UNIQUE,
            plan_description TEXT,
            plan_status TEXT NOT NULL DEFAULT 'DRAFT',
            batch_id TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "steps",
        r#"
        CREATE TABLE IF NOT EXISTS steps (
            step_id INTEGER PRIMARY KEY AUTOINCREMENT,
            step_type TEXT NOT NULL CHECK (length(step_type) = 3),
            step_number INTEGER NOT NULL CHECK (step_number >= 0),
            title TEXT NOT NULL,
            description TEXT,
            team_id INTEGER REFERENCES teams(team_id),
            batch_id TEXT,
            created_at TEXT NOT NULL,
            UNIQUE (step_type, step_number)
        )
        "#,
    ),
    (
        "instructions",
        r#"
        CREATE TABLE IF NOT EXISTS instructions (
            instruction_id INTEGER PRIMARY KEY AUTOINCREMENT,
            step_id INTEGER NOT NULL REFERENCES steps(step_id),
            instruction_code TEXT NOT NULL,
            title TEXT NOT NULL,
            body TEXT,
            team_id INTEGER REFERENCES teams(team_id),
            duration_minutes INTEGER CHECK (duration_minutes >= 0),
            batch_id TEXT,
            created_at TEXT NOT NULL,
            UNIQUE (step_id, instruction_code)
        )
        "#,
    ),
];

const INDEXES_AND_TRIGGERS: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_import_batches_started ON import_batches(started_at)",
    "CREATE INDEX IF NOT EXISTS idx_import_batches_status ON import_batches(status)",
    "CREATE INDEX IF NOT EXISTS idx_staging_batch ON staging_records(batch_id, outcome)",
    "CREATE INDEX IF NOT EXISTS idx_audit_batch ON import_audit(batch_id, timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_teams_batch ON teams(batch_id)",
    "CREATE INDEX IF NOT EXISTS idx_users_batch ON users(batch_id)",
    "CREATE INDEX IF NOT EXISTS idx_applications_batch ON applications(batch_id)",
    "CREATE INDEX IF NOT EXISTS idx_environments_batch ON environments(batch_id)",
    "CREATE INDEX IF NOT EXISTS idx_plans_batch ON plans(batch_id)",
    "CREATE INDEX IF NOT EXISTS idx_steps_batch ON steps(batch_id)",
    "CREATE INDEX IF NOT EXISTS idx_instructions_batch ON instructions(batch_id)",
    r#"
    CREATE TRIGGER IF NOT EXISTS import_audit_no_update
    BEFORE UPDATE ON import_audit
    BEGIN
        SELECT RAISE(ABORT, 'import_audit is append-only');
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS import_audit_no_delete
    BEFORE DELETE ON import_audit
    BEGIN
        SELECT RAISE(ABORT, 'import_audit is append-only');
    END
    "#,
];

/// Create import tables, indexes and audit triggers if missing
pub async fn init_tables(pool: &SqlitePool) -> ImportResult<()> {
    for (name, ddl) in TABLES {
        sqlx::query(ddl).execute(pool).await?;
        tracing::trace!(table = name, "Table ready");
    }
    for ddl in INDEXES_AND_TRIGGERS {
        sqlx::query(ddl).execute(pool).await?;
    }

    tracing::info!(tables = TABLES.len(), "Import database tables initialized");
    Ok(())
}

/// Master tables in rollback delete order (children before parents)
pub const MASTER_DELETE_ORDER: [(&str, EntityType); 7] = [
    ("instructions", EntityType::Instruction),
    ("steps", EntityType::Step),
    ("users", EntityType::User),
    ("plans", EntityType::Plan),
    ("teams", EntityType::Team),
    ("applications", EntityType::Application),
    ("environments", EntityType::Environment),
];
