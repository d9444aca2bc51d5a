//! Database access for umig-import
//!
//! Batch tracking, staging, master tables, the audit log and persisted
//! parameters all live in one SQLite file under the root folder.

pub mod audit;
pub mod batches;
pub mod master;
pub mod schema;
pub mod settings;
pub mod staging;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;
use std::path::Path;
use umig_common::db::{open_database, PoolSettings};

use crate::error::{ImportError, ImportResult};

/// Open the pool and create every import table
pub async fn init_database_pool(db_path: &Path) -> ImportResult<SqlitePool> {
    tracing::debug!("Connecting to database: {}", db_path.display());
    let pool = open_database(db_path, &PoolSettings::default()).await?;
    schema::init_tables(&pool).await?;
    Ok(pool)
}

/// RFC 3339 with microseconds; sorts correctly as text
pub(crate) fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(column: &str, value: &str) -> ImportResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ImportError::storage(format!("Failed to parse {}: {}", column, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamps_sort_as_text() {
        let earlier = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let later = earlier + chrono::Duration::microseconds(15);

        let a = format_timestamp(&earlier);
        let b = format_timestamp(&later);
        assert!(a < b);
        assert_eq!(parse_timestamp("t", &b).unwrap(), later);
        assert!(parse_timestamp("t", "yesterday").is_err());
    }
}
