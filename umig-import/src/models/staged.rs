//! Staged records: raw imported rows waiting for validation and promotion

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Master entity kinds an import can create
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Team,
    User,
    Application,
    Environment,
    Plan,
    Step,
    Instruction,
}

/// Column layout a CSV entity must follow
#[derive(Debug, Clone, Copy)]
pub struct CsvSchema {
    pub required: &'static [&'static str],
    pub optional: &'static [&'static str],
}

impl CsvSchema {
    pub fn knows(&self, column: &str) -> bool {
        self.required.contains(&column) || self.optional.contains(&column)
    }
}

const TEAM_SCHEMA: CsvSchema = CsvSchema {
    required: &["team_name"],
    optional: &["team_description", "team_email"],
};

const USER_SCHEMA: CsvSchema = CsvSchema {
    required: &["user_code", "first_name", "last_name", "user_email"],
    optional: &["team_name", "is_admin"],
};

const APPLICATION_SCHEMA: CsvSchema = CsvSchema {
    required: &["app_code", "app_name"],
    optional: &["app_description"],
};

const ENVIRONMENT_SCHEMA: CsvSchema = CsvSchema {
    required: &["env_code", "env_name"],
    optional: &["env_description"],
};

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Team => "team",
            EntityType::User => "user",
            EntityType::Application => "application",
            EntityType::Environment => "environment",
            EntityType::Plan => "plan",
            EntityType::Step => "step",
            EntityType::Instruction => "instruction",
        }
    }

    /// Plural form used in action summaries ("Deleted 3 teams")
    pub fn plural(&self) -> &'static str {
        match self {
            EntityType::Team => "teams",
            EntityType::User => "users",
            EntityType::Application => "applications",
            EntityType::Environment => "environments",
            EntityType::Plan => "plans",
            EntityType::Step => "steps",
            EntityType::Instruction => "instructions",
        }
    }

    /// CSV column schema; None for entities that have no CSV import
    pub fn csv_schema(&self) -> Option<&'static CsvSchema> {
        match self {
            EntityType::Team => Some(&TEAM_SCHEMA),
            EntityType::User => Some(&USER_SCHEMA),
            EntityType::Application => Some(&APPLICATION_SCHEMA),
            EntityType::Environment => Some(&ENVIRONMENT_SCHEMA),
            EntityType::Plan | EntityType::Step | EntityType::Instruction => None,
        }
    }

    /// Order used by the CSV "all" import (parents before children)
    pub const CSV_IMPORT_ORDER: [EntityType; 4] = [
        EntityType::Team,
        EntityType::User,
        EntityType::Application,
        EntityType::Environment,
    ];
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    /// Accepts singular or plural, any case ("Teams", "team")
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "team" | "teams" => Ok(EntityType::Team),
            "user" | "users" => Ok(EntityType::User),
            "application" | "applications" => Ok(EntityType::Application),
            "environment" | "environments" => Ok(EntityType::Environment),
            "plan" | "plans" | "master_plan" | "master-plan" => Ok(EntityType::Plan),
            "step" | "steps" => Ok(EntityType::Step),
            "instruction" | "instructions" => Ok(EntityType::Instruction),
            other => Err(format!("unknown entity type '{}'", other)),
        }
    }
}

/// Raw record as produced by the parsers, before any typing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum RawRecord {
    /// One CSV data row with the header it was read under
    Csv {
        /// 1-based physical line where the row started
        line: u64,
        columns: Vec<String>,
        values: Vec<String>,
    },
    /// One element of a JSON document
    Json {
        /// 0-based element index within the source
        index: u64,
        value: serde_json::Value,
    },
    /// Row the parser could not read (kept so the failure is reported)
    Unparseable { position: u64, reason: String },
}

impl RawRecord {
    /// Human-readable location used in error reports
    pub fn position_label(&self) -> String {
        match self {
            RawRecord::Csv { line, .. } => format!("line {}", line),
            RawRecord::Json { index, .. } => format!("record {}", index),
            RawRecord::Unparseable { position, .. } => format!("position {}", position),
        }
    }

    /// Field lookup for CSV rows by column name
    pub fn csv_field(&self, column: &str) -> Option<&str> {
        match self {
            RawRecord::Csv { columns, values, .. } => columns
                .iter()
                .position(|c| c == column)
                .and_then(|i| values.get(i))
                .map(|v| v.as_str()),
            _ => None,
        }
    }
}

/// Validator verdict on a staged record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationOutcome {
    Pending,
    Valid,
    Invalid { reason: String },
}

impl ValidationOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ValidationOutcome::Pending => "PENDING",
            ValidationOutcome::Valid => "VALID",
            ValidationOutcome::Invalid { .. } => "INVALID",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ValidationOutcome::Invalid { reason } => Some(reason),
            _ => None,
        }
    }

    /// Rebuild from the persisted label/reason pair
    pub fn from_parts(label: &str, reason: Option<String>) -> Result<Self, String> {
        match label {
            "PENDING" => Ok(ValidationOutcome::Pending),
            "VALID" => Ok(ValidationOutcome::Valid),
            "INVALID" => Ok(ValidationOutcome::Invalid {
                reason: reason.unwrap_or_default(),
            }),
            other => Err(format!("unknown validation outcome '{}'", other)),
        }
    }
}

/// Handle to a staged row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StagedRecordRef {
    pub staged_id: i64,
    pub batch_id: Uuid,
}

/// Staged record; always belongs to exactly one batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedRecord {
    pub staged_id: i64,
    pub batch_id: Uuid,
    pub entity_type: EntityType,
    /// Input the record came from (file name or logical source)
    pub source: String,
    pub raw: RawRecord,
    pub outcome: ValidationOutcome,
}

impl StagedRecord {
    pub fn reference(&self) -> StagedRecordRef {
        StagedRecordRef {
            staged_id: self.staged_id,
            batch_id: self.batch_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_type_parsing() {
        assert_eq!("Teams".parse::<EntityType>().unwrap(), EntityType::Team);
        assert_eq!("environment".parse::<EntityType>().unwrap(), EntityType::Environment);
        assert_eq!("master-plan".parse::<EntityType>().unwrap(), EntityType::Plan);
        assert!("widgets".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_csv_schema_presence() {
        assert!(EntityType::Team.csv_schema().unwrap().knows("team_description"));
        assert!(EntityType::User.csv_schema().unwrap().required.contains(&"user_email"));
        assert!(EntityType::Plan.csv_schema().is_none());
        assert!(EntityType::Step.csv_schema().is_none());
    }

    #[test]
    fn test_csv_field_lookup() {
        let raw = RawRecord::Csv {
            line: 2,
            columns: vec!["team_name".into(), "team_description".into()],
            values: vec!["A,B".into(), "desc".into()],
        };
        assert_eq!(raw.csv_field("team_name"), Some("A,B"));
        assert_eq!(raw.csv_field("team_email"), None);
        assert_eq!(raw.position_label(), "line 2");
    }

    #[test]
    fn test_outcome_parts_round_trip() {
        let invalid = ValidationOutcome::Invalid {
            reason: "step_type must be exactly 3 characters".into(),
        };
        let rebuilt = ValidationOutcome::from_parts(
            invalid.label(),
            invalid.reason().map(str::to_string),
        )
        .unwrap();
        assert_eq!(rebuilt, invalid);
        assert!(ValidationOutcome::from_parts("MAYBE", None).is_err());
    }
}
