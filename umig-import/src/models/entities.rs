//! Typed master entity records produced by validation

use serde::{Deserialize, Serialize};

use super::staged::{EntityType, StagedRecordRef};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamRecord {
    pub team_name: String,
    pub team_description: Option<String>,
    pub team_email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_code: String,
    pub first_name: String,
    pub last_name: String,
    pub user_email: String,
    /// Existing team the user belongs to (resolved at promotion)
    pub team_name: Option<String>,
    pub is_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationRecord {
    pub app_code: String,
    pub app_name: String,
    pub app_description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    pub env_code: String,
    pub env_name: String,
    pub env_description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRecord {
    pub plan_name: String,
    pub plan_description: Option<String>,
    pub plan_status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionRecord {
    pub instruction_id: String,
    pub instruction_title: String,
    pub body: Option<String>,
    pub nominated_team: Option<String>,
    pub duration_minutes: Option<u32>,
}

/// Step with its instructions; promoted as one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Three-character type code (e.g. "TRT")
    pub step_type: String,
    pub step_number: u32,
    pub title: String,
    pub description: Option<String>,
    pub team: Option<String>,
    pub instructions: Vec<InstructionRecord>,
}

/// One validated master record of any entity kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum EntityRecord {
    Team(TeamRecord),
    User(UserRecord),
    Application(ApplicationRecord),
    Environment(EnvironmentRecord),
    Plan(PlanRecord),
    Step(StepRecord),
}

impl EntityRecord {
    pub fn entity_type(&self) -> EntityType {
        match self {
            EntityRecord::Team(_) => EntityType::Team,
            EntityRecord::User(_) => EntityType::User,
            EntityRecord::Application(_) => EntityType::Application,
            EntityRecord::Environment(_) => EntityType::Environment,
            EntityRecord::Plan(_) => EntityType::Plan,
            EntityRecord::Step(_) => EntityType::Step,
        }
    }

    /// Natural key used in conflict messages
    pub fn natural_key(&self) -> String {
        match self {
            EntityRecord::Team(t) => t.team_name.clone(),
            EntityRecord::User(u) => u.user_code.clone(),
            EntityRecord::Application(a) => a.app_code.clone(),
            EntityRecord::Environment(e) => e.env_code.clone(),
            EntityRecord::Plan(p) => p.plan_name.clone(),
            EntityRecord::Step(s) => format!("{}-{}", s.step_type, s.step_number),
        }
    }
}

/// A record that passed validation, bound to its staged row
///
/// Only the validator constructs these, so the promotion engine can never be
/// handed a pending or invalid record.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRecord {
    staged: StagedRecordRef,
    position: String,
    record: EntityRecord,
}

impl ValidatedRecord {
    pub(crate) fn new(staged: StagedRecordRef, position: String, record: EntityRecord) -> Self {
        Self {
            staged,
            position,
            record,
        }
    }

    pub fn staged(&self) -> StagedRecordRef {
        self.staged
    }

    /// Input location ("line 4", "record 2")
    pub fn position(&self) -> &str {
        &self.position
    }

    pub fn record(&self) -> &EntityRecord {
        &self.record
    }
}
