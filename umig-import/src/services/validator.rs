//! Record validation
//!
//! Pure functions: a staged record goes in, a typed record or a rejection
//! reason comes out. Nothing here touches the database.

use serde_json::{Map, Value};

use crate::models::{
    ApplicationRecord, EntityRecord, EntityType, EnvironmentRecord, InstructionRecord, PlanRecord,
    RawRecord, StagedRecord, StepRecord, TeamRecord, UserRecord, ValidatedRecord,
    ValidationOutcome,
};

/// Length of every step type code
pub const STEP_TYPE_LENGTH: usize = 3;

pub const DEFAULT_PLAN_STATUS: &str = "DRAFT";

/// Outcome for a staged record
pub fn validate(staged: &StagedRecord) -> ValidationOutcome {
    match check(staged) {
        Ok(_) => ValidationOutcome::Valid,
        Err(reason) => ValidationOutcome::Invalid { reason },
    }
}

/// Validate and type a staged record
pub fn check(staged: &StagedRecord) -> Result<ValidatedRecord, String> {
    let record = type_record(staged.entity_type, &staged.raw)?;
    Ok(ValidatedRecord::new(
        staged.reference(),
        staged.raw.position_label(),
        record,
    ))
}

/// Entity-specific rules
pub fn type_record(entity: EntityType, raw: &RawRecord) -> Result<EntityRecord, String> {
    match raw {
        RawRecord::Unparseable { reason, .. } => Err(reason.clone()),
        RawRecord::Csv { .. } => type_csv_row(entity, raw),
        RawRecord::Json { value, .. } => type_json_value(entity, value),
    }
}

fn type_csv_row(entity: EntityType, raw: &RawRecord) -> Result<EntityRecord, String> {
    let RawRecord::Csv { columns, values, .. } = raw else {
        return Err("expected a CSV row".into());
    };
    if values.len() != columns.len() {
        return Err(format!(
            "expected {} fields, found {}",
            columns.len(),
            values.len()
        ));
    }
    let schema = entity
        .csv_schema()
        .ok_or_else(|| format!("CSV import of {} is not supported", entity.plural()))?;

    let row = CsvRow { raw };
    for column in schema.required {
        row.required(column)?;
    }

    let record = match entity {
        EntityType::Team => {
            let team_email = row.optional("team_email");
            if let Some(email) = &team_email {
                check_email("team_email", email)?;
            }
            EntityRecord::Team(TeamRecord {
                team_name: row.required("team_name")?,
                team_description: row.optional("team_description"),
                team_email,
            })
        }
        EntityType::User => {
            let user_email = row.required("user_email")?;
            check_email("user_email", &user_email)?;
            let is_admin = match row.optional("is_admin") {
                Some(flag) => parse_flag(&flag)
                    .ok_or_else(|| format!("is_admin must be true/false/1/0/yes/no (got '{}')", flag))?,
                None => false,
            };
            EntityRecord::User(UserRecord {
                user_code: row.required("user_code")?,
                first_name: row.required("first_name")?,
                last_name: row.required("last_name")?,
                user_email,
                team_name: row.optional("team_name"),
                is_admin,
            })
        }
        EntityType::Application => EntityRecord::Application(ApplicationRecord {
            app_code: row.required("app_code")?,
            app_name: row.required("app_name")?,
            app_description: row.optional("app_description"),
        }),
        EntityType::Environment => EntityRecord::Environment(EnvironmentRecord {
            env_code: row.required("env_code")?,
            env_name: row.required("env_name")?,
            env_description: row.optional("env_description"),
        }),
        EntityType::Plan | EntityType::Step | EntityType::Instruction => {
            return Err(format!("CSV import of {} is not supported", entity.plural()))
        }
    };
    Ok(record)
}

struct CsvRow<'a> {
    raw: &'a RawRecord,
}

impl CsvRow<'_> {
    fn required(&self, column: &str) -> Result<String, String> {
        self.optional(column)
            .ok_or_else(|| format!("required field '{}' is empty", column))
    }

    fn optional(&self, column: &str) -> Option<String> {
        self.raw
            .csv_field(column)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }
}

fn check_email(field: &str, email: &str) -> Result<(), String> {
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() && !domain.contains('@') => {
            Ok(())
        }
        _ => Err(format!("{} '{}' is not a valid email address", field, email)),
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Some(true),
        "false" | "0" | "no" | "n" => Some(false),
        _ => None,
    }
}

fn type_json_value(entity: EntityType, value: &Value) -> Result<EntityRecord, String> {
    let object = value
        .as_object()
        .ok_or_else(|| format!("expected a JSON object, found {}", json_kind(value)))?;

    match entity {
        EntityType::Step => type_step(object).map(EntityRecord::Step),
        EntityType::Plan => type_plan(object).map(EntityRecord::Plan),
        other => Err(format!("JSON import of {} is not supported", other.plural())),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn required_str(object: &Map<String, Value>, field: &str) -> Result<String, String> {
    match object.get(field) {
        None | Some(Value::Null) => Err(format!("missing required field '{}'", field)),
        Some(Value::String(s)) if s.trim().is_empty() => {
            Err(format!("required field '{}' is empty", field))
        }
        Some(Value::String(s)) => Ok(s.trim().to_string()),
        Some(other) => Err(format!("field '{}' must be a string, found {}", field, json_kind(other))),
    }
}

fn optional_str(object: &Map<String, Value>, field: &str) -> Result<Option<String>, String> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(other) => Err(format!("field '{}' must be a string, found {}", field, json_kind(other))),
    }
}

/// Non-negative integer given as a JSON number or a digit string
fn optional_count(object: &Map<String, Value>, field: &str) -> Result<Option<u32>, String> {
    let invalid = || format!("field '{}' must be a non-negative integer", field);
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .map(Some)
            .ok_or_else(invalid),
        Some(Value::String(s)) => s.trim().parse::<u32>().map(Some).map_err(|_| invalid()),
        Some(_) => Err(invalid()),
    }
}

/// Identifier given as a string or an integer
fn required_id(object: &Map<String, Value>, field: &str) -> Result<String, String> {
    match object.get(field) {
        Some(Value::Number(n)) if n.is_u64() || n.is_i64() => Ok(n.to_string()),
        _ => required_str(object, field),
    }
}

fn type_step(object: &Map<String, Value>) -> Result<StepRecord, String> {
    let step_type = required_str(object, "step_type")?;
    let type_len = step_type.chars().count();
    if type_len != STEP_TYPE_LENGTH {
        return Err(format!(
            "step_type must be exactly {} characters (got '{}', {} characters)",
            STEP_TYPE_LENGTH, step_type, type_len
        ));
    }

    let step_number = optional_count(object, "step_number")?
        .ok_or_else(|| "missing required field 'step_number'".to_string())?;

    let instructions = match object.get("instructions").or_else(|| object.get("task_list")) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, item)| type_instruction(item).map_err(|e| format!("instruction {}: {}", i, e)))
            .collect::<Result<Vec<_>, _>>()?,
        Some(other) => {
            return Err(format!("field 'instructions' must be an array, found {}", json_kind(other)))
        }
    };

    let mut seen = std::collections::HashSet::new();
    for instruction in &instructions {
        if !seen.insert(instruction.instruction_id.as_str()) {
            return Err(format!(
                "duplicate instruction_id '{}' within step",
                instruction.instruction_id
            ));
        }
    }

    Ok(StepRecord {
        step_type: step_type.to_ascii_uppercase(),
        step_number,
        title: required_str(object, "title")?,
        description: optional_str(object, "description")?,
        team: optional_str(object, "team")?,
        instructions,
    })
}

fn type_instruction(value: &Value) -> Result<InstructionRecord, String> {
    let object = value
        .as_object()
        .ok_or_else(|| format!("expected a JSON object, found {}", json_kind(value)))?;

    Ok(InstructionRecord {
        instruction_id: required_id(object, "instruction_id")?,
        instruction_title: required_str(object, "instruction_title")?,
        body: optional_str(object, "body")?,
        nominated_team: optional_str(object, "nominated_team")?,
        duration_minutes: optional_count(object, "duration_minutes")?,
    })
}

fn type_plan(object: &Map<String, Value>) -> Result<PlanRecord, String> {
    Ok(PlanRecord {
        plan_name: required_str(object, "plan_name")?,
        plan_description: optional_str(object, "plan_description")?,
        plan_status: optional_str(object, "plan_status")?
            .map(|s| s.to_ascii_uppercase())
            .unwrap_or_else(|| DEFAULT_PLAN_STATUS.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn staged(entity: EntityType, raw: RawRecord) -> StagedRecord {
        StagedRecord {
            staged_id: 1,
            batch_id: Uuid::new_v4(),
            entity_type: entity,
            source: "test".into(),
            raw,
            outcome: ValidationOutcome::Pending,
        }
    }

    fn csv(columns: &[&str], values: &[&str]) -> RawRecord {
        RawRecord::Csv {
            line: 2,
            columns: columns.iter().map(|s| s.to_string()).collect(),
            values: values.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn json_step(value: Value) -> StagedRecord {
        staged(EntityType::Step, RawRecord::Json { index: 0, value })
    }

    #[test]
    fn test_valid_team_row() {
        let record = staged(
            EntityType::Team,
            csv(&["team_name", "team_description"], &["  A,B ", ""]),
        );
        let validated = check(&record).unwrap();
        assert_eq!(
            validated.record(),
            &EntityRecord::Team(TeamRecord {
                team_name: "A,B".into(),
                team_description: None,
                team_email: None,
            })
        );
        assert_eq!(validated.position(), "line 2");
        assert_eq!(validate(&record), ValidationOutcome::Valid);
    }

    #[test]
    fn test_csv_row_rules() {
        let cols = ["user_code", "first_name", "last_name", "user_email", "is_admin"];
        let cases = [
            (vec!["U1", "Ann", "Lee", "ann.example.com", ""], "not a valid email"),
            (vec!["U1", "", "Lee", "ann@example.com", ""], "'first_name' is empty"),
            (vec!["U1", "Ann", "Lee", "ann@example.com", "maybe"], "is_admin"),
            (vec!["U1", "Ann", "Lee"], "expected 5 fields, found 3"),
        ];
        for (values, expected) in cases {
            let outcome = validate(&staged(EntityType::User, csv(&cols, &values)));
            let reason = outcome.reason().unwrap_or_default().to_string();
            assert!(reason.contains(expected), "{values:?}: {reason}");
        }

        let ok = check(&staged(
            EntityType::User,
            csv(&cols, &["U1", "Ann", "Lee", "ann@example.com", "Yes"]),
        ))
        .unwrap();
        assert!(matches!(ok.record(), EntityRecord::User(u) if u.is_admin));
    }

    #[test]
    fn test_unparseable_row_keeps_reason() {
        let record = staged(
            EntityType::Team,
            RawRecord::Unparseable {
                position: 7,
                reason: "line 7: field 2 is not valid UTF-8".into(),
            },
        );
        assert_eq!(
            validate(&record),
            ValidationOutcome::Invalid {
                reason: "line 7: field 2 is not valid UTF-8".into()
            }
        );
    }

    #[test]
    fn test_step_type_must_be_three_characters() {
        let outcome = validate(&json_step(json!({
            "step_type": "TR",
            "step_number": 1,
            "title": "Short type"
        })));
        let reason = outcome.reason().unwrap();
        assert!(reason.contains("exactly 3 characters"), "{reason}");

        let long = validate(&json_step(json!({"step_type": "TRTX", "step_number": 1, "title": "x"})));
        assert!(long.reason().unwrap().contains("exactly 3 characters"));
    }

    #[test]
    fn test_step_with_task_list_alias() {
        let validated = check(&json_step(json!({
            "step_type": "trt",
            "step_number": "4",
            "title": "Cutover",
            "team": "Ops",
            "task_list": [
                {"instruction_id": 1, "instruction_title": "Stop services", "duration_minutes": 15},
                {"instruction_id": "2", "instruction_title": "Back up", "nominated_team": "DBA"}
            ]
        })))
        .unwrap();

        let EntityRecord::Step(step) = validated.record() else {
            panic!("expected step");
        };
        assert_eq!(step.step_type, "TRT");
        assert_eq!(step.step_number, 4);
        assert_eq!(step.instructions.len(), 2);
        assert_eq!(step.instructions[0].instruction_id, "1");
        assert_eq!(step.instructions[0].duration_minutes, Some(15));
        assert_eq!(step.instructions[1].nominated_team.as_deref(), Some("DBA"));
    }

    #[test]
    fn test_step_rejections() {
        let cases = [
            (json!({"step_number": 1, "title": "x"}), "missing required field 'step_type'"),
            (json!({"step_type": "TRT", "title": "x"}), "step_number"),
            (json!({"step_type": "TRT", "step_number": -1, "title": "x"}), "non-negative"),
            (json!({"step_type": "TRT", "step_number": 1, "title": "  "}), "'title' is empty"),
            (json!({"step_type": "TRT", "step_number": 1, "title": "x", "instructions": {}}), "must be an array"),
            (
                json!({"step_type": "TRT", "step_number": 1, "title": "x",
                       "instructions": [{"instruction_id": "a"}]}),
                "instruction 0: missing required field 'instruction_title'",
            ),
            (
                json!({"step_type": "TRT", "step_number": 1, "title": "x",
                       "instructions": [
                           {"instruction_id": "a", "instruction_title": "one"},
                           {"instruction_id": "a", "instruction_title": "two"}]}),
                "duplicate instruction_id 'a'",
            ),
            (json!(["not", "an", "object"]), "expected a JSON object"),
        ];
        for (value, expected) in cases {
            let outcome = validate(&json_step(value.clone()));
            let reason = outcome.reason().unwrap_or_default().to_string();
            assert!(reason.contains(expected), "{value}: {reason}");
        }
    }

    #[test]
    fn test_plan_defaults_status() {
        let record = staged(
            EntityType::Plan,
            RawRecord::Json {
                index: 0,
                value: json!({"plan_name": "Wave 1"}),
            },
        );
        let validated = check(&record).unwrap();
        assert!(matches!(
            validated.record(),
            EntityRecord::Plan(p) if p.plan_status == DEFAULT_PLAN_STATUS && p.plan_description.is_none()
        ));
    }
}
