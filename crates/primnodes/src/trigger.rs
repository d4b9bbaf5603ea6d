use crate::{check_value, timestamp, unsupported_subtype};
use async_trait::async_trait;
use chrono::Utc;
use cron::Schedule;
use primcore::schema::{find_schema, SubtypeSchema};
use primcore::{
    Config, ConfigExt, ConfigSchema, ExecutionError, NodeContext, NodeOutput, PrimitiveExecutor,
    PrimitiveKind, ValidationIssue, Value,
};
use serde_json::{json, Map};
use std::str::FromStr;

const SCHEMAS: &[SubtypeSchema] = &[
    ("manual", ConfigSchema::new(&[], &["initiated_by"])),
    ("webhook", ConfigSchema::new(&[], &["webhook_url", "method"])),
    ("schedule", ConfigSchema::new(&["schedule"], &["timezone"])),
    ("api", ConfigSchema::new(&[], &["endpoint"])),
    ("database", ConfigSchema::new(&["table"], &["operation"])),
    ("email", ConfigSchema::new(&[], &["from_email", "subject_contains"])),
    ("sms", ConfigSchema::new(&[], &["from_number", "message_contains"])),
    ("iot", ConfigSchema::new(&["device_id"], &["event_type"])),
];

const DB_OPERATIONS: &[&str] = &["INSERT", "UPDATE", "DELETE"];
const WEBHOOK_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH"];

fn is_one_of(allowed: &[&str], value: &Value) -> bool {
    value
        .as_str()
        .is_some_and(|s| allowed.contains(&s.to_ascii_uppercase().as_str()))
}

/// Parse a cron expression; five-field expressions get a leading seconds field.
pub(crate) fn parse_schedule(expr: &str) -> Result<Schedule, String> {
    let expr = expr.trim();
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    };
    Schedule::from_str(&normalized)
        .map_err(|e| format!("invalid cron expression '{}': {}", expr, e))
}

/// Starts a workflow from the payload it was triggered with.
///
/// Triggers do no I/O: they stamp the trigger data with a description of
/// where it came from so downstream nodes can inspect it.
pub struct TriggerExecutor;

impl TriggerExecutor {
    fn descriptor(
        subtype: &str,
        config: &Config,
        trigger_data: &Value,
    ) -> Result<Map<String, Value>, ExecutionError> {
        let mut fields = Map::new();
        match subtype {
            "manual" => {
                let initiated_by = config
                    .str_value("initiated_by")
                    .or_else(|| trigger_data.get("initiated_by").and_then(Value::as_str))
                    .unwrap_or("manual");
                fields.insert("initiated_by".into(), json!(initiated_by));
            }
            "webhook" => {
                let url = config.str_or("webhook_url", "/webhook");
                let method = config.str_or("method", "POST").to_ascii_uppercase();
                fields.insert("webhook_url".into(), json!(url));
                fields.insert("method".into(), json!(method));
            }
            "schedule" => {
                let expr = config.require_str("schedule")?;
                let schedule = parse_schedule(expr).map_err(ExecutionError::configuration)?;
                fields.insert("schedule".into(), json!(expr));
                fields.insert("timezone".into(), json!(config.str_or("timezone", "UTC")));
                fields.insert(
                    "next_fire".into(),
                    json!(schedule.upcoming(Utc).next().map(|at| at.to_rfc3339())),
                );
            }
            "api" => {
                fields.insert("endpoint".into(), json!(config.str_or("endpoint", "/api/trigger")));
            }
            "database" => {
                fields.insert("table".into(), json!(config.require_str("table")?));
                let operation = config.str_or("operation", "INSERT").to_ascii_uppercase();
                fields.insert("operation".into(), json!(operation));
            }
            "email" => {
                fields.insert("from".into(), json!(config.str_or("from_email", "")));
                fields.insert("subject".into(), json!(config.str_or("subject_contains", "")));
            }
            "sms" => {
                fields.insert("from_number".into(), json!(config.str_or("from_number", "")));
                let contains = config.str_or("message_contains", "");
                fields.insert("message_contains".into(), json!(contains));
            }
            "iot" => {
                fields.insert("device_id".into(), json!(config.require_str("device_id")?));
                fields.insert("event_type".into(), json!(config.str_or("event_type", "")));
            }
            other => {
                return Err(ExecutionError::configuration(format!(
                    "unsupported trigger subtype '{}'",
                    other
                )));
            }
        }
        Ok(fields)
    }
}

#[async_trait]
impl PrimitiveExecutor for TriggerExecutor {
    fn kind(&self) -> PrimitiveKind {
        PrimitiveKind::Trigger
    }

    fn subtypes(&self) -> Vec<&'static str> {
        SCHEMAS.iter().map(|(name, _)| *name).collect()
    }

    fn schema(&self, subtype: &str) -> Option<ConfigSchema> {
        find_schema(SCHEMAS, subtype)
    }

    fn description(&self) -> &str {
        "Start a workflow from manual, scheduled, webhook or event payloads"
    }

    fn validate_config(&self, subtype: &str, config: &Config) -> Vec<ValidationIssue> {
        let Some(schema) = self.schema(subtype) else {
            return vec![unsupported_subtype(self.kind(), subtype)];
        };
        let mut issues = schema.check(config);

        match subtype {
            "schedule" => {
                if let Some(expr) = config.get("schedule") {
                    match expr.as_str() {
                        Some(expr) => {
                            if let Err(message) = parse_schedule(expr) {
                                issues.push(ValidationIssue::for_key("schedule", message));
                            }
                        }
                        None => issues.push(ValidationIssue::for_key(
                            "schedule",
                            "expected a cron string",
                        )),
                    }
                }
            }
            "database" => check_value(
                config,
                "operation",
                "one of INSERT, UPDATE, DELETE",
                |v| is_one_of(DB_OPERATIONS, v),
                &mut issues,
            ),
            "webhook" => check_value(
                config,
                "method",
                "one of GET, POST, PUT, PATCH",
                |v| is_one_of(WEBHOOK_METHODS, v),
                &mut issues,
            ),
            _ => {}
        }
        issues
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, ExecutionError> {
        let trigger_data = ctx.trigger_data().clone();
        let mut output = Self::descriptor(&ctx.subtype, &ctx.config, &trigger_data)?;
        output.insert("triggered".into(), Value::Bool(true));
        output.insert("trigger_type".into(), json!(ctx.subtype));
        output.insert("trigger_data".into(), trigger_data);
        output.insert("timestamp".into(), timestamp());

        ctx.events.info(format!("{} trigger fired", ctx.subtype));
        Ok(NodeOutput::new(Value::Object(output)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_schedule_accepts_five_and_six_fields() {
        assert!(parse_schedule("0 9 * * *").is_ok());
        assert!(parse_schedule("30 0 9 * * *").is_ok());
        assert!(parse_schedule("every day").is_err());
    }
}
