use crate::operator::{criteria_problems, matches_criteria, Operator};
use crate::{check_value, timestamp, unsupported_subtype};
use async_trait::async_trait;
use primcore::schema::{find_schema, SubtypeSchema};
use primcore::value::{lookup, parse_literal, truthy};
use primcore::{
    Config, ConfigExt, ConfigSchema, ExecutionError, NodeContext, NodeOutput, PrimitiveExecutor,
    PrimitiveKind, ValidationIssue, Value,
};
use regex::Regex;
use serde_json::{json, Map};

const SCHEMAS: &[SubtypeSchema] = &[
    ("if_else", ConfigSchema::new(&["condition"], &[])),
    ("compare", ConfigSchema::new(&["field_a", "operator"], &["field_b", "value"])),
    ("regex", ConfigSchema::new(&["pattern"], &["field"])),
    ("json_path", ConfigSchema::new(&["json_path"], &["expected_value"])),
    ("switch", ConfigSchema::new(&["switch_on", "cases"], &["default"])),
    ("filter", ConfigSchema::new(&["criteria"], &[])),
    ("loop", ConfigSchema::new(&[], &["max_iterations"])),
];

const DEFAULT_MAX_ITERATIONS: u64 = 100;

/// Parsed form of an `if_else` condition.
#[derive(Debug, PartialEq)]
enum Expression {
    Constant(bool),
    /// A bare path: true when the value there is truthy
    Truthy(String),
    Compare {
        path: String,
        op: Operator,
        literal: Value,
    },
}

impl Expression {
    /// `true`, `false`, `<path>` or `<path> <op> <literal>`.
    fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        match raw {
            "" => return Err("condition is empty".to_string()),
            "true" => return Ok(Expression::Constant(true)),
            "false" => return Ok(Expression::Constant(false)),
            _ => {}
        }

        let mut parts = raw.splitn(3, char::is_whitespace);
        let path = parts.next().unwrap_or_default().to_string();
        let Some(op) = parts.next() else {
            return Ok(Expression::Truthy(path));
        };
        let op = Operator::parse(op)
            .ok_or_else(|| format!("unknown operator '{}' in condition '{}'", op, raw))?;
        let literal = parts
            .next()
            .map(parse_literal)
            .ok_or_else(|| format!("condition '{}' has no right-hand side", raw))?;
        Ok(Expression::Compare { path, op, literal })
    }

    fn evaluate(&self, data: &Value) -> bool {
        match self {
            Expression::Constant(result) => *result,
            Expression::Truthy(path) => lookup(data, path).is_some_and(truthy),
            Expression::Compare { path, op, literal } => op.apply(lookup(data, path), literal),
        }
    }
}

fn bool_branch(result: bool) -> &'static str {
    if result {
        "true"
    } else {
        "false"
    }
}

/// Text form used by `regex` and `switch`: strings as-is, anything else as JSON.
fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn as_items(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}

/// Evaluates its input and reports which branch the workflow should take.
///
/// Every subtype sets `result`; the node's branch is `"true"`/`"false"`
/// except for `switch`, whose branch is the matched case name.
pub struct ConditionExecutor;

impl ConditionExecutor {
    fn evaluate(
        subtype: &str,
        config: &Config,
        data: &Value,
    ) -> Result<(Map<String, Value>, String), ExecutionError> {
        let mut out = Map::new();
        let branch = match subtype {
            "if_else" => {
                let condition = config.require_str("condition")?;
                let result = Expression::parse(condition)
                    .map_err(ExecutionError::configuration)?
                    .evaluate(data);
                out.insert("result".into(), json!(result));
                out.insert("condition".into(), json!(condition));
                out.insert("evaluated_data".into(), data.clone());
                bool_branch(result).to_string()
            }
            "compare" => {
                let field_a = config.require_str("field_a")?;
                let op_name = config.require_str("operator")?;
                let op = Operator::parse(op_name).ok_or_else(|| {
                    ExecutionError::configuration(format!("unknown operator '{}'", op_name))
                })?;
                let value_a = lookup(data, field_a).cloned();
                let value_b = match config.str_value("field_b") {
                    Some(field_b) => lookup(data, field_b).cloned().unwrap_or(Value::Null),
                    None => config.get("value").cloned().unwrap_or(Value::Null),
                };
                let result = op.apply(value_a.as_ref(), &value_b);
                let shown_a = value_a.clone().unwrap_or(Value::Null);
                out.insert("result".into(), json!(result));
                out.insert(
                    "comparison".into(),
                    json!(format!("{} {} {}", shown_a, op.symbol(), value_b)),
                );
                out.insert("values".into(), json!({ "a": shown_a, "b": value_b }));
                bool_branch(result).to_string()
            }
            "regex" => {
                let pattern = config.require_str("pattern")?;
                let re = Regex::new(pattern)
                    .map_err(|e| ExecutionError::configuration(format!("invalid pattern: {}", e)))?;
                let text = match config.str_value("field") {
                    Some(field) => lookup(data, field).map(as_text).unwrap_or_default(),
                    None => as_text(data),
                };
                let matched = re.find(&text).map(|m| m.as_str().to_string());
                let result = matched.is_some();
                out.insert("result".into(), json!(result));
                out.insert("pattern".into(), json!(pattern));
                out.insert("matched_text".into(), json!(matched));
                out.insert("full_text".into(), json!(text));
                bool_branch(result).to_string()
            }
            "json_path" => {
                let path = config.require_str("json_path")?;
                let found = lookup(data, path).filter(|v| !v.is_null()).cloned();
                let expected = config.get("expected_value");
                let result = match expected {
                    Some(expected) => found.as_ref() == Some(expected),
                    None => found.is_some(),
                };
                out.insert("result".into(), json!(result));
                out.insert("json_path".into(), json!(path));
                out.insert("value".into(), found.unwrap_or(Value::Null));
                out.insert("expected_value".into(), expected.cloned().unwrap_or(Value::Null));
                bool_branch(result).to_string()
            }
            "switch" => {
                let switch_on = config.require_str("switch_on")?;
                let cases = config
                    .object_value("cases")
                    .ok_or_else(|| ExecutionError::configuration("'cases' must be an object"))?;
                let value = lookup(data, switch_on).cloned().unwrap_or(Value::Null);
                let matched = cases
                    .get(&as_text(&value))
                    .or_else(|| cases.get("default"))
                    .and_then(Value::as_str)
                    .unwrap_or_else(|| config.str_or("default", "default"))
                    .to_string();
                out.insert("result".into(), json!(true));
                out.insert("switch_value".into(), value);
                out.insert("matched_case".into(), json!(matched));
                out.insert("available_cases".into(), json!(cases.keys().collect::<Vec<_>>()));
                matched
            }
            "filter" => {
                let criteria = config
                    .object_value("criteria")
                    .ok_or_else(|| ExecutionError::configuration("'criteria' must be an object"))?;
                let items = as_items(data);
                let filtered: Vec<Value> = items
                    .iter()
                    .filter(|item| matches_criteria(item, criteria))
                    .cloned()
                    .collect();
                let result = !filtered.is_empty();
                out.insert("result".into(), json!(result));
                out.insert("original_count".into(), json!(items.len()));
                out.insert("filtered_count".into(), json!(filtered.len()));
                out.insert("filtered_data".into(), Value::Array(filtered));
                bool_branch(result).to_string()
            }
            "loop" => {
                let max = config.u64_value("max_iterations").unwrap_or(DEFAULT_MAX_ITERATIONS);
                let mut items = as_items(data);
                items.truncate(max as usize);
                let result = !items.is_empty();
                out.insert("result".into(), json!(result));
                out.insert("iteration_count".into(), json!(items.len()));
                out.insert("max_iterations".into(), json!(max));
                out.insert("items".into(), Value::Array(items));
                bool_branch(result).to_string()
            }
            other => {
                return Err(ExecutionError::configuration(format!(
                    "unsupported condition subtype '{}'",
                    other
                )));
            }
        };
        Ok((out, branch))
    }
}

#[async_trait]
impl PrimitiveExecutor for ConditionExecutor {
    fn kind(&self) -> PrimitiveKind {
        PrimitiveKind::Condition
    }

    fn subtypes(&self) -> Vec<&'static str> {
        SCHEMAS.iter().map(|(name, _)| *name).collect()
    }

    fn schema(&self, subtype: &str) -> Option<ConfigSchema> {
        find_schema(SCHEMAS, subtype)
    }

    fn description(&self) -> &str {
        "Evaluate input data and choose which outgoing branch runs"
    }

    fn validate_config(&self, subtype: &str, config: &Config) -> Vec<ValidationIssue> {
        let Some(schema) = self.schema(subtype) else {
            return vec![unsupported_subtype(self.kind(), subtype)];
        };
        let mut issues = schema.check(config);

        if let Some(condition) = config.get("condition") {
            match condition.as_str().map(Expression::parse) {
                Some(Ok(_)) => {}
                Some(Err(message)) => issues.push(ValidationIssue::for_key("condition", message)),
                None => issues.push(ValidationIssue::for_key(
                    "condition",
                    "expected an expression string",
                )),
            }
        }
        if let Some(pattern) = config.get("pattern") {
            match pattern.as_str().map(Regex::new) {
                Some(Ok(_)) => {}
                Some(Err(e)) => issues.push(ValidationIssue::for_key(
                    "pattern",
                    format!("invalid regex: {}", e),
                )),
                None => issues.push(ValidationIssue::for_key("pattern", "expected a regex string")),
            }
        }
        check_value(
            config,
            "operator",
            "a comparison operator",
            |v| v.as_str().and_then(Operator::parse).is_some(),
            &mut issues,
        );
        check_value(config, "cases", "an object mapping values to branch names", |v| {
            v.as_object().is_some_and(|cases| cases.values().all(Value::is_string))
        }, &mut issues);
        if let Some(criteria) = config.get("criteria") {
            match criteria.as_object() {
                Some(criteria) => issues.extend(
                    criteria_problems(criteria)
                        .into_iter()
                        .map(|message| ValidationIssue::for_key("criteria", message)),
                ),
                None => issues.push(ValidationIssue::for_key("criteria", "expected an object")),
            }
        }
        check_value(
            config,
            "max_iterations",
            "a positive integer",
            |v| v.as_u64().is_some_and(|n| n > 0),
            &mut issues,
        );
        issues
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, ExecutionError> {
        let data = ctx.operand()?;
        let (mut output, branch) = Self::evaluate(&ctx.subtype, &ctx.config, data)?;
        output.insert("condition_type".into(), json!(ctx.subtype));
        output.insert("branch".into(), json!(branch));
        output.insert("timestamp".into(), timestamp());

        tracing::debug!(node_id = %ctx.node_id, branch = %branch, "Condition evaluated");
        Ok(NodeOutput::new(Value::Object(output)).with_branch(branch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expression_parsing() {
        assert_eq!(Expression::parse("true"), Ok(Expression::Constant(true)));
        assert_eq!(Expression::parse("user.active"), Ok(Expression::Truthy("user.active".into())));
        assert_eq!(
            Expression::parse("amount >= 100"),
            Ok(Expression::Compare {
                path: "amount".into(),
                op: Operator::Ge,
                literal: json!(100),
            })
        );
        assert!(Expression::parse("amount ~ 3").is_err());
        assert!(Expression::parse("amount >").is_err());
    }

    #[test]
    fn test_expression_string_literal() {
        let expr = Expression::parse("status == 'open'").unwrap();
        assert!(expr.evaluate(&json!({"status": "open"})));
        assert!(!expr.evaluate(&json!({"status": "closed"})));
    }
}
