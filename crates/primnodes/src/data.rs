use crate::operator::{criteria_problems, matches_criteria};
use crate::{check_value, timestamp, unsupported_subtype};
use async_trait::async_trait;
use primcore::schema::{find_schema, SubtypeSchema};
use primcore::value::{lookup, type_name};
use primcore::{
    Config, ConfigExt, ConfigSchema, ExecutionError, NodeContext, NodeOutput, PrimitiveExecutor,
    PrimitiveKind, ValidationIssue, Value,
};
use serde::Deserialize;
use serde_json::{json, Map};

const SCHEMAS: &[SubtypeSchema] = &[
    ("mapping", ConfigSchema::new(&["mapping_rules"], &[])),
    ("transform", ConfigSchema::new(&[], &["transform_type"])),
    ("filter", ConfigSchema::new(&["criteria"], &[])),
    ("merge", ConfigSchema::new(&[], &["merge_strategy", "sources"])),
    ("split", ConfigSchema::new(&[], &["split_field"])),
    ("enrich", ConfigSchema::new(&["enrichment_data"], &["source"])),
    ("validate", ConfigSchema::new(&["validation_rules"], &["fail_on_invalid"])),
];

const TRANSFORM_TYPES: &[&str] = &["json", "flatten", "normalize"];
const MERGE_STRATEGIES: &[&str] = &["overwrite", "deep"];

/// Rule for one field of a `validate` node.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FieldRule {
    required: bool,
    #[serde(rename = "type")]
    type_name: Option<String>,
    min_length: Option<usize>,
}

impl FieldRule {
    fn parse(rule: &Value) -> Result<Self, String> {
        match rule {
            // Anything other than an object means "required".
            Value::Object(_) => serde_json::from_value(rule.clone()).map_err(|e| e.to_string()),
            _ => Ok(FieldRule {
                required: true,
                ..FieldRule::default()
            }),
        }
    }

    fn check(&self, value: Option<&Value>) -> Option<String> {
        let present = value.filter(|v| !v.is_null() && v.as_str() != Some(""));
        if self.required && present.is_none() {
            return Some("field is required".to_string());
        }
        let value = present?;
        if let Some(expected) = &self.type_name {
            let actual = type_name(value);
            if expected != actual {
                return Some(format!("expected {}, got {}", expected, actual));
            }
        }
        if let (Some(min), Some(text)) = (self.min_length, value.as_str()) {
            if text.chars().count() < min {
                return Some(format!("minimum length is {}", min));
            }
        }
        None
    }
}

fn flatten_into(prefix: &str, value: &Map<String, Value>, out: &mut Map<String, Value>) {
    for (key, value) in value {
        let key = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            Value::Object(nested) => flatten_into(&key, nested, out),
            other => {
                out.insert(key, other.clone());
            }
        }
    }
}

fn deep_merge(target: &mut Map<String, Value>, source: &Map<String, Value>) {
    for (key, value) in source {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming)
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

fn require_object<'a>(
    data: &'a Value,
    operation: &str,
) -> Result<&'a Map<String, Value>, ExecutionError> {
    data.as_object().ok_or_else(|| {
        ExecutionError::invalid_data(format!(
            "{} expects an object input, got {}",
            operation,
            type_name(data)
        ))
    })
}

/// Pure data operations. Input of the wrong shape fails the node with a
/// non-retryable `InvalidData` error.
pub struct DataExecutor;

impl DataExecutor {
    fn apply(
        subtype: &str,
        config: &Config,
        data: &Value,
    ) -> Result<(Value, Value), ExecutionError> {
        let outcome = match subtype {
            "mapping" => {
                let source = require_object(data, "mapping")?;
                let rules = config.object_value("mapping_rules").ok_or_else(|| {
                    ExecutionError::configuration("'mapping_rules' must be an object")
                })?;
                let mut mapped = Map::new();
                for (from, to) in rules {
                    let Some(to) = to.as_str() else { continue };
                    if let Some(value) = lookup(data, from) {
                        mapped.insert(to.to_string(), value.clone());
                    }
                }
                let metadata = json!({
                    "source_keys": source.keys().collect::<Vec<_>>(),
                    "mapped_keys": mapped.keys().collect::<Vec<_>>(),
                    "rules_applied": rules.len(),
                });
                (Value::Object(mapped), metadata)
            }
            "transform" => {
                let transform_type = config.str_or("transform_type", "json");
                let transformed = match transform_type {
                    "json" => match data {
                        Value::String(text) => serde_json::from_str(text).map_err(|e| {
                            ExecutionError::invalid_data(format!("input is not valid JSON: {}", e))
                        })?,
                        other => Value::String(other.to_string()),
                    },
                    "flatten" => match data {
                        Value::Object(map) => {
                            let mut flat = Map::new();
                            flatten_into("", map, &mut flat);
                            Value::Object(flat)
                        }
                        other => other.clone(),
                    },
                    "normalize" => match data {
                        Value::Object(_) => data.clone(),
                        Value::Array(_) => json!({ "items": data }),
                        Value::Null => json!({}),
                        other => json!({ "value": other }),
                    },
                    other => {
                        return Err(ExecutionError::configuration(format!(
                            "unknown transform_type '{}'",
                            other
                        )));
                    }
                };
                let metadata = json!({
                    "transform_type": transform_type,
                    "original_type": type_name(data),
                    "transformed_type": type_name(&transformed),
                });
                (transformed, metadata)
            }
            "filter" => {
                let criteria = config
                    .object_value("criteria")
                    .ok_or_else(|| ExecutionError::configuration("'criteria' must be an object"))?;
                let items = match data {
                    Value::Array(items) => items.clone(),
                    other => vec![other.clone()],
                };
                let filtered: Vec<Value> = items
                    .iter()
                    .filter(|item| matches_criteria(item, criteria))
                    .cloned()
                    .collect();
                let metadata = json!({
                    "original_count": items.len(),
                    "filtered_count": filtered.len(),
                    "criteria_applied": criteria,
                });
                (Value::Array(filtered), metadata)
            }
            "merge" => {
                let strategy = config.str_or("merge_strategy", "overwrite");
                // Explicit sources win; otherwise merge the input, which for a
                // join node is one object per parent.
                let sources: Vec<&Value> = match config.get("sources") {
                    Some(Value::Array(sources)) => sources.iter().collect(),
                    Some(other) => vec![other],
                    None => match data {
                        Value::Array(items) => items.iter().collect(),
                        Value::Object(parents) => parents.values().collect(),
                        other => vec![other],
                    },
                };
                let mut merged = Map::new();
                for source in &sources {
                    let Value::Object(source) = source else { continue };
                    match strategy {
                        "deep" => deep_merge(&mut merged, source),
                        _ => merged.extend(source.iter().map(|(k, v)| (k.clone(), v.clone()))),
                    }
                }
                let metadata = json!({
                    "merge_strategy": strategy,
                    "sources_count": sources.len(),
                    "result_keys": merged.keys().collect::<Vec<_>>(),
                });
                (Value::Object(merged), metadata)
            }
            "split" => {
                let field = config.str_or("split_field", "items");
                let parts: Vec<Value> = match data.get(field) {
                    Some(Value::Array(items)) => {
                        items.iter().map(|item| json!({ field: [item] })).collect()
                    }
                    _ => vec![data.clone()],
                };
                let metadata = json!({
                    "split_field": field,
                    "split_count": parts.len(),
                    "original_type": type_name(data),
                });
                (Value::Array(parts), metadata)
            }
            "enrich" => {
                let extra = config.object_value("enrichment_data").ok_or_else(|| {
                    ExecutionError::configuration("'enrichment_data' must be an object")
                })?;
                let (enriched, original_keys) = match data {
                    Value::Object(original) => {
                        let mut enriched = original.clone();
                        enriched.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
                        (Value::Object(enriched), original.keys().cloned().collect::<Vec<_>>())
                    }
                    other => (json!({ "original": other, "enriched": extra }), Vec::new()),
                };
                let metadata = json!({
                    "enrichment_source": config.str_or("source", "static"),
                    "original_keys": original_keys,
                    "enriched_keys": extra.keys().collect::<Vec<_>>(),
                });
                (enriched, metadata)
            }
            "validate" => {
                let rules = config.object_value("validation_rules").ok_or_else(|| {
                    ExecutionError::configuration("'validation_rules' must be an object")
                })?;
                let mut results = Map::new();
                let mut failures = Vec::new();
                for (field, rule) in rules {
                    let rule = FieldRule::parse(rule).map_err(|e| {
                        let message = format!("invalid rule for '{}': {}", field, e);
                        ExecutionError::configuration(message)
                    })?;
                    let error = rule.check(lookup(data, field));
                    if let Some(error) = &error {
                        failures.push(format!("{}: {}", field, error));
                    }
                    let verdict = json!({ "valid": error.is_none(), "error": error });
                    results.insert(field.clone(), verdict);
                }
                let valid = failures.is_empty();
                if !valid && config.bool_value("fail_on_invalid").unwrap_or(false) {
                    return Err(ExecutionError::invalid_data(format!(
                        "validation failed: {}",
                        failures.join("; ")
                    )));
                }
                let metadata = json!({
                    "validation_rules_count": rules.len(),
                    "validation_passed": valid,
                });
                (
                    json!({ "valid": valid, "validation_results": results, "data": data }),
                    metadata,
                )
            }
            other => {
                return Err(ExecutionError::configuration(format!(
                    "unsupported data operation '{}'",
                    other
                )));
            }
        };
        Ok(outcome)
    }
}

#[async_trait]
impl PrimitiveExecutor for DataExecutor {
    fn kind(&self) -> PrimitiveKind {
        PrimitiveKind::Data
    }

    fn subtypes(&self) -> Vec<&'static str> {
        SCHEMAS.iter().map(|(name, _)| *name).collect()
    }

    fn schema(&self, subtype: &str) -> Option<ConfigSchema> {
        find_schema(SCHEMAS, subtype)
    }

    fn description(&self) -> &str {
        "Map, transform, filter, merge, split, enrich and validate data"
    }

    fn validate_config(&self, subtype: &str, config: &Config) -> Vec<ValidationIssue> {
        let Some(schema) = self.schema(subtype) else {
            return vec![unsupported_subtype(self.kind(), subtype)];
        };
        let mut issues = schema.check(config);

        check_value(config, "mapping_rules", "an object of source path to target key", |v| {
            v.as_object().is_some_and(|rules| rules.values().all(Value::is_string))
        }, &mut issues);
        check_value(config, "transform_type", "one of json, flatten, normalize", |v| {
            v.as_str().is_some_and(|t| TRANSFORM_TYPES.contains(&t))
        }, &mut issues);
        check_value(config, "merge_strategy", "one of overwrite, deep", |v| {
            v.as_str().is_some_and(|s| MERGE_STRATEGIES.contains(&s))
        }, &mut issues);
        check_value(config, "split_field", "a string", Value::is_string, &mut issues);
        check_value(config, "enrichment_data", "an object", Value::is_object, &mut issues);
        check_value(config, "fail_on_invalid", "a boolean", Value::is_boolean, &mut issues);

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
        if let Some(rules) = config.get("validation_rules") {
            match rules.as_object() {
                Some(rules) => {
                    for (field, rule) in rules {
                        if let Err(message) = FieldRule::parse(rule) {
                            issues.push(ValidationIssue::for_key(
                                "validation_rules",
                                format!("rule for '{}': {}", field, message),
                            ));
                        }
                    }
                }
                None => {
                    issues.push(ValidationIssue::for_key("validation_rules", "expected an object"))
                }
            }
        }
        issues
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, ExecutionError> {
        let data = ctx.operand()?;
        let (result, metadata) = Self::apply(&ctx.subtype, &ctx.config, data)?;

        Ok(NodeOutput::new(json!({
            "operation_type": ctx.subtype,
            "result": result,
            "success": true,
            "metadata": metadata,
            "timestamp": timestamp(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deep_merge_nested_objects() {
        let mut target = json!({"a": {"x": 1, "y": 2}, "b": 1}).as_object().unwrap().clone();
        let source = json!({"a": {"y": 3, "z": 4}, "c": 5});
        deep_merge(&mut target, source.as_object().unwrap());
        assert_eq!(Value::Object(target), json!({"a": {"x": 1, "y": 3, "z": 4}, "b": 1, "c": 5}));
    }

    #[test]
    fn test_field_rule_checks() {
        let rule =
            FieldRule::parse(&json!({"required": true, "type": "str", "min_length": 3})).unwrap();
        assert_eq!(rule.check(None).as_deref(), Some("field is required"));
        assert_eq!(rule.check(Some(&json!(5))).as_deref(), Some("expected str, got int"));
        assert_eq!(rule.check(Some(&json!("ab"))).as_deref(), Some("minimum length is 3"));
        assert_eq!(rule.check(Some(&json!("abc"))), None);

        assert!(FieldRule::parse(&json!({"maximum": 3})).is_err());
        assert!(FieldRule::parse(&json!("required")).unwrap().required);
    }
}
