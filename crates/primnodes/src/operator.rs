use primcore::Value;
use std::cmp::Ordering;

/// Comparison operators shared by conditions and data filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Contains,
}

impl Operator {
    /// Accepts both symbols (`>=`) and names (`greater_than`).
    pub fn parse(raw: &str) -> Option<Self> {
        let op = match raw.trim() {
            "==" | "=" | "eq" | "equals" => Operator::Eq,
            "!=" | "ne" | "not_equals" => Operator::Ne,
            ">" | "gt" | "greater_than" => Operator::Gt,
            "<" | "lt" | "less_than" => Operator::Lt,
            ">=" | "ge" | "greater_or_equal" => Operator::Ge,
            "<=" | "le" | "less_or_equal" => Operator::Le,
            "contains" => Operator::Contains,
            _ => return None,
        };
        Some(op)
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::Ge => ">=",
            Operator::Le => "<=",
            Operator::Contains => "contains",
        }
    }

    /// Evaluate `left <op> right`. A missing left operand only satisfies `!=`.
    pub fn apply(&self, left: Option<&Value>, right: &Value) -> bool {
        let Some(left) = left else {
            return *self == Operator::Ne;
        };
        match self {
            Operator::Eq => loose_eq(left, right),
            Operator::Ne => !loose_eq(left, right),
            Operator::Gt => ordering(left, right).is_some_and(Ordering::is_gt),
            Operator::Lt => ordering(left, right).is_some_and(Ordering::is_lt),
            Operator::Ge => ordering(left, right).is_some_and(Ordering::is_ge),
            Operator::Le => ordering(left, right).is_some_and(Ordering::is_le),
            Operator::Contains => contains(left, right),
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Numbers compare by value (`1 == 1.0`), everything else structurally.
fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

/// Numeric order when both sides read as numbers, lexical order for two strings.
fn ordering(left: &Value, right: &Value) -> Option<Ordering> {
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => match (left, right) {
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => None,
        },
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => match needle {
            Value::String(n) => s.contains(n.as_str()),
            other => s.contains(&other.to_string()),
        },
        Value::Array(items) => items.iter().any(|item| loose_eq(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}

/// Whether `item` satisfies every criterion.
///
/// A criterion is either a plain value (equality) or `{"operator": .., "value": ..}`.
/// Non-object items never match.
pub(crate) fn matches_criteria(item: &Value, criteria: &serde_json::Map<String, Value>) -> bool {
    let Value::Object(fields) = item else {
        return false;
    };
    criteria.iter().all(|(key, expected)| {
        let actual = fields.get(key);
        match criterion_operator(expected) {
            Some((op, target)) => op.apply(actual, target),
            None => actual.is_some_and(|actual| loose_eq(actual, expected)),
        }
    })
}

fn criterion_operator(expected: &Value) -> Option<(Operator, &Value)> {
    let spec = expected.as_object()?;
    let op = Operator::parse(spec.get("operator")?.as_str()?)?;
    Some((op, spec.get("value").unwrap_or(&Value::Null)))
}

/// Check a criteria object, returning a message for each malformed entry.
pub(crate) fn criteria_problems(criteria: &serde_json::Map<String, Value>) -> Vec<String> {
    criteria
        .iter()
        .filter_map(|(key, expected)| {
            let op = expected.as_object()?.get("operator")?;
            match op.as_str().and_then(Operator::parse) {
                Some(_) => None,
                None => Some(format!("criterion '{}' has unknown operator {}", key, op)),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numeric_comparisons_accept_strings() {
        assert!(Operator::Gt.apply(Some(&json!("10")), &json!(9)));
        assert!(Operator::Le.apply(Some(&json!(3.0)), &json!(3)));
        assert!(!Operator::Lt.apply(Some(&json!("abc")), &json!(1)));
    }

    #[test]
    fn test_missing_operand() {
        assert!(Operator::Ne.apply(None, &json!(1)));
        assert!(!Operator::Eq.apply(None, &Value::Null));
    }

    #[test]
    fn test_criteria_with_operators() {
        let criteria = json!({"status": "open", "age": {"operator": "greater_than", "value": 30}});
        let criteria = criteria.as_object().unwrap();
        assert!(matches_criteria(&json!({"status": "open", "age": 31}), criteria));
        assert!(!matches_criteria(&json!({"status": "open", "age": 30}), criteria));
        assert!(!matches_criteria(&json!("open"), criteria));
    }
}
