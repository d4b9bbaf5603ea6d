use crate::ExecutionError;

pub use serde_json::Value;

/// Node configuration: an opaque key/value mapping validated by the executor.
pub type Config = serde_json::Map<String, Value>;

/// Typed accessors over a node's configuration.
pub trait ConfigExt {
    fn str_value(&self, key: &str) -> Option<&str>;
    fn f64_value(&self, key: &str) -> Option<f64>;
    fn u64_value(&self, key: &str) -> Option<u64>;
    fn bool_value(&self, key: &str) -> Option<bool>;
    fn object_value(&self, key: &str) -> Option<&Config>;

    /// Get a required string or fail the node with a configuration error.
    fn require_str(&self, key: &str) -> Result<&str, ExecutionError> {
        self.str_value(key).ok_or_else(|| {
            ExecutionError::configuration(format!("missing string config '{}'", key))
        })
    }

    fn str_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.str_value(key).unwrap_or(default)
    }
}

impl ConfigExt for Config {
    fn str_value(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    fn f64_value(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    fn u64_value(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_u64)
    }

    fn bool_value(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    fn object_value(&self, key: &str) -> Option<&Config> {
        self.get(key).and_then(Value::as_object)
    }
}

/// Resolve a dotted path (`a.b.0.c`, optionally prefixed with `$.`) inside a value.
///
/// `$` and the empty path resolve to the value itself. Numeric segments index
/// into arrays.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    let path = path
        .strip_prefix("$.")
        .or_else(|| path.strip_prefix('$'))
        .unwrap_or(path);
    if path.is_empty() {
        return Some(value);
    }

    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Name of a JSON value's type, as used in validation messages.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

/// Parse a literal written in an expression: JSON when it parses, a bare string otherwise.
pub fn parse_literal(raw: &str) -> Value {
    let raw = raw.trim();
    serde_json::from_str(raw).unwrap_or_else(|_| {
        let unquoted = raw
            .strip_prefix('\'')
            .and_then(|s| s.strip_suffix('\''))
            .unwrap_or(raw);
        Value::String(unquoted.to_string())
    })
}

/// Loose truthiness used by branch evaluation.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
