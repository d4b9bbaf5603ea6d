use crate::{Config, ValidationIssue};

/// Fixed set of configuration keys accepted by one primitive subtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigSchema {
    pub required: &'static [&'static str],
    pub optional: &'static [&'static str],
}

/// Keys every node may carry regardless of subtype.
pub const COMMON_KEYS: &[&str] = &["label", "description", "path"];

impl ConfigSchema {
    pub const fn new(required: &'static [&'static str], optional: &'static [&'static str]) -> Self {
        Self { required, optional }
    }

    pub fn allows(&self, key: &str) -> bool {
        self.required.contains(&key) || self.optional.contains(&key) || COMMON_KEYS.contains(&key)
    }

    /// Report every missing required key and every unknown key.
    pub fn check(&self, config: &Config) -> Vec<ValidationIssue> {
        let missing = self
            .required
            .iter()
            .filter(|key| !config.contains_key(**key))
            .map(|key| ValidationIssue::for_key(*key, "missing required key"));

        let mut unknown: Vec<&String> = config.keys().filter(|key| !self.allows(key)).collect();
        unknown.sort();
        let unknown = unknown
            .into_iter()
            .map(|key| ValidationIssue::for_key(key.clone(), "unknown key"));

        missing.chain(unknown).collect()
    }
}

/// Subtype name paired with its schema; executors keep a static table of these.
pub type SubtypeSchema = (&'static str, ConfigSchema);

/// Find a subtype's schema in an executor's table.
pub fn find_schema(table: &[SubtypeSchema], subtype: &str) -> Option<ConfigSchema> {
    table
        .iter()
        .find(|(name, _)| *name == subtype)
        .map(|(_, schema)| *schema)
}
