//! Layered configuration tree
//!
//! A [`ConfigTree`] is an order-preserving, string-keyed mapping whose values
//! are either scalars or nested trees. Sources are merged on top of each other
//! (defaults, file, environment, explicit overrides):
//!
//! ```text
//! defaults  ->  <app>.cfg  ->  DEVICE_CLOUD__*  ->  overrides
//! ```
//!
//! Textual `"true"`/`"false"` values are coerced to booleans on merge so that
//! environment strings compare equal to boolean defaults. `null` never
//! installs or overwrites a key.

use figment::providers::{Env, Format, Json};
use figment::Figment;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

/// Default prefix for environment variable overrides
pub const ENV_PREFIX: &str = "DEVICE_CLOUD__";

/// Separator between nesting levels in environment variable names
pub const ENV_SEPARATOR: &str = "__";

/// Errors that can occur while building a configuration tree
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config can only be merged with a mapping, got {0}")]
    InvalidSource(&'static str),

    #[error("Failed to load configuration: {0}")]
    Figment(Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

/// A value stored in a [`ConfigTree`]
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    /// Any non-mapping, non-null JSON value
    Scalar(Value),
    /// A nested tree
    Tree(ConfigTree),
}

impl ConfigValue {
    pub fn as_tree(&self) -> Option<&ConfigTree> {
        match self {
            ConfigValue::Tree(tree) => Some(tree),
            ConfigValue::Scalar(_) => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            ConfigValue::Scalar(value) => Some(value),
            ConfigValue::Tree(_) => None,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            ConfigValue::Scalar(value) => value.clone(),
            ConfigValue::Tree(tree) => tree.to_value(),
        }
    }
}

/// Order-preserving configuration mapping with merge-with-override semantics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigTree {
    entries: IndexMap<String, ConfigValue>,
}

fn empty_tree() -> &'static ConfigTree {
    static EMPTY: OnceLock<ConfigTree> = OnceLock::new();
    EMPTY.get_or_init(ConfigTree::new)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn normalize(value: &Value) -> Value {
    match value {
        Value::String(s) if s.eq_ignore_ascii_case("true") => Value::Bool(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Value::Bool(false),
        other => other.clone(),
    }
}

impl ConfigTree {
    /// Create an empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from a single mapping-shaped source
    pub fn from_value(source: &Value) -> Result<Self, ConfigError> {
        let mut tree = Self::new();
        tree.merge(source, true)?;
        Ok(tree)
    }

    /// Merge a mapping-shaped source into this tree
    ///
    /// Nested mappings merge recursively. With `overwrite` set, existing
    /// values are replaced, including a scalar being replaced by a tree or a
    /// tree by a scalar. Without it, only absent keys are filled in.
    pub fn merge(&mut self, source: &Value, overwrite: bool) -> Result<(), ConfigError> {
        match source {
            Value::Object(map) => {
                self.merge_map(map, overwrite);
                Ok(())
            }
            other => Err(ConfigError::InvalidSource(kind_of(other))),
        }
    }

    /// Merge another tree into this one with the same semantics as [`merge`](Self::merge)
    pub fn merge_tree(&mut self, other: &ConfigTree, overwrite: bool) {
        for (key, value) in &other.entries {
            match value {
                ConfigValue::Tree(nested) => match self.entries.get_mut(key) {
                    Some(ConfigValue::Tree(tree)) => tree.merge_tree(nested, overwrite),
                    Some(ConfigValue::Scalar(_)) if !overwrite => {}
                    _ => {
                        let mut tree = ConfigTree::new();
                        tree.merge_tree(nested, overwrite);
                        self.entries.insert(key.clone(), ConfigValue::Tree(tree));
                    }
                },
                ConfigValue::Scalar(scalar) => {
                    if overwrite || !self.entries.contains_key(key) {
                        self.entries
                            .insert(key.clone(), ConfigValue::Scalar(scalar.clone()));
                    }
                }
            }
        }
    }

    fn merge_map(&mut self, map: &Map<String, Value>, overwrite: bool) {
        for (key, value) in map {
            match value {
                Value::Object(nested) => match self.entries.get_mut(key) {
                    Some(ConfigValue::Tree(tree)) => tree.merge_map(nested, overwrite),
                    Some(ConfigValue::Scalar(_)) if !overwrite => {}
                    _ => {
                        let mut tree = ConfigTree::new();
                        tree.merge_map(nested, overwrite);
                        self.entries.insert(key.clone(), ConfigValue::Tree(tree));
                    }
                },
                Value::Null => {}
                scalar => {
                    if overwrite || !self.entries.contains_key(key) {
                        self.entries
                            .insert(key.clone(), ConfigValue::Scalar(normalize(scalar)));
                    }
                }
            }
        }
    }

    /// Look up a direct child
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.entries.get(key)
    }

    /// Look up a dotted path such as `cloud.host`
    pub fn lookup(&self, path: &str) -> Option<&ConfigValue> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.entries.get(first)?;
        for part in parts {
            current = current.as_tree()?.entries.get(part)?;
        }
        Some(current)
    }

    /// Nested tree at `key`, or an empty tree when absent or not a tree
    pub fn subtree(&self, key: &str) -> &ConfigTree {
        self.lookup(key)
            .and_then(ConfigValue::as_tree)
            .unwrap_or_else(|| empty_tree())
    }

    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.lookup(path)?.as_scalar()?.as_bool()
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.lookup(path)?.as_scalar()?.as_str()
    }

    /// Integer at `path`; numeric strings (as set from the environment) are parsed
    pub fn get_i64(&self, path: &str) -> Option<i64> {
        match self.lookup(path)?.as_scalar()? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_u64(&self, path: &str) -> Option<u64> {
        self.get_i64(path).and_then(|v| u64::try_from(v).ok())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Convert to a JSON value; object keys come out sorted
    pub fn to_value(&self) -> Value {
        let sorted: BTreeMap<&String, Value> = self
            .entries
            .iter()
            .map(|(k, v)| (k, v.to_value()))
            .collect();
        Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
    }
}

/// Canonical diagnostic form: indented JSON with keys sorted at every level
impl fmt::Display for ConfigTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = serde_json::to_string_pretty(&self.to_value()).map_err(|_| fmt::Error)?;
        f.write_str(&rendered)
    }
}

/// Builds a [`ConfigTree`] from layered sources
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    defaults: Value,
    file: Option<PathBuf>,
    env_prefix: String,
    overrides: Vec<Value>,
}

impl ConfigLoader {
    /// Start from a set of default values
    pub fn new(defaults: Value) -> Self {
        Self {
            defaults,
            file: None,
            env_prefix: ENV_PREFIX.to_string(),
            overrides: Vec::new(),
        }
    }

    /// JSON config file layered over the defaults; skipped if missing
    pub fn file(mut self, path: impl AsRef<Path>) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Explicit override layer, applied after the environment
    pub fn override_with(mut self, values: Value) -> Self {
        self.overrides.push(values);
        self
    }

    /// Load every layer; later layers override earlier ones
    pub fn load(&self) -> Result<ConfigTree, ConfigError> {
        let mut tree = ConfigTree::new();
        tree.merge(&self.defaults, true)?;

        if let Some(path) = &self.file {
            let file_values: Value = Figment::from(Json::file_exact(path)).extract()?;
            tree.merge(&file_values, true)?;
        }

        let env_values: Value =
            Figment::from(Env::prefixed(&self.env_prefix).split(ENV_SEPARATOR)).extract()?;
        tree.merge(&env_values, true)?;

        for layer in &self.overrides {
            tree.merge(layer, true)?;
        }

        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_rejects_non_mapping() {
        let mut tree = ConfigTree::new();
        let result = tree.merge(&json!([1, 2, 3]), true);
        assert!(matches!(result, Err(ConfigError::InvalidSource("array"))));

        let result = tree.merge(&json!("text"), true);
        assert!(matches!(result, Err(ConfigError::InvalidSource("string"))));
    }

    #[test]
    fn test_merge_overwrite_semantics() {
        let mut tree = ConfigTree::from_value(&json!({"a": {"b": 1}})).unwrap();
        tree.merge(&json!({"a": {"b": 2, "c": 3}}), true).unwrap();
        assert_eq!(tree.to_value(), json!({"a": {"b": 2, "c": 3}}));

        let mut tree = ConfigTree::from_value(&json!({"a": {"b": 1}})).unwrap();
        tree.merge(&json!({"a": {"b": 2, "c": 3}}), false).unwrap();
        assert_eq!(tree.to_value(), json!({"a": {"b": 1, "c": 3}}));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let source = json!({"flag": "TRUE", "n": 4, "nested": {"x": "y", "deep": {"z": null}}});

        let mut once = ConfigTree::new();
        once.merge(&source, true).unwrap();

        let mut twice = ConfigTree::new();
        twice.merge(&source, true).unwrap();
        twice.merge(&source, true).unwrap();

        assert_eq!(once, twice);
    }

    #[test]
    fn test_boolean_coercion() {
        let mut tree = ConfigTree::new();
        tree.merge(&json!({"flag": "TRUE", "other": "False", "name": "truth"}), true)
            .unwrap();

        assert_eq!(tree.get_bool("flag"), Some(true));
        assert_eq!(tree.get_bool("other"), Some(false));
        assert_eq!(tree.get_str("name"), Some("truth"));
    }

    #[test]
    fn test_null_never_installs() {
        let mut tree = ConfigTree::from_value(&json!({"flag": true})).unwrap();
        tree.merge(&json!({"flag": null, "absent": null}), true).unwrap();

        assert_eq!(tree.get_bool("flag"), Some(true));
        assert!(!tree.contains_key("absent"));
    }

    #[test]
    fn test_conflicting_types_last_writer_wins() {
        let mut tree = ConfigTree::from_value(&json!({"a": 1, "b": {"c": 2}})).unwrap();
        tree.merge(&json!({"a": {"x": 1}, "b": 5}), true).unwrap();
        assert_eq!(tree.to_value(), json!({"a": {"x": 1}, "b": 5}));

        let mut tree = ConfigTree::from_value(&json!({"a": 1, "b": {"c": 2}})).unwrap();
        tree.merge(&json!({"a": {"x": 1}, "b": 5}), false).unwrap();
        assert_eq!(tree.to_value(), json!({"a": 1, "b": {"c": 2}}));
    }

    #[test]
    fn test_absent_keys_read_as_empty() {
        let tree = ConfigTree::from_value(&json!({"cloud": {"host": "example.com"}})).unwrap();

        assert_eq!(tree.get_str("cloud.host"), Some("example.com"));
        assert!(tree.lookup("cloud.port").is_none());
        assert!(tree.lookup("missing.deeply.nested").is_none());
        assert!(tree.subtree("missing").subtree("deeper").is_empty());
        assert_eq!(tree.subtree("cloud").get_str("host"), Some("example.com"));
    }

    #[test]
    fn test_display_sorts_keys() {
        let tree = ConfigTree::from_value(&json!({"b": 1, "a": {"z": 1, "y": 2}})).unwrap();
        let expected = "{\n  \"a\": {\n    \"y\": 2,\n    \"z\": 1\n  },\n  \"b\": 1\n}";
        assert_eq!(tree.to_string(), expected);
    }

    #[test]
    fn test_keys_keep_insertion_order() {
        let mut tree = ConfigTree::new();
        tree.merge(&json!({"zeta": 1}), true).unwrap();
        tree.merge(&json!({"alpha": 1}), true).unwrap();
        tree.merge(&json!({"zeta": 2}), true).unwrap();
        assert_eq!(tree.keys().collect::<Vec<_>>(), vec!["zeta", "alpha"]);
    }

    #[test]
    fn test_multi_key_source_keeps_order() {
        let source: Value =
            serde_json::from_str(r#"{"zeta": 1, "alpha": 2, "mid": {"y": 1, "b": 2}}"#).unwrap();
        let tree = ConfigTree::from_value(&source).unwrap();

        assert_eq!(tree.keys().collect::<Vec<_>>(), vec!["zeta", "alpha", "mid"]);
        assert_eq!(tree.subtree("mid").keys().collect::<Vec<_>>(), vec!["y", "b"]);
    }

    #[test]
    fn test_merge_tree_keeps_order() {
        let mut tree = ConfigTree::from_value(&json!({"zeta": 1, "mid": {"y": 1}})).unwrap();
        let other: Value =
            serde_json::from_str(r#"{"omega": "TRUE", "mid": {"b": 2, "a": 3}, "alpha": 4}"#)
                .unwrap();
        tree.merge_tree(&ConfigTree::from_value(&other).unwrap(), true);

        assert_eq!(
            tree.keys().collect::<Vec<_>>(),
            vec!["zeta", "mid", "omega", "alpha"]
        );
        assert_eq!(tree.subtree("mid").keys().collect::<Vec<_>>(), vec!["y", "b", "a"]);
        assert_eq!(tree.get_bool("omega"), Some(true));
    }

    #[test]
    fn test_merge_tree_without_overwrite_fills_gaps() {
        let mut tree = ConfigTree::from_value(&json!({"a": 1, "n": {"x": 1}})).unwrap();
        let other = ConfigTree::from_value(&json!({"a": 2, "n": {"x": 2, "y": 3}})).unwrap();
        tree.merge_tree(&other, false);

        assert_eq!(tree.to_value(), json!({"a": 1, "n": {"x": 1, "y": 3}}));
    }

    #[test]
    fn test_loader_layers_env_over_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("DEVICE_CLOUD__CLOUD__HOST", "env.example");
            jail.set_env("DEVICE_CLOUD__VALIDATE_CLOUD_CERT", "false");
            jail.set_env("DEVICE_CLOUD__CLOUD__PORT", "1883");
            jail.set_env("UNRELATED", "ignored");

            let tree = ConfigLoader::new(json!({
                "validate_cloud_cert": true,
                "cloud": {"host": "default.example", "port": 8883}
            }))
            .override_with(json!({"log_level": "DEBUG"}))
            .load()
            .unwrap();

            assert_eq!(tree.get_str("cloud.host"), Some("env.example"));
            assert_eq!(tree.get_bool("validate_cloud_cert"), Some(false));
            assert_eq!(tree.get_i64("cloud.port"), Some(1883));
            assert_eq!(tree.get_str("log_level"), Some("DEBUG"));
            assert!(!tree.contains_key("unrelated"));
            Ok(())
        });
    }

    #[test]
    fn test_loader_custom_env_prefix() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("AGENT__LOOP_TIME", "5");
            jail.set_env("DEVICE_CLOUD__LOOP_TIME", "9");

            let tree = ConfigLoader::new(json!({"loop_time": 1}))
                .env_prefix("AGENT__")
                .load()
                .unwrap();

            assert_eq!(tree.get_u64("loop_time"), Some(5));
            Ok(())
        });
    }

    #[test]
    fn test_loader_missing_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let tree = ConfigLoader::new(json!({"a": 1}))
            .file(dir.path().join("device-cloud.cfg"))
            .load()
            .unwrap();
        assert_eq!(tree.get_i64("a"), Some(1));
    }

    #[test]
    fn test_loader_reads_file_layer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device-cloud.cfg");
        std::fs::write(&path, r#"{"a": 2, "nested": {"b": "yes", "flag": "True"}}"#).unwrap();

        let tree = ConfigLoader::new(json!({"a": 1, "keep": "me"}))
            .file(&path)
            .load()
            .unwrap();

        assert_eq!(tree.get_i64("a"), Some(2));
        assert_eq!(tree.get_str("keep"), Some("me"));
        assert_eq!(tree.get_str("nested.b"), Some("yes"));
        assert_eq!(tree.get_bool("nested.flag"), Some(true));
    }

    #[test]
    fn test_loader_invalid_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device-cloud.cfg");
        std::fs::write(&path, "{not json").unwrap();

        let result = ConfigLoader::new(json!({})).file(&path).load();
        assert!(matches!(result, Err(ConfigError::Figment(_))));
    }
}
