//! Job configuration: an immutable dotted-path → value tree.
//!
//! YAML parsing and option inheritance are handled by the surrounding
//! system; this module consumes an already-resolved JSON tree. A
//! [`JobConfig`] is created once per job (or per expanded variant),
//! persisted to the run's output directory, and read-only afterwards.

use serde_json::Value;
use std::fs;
use std::path::Path;

use crate::error::{Result, UnmaskingError};

/// Resolved job configuration.
///
/// Values are addressed by dotted paths, e.g. `job.experiment.repetitions`.
#[derive(Debug, Clone)]
pub struct JobConfig {
    root: Value,
}

impl JobConfig {
    /// Wrap an already-parsed configuration tree.
    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    /// Load a configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(Self {
            root: serde_json::from_str(&raw)?,
        })
    }

    /// The full configuration tree.
    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Look up a value by dotted path. Returns `None` if any path segment
    /// is missing.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut node = &self.root;
        for seg in path.split('.') {
            node = node.as_object()?.get(seg)?;
        }
        Some(node)
    }

    /// Look up a value by dotted path, failing fast if it is absent.
    pub fn require(&self, path: &str) -> Result<&Value> {
        self.get(path)
            .ok_or_else(|| UnmaskingError::Config(format!("missing option '{}'", path)))
    }

    /// Required string option.
    pub fn get_str(&self, path: &str) -> Result<&str> {
        self.require(path)?
            .as_str()
            .ok_or_else(|| UnmaskingError::Config(format!("option '{}' must be a string", path)))
    }

    /// Optional string option with a default.
    pub fn get_str_or<'a>(&'a self, path: &str, default: &'a str) -> Result<&'a str> {
        match self.get(path) {
            None => Ok(default),
            Some(v) => v.as_str().ok_or_else(|| {
                UnmaskingError::Config(format!("option '{}' must be a string", path))
            }),
        }
    }

    /// Required unsigned integer option.
    pub fn get_u64(&self, path: &str) -> Result<u64> {
        self.require(path)?
            .as_u64()
            .ok_or_else(|| UnmaskingError::Config(format!("option '{}' must be an integer", path)))
    }

    /// Optional unsigned integer option with a default.
    pub fn get_u64_or(&self, path: &str, default: u64) -> Result<u64> {
        match self.get(path) {
            None => Ok(default),
            Some(v) => v.as_u64().ok_or_else(|| {
                UnmaskingError::Config(format!("option '{}' must be an integer", path))
            }),
        }
    }

    /// Required floating-point option. Integers coerce.
    pub fn get_f64(&self, path: &str) -> Result<f64> {
        self.require(path)?
            .as_f64()
            .ok_or_else(|| UnmaskingError::Config(format!("option '{}' must be a number", path)))
    }

    /// Optional floating-point option with a default. Integers coerce.
    pub fn get_f64_or(&self, path: &str, default: f64) -> Result<f64> {
        match self.get(path) {
            None => Ok(default),
            Some(v) => v.as_f64().ok_or_else(|| {
                UnmaskingError::Config(format!("option '{}' must be a number", path))
            }),
        }
    }

    /// Required boolean option.
    pub fn get_bool(&self, path: &str) -> Result<bool> {
        self.require(path)?
            .as_bool()
            .ok_or_else(|| UnmaskingError::Config(format!("option '{}' must be a boolean", path)))
    }

    /// Optional boolean option with a default.
    pub fn get_bool_or(&self, path: &str, default: bool) -> Result<bool> {
        match self.get(path) {
            None => Ok(default),
            Some(v) => v.as_bool().ok_or_else(|| {
                UnmaskingError::Config(format!("option '{}' must be a boolean", path))
            }),
        }
    }

    /// Materialize a concrete variant configuration by substituting
    /// `$name` placeholders in string leaves of the tree.
    ///
    /// A leaf that consists of exactly one placeholder takes the expansion
    /// value's original JSON type; otherwise the value is stringified into
    /// the surrounding text. `variables` and `values` are paired
    /// positionally.
    pub fn expanded(&self, variables: &[String], values: &[Value]) -> Self {
        let mut root = self.root.clone();
        substitute(&mut root, variables, values);
        Self { root }
    }

    /// Persist a pretty-printed snapshot of the resolved configuration.
    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(&self.root)?;
        fs::write(path, raw)?;
        Ok(())
    }
}

fn substitute(node: &mut Value, variables: &[String], values: &[Value]) {
    match node {
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                substitute(v, variables, values);
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                substitute(v, variables, values);
            }
        }
        Value::String(s) => {
            let mut text = s.clone();
            let mut exact: Option<Value> = None;
            for (name, value) in variables.iter().zip(values) {
                let placeholder = format!("${}", name);
                if !text.contains(&placeholder) {
                    continue;
                }
                if text == placeholder {
                    // exact placeholder: keep the expansion value's type
                    exact = Some(value.clone());
                    break;
                }
                text = text.replace(&placeholder, &plain_string(value));
            }
            *node = match exact {
                Some(value) => value,
                None => Value::String(text),
            };
        }
        _ => {}
    }
}

/// Render a JSON value as bare text for in-string substitution
/// (strings without surrounding quotes).
fn plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> JobConfig {
        JobConfig::from_value(json!({
            "job": {
                "name": "test",
                "experiment": { "repetitions": 3 },
                "exec": {
                    "eliminate": "$k",
                    "label": "run-$k-of-$total"
                }
            }
        }))
    }

    #[test]
    fn test_dotted_path_lookup() {
        let cfg = sample();
        assert_eq!(cfg.get_str("job.name").unwrap(), "test");
        assert_eq!(cfg.get_u64("job.experiment.repetitions").unwrap(), 3);
        assert!(cfg.get("job.missing.deep").is_none());
    }

    #[test]
    fn test_missing_option_fails_fast() {
        let cfg = sample();
        let err = cfg.get_u64("job.experiment.folds").unwrap_err();
        assert!(matches!(err, UnmaskingError::Config(_)));
    }

    #[test]
    fn test_type_mismatch_is_config_error() {
        let cfg = sample();
        assert!(matches!(
            cfg.get_u64("job.name"),
            Err(UnmaskingError::Config(_))
        ));
    }

    #[test]
    fn test_exact_placeholder_keeps_value_type() {
        let cfg = sample().expanded(&["k".to_string()], &[json!(10)]);
        assert_eq!(cfg.get_u64("job.exec.eliminate").unwrap(), 10);
    }

    #[test]
    fn test_embedded_placeholder_is_stringified() {
        let cfg = sample().expanded(
            &["k".to_string(), "total".to_string()],
            &[json!(10), json!(4)],
        );
        assert_eq!(cfg.get_str("job.exec.label").unwrap(), "run-10-of-4");
    }

    #[test]
    fn test_save_and_reload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        let cfg = sample();
        cfg.save(&path).unwrap();
        let reloaded = JobConfig::from_file(&path).unwrap();
        assert_eq!(reloaded.root(), cfg.root());
    }
}
