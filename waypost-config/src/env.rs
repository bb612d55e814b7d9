// Environment variable loading

use crate::{ConfigError, Result};
use serde_json::{Map, Value};
use std::env;

/// Separates nesting levels in variable names: `REGISTRY__LEASE_TTL`
pub const NESTING_SEPARATOR: &str = "__";

/// Environment variable loader
///
/// `WAYPOST_REGISTRY__LEASE_TTL=30` with prefix `WAYPOST` becomes
/// `{"registry": {"lease_ttl": 30}}`. Values that look like booleans or
/// numbers are typed accordingly, everything else stays a string.
pub struct EnvLoader {
    prefix: Option<String>,
}

impl EnvLoader {
    /// Create a new environment loader
    pub fn new(prefix: Option<String>) -> Self {
        Self {
            prefix: prefix.map(|p| p.trim_end_matches('_').to_string()),
        }
    }

    /// Load all matching environment variables as a nested object
    pub fn load(&self) -> Result<Value> {
        Ok(self.load_from(env::vars()))
    }

    /// Same as [`load`](Self::load) over an explicit set of variables
    pub fn load_from<I, K, V>(&self, vars: I) -> Value
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut root = Map::new();

        for (key, value) in vars {
            let Some(key) = self.strip(key.as_ref()) else {
                continue;
            };

            let path = key_path(key);
            if !path.is_empty() {
                insert_path(&mut root, &path, infer(value.as_ref()));
            }
        }

        Value::Object(root)
    }

    fn strip<'a>(&self, key: &'a str) -> Option<&'a str> {
        match &self.prefix {
            None => Some(key),
            Some(prefix) => key
                .strip_prefix(prefix.as_str())?
                .strip_prefix('_')
                .filter(|rest| !rest.is_empty()),
        }
    }

    /// Load a specific environment variable
    pub fn load_var(&self, key: &str) -> Result<String> {
        let full_key = if let Some(ref prefix) = self.prefix {
            format!("{}_{}", prefix, key.to_uppercase())
        } else {
            key.to_uppercase()
        };

        env::var(&full_key).map_err(ConfigError::EnvError)
    }

    /// Load with default value
    pub fn load_var_or(&self, key: &str, default: &str) -> String {
        self.load_var(key).unwrap_or_else(|_| default.to_string())
    }
}

impl Default for EnvLoader {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Lowercased path segments of a variable name
pub fn key_path(key: &str) -> Vec<String> {
    key.split(NESTING_SEPARATOR)
        .filter(|segment| !segment.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Type a raw string value
pub fn infer(value: &str) -> Value {
    let trimmed = value.trim();

    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }

    // Keep zero-padded values such as "007" verbatim
    let padded = trimmed.len() > 1 && trimmed.starts_with('0') && !trimmed.starts_with("0.");
    if !padded {
        if let Ok(n) = trimmed.parse::<i64>() {
            return Value::from(n);
        }
        if trimmed.contains('.')
            && let Ok(f) = trimmed.parse::<f64>()
            && f.is_finite()
        {
            return Value::from(f);
        }
    }

    Value::String(value.to_string())
}

/// Set `value` at `path`, creating (or replacing non-object) parents
pub(crate) fn insert_path(root: &mut Map<String, Value>, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };

    let mut node = root;
    for segment in parents {
        let child = node
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !child.is_object() {
            *child = Value::Object(Map::new());
        }
        node = match child {
            Value::Object(map) => map,
            _ => return,
        };
    }

    node.insert(last.clone(), value);
}
