//! Hierarchical configuration tree.
//!
//! A thin wrapper over a TOML table. Subsystems read their own subtree and
//! the first child key of that subtree names the adapter to build.

use serde::de::DeserializeOwned;
use toml::{Table, Value};

use super::loader::ConfigError;

/// An immutable configuration subtree.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigTree {
    value: Value,
}

impl Default for ConfigTree {
    fn default() -> Self {
        Self::empty()
    }
}

impl ConfigTree {
    /// A tree with no keys.
    pub fn empty() -> Self {
        Self {
            value: Value::Table(Table::new()),
        }
    }

    /// Parse TOML source, expanding `$NAME` string values from the environment.
    pub fn parse(source: &str) -> Result<Self, ConfigError> {
        let table: Table = toml::from_str(source).map_err(ConfigError::Parse)?;
        Ok(Self::from_value(expand_env(Value::Table(table))))
    }

    pub fn from_value(value: Value) -> Self {
        Self { value }
    }

    pub fn as_value(&self) -> &Value {
        &self.value
    }

    /// Subtree at a dotted path such as `net.pubsub`. Missing paths yield
    /// an empty tree.
    pub fn get(&self, path: &str) -> ConfigTree {
        let mut current = &self.value;
        for part in path.split('.').filter(|p| !p.is_empty()) {
            match current.get(part) {
                Some(next) => current = next,
                None => return Self::empty(),
            }
        }
        Self::from_value(current.clone())
    }

    /// Child keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        match &self.value {
            Value::Table(t) => {
                let mut keys: Vec<String> = t.keys().cloned().collect();
                keys.sort();
                keys
            }
            _ => Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match &self.value {
            Value::Table(t) => t.is_empty(),
            Value::String(s) => s.is_empty(),
            _ => false,
        }
    }

    /// Adapter selection: the first child key and its subtree.
    ///
    /// A bare string (`log = "stdout"`) names an adapter with no settings.
    /// An empty tree selects nothing.
    pub fn adapter(&self) -> Option<(String, ConfigTree)> {
        match &self.value {
            Value::String(name) if !name.is_empty() => Some((name.clone(), Self::empty())),
            Value::Table(_) => {
                let name = self.keys().into_iter().next()?;
                let sub = self.get(&name);
                Some((name, sub))
            }
            _ => None,
        }
    }

    /// Deserialize this subtree.
    pub fn unmarshal<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        self.value.clone().try_into().map_err(ConfigError::Unmarshal)
    }
}

/// Replace string values of the form `$NAME` with the environment variable
/// `NAME` (empty when unset). A lone `$` is kept verbatim.
fn expand_env(value: Value) -> Value {
    match value {
        Value::String(s) => match s.strip_prefix('$') {
            Some(name) if !name.is_empty() => Value::String(std::env::var(name).unwrap_or_default()),
            _ => Value::String(s),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(expand_env).collect()),
        Value::Table(table) => {
            Value::Table(table.into_iter().map(|(k, v)| (k, expand_env(v))).collect())
        }
        other => other,
    }
}
