//! Configuration loading from disk.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::tree::ConfigTree;
use crate::config::validation::ValidationError;

/// Environment variable naming the configuration source.
pub const CONFIG_URI: &str = "CONFIG_URI";

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config <{path}>: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),
    #[error("invalid config value: {0}")]
    Unmarshal(#[source] toml::de::Error),
    #[error("config validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load the tree named by `CONFIG_URI`. An unset variable yields an empty
/// tree, which selects the no-op adapter for every subsystem.
pub fn load_from_env() -> Result<ConfigTree, ConfigError> {
    match std::env::var(CONFIG_URI) {
        Ok(uri) if !uri.trim().is_empty() => load_uri(uri.trim()),
        _ => Ok(ConfigTree::empty()),
    }
}

/// Load from a `file://` URI or a plain path.
pub fn load_uri(uri: &str) -> Result<ConfigTree, ConfigError> {
    load_path(Path::new(uri.strip_prefix("file://").unwrap_or(uri)))
}

/// Load and parse a TOML file.
pub fn load_path(path: &Path) -> Result<ConfigTree, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    ConfigTree::parse(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_uri_prefix_is_optional() {
        let path = std::env::temp_dir().join(format!("spine-loader-{}.toml", std::process::id()));
        fs::write(&path, "node = \"disk\"\n").unwrap();

        let plain = load_uri(path.to_str().unwrap()).unwrap();
        let uri = load_uri(&format!("file://{}", path.display())).unwrap();
        assert_eq!(plain, uri);
        assert_eq!(plain.get("node").as_value().as_str(), Some("disk"));

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = load_uri("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
