//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the global `tracing` subscriber (human or JSON format)
//! - Provide the `Logger` collaborator handed to handlers through `Ctx`
//! - Record every panic with a captured backtrace
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - JSON format for production, pretty format for development
//! - Log level configurable via config and environment (`RUST_LOG` wins)

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::fmt;
use std::sync::{Arc, Once};

use serde::Deserialize;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Error type for logger setup and teardown.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("invalid log level directive <{0}>")]
    Level(String),
}

/// One structured key/value pair attached to a log line.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub key: Cow<'static, str>,
    pub value: String,
}

/// Build a [`Field`].
pub fn field(key: impl Into<Cow<'static, str>>, value: impl fmt::Display) -> Field {
    Field {
        key: key.into(),
        value: value.to_string(),
    }
}

/// The logging collaborator.
pub trait Logger: Send + Sync {
    fn trace(&self, tag: &str, message: &str, fields: &[Field]);
    fn warning(&self, tag: &str, message: &str, fields: &[Field]);
    fn error(&self, tag: &str, message: &str, fields: &[Field]);
    /// A logger that appends `fields` to every line.
    fn with(&self, fields: Vec<Field>) -> Arc<dyn Logger>;
    fn close(&self) -> Result<(), LogError> {
        Ok(())
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopLogger;

impl Logger for NopLogger {
    fn trace(&self, _: &str, _: &str, _: &[Field]) {}
    fn warning(&self, _: &str, _: &str, _: &[Field]) {}
    fn error(&self, _: &str, _: &str, _: &[Field]) {}
    fn with(&self, _: Vec<Field>) -> Arc<dyn Logger> {
        Arc::new(NopLogger)
    }
}

/// Output format of the global subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Stdout,
    Json,
}

/// `[log.stdout]` / `[log.json]` settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `"info"` or `"spine=debug,hyper=warn"`.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Logger emitting through the global `tracing` subscriber.
#[derive(Debug, Clone, Default)]
pub struct TracingLogger {
    fields: Vec<Field>,
}

impl TracingLogger {
    /// Install the global subscriber and the panic hook, then return a logger.
    ///
    /// A subscriber installed earlier (by a test harness or an embedding
    /// binary) is left in place.
    pub fn init(format: LogFormat, config: &LogConfig) -> Result<Self, LogError> {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.level))
            .map_err(|_| LogError::Level(config.level.clone()))?;

        let registry = tracing_subscriber::registry().with(filter);
        let installed = match format {
            LogFormat::Stdout => registry.with(tracing_subscriber::fmt::layer()).try_init(),
            LogFormat::Json => registry
                .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
                .try_init(),
        };
        if let Err(e) = installed {
            tracing::debug!(error = %e, "Log subscriber already installed");
        }

        install_panic_hook();
        Ok(Self::default())
    }

    fn render(&self, fields: &[Field]) -> String {
        self.fields
            .iter()
            .chain(fields)
            .map(|f| format!("{}={}", f.key, f.value))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Logger for TracingLogger {
    fn trace(&self, tag: &str, message: &str, fields: &[Field]) {
        tracing::info!(tag, fields = %self.render(fields), "{message}");
    }

    fn warning(&self, tag: &str, message: &str, fields: &[Field]) {
        tracing::warn!(tag, fields = %self.render(fields), "{message}");
    }

    fn error(&self, tag: &str, message: &str, fields: &[Field]) {
        tracing::error!(tag, fields = %self.render(fields), "{message}");
    }

    fn with(&self, fields: Vec<Field>) -> Arc<dyn Logger> {
        let mut merged = self.fields.clone();
        merged.extend(fields);
        Arc::new(Self { fields: merged })
    }
}

static PANIC_HOOK: Once = Once::new();

/// Log every panic with its backtrace, then defer to the previous hook.
pub fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let location = info
                .location()
                .map(|l| format!("{}:{}", l.file(), l.line()))
                .unwrap_or_default();
            tracing::error!(
                tag = "panic",
                location = %location,
                panic = %crate::bg::panic_message(info.payload()),
                backtrace = %Backtrace::force_capture(),
                "Panic caught"
            );
            previous(info);
        }));
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_accumulates_fields() {
        let base = TracingLogger::default();
        let child = TracingLogger {
            fields: vec![field("service", "users")],
        };
        assert_eq!(base.render(&[field("k", 1)]), "k=1");
        assert_eq!(child.render(&[field("k", 1)]), "service=users k=1");
    }
}
