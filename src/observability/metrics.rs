//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define the `Stats` sink handed to every subsystem through `Ctx`
//! - Expose a Prometheus-compatible scrape endpoint
//! - Tag every sample with process identity (service, node, version)
//!
//! # Metrics
//! - `http.request` (counter): requests by method, path, status
//! - `http.request.duration` (histogram): latency in seconds
//! - `http.inflight` (gauge): requests currently being served
//! - `pubsub.publish` / `pubsub.deliver` (counter): by channel
//! - `app.heartbeat` (gauge): 1 while the process is up
//!
//! # Design Decisions
//! - Low-overhead metric updates through the `metrics` facade
//! - Tags are an ordered map so identical tag sets render identically
//! - Dots in names are rewritten by the Prometheus exporter

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use metrics::Label;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Deserialize;

/// Sample tags.
pub type Tags = BTreeMap<String, String>;

/// Build a [`Tags`] map from literal pairs.
pub fn tags<const N: usize>(pairs: [(&str, &str); N]) -> Tags {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// The metrics sink collaborator.
pub trait Stats: Send + Sync {
    fn count(&self, key: &str, n: u64, tags: &Tags);
    fn gauge(&self, key: &str, value: f64, tags: &Tags);
    fn histogram(&self, key: &str, value: f64, tags: &Tags);
    /// A sink that adds `tags` to every sample.
    fn with(&self, tags: Tags) -> Arc<dyn Stats>;

    fn inc(&self, key: &str, tags: &Tags) {
        self.count(key, 1, tags);
    }

    fn timing(&self, key: &str, elapsed: Duration, tags: &Tags) {
        self.histogram(key, elapsed.as_secs_f64(), tags);
    }
}

/// Discards every sample.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopStats;

impl Stats for NopStats {
    fn count(&self, _: &str, _: u64, _: &Tags) {}
    fn gauge(&self, _: &str, _: f64, _: &Tags) {}
    fn histogram(&self, _: &str, _: f64, _: &Tags) {}
    fn with(&self, _: Tags) -> Arc<dyn Stats> {
        Arc::new(NopStats)
    }
}

/// `[stats.prometheus]` settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrometheusConfig {
    /// Scrape listener address.
    pub address: String,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:9100".to_string(),
        }
    }
}

/// Sink recording through the global `metrics` recorder.
#[derive(Debug, Clone, Default)]
pub struct MetricsStats {
    base: Tags,
}

impl MetricsStats {
    /// Install the Prometheus exporter and return a sink feeding it.
    pub fn prometheus(config: &PrometheusConfig) -> Result<Self, crate::BoxError> {
        let addr: SocketAddr = config.address.parse()?;
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        tracing::info!(address = %addr, "Prometheus exporter listening");
        Ok(Self::default())
    }

    fn labels(&self, tags: &Tags) -> Vec<Label> {
        merge(&self.base, tags)
            .into_iter()
            .map(|(k, v)| Label::new(k, v))
            .collect()
    }
}

impl Stats for MetricsStats {
    fn count(&self, key: &str, n: u64, tags: &Tags) {
        metrics::counter!(key.to_string(), self.labels(tags)).increment(n);
    }

    fn gauge(&self, key: &str, value: f64, tags: &Tags) {
        metrics::gauge!(key.to_string(), self.labels(tags)).set(value);
    }

    fn histogram(&self, key: &str, value: f64, tags: &Tags) {
        metrics::histogram!(key.to_string(), self.labels(tags)).record(value);
    }

    fn with(&self, tags: Tags) -> Arc<dyn Stats> {
        Arc::new(Self {
            base: merge(&self.base, &tags),
        })
    }
}

/// Sink writing each sample as a debug-level log event.
#[derive(Debug, Clone, Default)]
pub struct LogStats {
    base: Tags,
}

impl LogStats {
    fn render(&self, tags: &Tags) -> String {
        merge(&self.base, tags)
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl Stats for LogStats {
    fn count(&self, key: &str, n: u64, tags: &Tags) {
        tracing::debug!(kind = "count", key, value = n, tags = %self.render(tags), "stat");
    }

    fn gauge(&self, key: &str, value: f64, tags: &Tags) {
        tracing::debug!(kind = "gauge", key, value, tags = %self.render(tags), "stat");
    }

    fn histogram(&self, key: &str, value: f64, tags: &Tags) {
        tracing::debug!(kind = "histogram", key, value, tags = %self.render(tags), "stat");
    }

    fn with(&self, tags: Tags) -> Arc<dyn Stats> {
        Arc::new(Self {
            base: merge(&self.base, &tags),
        })
    }
}

/// `extra` wins over `base` on key collisions.
fn merge(base: &Tags, extra: &Tags) -> Tags {
    let mut merged = base.clone();
    merged.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_layers_tags() {
        let stats = LogStats {
            base: tags([("service", "users"), ("node", "a")]),
        };
        assert_eq!(
            stats.render(&tags([("node", "b"), ("status", "200")])),
            "node=b,service=users,status=200"
        );
    }

    #[test]
    fn labels_include_base_tags() {
        let stats = MetricsStats {
            base: tags([("service", "users")]),
        };
        let labels = stats.labels(&tags([("path", "/x")]));
        let keys: Vec<&str> = labels.iter().map(|l| l.key()).collect();
        assert_eq!(keys, vec!["path", "service"]);
    }
}
