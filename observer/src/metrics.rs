//! Pipeline metrics for the SDS observer
//!
//! Counters live in a private prometheus registry. They can be rendered in
//! the text exposition format and written to a textfile for node exporters.

use std::fs;
use std::path::Path;

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

use crate::error::Result;

/// Metrics collector for the observer pipeline
pub struct ObserverMetrics {
    registry: Registry,

    pub cycles_started: IntCounter,
    pub cycles_completed: IntCounter,
    pub cycles_failed: IntCounter,
    pub active_cycles: IntGauge,

    pub events_written: IntCounter,
    pub encode_failures: IntCounter,

    pub forward_enqueued: IntCounter,
    pub forward_dropped: IntCounter,
    pub forward_failed: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help).namespace("sds_observer"))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl ObserverMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let active_cycles = IntGauge::with_opts(
            Opts::new("active_cycles", "Collection cycles currently running")
                .namespace("sds_observer"),
        )?;
        registry.register(Box::new(active_cycles.clone()))?;

        Ok(Self {
            cycles_started: counter(
                &registry,
                "cycles_started_total",
                "Collection cycles started",
            )?,
            cycles_completed: counter(
                &registry,
                "cycles_completed_total",
                "Collection cycles that closed their file",
            )?,
            cycles_failed: counter(
                &registry,
                "cycles_failed_total",
                "Collection cycles abandoned on error",
            )?,
            active_cycles,
            events_written: counter(
                &registry,
                "events_written_total",
                "Events written to cycle files",
            )?,
            encode_failures: counter(
                &registry,
                "encode_failures_total",
                "Events skipped because they failed to encode",
            )?,
            forward_enqueued: counter(
                &registry,
                "forward_enqueued_total",
                "Events queued for forwarding",
            )?,
            forward_dropped: counter(
                &registry,
                "forward_dropped_total",
                "Events dropped because the forwarding queue was full",
            )?,
            forward_failed: counter(
                &registry,
                "forward_failed_total",
                "Forwarding requests that failed",
            )?,
            registry,
        })
    }

    /// Render all metrics in the prometheus text format
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Atomically replace `path` with the current metrics
    pub fn write_textfile(&self, path: &Path) -> Result<()> {
        let rendered = self.render()?;
        let tmp = path.with_extension("prom.tmp");
        fs::write(&tmp, rendered)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_render_contains_counters() {
        let metrics = ObserverMetrics::new().unwrap();
        metrics.events_written.inc_by(3);
        metrics.active_cycles.set(1);

        let text = metrics.render().unwrap();
        assert!(text.contains("sds_observer_events_written_total 3"));
        assert!(text.contains("sds_observer_active_cycles 1"));
    }

    #[test]
    fn test_textfile_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("observer.prom");
        let metrics = ObserverMetrics::new().unwrap();

        metrics.write_textfile(&path).unwrap();
        metrics.cycles_completed.inc();
        metrics.write_textfile(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("sds_observer_cycles_completed_total 1"));
        assert!(!dir.path().join("observer.prom.tmp").exists());
    }
}
