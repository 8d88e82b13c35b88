//! Configuration management for the SDS observer
//!
//! The effective configuration is built once at startup: defaults, then
//! command line flags, then the optional JSON config file overlaid key by key.
//! After validation it is shared read-only for the rest of the process.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConfigError, ConfigResult};

/// Longest accepted ON or OFF window: 30 days
pub const MAX_WINDOW_SECS: u64 = 30 * 24 * 60 * 60;

/// Main configuration structure for the observer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    /// Output directory for event JSON files
    pub output_dir: PathBuf,

    /// How long each collection window lasts, in seconds
    pub sampling_on: u64,

    /// Pause between collection windows, in seconds
    pub sampling_off: u64,

    /// Optional HTTP endpoint events are forwarded to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_endpoint: Option<String>,

    /// Verbose logging (one line per event)
    pub verbose: bool,

    /// Monitor process exec/exit
    pub monitor_processes: bool,

    /// Monitor syscalls
    pub monitor_syscalls: bool,

    /// Monitor TCP connections
    pub monitor_network: bool,

    /// Container runtime used for metadata enrichment ("docker", "containerd", ...)
    pub container_runtime: String,

    /// Capacity of the per-cycle event channel
    pub channel_capacity: usize,

    /// Maximum number of collection cycles running at once
    pub max_concurrent_cycles: usize,

    /// How long shutdown waits for in-flight cycles, in seconds
    pub shutdown_grace_secs: u64,

    /// Upper bound on how long an event source may take to stop, in seconds
    pub source_stop_timeout_secs: u64,

    /// Process table poll interval in milliseconds
    pub poll_interval_ms: u64,

    /// Concurrent forwarding requests
    pub forward_workers: usize,

    /// Events queued for forwarding before new ones are dropped
    pub forward_queue_capacity: usize,

    /// Per-request forwarding timeout, in seconds
    pub forward_timeout_secs: u64,

    /// Prometheus textfile written after every cycle
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_file: Option<PathBuf>,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("/var/log/sds-observer"),
            sampling_on: 60,
            sampling_off: 240,
            http_endpoint: None,
            verbose: false,
            monitor_processes: true,
            monitor_syscalls: true,
            monitor_network: true,
            container_runtime: "docker".to_string(),
            channel_capacity: 1000,
            max_concurrent_cycles: 1,
            shutdown_grace_secs: 5,
            source_stop_timeout_secs: 2,
            poll_interval_ms: 250,
            forward_workers: 4,
            forward_queue_capacity: 1024,
            forward_timeout_secs: 5,
            metrics_file: None,
        }
    }
}

/// Values supplied on the command line; `None` keeps the default
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub output_dir: Option<PathBuf>,
    pub sampling_on: Option<u64>,
    pub sampling_off: Option<u64>,
    pub http_endpoint: Option<String>,
    pub verbose: bool,
    pub metrics_file: Option<PathBuf>,
}

impl ObserverConfig {
    /// Defaults with the command line values applied on top
    pub fn seeded(overrides: &ConfigOverrides) -> Self {
        let mut config = Self::default();
        if let Some(dir) = &overrides.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(on) = overrides.sampling_on {
            config.sampling_on = on;
        }
        if let Some(off) = overrides.sampling_off {
            config.sampling_off = off;
        }
        if let Some(endpoint) = &overrides.http_endpoint {
            config.http_endpoint = Some(endpoint.clone());
        }
        if overrides.verbose {
            config.verbose = true;
        }
        if let Some(path) = &overrides.metrics_file {
            config.metrics_file = Some(path.clone());
        }
        config
    }

    /// Build the effective configuration: flag-seeded defaults, then the file
    pub fn load(config_path: Option<&Path>, overrides: &ConfigOverrides) -> ConfigResult<Self> {
        let seeded = Self::seeded(overrides);
        let config = match config_path {
            Some(path) => seeded.overlay_file(path)?,
            None => seeded,
        };

        let config = config.normalized();
        config.validate()?;
        Ok(config)
    }

    /// Overlay the keys present in a JSON config file onto this configuration
    pub fn overlay_file<P: AsRef<Path>>(self, path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        self.overlay_json(&content, path)
    }

    fn overlay_json(self, content: &str, path: &Path) -> ConfigResult<Self> {
        let parse_error = |source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        };

        let file: Value = serde_json::from_str(content).map_err(parse_error)?;
        let Value::Object(file) = file else {
            return Err(ConfigError::NotAnObject {
                path: path.to_path_buf(),
            });
        };

        let mut base = serde_json::to_value(&self).map_err(parse_error)?;
        if let Value::Object(base) = &mut base {
            for (key, value) in file {
                base.insert(key, value);
            }
        }

        serde_json::from_value(base).map_err(parse_error)
    }

    /// Collapse an empty endpoint to "no forwarding"
    fn normalized(mut self) -> Self {
        if self
            .http_endpoint
            .as_deref()
            .is_some_and(|endpoint| endpoint.trim().is_empty())
        {
            self.http_endpoint = None;
        }
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.output_dir.as_os_str().is_empty() {
            return Err(invalid("output_dir", ""));
        }

        if self.sampling_on == 0 || self.sampling_on > MAX_WINDOW_SECS {
            return Err(invalid("sampling_on", self.sampling_on));
        }

        if self.sampling_off > MAX_WINDOW_SECS {
            return Err(invalid("sampling_off", self.sampling_off));
        }

        if self.channel_capacity == 0 {
            return Err(invalid("channel_capacity", 0));
        }

        if self.max_concurrent_cycles == 0 {
            return Err(invalid("max_concurrent_cycles", 0));
        }

        if self.poll_interval_ms == 0 {
            return Err(invalid("poll_interval_ms", 0));
        }

        if let Some(endpoint) = &self.http_endpoint {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(invalid("http_endpoint", endpoint));
            }
            if self.forward_workers == 0 {
                return Err(invalid("forward_workers", 0));
            }
            if self.forward_queue_capacity == 0 {
                return Err(invalid("forward_queue_capacity", 0));
            }
        }

        Ok(())
    }

    pub fn on_duration(&self) -> Duration {
        Duration::from_secs(self.sampling_on)
    }

    /// Time between the starts of consecutive cycles
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.sampling_on.saturating_add(self.sampling_off))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn source_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.source_stop_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_secs(self.forward_timeout_secs)
    }
}

fn invalid(field: &str, value: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
}
