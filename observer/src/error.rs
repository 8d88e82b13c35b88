//! Error handling for the SDS observer
//!
//! Errors are split by the component that raises them. Only configuration,
//! output directory and event source construction failures are fatal; every
//! other error stays local to the collection cycle that hit it.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// The main error type for the observer
#[derive(Error, Debug)]
pub enum ObserverError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Event source errors
    #[error("Event source error: {0}")]
    Source(#[from] SourceError),

    /// Output file errors
    #[error("Writer error: {0}")]
    Writer(#[from] WriterError),

    /// Forwarding errors
    #[error("Forwarding error: {0}")]
    Forward(#[from] ForwardError),

    /// Metrics errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Output directory could not be prepared
    #[error("Failed to create output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Config file {path} must contain a JSON object")]
    NotAnObject { path: PathBuf },

    #[error("Invalid configuration value: {field} = {value}")]
    InvalidValue { field: String, value: String },
}

/// Event source errors
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("No monitor enabled that source {source_name} can serve")]
    NoMonitors { source_name: String },

    #[error("Event source {source_name} did not stop within {timeout_secs}s")]
    StopTimeout { source_name: String, timeout_secs: u64 },

    #[error("Event source {source_name} session failed: {reason}")]
    Session { source_name: String, reason: String },
}

/// Output file errors
#[derive(Error, Debug)]
pub enum WriterError {
    #[error("Failed to create output file {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to write to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Forwarding errors
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("Invalid forwarding endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Request to {endpoint} failed: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ObserverError>;

/// A specialized result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// A specialized result type for event source operations
pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// A specialized result type for writer operations
pub type WriterResult<T> = std::result::Result<T, WriterError>;

/// A specialized result type for forwarding operations
pub type ForwardResult<T> = std::result::Result<T, ForwardError>;

impl ObserverError {
    /// Whether this error must terminate the process
    pub fn is_fatal(&self) -> bool {
        match self {
            ObserverError::Config(_) => true,
            ObserverError::OutputDir { .. } => true,
            ObserverError::Source(SourceError::NoMonitors { .. }) => true,
            ObserverError::Forward(ForwardError::InvalidEndpoint { .. }) => true,
            ObserverError::Forward(ForwardError::Client(_)) => true,
            _ => false,
        }
    }

    /// Get the error category for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            ObserverError::Config(_) => "config",
            ObserverError::Source(_) => "source",
            ObserverError::Writer(_) => "writer",
            ObserverError::Forward(_) => "forward",
            ObserverError::Metrics(_) => "metrics",
            ObserverError::OutputDir { .. } => "output_dir",
            ObserverError::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categorization() {
        let config_error = ObserverError::Config(ConfigError::InvalidValue {
            field: "sampling_on".to_string(),
            value: "0".to_string(),
        });
        assert_eq!(config_error.category(), "config");
        assert!(config_error.is_fatal());

        let source_error = ObserverError::Source(SourceError::NoMonitors {
            source_name: "process_table".to_string(),
        });
        assert_eq!(source_error.category(), "source");
        assert!(source_error.is_fatal());

        let stop_error = ObserverError::Source(SourceError::StopTimeout {
            source_name: "process_table".to_string(),
            timeout_secs: 2,
        });
        assert!(!stop_error.is_fatal());
    }

    #[test]
    fn test_cycle_local_errors_are_not_fatal() {
        let create = ObserverError::Writer(WriterError::Create {
            path: PathBuf::from("/nonexistent/events.json"),
            source: io::Error::new(io::ErrorKind::NotFound, "missing"),
        });
        assert_eq!(create.category(), "writer");
        assert!(!create.is_fatal());

        let dir = ObserverError::OutputDir {
            path: PathBuf::from("/proc/forbidden"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(dir.is_fatal());
        assert!(dir.to_string().contains("/proc/forbidden"));
    }
}
