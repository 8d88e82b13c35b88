//! SDS observer library
//!
//! Sparse-sampling host telemetry: a scheduler opens bounded ON windows,
//! each window streams events from an event source through a bounded channel
//! into its own newline-delimited JSON file, optionally relaying every event
//! to a remote HTTP endpoint.

pub mod config;
pub mod cycle;
pub mod error;
pub mod event;
pub mod forward;
pub mod metrics;
pub mod scheduler;
pub mod source;
pub mod writer;

// Re-export commonly used types
pub use config::{ConfigOverrides, ObserverConfig};
pub use cycle::{CollectionCycle, CycleContext, CycleReport, WindowEnd};
pub use error::{ObserverError, Result};
pub use event::{Event, EventDetail, KernelStr};
pub use forward::{ForwardingSink, HttpForwarder};
pub use metrics::ObserverMetrics;
pub use scheduler::{SamplingScheduler, SchedulerReport};
pub use source::{EventSink, EventSource, ProcessTableSource};
pub use writer::{EventWriter, WriterSummary};
