//! One ON-window collection session
//!
//! A cycle starts the event source on a fresh bounded channel, drains it into
//! its own output file until the window closes, then stops the source and
//! closes the file. Window end is the ON-duration deadline or cancellation,
//! whichever comes first. Errors stay inside the cycle.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use prometheus::IntGauge;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ObserverConfig;
use crate::error::{ConfigError, Result, SourceError, SourceResult, WriterError};
use crate::event::Event;
use crate::forward::ForwardingSink;
use crate::metrics::ObserverMetrics;
use crate::source::EventSource;
use crate::writer::EventWriter;

/// Why a collection window ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowEnd {
    /// The ON duration elapsed
    Elapsed,
    /// Shutdown cancelled the window early
    Cancelled,
}

/// Outcome of a finished cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub path: PathBuf,
    pub events_written: u64,
    pub encode_failures: u64,
    pub write_failures: u64,
    pub started_at: DateTime<Local>,
    pub elapsed: Duration,
    pub window_end: WindowEnd,
}

/// Everything a cycle needs, shared across cycles
#[derive(Clone)]
pub struct CycleContext {
    pub config: Arc<ObserverConfig>,
    pub source: Arc<dyn EventSource>,
    pub forwarder: Option<Arc<dyn ForwardingSink>>,
    pub metrics: Arc<ObserverMetrics>,
}

/// A single collection cycle
pub struct CollectionCycle {
    context: CycleContext,
    cancel: CancellationToken,
}

#[derive(Default)]
struct CycleCounts {
    encode_failures: u64,
    write_failures: u64,
}

/// Keeps the active-cycles gauge right on every exit path, including abort
struct ActiveCycle(IntGauge);

impl ActiveCycle {
    fn enter(gauge: &IntGauge) -> Self {
        gauge.inc();
        Self(gauge.clone())
    }
}

impl Drop for ActiveCycle {
    fn drop(&mut self) {
        self.0.dec();
    }
}

impl CollectionCycle {
    pub fn new(context: CycleContext, cancel: CancellationToken) -> Self {
        Self { context, cancel }
    }

    /// Run the cycle to completion
    pub async fn execute(self) -> Result<CycleReport> {
        let config = self.context.config.clone();
        let metrics = self.context.metrics.clone();
        let _active = ActiveCycle::enter(&metrics.active_cycles);
        metrics.cycles_started.inc();

        let result = self.run(&config).await;
        match &result {
            Ok(_) => metrics.cycles_completed.inc(),
            Err(_) => metrics.cycles_failed.inc(),
        }
        result
    }

    async fn run(&self, config: &ObserverConfig) -> Result<CycleReport> {
        info!("Starting collection cycle for {} seconds", config.sampling_on);

        let started = Instant::now();
        let started_at = Local::now();
        let deadline = started
            .checked_add(config.on_duration())
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "sampling_on".to_string(),
                value: config.sampling_on.to_string(),
            })?;
        let window = tokio::time::sleep_until(deadline);
        tokio::pin!(window);

        // The file exists before the source starts, so a cycle that cannot
        // record never opens a source session
        let mut writer = match EventWriter::create(&config.output_dir, &started_at) {
            Ok(writer) => writer,
            Err(e) => {
                error!("Error creating output file: {}", e);
                return Err(e.into());
            }
        };

        let (tx, mut rx) = mpsc::channel::<Event>(config.channel_capacity);
        let session = CancellationToken::new();
        let producer = {
            let source = self.context.source.clone();
            let session = session.clone();
            tokio::spawn(async move { source.start(tx, session).await })
        };

        let mut counts = CycleCounts::default();
        let mut producing = true;
        let window_end = loop {
            tokio::select! {
                biased;
                _ = &mut window => break WindowEnd::Elapsed,
                _ = self.cancel.cancelled() => break WindowEnd::Cancelled,
                received = rx.recv(), if producing => match received {
                    Some(event) => self.route(&mut writer, event, &mut counts, config),
                    // Source ended early; the window still runs to its end
                    None => producing = false,
                },
            }
        };

        // Nothing sent after the window closes is accepted; what is already
        // buffered was emitted inside the window and is still written
        rx.close();
        if let Err(e) = self.stop_source(producer, &session, config).await {
            warn!("{}", e);
        }
        while let Some(event) = rx.recv().await {
            self.route(&mut writer, event, &mut counts, config);
        }

        let summary = writer.close()?;
        info!(
            "Collection cycle complete: {} events collected -> {}",
            summary.records,
            summary.path.display()
        );
        if counts.encode_failures > 0 || counts.write_failures > 0 {
            warn!(
                encode_failures = counts.encode_failures,
                write_failures = counts.write_failures,
                path = %summary.path.display(),
                "Some events of this cycle were not written"
            );
        }

        Ok(CycleReport {
            path: summary.path,
            events_written: summary.records,
            encode_failures: counts.encode_failures,
            write_failures: counts.write_failures,
            started_at,
            elapsed: started.elapsed(),
            window_end,
        })
    }

    fn route(
        &self,
        writer: &mut EventWriter,
        event: Event,
        counts: &mut CycleCounts,
        config: &ObserverConfig,
    ) {
        match writer.append(&event) {
            Ok(()) => self.context.metrics.events_written.inc(),
            Err(WriterError::Encode(e)) => {
                counts.encode_failures += 1;
                self.context.metrics.encode_failures.inc();
                error!(pid = event.pid, "Error encoding event: {}", e);
            }
            Err(e) => {
                counts.write_failures += 1;
                error!(pid = event.pid, "Error writing event: {}", e);
            }
        }

        if config.verbose {
            info!("Event: {} [PID: {}]", event.kind(), event.pid);
        }

        if let Some(forwarder) = &self.context.forwarder {
            forwarder.forward(event);
        }
    }

    /// Tell the source to stop this cycle's session and wait for it to end,
    /// both bounded
    async fn stop_source(
        &self,
        producer: JoinHandle<SourceResult<()>>,
        session: &CancellationToken,
        config: &ObserverConfig,
    ) -> SourceResult<()> {
        let source = &self.context.source;
        let timeout = config.source_stop_timeout();
        let stop_timeout = || SourceError::StopTimeout {
            source_name: source.name().to_string(),
            timeout_secs: config.source_stop_timeout_secs,
        };

        match tokio::time::timeout(timeout, source.stop(session)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Event source {} failed to stop: {}", source.name(), e),
            Err(_) => {
                producer.abort();
                return Err(stop_timeout());
            }
        }

        let abort = producer.abort_handle();
        match tokio::time::timeout(timeout, producer).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => {
                warn!("Event source {} session ended with error: {}", source.name(), e);
                Ok(())
            }
            Ok(Err(join_error)) => Err(SourceError::Session {
                source_name: source.name().to_string(),
                reason: join_error.to_string(),
            }),
            Err(_) => {
                abort.abort();
                Err(stop_timeout())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ObserverError;
    use crate::event::EventDetail;
    use crate::source::EventSink;
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Emits `count` events as fast as the channel accepts them, then idles
    struct BurstSource {
        count: u32,
    }

    #[async_trait]
    impl EventSource for BurstSource {
        fn name(&self) -> &str {
            "burst"
        }

        async fn start(&self, sink: EventSink, session: CancellationToken) -> SourceResult<()> {
            for pid in 0..self.count {
                let event = Event::new(pid, 0, "burst", EventDetail::ProcessExit { exit_code: 0 });
                if sink.send(event).await.is_err() {
                    return Ok(());
                }
            }
            session.cancelled().await;
            Ok(())
        }

        async fn stop(&self, session: &CancellationToken) -> SourceResult<()> {
            session.cancel();
            Ok(())
        }

        async fn close(&self) -> SourceResult<()> {
            Ok(())
        }
    }

    fn context(dir: &TempDir, on: u64, source: Arc<dyn EventSource>) -> CycleContext {
        CycleContext {
            config: Arc::new(ObserverConfig {
                output_dir: dir.path().to_path_buf(),
                sampling_on: on,
                sampling_off: 0,
                ..ObserverConfig::default()
            }),
            source,
            forwarder: None,
            metrics: Arc::new(ObserverMetrics::new().unwrap()),
        }
    }

    fn burst(count: u32) -> Arc<dyn EventSource> {
        Arc::new(BurstSource { count })
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_writes_all_events() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, 1, burst(25));
        let metrics = ctx.metrics.clone();

        let report = CollectionCycle::new(ctx, CancellationToken::new())
            .execute()
            .await
            .unwrap();

        assert_eq!(report.events_written, 25);
        assert_eq!(report.window_end, WindowEnd::Elapsed);
        assert_eq!(metrics.events_written.get(), 25);
        assert_eq!(metrics.cycles_completed.get(), 1);
        assert_eq!(metrics.active_cycles.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_ends_window_early() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, 3600, burst(3));
        let cancel = CancellationToken::new();

        let cycle = tokio::spawn(CollectionCycle::new(ctx, cancel.clone()).execute());
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        let report = cycle.await.unwrap().unwrap();
        assert_eq!(report.window_end, WindowEnd::Cancelled);
        assert_eq!(report.events_written, 3);
        assert!(report.elapsed < Duration::from_secs(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_file_creation_failure_fails_cycle() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir, 1, burst(0));
        let mut config = (*ctx.config).clone();
        config.output_dir = dir.path().join("missing");
        ctx.config = Arc::new(config);
        let metrics = ctx.metrics.clone();

        let err = CollectionCycle::new(ctx, CancellationToken::new())
            .execute()
            .await
            .unwrap_err();

        assert!(matches!(err, ObserverError::Writer(WriterError::Create { .. })));
        assert_eq!(metrics.cycles_failed.get(), 1);
        assert_eq!(metrics.active_cycles.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_window_fails_cycle() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, u64::MAX / 2, burst(3));
        let metrics = ctx.metrics.clone();

        let err = CollectionCycle::new(ctx, CancellationToken::new())
            .execute()
            .await
            .unwrap_err();

        match err {
            ObserverError::Config(ConfigError::InvalidValue { field, .. }) => {
                assert_eq!(field, "sampling_on")
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(metrics.cycles_failed.get(), 1);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }
}
