//! Sparse-sampling scheduler
//!
//! Starts one collection cycle immediately and another every `ON + OFF`
//! seconds until the stop signal fires. Cycles run as independent tasks; a
//! semaphore bounds how many hold an event source session at once. On stop,
//! running cycles are cancelled and joined for a bounded grace period.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cycle::{CollectionCycle, CycleContext, CycleReport};
use crate::error::Result;

/// What happened to the cycles of one scheduler run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerReport {
    pub cycles_started: u64,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    /// Cancelled while still waiting for a free slot
    pub cycles_skipped: u64,
    /// Still running when the shutdown grace period ran out
    pub cycles_abandoned: u64,
}

type CycleOutcome = Result<Option<CycleReport>>;

/// Drives the ON/OFF cadence and owns shutdown
pub struct SamplingScheduler {
    context: CycleContext,
    permits: Arc<Semaphore>,
    cycles_cancel: CancellationToken,
}

impl SamplingScheduler {
    pub fn new(context: CycleContext) -> Self {
        let permits = Arc::new(Semaphore::new(context.config.max_concurrent_cycles));
        Self {
            context,
            permits,
            cycles_cancel: CancellationToken::new(),
        }
    }

    /// Run until `stop` resolves, then drain cycles and close the source
    pub async fn run<F>(self, stop: F) -> SchedulerReport
    where
        F: Future<Output = ()>,
    {
        let config = self.context.config.clone();
        info!(
            "Sampling: {}s ON, {}s OFF",
            config.sampling_on, config.sampling_off
        );
        info!("Output: {}", config.output_dir.display());

        // The first tick completes immediately: cold start without an OFF wait
        let mut ticker = tokio::time::interval(config.period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut cycles: JoinSet<CycleOutcome> = JoinSet::new();
        let mut report = SchedulerReport::default();
        tokio::pin!(stop);

        loop {
            tokio::select! {
                biased;
                _ = &mut stop => {
                    info!("Shutting down...");
                    break;
                }
                Some(joined) = cycles.join_next(), if !cycles.is_empty() => {
                    self.record(joined, &mut report);
                }
                _ = ticker.tick() => {
                    self.launch(&mut cycles);
                    report.cycles_started += 1;
                }
            }
        }
        drop(ticker);

        self.drain(&mut cycles, &mut report).await;

        if let Err(e) = self.context.source.close().await {
            warn!("Failed to close event source {}: {}", self.context.source.name(), e);
        }
        self.write_metrics();

        info!(
            started = report.cycles_started,
            completed = report.cycles_completed,
            failed = report.cycles_failed,
            abandoned = report.cycles_abandoned,
            "Scheduler stopped"
        );
        report
    }

    fn launch(&self, cycles: &mut JoinSet<CycleOutcome>) {
        let context = self.context.clone();
        let permits = self.permits.clone();
        let cancel = self.cycles_cancel.child_token();

        cycles.spawn(async move {
            let permit = match permits.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("Previous collection cycle still running, waiting for it to finish");
                    tokio::select! {
                        permit = permits.acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => return Ok(None),
                        },
                        _ = cancel.cancelled() => return Ok(None),
                    }
                }
            };

            let report = CollectionCycle::new(context, cancel).execute().await;
            drop(permit);
            report.map(Some)
        });
    }

    fn record(
        &self,
        joined: std::result::Result<CycleOutcome, JoinError>,
        report: &mut SchedulerReport,
    ) {
        match joined {
            Ok(Ok(Some(_))) => report.cycles_completed += 1,
            Ok(Ok(None)) => report.cycles_skipped += 1,
            Ok(Err(e)) => {
                report.cycles_failed += 1;
                error!(category = e.category(), "Collection cycle failed: {}", e);
            }
            Err(e) if e.is_cancelled() => report.cycles_abandoned += 1,
            Err(e) => {
                report.cycles_failed += 1;
                error!("Collection cycle panicked: {}", e);
            }
        }
        self.write_metrics();
    }

    async fn drain(&self, cycles: &mut JoinSet<CycleOutcome>, report: &mut SchedulerReport) {
        if cycles.is_empty() {
            return;
        }

        let grace = self.context.config.shutdown_grace();
        info!("Waiting up to {:?} for {} collection cycle(s)", grace, cycles.len());
        self.cycles_cancel.cancel();

        let joined = tokio::time::timeout(grace, async {
            while let Some(joined) = cycles.join_next().await {
                self.record(joined, report);
            }
        })
        .await;

        if joined.is_err() {
            warn!(
                "{} collection cycle(s) still running after {:?}, abandoning",
                cycles.len(),
                grace
            );
            cycles.abort_all();
            while let Some(joined) = cycles.join_next().await {
                self.record(joined, report);
            }
        }
    }

    fn write_metrics(&self) {
        if let Some(path) = &self.context.config.metrics_file {
            if let Err(e) = self.context.metrics.write_textfile(path) {
                warn!("Failed to write metrics to {}: {}", path.display(), e);
            }
        }
    }
}
