//! Shared test fixtures: a scripted event source and file helpers

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use sds_observer::error::SourceResult;
use sds_observer::{
    CycleContext, Event, EventDetail, EventSink, EventSource, KernelStr, ObserverConfig,
    ObserverMetrics,
};

/// Emits a fixed script of `(offset, event)` pairs per session, then idles
/// until stopped. Offsets are measured from the start of the session.
#[derive(Default)]
pub struct ScriptedSource {
    script: Vec<(Duration, Event)>,
    hang_on_stop: bool,
    pub starts: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub blocked_sends: AtomicUsize,
    pub closed: AtomicBool,
}

impl ScriptedSource {
    pub fn new(script: Vec<(Duration, Event)>) -> Self {
        Self {
            script,
            ..Default::default()
        }
    }

    pub fn idle() -> Self {
        Self::new(Vec::new())
    }

    /// A source whose `stop` never returns
    pub fn hanging() -> Self {
        Self::idle().with_hanging_stop()
    }

    pub fn with_hanging_stop(mut self) -> Self {
        self.hang_on_stop = true;
        self
    }

    /// `count` events, all due at the start of the session
    pub fn burst(count: u32) -> Self {
        Self::new((0..count).map(|pid| (Duration::ZERO, exit_event(pid))).collect())
    }
}

#[async_trait]
impl EventSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn start(&self, sink: EventSink, token: CancellationToken) -> SourceResult<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        let begin = Instant::now();
        for (offset, event) in self.script.iter().cloned() {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep_until(begin + offset) => {}
            }

            let event = match sink.try_send(event) {
                Ok(()) => continue,
                Err(TrySendError::Closed(_)) => break,
                Err(TrySendError::Full(event)) => event,
            };
            self.blocked_sends.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                _ = token.cancelled() => break,
                sent = sink.send(event) => if sent.is_err() { break },
            }
        }

        token.cancelled().await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self, session: &CancellationToken) -> SourceResult<()> {
        if self.hang_on_stop {
            std::future::pending::<()>().await;
        }
        session.cancel();
        Ok(())
    }

    async fn close(&self) -> SourceResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// An HTTP endpoint whose server closes every connection before replying
pub async fn closing_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    });
    format!("http://{addr}/ingest")
}

pub fn exit_event(pid: u32) -> Event {
    Event::new(pid, u64::from(pid), "worker", EventDetail::ProcessExit { exit_code: 0 })
}

/// An event whose comm bytes are not UTF-8 and therefore cannot be encoded
pub fn malformed_event(pid: u32) -> Event {
    Event::new(
        pid,
        0,
        KernelStr::from_bytes(vec![b'x', 0xc3, 0x28]),
        EventDetail::ProcessExit { exit_code: 1 },
    )
}

pub fn test_config(output_dir: &Path, on: u64, off: u64) -> ObserverConfig {
    ObserverConfig {
        output_dir: output_dir.to_path_buf(),
        sampling_on: on,
        sampling_off: off,
        container_runtime: String::new(),
        ..ObserverConfig::default()
    }
}

pub fn context(config: ObserverConfig, source: Arc<dyn EventSource>) -> CycleContext {
    CycleContext {
        config: Arc::new(config),
        source,
        forwarder: None,
        metrics: Arc::new(ObserverMetrics::new().unwrap()),
    }
}

pub fn read_records(path: &Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).expect("every line is a complete record"))
        .collect()
}

pub fn event_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| {
            let name = path.file_name().unwrap().to_string_lossy();
            name.starts_with("events_") && name.ends_with(".json")
        })
        .collect();
    files.sort();
    files
}
