//! Event sources
//!
//! An event source produces events into the channel it is started with until
//! it is told to stop. Sources are shared across cycles as
//! `Arc<dyn EventSource>` and constructed once at startup.

use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sysinfo::{Pid, System};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ObserverConfig;
use crate::error::{SourceError, SourceResult};
use crate::event::{now_ns, Event, EventDetail, KernelStr};

/// Channel half handed to a source for one session
pub type EventSink = mpsc::Sender<Event>;

/// Producer of host activity events
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Produce events into `sink` until `session` is cancelled or the sink
    /// closes
    ///
    /// Sending awaits channel capacity, so a slow consumer throttles the
    /// source instead of losing events.
    async fn start(&self, sink: EventSink, session: CancellationToken) -> SourceResult<()>;

    /// End the session started with `session`; other sessions keep running.
    /// Must return promptly.
    async fn stop(&self, session: &CancellationToken) -> SourceResult<()>;

    /// Release process-lifetime resources; called once at exit
    async fn close(&self) -> SourceResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ProcessEntry {
    ppid: u32,
    uid: u32,
    gid: u32,
    comm: String,
    filename: String,
}

/// Process exec/exit events derived from the host process table
///
/// Each poll diffs the table against the previous one: new PIDs become
/// `process_exec`, vanished PIDs become `process_exit`. The first poll of a
/// session only records a baseline.
pub struct ProcessTableSource {
    poll_interval: Duration,
    container_runtime: Option<String>,
    next_session: AtomicU64,
}

impl ProcessTableSource {
    /// Build the source for this configuration
    ///
    /// Fails when the process monitor is disabled, since syscall and network
    /// activity are not visible from the process table.
    pub fn new(config: &ObserverConfig) -> SourceResult<Self> {
        if config.monitor_syscalls {
            warn!("Syscall monitoring requested but not observable from the process table");
        }
        if config.monitor_network {
            warn!("Network monitoring requested but not observable from the process table");
        }
        if !config.monitor_processes {
            return Err(SourceError::NoMonitors {
                source_name: "process_table".to_string(),
            });
        }

        let container_runtime = Some(config.container_runtime.trim())
            .filter(|runtime| !runtime.is_empty())
            .map(str::to_string);

        Ok(Self {
            poll_interval: config.poll_interval(),
            container_runtime,
            next_session: AtomicU64::new(0),
        })
    }

    fn snapshot(system: &mut System) -> HashMap<u32, ProcessEntry> {
        system.refresh_processes();
        system
            .processes()
            .iter()
            .map(|(pid, process)| {
                let entry = ProcessEntry {
                    ppid: process.parent().map(Pid::as_u32).unwrap_or_default(),
                    uid: process.user_id().map(|uid| **uid).unwrap_or_default(),
                    gid: process.group_id().map(|gid| *gid).unwrap_or_default(),
                    comm: process.name().to_string(),
                    filename: process.cmd().first().cloned().unwrap_or_default(),
                };
                (pid.as_u32(), entry)
            })
            .collect()
    }

    fn exec_event(&self, pid: u32, entry: &ProcessEntry) -> Event {
        let container_id = self
            .container_runtime
            .as_deref()
            .and_then(|runtime| read_container_id(pid, runtime));

        Event::new(
            pid,
            now_ns(),
            entry.comm.as_str(),
            EventDetail::ProcessExec {
                ppid: entry.ppid,
                uid: entry.uid,
                gid: entry.gid,
                filename: KernelStr::from(entry.filename.as_str()),
                cgroup_id: 0,
                container_id,
            },
        )
    }

    fn diff(
        &self,
        previous: &HashMap<u32, ProcessEntry>,
        current: &HashMap<u32, ProcessEntry>,
    ) -> Vec<Event> {
        let mut events: Vec<Event> = current
            .iter()
            .filter(|(pid, _)| !previous.contains_key(pid))
            .map(|(pid, entry)| self.exec_event(*pid, entry))
            .collect();

        events.extend(
            previous
                .iter()
                .filter(|(pid, _)| !current.contains_key(pid))
                .map(|(pid, entry)| {
                    // The table does not expose exit status once a process is gone
                    Event::new(
                        *pid,
                        now_ns(),
                        entry.comm.as_str(),
                        EventDetail::ProcessExit { exit_code: 0 },
                    )
                }),
        );

        events.sort_by_key(|event| event.pid);
        events
    }
}

#[async_trait]
impl EventSource for ProcessTableSource {
    fn name(&self) -> &str {
        "process_table"
    }

    async fn start(&self, sink: EventSink, session: CancellationToken) -> SourceResult<()> {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        info!(
            session = id,
            "Process table session started (poll every {:?})", self.poll_interval
        );

        let mut system = System::new();
        let mut known = Self::snapshot(&mut system);
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut sent = 0u64;
        'session: loop {
            tokio::select! {
                _ = session.cancelled() => break,
                _ = sink.closed() => break,
                _ = ticker.tick() => {}
            }

            let current = Self::snapshot(&mut system);
            for event in self.diff(&known, &current) {
                tokio::select! {
                    _ = session.cancelled() => break 'session,
                    result = sink.send(event) => {
                        if result.is_err() {
                            debug!("Event sink closed, ending process table session");
                            break 'session;
                        }
                        sent += 1;
                    }
                }
            }
            known = current;
        }

        info!(session = id, "Process table session ended after {} events", sent);
        Ok(())
    }

    async fn stop(&self, session: &CancellationToken) -> SourceResult<()> {
        session.cancel();
        Ok(())
    }

    async fn close(&self) -> SourceResult<()> {
        info!("Process table source closed");
        Ok(())
    }
}

fn read_container_id(pid: u32, runtime: &str) -> Option<String> {
    let contents = fs::read_to_string(format!("/proc/{pid}/cgroup")).ok()?;
    container_id_from_cgroup(&contents, runtime)
}

/// Extract a container ID from the contents of `/proc/<pid>/cgroup`
///
/// Recognizes the systemd scope form (`docker-<id>.scope`,
/// `cri-containerd-<id>.scope`) and the cgroupfs form (`/docker/<id>`).
pub fn container_id_from_cgroup(contents: &str, runtime: &str) -> Option<String> {
    let prefixes: &[&str] = match runtime {
        "docker" => &["docker-"],
        "containerd" => &["cri-containerd-", "containerd-"],
        "crio" | "cri-o" => &["crio-"],
        "podman" => &["libpod-"],
        _ => &[],
    };

    contents
        .lines()
        // hierarchy-ID:controllers:path
        .filter_map(|line| line.splitn(3, ':').nth(2))
        .flat_map(|path| path.split('/'))
        .filter_map(|segment| {
            let segment = segment.trim_end_matches(".scope");
            let id = prefixes
                .iter()
                .find_map(|prefix| segment.strip_prefix(prefix))
                .unwrap_or(segment);
            is_container_id(id).then(|| id.to_string())
        })
        .last()
}

fn is_container_id(candidate: &str) -> bool {
    candidate.len() == 64 && candidate.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::task::JoinHandle;

    const ID: &str = "4f1cd6b6b9a2e9c2d5a8e6f0b3c7d1e2f4a5b6c7d8e9f0a1b2c3d4e5f6a7b8c9";

    fn entry(comm: &str) -> ProcessEntry {
        ProcessEntry {
            ppid: 1,
            uid: 0,
            gid: 0,
            comm: comm.to_string(),
            filename: format!("/usr/bin/{comm}"),
        }
    }

    fn test_source(processes: bool) -> SourceResult<ProcessTableSource> {
        let config = ObserverConfig {
            monitor_processes: processes,
            container_runtime: String::new(),
            ..ObserverConfig::default()
        };
        ProcessTableSource::new(&config)
    }

    #[test]
    fn test_docker_systemd_scope() {
        let cgroup = format!("0::/system.slice/docker-{ID}.scope\n");
        assert_eq!(container_id_from_cgroup(&cgroup, "docker"), Some(ID.to_string()));
    }

    #[test]
    fn test_docker_cgroupfs_path() {
        let cgroup = format!("12:memory:/docker/{ID}\n11:cpu:/docker/{ID}\n");
        assert_eq!(container_id_from_cgroup(&cgroup, "docker"), Some(ID.to_string()));
    }

    #[test]
    fn test_containerd_scope() {
        let cgroup = format!(
            "0::/kubepods.slice/kubepods-besteffort.slice/cri-containerd-{ID}.scope\n"
        );
        assert_eq!(container_id_from_cgroup(&cgroup, "containerd"), Some(ID.to_string()));
    }

    #[test]
    fn test_host_process_has_no_container() {
        let cgroup = "0::/user.slice/user-1000.slice/session-2.scope\n";
        assert_eq!(container_id_from_cgroup(cgroup, "docker"), None);
    }

    #[test]
    fn test_disabled_process_monitor_is_fatal() {
        assert!(matches!(test_source(false), Err(SourceError::NoMonitors { .. })));
        assert!(test_source(true).is_ok());
    }

    #[test]
    fn test_diff_reports_exec_and_exit() {
        let source = test_source(true).unwrap();
        let previous = HashMap::from([(10, entry("sshd")), (11, entry("bash"))]);
        let current = HashMap::from([(10, entry("sshd")), (12, entry("curl"))]);

        let events = source.diff(&previous, &current);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].pid, 11);
        assert_eq!(events[0].kind(), "process_exit");
        assert_eq!(events[1].pid, 12);
        assert_eq!(events[1].kind(), "process_exec");
    }

    fn spawn_session(
        source: &Arc<ProcessTableSource>,
        session: &CancellationToken,
    ) -> (JoinHandle<SourceResult<()>>, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(1024);
        let source = source.clone();
        let session = session.clone();
        (tokio::spawn(async move { source.start(tx, session).await }), rx)
    }

    #[tokio::test]
    async fn test_stop_ends_session() {
        let source = Arc::new(test_source(true).unwrap());
        let token = CancellationToken::new();
        let (session, _rx) = spawn_session(&source, &token);

        tokio::time::sleep(Duration::from_millis(50)).await;
        source.stop(&token).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .expect("session did not stop")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_stop_leaves_other_sessions_running() {
        let source = Arc::new(test_source(true).unwrap());
        let (first_token, second_token) = (CancellationToken::new(), CancellationToken::new());
        let (first, _first_rx) = spawn_session(&source, &first_token);
        let (second, _second_rx) = spawn_session(&source, &second_token);

        tokio::time::sleep(Duration::from_millis(50)).await;
        source.stop(&first_token).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), first)
            .await
            .expect("first session did not stop")
            .unwrap()
            .unwrap();

        // Well past a poll tick: the second session is still producing
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!second.is_finished());
        assert!(!second_token.is_cancelled());

        source.stop(&second_token).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), second)
            .await
            .expect("second session did not stop")
            .unwrap()
            .unwrap();
    }
}
