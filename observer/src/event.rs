//! Event records produced by event sources
//!
//! Each event serializes to one flat JSON object carrying at least a `type`
//! tag and a `pid`. Monitor-specific fields follow the kernel probe layouts
//! and are not interpreted by the pipeline.

use std::fmt;
use std::net::Ipv4Addr;

use serde::ser::Error as _;
use serde::{Serialize, Serializer};

/// Raw bytes of a fixed-size kernel char buffer (comm, filename, syscall name)
///
/// Serializes as a string cut at the first NUL. Bytes that are not valid
/// UTF-8 fail serialization instead of being replaced, so a mangled probe
/// record never reaches disk half-decoded.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct KernelStr(Vec<u8>);

impl KernelStr {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Bytes up to the first NUL
    pub fn as_bytes(&self) -> &[u8] {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(self.0.len());
        &self.0[..end]
    }

    pub fn to_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(self.as_bytes())
    }
}

impl From<&str> for KernelStr {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<String> for KernelStr {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl fmt::Debug for KernelStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(self.as_bytes()))
    }
}

impl fmt::Display for KernelStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.as_bytes()))
    }
}

impl Serialize for KernelStr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.to_str() {
            Ok(s) => serializer.serialize_str(s),
            Err(e) => Err(S::Error::custom(format!(
                "kernel string is not valid UTF-8 at byte {}",
                e.valid_up_to()
            ))),
        }
    }
}

/// One observed occurrence on the host
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub pid: u32,

    /// Event timestamp in nanoseconds
    pub timestamp_ns: u64,

    /// Task command name
    pub comm: KernelStr,

    #[serde(flatten)]
    pub detail: EventDetail,
}

/// Monitor-specific part of an event; the variant is the event `type`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventDetail {
    ProcessExec {
        ppid: u32,
        uid: u32,
        gid: u32,
        filename: KernelStr,
        cgroup_id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        container_id: Option<String>,
    },
    ProcessExit {
        exit_code: u32,
    },
    Syscall {
        uid: u32,
        syscall_id: u64,
        syscall_name: KernelStr,
        duration_ns: u64,
    },
    TcpConnect {
        uid: u32,
        saddr: Ipv4Addr,
        daddr: Ipv4Addr,
        sport: u16,
        dport: u16,
        cgroup_id: u64,
    },
}

impl Event {
    pub fn new(
        pid: u32,
        timestamp_ns: u64,
        comm: impl Into<KernelStr>,
        detail: EventDetail,
    ) -> Self {
        Self {
            pid,
            timestamp_ns,
            comm: comm.into(),
            detail,
        }
    }

    /// Type tag as written to the `type` field
    pub fn kind(&self) -> &'static str {
        match self.detail {
            EventDetail::ProcessExec { .. } => "process_exec",
            EventDetail::ProcessExit { .. } => "process_exit",
            EventDetail::Syscall { .. } => "syscall",
            EventDetail::TcpConnect { .. } => "tcp_connect",
        }
    }
}

/// Current wall clock in nanoseconds since the epoch
pub fn now_ns() -> u64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .map(|ns| ns.max(0) as u64)
        .unwrap_or_default()
}
