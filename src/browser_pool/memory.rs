//! Browser memory sampling for restart decisions
//!
//! Readings come from the browser's main process, identified by the pid the
//! driver reports. Renderer processes are not included.

use serde::Serialize;
use std::path::PathBuf;

/// Resident set and heap size in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MemorySnapshot {
    pub rss_bytes: u64,
    pub heap_bytes: u64,
}

/// Source of memory readings for a process
pub trait MemoryProbe: Send + Sync + std::fmt::Debug {
    /// `None` when the platform offers no reading for `pid`
    fn sample(&self, pid: u32) -> Option<MemorySnapshot>;
}

/// Reads `VmRSS` and `VmData` from `<root>/<pid>/status`
#[derive(Debug, Clone)]
pub struct ProcStatusProbe {
    root: PathBuf,
}

impl Default for ProcStatusProbe {
    fn default() -> Self {
        Self::with_root("/proc")
    }
}

impl ProcStatusProbe {
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl MemoryProbe for ProcStatusProbe {
    fn sample(&self, pid: u32) -> Option<MemorySnapshot> {
        let path = self.root.join(pid.to_string()).join("status");
        let status = std::fs::read_to_string(path).ok()?;
        parse_proc_status(&status)
    }
}

/// Parse the kB fields of a proc status file
#[must_use]
pub fn parse_proc_status(status: &str) -> Option<MemorySnapshot> {
    let field = |name: &str| {
        status
            .lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
            .map(|kb| kb * 1024)
    };
    let rss_bytes = field("VmRSS:")?;
    Some(MemorySnapshot {
        rss_bytes,
        heap_bytes: field("VmData:").unwrap_or(0),
    })
}
