//! Point-in-time process snapshots.
//!
//! A [`SystemSnapshot`] is produced once per sampler tick and never mutated
//! afterwards. The sampler hands out `Arc<SystemSnapshot>` so every consumer
//! observes the same value. Field names on the wire are the camelCase names
//! below; viewers depend on them.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Scheduling state of a single concurrent execution unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitState {
    /// Currently executing on a CPU.
    Running,
    /// Ready to run, waiting for a CPU.
    Runnable,
    /// Sleeping on an event, timer or I/O readiness.
    Waiting,
    /// In an uninterruptible wait or stopped.
    Blocked,
    /// Exited but not yet reaped.
    Terminated,
}

impl UnitState {
    /// All states, in display order.
    pub const ALL: [UnitState; 5] = [
        Self::Running,
        Self::Runnable,
        Self::Waiting,
        Self::Blocked,
        Self::Terminated,
    ];
}

impl std::fmt::Display for UnitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Runnable => write!(f, "runnable"),
            Self::Waiting => write!(f, "waiting"),
            Self::Blocked => write!(f, "blocked"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Descriptor of one execution unit (an OS thread of the sampled process).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitInfo {
    pub id: u64,
    pub state: UnitState,
    /// Thread name plus the kernel wait channel when one is known,
    /// e.g. `tokio-runtime-w @ ep_poll`.
    pub location: String,
    pub age_ms: u64,
    /// Creation instant, unix milliseconds.
    pub created_at: u64,
}

/// Immutable capture of the process's concurrency and memory state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSnapshot {
    /// Sequence number assigned by the sampler, strictly increasing.
    pub seq: u64,
    /// Capture instant, unix milliseconds.
    pub timestamp: u64,
    pub concurrency_count: usize,
    pub hardware_parallelism: usize,
    pub scheduler_parallelism: usize,
    /// Opaque memory counters, passed through from the stats provider.
    pub memory_stats: serde_json::Value,
    pub units: Vec<UnitInfo>,
    /// True when `units` was synthesized instead of read from the OS.
    pub units_approximate: bool,
}

impl SystemSnapshot {
    /// Number of units in each state, in [`UnitState::ALL`] order.
    pub fn state_counts(&self) -> [(UnitState, usize); 5] {
        UnitState::ALL.map(|state| {
            let n = self.units.iter().filter(|u| u.state == state).count();
            (state, n)
        })
    }

    /// One-line human readable summary.
    pub fn summary(&self) -> String {
        let states: Vec<String> = self
            .state_counts()
            .iter()
            .filter(|(_, n)| *n > 0)
            .map(|(s, n)| format!("{s}={n}"))
            .collect();
        let rss = self
            .memory_stats
            .get("rss_bytes")
            .and_then(serde_json::Value::as_u64)
            .map(|b| format!("{:.1} MiB", b as f64 / (1024.0 * 1024.0)))
            .unwrap_or_else(|| "n/a".to_string());
        format!(
            "#{} units={} cpus={} workers={} rss={} [{}]{}",
            self.seq,
            self.concurrency_count,
            self.hardware_parallelism,
            self.scheduler_parallelism,
            rss,
            states.join(" "),
            if self.units_approximate {
                " (approximate)"
            } else {
                ""
            }
        )
    }
}

pub(crate) fn unix_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
