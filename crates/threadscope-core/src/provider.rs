//! Stats providers: where the raw numbers behind a snapshot come from.
//!
//! The sampler treats a provider as opaque. It calls [`StatsProvider::capture`]
//! once per tick from the blocking pool and turns the result into a
//! [`crate::SystemSnapshot`].
//!
//! Two implementations ship with the crate:
//! - [`ProcfsProvider`] reads the current process from `/proc` and attributes
//!   a real scheduler state to every thread.
//! - [`FallbackProvider`] is used where procfs is unavailable. Only the
//!   hardware parallelism is measured; the thread count is estimated from the
//!   tokio runtime, unit entries are synthesized from it, and the result is
//!   flagged `units_approximate`.

use std::sync::Arc;
use std::time::Instant;

use crate::error::ProviderError;
use crate::snapshot::{UnitInfo, UnitState, unix_ms_now};

pub use crate::procfs::ProcfsProvider;

/// Raw counters returned by a provider for one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct RawStats {
    /// Live execution units at capture time (not capped).
    pub concurrency_count: usize,
    pub hardware_parallelism: usize,
    /// Configured scheduler parallelism, if the provider knows it. The
    /// sampler fills in its runtime's worker count otherwise.
    pub scheduler_parallelism: Option<usize>,
    pub memory: serde_json::Value,
    /// At most `max_units` entries, ordered by id.
    pub units: Vec<UnitInfo>,
    pub units_approximate: bool,
}

/// Source of concurrency and memory counters.
pub trait StatsProvider: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Capture the current state. At most `max_units` unit entries are
    /// returned; `concurrency_count` is always the full count.
    fn capture(&self, max_units: usize) -> Result<RawStats, ProviderError>;
}

/// Hardware parallelism as reported by the standard library.
pub fn hardware_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Best provider for this platform.
pub fn default_provider() -> Arc<dyn StatsProvider> {
    #[cfg(target_os = "linux")]
    {
        let procfs = ProcfsProvider::new();
        if procfs.is_available() {
            return Arc::new(procfs);
        }
        log::warn!("procfs not available, unit states will be approximate");
    }
    Arc::new(FallbackProvider::new())
}

/// Provider for platforms without procfs.
///
/// The thread count is derived from the tokio runtime the caller runs on
/// (workers plus the driving thread). Unit entries are synthesized from that
/// count and always flagged approximate.
pub struct FallbackProvider {
    started: Instant,
    started_unix_ms: u64,
}

impl FallbackProvider {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            started_unix_ms: unix_ms_now(),
        }
    }
}

impl Default for FallbackProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsProvider for FallbackProvider {
    fn name(&self) -> &'static str {
        "fallback"
    }

    fn capture(&self, max_units: usize) -> Result<RawStats, ProviderError> {
        let workers = tokio::runtime::Handle::try_current()
            .map(|h| h.metrics().num_workers())
            .ok();
        let count = workers.unwrap_or(0) + 1;
        let age_ms = self.started.elapsed().as_millis() as u64;

        let units = (0..count.min(max_units))
            .map(|i| UnitInfo {
                id: i as u64 + 1,
                // Only the capturing thread is known to be on a CPU.
                state: if i == 0 {
                    UnitState::Running
                } else {
                    UnitState::Waiting
                },
                location: "unknown".to_string(),
                age_ms,
                created_at: self.started_unix_ms,
            })
            .collect();

        Ok(RawStats {
            concurrency_count: count,
            hardware_parallelism: hardware_parallelism(),
            scheduler_parallelism: workers,
            memory: serde_json::Value::Object(serde_json::Map::new()),
            units,
            units_approximate: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_is_flagged_approximate() {
        let p = FallbackProvider::new();
        let raw = p.capture(50).unwrap();
        assert!(raw.units_approximate);
        assert!(raw.concurrency_count >= 1);
        assert!(raw.hardware_parallelism >= 1);
        assert_eq!(raw.units.len(), raw.concurrency_count.min(50));
        assert_eq!(raw.units[0].state, UnitState::Running);
    }

    #[test]
    fn fallback_respects_unit_cap() {
        let p = FallbackProvider::new();
        let raw = p.capture(0).unwrap();
        assert!(raw.units.is_empty());
        assert!(raw.concurrency_count >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn fallback_counts_runtime_workers() {
        let raw = FallbackProvider::new().capture(50).unwrap();
        assert_eq!(raw.scheduler_parallelism, Some(3));
        assert_eq!(raw.concurrency_count, 4);
    }

    #[test]
    fn default_provider_captures() {
        let p = default_provider();
        let raw = p.capture(5).unwrap();
        assert!(raw.concurrency_count >= 1);
        assert!(raw.units.len() <= 5);
    }
}
