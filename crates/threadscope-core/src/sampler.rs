//! Fixed-interval sampler.
//!
//! Lifecycle is one-way: `Idle → Running → Stopped`. A stopped sampler cannot
//! be restarted; build a new one instead.
//!
//! ```no_run
//! use threadscope_core::{Sampler, SamplerConfig, default_provider};
//!
//! # async fn demo() -> Result<(), threadscope_core::SamplerError> {
//! let sampler = Sampler::new(default_provider(), SamplerConfig::default());
//! let mut stream = sampler.subscribe();
//! sampler.start()?;
//! if let Some(snap) = stream.recv().await {
//!     println!("{}", snap.summary());
//! }
//! sampler.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::SamplerConfig;
use crate::error::SamplerError;
use crate::provider::{RawStats, StatsProvider};
use crate::registry::{Registry, Subscription};
use crate::snapshot::{SystemSnapshot, unix_ms_now};

/// Observable lifecycle state of a [`Sampler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Idle,
    Running,
    Stopped,
}

impl std::fmt::Display for SamplerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

enum Lifecycle {
    Idle,
    Running(JoinHandle<()>),
    Stopped(Option<JoinHandle<()>>),
}

struct Shared {
    provider: Arc<dyn StatsProvider>,
    config: SamplerConfig,
    registry: Registry,
    lifecycle: Mutex<Lifecycle>,
    shutdown: CancellationToken,
    active_loops: AtomicUsize,
    produced: AtomicU64,
}

impl Shared {
    /// Running → Stopped. Returns false if the sampler was not running.
    fn halt(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        match std::mem::replace(&mut *lifecycle, Lifecycle::Idle) {
            Lifecycle::Running(handle) => {
                *lifecycle = Lifecycle::Stopped(Some(handle));
                self.shutdown.cancel();
                true
            }
            other => {
                *lifecycle = other;
                false
            }
        }
    }
}

/// Halts the loop when the last [`Sampler`] handle is dropped.
struct Owner {
    shared: Arc<Shared>,
}

impl Drop for Owner {
    fn drop(&mut self) {
        if self.shared.halt() {
            log::info!("last sampler handle dropped, stopping");
        }
    }
}

/// Periodic producer of [`SystemSnapshot`]s. Cheap to clone; clones share
/// the same timer, subscribers and lifecycle. Dropping the last clone stops
/// a running sampler.
#[derive(Clone)]
pub struct Sampler {
    shared: Arc<Shared>,
    _owner: Arc<Owner>,
}

impl Sampler {
    pub fn new(provider: Arc<dyn StatsProvider>, config: SamplerConfig) -> Self {
        let shared = Arc::new(Shared {
            provider,
            config,
            registry: Registry::new(),
            lifecycle: Mutex::new(Lifecycle::Idle),
            shutdown: CancellationToken::new(),
            active_loops: AtomicUsize::new(0),
            produced: AtomicU64::new(0),
        });
        Self {
            _owner: Arc::new(Owner {
                shared: Arc::clone(&shared),
            }),
            shared,
        }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.shared.config
    }

    /// Idle → Running. Spawns the tick loop on the current tokio runtime.
    /// Calling it in any other state does nothing.
    pub fn start(&self) -> Result<(), SamplerError> {
        let mut lifecycle = self
            .shared
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !matches!(*lifecycle, Lifecycle::Idle) {
            log::debug!("sampler start ignored, already {}", state_of(&lifecycle));
            return Ok(());
        }
        let handle = Handle::try_current().map_err(|_| SamplerError::NoRuntime)?;
        let task = handle.spawn(tick_loop(Arc::clone(&self.shared)));
        *lifecycle = Lifecycle::Running(task);
        log::info!(
            "sampler started ({} provider, every {:?})",
            self.shared.provider.name(),
            self.shared.config.interval
        );
        Ok(())
    }

    /// Running → Stopped. Fires the shutdown signal exactly once; every
    /// other call is a no-op.
    pub fn stop(&self) {
        if self.shared.halt() {
            log::info!("sampler stopping");
        }
    }

    /// [`stop`](Self::stop), then wait for the tick loop to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let handle = {
            let mut lifecycle = self
                .shared
                .lifecycle
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match &mut *lifecycle {
                Lifecycle::Stopped(handle) => handle.take(),
                _ => None,
            }
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::error!("sampler loop ended abnormally: {e}");
            }
        }
    }

    /// Register a bounded snapshot stream. Valid in every state; the stream
    /// ends once the sampler has stopped.
    pub fn subscribe(&self) -> Subscription {
        self.shared
            .registry
            .register(self.shared.config.buffer_capacity)
    }

    pub fn state(&self) -> SamplerState {
        let lifecycle = self
            .shared
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state_of(&lifecycle)
    }

    /// Tick loops currently alive (0 or 1).
    pub fn active_loops(&self) -> usize {
        self.shared.active_loops.load(Ordering::Acquire)
    }

    /// Snapshots produced since start.
    pub fn produced(&self) -> u64 {
        self.shared.produced.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Token cancelled when the sampler stops.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }
}

fn state_of(lifecycle: &Lifecycle) -> SamplerState {
    match lifecycle {
        Lifecycle::Idle => SamplerState::Idle,
        Lifecycle::Running(_) => SamplerState::Running,
        Lifecycle::Stopped(_) => SamplerState::Stopped,
    }
}

/// Tracks the live loop and closes the subscriber registry when it exits,
/// whichever way that happens.
struct LoopGuard {
    shared: Arc<Shared>,
}

impl LoopGuard {
    fn enter(shared: &Arc<Shared>) -> Self {
        shared.active_loops.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: Arc::clone(shared),
        }
    }
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        self.shared.registry.close();
        self.shared.active_loops.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn tick_loop(shared: Arc<Shared>) {
    let _guard = LoopGuard::enter(&shared);
    let period = shared.config.interval;
    let max_units = shared.config.max_units;
    let workers = Handle::current().metrics().num_workers();

    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut seq = 0u64;
    let mut last_timestamp = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let provider = Arc::clone(&shared.provider);
        let capture = tokio::task::spawn_blocking(move || provider.capture(max_units));
        let captured = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            joined = capture => joined,
        };

        match captured {
            Ok(Ok(raw)) => {
                seq += 1;
                last_timestamp = unix_ms_now().max(last_timestamp);
                let snapshot = Arc::new(assemble(seq, last_timestamp, raw, workers, max_units));
                let report = shared.registry.dispatch(&snapshot);
                shared.produced.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "snapshot #{seq}: {} units, delivered={} dropped={}",
                    snapshot.concurrency_count,
                    report.delivered,
                    report.dropped
                );
            }
            Ok(Err(e)) => {
                log::warn!("{} capture failed, skipping tick: {e}", shared.provider.name());
            }
            Err(e) => {
                log::error!("{} provider panicked, stopping sampler: {e}", shared.provider.name());
                shared.halt();
                break;
            }
        }
    }
    log::debug!("sampler loop exited after {seq} snapshots");
}

fn assemble(
    seq: u64,
    timestamp: u64,
    raw: RawStats,
    workers: usize,
    max_units: usize,
) -> SystemSnapshot {
    let mut units = raw.units;
    units.truncate(max_units);
    SystemSnapshot {
        seq,
        timestamp,
        concurrency_count: raw.concurrency_count,
        hardware_parallelism: raw.hardware_parallelism,
        scheduler_parallelism: raw.scheduler_parallelism.unwrap_or(workers),
        memory_stats: raw.memory,
        units,
        units_approximate: raw.units_approximate,
    }
}
