//! # threadscope-core
//!
//! **Watch a process's threads and memory while it runs.**
//!
//! `threadscope-core` samples the current process on a fixed interval and
//! fans every snapshot out to any number of subscribers without ever waiting
//! on a slow one.
//!
//! ## Quick Start
//!
//! ```no_run
//! use threadscope_core::{Sampler, SamplerConfig, default_provider};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), threadscope_core::SamplerError> {
//! let sampler = Sampler::new(default_provider(), SamplerConfig::default());
//! let mut snapshots = sampler.subscribe();
//! sampler.start()?;
//!
//! while let Some(snap) = snapshots.recv().await {
//!     println!("{}", snap.summary());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! StatsProvider → Sampler (tick loop) → Registry → Subscription
//!
//! - [`StatsProvider`] captures raw counters. [`ProcfsProvider`] attributes a
//!   real state to every thread on Linux; [`FallbackProvider`] synthesizes
//!   entries elsewhere and flags them approximate.
//! - [`Sampler`] owns the timer and assembles immutable [`SystemSnapshot`]s.
//! - [`Registry`] holds one bounded channel per subscriber. Delivery uses
//!   `try_send`: a full buffer loses that snapshot, nobody else notices.

pub mod config;
pub mod error;
mod procfs;
pub mod provider;
pub mod registry;
pub mod sampler;
pub mod snapshot;

pub use config::SamplerConfig;
pub use error::{ConfigError, ProviderError, SamplerError};
pub use provider::{
    FallbackProvider, ProcfsProvider, RawStats, StatsProvider, default_provider,
    hardware_parallelism,
};
pub use registry::{DispatchReport, Registry, SubscriberId, Subscription};
pub use sampler::{Sampler, SamplerState};
pub use snapshot::{SystemSnapshot, UnitInfo, UnitState};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
