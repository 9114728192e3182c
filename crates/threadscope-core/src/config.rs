//! Sampler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default sampling period.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
/// Default per-subscriber buffer, in snapshots.
pub const DEFAULT_BUFFER_CAPACITY: usize = 10;
/// Default cap on unit entries per snapshot.
pub const DEFAULT_MAX_UNITS: usize = 50;

/// Tunables for [`crate::Sampler`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Time between ticks. Serialized as `interval_ms`.
    #[serde(rename = "interval_ms", with = "duration_ms")]
    pub interval: Duration,
    /// Buffer size of every `subscribe()` stream.
    pub buffer_capacity: usize,
    /// Maximum `units` entries per snapshot.
    pub max_units: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            max_units: DEFAULT_MAX_UNITS,
        }
    }
}

impl SamplerConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::Invalid(
                "sampler interval must be greater than zero".to_string(),
            ));
        }
        if self.buffer_capacity == 0 {
            return Err(ConfigError::Invalid(
                "subscriber buffer capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serde adapter storing a [`Duration`] as whole milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
