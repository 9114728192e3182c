//! Server and per-session configuration.
//!
//! Values come from defaults, optionally a JSON file, then CLI overrides.
//! Durations are stored as milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use threadscope_core::ConfigError;
use threadscope_core::SamplerConfig;
use threadscope_core::config::duration_ms;

/// Keepalive and buffering for every connection session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Period of the keepalive probe.
    #[serde(rename = "ping_interval_ms", with = "duration_ms")]
    pub ping_interval: Duration,
    /// A peer that does not answer a probe within this window is dead.
    #[serde(rename = "read_deadline_ms", with = "duration_ms")]
    pub read_deadline: Duration,
    /// Upper bound on a single frame write.
    #[serde(rename = "write_timeout_ms", with = "duration_ms")]
    pub write_timeout: Duration,
    /// Snapshots buffered per session before new ones are dropped.
    pub outbound_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            read_deadline: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            outbound_capacity: 10,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ping_interval.is_zero() || self.write_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "ping interval and write timeout must be greater than zero".to_string(),
            ));
        }
        if self.read_deadline <= self.ping_interval {
            return Err(ConfigError::Invalid(format!(
                "read deadline ({:?}) must exceed ping interval ({:?})",
                self.read_deadline, self.ping_interval
            )));
        }
        if self.outbound_capacity == 0 {
            return Err(ConfigError::Invalid(
                "session outbound capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Everything `run_server` needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub sampler: SamplerConfig,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            sampler: SamplerConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Read a JSON config file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sampler.validate()?;
        self.session.validate()
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_keepalive_cadence() {
        let c = ServerConfig::default();
        assert_eq!(c.session.ping_interval, Duration::from_secs(30));
        assert_eq!(c.session.read_deadline, Duration::from_secs(60));
        assert_eq!(c.bind_addr(), "127.0.0.1:8080");
        c.validate().unwrap();
    }

    #[test]
    fn rejects_deadline_not_longer_than_ping() {
        let c = SessionConfig {
            read_deadline: Duration::from_secs(30),
            ..SessionConfig::default()
        };
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn loads_partial_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"{{"port": 9001, "sampler": {{"interval_ms": 500}}, "session": {{"ping_interval_ms": 1000, "read_deadline_ms": 3000}}}}"#
        )
        .unwrap();
        let c = ServerConfig::load(f.path()).unwrap();
        assert_eq!(c.port, 9001);
        assert_eq!(c.host, "127.0.0.1");
        assert_eq!(c.sampler.interval, Duration::from_millis(500));
        assert_eq!(c.session.read_deadline, Duration::from_secs(3));
        assert_eq!(c.session.write_timeout, Duration::from_secs(10));
    }

    #[test]
    fn load_reports_missing_file_and_bad_json() {
        let missing = Path::new("/definitely/not/here.json");
        assert!(matches!(
            ServerConfig::load(missing),
            Err(ConfigError::Read { .. })
        ));

        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "{{ not json").unwrap();
        assert!(matches!(
            ServerConfig::load(f.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn load_validates() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, r#"{{"sampler": {{"interval_ms": 0}}}}"#).unwrap();
        assert!(matches!(
            ServerConfig::load(f.path()),
            Err(ConfigError::Invalid(_))
        ));
    }
}
