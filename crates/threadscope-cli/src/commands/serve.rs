use std::path::Path;
use std::time::Duration;

use threadscope_core::ConfigError;
use threadscope_server::ServerConfig;

/// Flag values that replace file or default settings when present.
#[derive(Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub interval_ms: Option<u64>,
    pub max_units: Option<usize>,
    pub config: Option<String>,
}

/// Defaults, then the config file, then flags.
pub fn resolve(overrides: Overrides) -> Result<ServerConfig, ConfigError> {
    let mut config = match overrides.config.as_deref() {
        Some(path) => ServerConfig::load(Path::new(path))?,
        None => ServerConfig::default(),
    };
    if let Some(host) = overrides.host {
        config.host = host;
    }
    if let Some(port) = overrides.port {
        config.port = port;
    }
    if let Some(ms) = overrides.interval_ms {
        config.sampler.interval = Duration::from_millis(ms);
    }
    if let Some(n) = overrides.max_units {
        config.sampler.max_units = n;
    }
    config.validate()?;
    Ok(config)
}

pub fn run(overrides: Overrides) {
    let config = match resolve(overrides) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    };

    let base = format!("{}:{}", config.host, config.port);
    println!("threadscope v{}", threadscope_core::VERSION);
    println!("   http://{base}");
    println!();
    println!("   Endpoints:");
    println!("     GET /        API index (try: curl http://{base})");
    println!("     GET /ws      WebSocket stream, one JSON snapshot per tick");
    println!("     GET /health  Sampler and session health");
    println!();
    println!(
        "   Sampling every {}ms, up to {} units per snapshot",
        config.sampler.interval.as_millis(),
        config.sampler.max_units
    );
    println!("   Press Ctrl+C (or send SIGTERM) to stop.");
    println!();

    let shutdown = super::shutdown_on_signal();
    let rt = super::runtime();
    if let Err(e) = rt.block_on(threadscope_server::run_server(config, shutdown)) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
