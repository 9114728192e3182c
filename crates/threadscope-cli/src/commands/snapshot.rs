use std::sync::Arc;
use std::time::Duration;

use threadscope_core::{Sampler, SamplerConfig, SystemSnapshot, default_provider};

/// Capture one snapshot through a short-lived sampler.
async fn capture_one(max_units: usize) -> Result<Arc<SystemSnapshot>, String> {
    let config = SamplerConfig {
        interval: Duration::from_millis(10),
        max_units,
        ..SamplerConfig::default()
    };
    let sampler = Sampler::new(default_provider(), config);
    let mut snapshots = sampler.subscribe();
    sampler.start().map_err(|e| e.to_string())?;

    let first = tokio::time::timeout(Duration::from_secs(5), snapshots.recv()).await;
    sampler.shutdown().await;
    match first {
        Ok(Some(snapshot)) => Ok(snapshot),
        Ok(None) => Err("sampler stopped before producing a snapshot".to_string()),
        Err(_) => Err("no snapshot within 5s (provider failing?)".to_string()),
    }
}

pub fn run(output: Option<&str>, max_units: usize) {
    let rt = super::runtime();
    let snapshot = match rt.block_on(capture_one(max_units)) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let json = match serde_json::to_string_pretty(&*snapshot) {
        Ok(j) => j,
        Err(e) => {
            eprintln!("Error encoding snapshot: {e}");
            std::process::exit(1);
        }
    };

    match output {
        Some(path) => match std::fs::write(path, &json) {
            Ok(()) => println!("Snapshot written to {path}"),
            Err(e) => {
                eprintln!("Failed to write {path}: {e}");
                std::process::exit(1);
            }
        },
        None => println!("{json}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn captures_a_capped_snapshot() {
        let snap = capture_one(2).await.unwrap();
        assert_eq!(snap.seq, 1);
        assert!(snap.units.len() <= 2);
        assert!(snap.concurrency_count >= 1);
    }
}
