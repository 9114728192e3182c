use std::time::Duration;

use threadscope_core::{Sampler, SamplerConfig, default_provider};
use tokio_util::sync::CancellationToken;

pub fn run(interval_ms: u64, count: Option<u64>) {
    let config = SamplerConfig::default().with_interval(Duration::from_millis(interval_ms));
    if let Err(e) = config.validate() {
        eprintln!("Error: {e}");
        std::process::exit(2);
    }

    let shutdown = super::shutdown_on_signal();
    let rt = super::runtime();
    let printed = rt.block_on(watch(config, count, shutdown));
    println!("{printed} snapshots");
}

async fn watch(config: SamplerConfig, count: Option<u64>, shutdown: CancellationToken) -> u64 {
    let sampler = Sampler::new(default_provider(), config);
    let mut snapshots = sampler.subscribe();
    if let Err(e) = sampler.start() {
        eprintln!("Error: {e}");
        return 0;
    }

    let mut printed = 0u64;
    while count.is_none_or(|limit| printed < limit) {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = snapshots.recv() => next,
        };
        let Some(snapshot) = next else { break };
        println!("{}", snapshot.summary());
        printed += 1;
    }

    sampler.shutdown().await;
    printed
}
