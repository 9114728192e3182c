//! Basic sampling example.
//!
//! Samples this process every 500ms and prints a summary line for each of
//! the first five snapshots, plus the busiest thread locations.
//!
//! Run: `cargo run --example basic`

use std::time::Duration;

use threadscope_core::{Sampler, SamplerConfig, default_provider};

#[tokio::main]
async fn main() -> Result<(), threadscope_core::SamplerError> {
    let provider = default_provider();
    println!("Provider: {}", provider.name());

    let config = SamplerConfig::default().with_interval(Duration::from_millis(500));
    let sampler = Sampler::new(provider, config);
    let mut snapshots = sampler.subscribe();
    sampler.start()?;

    for _ in 0..5 {
        let Some(snap) = snapshots.recv().await else {
            break;
        };
        println!("{}", snap.summary());
        for unit in snap.units.iter().take(3) {
            println!("    {:>8} {:<10} {}", unit.id, unit.state, unit.location);
        }
    }

    sampler.shutdown().await;
    println!("\n{} snapshots produced", sampler.produced());
    Ok(())
}
