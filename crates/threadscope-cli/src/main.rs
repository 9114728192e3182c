//! CLI for threadscope — watch a process's threads and memory live.

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "threadscope")]
#[command(about = "threadscope — watch a process's threads and memory live")]
#[command(version = threadscope_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sample this process and push every snapshot to WebSocket viewers on /ws
    /// until Ctrl+C or SIGTERM
    Serve {
        /// Host to bind (default: 127.0.0.1)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (default: 8080)
        #[arg(long)]
        port: Option<u16>,

        /// Sampling interval in milliseconds (default: 1000)
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Maximum unit entries per snapshot (default: 50)
        #[arg(long)]
        max_units: Option<usize>,

        /// JSON config file; flags override its values
        #[arg(long)]
        config: Option<String>,
    },

    /// Capture one snapshot and print it as JSON
    Snapshot {
        /// Write the JSON to a file instead of stdout
        #[arg(long)]
        output: Option<String>,

        /// Maximum unit entries in the snapshot
        #[arg(long, default_value = "50")]
        max_units: usize,
    },

    /// Print a one-line summary per snapshot until Ctrl+C or SIGTERM
    Watch {
        /// Sampling interval in milliseconds
        #[arg(long, default_value = "1000")]
        interval_ms: u64,

        /// Stop after this many snapshots
        #[arg(long)]
        count: Option<u64>,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            host,
            port,
            interval_ms,
            max_units,
            config,
        } => commands::serve::run(commands::serve::Overrides {
            host,
            port,
            interval_ms,
            max_units,
            config,
        }),
        Commands::Snapshot { output, max_units } => {
            commands::snapshot::run(output.as_deref(), max_units)
        }
        Commands::Watch { interval_ms, count } => commands::watch::run(interval_ms, count),
    }
}
