//! memdisk-ublk - RAM-backed block device over ublk
//!
//! # Usage
//!
//! ```bash
//! # Serve a 100 MiB disk until Ctrl+C
//! memdisk-ublk run --name vdisk0 --size 100M
//!
//! # Check the device logic without kernel support
//! memdisk-ublk selftest
//! ```

mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => cli::run::run(args),
        Commands::Selftest(args) => cli::selftest::run(args),
    }
}
