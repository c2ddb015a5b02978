//! Run command - create a ublk memory disk and serve it until interrupted

use super::{format_size, parse_sectors, RunArgs};
use anyhow::{Context, Result};
use memdisk_ublk::host::{UblkHost, UblkHostConfig};
use memdisk_ublk::ublk::RealKernelShim;
use memdisk_core::{ClampPolicy, DeviceConfig, MemDisk, QueueParams};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Effective configuration: file values overridden by flags
pub fn build_config(args: &RunArgs) -> Result<DeviceConfig> {
    let mut config = match &args.config {
        Some(path) => DeviceConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DeviceConfig::default(),
    };

    if let Some(name) = &args.name {
        config.name = name.clone();
    }
    if let Some(size) = &args.size {
        config.capacity_sectors = Some(parse_sectors(size)?);
    }
    if args.strict {
        config.clamp_policy = ClampPolicy::Strict;
    }
    if let Some(depth) = args.queue_depth {
        config.queue_depth = depth;
    }
    if let Some(queues) = args.queues {
        config.nr_hw_queues = queues;
    }

    config.validate()?;
    Ok(config)
}

/// SIGINT/SIGTERM handler; a second signal exits immediately
fn setup_signal_handler() -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_clone = Arc::clone(&stop);

    ctrlc::set_handler(move || {
        if stop_clone.load(Ordering::Relaxed) {
            warn!("Received second interrupt, forcing exit");
            std::process::exit(1);
        }
        info!("Received shutdown signal, initiating graceful shutdown...");
        stop_clone.store(true, Ordering::Relaxed);
    })
    .context("installing signal handler")?;

    Ok(stop)
}

pub fn run(args: RunArgs) -> Result<()> {
    let config = build_config(&args)?;
    let size = config.capacity_sectors() * memdisk_core::SECTOR_SIZE;

    info!(
        device = %config.name,
        size = %format_size(size),
        clamp_policy = ?config.clamp_policy,
        nr_hw_queues = config.nr_hw_queues,
        queue_depth = config.queue_depth,
        "Creating memdisk device"
    );

    let stop = setup_signal_handler()?;

    let host = Arc::new(UblkHost::new(
        Arc::new(RealKernelShim::new()),
        UblkHostConfig {
            dev_id: args.dev_id,
            params: QueueParams::from_config(&config),
            ..Default::default()
        },
    ));

    let mut disk = MemDisk::create(Arc::clone(&host), &config)
        .with_context(|| format!("creating {}", config.name))?;

    if let Some(path) = host.block_dev_path() {
        println!("{path}");
    }

    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    let stats = disk.stats();
    disk.destroy()
        .with_context(|| format!("destroying {}", config.name))?;

    info!(
        reads = stats.reads,
        writes = stats.writes,
        bytes_read = stats.bytes_read,
        bytes_written = stats.bytes_written,
        "memdisk device removed"
    );
    Ok(())
}
