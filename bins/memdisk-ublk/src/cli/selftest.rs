//! Selftest command - exercise a memory disk on the in-process host
//!
//! Creates the device on a `LoopbackHost`, checks zero fill, a round trip
//! at sector 0, the tail clamp at the last sector and the control stubs,
//! then tears it down.

use super::{format_size, parse_sectors, SelftestArgs};
use anyhow::{bail, Result};
use memdisk_core::{
    Completion, DeviceConfig, LoopbackHost, MemDisk, OpenMode, Request, SECTOR_SIZE,
};
use std::sync::Arc;

/// Outcome of one check
#[derive(Debug, Clone)]
pub struct Check {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

impl Check {
    fn new(name: &'static str, passed: bool, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed,
            detail: detail.into(),
        }
    }
}

/// Run every check; creation or teardown failures are errors
pub fn run_checks(name: &str, capacity_sectors: u64) -> Result<Vec<Check>> {
    let host = Arc::new(LoopbackHost::new());
    let config = DeviceConfig::new(name, 1).with_capacity_sectors(capacity_sectors);
    let mut disk = MemDisk::create(Arc::clone(&host), &config)?;
    let device = Arc::clone(disk.device());
    let dev_size = capacity_sectors * SECTOR_SIZE;
    let mut checks = Vec::new();

    checks.push(Check::new(
        "capacity",
        device.buffer_len() == Some(dev_size as usize)
            && host.capacity_of(name) == Some(capacity_sectors),
        format!("{capacity_sectors} sectors"),
    ));

    let zeroed = device
        .read_raw(0, dev_size as usize)
        .is_some_and(|raw| raw.iter().all(|&b| b == 0));
    checks.push(Check::new("zero fill", zeroed, format_size(dev_size)));

    let head = [0xAAu8; 512];
    let written = host.dispatch(name, &mut Request::write(0, vec![&head[..]]))?;
    let mut back = [0u8; 512];
    let read = host.dispatch(name, &mut Request::read(0, vec![&mut back[..]]))?;
    checks.push(Check::new(
        "round trip",
        written == Completion::ok(512) && read == Completion::ok(512) && back == head,
        format!("wrote {} read {}", written.transferred, read.transferred),
    ));

    let last = capacity_sectors - 1;
    let tail = [0xBBu8; 1024];
    let clamped = host.dispatch(name, &mut Request::write(last, vec![&tail[..]]))?;
    let tail_ok = device
        .read_raw(dev_size - SECTOR_SIZE, SECTOR_SIZE as usize)
        .is_some_and(|raw| raw.iter().all(|&b| b == 0xBB));
    checks.push(Check::new(
        "tail clamp",
        clamped == Completion::ok(SECTOR_SIZE) && tail_ok,
        format!("sector {last}: {} of 1024 bytes", clamped.transferred),
    ));

    let beyond = host.dispatch(name, &mut Request::write(capacity_sectors, vec![&tail[..]]))?;
    checks.push(Check::new(
        "beyond end",
        beyond == Completion::ok(0),
        format!("{} bytes", beyond.transferred),
    ));

    let mode = OpenMode::READ | OpenMode::WRITE;
    let opened = host.open(name, mode).is_ok() && host.release(name, mode).is_ok();
    let ioctl = host.ioctl(name, 0x1260, 0);
    checks.push(Check::new(
        "control stubs",
        opened && ioctl.is_err(),
        match &ioctl {
            Ok(v) => format!("ioctl returned {v}"),
            Err(e) => format!("ioctl: {e}"),
        },
    ));

    let stats = disk.stats();
    disk.destroy()?;
    checks.push(Check::new(
        "teardown",
        !device.is_live() && !host.is_registered(name) && !host.is_published(name),
        format!(
            "{} reads, {} writes, {} clamped",
            stats.reads, stats.writes, stats.clamped
        ),
    ));

    Ok(checks)
}

pub fn run(args: SelftestArgs) -> Result<()> {
    let sectors = parse_sectors(&args.size)?;
    tracing::info!(device = %args.name, size = %args.size, "Running selftest");

    let checks = run_checks(&args.name, sectors)?;
    for check in &checks {
        let mark = if check.passed { "ok" } else { "FAIL" };
        println!("{:<14} {:<4} {}", check.name, mark, check.detail);
    }

    let failed = checks.iter().filter(|c| !c.passed).count();
    if failed > 0 {
        bail!("{failed} of {} checks failed", checks.len());
    }
    println!("{} checks passed", checks.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selftest_small_device() {
        let checks = run_checks("st0", 64).unwrap();
        assert_eq!(checks.len(), 7);
        for check in &checks {
            assert!(check.passed, "{} failed: {}", check.name, check.detail);
        }
    }

    #[test]
    fn test_selftest_reference_size() {
        let checks = run_checks("vdisk0", 204_800).unwrap();
        assert!(checks.iter().all(|c| c.passed));
    }

    #[test]
    fn test_selftest_single_sector() {
        // Head and tail are the same sector.
        let checks = run_checks("st1", 1).unwrap();
        let round_trip = checks.iter().find(|c| c.name == "round trip").unwrap();
        assert!(round_trip.passed);
        let tail = checks.iter().find(|c| c.name == "tail clamp").unwrap();
        assert!(tail.passed);
    }

    #[test]
    fn test_selftest_invalid_name() {
        assert!(run_checks("bad/name", 8).is_err());
    }
}
