//! CLI module for memdisk-ublk

pub mod run;
pub mod selftest;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// memdisk-ublk - RAM-backed block device over ublk
#[derive(Parser)]
#[command(name = "memdisk-ublk")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a device and serve it until interrupted
    Run(RunArgs),

    /// Exercise the device in-process, without the kernel
    Selftest(SelftestArgs),
}

/// Run command arguments
#[derive(Parser)]
pub struct RunArgs {
    /// TOML device configuration
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Device name
    #[arg(short, long)]
    pub name: Option<String>,

    /// Device size (e.g., 100M, 2G, 4096K)
    #[arg(short, long)]
    pub size: Option<String>,

    /// Fail requests that run past the end instead of truncating them
    #[arg(long)]
    pub strict: bool,

    /// Tags per hardware queue
    #[arg(short = 'd', long)]
    pub queue_depth: Option<u16>,

    /// Number of hardware queues
    #[arg(short, long)]
    pub queues: Option<u16>,

    /// Requested ublk device id (default: kernel assigns)
    #[arg(long)]
    pub dev_id: Option<u32>,
}

/// Selftest command arguments
#[derive(Parser)]
pub struct SelftestArgs {
    /// Device size
    #[arg(short, long, default_value = "100M")]
    pub size: String,

    /// Device name
    #[arg(short, long, default_value = "vdisk0")]
    pub name: String,
}

/// Parse size string (e.g., "1T", "256G", "1024M")
pub fn parse_size(s: &str) -> anyhow::Result<u64> {
    let s = s.trim().to_uppercase();
    let (num, multiplier) = if s.ends_with('T') || s.ends_with("TIB") {
        (s.trim_end_matches("TIB").trim_end_matches('T'), 1u64 << 40)
    } else if s.ends_with('G') || s.ends_with("GIB") {
        (s.trim_end_matches("GIB").trim_end_matches('G'), 1u64 << 30)
    } else if s.ends_with('M') || s.ends_with("MIB") {
        (s.trim_end_matches("MIB").trim_end_matches('M'), 1u64 << 20)
    } else if s.ends_with('K') || s.ends_with("KIB") {
        (s.trim_end_matches("KIB").trim_end_matches('K'), 1u64 << 10)
    } else {
        (s.as_str(), 1u64)
    };

    let num: u64 = num.trim().parse()?;
    num.checked_mul(multiplier)
        .ok_or_else(|| anyhow::anyhow!("size {s} overflows"))
}

/// Parse a size and convert it to whole sectors
pub fn parse_sectors(s: &str) -> anyhow::Result<u64> {
    let bytes = parse_size(s)?;
    let sector = memdisk_core::SECTOR_SIZE;
    if bytes == 0 || bytes % sector != 0 {
        anyhow::bail!("size {s} is not a non-zero multiple of {sector} bytes");
    }
    Ok(bytes / sector)
}

/// Format bytes as human-readable string
pub fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;
    const TIB: u64 = GIB * 1024;

    if bytes >= TIB {
        format!("{:.1}T", bytes as f64 / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.1}G", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1}M", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1}K", bytes as f64 / KIB as f64)
    } else {
        format!("{}B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Size parsing
    // ========================================================================

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("1T").unwrap(), 1u64 << 40);
        assert_eq!(parse_size("2TiB").unwrap(), 2u64 << 40);
        assert_eq!(parse_size("256G").unwrap(), 256u64 << 30);
        assert_eq!(parse_size("100M").unwrap(), 104_857_600);
        assert_eq!(parse_size("4k").unwrap(), 4096);
        assert_eq!(parse_size(" 512 ").unwrap(), 512);
    }

    #[test]
    fn test_parse_size_invalid() {
        assert!(parse_size("").is_err());
        assert!(parse_size("abc").is_err());
        assert!(parse_size("1.5G").is_err());
        assert!(parse_size("99999999T").is_err());
    }

    #[test]
    fn test_parse_sectors() {
        assert_eq!(parse_sectors("100M").unwrap(), 204_800);
        assert_eq!(parse_sectors("512").unwrap(), 1);
        assert!(parse_sectors("0").is_err());
        assert!(parse_sectors("1000").is_err());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0B");
        assert_eq!(format_size(1023), "1023B");
        assert_eq!(format_size(4096), "4.0K");
        assert_eq!(format_size(104_857_600), "100.0M");
        assert_eq!(format_size(3 << 30), "3.0G");
        assert_eq!(format_size(1 << 40), "1.0T");
    }

    // ========================================================================
    // Argument parsing
    // ========================================================================

    #[test]
    fn test_cli_run_args() {
        let cli = Cli::try_parse_from([
            "memdisk-ublk",
            "run",
            "--name",
            "vdisk0",
            "--size",
            "1G",
            "--strict",
            "-q",
            "4",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.name.as_deref(), Some("vdisk0"));
        assert_eq!(args.size.as_deref(), Some("1G"));
        assert!(args.strict);
        assert_eq!(args.queues, Some(4));
        assert!(args.config.is_none());
    }

    #[test]
    fn test_cli_selftest_defaults() {
        let cli = Cli::try_parse_from(["memdisk-ublk", "selftest"]).unwrap();
        let Commands::Selftest(args) = cli.command else {
            panic!("expected selftest");
        };
        assert_eq!(args.size, "100M");
        assert_eq!(args.name, "vdisk0");
    }

    #[test]
    fn test_cli_verify() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
