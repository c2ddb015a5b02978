//! Device configuration.
//!
//! Loaded from TOML (or built in code) and validated before any host
//! resource is acquired.

use crate::error::{Error, Result};
use crate::{DEFAULT_CAPACITY_MB, SECTOR_SIZE};
use serde::Deserialize;
use std::path::Path;

/// Longest device name the host namespace accepts.
pub const MAX_NAME_LEN: usize = 31;

/// Largest queue depth a host queue may be built with.
pub const MAX_QUEUE_DEPTH: u16 = 4096;

/// Largest number of hardware queues.
pub const MAX_HW_QUEUES: u16 = 64;

/// What to do with a request that runs past the end of the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClampPolicy {
    /// Silently shorten the transfer to the bytes that fit.
    #[default]
    Truncate,
    /// Reject the whole request with an I/O error before copying anything.
    Strict,
}

/// Configuration for the memory disk.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    /// Name published in the host device namespace.
    pub name: String,
    /// Capacity in MiB, used when `capacity_sectors` is not set.
    pub capacity_mb: u64,
    /// Exact capacity in sectors; overrides `capacity_mb`.
    pub capacity_sectors: Option<u64>,
    /// Logical sector size in bytes. Only 512 is supported.
    pub sector_size: u32,
    /// Out-of-bounds handling for the request servicer.
    pub clamp_policy: ClampPolicy,
    /// Tags per hardware queue.
    pub queue_depth: u16,
    /// Number of hardware dispatch queues.
    pub nr_hw_queues: u16,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "memdisk0".to_string(),
            capacity_mb: DEFAULT_CAPACITY_MB,
            capacity_sectors: None,
            sector_size: SECTOR_SIZE as u32,
            clamp_policy: ClampPolicy::Truncate,
            queue_depth: 128,
            nr_hw_queues: 1,
        }
    }
}

impl DeviceConfig {
    /// Default configuration with a given name and size in MiB.
    pub fn new(name: impl Into<String>, capacity_mb: u64) -> Self {
        Self {
            name: name.into(),
            capacity_mb,
            ..Default::default()
        }
    }

    /// Same configuration with an exact sector count.
    pub fn with_capacity_sectors(mut self, sectors: u64) -> Self {
        self.capacity_sectors = Some(sectors);
        self
    }

    /// Same configuration with a different clamp policy.
    pub fn with_clamp_policy(mut self, policy: ClampPolicy) -> Self {
        self.clamp_policy = policy;
        self
    }

    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Capacity in sectors.
    pub fn capacity_sectors(&self) -> u64 {
        self.capacity_sectors
            .unwrap_or_else(|| self.capacity_mb.saturating_mul(1024 * 1024) / SECTOR_SIZE)
    }

    /// Check every field against host limits.
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;

        if self.sector_size as u64 != SECTOR_SIZE {
            return Err(Error::InvalidConfig(format!(
                "sector_size must be {}, got {}",
                SECTOR_SIZE, self.sector_size
            )));
        }
        if self.capacity_sectors() == 0 {
            return Err(Error::InvalidConfig("capacity must be at least one sector".into()));
        }
        if self.queue_depth == 0 || self.queue_depth > MAX_QUEUE_DEPTH {
            return Err(Error::InvalidConfig(format!(
                "queue_depth must be in 1..={}, got {}",
                MAX_QUEUE_DEPTH, self.queue_depth
            )));
        }
        if self.nr_hw_queues == 0 || self.nr_hw_queues > MAX_HW_QUEUES {
            return Err(Error::InvalidConfig(format!(
                "nr_hw_queues must be in 1..={}, got {}",
                MAX_HW_QUEUES, self.nr_hw_queues
            )));
        }
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidConfig(format!(
            "name must be 1..={} bytes, got {}",
            MAX_NAME_LEN,
            name.len()
        )));
    }
    if !name.bytes().all(|b| b.is_ascii_graphic() && b != b'/') {
        return Err(Error::InvalidConfig(format!("name {:?} contains invalid characters", name)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DeviceConfig::default();
        assert_eq!(config.name, "memdisk0");
        assert_eq!(config.capacity_sectors(), 204_800);
        assert_eq!(config.sector_size, 512);
        assert_eq!(config.clamp_policy, ClampPolicy::Truncate);
        assert_eq!(config.queue_depth, 128);
        assert_eq!(config.nr_hw_queues, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_capacity_sectors_override() {
        let config = DeviceConfig::new("vdisk0", 100).with_capacity_sectors(8);
        assert_eq!(config.capacity_sectors(), 8);
    }

    #[test]
    fn test_from_toml_full() {
        let config = DeviceConfig::from_toml_str(
            r#"
            name = "vdisk0"
            capacity_mb = 16
            clamp_policy = "strict"
            queue_depth = 64
            nr_hw_queues = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.name, "vdisk0");
        assert_eq!(config.capacity_sectors(), 16 * 2048);
        assert_eq!(config.clamp_policy, ClampPolicy::Strict);
        assert_eq!(config.queue_depth, 64);
        assert_eq!(config.nr_hw_queues, 2);
    }

    #[test]
    fn test_from_toml_defaults() {
        let config = DeviceConfig::from_toml_str("").unwrap();
        assert_eq!(config.name, "memdisk0");
        assert_eq!(config.capacity_mb, DEFAULT_CAPACITY_MB);
    }

    #[test]
    fn test_from_toml_unknown_field() {
        let err = DeviceConfig::from_toml_str("colour = \"blue\"").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_from_toml_bad_policy() {
        let err = DeviceConfig::from_toml_str("clamp_policy = \"maybe\"").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = DeviceConfig::new("vdisk0", 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_sector_size() {
        let config = DeviceConfig {
            sector_size: 4096,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_names() {
        assert!(DeviceConfig::new("", 1).validate().is_err());
        assert!(DeviceConfig::new("a/b", 1).validate().is_err());
        assert!(DeviceConfig::new("has space", 1).validate().is_err());
        assert!(DeviceConfig::new("x".repeat(MAX_NAME_LEN + 1), 1).validate().is_err());
        assert!(DeviceConfig::new("x".repeat(MAX_NAME_LEN), 1).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_queue_params() {
        let config = DeviceConfig {
            queue_depth: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = DeviceConfig {
            nr_hw_queues: MAX_HW_QUEUES + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = DeviceConfig::load(Path::new("/nonexistent/memdisk.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/memdisk.toml"));
    }
}
