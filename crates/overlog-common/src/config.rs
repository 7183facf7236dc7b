//! Configuration types for overlog
//!
//! This module defines configuration structures used across components.
//! Every struct has a `Default` that is safe for production use and a
//! `validate` that rejects combinations the components cannot honour.

use crate::checksum::EXTENT_SIZE;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for overlog
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Metadata block store and directory configuration
    pub metadata: MetadataConfig,
    /// Container lifecycle configuration
    pub container: ContainerConfig,
    /// Record coalescing configuration
    pub coalesce: CoalesceConfig,
}

impl Config {
    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.metadata.validate()?;
        self.container.validate()?;
        self.coalesce.validate()
    }
}

/// Metadata block store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Section size of a shared container directory (default: 64 KB)
    pub shared_section_size: u32,
    /// Concurrent section reads while opening a directory
    pub open_read_window: usize,
    /// Keep validated sections in memory after open and write
    pub cache_sections: bool,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            shared_section_size: 64 * 1024, // 64 KB
            open_read_window: 16,
            cache_sections: true,
        }
    }
}

impl MetadataConfig {
    pub fn validate(&self) -> Result<()> {
        if u64::from(self.shared_section_size) % EXTENT_SIZE != 0 || self.shared_section_size < 8192 {
            return Err(Error::configuration(format!(
                "shared_section_size {} must be a multiple of 4096 and at least 8192",
                self.shared_section_size
            )));
        }
        if self.open_read_window == 0 {
            return Err(Error::configuration("open_read_window must be positive"));
        }
        Ok(())
    }
}

/// Container lifecycle configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Suffix appended to a container path while it is being created
    pub temp_suffix: String,
    /// Suffix appended to a container path to name its metadata file
    pub metadata_suffix: String,
    /// Directory holding id-addressed containers
    pub default_directory: PathBuf,
    /// Concurrent per-stream deletes while deleting a container
    pub stream_delete_concurrency: usize,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            temp_suffix: ".tmp".to_string(),
            metadata_suffix: ".mbinfo".to_string(),
            default_directory: PathBuf::from("/var/lib/overlog"),
            stream_delete_concurrency: 16,
        }
    }
}

impl ContainerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.temp_suffix.is_empty() || self.metadata_suffix.is_empty() {
            return Err(Error::configuration("container suffixes must not be empty"));
        }
        if self.temp_suffix == self.metadata_suffix {
            return Err(Error::configuration(
                "temp_suffix and metadata_suffix must differ",
            ));
        }
        if self.stream_delete_concurrency == 0 {
            return Err(Error::configuration(
                "stream_delete_concurrency must be positive",
            ));
        }
        Ok(())
    }
}

/// Record coalescing configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoalesceConfig {
    /// Data bytes a coalesced record may hold (default: 1 MB)
    pub max_record_size: u32,
    /// Under pressure, seal once less than this much room is left (default: 64 KB)
    pub padding_under_pressure: u32,
    /// Tick of the periodic flush timer (milliseconds)
    pub periodic_timer_interval_ms: u64,
    /// Age at which a partially filled buffer is flushed (milliseconds)
    pub periodic_flush_time_ms: u64,
    /// Budget for in-flight record buffers (default: 64 MB)
    pub memory_limit: u64,
    /// Share of the budget in use at which the engine reports pressure
    pub pressure_percent: u8,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            max_record_size: 1024 * 1024,       // 1 MB
            padding_under_pressure: 64 * 1024,  // 64 KB
            periodic_timer_interval_ms: 1000,
            periodic_flush_time_ms: 5000,
            memory_limit: 64 * 1024 * 1024,     // 64 MB
            pressure_percent: 80,
        }
    }
}

impl CoalesceConfig {
    #[must_use]
    pub const fn periodic_timer_interval(&self) -> Duration {
        Duration::from_millis(self.periodic_timer_interval_ms)
    }

    #[must_use]
    pub const fn periodic_flush_time(&self) -> Duration {
        Duration::from_millis(self.periodic_flush_time_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_record_size == 0 || u64::from(self.max_record_size) % EXTENT_SIZE != 0 {
            return Err(Error::configuration(format!(
                "max_record_size {} must be a positive multiple of 4096",
                self.max_record_size
            )));
        }
        if self.padding_under_pressure > self.max_record_size {
            return Err(Error::configuration(
                "padding_under_pressure must not exceed max_record_size",
            ));
        }
        if self.periodic_timer_interval_ms == 0 {
            return Err(Error::configuration(
                "periodic_timer_interval_ms must be positive",
            ));
        }
        // Two buffers must fit: one being filled while another flushes
        if self.memory_limit < 2 * u64::from(self.max_record_size) {
            return Err(Error::configuration(format!(
                "memory_limit {} must hold at least two records of {} bytes",
                self.memory_limit, self.max_record_size
            )));
        }
        if self.pressure_percent == 0 || self.pressure_percent > 100 {
            return Err(Error::configuration("pressure_percent must be in 1..=100"));
        }
        Ok(())
    }
}
