//! overlog common - shared types and utilities
//!
//! This crate provides the error taxonomy, configuration structures,
//! section checksum helpers and identifier types used by every
//! overlog component.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{
    EXTENT_SIZE, data_checksum, round_up_4k, section_checksum, verify_section_checksum,
};
pub use config::{CoalesceConfig, Config, ContainerConfig, MetadataConfig};
pub use error::{Error, Result};
pub use types::*;
