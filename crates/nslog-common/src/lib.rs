//! nslog Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, configuration, checksum helpers
//! and identifier types used by the changelog store and its tools.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use config::{NamespaceConfig, StoreConfig};
pub use error::{Error, Result};
pub use types::*;
