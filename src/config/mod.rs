//! Configuration module for sync runs
//!
//! This module provides the `SyncConfig` struct and its type-safe builder
//! with validation and defaults.

// Sub-modules
pub mod builder;
pub mod getters;
pub mod methods;
pub mod types;

// Re-exports for public API
pub use builder::{SyncConfigBuilder, WithSiteUrl};
pub use types::{ConfigError, StageConcurrency, SyncConfig};
