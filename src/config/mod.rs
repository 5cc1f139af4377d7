//! Deployment Configuration Module
//!
//! Static deployment settings loaded from TOML: storage paths, backup
//! mechanics, model files, scheduler timing, simulation and logging.
//!
//! ## Loading Order
//!
//! 1. `GRIDWARDEN_CONFIG` environment variable (path to TOML file)
//! 2. `gridwarden.toml` in the current working directory
//! 3. Built-in defaults
//!
//! The loaded `AppConfig` is passed explicitly to the services that need it.
//! Operator-tunable values (cadences, retention, forecast bounds) are not
//! here; they live in the persisted [`crate::types::Settings`] record.

mod app_config;
pub mod defaults;
pub mod validation;

pub use app_config::*;
