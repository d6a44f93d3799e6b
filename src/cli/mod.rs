//! Command-line interface module.
//!
//! This module provides the CLI functionality for:
//! - Batch directory loads
//! - The broker stream consumer
//! - Rollup rebuilds and tiered queries

pub mod commands;
pub mod handlers;

pub use handlers::{handle_consume, handle_load, handle_query, handle_rollup};
