//! # UMIG Common Library
//!
//! Shared code for the UMIG import services:
//! - Error type and result alias
//! - Import event types and the broadcast EventBus
//! - TOML configuration and root folder resolution
//! - SQLite pool initialization
//! - SSE stream helpers

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod sse;

pub use error::{Error, Result};
