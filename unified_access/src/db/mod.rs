//! Database module
//!
//! This module handles the SQLite pool and the storage layout.

pub mod connection;
pub mod migrations;

// Re-export key types
pub use connection::{DatabaseConnection, WriteTransaction};
