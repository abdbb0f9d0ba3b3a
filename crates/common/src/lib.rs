//! Ubergang Common Library
//!
//! Shared types, storage, and utilities for the Ubergang gateway.

pub mod db;
pub mod error;
pub mod ids;
pub mod models;
pub mod password;

// Re-export commonly used types
pub use db::Db;
pub use error::{Error, Result};
pub use models::*;

/// Ubergang version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    std::env::var_os("HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".ubergang")
}

/// Default database path
pub fn default_db_path() -> std::path::PathBuf {
    default_store_path().join("ubergang.db")
}
