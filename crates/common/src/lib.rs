//! Adaptest Common Library
//!
//! Shared types, persistence and reliability scoring for the Adaptest
//! execution engine.

pub mod case;
pub mod db;
pub mod error;
pub mod reliability;
pub mod types;

// Re-export commonly used types
pub use db::{Database, RunStore};
pub use error::{Error, Result};
pub use reliability::{ReliabilityReport, DEFAULT_ADAPTATION_PENALTY};
pub use types::*;

/// Adaptest version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".adaptest")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
