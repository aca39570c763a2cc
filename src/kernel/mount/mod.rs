//! Filesystem isolation and mount management
//!
//! Provides mount operations with tracking for deterministic teardown.

pub mod filesystem;

// Re-export commonly used items
pub use filesystem::*;
