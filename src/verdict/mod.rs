//! Result classification
//!
//! Derives terminations as pure functions over supervision evidence.

pub mod reporter;
