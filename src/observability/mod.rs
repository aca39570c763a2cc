//! Observability
//!
//! Structured audit events for launches.

pub mod audit;
