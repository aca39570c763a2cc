//! Configuration and policy
//!
//! Launch policy, host configuration, preflight validation and shared types.

pub mod loader;
pub mod policy;
pub mod types;
pub mod validator;
