//! Thin wrappers around Linux kernel primitives.
//!
//! All `unsafe` code is concentrated here with explicit SAFETY comments.
//! Dependency direction: signal -> namespace -> mount -> capabilities -> privilege -> cgroup

pub mod capabilities;
pub mod cgroup;
pub mod fd;
pub mod mount;
pub mod namespace;
pub mod privilege;
pub mod signal;
