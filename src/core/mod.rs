//! Sandbox core.
//!
//! Host side clones the sandbox init, attaches it to the launch cgroup,
//! releases it and supervises it; the init confines itself, runs the command
//! and reports back over a pipe.

pub mod launcher;
pub mod proxy;
pub mod supervisor;
pub mod types;

pub use launcher::{CancellationToken, Launcher, SandboxHandle};
