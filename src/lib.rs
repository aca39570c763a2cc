//! jailbox: run a command confined by namespaces, cgroups and capabilities
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::namespace`]: clone flags and hostname for the sandbox namespaces
//! - [`kernel::cgroup`]: v2/v1 resource controller backends, limits and evidence
//! - [`kernel::capabilities`]: capability masks, restriction and verification
//! - [`kernel::mount`]: pseudo filesystems and root entry
//! - [`kernel::privilege`]: ambient privilege of the launcher
//! - [`kernel::signal`]: signal handling for the launcher and the sandbox init
//!
//! ## Execution Control ([`exec`])
//! - [`exec::preexec`]: type-state confinement chain ending in exec
//!
//! ## Core ([`core`])
//! - [`core::launcher`]: [`Launcher`], [`SandboxHandle`], [`CancellationToken`]
//! - [`core::supervisor`]: host side clone, release and poll loop
//! - [`core::proxy`]: the sandbox init (PID 1 of the sandbox)
//!
//! ## Results, Cleanup, Audit
//! - [`verdict::reporter`]: termination classification and result assembly
//! - [`safety::cleanup`]: resource ledger with reverse-order teardown
//! - [`observability::audit`]: JSON audit events
//!
//! ## Configuration & Policy ([`config`])
//! - [`config::policy`]: [`RawPolicy`](config::policy::RawPolicy) to validated
//!   [`SandboxPolicy`](config::policy::SandboxPolicy)
//! - [`config::loader`]: host-level [`LauncherConfig`](config::loader::LauncherConfig)
//! - [`config::validator`]: root filesystem preflight
//! - [`config::types`]: errors and result types
//!
//! # Example
//!
//! ```no_run
//! use jailbox::config::loader::LauncherConfig;
//! use jailbox::config::policy::{RawPolicy, SandboxPolicy};
//! use jailbox::kernel::privilege::PrivilegeContext;
//! use jailbox::{CancellationToken, Launcher};
//!
//! # fn main() -> jailbox::Result<()> {
//! let mut raw = RawPolicy::new("/srv/jail", vec!["/bin/echo".into(), "hi".into()]);
//! raw.memory_limit = "128M".into();
//! let policy = SandboxPolicy::from_raw(raw)?;
//!
//! let launcher = Launcher::new(LauncherConfig::default(), PrivilegeContext::probe()?);
//! let result = launcher.launch(&policy, &CancellationToken::new())?;
//! println!("exit code {}", result.exit_code);
//! # Ok(())
//! # }
//! ```

// Kernel Primitives
pub mod kernel;

// Execution Control
pub mod exec;

// Sandbox core
pub mod core;

// Result classification
pub mod verdict;

// Safety & Cleanup
pub mod safety;

// Observability
pub mod observability;

// Configuration & Policy
pub mod config;

// CLI entrypoint wiring for the jailbox binary.
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;
pub use crate::core::launcher::{CancellationToken, Launcher, SandboxHandle};
