/// Namespace isolation for the sandbox init
/// The init is cloned straight into its namespaces; nothing here unshares the caller.
use crate::config::policy::SandboxPolicy;
use crate::config::types::{Result, SandboxError, SetupStage};

use nix::sched::CloneFlags;
use nix::unistd::sethostname;

/// Namespace set for one launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceIsolation {
    /// New network namespace with no interface configured
    enable_network_namespace: bool,
}

impl NamespaceIsolation {
    /// Mount, PID, UTS and IPC always; network when the policy isolates it
    pub fn for_policy(policy: &SandboxPolicy) -> Self {
        Self {
            enable_network_namespace: policy.network_isolated(),
        }
    }

    /// Check if namespace isolation is supported on this system
    pub fn is_supported() -> bool {
        std::fs::read_dir("/proc/self/ns").is_ok()
    }

    /// Flags passed to clone(2) for the sandbox init
    pub fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWIPC;
        if self.enable_network_namespace {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        flags
    }

    pub fn get_enabled_namespaces(&self) -> Vec<&'static str> {
        let mut namespaces = vec!["mount", "pid", "uts", "ipc"];
        if self.enable_network_namespace {
            namespaces.push("network");
        }
        namespaces
    }
}

/// Set the hostname inside the new UTS namespace.
pub fn apply_hostname(hostname: &str) -> Result<()> {
    sethostname(hostname).map_err(|e| {
        SandboxError::setup(
            SetupStage::Hostname,
            format!("sethostname({}) failed: {}", hostname, e),
        )
    })?;
    log::debug!("Hostname set to {}", hostname);
    Ok(())
}

/// mount(NULL, "/", NULL, MS_REC | MS_PRIVATE, NULL)
///
/// Must succeed before any other mount in the new namespace, otherwise the
/// sandbox mounts would propagate to the host.
pub fn harden_mount_propagation() -> Result<()> {
    use nix::mount::{mount, MsFlags};

    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| {
        SandboxError::setup(
            SetupStage::Mounts,
            format!("Failed to make / private (MS_PRIVATE|MS_REC): {}", e),
        )
    })?;

    log::debug!("Mount propagation hardened: / set to MS_PRIVATE|MS_REC");
    Ok(())
}
