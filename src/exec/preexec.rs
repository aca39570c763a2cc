use crate::config::types::{Result, SandboxError, SetupStage};
use crate::config::validator::SANDBOX_PATH;
/// Pre-Exec Ordering Enforcement
///
/// The confinement sequence is fixed:
/// 1. sandbox init starts inside its new namespaces (clone flags), parent-death signal set
/// 2. hostname set in the UTS namespace
/// 3. mount propagation hardened: / set to MS_PRIVATE | MS_REC
/// 4. cgroup attachment confirmed (the supervisor attaches, then releases the init)
/// 5. root bound, pseudo filesystems mounted, root entered (pivot_root, chroot fallback)
/// 6. payload forked; capabilities restricted to the policy set, no_new_privs locked
/// 7. environment sanitized
/// 8. exec payload
use crate::kernel::capabilities::{restrict_to_mask, CapabilityMask};
use crate::kernel::mount::{FilesystemSecurity, RootEntry};
use std::collections::BTreeMap;
use std::ffi::CString;
use std::marker::PhantomData;

/// Value the sandbox init gives itself so the OOM killer picks the payload.
pub const INIT_OOM_SCORE_ADJ: i32 = -1000;

/// Write /proc/self/oom_score_adj.
pub fn set_oom_score_adj(value: i32) -> Result<()> {
    std::fs::write("/proc/self/oom_score_adj", value.to_string()).map_err(|e| {
        SandboxError::setup(
            SetupStage::Supervision,
            format!("Failed to set oom_score_adj={}: {}", value, e),
        )
    })
}

fn apply_exec_environment(env_map: &BTreeMap<String, String>) -> Result<()> {
    let env_error = |message: String| SandboxError::ExecutionFailed(message);

    // SAFETY: clearenv is called in the single-threaded payload child.
    let clear_rc = unsafe { libc::clearenv() };
    if clear_rc != 0 {
        return Err(env_error(format!(
            "clearenv failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    for (key, value) in env_map {
        let key_c = CString::new(key.as_str())
            .map_err(|_| env_error(format!("Environment key contains NUL byte: {}", key)))?;
        let value_c = CString::new(value.as_str())
            .map_err(|_| env_error(format!("Environment value for {} contains NUL byte", key)))?;

        // SAFETY: both pointers are valid NUL-terminated strings; single-threaded child.
        let rc = unsafe { libc::setenv(key_c.as_ptr(), value_c.as_ptr(), 1) };
        if rc != 0 {
            return Err(env_error(format!(
                "setenv failed for {}: {}",
                key,
                std::io::Error::last_os_error()
            )));
        }
    }

    Ok(())
}

/// Environment the payload starts with: fixed PATH and HOME, then policy overrides.
pub fn sandbox_environment(policy_env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("PATH".to_string(), SANDBOX_PATH.to_string());
    env.insert("HOME".to_string(), "/".to_string());
    for (key, value) in policy_env {
        env.insert(key.clone(), value.clone());
    }
    env
}

// ============================================================================
// Parent Death Signal Setup
// ============================================================================

/// Setup parent death signal for the sandbox init
/// Must be called first thing in the cloned child
pub fn setup_parent_death_signal() -> Result<()> {
    use nix::sys::prctl;
    use nix::sys::signal::Signal;

    // Sandbox init receives SIGKILL if the supervisor dies
    prctl::set_pdeathsig(Signal::SIGKILL).map_err(|e| {
        SandboxError::setup(
            SetupStage::Supervision,
            format!("Failed to set parent death signal: {}", e),
        )
    })?;

    log::debug!("Parent death signal (SIGKILL) configured");
    Ok(())
}

// ============================================================================
// Type-State Confinement Chain
// ============================================================================
//
// NamespacesEntered -> MountsPrivate -> CgroupAttached -> RootEntered
//   (sandbox init; forks the payload here)
// RootEntered -> CapsRestricted -> ExecReady -> exec
//   (payload child)
//
// Each step consumes the prior state. Only Confinement<ExecReady> can exec.

/// Type-state marker: running inside fresh namespaces, nothing else done
pub struct NamespacesEntered;

/// Type-state marker: mount propagation has been hardened
pub struct MountsPrivate;

/// Type-state marker: process confirmed inside its launch cgroup
pub struct CgroupAttached;

/// Type-state marker: jail root is the process root
pub struct RootEntered;

/// Type-state marker: capability sets restricted, no_new_privs set
pub struct CapsRestricted;

/// Type-state marker: ready for exec (all gates passed)
pub struct ExecReady;

/// Confinement progress of the current process.
///
/// Exec is only reachable from the `ExecReady` state:
///
/// ```compile_fail
/// use jailbox::exec::preexec::{Confinement, NamespacesEntered};
///
/// let fresh = Confinement::<NamespacesEntered>::entered("demo");
/// let _ = fresh.exec("/bin/true", &["true".to_string()]);
/// ```
///
/// and capabilities cannot be restricted before the root is entered:
///
/// ```compile_fail
/// use jailbox::exec::preexec::{Confinement, NamespacesEntered};
/// use jailbox::kernel::capabilities::CapabilityMask;
///
/// let fresh = Confinement::<NamespacesEntered>::entered("demo");
/// let _ = fresh.restrict_capabilities(CapabilityMask::audit_only());
/// ```
///
/// The full chain, as run by the sandbox init and its payload child:
///
/// ```no_run
/// use jailbox::exec::preexec::{Confinement, NamespacesEntered};
/// use jailbox::kernel::capabilities::CapabilityMask;
/// use jailbox::kernel::mount::FilesystemSecurity;
/// use std::collections::BTreeMap;
///
/// # fn main() -> jailbox::Result<()> {
/// let mut fs = FilesystemSecurity::new("/srv/jail");
/// let (rooted, _entry) = Confinement::<NamespacesEntered>::entered("demo")
///     .set_hostname("jailbox")?
///     .make_mounts_private()?
///     .confirm_cgroup_attached()?
///     .enter_root(&mut fs)?;
/// let ready = rooted
///     .restrict_capabilities(CapabilityMask::audit_only())?
///     .prepare_environment(&BTreeMap::new())?;
/// let err = ready.exec("/bin/true", &["true".to_string()]);
/// # Err(err)
/// # }
/// ```
pub struct Confinement<S> {
    /// Launch instance identifier (the cgroup name)
    instance_id: String,
    /// Type-state marker (zero-sized)
    _state: PhantomData<S>,
}

impl<S> Confinement<S> {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn advance<T>(self) -> Confinement<T> {
        Confinement {
            instance_id: self.instance_id,
            _state: PhantomData,
        }
    }
}

impl Confinement<NamespacesEntered> {
    /// Start the chain in a process created with the sandbox clone flags
    pub fn entered(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            _state: PhantomData,
        }
    }

    pub fn set_hostname(self, hostname: &str) -> Result<Self> {
        crate::kernel::namespace::apply_hostname(hostname)?;
        Ok(self)
    }

    /// Harden mount propagation before any mount operations
    pub fn make_mounts_private(self) -> Result<Confinement<MountsPrivate>> {
        crate::kernel::namespace::harden_mount_propagation()?;
        Ok(self.advance())
    }
}

impl Confinement<MountsPrivate> {
    /// Check /proc/self/cgroup for this launch's group. The supervisor attaches
    /// the init before releasing it, so a miss means the barrier was skipped.
    pub fn confirm_cgroup_attached(self) -> Result<Confinement<CgroupAttached>> {
        let membership = std::fs::read_to_string("/proc/self/cgroup").map_err(|e| {
            SandboxError::setup(SetupStage::Cgroup, format!("cannot read /proc/self/cgroup: {}", e))
        })?;
        if !cgroup_membership_contains(&membership, &self.instance_id) {
            return Err(SandboxError::setup(
                SetupStage::Cgroup,
                format!("sandbox init is not inside cgroup {}", self.instance_id),
            ));
        }
        log::debug!("Confirmed cgroup membership for {}", self.instance_id);
        Ok(self.advance())
    }
}

/// True when any hierarchy line of /proc/self/cgroup ends in `instance_id`.
pub fn cgroup_membership_contains(membership: &str, instance_id: &str) -> bool {
    membership.lines().any(|line| {
        line.rsplit(':')
            .next()
            .map(|path| path.trim_end_matches('/').rsplit('/').next() == Some(instance_id))
            .unwrap_or(false)
    })
}

impl Confinement<CgroupAttached> {
    /// Bind the root, mount pseudo filesystems into it and make it the process root.
    /// Runs after cgroup attach so host cgroup paths are still visible during the check.
    pub fn enter_root(
        self,
        fs_security: &mut FilesystemSecurity,
    ) -> Result<(Confinement<RootEntered>, RootEntry)> {
        fs_security.ensure_mount_points()?;
        fs_security.bind_root()?;
        fs_security.mount_pseudo_filesystems()?;
        let entry = fs_security.enter_root()?;
        Ok((self.advance(), entry))
    }
}

impl Confinement<RootEntered> {
    /// Reduce every capability set to `mask` and lock no_new_privs.
    pub fn restrict_capabilities(self, mask: CapabilityMask) -> Result<Confinement<CapsRestricted>> {
        restrict_to_mask(mask)?;
        log::debug!("Capabilities restricted to {}", mask);
        Ok(self.advance())
    }
}

impl Confinement<CapsRestricted> {
    /// Replace the inherited environment and move to the jail's `/`.
    pub fn prepare_environment(
        self,
        policy_env: &BTreeMap<String, String>,
    ) -> Result<Confinement<ExecReady>> {
        apply_exec_environment(&sandbox_environment(policy_env))?;
        std::env::set_current_dir("/")
            .map_err(|e| SandboxError::ExecutionFailed(format!("chdir / failed: {}", e)))?;
        Ok(self.advance())
    }
}

impl Confinement<ExecReady> {
    /// Execute the payload. Only returns on failure.
    pub fn exec(self, program: &str, argv: &[String]) -> SandboxError {
        let to_cstring = |arg: &str| {
            CString::new(arg)
                .map_err(|_| SandboxError::ExecutionFailed("command contains NUL byte".to_string()))
        };
        let program_c = match to_cstring(program) {
            Ok(c) => c,
            Err(e) => return e,
        };
        let cargv: Vec<CString> = match argv.iter().map(|a| to_cstring(a)).collect() {
            Ok(v) => v,
            Err(e) => return e,
        };

        match nix::unistd::execv(&program_c, &cargv) {
            Err(errno) => {
                SandboxError::ExecutionFailed(format!("execv {} failed: {}", program, errno))
            }
            Ok(never) => match never {},
        }
    }
}
