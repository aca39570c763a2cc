/// Core types and structures for the jailbox launcher
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Exit code reported when the command was killed by a resource limit or by
/// cancellation. No process can produce it through `exit(2)`.
pub const FORCED_TERMINATION_EXIT_CODE: i32 = -1;

/// Isolation setup stage, used to say where a launch broke down.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SetupStage {
    Privileges,
    Cgroup,
    Namespaces,
    Hostname,
    Mounts,
    RootTransition,
    Capabilities,
    Supervision,
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SetupStage::Privileges => "privileges",
            SetupStage::Cgroup => "cgroup",
            SetupStage::Namespaces => "namespaces",
            SetupStage::Hostname => "hostname",
            SetupStage::Mounts => "mounts",
            SetupStage::RootTransition => "root_transition",
            SetupStage::Capabilities => "capabilities",
            SetupStage::Supervision => "supervision",
        };
        f.write_str(name)
    }
}

/// Custom error types for jailbox
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("Jail not provisioned at {}: {reason}", path.display())]
    JailNotProvisioned { path: PathBuf, reason: String },

    #[error("Isolation setup failed ({stage}): {message}")]
    IsolationSetupFailed { stage: SetupStage, message: String },

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub fn setup(stage: SetupStage, message: impl Into<String>) -> Self {
        SandboxError::IsolationSetupFailed {
            stage,
            message: message.into(),
        }
    }

    /// Stable, machine-readable kind name.
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::InvalidPolicy(_) => "invalid_policy",
            SandboxError::JailNotProvisioned { .. } => "jail_not_provisioned",
            SandboxError::IsolationSetupFailed { .. } => "isolation_setup_failed",
            SandboxError::ExecutionFailed(_) => "execution_failed",
            SandboxError::Config(_) => "config",
            SandboxError::Io(_) => "io",
        }
    }

    /// Launch errors are terminal for the attempt; retry policy belongs to the caller.
    pub fn is_retryable(&self) -> bool {
        false
    }
}

/// Convert launch errors to process exit codes (sysexits.h where one fits)
impl From<&SandboxError> for i32 {
    fn from(err: &SandboxError) -> i32 {
        match err {
            SandboxError::InvalidPolicy(_) => 64,             // EX_USAGE
            SandboxError::JailNotProvisioned { .. } => 69,    // EX_UNAVAILABLE
            SandboxError::IsolationSetupFailed { .. } => 71,  // EX_OSERR
            SandboxError::ExecutionFailed(_) => 126,          // could not execute
            SandboxError::Config(_) => 78,                    // EX_CONFIG
            SandboxError::Io(_) => 74,                        // EX_IOERR
        }
    }
}

impl From<nix::errno::Errno> for SandboxError {
    fn from(err: nix::errno::Errno) -> Self {
        SandboxError::Io(std::io::Error::from(err))
    }
}

/// Result type alias for jailbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Which limit forced the command to stop
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    Memory,
    CpuTime,
    WallTime,
}

/// How the sandboxed command ended
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Termination {
    /// Command exited on its own
    Exited { code: i32 },
    /// Command died of a signal it was not sent by the launcher or the kernel limit
    Signaled { signal: i32 },
    /// Killed by the resource controller or a launcher watchdog
    LimitExceeded { limit: LimitKind, signal: Option<i32> },
    /// Caller requested early termination
    Cancelled,
}

impl Termination {
    /// Exit code as reported to the caller.
    pub fn exit_code(&self) -> i32 {
        match self {
            Termination::Exited { code } => *code,
            Termination::Signaled { signal } => 128 + signal,
            Termination::LimitExceeded { .. } | Termination::Cancelled => {
                FORCED_TERMINATION_EXIT_CODE
            }
        }
    }

    pub fn signal(&self) -> Option<i32> {
        match self {
            Termination::Signaled { signal } => Some(*signal),
            Termination::LimitExceeded { signal, .. } => *signal,
            _ => None,
        }
    }
}

/// Limits that were hit during execution
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LimitsHit {
    pub memory: bool,
    pub cpu_time: bool,
    pub wall_time: bool,
}

impl LimitsHit {
    pub fn none(&self) -> bool {
        !(self.memory || self.cpu_time || self.wall_time)
    }
}

/// Cgroup evidence from resource accounting
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CgroupEvidence {
    /// Peak memory usage in bytes
    pub memory_peak: Option<u64>,
    /// Memory ceiling as read back from the controller
    pub memory_limit: Option<u64>,
    /// OOM events
    pub oom_events: u64,
    /// OOM kill events
    pub oom_kill_events: u64,
    /// CPU usage (microseconds)
    pub cpu_usage_usec: Option<u64>,
    /// Time spent throttled by the CPU quota (microseconds)
    pub cpu_throttled_usec: Option<u64>,
}

/// Resource usage summary attached to a result
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceUsage {
    pub cpu_usage_usec: u64,
    pub cpu_throttled_usec: u64,
    pub memory_peak_bytes: u64,
    pub oom_kill_events: u64,
}

impl From<&CgroupEvidence> for ResourceUsage {
    fn from(evidence: &CgroupEvidence) -> Self {
        Self {
            cpu_usage_usec: evidence.cpu_usage_usec.unwrap_or(0),
            cpu_throttled_usec: evidence.cpu_throttled_usec.unwrap_or(0),
            memory_peak_bytes: evidence.memory_peak.unwrap_or(0),
            oom_kill_events: evidence.oom_kill_events,
        }
    }
}

/// Outcome of tearing down a sandbox handle
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TeardownReport {
    /// Every recorded resource was released
    pub complete: bool,
    /// Resources released, in release order
    pub released: Vec<String>,
    pub errors: Vec<String>,
}

/// Execution result from a sandboxed command
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    /// Launch instance identifier (also the cgroup name)
    pub instance_id: String,
    pub termination: Termination,
    /// Exit code following the launcher's convention, see [`Termination::exit_code`]
    pub exit_code: i32,
    /// Terminating signal, if any
    pub signal: Option<i32>,
    /// Wall clock time from release of the command to its termination
    pub wall_time_ms: u64,
    pub limits_hit: LimitsHit,
    pub usage: ResourceUsage,
    pub teardown: TeardownReport,
}

impl ExecutionResult {
    pub fn wall_time(&self) -> Duration {
        Duration::from_millis(self.wall_time_ms)
    }

    /// Killed by the memory or CPU controller (or a launcher watchdog)
    /// rather than exiting on its own.
    pub fn is_resource_limit_terminated(&self) -> bool {
        matches!(self.termination, Termination::LimitExceeded { .. })
    }

    pub fn success(&self) -> bool {
        self.termination == Termination::Exited { code: 0 }
    }
}
