use crate::config::policy::SandboxPolicy;
use crate::config::types::{SandboxError, SetupStage};
use crate::config::validator::JailLayout;
use crate::kernel::capabilities::CapabilityMask;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Host->sandbox init launch contract.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LaunchRequest {
    pub instance_id: String,
    /// Canonical host path of the jail root
    pub root: PathBuf,
    pub hostname: String,
    /// Program as a path inside the jail
    pub program: PathBuf,
    pub argv: Vec<String>,
    pub capability_set: CapabilityMask,
    pub env: BTreeMap<String, String>,
}

impl LaunchRequest {
    pub fn new(instance_id: &str, policy: &SandboxPolicy, layout: &JailLayout) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            root: layout.root.clone(),
            hostname: policy.hostname().to_string(),
            program: layout.program.clone(),
            argv: policy.command().to_vec(),
            capability_set: policy.capability_set(),
            env: policy.env().clone(),
        }
    }
}

/// Why the sandbox init could not run the command to completion.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InitFailure {
    /// An isolation step failed before the command's first instruction
    Setup { stage: SetupStage, message: String },
    /// The command itself could not be started
    Exec { message: String },
}

impl InitFailure {
    pub fn from_error(err: &SandboxError) -> Self {
        match err {
            SandboxError::IsolationSetupFailed { stage, message } => InitFailure::Setup {
                stage: *stage,
                message: message.clone(),
            },
            SandboxError::ExecutionFailed(message) => InitFailure::Exec {
                message: message.clone(),
            },
            other => InitFailure::Setup {
                stage: SetupStage::Supervision,
                message: other.to_string(),
            },
        }
    }

    pub fn into_error(self) -> SandboxError {
        match self {
            InitFailure::Setup { stage, message } => SandboxError::setup(stage, message),
            InitFailure::Exec { message } => SandboxError::ExecutionFailed(message),
        }
    }
}

/// Sandbox init->host status payload transferred through the status pipe.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProxyStatus {
    /// Payload pid inside the sandbox PID namespace
    pub payload_pid: Option<i32>,
    pub exit_code: Option<i32>,
    pub term_signal: Option<i32>,
    pub failure: Option<InitFailure>,
    /// `pivot_root` or `chroot`
    pub root_entry: Option<String>,
    /// Init received SIGTERM and killed the namespace
    pub cancelled: bool,
    pub reaped_descendants: u32,
    pub unmount_errors: Vec<String>,
}

/// Signal escalation report for watchdog and cancellation paths.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KillReport {
    pub term_sent: bool,
    pub kill_sent: bool,
    /// Init exited within the grace period after SIGTERM
    pub exited_after_term: bool,
    pub waited_ms: u64,
    pub notes: Vec<String>,
}
