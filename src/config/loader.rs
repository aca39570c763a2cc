//! Host-level launcher settings, loaded from a JSON file or defaulted.
use crate::config::types::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Launcher configuration shared by every launch on this host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LauncherConfig {
    /// Mount point of the cgroup hierarchy
    pub cgroup_root: PathBuf,
    /// Parent group under which per-launch groups are created
    pub cgroup_parent: String,
    /// Use the v1 backend even when cgroup v2 is mounted
    pub force_cgroup_v1: bool,
    /// Supervisor status poll interval
    pub poll_interval_ms: u64,
    /// Time the sandbox init gets to exit after a cancellation signal
    pub cancel_grace_ms: u64,
    /// Stack size for the cloned sandbox init
    pub init_stack_size: usize,
    /// CFS period used to express the CPU quota
    pub cpu_period_us: u64,
    /// Append audit events to this JSONL file
    pub audit_log: Option<PathBuf>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            cgroup_parent: "jailbox".to_string(),
            force_cgroup_v1: false,
            poll_interval_ms: 10,
            cancel_grace_ms: 200,
            init_stack_size: 1024 * 1024,
            cpu_period_us: 100_000,
            audit_log: None,
        }
    }
}

impl LauncherConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: LauncherConfig = serde_json::from_str(&content)
            .map_err(|e| SandboxError::Config(format!("Failed to parse config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cgroup_parent.is_empty()
            || self.cgroup_parent.contains('/')
            || self.cgroup_parent.starts_with('.')
        {
            return Err(SandboxError::Config(format!(
                "cgroup_parent '{}' must be a single path component",
                self.cgroup_parent
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(SandboxError::Config("poll_interval_ms must be > 0".to_string()));
        }
        if self.init_stack_size < 64 * 1024 {
            return Err(SandboxError::Config(
                "init_stack_size must be at least 64 KiB".to_string(),
            ));
        }
        if !(1000..=1_000_000).contains(&self.cpu_period_us) {
            return Err(SandboxError::Config(
                "cpu_period_us must be within [1000, 1000000]".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}
