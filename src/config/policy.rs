//! Launch policy: raw, caller-supplied settings and their validated form.
//!
//! A [`SandboxPolicy`] can only be obtained through [`SandboxPolicy::from_raw`],
//! so every value that reaches the launcher is already in range.

use crate::config::types::{Result, SandboxError};
use crate::kernel::capabilities::CapabilityMask;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CPU_QUOTA: &str = "100%";
pub const DEFAULT_MEMORY_LIMIT: &str = "256M";
pub const DEFAULT_IO_WEIGHT: u32 = 100;
pub const DEFAULT_HOSTNAME: &str = "jailbox";
pub const IO_WEIGHT_MIN: u32 = 10;
pub const IO_WEIGHT_MAX: u32 = 1000;
const HOSTNAME_MAX_LEN: usize = 64;
const HOSTNAME_LABEL_MAX_LEN: usize = 63;

/// Unvalidated launch settings, as read from JSON or assembled from CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RawPolicy {
    pub root_path: PathBuf,
    /// Percentage of one core, e.g. `"50%"` or `"250%"`
    pub cpu_quota: String,
    /// Byte size with optional binary suffix, e.g. `"128M"`
    pub memory_limit: String,
    pub io_weight: u32,
    pub network_isolated: bool,
    /// Capability names to retain; `None` keeps the audit-only default
    pub capabilities: Option<Vec<String>>,
    pub command: Vec<String>,
    pub hostname: String,
    pub cpu_time_limit_ms: Option<u64>,
    pub wall_time_limit_ms: Option<u64>,
    pub env: BTreeMap<String, String>,
}

impl Default for RawPolicy {
    fn default() -> Self {
        Self {
            root_path: PathBuf::new(),
            cpu_quota: DEFAULT_CPU_QUOTA.to_string(),
            memory_limit: DEFAULT_MEMORY_LIMIT.to_string(),
            io_weight: DEFAULT_IO_WEIGHT,
            network_isolated: true,
            capabilities: None,
            command: Vec::new(),
            hostname: DEFAULT_HOSTNAME.to_string(),
            cpu_time_limit_ms: None,
            wall_time_limit_ms: None,
            env: BTreeMap::new(),
        }
    }
}

impl RawPolicy {
    pub fn new(root_path: impl Into<PathBuf>, command: Vec<String>) -> Self {
        Self {
            root_path: root_path.into(),
            command,
            ..Self::default()
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            SandboxError::InvalidPolicy(format!("{}: {}", path.display(), e))
        })
    }
}

/// CPU bandwidth as a fraction of one core (`0.5` is half a core).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CpuQuota {
    fraction: f64,
}

impl CpuQuota {
    /// Parse `"50%"` (or a bare `"50"`, read as percent) and bound it by `host_cpus`.
    pub fn parse(input: &str, host_cpus: u32) -> Result<Self> {
        let trimmed = input.trim();
        let number = trimmed.strip_suffix('%').unwrap_or(trimmed).trim();
        let percent: f64 = number.parse().map_err(|_| {
            SandboxError::InvalidPolicy(format!("cpu_quota '{}' is not a percentage", input))
        })?;
        if !percent.is_finite() || percent <= 0.0 {
            return Err(SandboxError::InvalidPolicy(format!(
                "cpu_quota must be greater than 0%, got '{}'",
                input
            )));
        }
        let ceiling = 100.0 * f64::from(host_cpus.max(1));
        if percent > ceiling {
            return Err(SandboxError::InvalidPolicy(format!(
                "cpu_quota {}% exceeds {}% ({} host cores)",
                percent, ceiling, host_cpus
            )));
        }
        Ok(Self {
            fraction: percent / 100.0,
        })
    }

    pub fn fraction(&self) -> f64 {
        self.fraction
    }

    pub fn percent(&self) -> f64 {
        self.fraction * 100.0
    }

    /// Quota for one CFS period, never below the kernel's 1ms floor.
    pub fn quota_us(&self, period_us: u64) -> u64 {
        ((self.fraction * period_us as f64).round() as u64).max(1000)
    }
}

/// Parse a byte size such as `128M`, `1G`, `512KiB` or `1048576`. Suffixes are binary.
pub fn parse_memory_size(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split);
    let invalid = || SandboxError::InvalidPolicy(format!("memory_limit '{}' is not a size", input));

    let value: u64 = digits.parse().map_err(|_| invalid())?;
    let multiplier: u64 = match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        "T" | "TB" | "TIB" => 1 << 40,
        _ => return Err(invalid()),
    };
    let bytes = value.checked_mul(multiplier).ok_or_else(invalid)?;
    if bytes == 0 {
        return Err(SandboxError::InvalidPolicy(
            "memory_limit must be greater than zero".to_string(),
        ));
    }
    Ok(bytes)
}

/// Online CPUs on this host.
pub fn host_cpu_count() -> u32 {
    // SAFETY: sysconf only reads system configuration.
    let online = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if online > 0 {
        online as u32
    } else {
        std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1)
    }
}

/// Fully validated, immutable launch policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SandboxPolicy {
    root_path: PathBuf,
    cpu_quota: CpuQuota,
    memory_limit: u64,
    io_weight: u32,
    network_isolated: bool,
    capability_set: CapabilityMask,
    command: Vec<String>,
    hostname: String,
    cpu_time_limit: Option<Duration>,
    wall_time_limit: Option<Duration>,
    env: BTreeMap<String, String>,
}

impl SandboxPolicy {
    pub fn from_raw(raw: RawPolicy) -> Result<Self> {
        Self::from_raw_with_cpus(raw, host_cpu_count())
    }

    /// Validate against an explicit core count instead of the host's.
    pub fn from_raw_with_cpus(raw: RawPolicy, host_cpus: u32) -> Result<Self> {
        if raw.command.is_empty() || raw.command[0].is_empty() {
            return Err(SandboxError::InvalidPolicy("command must not be empty".to_string()));
        }
        if raw.command.iter().any(|arg| arg.contains('\0')) {
            return Err(SandboxError::InvalidPolicy(
                "command arguments must not contain NUL bytes".to_string(),
            ));
        }
        if raw.root_path.as_os_str().is_empty() {
            return Err(SandboxError::InvalidPolicy("root_path must be set".to_string()));
        }

        let cpu_quota = CpuQuota::parse(&raw.cpu_quota, host_cpus)?;
        let memory_limit = parse_memory_size(&raw.memory_limit)?;

        if !(IO_WEIGHT_MIN..=IO_WEIGHT_MAX).contains(&raw.io_weight) {
            return Err(SandboxError::InvalidPolicy(format!(
                "io_weight {} outside [{}, {}]",
                raw.io_weight, IO_WEIGHT_MIN, IO_WEIGHT_MAX
            )));
        }

        let capability_set = match &raw.capabilities {
            None => CapabilityMask::audit_only(),
            Some(names) => CapabilityMask::from_names(names).map_err(|unknown| {
                SandboxError::InvalidPolicy(format!("unknown capability '{}'", unknown))
            })?,
        };

        validate_hostname(&raw.hostname)?;
        validate_env(&raw.env)?;

        let cpu_time_limit = positive_millis("cpu_time_limit_ms", raw.cpu_time_limit_ms)?;
        let wall_time_limit = positive_millis("wall_time_limit_ms", raw.wall_time_limit_ms)?;

        Ok(Self {
            root_path: raw.root_path,
            cpu_quota,
            memory_limit,
            io_weight: raw.io_weight,
            network_isolated: raw.network_isolated,
            capability_set,
            command: raw.command,
            hostname: raw.hostname,
            cpu_time_limit,
            wall_time_limit,
            env: raw.env,
        })
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn cpu_quota(&self) -> CpuQuota {
        self.cpu_quota
    }

    pub fn memory_limit(&self) -> u64 {
        self.memory_limit
    }

    pub fn io_weight(&self) -> u32 {
        self.io_weight
    }

    pub fn network_isolated(&self) -> bool {
        self.network_isolated
    }

    pub fn capability_set(&self) -> CapabilityMask {
        self.capability_set
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn cpu_time_limit(&self) -> Option<Duration> {
        self.cpu_time_limit
    }

    pub fn wall_time_limit(&self) -> Option<Duration> {
        self.wall_time_limit
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }
}

fn positive_millis(field: &str, value: Option<u64>) -> Result<Option<Duration>> {
    match value {
        Some(0) => Err(SandboxError::InvalidPolicy(format!(
            "{} must be greater than zero",
            field
        ))),
        Some(ms) => Ok(Some(Duration::from_millis(ms))),
        None => Ok(None),
    }
}

/// One dot-separated label: alphanumerics and inner hyphens.
fn valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= HOSTNAME_LABEL_MAX_LEN
        && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        && !label.starts_with('-')
        && !label.ends_with('-')
}

fn validate_hostname(hostname: &str) -> Result<()> {
    let valid = !hostname.is_empty()
        && hostname.len() <= HOSTNAME_MAX_LEN
        && hostname.split('.').all(valid_label);
    if valid {
        Ok(())
    } else {
        Err(SandboxError::InvalidPolicy(format!(
            "hostname '{}' is not a valid host name",
            hostname
        )))
    }
}

fn validate_env(env: &BTreeMap<String, String>) -> Result<()> {
    for (key, value) in env {
        if key.is_empty() || key.contains('=') || key.contains('\0') || value.contains('\0') {
            return Err(SandboxError::InvalidPolicy(format!(
                "environment variable '{}' is malformed",
                key.replace('\0', "\\0")
            )));
        }
    }
    Ok(())
}
