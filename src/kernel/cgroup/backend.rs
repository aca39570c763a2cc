//! Cgroup backend abstraction for v1/v2 dual support.

use crate::config::loader::LauncherConfig;
use crate::config::types::{CgroupEvidence, Result, SandboxError, SetupStage};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

const REMOVE_ATTEMPTS: u32 = 50;
const REMOVE_BACKOFF: Duration = Duration::from_millis(10);

/// Limits written into a launch group before the sandbox init runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu_quota_us: u64,
    pub cpu_period_us: u64,
    pub memory_bytes: u64,
    pub io_weight: u32,
}

pub trait CgroupBackend: Send + Sync {
    fn backend_name(&self) -> &str;
    /// Make the parent group usable (controller delegation on v2).
    fn prepare(&self) -> Result<()>;
    fn create(&self, instance_id: &str) -> Result<()>;
    fn apply_limits(&self, instance_id: &str, limits: &ResourceLimits) -> Result<()>;
    fn attach_process(&self, instance_id: &str, pid: u32) -> Result<()>;
    /// Total CPU time consumed by the group, in microseconds.
    fn get_cpu_usage(&self, instance_id: &str) -> Result<u64>;
    fn collect_evidence(&self, instance_id: &str) -> Result<CgroupEvidence>;
    fn kill_all(&self, instance_id: &str) -> Result<()>;
    fn is_empty(&self, instance_id: &str) -> Result<bool>;
    fn remove(&self, instance_id: &str) -> Result<()>;
    fn get_cgroup_path(&self, instance_id: &str) -> PathBuf;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CgroupBackendType {
    V1,
    V2,
}

/// Detect available cgroup backend under `root`: v2 preferred, v1 fallback.
pub fn detect_cgroup_backend(root: &Path) -> Option<CgroupBackendType> {
    if root.join("cgroup.controllers").exists() {
        return Some(CgroupBackendType::V2);
    }
    if root.join("memory").is_dir() && root.join("cpu").is_dir() {
        return Some(CgroupBackendType::V1);
    }
    None
}

/// Create the configured backend. An absent hierarchy is a setup failure,
/// never a silent run without limits.
pub fn create_cgroup_backend(config: &LauncherConfig) -> Result<Box<dyn CgroupBackend>> {
    let detected = detect_cgroup_backend(&config.cgroup_root);

    log::info!(
        "Cgroup backend selection: force_v1={}, detected={:?}, root={}",
        config.force_cgroup_v1,
        detected,
        config.cgroup_root.display()
    );

    match (detected, config.force_cgroup_v1) {
        (Some(CgroupBackendType::V1), _) => {
            log::info!("Using cgroup v1 backend");
            Ok(Box::new(crate::kernel::cgroup::v1::CgroupV1::new(
                &config.cgroup_root,
                &config.cgroup_parent,
            )))
        }
        (Some(CgroupBackendType::V2), false) => {
            log::info!("Using cgroup v2 backend (default)");
            Ok(Box::new(crate::kernel::cgroup::v2::CgroupV2::new(
                &config.cgroup_root,
                &config.cgroup_parent,
            )))
        }
        (Some(CgroupBackendType::V2), true) => Err(cgroup_error(
            "cgroup v1 forced but only the v2 hierarchy is mounted",
        )),
        (None, _) => Err(cgroup_error(format!(
            "no cgroup hierarchy available at {}",
            config.cgroup_root.display()
        ))),
    }
}

pub fn backend_type_name(backend_type: CgroupBackendType) -> &'static str {
    match backend_type {
        CgroupBackendType::V1 => "cgroup_v1",
        CgroupBackendType::V2 => "cgroup_v2",
    }
}

pub(crate) fn cgroup_error(message: impl Into<String>) -> SandboxError {
    SandboxError::setup(SetupStage::Cgroup, message)
}

/// Write a control file, mapping failure to a cgroup setup error.
pub(crate) fn write_control(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value)
        .map_err(|e| cgroup_error(format!("write '{}' to {}: {}", value, path.display(), e)))
}

pub(crate) fn read_u64(path: &Path) -> Option<u64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Value of `key` in a flat keyed file such as `memory.events` or `cpu.stat`.
pub(crate) fn keyed_value(content: &str, key: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(k), Some(v)) if k == key => v.parse().ok(),
            _ => None,
        }
    })
}

/// Pids listed in a `cgroup.procs` / `tasks` file.
pub(crate) fn read_pids(path: &Path) -> Vec<i32> {
    fs::read_to_string(path)
        .map(|content| content.lines().filter_map(|l| l.trim().parse().ok()).collect())
        .unwrap_or_default()
}

/// rmdir a group, retrying while the kernel still reports it busy.
pub(crate) fn remove_group_dir(path: &Path) -> Result<()> {
    for attempt in 1..=REMOVE_ATTEMPTS {
        match fs::remove_dir(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) && attempt < REMOVE_ATTEMPTS => {
                thread::sleep(REMOVE_BACKOFF);
            }
            Err(e) => {
                return Err(cgroup_error(format!(
                    "Failed to remove cgroup {}: {}",
                    path.display(),
                    e
                )))
            }
        }
    }
    Err(cgroup_error(format!("cgroup {} stayed busy", path.display())))
}
