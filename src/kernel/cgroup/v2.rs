//! Cgroup v2 backend.
//!
//! Launch groups live under one delegated parent. `memory.oom.group` makes an
//! OOM kill take the whole group, and `memory.events` is the evidence for it.

use crate::config::types::{CgroupEvidence, Result};
use crate::kernel::cgroup::backend::{
    cgroup_error, keyed_value, read_pids, read_u64, remove_group_dir, write_control,
    CgroupBackend, ResourceLimits,
};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};

/// Controllers the launcher needs delegated to each launch group.
const REQUIRED_CONTROLLERS: [&str; 3] = ["cpu", "memory", "io"];

/// Cgroup v2 backend
pub struct CgroupV2 {
    root: PathBuf,
    parent: PathBuf,
}

impl CgroupV2 {
    pub fn new(root: &Path, parent_name: &str) -> Self {
        CgroupV2 {
            root: root.to_path_buf(),
            parent: root.join(parent_name),
        }
    }

    fn instance_path(&self, instance_id: &str) -> PathBuf {
        self.parent.join(instance_id)
    }

    fn enable_controllers(group: &Path) -> Result<()> {
        let available = fs::read_to_string(group.join("cgroup.controllers")).map_err(|e| {
            cgroup_error(format!("cannot read {}/cgroup.controllers: {}", group.display(), e))
        })?;
        let enabled = fs::read_to_string(group.join("cgroup.subtree_control")).unwrap_or_default();

        for controller in REQUIRED_CONTROLLERS {
            if enabled.split_whitespace().any(|c| c == controller) {
                continue;
            }
            if !available.split_whitespace().any(|c| c == controller) {
                return Err(cgroup_error(format!(
                    "controller '{}' not available in {}",
                    controller,
                    group.display()
                )));
            }
            write_control(&group.join("cgroup.subtree_control"), &format!("+{}", controller))?;
        }
        Ok(())
    }

    /// Read memory.peak (kernel 5.19+) with fallback to memory.current
    fn memory_peak(path: &Path) -> Option<u64> {
        read_u64(&path.join("memory.peak")).or_else(|| read_u64(&path.join("memory.current")))
    }

    fn set_io_weight(path: &Path, weight: u32) -> Result<()> {
        let io_weight = path.join("io.weight");
        if io_weight.exists() {
            return write_control(&io_weight, &format!("default {}", weight));
        }
        let bfq_weight = path.join("io.bfq.weight");
        if bfq_weight.exists() {
            return write_control(&bfq_weight, &weight.to_string());
        }
        Err(cgroup_error(format!(
            "no io.weight or io.bfq.weight in {}",
            path.display()
        )))
    }
}

impl CgroupBackend for CgroupV2 {
    fn backend_name(&self) -> &str {
        "cgroup_v2"
    }

    fn prepare(&self) -> Result<()> {
        Self::enable_controllers(&self.root)?;
        if !self.parent.exists() {
            fs::create_dir_all(&self.parent).map_err(|e| {
                cgroup_error(format!("Failed to create {}: {}", self.parent.display(), e))
            })?;
        }
        Self::enable_controllers(&self.parent)
    }

    fn create(&self, instance_id: &str) -> Result<()> {
        let path = self.instance_path(instance_id);
        fs::create_dir(&path)
            .map_err(|e| cgroup_error(format!("Failed to create cgroup {}: {}", path.display(), e)))
    }

    fn apply_limits(&self, instance_id: &str, limits: &ResourceLimits) -> Result<()> {
        let path = self.instance_path(instance_id);

        write_control(
            &path.join("cpu.max"),
            &format!("{} {}", limits.cpu_quota_us, limits.cpu_period_us),
        )?;
        write_control(&path.join("memory.max"), &limits.memory_bytes.to_string())?;

        let swap_max = path.join("memory.swap.max");
        if swap_max.exists() {
            write_control(&swap_max, "0")?;
        } else {
            log::debug!("memory.swap.max absent (swap accounting disabled)");
        }
        write_control(&path.join("memory.oom.group"), "1")?;
        Self::set_io_weight(&path, limits.io_weight)?;

        log::debug!("Applied v2 limits to {}: {:?}", path.display(), limits);
        Ok(())
    }

    fn attach_process(&self, instance_id: &str, pid: u32) -> Result<()> {
        let procs = self.instance_path(instance_id).join("cgroup.procs");
        write_control(&procs, &pid.to_string())
    }

    fn get_cpu_usage(&self, instance_id: &str) -> Result<u64> {
        let stat_path = self.instance_path(instance_id).join("cpu.stat");
        let stat = fs::read_to_string(&stat_path)
            .map_err(|e| cgroup_error(format!("Failed to read cpu.stat: {}", e)))?;
        keyed_value(&stat, "usage_usec")
            .ok_or_else(|| cgroup_error("cpu.stat has no usage_usec"))
    }

    fn collect_evidence(&self, instance_id: &str) -> Result<CgroupEvidence> {
        let path = self.instance_path(instance_id);
        let events = fs::read_to_string(path.join("memory.events")).unwrap_or_default();
        let cpu_stat = fs::read_to_string(path.join("cpu.stat")).unwrap_or_default();

        Ok(CgroupEvidence {
            memory_peak: Self::memory_peak(&path),
            memory_limit: read_u64(&path.join("memory.max")),
            oom_events: keyed_value(&events, "oom").unwrap_or(0),
            oom_kill_events: keyed_value(&events, "oom_kill").unwrap_or(0),
            cpu_usage_usec: keyed_value(&cpu_stat, "usage_usec"),
            cpu_throttled_usec: keyed_value(&cpu_stat, "throttled_usec"),
        })
    }

    fn kill_all(&self, instance_id: &str) -> Result<()> {
        let path = self.instance_path(instance_id);
        let kill_file = path.join("cgroup.kill");
        if kill_file.exists() {
            return write_control(&kill_file, "1");
        }
        for pid in read_pids(&path.join("cgroup.procs")) {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
        Ok(())
    }

    fn is_empty(&self, instance_id: &str) -> Result<bool> {
        Ok(read_pids(&self.instance_path(instance_id).join("cgroup.procs")).is_empty())
    }

    fn remove(&self, instance_id: &str) -> Result<()> {
        remove_group_dir(&self.instance_path(instance_id))
    }

    fn get_cgroup_path(&self, instance_id: &str) -> PathBuf {
        self.instance_path(instance_id)
    }
}
