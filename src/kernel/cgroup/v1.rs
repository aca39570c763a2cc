//! Cgroup v1 resource governance.
//!
//! One directory per controller hierarchy. `cpu` and `cpuacct` are often
//! co-mounted; when `cpuacct` is absent its files are read from `cpu`.

use crate::config::types::{CgroupEvidence, Result};
use crate::kernel::cgroup::backend::{
    cgroup_error, keyed_value, read_pids, read_u64, remove_group_dir, write_control,
    CgroupBackend, ResourceLimits,
};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};

const CONTROLLERS: [&str; 3] = ["memory", "cpu", "blkio"];

pub struct CgroupV1 {
    root: PathBuf,
    parent_name: String,
}

impl CgroupV1 {
    pub fn new(root: &Path, parent_name: &str) -> Self {
        CgroupV1 {
            root: root.to_path_buf(),
            parent_name: parent_name.to_string(),
        }
    }

    fn controller_path(&self, controller: &str, instance_id: &str) -> PathBuf {
        self.root.join(controller).join(&self.parent_name).join(instance_id)
    }

    fn cpuacct_path(&self, instance_id: &str) -> PathBuf {
        let dedicated = self.controller_path("cpuacct", instance_id);
        if dedicated.exists() {
            dedicated
        } else {
            self.controller_path("cpu", instance_id)
        }
    }

    fn set_blkio_weight(path: &Path, weight: u32) -> Result<()> {
        for file in ["blkio.weight", "blkio.bfq.weight"] {
            let candidate = path.join(file);
            if candidate.exists() {
                return write_control(&candidate, &weight.to_string());
            }
        }
        Err(cgroup_error(format!(
            "no blkio.weight or blkio.bfq.weight in {}",
            path.display()
        )))
    }

    /// `oom_kill` counter from memory.oom_control (kernel 4.13+).
    fn oom_kill_count(&self, instance_id: &str) -> u64 {
        let control = self.controller_path("memory", instance_id).join("memory.oom_control");
        fs::read_to_string(control)
            .ok()
            .and_then(|content| keyed_value(&content, "oom_kill"))
            .unwrap_or(0)
    }
}

impl CgroupBackend for CgroupV1 {
    fn backend_name(&self) -> &str {
        "cgroup_v1"
    }

    fn prepare(&self) -> Result<()> {
        for controller in CONTROLLERS {
            let hierarchy = self.root.join(controller);
            if !hierarchy.is_dir() {
                return Err(cgroup_error(format!(
                    "cgroup v1 controller '{}' not mounted at {}",
                    controller,
                    hierarchy.display()
                )));
            }
            let parent = hierarchy.join(&self.parent_name);
            fs::create_dir_all(&parent).map_err(|e| {
                cgroup_error(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        Ok(())
    }

    fn create(&self, instance_id: &str) -> Result<()> {
        let mut created: Vec<PathBuf> = Vec::new();
        for controller in CONTROLLERS {
            let path = self.controller_path(controller, instance_id);
            if let Err(e) = fs::create_dir(&path) {
                for done in created.iter().rev() {
                    let _ = fs::remove_dir(done);
                }
                return Err(cgroup_error(format!(
                    "Failed to create cgroup {}: {}",
                    path.display(),
                    e
                )));
            }
            created.push(path);
        }
        Ok(())
    }

    fn apply_limits(&self, instance_id: &str, limits: &ResourceLimits) -> Result<()> {
        let cpu = self.controller_path("cpu", instance_id);
        write_control(&cpu.join("cpu.cfs_period_us"), &limits.cpu_period_us.to_string())?;
        write_control(&cpu.join("cpu.cfs_quota_us"), &limits.cpu_quota_us.to_string())?;

        let memory = self.controller_path("memory", instance_id);
        let limit = limits.memory_bytes.to_string();
        write_control(&memory.join("memory.limit_in_bytes"), &limit)?;
        // Set memory+swap limit to prevent swap escape
        let memsw = memory.join("memory.memsw.limit_in_bytes");
        if memsw.exists() {
            write_control(&memsw, &limit)?;
        }
        let swappiness = memory.join("memory.swappiness");
        if swappiness.exists() {
            if let Err(e) = fs::write(&swappiness, "0") {
                log::debug!("memory.swappiness not set for {}: {}", instance_id, e);
            }
        }

        Self::set_blkio_weight(&self.controller_path("blkio", instance_id), limits.io_weight)?;

        log::debug!("Applied v1 limits for {}: {:?}", instance_id, limits);
        Ok(())
    }

    fn attach_process(&self, instance_id: &str, pid: u32) -> Result<()> {
        for controller in CONTROLLERS {
            let procs = self.controller_path(controller, instance_id).join("cgroup.procs");
            write_control(&procs, &pid.to_string())?;
        }
        Ok(())
    }

    fn get_cpu_usage(&self, instance_id: &str) -> Result<u64> {
        read_u64(&self.cpuacct_path(instance_id).join("cpuacct.usage"))
            .map(|ns| ns / 1000)
            .ok_or_else(|| cgroup_error("cpuacct.usage unavailable"))
    }

    fn collect_evidence(&self, instance_id: &str) -> Result<CgroupEvidence> {
        let memory = self.controller_path("memory", instance_id);
        let cpu_stat =
            fs::read_to_string(self.controller_path("cpu", instance_id).join("cpu.stat"))
                .unwrap_or_default();
        let oom_kills = self.oom_kill_count(instance_id);

        Ok(CgroupEvidence {
            memory_peak: read_u64(&memory.join("memory.max_usage_in_bytes")),
            memory_limit: read_u64(&memory.join("memory.limit_in_bytes")),
            oom_events: oom_kills,
            oom_kill_events: oom_kills,
            cpu_usage_usec: self.get_cpu_usage(instance_id).ok(),
            cpu_throttled_usec: keyed_value(&cpu_stat, "throttled_time").map(|ns| ns / 1000),
        })
    }

    fn kill_all(&self, instance_id: &str) -> Result<()> {
        let procs = self.controller_path("memory", instance_id).join("cgroup.procs");
        for pid in read_pids(&procs) {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
        Ok(())
    }

    fn is_empty(&self, instance_id: &str) -> Result<bool> {
        Ok(CONTROLLERS.iter().all(|controller| {
            read_pids(&self.controller_path(controller, instance_id).join("cgroup.procs"))
                .is_empty()
        }))
    }

    fn remove(&self, instance_id: &str) -> Result<()> {
        let mut first_error = None;
        for controller in CONTROLLERS {
            if let Err(e) = remove_group_dir(&self.controller_path(controller, instance_id)) {
                log::warn!("{}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn get_cgroup_path(&self, instance_id: &str) -> PathBuf {
        self.controller_path("memory", instance_id)
    }
}
