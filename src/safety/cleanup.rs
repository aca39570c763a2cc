/// Resource ledger and teardown for one launch.
///
/// Resources are recorded immediately after successful creation and released
/// in reverse creation order. Teardown is idempotent: released entries leave
/// the ledger, failed ones stay for the next attempt.
use crate::config::types::{Result, SandboxError, SetupStage, TeardownReport};
use crate::kernel::cgroup::CgroupBackend;
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use std::fmt;
use std::path::PathBuf;

/// Resource types that need teardown
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceType {
    /// Per-launch cgroup, identified by instance id
    Cgroup { instance_id: String, path: PathBuf },
    /// Cloned sandbox init holding the namespaces (host pid)
    SandboxInit { pid: i32 },
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Cgroup { path, .. } => write!(f, "cgroup {}", path.display()),
            ResourceType::SandboxInit { pid } => write!(f, "sandbox init pid {}", pid),
        }
    }
}

/// Resource ledger entry
#[derive(Debug, Clone)]
pub struct ResourceEntry {
    pub resource: ResourceType,
    pub created_at: std::time::SystemTime,
}

/// Resource ledger for tracking created resources
#[derive(Debug, Default)]
pub struct ResourceLedger {
    entries: Vec<ResourceEntry>,
    released: Vec<String>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record resource creation. Must be called immediately after successful creation.
    pub fn record(&mut self, resource: ResourceType) {
        debug!("Recording resource: {}", resource);
        self.entries.push(ResourceEntry {
            resource,
            created_at: std::time::SystemTime::now(),
        });
    }

    /// Drop an entry that was released outside the ledger (a reaped init).
    pub fn forget(&mut self, resource: &ResourceType) {
        self.entries.retain(|e| &e.resource != resource);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Release every outstanding resource in reverse creation order.
    pub fn teardown(&mut self, backend: &dyn CgroupBackend) -> TeardownReport {
        info!("Tearing down {} resources", self.entries.len());

        let mut errors = Vec::new();
        let mut remaining = Vec::new();
        while let Some(entry) = self.entries.pop() {
            match release(&entry.resource, backend) {
                Ok(()) => {
                    debug!("Released {}", entry.resource);
                    self.released.push(entry.resource.to_string());
                }
                Err(e) => {
                    let message = format!("Failed to release {}: {}", entry.resource, e);
                    warn!("{}", message);
                    errors.push(message);
                    remaining.push(entry);
                }
            }
        }
        // Keep creation order for the retry
        remaining.reverse();
        self.entries = remaining;

        TeardownReport {
            complete: self.entries.is_empty(),
            released: self.released.clone(),
            errors,
        }
    }
}

fn release(resource: &ResourceType, backend: &dyn CgroupBackend) -> Result<()> {
    match resource {
        ResourceType::SandboxInit { pid } => release_init(Pid::from_raw(*pid)),
        ResourceType::Cgroup { instance_id, .. } => {
            backend.kill_all(instance_id)?;
            backend.remove(instance_id)
        }
    }
}

/// Kill and reap the init. Its namespaces and mounts go with it.
fn release_init(pid: Pid) -> Result<()> {
    match kill(pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => {
            return Err(SandboxError::setup(
                SetupStage::Supervision,
                format!("SIGKILL sandbox init {}: {}", pid, e),
            ))
        }
    }
    loop {
        match waitpid(pid, None) {
            Ok(_) | Err(Errno::ECHILD) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => {
                return Err(SandboxError::setup(
                    SetupStage::Supervision,
                    format!("reap sandbox init {}: {}", pid, e),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::CgroupEvidence;
    use crate::kernel::cgroup::ResourceLimits;
    use std::sync::Mutex;

    /// Records backend calls; `remove` fails while `busy` is set.
    #[derive(Default)]
    struct RecordingBackend {
        calls: Mutex<Vec<String>>,
        busy: Mutex<bool>,
    }

    impl RecordingBackend {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn push(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl CgroupBackend for RecordingBackend {
        fn backend_name(&self) -> &str {
            "recording"
        }
        fn prepare(&self) -> Result<()> {
            Ok(())
        }
        fn create(&self, _instance_id: &str) -> Result<()> {
            Ok(())
        }
        fn apply_limits(&self, _instance_id: &str, _limits: &ResourceLimits) -> Result<()> {
            Ok(())
        }
        fn attach_process(&self, _instance_id: &str, _pid: u32) -> Result<()> {
            Ok(())
        }
        fn get_cpu_usage(&self, _instance_id: &str) -> Result<u64> {
            Ok(0)
        }
        fn collect_evidence(&self, _instance_id: &str) -> Result<CgroupEvidence> {
            Ok(CgroupEvidence::default())
        }
        fn kill_all(&self, instance_id: &str) -> Result<()> {
            self.push(format!("kill_all {}", instance_id));
            Ok(())
        }
        fn is_empty(&self, _instance_id: &str) -> Result<bool> {
            Ok(true)
        }
        fn remove(&self, instance_id: &str) -> Result<()> {
            self.push(format!("remove {}", instance_id));
            if *self.busy.lock().unwrap() {
                return Err(SandboxError::setup(SetupStage::Cgroup, "busy"));
            }
            Ok(())
        }
        fn get_cgroup_path(&self, instance_id: &str) -> PathBuf {
            PathBuf::from("/sys/fs/cgroup/jailbox").join(instance_id)
        }
    }

    fn cgroup(id: &str) -> ResourceType {
        ResourceType::Cgroup {
            instance_id: id.to_string(),
            path: PathBuf::from("/sys/fs/cgroup/jailbox").join(id),
        }
    }

    #[test]
    fn empty_ledger_tears_down_cleanly() {
        let backend = RecordingBackend::default();
        let mut ledger = ResourceLedger::new();
        let report = ledger.teardown(&backend);
        assert!(report.complete);
        assert!(report.released.is_empty());
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn resources_are_released_in_reverse_order() {
        let backend = RecordingBackend::default();
        let mut ledger = ResourceLedger::new();
        ledger.record(cgroup("a"));
        ledger.record(cgroup("b"));

        let report = ledger.teardown(&backend);
        assert!(report.complete);
        assert_eq!(
            backend.calls(),
            vec!["kill_all b", "remove b", "kill_all a", "remove a"]
        );
        assert_eq!(
            report.released,
            vec!["cgroup /sys/fs/cgroup/jailbox/b", "cgroup /sys/fs/cgroup/jailbox/a"]
        );
    }

    #[test]
    fn second_teardown_is_a_no_op() {
        let backend = RecordingBackend::default();
        let mut ledger = ResourceLedger::new();
        ledger.record(cgroup("once"));
        ledger.teardown(&backend);
        let calls_after_first = backend.calls().len();

        let report = ledger.teardown(&backend);
        assert!(report.complete);
        assert!(report.errors.is_empty());
        assert_eq!(backend.calls().len(), calls_after_first);
    }

    #[test]
    fn failed_release_stays_for_retry() {
        let backend = RecordingBackend::default();
        *backend.busy.lock().unwrap() = true;
        let mut ledger = ResourceLedger::new();
        ledger.record(cgroup("stuck"));

        let report = ledger.teardown(&backend);
        assert!(!report.complete);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(ledger.count(), 1);

        *backend.busy.lock().unwrap() = false;
        let report = ledger.teardown(&backend);
        assert!(report.complete);
        assert!(ledger.is_empty());
    }

    #[test]
    fn forgotten_init_is_not_killed() {
        let backend = RecordingBackend::default();
        let mut ledger = ResourceLedger::new();
        ledger.record(cgroup("x"));
        let init = ResourceType::SandboxInit { pid: i32::MAX };
        ledger.record(init.clone());
        ledger.forget(&init);

        let report = ledger.teardown(&backend);
        assert!(report.complete);
        assert_eq!(report.released.len(), 1);
    }
}
