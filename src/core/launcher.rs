//! Launch orchestration: preflight, cgroup, sandbox init, supervision, teardown.

use crate::config::loader::LauncherConfig;
use crate::config::policy::SandboxPolicy;
use crate::config::types::{
    CgroupEvidence, ExecutionResult, Result, TeardownReport, Termination,
};
use crate::config::validator::{preflight, JailLayout};
use crate::core::supervisor::{spawn_sandbox_init, supervise, SupervisionOutcome, SupervisorSettings};
use crate::core::types::LaunchRequest;
use crate::kernel::cgroup::{create_cgroup_backend, CgroupBackend, ResourceLimits};
use crate::kernel::namespace::NamespaceIsolation;
use crate::kernel::privilege::PrivilegeContext;
use crate::observability::audit::AuditLogger;
use crate::safety::cleanup::{ResourceLedger, ResourceType};
use crate::verdict::reporter::ResultReporter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Caller-side switch that stops a running launch.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Ledger passes per teardown call
const TEARDOWN_PASSES: usize = 2;

/// Live resources of one launch. Torn down until complete, at the latest on drop.
pub struct SandboxHandle {
    instance_id: String,
    backend: Box<dyn CgroupBackend>,
    ledger: ResourceLedger,
    init_pid: Option<i32>,
    teardown: Option<TeardownReport>,
}

impl SandboxHandle {
    fn new(instance_id: String, backend: Box<dyn CgroupBackend>) -> Self {
        Self {
            instance_id,
            backend,
            ledger: ResourceLedger::new(),
            init_pid: None,
            teardown: None,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Host pid of the sandbox init, once cloned
    pub fn init_pid(&self) -> Option<i32> {
        self.init_pid
    }

    pub fn backend(&self) -> &dyn CgroupBackend {
        self.backend.as_ref()
    }

    fn create_cgroup(&mut self, limits: &ResourceLimits) -> Result<()> {
        self.backend.prepare()?;
        self.backend.create(&self.instance_id)?;
        self.ledger.record(ResourceType::Cgroup {
            instance_id: self.instance_id.clone(),
            path: self.backend.get_cgroup_path(&self.instance_id),
        });
        self.backend.apply_limits(&self.instance_id, limits)
    }

    fn record_init(&mut self, pid: i32) {
        self.init_pid = Some(pid);
        self.ledger.record(ResourceType::SandboxInit { pid });
    }

    /// The supervisor reaped the init; its pid must not be signalled again.
    fn init_reaped(&mut self) {
        if let Some(pid) = self.init_pid {
            self.ledger.forget(&ResourceType::SandboxInit { pid });
        }
    }

    fn collect_evidence(&self) -> Option<CgroupEvidence> {
        match self.backend.collect_evidence(&self.instance_id) {
            Ok(evidence) => Some(evidence),
            Err(e) => {
                log::warn!("No cgroup evidence for {}: {}", self.instance_id, e);
                None
            }
        }
    }

    fn torn_down(&self) -> bool {
        self.teardown.as_ref().is_some_and(|report| report.complete)
    }

    /// Release everything recorded. A complete report is final; while
    /// resources remain, each call retries them and accumulates the errors.
    pub fn teardown(&mut self) -> TeardownReport {
        let mut report = match self.teardown.take() {
            Some(report) if report.complete => {
                self.teardown = Some(report.clone());
                return report;
            }
            Some(report) => report,
            None => TeardownReport::default(),
        };
        for _ in 0..TEARDOWN_PASSES {
            let pass = self.ledger.teardown(self.backend.as_ref());
            report.errors.extend(pass.errors);
            report.released = pass.released;
            report.complete = pass.complete;
            if report.complete {
                break;
            }
        }
        self.teardown = Some(report.clone());
        report
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        if !self.torn_down() {
            let report = self.teardown();
            if !report.complete {
                log::error!(
                    "Teardown of {} incomplete: {:?}",
                    self.instance_id,
                    report.errors
                );
            }
        }
    }
}

/// Runs sandboxed commands; one synchronous launch per call.
pub struct Launcher {
    config: LauncherConfig,
    privilege: PrivilegeContext,
    audit: AuditLogger,
}

impl Launcher {
    pub fn new(config: LauncherConfig, privilege: PrivilegeContext) -> Self {
        Self {
            config,
            privilege,
            audit: AuditLogger::disabled(),
        }
    }

    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = audit;
        self
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    /// Run `policy.command()` confined by `policy`, blocking until it ends.
    ///
    /// Nothing is created on the host before preflight and the privilege check
    /// pass. Everything created afterwards is released before this returns,
    /// on success and on error alike.
    pub fn launch(
        &self,
        policy: &SandboxPolicy,
        token: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let instance_id = Uuid::new_v4().to_string();
        self.audit
            .launch_start(&instance_id, policy.command(), policy.root_path());

        let prepared = preflight(policy).and_then(|layout| {
            for warning in &layout.warnings {
                log::warn!("{}: {}", layout.root.display(), warning);
            }
            self.privilege.require()?;
            let backend = create_cgroup_backend(&self.config)?;
            Ok((layout, backend))
        });
        let (layout, backend) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                self.audit.setup_failure(&instance_id, &err);
                return Err(err);
            }
        };

        let mut handle = SandboxHandle::new(instance_id.clone(), backend);
        let supervised = self.run(&mut handle, policy, &layout, token);
        let evidence = handle.collect_evidence();
        let teardown = handle.teardown();
        self.audit.teardown(&instance_id, &teardown);

        let classified = supervised.and_then(|outcome| {
            let termination = ResultReporter::classify(&outcome, evidence.as_ref())?;
            Ok((outcome, termination))
        });
        let (outcome, termination) = match classified {
            Ok(classified) => classified,
            Err(err) => {
                self.audit.setup_failure(&instance_id, &err);
                return Err(err);
            }
        };

        match &termination {
            Termination::LimitExceeded { limit, .. } => {
                self.audit.limit_violation(&instance_id, *limit)
            }
            Termination::Cancelled => self.audit.cancellation(&instance_id),
            _ => {}
        }

        let result = ResultReporter::assemble(
            &instance_id,
            termination,
            &outcome,
            evidence.as_ref(),
            teardown,
        );
        self.audit.final_status(&result);
        Ok(result)
    }

    fn run(
        &self,
        handle: &mut SandboxHandle,
        policy: &SandboxPolicy,
        layout: &JailLayout,
        token: &CancellationToken,
    ) -> Result<SupervisionOutcome> {
        let limits = ResourceLimits {
            cpu_quota_us: policy.cpu_quota().quota_us(self.config.cpu_period_us),
            cpu_period_us: self.config.cpu_period_us,
            memory_bytes: policy.memory_limit(),
            io_weight: policy.io_weight(),
        };
        handle.create_cgroup(&limits)?;

        let isolation = NamespaceIsolation::for_policy(policy);
        log::info!(
            "Launch {}: namespaces {:?}, cgroup {}",
            handle.instance_id(),
            isolation.get_enabled_namespaces(),
            handle.backend().backend_name()
        );

        let settings = SupervisorSettings::new(&self.config, policy);
        let mut init = spawn_sandbox_init(isolation.clone_flags(), settings.stack_size)?;
        handle.record_init(init.pid().as_raw());

        handle
            .backend()
            .attach_process(handle.instance_id(), init.pid().as_raw() as u32)?;
        init.release(&LaunchRequest::new(handle.instance_id(), policy, layout))?;

        let outcome = supervise(
            init,
            handle.backend(),
            handle.instance_id(),
            &settings,
            token,
        )?;
        handle.init_reaped();
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{SandboxError, SetupStage};
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    /// `remove` fails `busy_removes` times, then succeeds.
    struct FlakyBackend {
        busy_removes: AtomicUsize,
        removes: Arc<AtomicUsize>,
    }

    impl CgroupBackend for FlakyBackend {
        fn backend_name(&self) -> &str {
            "flaky"
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
        fn kill_all(&self, _instance_id: &str) -> Result<()> {
            Ok(())
        }
        fn is_empty(&self, _instance_id: &str) -> Result<bool> {
            Ok(true)
        }
        fn remove(&self, _instance_id: &str) -> Result<()> {
            self.removes.fetch_add(1, Ordering::SeqCst);
            let busy = self
                .busy_removes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if busy {
                return Err(SandboxError::setup(SetupStage::Cgroup, "device or resource busy"));
            }
            Ok(())
        }
        fn get_cgroup_path(&self, instance_id: &str) -> PathBuf {
            PathBuf::from("/sys/fs/cgroup/jailbox").join(instance_id)
        }
    }

    fn handle_with_group(busy_removes: usize) -> (SandboxHandle, Arc<AtomicUsize>) {
        let removes = Arc::new(AtomicUsize::new(0));
        let backend = FlakyBackend {
            busy_removes: AtomicUsize::new(busy_removes),
            removes: Arc::clone(&removes),
        };
        let mut handle = SandboxHandle::new("box-1".to_string(), Box::new(backend));
        handle.ledger.record(ResourceType::Cgroup {
            instance_id: "box-1".to_string(),
            path: PathBuf::from("/sys/fs/cgroup/jailbox/box-1"),
        });
        (handle, removes)
    }

    #[test]
    fn busy_group_is_removed_on_the_next_pass() {
        let (mut handle, removes) = handle_with_group(1);
        let report = handle.teardown();
        assert!(report.complete);
        assert_eq!(report.released, vec!["cgroup /sys/fs/cgroup/jailbox/box-1"]);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("busy"));
        assert_eq!(removes.load(Ordering::SeqCst), 2);

        // Complete reports are final.
        assert_eq!(handle.teardown(), report);
        drop(handle);
        assert_eq!(removes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn incomplete_teardown_is_retried_on_drop() {
        let (mut handle, removes) = handle_with_group(3);
        let report = handle.teardown();
        assert!(!report.complete);
        assert!(report.released.is_empty());
        assert_eq!(report.errors.len(), TEARDOWN_PASSES);

        drop(handle);
        assert_eq!(removes.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn later_calls_accumulate_errors_until_complete() {
        let (mut handle, _removes) = handle_with_group(2);
        assert!(!handle.teardown().complete);
        let report = handle.teardown();
        assert!(report.complete);
        assert_eq!(report.errors.len(), 2);
        assert_eq!(report.released.len(), 1);
    }

    #[test]
    fn token_is_shared_between_clones() {
        let token = CancellationToken::new();
        let remote = token.clone();
        assert!(!token.is_cancelled());
        remote.cancel();
        assert!(token.is_cancelled());
    }
}
