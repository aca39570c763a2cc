/// Result classification and assembly
///
/// Termination is a pure function of what the supervisor observed and the
/// cgroup evidence read before teardown.
use crate::config::types::{
    CgroupEvidence, ExecutionResult, LimitKind, LimitsHit, Result, ResourceUsage, SandboxError,
    SetupStage, TeardownReport, Termination,
};
use crate::core::supervisor::{InitExit, SupervisionOutcome};

const SIGKILL: i32 = libc::SIGKILL;

/// Result reporter - pure functions over supervision evidence
pub struct ResultReporter;

impl ResultReporter {
    /// Decide how the command ended, or which error prevented it from running.
    pub fn classify(
        outcome: &SupervisionOutcome,
        evidence: Option<&CgroupEvidence>,
    ) -> Result<Termination> {
        let oom_killed = evidence.map(|e| e.oom_kill_events > 0).unwrap_or(false);
        let payload_signal = outcome.status.as_ref().and_then(|s| s.term_signal);

        // Launcher actions take precedence: the init reports whatever signal
        // its namespace kill delivered.
        if let Some(limit) = outcome.watchdog {
            return Ok(Termination::LimitExceeded {
                limit,
                signal: Some(payload_signal.unwrap_or(SIGKILL)),
            });
        }
        if outcome.cancelled {
            return Ok(Termination::Cancelled);
        }

        let status = match &outcome.status {
            Some(status) => status,
            None => return Self::classify_lost_init(outcome, oom_killed),
        };

        if let Some(failure) = &status.failure {
            return Err(failure.clone().into_error());
        }

        if let Some(signal) = status.term_signal {
            if signal == SIGKILL && oom_killed {
                return Ok(Termination::LimitExceeded {
                    limit: LimitKind::Memory,
                    signal: Some(signal),
                });
            }
            return Ok(Termination::Signaled { signal });
        }

        match status.exit_code {
            Some(code) => Ok(Termination::Exited { code }),
            None => Err(SandboxError::setup(
                SetupStage::Supervision,
                "sandbox init reported neither exit code nor signal",
            )),
        }
    }

    /// The init died without reporting. Only the memory controller can explain that.
    fn classify_lost_init(outcome: &SupervisionOutcome, oom_killed: bool) -> Result<Termination> {
        if oom_killed {
            let signal = match outcome.init_exit {
                InitExit::Signaled { signal } => signal,
                InitExit::Exited { .. } => SIGKILL,
            };
            return Ok(Termination::LimitExceeded {
                limit: LimitKind::Memory,
                signal: Some(signal),
            });
        }
        Err(SandboxError::setup(
            SetupStage::Supervision,
            format!(
                "sandbox init ended ({:?}) without status: {}",
                outcome.init_exit,
                outcome.status_error.as_deref().unwrap_or("no status")
            ),
        ))
    }

    pub fn limits_hit(termination: &Termination, evidence: Option<&CgroupEvidence>) -> LimitsHit {
        let limit = match termination {
            Termination::LimitExceeded { limit, .. } => Some(*limit),
            _ => None,
        };
        LimitsHit {
            memory: limit == Some(LimitKind::Memory)
                || evidence.map(|e| e.oom_kill_events > 0).unwrap_or(false),
            cpu_time: limit == Some(LimitKind::CpuTime),
            wall_time: limit == Some(LimitKind::WallTime),
        }
    }

    pub fn assemble(
        instance_id: &str,
        termination: Termination,
        outcome: &SupervisionOutcome,
        evidence: Option<&CgroupEvidence>,
        teardown: TeardownReport,
    ) -> ExecutionResult {
        ExecutionResult {
            instance_id: instance_id.to_string(),
            exit_code: termination.exit_code(),
            signal: termination.signal(),
            wall_time_ms: outcome.wall_time.as_millis() as u64,
            limits_hit: Self::limits_hit(&termination, evidence),
            usage: evidence.map(ResourceUsage::from).unwrap_or_default(),
            teardown,
            termination,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::FORCED_TERMINATION_EXIT_CODE;
    use crate::core::types::{InitFailure, ProxyStatus};
    use std::time::Duration;

    fn outcome(status: Option<ProxyStatus>) -> SupervisionOutcome {
        SupervisionOutcome {
            init_pid: 4242,
            init_exit: InitExit::Exited { code: 0 },
            status,
            status_error: None,
            watchdog: None,
            cancelled: false,
            kill_report: None,
            wall_time: Duration::from_millis(35),
        }
    }

    fn exited(code: i32) -> ProxyStatus {
        ProxyStatus {
            payload_pid: Some(2),
            exit_code: Some(code),
            ..ProxyStatus::default()
        }
    }

    fn signaled(signal: i32) -> ProxyStatus {
        ProxyStatus {
            payload_pid: Some(2),
            term_signal: Some(signal),
            ..ProxyStatus::default()
        }
    }

    fn oom(kills: u64) -> CgroupEvidence {
        CgroupEvidence {
            oom_events: kills,
            oom_kill_events: kills,
            memory_peak: Some(128 * 1024 * 1024),
            ..CgroupEvidence::default()
        }
    }

    #[test]
    fn test_classify_exit_code() {
        let termination = ResultReporter::classify(&outcome(Some(exited(3))), None).unwrap();
        assert_eq!(termination, Termination::Exited { code: 3 });
        assert_eq!(termination.exit_code(), 3);
    }

    #[test]
    fn test_self_inflicted_sigkill_is_a_signal() {
        let termination =
            ResultReporter::classify(&outcome(Some(signaled(9))), Some(&oom(0))).unwrap();
        assert_eq!(termination, Termination::Signaled { signal: 9 });
        assert_eq!(termination.exit_code(), 137);
    }

    #[test]
    fn test_oom_kill_is_memory_limit() {
        let evidence = oom(1);
        let termination =
            ResultReporter::classify(&outcome(Some(signaled(9))), Some(&evidence)).unwrap();
        assert_eq!(
            termination,
            Termination::LimitExceeded {
                limit: LimitKind::Memory,
                signal: Some(9)
            }
        );
        assert_eq!(termination.exit_code(), FORCED_TERMINATION_EXIT_CODE);
        assert!(ResultReporter::limits_hit(&termination, Some(&evidence)).memory);
    }

    #[test]
    fn test_oom_does_not_relabel_other_signals() {
        let termination =
            ResultReporter::classify(&outcome(Some(signaled(11))), Some(&oom(1))).unwrap();
        assert_eq!(termination, Termination::Signaled { signal: 11 });
    }

    #[test]
    fn test_watchdog_precedes_reported_signal() {
        let mut observed = outcome(Some(signaled(9)));
        observed.watchdog = Some(LimitKind::CpuTime);
        let termination = ResultReporter::classify(&observed, None).unwrap();
        assert_eq!(
            termination,
            Termination::LimitExceeded {
                limit: LimitKind::CpuTime,
                signal: Some(9)
            }
        );
        let hit = ResultReporter::limits_hit(&termination, None);
        assert!(hit.cpu_time && !hit.wall_time && !hit.memory);
    }

    #[test]
    fn test_cancellation() {
        let mut observed = outcome(None);
        observed.cancelled = true;
        observed.init_exit = InitExit::Signaled { signal: 9 };
        let termination = ResultReporter::classify(&observed, None).unwrap();
        assert_eq!(termination, Termination::Cancelled);
        assert_eq!(termination.exit_code(), FORCED_TERMINATION_EXIT_CODE);
    }

    #[test]
    fn test_init_failure_becomes_error() {
        let status = ProxyStatus {
            failure: Some(InitFailure::Setup {
                stage: SetupStage::Mounts,
                message: "mount proc: EPERM".to_string(),
            }),
            ..ProxyStatus::default()
        };
        let err = ResultReporter::classify(&outcome(Some(status)), None).unwrap_err();
        assert!(matches!(
            err,
            SandboxError::IsolationSetupFailed {
                stage: SetupStage::Mounts,
                ..
            }
        ));
    }

    #[test]
    fn test_exec_failure_becomes_execution_failed() {
        let status = ProxyStatus {
            exit_code: Some(127),
            failure: Some(InitFailure::Exec {
                message: "execv /bin/missing failed: ENOENT".to_string(),
            }),
            ..ProxyStatus::default()
        };
        let err = ResultReporter::classify(&outcome(Some(status)), None).unwrap_err();
        assert!(matches!(err, SandboxError::ExecutionFailed(_)));
    }

    #[test]
    fn test_lost_init_without_oom_is_supervision_error() {
        let mut observed = outcome(None);
        observed.init_exit = InitExit::Signaled { signal: 9 };
        observed.status_error = Some("decode init status: EOF".to_string());
        let err = ResultReporter::classify(&observed, Some(&oom(0))).unwrap_err();
        assert!(matches!(
            err,
            SandboxError::IsolationSetupFailed {
                stage: SetupStage::Supervision,
                ..
            }
        ));
    }

    #[test]
    fn test_lost_init_with_oom_is_memory_limit() {
        let mut observed = outcome(None);
        observed.init_exit = InitExit::Signaled { signal: 9 };
        let termination = ResultReporter::classify(&observed, Some(&oom(2))).unwrap();
        assert!(matches!(
            termination,
            Termination::LimitExceeded {
                limit: LimitKind::Memory,
                ..
            }
        ));
    }

    #[test]
    fn test_assemble_copies_usage_and_teardown() {
        let observed = outcome(Some(exited(0)));
        let evidence = CgroupEvidence {
            cpu_usage_usec: Some(1500),
            memory_peak: Some(4096),
            ..CgroupEvidence::default()
        };
        let teardown = TeardownReport {
            complete: true,
            released: vec!["cgroup /sys/fs/cgroup/jailbox/x".to_string()],
            errors: Vec::new(),
        };
        let result = ResultReporter::assemble(
            "x",
            Termination::Exited { code: 0 },
            &observed,
            Some(&evidence),
            teardown.clone(),
        );
        assert!(result.success());
        assert_eq!(result.wall_time_ms, 35);
        assert_eq!(result.usage.cpu_usage_usec, 1500);
        assert_eq!(result.usage.memory_peak_bytes, 4096);
        assert!(result.limits_hit.none());
        assert_eq!(result.teardown, teardown);
    }
}
