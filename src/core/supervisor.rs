use crate::config::loader::LauncherConfig;
use crate::config::policy::SandboxPolicy;
use crate::config::types::{LimitKind, Result, SandboxError, SetupStage};
use crate::core::launcher::CancellationToken;
use crate::core::proxy::{read_json, run_init_main, write_json};
use crate::core::types::{KillReport, LaunchRequest, ProxyStatus};
use crate::kernel::cgroup::CgroupBackend;
use crate::kernel::fd::close_inherited_fds;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sched::{clone, CloneFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, pipe2, Pid};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

fn to_supervision_error(prefix: &str, err: impl std::fmt::Display) -> SandboxError {
    SandboxError::setup(SetupStage::Supervision, format!("{prefix}: {err}"))
}

/// Timing knobs for one supervised launch
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorSettings {
    pub poll_interval: Duration,
    pub cancel_grace: Duration,
    pub stack_size: usize,
    pub cpu_time_limit: Option<Duration>,
    pub wall_time_limit: Option<Duration>,
}

impl SupervisorSettings {
    pub fn new(config: &LauncherConfig, policy: &SandboxPolicy) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            cancel_grace: config.cancel_grace(),
            stack_size: config.init_stack_size,
            cpu_time_limit: policy.cpu_time_limit(),
            wall_time_limit: policy.wall_time_limit(),
        }
    }
}

/// How the sandbox init process itself ended, as seen from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InitExit {
    Exited { code: i32 },
    Signaled { signal: i32 },
}

/// Everything the host observed while the sandbox ran
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisionOutcome {
    pub init_pid: i32,
    pub init_exit: InitExit,
    /// Status reported by the init, absent when it died without reporting
    pub status: Option<ProxyStatus>,
    pub status_error: Option<String>,
    /// Launcher watchdog that fired, if any
    pub watchdog: Option<LimitKind>,
    pub cancelled: bool,
    pub kill_report: Option<KillReport>,
    /// From release of the init to its exit
    pub wall_time: Duration,
}

/// A cloned sandbox init, blocked on its launch pipe until released.
#[derive(Debug)]
pub struct SpawnedInit {
    pid: Pid,
    launch: Option<File>,
    status: File,
}

impl SpawnedInit {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Send the launch request and close the pipe. Must follow cgroup attach.
    pub fn release(&mut self, request: &LaunchRequest) -> Result<()> {
        let launch = self
            .launch
            .take()
            .ok_or_else(|| to_supervision_error("release", "sandbox init already released"))?;
        write_json(launch, request, "launch request")
    }
}

/// Clone the sandbox init into fresh namespaces. It stays blocked until
/// [`SpawnedInit::release`].
pub fn spawn_sandbox_init(flags: CloneFlags, stack_size: usize) -> Result<SpawnedInit> {
    let (launch_read, launch_write) =
        pipe2(OFlag::O_CLOEXEC).map_err(|e| to_supervision_error("pipe2(launch)", e))?;
    let (status_read, status_write) =
        pipe2(OFlag::O_CLOEXEC).map_err(|e| to_supervision_error("pipe2(status)", e))?;

    let child_launch_read = launch_read.as_raw_fd();
    let child_launch_write = launch_write.as_raw_fd();
    let child_status_read = status_read.as_raw_fd();
    let child_status_write = status_write.as_raw_fd();
    let mut child_stack = vec![0u8; stack_size];
    let child_cb: Box<dyn FnMut() -> isize> = Box::new(move || {
        // The init must not hold the parent's ends, or neither side sees EOF.
        let _ = close(child_launch_write);
        let _ = close(child_status_read);
        // Nor the pipe ends of launches running concurrently on other threads.
        if let Err(e) = close_inherited_fds(&[child_launch_read, child_status_write]) {
            log::warn!("Sandbox init kept inherited descriptors: {}", e);
        }
        run_init_main(child_launch_read, child_status_write)
    });

    // SAFETY: no CLONE_VM; the child runs on its own copy of the address space
    // and the stack outlives the call.
    let pid = unsafe { clone(child_cb, &mut child_stack, flags, Some(libc::SIGCHLD)) }.map_err(
        |e| {
            SandboxError::setup(
                SetupStage::Namespaces,
                format!("clone(sandbox init, {:?}): {}", flags, e),
            )
        },
    )?;

    drop(launch_read);
    drop(status_write);
    log::debug!("Sandbox init cloned as host pid {}", pid);

    Ok(SpawnedInit {
        pid,
        launch: Some(File::from(launch_write)),
        status: File::from(status_read),
    })
}

fn init_exit_from(status: WaitStatus) -> Option<InitExit> {
    match status {
        WaitStatus::Exited(_, code) => Some(InitExit::Exited { code }),
        WaitStatus::Signaled(_, sig, _) => Some(InitExit::Signaled {
            signal: sig as i32,
        }),
        _ => None,
    }
}

/// SIGTERM the init, give it `grace` to kill its namespace and exit, then SIGKILL.
/// Returns the init's exit when it was reaped during the grace period.
pub fn terminate_sandbox_init(
    pid: Pid,
    grace: Duration,
    poll_interval: Duration,
) -> (KillReport, Option<InitExit>) {
    let mut report = KillReport::default();
    let start = Instant::now();

    match kill(pid, Signal::SIGTERM) {
        Ok(()) => report.term_sent = true,
        Err(e) => report.notes.push(format!("SIGTERM to {}: {}", pid, e)),
    }

    let mut reaped = None;
    while report.term_sent && start.elapsed() < grace {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => std::thread::sleep(poll_interval),
            Ok(status) => {
                if let Some(exit) = init_exit_from(status) {
                    reaped = Some(exit);
                    break;
                }
            }
            Err(Errno::EINTR) => continue,
            Err(e) => {
                report.notes.push(format!("waitpid during grace: {}", e));
                break;
            }
        }
    }

    if reaped.is_some() {
        report.exited_after_term = true;
    } else {
        match kill(pid, Signal::SIGKILL) {
            Ok(()) => report.kill_sent = true,
            Err(Errno::ESRCH) => {}
            Err(e) => report.notes.push(format!("SIGKILL to {}: {}", pid, e)),
        }
    }

    report.waited_ms = start.elapsed().as_millis() as u64;
    (report, reaped)
}

/// Which watchdog, if any, should stop the sandbox now.
fn check_watchdogs(
    elapsed: Duration,
    cpu_usage_usec: Option<u64>,
    settings: &SupervisorSettings,
) -> Option<LimitKind> {
    if let Some(limit) = settings.wall_time_limit {
        if elapsed >= limit {
            return Some(LimitKind::WallTime);
        }
    }
    if let (Some(limit), Some(used)) = (settings.cpu_time_limit, cpu_usage_usec) {
        if used >= limit.as_micros() as u64 {
            return Some(LimitKind::CpuTime);
        }
    }
    None
}

/// Poll a released init until it exits, enforcing cancellation and watchdogs.
pub fn supervise(
    init: SpawnedInit,
    cgroup: &dyn CgroupBackend,
    instance_id: &str,
    settings: &SupervisorSettings,
    token: &CancellationToken,
) -> Result<SupervisionOutcome> {
    let SpawnedInit { pid, status, .. } = init;
    let started = Instant::now();

    let mut watchdog = None;
    let mut cancelled = false;
    let mut kill_report: Option<KillReport> = None;

    let init_exit = loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if kill_report.is_none() {
                    let cpu_usage = match settings.cpu_time_limit {
                        Some(_) => cgroup.get_cpu_usage(instance_id).ok(),
                        None => None,
                    };
                    if token.is_cancelled() {
                        log::info!("Launch {} cancelled by caller", instance_id);
                        cancelled = true;
                    } else if let Some(limit) =
                        check_watchdogs(started.elapsed(), cpu_usage, settings)
                    {
                        log::info!("Launch {} hit {:?} watchdog", instance_id, limit);
                        watchdog = Some(limit);
                    }

                    if cancelled || watchdog.is_some() {
                        let (report, reaped) = terminate_sandbox_init(
                            pid,
                            settings.cancel_grace,
                            settings.poll_interval,
                        );
                        kill_report = Some(report);
                        if let Some(exit) = reaped {
                            break exit;
                        }
                        continue;
                    }
                }
                std::thread::sleep(settings.poll_interval);
            }
            Ok(other) => {
                if let Some(exit) = init_exit_from(other) {
                    break exit;
                }
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(to_supervision_error("waitpid(sandbox init)", e)),
        }
    };
    let wall_time = started.elapsed();
    log::debug!("Sandbox init {} ended: {:?}", pid, init_exit);

    let (proxy_status, status_error) = match read_json::<ProxyStatus>(status, "init status") {
        Ok(status) => (Some(status), None),
        Err(e) => (None, Some(e.to_string())),
    };

    Ok(SupervisionOutcome {
        init_pid: pid.as_raw(),
        init_exit,
        status: proxy_status,
        status_error,
        watchdog,
        cancelled,
        kill_report,
        wall_time,
    })
}
