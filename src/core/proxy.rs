use crate::config::types::{Result, SandboxError, SetupStage};
use crate::core::types::{InitFailure, LaunchRequest, ProxyStatus};
use crate::exec::preexec::{
    set_oom_score_adj, setup_parent_death_signal, Confinement, ExecReady, NamespacesEntered,
    RootEntered, INIT_OOM_SCORE_ADJ,
};
use crate::kernel::mount::FilesystemSecurity;
use crate::kernel::signal::{install_termination_handler, reset_signal_state, termination_requested};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, pipe2, setpgid, ForkResult, Pid};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{FromRawFd, RawFd};

/// Exit status of a payload child that never reached exec.
const PAYLOAD_SETUP_EXIT: i32 = 127;

fn supervision_error(prefix: &str, err: impl std::fmt::Display) -> SandboxError {
    SandboxError::setup(SetupStage::Supervision, format!("{prefix}: {err}"))
}

/// Read exactly one JSON value. Returns as soon as the value is complete, so
/// a writer that keeps its end open cannot stall the reader.
pub(crate) fn read_json<T: DeserializeOwned>(source: impl Read, what: &str) -> Result<T> {
    match serde_json::Deserializer::from_reader(source)
        .into_iter::<T>()
        .next()
    {
        Some(Ok(value)) => Ok(value),
        Some(Err(e)) => Err(supervision_error(&format!("decode {what}"), e)),
        None => Err(supervision_error(&format!("decode {what}"), "stream closed before a value")),
    }
}

pub(crate) fn write_json<T: Serialize>(mut sink: impl Write, value: &T, what: &str) -> Result<()> {
    let payload =
        serde_json::to_vec(value).map_err(|e| supervision_error(&format!("encode {what}"), e))?;
    sink.write_all(&payload)?;
    sink.flush()?;
    Ok(())
}

/// Process-wide setup done before the launch request is read.
fn prepare_init() -> Result<()> {
    // Own process group: terminal job-control signals stay with the launcher.
    let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));
    setup_parent_death_signal()?;
    set_oom_score_adj(INIT_OOM_SCORE_ADJ)?;
    install_termination_handler()
}

/// Payload side: everything between fork and exec.
fn prepare_payload(
    rooted: Confinement<RootEntered>,
    request: &LaunchRequest,
) -> Result<Confinement<ExecReady>> {
    set_oom_score_adj(0)?;
    reset_signal_state()?;
    rooted
        .restrict_capabilities(request.capability_set)?
        .prepare_environment(&request.env)
}

fn run_payload(rooted: Confinement<RootEntered>, request: &LaunchRequest) -> SandboxError {
    let program = match request.program.to_str() {
        Some(program) => program,
        None => {
            return SandboxError::ExecutionFailed(format!(
                "program path is not UTF-8: {}",
                request.program.display()
            ))
        }
    };
    match prepare_payload(rooted, request) {
        Ok(ready) => ready.exec(program, &request.argv),
        Err(err) => err,
    }
}

/// From PID 1, kill(-1) reaches every other process in the namespace.
fn kill_namespace() {
    match kill(Pid::from_raw(-1), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => log::warn!("kill(-1, SIGKILL) failed: {}", e),
    }
}

fn wait_for_payload(payload: Pid, status: &mut ProxyStatus) -> Result<()> {
    loop {
        if termination_requested() && !status.cancelled {
            log::info!("Sandbox init received SIGTERM, killing namespace");
            status.cancelled = true;
            kill_namespace();
        }
        match waitpid(payload, None) {
            Ok(WaitStatus::Exited(_, code)) => {
                status.exit_code = Some(code);
                return Ok(());
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                status.term_signal = Some(sig as i32);
                return Ok(());
            }
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(supervision_error("waitpid(payload)", e)),
        }
    }
}

/// Kill and reap everything the payload left behind.
fn reap_descendants() -> Result<u32> {
    kill_namespace();
    let mut reaped = 0;
    loop {
        match waitpid(Pid::from_raw(-1), None) {
            Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => reaped += 1,
            Ok(_) => continue,
            Err(Errno::ECHILD) => return Ok(reaped),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(supervision_error("waitpid(reap)", e)),
        }
    }
}

fn confine_and_supervise(
    request: &LaunchRequest,
    fs_security: &mut FilesystemSecurity,
    status: &mut ProxyStatus,
) -> Result<()> {
    let (rooted, entry) = Confinement::<NamespacesEntered>::entered(request.instance_id.clone())
        .set_hostname(&request.hostname)?
        .make_mounts_private()?
        .confirm_cgroup_attached()?
        .enter_root(fs_security)?;
    status.root_entry = Some(entry.as_str().to_string());

    // Closed by a successful exec; carries an InitFailure otherwise.
    let (report_read, report_write) =
        pipe2(OFlag::O_CLOEXEC).map_err(|e| supervision_error("pipe2(exec report)", e))?;

    // SAFETY: the sandbox init is single threaded; the child execs or exits.
    let payload = match unsafe { fork() }.map_err(|e| supervision_error("fork(payload)", e))? {
        ForkResult::Child => {
            drop(report_read);
            let err = run_payload(rooted, request);
            let _ = write_json(
                File::from(report_write),
                &InitFailure::from_error(&err),
                "exec report",
            );
            // SAFETY: leave without running the init's destructors.
            unsafe { libc::_exit(PAYLOAD_SETUP_EXIT) }
        }
        ForkResult::Parent { child } => child,
    };
    drop(report_write);
    status.payload_pid = Some(payload.as_raw());
    log::debug!("Payload forked as pid {} in the sandbox", payload);

    let mut report = Vec::new();
    File::from(report_read).read_to_end(&mut report)?;

    wait_for_payload(payload, status)?;
    status.reaped_descendants = reap_descendants()?;

    if !report.is_empty() {
        let failure = serde_json::from_slice::<InitFailure>(&report).unwrap_or_else(|e| {
            InitFailure::Exec {
                message: format!("undecodable exec report: {e}"),
            }
        });
        status.failure = Some(failure);
    }
    Ok(())
}

fn run_init(request: &LaunchRequest) -> ProxyStatus {
    let mut status = ProxyStatus::default();
    let mut fs_security = FilesystemSecurity::new(&request.root);

    if let Err(err) = confine_and_supervise(request, &mut fs_security, &mut status) {
        log::error!("Sandbox init for {} failed: {}", request.instance_id, err);
        status.failure = Some(InitFailure::from_error(&err));
        // Setup may have failed with children already running.
        if status.payload_pid.is_some() {
            if let Ok(reaped) = reap_descendants() {
                status.reaped_descendants += reaped;
            }
        }
    }

    status.unmount_errors = fs_security.unmount_pseudo_filesystems();
    status
}

/// Entry point of the clone()-created sandbox init (PID 1 of the new PID namespace).
///
/// Blocks reading the launch request; the supervisor writes it only after the
/// init has been attached to the launch cgroup. Returns the process exit code.
pub fn run_init_main(launch_fd: RawFd, status_fd: RawFd) -> isize {
    // SAFETY: both descriptors were handed over by the supervisor and are used once.
    let launch = unsafe { File::from_raw_fd(launch_fd) };
    let status_pipe = unsafe { File::from_raw_fd(status_fd) };

    let status = match prepare_init()
        .and_then(|()| read_json::<LaunchRequest>(launch, "launch request"))
    {
        Ok(request) => run_init(&request),
        Err(err) => ProxyStatus {
            failure: Some(InitFailure::from_error(&err)),
            ..ProxyStatus::default()
        },
    };

    if let Err(err) = write_json(status_pipe, &status, "init status") {
        log::error!("Sandbox init could not report status: {}", err);
        return 2;
    }
    if status.failure.is_some() {
        1
    } else {
        0
    }
}
