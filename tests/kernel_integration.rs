//! End-to-end launches against a real kernel.
//!
//! Need root, a cgroup hierarchy and a provisioned root filesystem (a static
//! busybox tree is enough) named by `JAILBOX_TEST_ROOTFS`. Each test skips
//! itself when any of these is missing.

use jailbox::config::loader::LauncherConfig;
use jailbox::config::policy::{RawPolicy, SandboxPolicy};
use jailbox::config::types::{ExecutionResult, LimitKind, SandboxError, Termination};
use jailbox::kernel::cgroup::detect_cgroup_backend;
use jailbox::kernel::privilege::PrivilegeContext;
use jailbox::{CancellationToken, Launcher};
use std::path::PathBuf;
use std::time::Duration;

fn test_rootfs() -> Option<PathBuf> {
    let privileged = PrivilegeContext::probe()
        .map(|p| p.require().is_ok())
        .unwrap_or(false);
    if !privileged {
        eprintln!("skipping: launcher capabilities unavailable");
        return None;
    }
    if detect_cgroup_backend(&LauncherConfig::default().cgroup_root).is_none() {
        eprintln!("skipping: no cgroup hierarchy");
        return None;
    }
    match std::env::var_os("JAILBOX_TEST_ROOTFS") {
        Some(path) => Some(PathBuf::from(path)),
        None => {
            eprintln!("skipping: JAILBOX_TEST_ROOTFS not set");
            None
        }
    }
}

fn shell(root: &PathBuf, script: &str) -> RawPolicy {
    RawPolicy::new(
        root,
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
    )
}

fn launch_raw(raw: RawPolicy) -> jailbox::Result<ExecutionResult> {
    launch_with(raw, &CancellationToken::new())
}

fn launch_with(raw: RawPolicy, token: &CancellationToken) -> jailbox::Result<ExecutionResult> {
    let policy = SandboxPolicy::from_raw(raw)?;
    let launcher = Launcher::new(LauncherConfig::default(), PrivilegeContext::probe()?);
    launcher.launch(&policy, token)
}

fn assert_torn_down(result: &ExecutionResult) {
    assert!(result.teardown.complete, "{:?}", result.teardown.errors);
    let group = LauncherConfig::default()
        .cgroup_root
        .join("jailbox")
        .join(&result.instance_id);
    assert!(!group.exists(), "{} left behind", group.display());
}

#[test]
fn exit_code_is_reported() {
    let Some(root) = test_rootfs() else { return };
    let result = launch_raw(shell(&root, "exit 7")).unwrap();
    assert_eq!(result.termination, Termination::Exited { code: 7 });
    assert_eq!(result.exit_code, 7);
    assert!(result.limits_hit.none());
    assert_torn_down(&result);
}

#[test]
fn self_inflicted_signal_is_128_plus_signal() {
    let Some(root) = test_rootfs() else { return };
    let result = launch_raw(shell(&root, "kill -TERM $$")).unwrap();
    assert_eq!(result.termination, Termination::Signaled { signal: 15 });
    assert_eq!(result.exit_code, 143);
    assert_torn_down(&result);
}

#[test]
fn command_is_pid_two_of_its_own_namespace() {
    let Some(root) = test_rootfs() else { return };
    let result = launch_raw(shell(&root, "test $$ -eq 2")).unwrap();
    assert!(result.success());
}

#[test]
fn hostname_is_set_inside_uts_namespace() {
    let Some(root) = test_rootfs() else { return };
    let mut raw = shell(&root, "read h < /proc/sys/kernel/hostname; test \"$h\" = box-under-test");
    raw.hostname = "box-under-test".to_string();
    assert!(launch_raw(raw).unwrap().success());
}

#[test]
fn isolated_network_has_only_loopback() {
    let Some(root) = test_rootfs() else { return };
    let raw = shell(
        &root,
        "for i in /sys/class/net/*; do case $i in */lo) ;; *) exit 1 ;; esac; done",
    );
    assert!(launch_raw(raw).unwrap().success());
}

fn host_net_namespace() -> String {
    std::fs::read_link("/proc/self/ns/net")
        .unwrap()
        .to_string_lossy()
        .into_owned()
}

#[test]
fn isolated_network_cannot_reach_outside() {
    let Some(root) = test_rootfs() else { return };
    let mut raw = shell(
        &root,
        "test \"$(readlink /proc/self/ns/net)\" != \"$HOST_NETNS\" || exit 1; \
         command -v nc >/dev/null || exit 4; \
         nc -w 1 1.1.1.1 53 </dev/null 2>&1 | grep -qi unreachable",
    );
    raw.env.insert("HOST_NETNS".to_string(), host_net_namespace());
    let result = launch_raw(raw).unwrap();
    if result.termination == (Termination::Exited { code: 4 }) {
        eprintln!("skipping connect attempt: no nc in test rootfs");
        return;
    }
    assert_eq!(result.termination, Termination::Exited { code: 0 });
    assert_torn_down(&result);
}

#[test]
fn shared_network_keeps_the_host_namespace() {
    let Some(root) = test_rootfs() else { return };
    let mut raw = shell(&root, "test \"$(readlink /proc/self/ns/net)\" = \"$HOST_NETNS\"");
    raw.network_isolated = false;
    raw.env.insert("HOST_NETNS".to_string(), host_net_namespace());
    let result = launch_raw(raw).unwrap();
    assert_eq!(result.termination, Termination::Exited { code: 0 });
    assert_torn_down(&result);
}

#[test]
fn command_keeps_only_the_audit_capability() {
    let Some(root) = test_rootfs() else { return };
    let raw = shell(
        &root,
        "grep -q '^CapEff:[[:space:]]*0000000020000000$' /proc/self/status \
         && grep -q '^NoNewPrivs:[[:space:]]*1$' /proc/self/status",
    );
    assert!(launch_raw(raw).unwrap().success());
}

#[test]
fn kernel_tunables_are_read_only() {
    let Some(root) = test_rootfs() else { return };
    // Writes back the current value, so a failing assertion leaves the host unchanged.
    let raw = shell(
        &root,
        "read p < /proc/sys/kernel/core_pattern || exit 2; \
         if (echo \"$p\" > /proc/sys/kernel/core_pattern) 2>/dev/null; then exit 1; fi; \
         if [ -e /proc/sysrq-trigger ] && (: > /proc/sysrq-trigger) 2>/dev/null; then exit 3; fi; \
         test ! -s /proc/kcore",
    );
    let result = launch_raw(raw).unwrap();
    assert_eq!(result.termination, Termination::Exited { code: 0 });
    assert_torn_down(&result);
}

#[test]
fn environment_is_sanitized() {
    let Some(root) = test_rootfs() else { return };
    let mut raw = shell(&root, "test \"$GREETING\" = hello && test -z \"$USER\" && test \"$HOME\" = /");
    raw.env.insert("GREETING".to_string(), "hello".to_string());
    assert!(launch_raw(raw).unwrap().success());
}

#[test]
fn missing_program_inside_root_fails_preflight() {
    let Some(root) = test_rootfs() else { return };
    let raw = RawPolicy::new(&root, vec!["/no/such/program".to_string()]);
    assert!(matches!(
        launch_raw(raw),
        Err(SandboxError::ExecutionFailed(_))
    ));
}

#[test]
fn wall_time_watchdog_terminates_with_sentinel() {
    let Some(root) = test_rootfs() else { return };
    let mut raw = shell(&root, "sleep 30");
    raw.wall_time_limit_ms = Some(300);
    let result = launch_raw(raw).unwrap();
    assert!(matches!(
        result.termination,
        Termination::LimitExceeded {
            limit: LimitKind::WallTime,
            ..
        }
    ));
    assert_eq!(result.exit_code, -1);
    assert!(result.limits_hit.wall_time);
    assert!(result.wall_time() < Duration::from_secs(10));
    assert_torn_down(&result);
}

#[test]
fn cpu_time_watchdog_stops_a_busy_loop() {
    let Some(root) = test_rootfs() else { return };
    let mut raw = shell(&root, "while :; do :; done");
    raw.cpu_time_limit_ms = Some(200);
    raw.wall_time_limit_ms = Some(20_000);
    let result = launch_raw(raw).unwrap();
    assert!(matches!(
        result.termination,
        Termination::LimitExceeded {
            limit: LimitKind::CpuTime,
            ..
        }
    ));
    assert!(result.usage.cpu_usage_usec >= 200_000);
}

#[test]
fn memory_limit_kill_is_reported_as_limit() {
    let Some(root) = test_rootfs() else { return };
    let mut raw = shell(
        &root,
        "x=$(head -c 268435456 /dev/zero | tr '\\0' a); echo ${#x}",
    );
    raw.memory_limit = "128M".to_string();
    raw.wall_time_limit_ms = Some(60_000);
    let result = launch_raw(raw).unwrap();
    assert_eq!(
        result.termination,
        Termination::LimitExceeded {
            limit: LimitKind::Memory,
            signal: Some(9)
        }
    );
    assert!(result.is_resource_limit_terminated());
    assert_eq!(result.exit_code, -1);
    assert!(result.limits_hit.memory);
    assert!(result.usage.oom_kill_events > 0);
    assert_torn_down(&result);
}

#[test]
fn cancellation_kills_the_sandbox() {
    let Some(root) = test_rootfs() else { return };
    let token = CancellationToken::new();
    let remote = token.clone();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(300));
        remote.cancel();
    });

    let result = launch_with(shell(&root, "sleep 30 & sleep 30"), &token).unwrap();
    canceller.join().unwrap();
    assert_eq!(result.termination, Termination::Cancelled);
    assert_eq!(result.exit_code, -1);
    assert_torn_down(&result);
}

#[test]
fn concurrent_launches_get_distinct_groups() {
    let Some(root) = test_rootfs() else { return };
    let handles: Vec<_> = (0..3)
        .map(|i| {
            let root = root.clone();
            std::thread::spawn(move || {
                let mut raw = shell(&root, "read h < /proc/sys/kernel/hostname; test \"$h\" = \"box$N\"");
                raw.hostname = format!("box{}", i);
                raw.env.insert("N".to_string(), i.to_string());
                launch_raw(raw).unwrap()
            })
        })
        .collect();

    let results: Vec<ExecutionResult> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for result in &results {
        assert!(result.success());
        assert_torn_down(result);
    }
    assert_ne!(results[0].instance_id, results[1].instance_id);
}
