use crate::config::loader::LauncherConfig;
use crate::config::policy::{RawPolicy, SandboxPolicy};
use crate::config::types::{ExecutionResult, SandboxError, FORCED_TERMINATION_EXIT_CODE};
use crate::config::validator::preflight;
use crate::core::launcher::{CancellationToken, Launcher};
use crate::kernel::cgroup::backend::{backend_type_name, detect_cgroup_backend};
use crate::kernel::namespace::NamespaceIsolation;
use crate::kernel::privilege::PrivilegeContext;
use crate::kernel::signal::SignalHandler;
use crate::observability::audit::AuditLogger;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Process exit code for a command stopped by a limit or by cancellation.
pub const FORCED_TERMINATION_PROCESS_EXIT: i32 = 125;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Launcher configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Append audit events to this JSONL file
    #[arg(long, global = true)]
    audit_log: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command inside a sandbox
    Run {
        #[command(flatten)]
        policy: PolicyArgs,
        /// Print the full result as JSON on stdout
        #[arg(long)]
        json: bool,
    },
    /// Report preflight, privilege and cgroup status as JSON
    Check {
        #[command(flatten)]
        policy: PolicyArgs,
    },
}

/// Policy flags; each overrides the same field of `--policy`.
#[derive(Args, Debug, Default)]
struct PolicyArgs {
    /// Policy file (JSON)
    #[arg(long)]
    policy: Option<PathBuf>,
    /// Prepared root filesystem
    #[arg(long)]
    root: Option<PathBuf>,
    /// CPU quota as a percentage of one core, e.g. 50%
    #[arg(long)]
    cpu: Option<String>,
    /// Memory ceiling, e.g. 128M
    #[arg(long)]
    memory: Option<String>,
    /// Relative I/O weight in [10, 1000]
    #[arg(long)]
    io_weight: Option<u32>,
    /// Keep the host network namespace
    #[arg(long)]
    share_network: bool,
    /// Capability to retain (repeatable); replaces the default set
    #[arg(long = "cap", value_name = "CAP")]
    capabilities: Vec<String>,
    #[arg(long)]
    hostname: Option<String>,
    /// CPU time limit in milliseconds
    #[arg(long)]
    cpu_time_ms: Option<u64>,
    /// Wall clock limit in milliseconds
    #[arg(long)]
    wall_time_ms: Option<u64>,
    /// Extra environment variable (KEY=VALUE, repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,
    /// Command and arguments to execute
    #[arg(last = true)]
    command: Vec<String>,
}

impl PolicyArgs {
    fn into_raw(self) -> Result<RawPolicy> {
        let mut raw = match &self.policy {
            Some(path) => RawPolicy::load_from_file(path)?,
            None => RawPolicy::default(),
        };
        if let Some(root) = self.root {
            raw.root_path = root;
        }
        if let Some(cpu) = self.cpu {
            raw.cpu_quota = cpu;
        }
        if let Some(memory) = self.memory {
            raw.memory_limit = memory;
        }
        if let Some(weight) = self.io_weight {
            raw.io_weight = weight;
        }
        if self.share_network {
            raw.network_isolated = false;
        }
        if !self.capabilities.is_empty() {
            raw.capabilities = Some(self.capabilities);
        }
        if let Some(hostname) = self.hostname {
            raw.hostname = hostname;
        }
        if self.cpu_time_ms.is_some() {
            raw.cpu_time_limit_ms = self.cpu_time_ms;
        }
        if self.wall_time_ms.is_some() {
            raw.wall_time_limit_ms = self.wall_time_ms;
        }
        for pair in self.env {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("--env expects KEY=VALUE, got '{}'", pair))?;
            raw.env.insert(key.to_string(), value.to_string());
        }
        if !self.command.is_empty() {
            raw.command = self.command;
        }
        Ok(raw)
    }
}

/// Map a result to the launcher's process exit code.
pub fn process_exit_code(result: &ExecutionResult) -> i32 {
    if result.exit_code == FORCED_TERMINATION_EXIT_CODE {
        FORCED_TERMINATION_PROCESS_EXIT
    } else {
        result.exit_code
    }
}

fn report_error(err: &SandboxError) -> i32 {
    eprintln!("jailbox: {}", err);
    i32::from(err)
}

/// Cancel `token` when SIGINT, SIGTERM or SIGHUP arrives, until `done` is set.
fn bridge_signals(
    handler: SignalHandler,
    token: CancellationToken,
    done: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        while !done.load(Ordering::SeqCst) {
            if handler.wait_for_signal(Duration::from_millis(100)) {
                log::info!("Signal {} received, cancelling launch", handler.get_signal());
                token.cancel();
                return;
            }
        }
    })
}

fn run_command(config: LauncherConfig, audit: AuditLogger, args: PolicyArgs, json: bool) -> Result<i32> {
    let handler = SignalHandler::init()?;

    let policy = match SandboxPolicy::from_raw(args.into_raw()?) {
        Ok(policy) => policy,
        Err(err) => return Ok(report_error(&err)),
    };
    let privilege = PrivilegeContext::probe()?;
    let launcher = Launcher::new(config, privilege).with_audit(audit);

    let token = CancellationToken::new();
    let done = Arc::new(AtomicBool::new(false));
    let watcher = bridge_signals(handler, token.clone(), done.clone());

    let outcome = launcher.launch(&policy, &token);
    done.store(true, Ordering::SeqCst);
    let _ = watcher.join();

    match outcome {
        Ok(result) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                log::info!(
                    "{} finished: {:?}, {} ms",
                    result.instance_id,
                    result.termination,
                    result.wall_time_ms
                );
            }
            if !result.teardown.complete {
                eprintln!("jailbox: teardown incomplete: {:?}", result.teardown.errors);
            }
            Ok(process_exit_code(&result))
        }
        Err(err) => Ok(report_error(&err)),
    }
}

fn run_check(config: &LauncherConfig, args: PolicyArgs) -> Result<i32> {
    let privilege = PrivilegeContext::probe()?.report();
    let backend = detect_cgroup_backend(&config.cgroup_root);

    let preflight_report = match SandboxPolicy::from_raw(args.into_raw()?) {
        Ok(policy) => match preflight(&policy) {
            Ok(layout) => serde_json::json!({ "ok": true, "layout": layout }),
            Err(err) => serde_json::json!({ "ok": false, "kind": err.kind(), "error": err.to_string() }),
        },
        Err(err) => serde_json::json!({ "ok": false, "kind": err.kind(), "error": err.to_string() }),
    };

    let ready = preflight_report["ok"] == true && privilege.sufficient && backend.is_some();
    let report = serde_json::json!({
        "ready": ready,
        "preflight": preflight_report,
        "privilege": privilege,
        "cgroup": {
            "root": config.cgroup_root,
            "backend": backend.map(backend_type_name),
            "force_v1": config.force_cgroup_v1,
        },
        "namespaces_supported": NamespaceIsolation::is_supported(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if ready { 0 } else { 1 })
}

/// CLI entry point; returns the process exit code.
pub fn run() -> Result<i32> {
    env_logger::init();

    let cli = Cli::parse();
    let mut config = LauncherConfig::load_or_default(cli.config.as_deref())?;
    if cli.audit_log.is_some() {
        config.audit_log = cli.audit_log;
    }

    match cli.command {
        Commands::Run { policy, json } => {
            let audit = AuditLogger::new(config.audit_log.as_deref())?;
            run_command(config, audit, policy, json)
        }
        Commands::Check { policy } => run_check(&config, policy),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{LimitKind, Termination};

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn run_flags_override_defaults() {
        let cli = parse(&[
            "jailbox", "run", "--root", "/srv/jail", "--cpu", "50%", "--memory", "128M",
            "--cap", "CAP_NET_RAW", "--env", "LANG=C", "--share-network", "--", "/bin/echo",
            "hi",
        ]);
        let Commands::Run { policy, json } = cli.command else {
            panic!("expected run");
        };
        assert!(!json);
        let raw = policy.into_raw().unwrap();
        assert_eq!(raw.root_path, PathBuf::from("/srv/jail"));
        assert_eq!(raw.cpu_quota, "50%");
        assert_eq!(raw.memory_limit, "128M");
        assert!(!raw.network_isolated);
        assert_eq!(raw.capabilities, Some(vec!["CAP_NET_RAW".to_string()]));
        assert_eq!(raw.env.get("LANG").map(String::as_str), Some("C"));
        assert_eq!(raw.command, vec!["/bin/echo", "hi"]);
    }

    #[test]
    fn defaults_keep_network_isolated_and_audit_caps() {
        let cli = parse(&["jailbox", "check", "--root", "/srv/jail", "--", "true"]);
        let Commands::Check { policy } = cli.command else {
            panic!("expected check");
        };
        let raw = policy.into_raw().unwrap();
        assert!(raw.network_isolated);
        assert!(raw.capabilities.is_none());
    }

    #[test]
    fn malformed_env_is_rejected() {
        let args = PolicyArgs {
            env: vec!["NOEQUALS".to_string()],
            ..PolicyArgs::default()
        };
        assert!(args.into_raw().is_err());
    }

    #[test]
    fn forced_terminations_exit_125() {
        let termination = Termination::LimitExceeded {
            limit: LimitKind::Memory,
            signal: Some(9),
        };
        let result = ExecutionResult {
            instance_id: "x".to_string(),
            exit_code: termination.exit_code(),
            signal: termination.signal(),
            termination,
            wall_time_ms: 1,
            limits_hit: Default::default(),
            usage: Default::default(),
            teardown: Default::default(),
        };
        assert_eq!(process_exit_code(&result), FORCED_TERMINATION_PROCESS_EXIT);
    }

    #[test]
    fn signalled_exit_code_passes_through() {
        let termination = Termination::Signaled { signal: 15 };
        let result = ExecutionResult {
            instance_id: "x".to_string(),
            exit_code: termination.exit_code(),
            signal: termination.signal(),
            termination,
            wall_time_ms: 1,
            limits_hit: Default::default(),
            usage: Default::default(),
            teardown: Default::default(),
        };
        assert_eq!(process_exit_code(&result), 143);
    }
}
