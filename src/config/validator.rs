//! Preflight validation of the jail root and the command it will run.
//!
//! Runs before any namespace or cgroup exists and never writes to the root.
//! Symlinks are resolved against the jail root, never against the host.

use crate::config::policy::SandboxPolicy;
use crate::config::types::{Result, SandboxError};
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

/// `PATH` given to the sandboxed command unless the policy overrides it.
pub const SANDBOX_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Directories that qualify a root as provisioned.
const BINARY_DIRS: [&str; 2] = ["bin", "usr/bin"];

/// Directories the sandbox init mounts over; created at launch when absent.
const MOUNT_POINTS: [&str; 3] = ["proc", "dev", "sys"];

const MAX_SYMLINK_HOPS: usize = 40;

/// Verified layout of a jail root.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JailLayout {
    /// Canonical host path of the root
    pub root: PathBuf,
    /// Binary directories found, as paths inside the jail
    pub binary_dirs: Vec<PathBuf>,
    /// Command program as a path inside the jail
    pub program: PathBuf,
    /// Same program as a host path
    pub host_program: PathBuf,
    /// Non-fatal observations
    pub warnings: Vec<String>,
}

fn not_provisioned(root: &Path, reason: impl Into<String>) -> SandboxError {
    SandboxError::JailNotProvisioned {
        path: root.to_path_buf(),
        reason: reason.into(),
    }
}

/// Confirm the jail root is usable and locate the command inside it.
pub fn preflight(policy: &SandboxPolicy) -> Result<JailLayout> {
    let requested = policy.root_path();
    let metadata = fs::metadata(requested)
        .map_err(|e| not_provisioned(requested, format!("cannot access root: {}", e)))?;
    if !metadata.is_dir() {
        return Err(not_provisioned(requested, "root is not a directory"));
    }
    let root = fs::canonicalize(requested)
        .map_err(|e| not_provisioned(requested, format!("cannot resolve root: {}", e)))?;

    let binary_dirs: Vec<PathBuf> = BINARY_DIRS
        .iter()
        .filter_map(|dir| resolve_in_root(&root, Path::new(dir)).ok())
        .filter(|inside| host_path(&root, inside).is_dir())
        .collect();
    if binary_dirs.is_empty() {
        return Err(not_provisioned(
            &root,
            "no executable-binary directory (bin or usr/bin)",
        ));
    }

    let mut warnings = Vec::new();
    for dir in MOUNT_POINTS {
        if !root.join(dir).is_dir() {
            warnings.push(format!("/{} missing, will be created at launch", dir));
        }
    }
    if metadata.permissions().mode() & 0o002 != 0 {
        warnings.push("root directory is world-writable".to_string());
    }

    let path_var = policy
        .env()
        .get("PATH")
        .map(String::as_str)
        .unwrap_or(SANDBOX_PATH);
    let (program, resolved) = resolve_program(&root, &policy.command()[0], path_var)?;
    let host_program = host_path(&root, &resolved);

    log::debug!(
        "Preflight ok: root={} program={} (host {})",
        root.display(),
        program.display(),
        host_program.display()
    );

    Ok(JailLayout {
        root,
        binary_dirs,
        program,
        host_program,
        warnings,
    })
}

/// Host location of a path inside the jail.
pub fn host_path(root: &Path, inside: &Path) -> PathBuf {
    root.join(inside.strip_prefix("/").unwrap_or(inside))
}

/// Resolve `path` (absolute or relative to the jail's `/`) to its final
/// in-jail location, following symlinks as the jail would see them.
pub fn resolve_in_root(root: &Path, path: &Path) -> std::result::Result<PathBuf, String> {
    let mut resolved = PathBuf::from("/");
    let mut pending: Vec<OsString> = components_of(path);
    pending.reverse();
    let mut hops = 0;

    while let Some(name) = pending.pop() {
        if name == ".." {
            resolved.pop();
            continue;
        }
        let candidate = resolved.join(&name);
        let on_host = host_path(root, &candidate);
        let meta = fs::symlink_metadata(&on_host)
            .map_err(|e| format!("{}: {}", candidate.display(), e))?;

        if meta.file_type().is_symlink() {
            hops += 1;
            if hops > MAX_SYMLINK_HOPS {
                return Err(format!("{}: too many levels of symbolic links", path.display()));
            }
            let target = fs::read_link(&on_host)
                .map_err(|e| format!("{}: {}", candidate.display(), e))?;
            if target.is_absolute() {
                resolved = PathBuf::from("/");
            }
            let mut expanded = components_of(&target);
            expanded.reverse();
            pending.extend(expanded);
        } else {
            resolved = candidate;
        }
    }
    Ok(resolved)
}

fn components_of(path: &Path) -> Vec<OsString> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_os_string()),
            Component::ParentDir => Some(OsString::from("..")),
            _ => None,
        })
        .collect()
}

fn is_executable_file(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Returns the program path as the command will name it and its symlink-free location.
fn resolve_program(root: &Path, program: &str, path_var: &str) -> Result<(PathBuf, PathBuf)> {
    if program.contains('/') {
        let inside = resolve_in_root(root, Path::new(program)).map_err(|e| {
            SandboxError::ExecutionFailed(format!("command '{}' not found in jail: {}", program, e))
        })?;
        if !is_executable_file(&host_path(root, &inside)) {
            return Err(SandboxError::ExecutionFailed(format!(
                "command '{}' is not an executable file",
                program
            )));
        }
        return Ok((Path::new("/").join(program.trim_start_matches('/')), inside));
    }

    for dir in path_var.split(':').filter(|d| d.starts_with('/')) {
        let candidate = Path::new(dir).join(program);
        if let Ok(inside) = resolve_in_root(root, &candidate) {
            if is_executable_file(&host_path(root, &inside)) {
                return Ok((candidate, inside));
            }
        }
    }
    Err(SandboxError::ExecutionFailed(format!(
        "command '{}' not found in jail PATH {}",
        program, path_var
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::policy::RawPolicy;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn write_exec(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn policy(root: &Path, command: &[&str]) -> SandboxPolicy {
        let raw = RawPolicy::new(root, command.iter().map(|s| s.to_string()).collect());
        SandboxPolicy::from_raw_with_cpus(raw, 1).unwrap()
    }

    #[test]
    fn missing_root_is_not_provisioned() {
        let err = preflight(&policy(Path::new("/nonexistent/jailbox-root"), &["sh"])).unwrap_err();
        assert!(matches!(err, SandboxError::JailNotProvisioned { .. }));
    }

    #[test]
    fn root_without_binary_dir_is_not_provisioned() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("etc")).unwrap();
        let err = preflight(&policy(dir.path(), &["sh"])).unwrap_err();
        match err {
            SandboxError::JailNotProvisioned { reason, .. } => assert!(reason.contains("bin")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn file_root_is_not_provisioned() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = preflight(&policy(file.path(), &["sh"])).unwrap_err();
        assert!(matches!(err, SandboxError::JailNotProvisioned { .. }));
    }

    #[test]
    fn program_is_found_on_sandbox_path() {
        let dir = TempDir::new().unwrap();
        write_exec(&dir.path().join("usr/bin/env"));
        let layout = preflight(&policy(dir.path(), &["env"])).unwrap();
        assert_eq!(layout.program, PathBuf::from("/usr/bin/env"));
        assert_eq!(layout.binary_dirs, vec![PathBuf::from("/usr/bin")]);
        assert!(layout.warnings.iter().any(|w| w.contains("/proc")));
    }

    #[test]
    fn absolute_symlink_resolves_inside_root() {
        let dir = TempDir::new().unwrap();
        write_exec(&dir.path().join("usr/bin/busybox"));
        symlink("/usr/bin", dir.path().join("bin")).unwrap();
        let layout = preflight(&policy(dir.path(), &["/bin/busybox"])).unwrap();
        assert_eq!(layout.program, PathBuf::from("/bin/busybox"));
        assert_eq!(layout.host_program, layout.root.join("usr/bin/busybox"));
        assert_eq!(layout.binary_dirs.len(), 2);
    }

    #[test]
    fn escaping_symlink_stays_in_root() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("usr")).unwrap();
        symlink("../../../../..", dir.path().join("usr/up")).unwrap();
        let resolved = resolve_in_root(dir.path(), Path::new("/usr/up/etc")).unwrap_err();
        assert!(resolved.contains("/etc"));
        let resolved = resolve_in_root(dir.path(), Path::new("/usr/up")).unwrap();
        assert_eq!(resolved, PathBuf::from("/"));
    }

    #[test]
    fn symlink_loop_is_detected() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("bin")).unwrap();
        symlink("/bin/b", dir.path().join("bin/a")).unwrap();
        symlink("/bin/a", dir.path().join("bin/b")).unwrap();
        let err = resolve_in_root(dir.path(), Path::new("/bin/a")).unwrap_err();
        assert!(err.contains("too many levels"));
    }

    #[test]
    fn missing_program_is_execution_failure() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("bin")).unwrap();
        let err = preflight(&policy(dir.path(), &["definitely-missing"])).unwrap_err();
        assert!(matches!(err, SandboxError::ExecutionFailed(_)));
    }

    #[test]
    fn non_executable_program_is_execution_failure() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("bin")).unwrap();
        fs::write(dir.path().join("bin/data"), b"x").unwrap();
        let err = preflight(&policy(dir.path(), &["/bin/data"])).unwrap_err();
        assert!(matches!(err, SandboxError::ExecutionFailed(_)));
    }

    #[test]
    fn policy_path_overrides_search_path() {
        let dir = TempDir::new().unwrap();
        write_exec(&dir.path().join("opt/tools/run"));
        fs::create_dir(dir.path().join("bin")).unwrap();
        let mut raw = RawPolicy::new(dir.path(), vec!["run".to_string()]);
        raw.env.insert("PATH".into(), "/opt/tools".into());
        let policy = SandboxPolicy::from_raw_with_cpus(raw, 1).unwrap();
        assert_eq!(preflight(&policy).unwrap().program, PathBuf::from("/opt/tools/run"));
    }
}
