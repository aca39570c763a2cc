/// Filesystem isolation inside the sandbox mount namespace
use crate::config::types::{Result, SandboxError, SetupStage};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use nix::unistd::{chdir, chroot, pivot_root};
use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

/// Mount points populated with fresh pseudo filesystems, in mount order.
pub const PSEUDO_MOUNT_POINTS: [&str; 3] = ["proc", "dev", "sys"];

/// Minimal device set on the sandbox /dev: (name, major, minor).
pub const DEVICE_NODES: [(&str, u64, u64); 5] = [
    ("null", 1, 3),
    ("zero", 1, 5),
    ("full", 1, 7),
    ("random", 1, 8),
    ("urandom", 1, 9),
];

/// Entries of the sandbox /proc made read-only. Most /proc/sys handlers check
/// only for uid 0, so dropped capabilities do not protect them.
pub const PROC_READONLY_PATHS: [&str; 4] = ["sys", "sysrq-trigger", "irq", "bus"];

/// Entries of the sandbox /proc hidden behind /dev/null.
pub const PROC_MASKED_PATHS: [&str; 2] = ["kcore", "timer_list"];

const DEV_SYMLINKS: [(&str, &str); 4] = [
    ("fd", "/proc/self/fd"),
    ("stdin", "/proc/self/fd/0"),
    ("stdout", "/proc/self/fd/1"),
    ("stderr", "/proc/self/fd/2"),
];

fn mount_error(what: &str, err: impl std::fmt::Display) -> SandboxError {
    SandboxError::setup(SetupStage::Mounts, format!("{}: {}", what, err))
}

/// The entries of `names` that exist under `dir`.
fn existing_entries(dir: &Path, names: &[&str]) -> Vec<PathBuf> {
    names
        .iter()
        .map(|name| dir.join(name))
        .filter(|path| path.exists())
        .collect()
}

/// How the sandbox root was entered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootEntry {
    PivotRoot,
    Chroot,
}

impl RootEntry {
    pub fn as_str(self) -> &'static str {
        match self {
            RootEntry::PivotRoot => "pivot_root",
            RootEntry::Chroot => "chroot",
        }
    }
}

/// Filesystem security controller for one sandbox root
#[derive(Clone, Debug)]
pub struct FilesystemSecurity {
    /// Host path of the jail root
    root: PathBuf,
    /// Pseudo filesystems mounted so far, as paths valid from the current root
    mounted: Vec<PathBuf>,
}

impl FilesystemSecurity {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mounted: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mounted(&self) -> &[PathBuf] {
        &self.mounted
    }

    /// Create /proc, /dev and /sys in the root when a minimal tree lacks them.
    pub fn ensure_mount_points(&self) -> Result<()> {
        for dir in PSEUDO_MOUNT_POINTS {
            let path = self.root.join(dir);
            if !path.is_dir() {
                fs::create_dir_all(&path)
                    .map_err(|e| mount_error(&format!("create {}", path.display()), e))?;
                log::debug!("Created mount point {}", path.display());
            }
        }
        Ok(())
    }

    /// Bind the root onto itself so it becomes a mount point pivot_root accepts.
    pub fn bind_root(&self) -> Result<()> {
        mount(
            Some(&self.root),
            &self.root,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| mount_error(&format!("bind mount {}", self.root.display()), e))
    }

    /// Fresh proc with its kernel tunables read-only, tmpfs /dev with minimal
    /// nodes, read-only sysfs.
    pub fn mount_pseudo_filesystems(&mut self) -> Result<()> {
        let common = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;

        let proc_path = self.root.join("proc");
        mount(Some("proc"), &proc_path, Some("proc"), common, None::<&str>)
            .map_err(|e| mount_error("mount proc", e))?;
        self.mounted.push(proc_path);

        let dev_path = self.root.join("dev");
        mount(
            Some("tmpfs"),
            &dev_path,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NOATIME,
            Some("size=64k,mode=755"),
        )
        .map_err(|e| mount_error("mount tmpfs on /dev", e))?;
        self.mounted.push(dev_path.clone());
        Self::create_minimal_devices(&dev_path)?;

        let sys_path = self.root.join("sys");
        mount(
            Some("sysfs"),
            &sys_path,
            Some("sysfs"),
            common | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| mount_error("mount sysfs", e))?;
        self.mounted.push(sys_path);

        self.harden_proc()?;

        log::debug!("Mounted pseudo filesystems under {}", self.root.display());
        Ok(())
    }

    /// Bind the writable kernel interfaces of the sandbox /proc read-only and
    /// mask the ones that leak host memory. Needs /dev/null in place.
    fn harden_proc(&mut self) -> Result<()> {
        let proc_path = self.root.join("proc");
        let locked = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;

        for target in existing_entries(&proc_path, &PROC_READONLY_PATHS) {
            let what = format!("read-only bind {}", target.display());
            mount(
                Some(&target),
                &target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REC,
                None::<&str>,
            )
            .map_err(|e| mount_error(&what, e))?;
            self.mounted.push(target.clone());
            mount(
                None::<&str>,
                &target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | locked,
                None::<&str>,
            )
            .map_err(|e| mount_error(&what, e))?;
        }

        let null = self.root.join("dev").join("null");
        for target in existing_entries(&proc_path, &PROC_MASKED_PATHS) {
            mount(
                Some(&null),
                &target,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )
            .map_err(|e| mount_error(&format!("mask {}", target.display()), e))?;
            self.mounted.push(target);
        }

        log::debug!("Hardened {}", proc_path.display());
        Ok(())
    }

    fn create_minimal_devices(dev_path: &Path) -> Result<()> {
        for (name, major, minor) in DEVICE_NODES {
            let node = dev_path.join(name);
            mknod(
                &node,
                SFlag::S_IFCHR,
                Mode::from_bits_truncate(0o666),
                makedev(major, minor),
            )
            .map_err(|e| mount_error(&format!("mknod /dev/{}", name), e))?;
            // mknod is subject to umask
            fs::set_permissions(&node, fs::Permissions::from_mode(0o666))
                .map_err(|e| mount_error(&format!("chmod /dev/{}", name), e))?;
        }
        for (name, target) in DEV_SYMLINKS {
            symlink(target, dev_path.join(name))
                .map_err(|e| mount_error(&format!("symlink /dev/{}", name), e))?;
        }
        Ok(())
    }

    /// Make the root the process root: pivot_root, or chroot when the
    /// current root cannot be pivoted (initramfs).
    pub fn enter_root(&mut self) -> Result<RootEntry> {
        let stage_error = |what: &str, e: nix::errno::Errno| {
            SandboxError::setup(SetupStage::RootTransition, format!("{}: {}", what, e))
        };

        chdir(&self.root).map_err(|e| stage_error("chdir to root", e))?;

        match pivot_root(".", ".") {
            Ok(()) => {
                // Old root is stacked on top of the new one; detach it.
                umount2(".", MntFlags::MNT_DETACH)
                    .map_err(|e| stage_error("detach old root", e))?;
                chdir("/").map_err(|e| stage_error("chdir /", e))?;
                self.rebase_mounts();
                log::debug!("Entered {} via pivot_root", self.root.display());
                Ok(RootEntry::PivotRoot)
            }
            Err(pivot_err) => {
                log::warn!("pivot_root failed ({}), falling back to chroot", pivot_err);
                chroot(".").map_err(|e| stage_error("chroot", e))?;
                chdir("/").map_err(|e| stage_error("chdir /", e))?;
                self.rebase_mounts();
                Ok(RootEntry::Chroot)
            }
        }
    }

    /// Host paths under the root become in-jail paths once the root is `/`.
    fn rebase_mounts(&mut self) {
        let root = self.root.clone();
        for target in &mut self.mounted {
            if let Ok(inside) = target.strip_prefix(&root) {
                *target = Path::new("/").join(inside);
            }
        }
    }

    /// Detach pseudo filesystems in reverse mount order.
    pub fn unmount_pseudo_filesystems(&mut self) -> Vec<String> {
        let mut errors = Vec::new();
        while let Some(target) = self.mounted.pop() {
            if let Err(e) = umount2(&target, MntFlags::MNT_DETACH) {
                errors.push(format!("umount {}: {}", target.display(), e));
            }
        }
        errors
    }
}
