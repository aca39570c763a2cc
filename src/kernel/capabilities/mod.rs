//! Linux capability management for privilege minimization.
//!
//! The sandboxed command keeps exactly the capabilities named by its policy;
//! everything else is removed from every set before exec.

mod drop;
mod query;

pub use drop::{restrict_to_mask, set_no_new_privs};
pub use query::{last_capability, read_capability_status, CapabilityStatus};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Capability number newtype for type safety.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CapabilityNumber(u32);

impl CapabilityNumber {
    pub const MAX_CAP: u32 = 63;

    pub fn new(cap: u32) -> Option<Self> {
        if cap <= Self::MAX_CAP {
            Some(Self(cap))
        } else {
            None
        }
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// Look up a capability by name; accepts `CAP_SYS_ADMIN` or `sys_admin`.
    pub fn from_name(name: &str) -> Option<Self> {
        let upper = name.trim().to_ascii_uppercase();
        let canonical = if upper.starts_with("CAP_") {
            upper
        } else {
            format!("CAP_{}", upper)
        };
        CAPABILITY_NAMES
            .iter()
            .position(|known| *known == canonical)
            .map(|idx| Self(idx as u32))
    }

    pub fn name(self) -> Option<&'static str> {
        CAPABILITY_NAMES.get(self.0 as usize).copied()
    }
}

/// Capability names indexed by number (linux/capability.h).
pub const CAPABILITY_NAMES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_DAC_READ_SEARCH",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_KILL",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETPCAP",
    "CAP_LINUX_IMMUTABLE",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_BROADCAST",
    "CAP_NET_ADMIN",
    "CAP_NET_RAW",
    "CAP_IPC_LOCK",
    "CAP_IPC_OWNER",
    "CAP_SYS_MODULE",
    "CAP_SYS_RAWIO",
    "CAP_SYS_CHROOT",
    "CAP_SYS_PTRACE",
    "CAP_SYS_PACCT",
    "CAP_SYS_ADMIN",
    "CAP_SYS_BOOT",
    "CAP_SYS_NICE",
    "CAP_SYS_RESOURCE",
    "CAP_SYS_TIME",
    "CAP_SYS_TTY_CONFIG",
    "CAP_MKNOD",
    "CAP_LEASE",
    "CAP_AUDIT_WRITE",
    "CAP_AUDIT_CONTROL",
    "CAP_SETFCAP",
    "CAP_MAC_OVERRIDE",
    "CAP_MAC_ADMIN",
    "CAP_SYSLOG",
    "CAP_WAKE_ALARM",
    "CAP_BLOCK_SUSPEND",
    "CAP_AUDIT_READ",
    "CAP_PERFMON",
    "CAP_BPF",
    "CAP_CHECKPOINT_RESTORE",
];

pub const CAP_DAC_OVERRIDE: CapabilityNumber = CapabilityNumber(1);
pub const CAP_KILL: CapabilityNumber = CapabilityNumber(5);
pub const CAP_SETPCAP: CapabilityNumber = CapabilityNumber(8);
pub const CAP_SYS_ADMIN: CapabilityNumber = CapabilityNumber(21);
pub const CAP_SYS_RESOURCE: CapabilityNumber = CapabilityNumber(24);
pub const CAP_MKNOD: CapabilityNumber = CapabilityNumber(27);
pub const CAP_AUDIT_WRITE: CapabilityNumber = CapabilityNumber(29);

/// Bit set of capabilities, one bit per capability number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityMask(u64);

impl CapabilityMask {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Audit-only set retained by default.
    pub fn audit_only() -> Self {
        Self::empty().with(CAP_AUDIT_WRITE)
    }

    /// Build a mask from capability names; returns the first unknown name on failure.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> std::result::Result<Self, String> {
        names.iter().try_fold(Self::empty(), |mask, name| {
            CapabilityNumber::from_name(name.as_ref())
                .map(|cap| mask.with(cap))
                .ok_or_else(|| name.as_ref().to_string())
        })
    }

    pub fn with(self, cap: CapabilityNumber) -> Self {
        Self(self.0 | (1u64 << cap.value()))
    }

    pub fn contains(self, cap: CapabilityNumber) -> bool {
        self.0 & (1u64 << cap.value()) != 0
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Lower and upper 32-bit halves, as capset(2) wants them.
    pub fn halves(self) -> (u32, u32) {
        (self.0 as u32, (self.0 >> 32) as u32)
    }

    pub fn iter(self) -> impl Iterator<Item = CapabilityNumber> {
        (0..=CapabilityNumber::MAX_CAP)
            .filter_map(CapabilityNumber::new)
            .filter(move |cap| self.contains(*cap))
    }

    pub fn names(self) -> Vec<String> {
        self.iter()
            .map(|cap| {
                cap.name()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("cap_{}", cap.value()))
            })
            .collect()
    }
}

impl fmt::Display for CapabilityMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

pub(crate) const PR_CAPBSET_DROP: libc::c_int = 24;
pub(crate) const PR_SET_NO_NEW_PRIVS: libc::c_int = 38;
pub(crate) const PR_CAP_AMBIENT: libc::c_int = 47;
pub(crate) const PR_CAP_AMBIENT_CLEAR_ALL: libc::c_int = 4;
pub(crate) const LINUX_CAPABILITY_VERSION_3: u32 = 0x20080522;
