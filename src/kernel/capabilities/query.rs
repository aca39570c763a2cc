//! Read-only capability inspection.
use super::CapabilityNumber;
use std::fs;

/// Fallback when /proc/sys/kernel/cap_last_cap is unreadable (CAP_CHECKPOINT_RESTORE).
const DEFAULT_LAST_CAP: u32 = 40;

/// Capability sets of the current process as reported by `/proc/self/status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityStatus {
    pub inheritable: u64,
    pub permitted: u64,
    pub effective: u64,
    pub bounding: u64,
    pub ambient: Option<u64>,
    pub no_new_privs: Option<bool>,
}

impl CapabilityStatus {
    pub fn parse(status: &str) -> Self {
        let mut parsed = Self::default();
        for line in status.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            let hex = || u64::from_str_radix(value, 16).unwrap_or(0);
            match key {
                "CapInh" => parsed.inheritable = hex(),
                "CapPrm" => parsed.permitted = hex(),
                "CapEff" => parsed.effective = hex(),
                "CapBnd" => parsed.bounding = hex(),
                "CapAmb" => parsed.ambient = Some(hex()),
                "NoNewPrivs" => parsed.no_new_privs = Some(value == "1"),
                _ => {}
            }
        }
        parsed
    }
}

pub fn read_capability_status() -> std::io::Result<CapabilityStatus> {
    fs::read_to_string("/proc/self/status").map(|s| CapabilityStatus::parse(&s))
}

/// Highest capability number the running kernel knows.
pub fn last_capability() -> u32 {
    fs::read_to_string("/proc/sys/kernel/cap_last_cap")
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .map(|cap| cap.min(CapabilityNumber::MAX_CAP))
        .unwrap_or(DEFAULT_LAST_CAP)
}
