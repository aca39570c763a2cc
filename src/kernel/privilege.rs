//! Ambient privilege of the launcher process, probed once per launcher.
use crate::config::types::{Result, SandboxError, SetupStage};
use crate::kernel::capabilities::{
    read_capability_status, CapabilityMask, CapabilityNumber, CAP_DAC_OVERRIDE, CAP_KILL,
    CAP_MKNOD, CAP_SETPCAP, CAP_SYS_ADMIN, CAP_SYS_RESOURCE,
};
use nix::unistd::geteuid;
use serde::Serialize;

/// Capabilities the launcher itself needs to build a sandbox.
pub const REQUIRED_CAPABILITIES: [CapabilityNumber; 6] = [
    CAP_SYS_ADMIN,
    CAP_SETPCAP,
    CAP_SYS_RESOURCE,
    CAP_MKNOD,
    CAP_KILL,
    CAP_DAC_OVERRIDE,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivilegeContext {
    euid: u32,
    effective: CapabilityMask,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PrivilegeReport {
    pub euid: u32,
    pub effective: Vec<String>,
    pub missing: Vec<String>,
    pub sufficient: bool,
}

impl PrivilegeContext {
    /// Read the effective set of the current process.
    pub fn probe() -> Result<Self> {
        let status = read_capability_status().map_err(|e| {
            SandboxError::setup(
                SetupStage::Privileges,
                format!("cannot read /proc/self/status: {}", e),
            )
        })?;
        let context = Self::from_parts(geteuid().as_raw(), CapabilityMask::from_bits(status.effective));
        log::debug!(
            "Privilege probe: euid={} effective={}",
            context.euid,
            context.effective
        );
        Ok(context)
    }

    pub fn from_parts(euid: u32, effective: CapabilityMask) -> Self {
        Self { euid, effective }
    }

    pub fn euid(&self) -> u32 {
        self.euid
    }

    pub fn has(&self, cap: CapabilityNumber) -> bool {
        self.effective.contains(cap)
    }

    pub fn missing(&self) -> Vec<CapabilityNumber> {
        REQUIRED_CAPABILITIES
            .iter()
            .copied()
            .filter(|cap| !self.has(*cap))
            .collect()
    }

    /// Fail unless every capability a launch needs is effective.
    pub fn require(&self) -> Result<()> {
        let missing = self.missing();
        if missing.is_empty() {
            return Ok(());
        }
        let names: Vec<&str> = missing.iter().filter_map(|c| c.name()).collect();
        Err(SandboxError::setup(
            SetupStage::Privileges,
            format!(
                "launcher lacks {} (euid {}); run as root",
                names.join(", "),
                self.euid
            ),
        ))
    }

    pub fn report(&self) -> PrivilegeReport {
        let missing = self.missing();
        PrivilegeReport {
            euid: self.euid,
            effective: self.effective.names(),
            missing: missing
                .iter()
                .filter_map(|c| c.name().map(str::to_string))
                .collect(),
            sufficient: missing.is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_required() -> CapabilityMask {
        REQUIRED_CAPABILITIES
            .iter()
            .fold(CapabilityMask::empty(), |mask, cap| mask.with(*cap))
    }

    #[test]
    fn full_privilege_passes() {
        let context = PrivilegeContext::from_parts(0, all_required());
        assert!(context.require().is_ok());
        assert!(context.report().sufficient);
    }

    #[test]
    fn missing_capability_is_named() {
        let context = PrivilegeContext::from_parts(1000, CapabilityMask::audit_only());
        let err = context.require().unwrap_err();
        match &err {
            SandboxError::IsolationSetupFailed { stage, message } => {
                assert_eq!(*stage, SetupStage::Privileges);
                assert!(message.contains("CAP_SYS_ADMIN"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(context.report().missing.len(), REQUIRED_CAPABILITIES.len());
    }

    #[test]
    fn probe_reads_current_process() {
        let context = PrivilegeContext::probe().unwrap();
        assert_eq!(context.euid(), geteuid().as_raw());
    }
}
