//! Capability restriction for the sandboxed command.
//!
//! Order matters: the bounding set shrinks first while CAP_SETPCAP is still
//! effective, then ambient, then capset(2), then no_new_privs.
use super::{
    last_capability, read_capability_status, CapabilityMask, CapabilityNumber,
    LINUX_CAPABILITY_VERSION_3, PR_CAPBSET_DROP, PR_CAP_AMBIENT, PR_CAP_AMBIENT_CLEAR_ALL,
    PR_SET_NO_NEW_PRIVS,
};
use crate::config::types::{Result, SandboxError, SetupStage};

fn cap_error(message: impl Into<String>) -> SandboxError {
    SandboxError::setup(SetupStage::Capabilities, message)
}

/// Reduce every capability set of the calling process to `mask`, set
/// no_new_privs, and verify the result from `/proc/self/status`.
pub fn restrict_to_mask(mask: CapabilityMask) -> Result<()> {
    let last_cap = last_capability();
    let supported = supported_mask(last_cap);
    let effective_mask = CapabilityMask::from_bits(mask.bits() & supported.bits());
    if effective_mask != mask {
        log::warn!(
            "Kernel does not know some requested capabilities (last_cap={}), keeping {:?}",
            last_cap,
            effective_mask.names()
        );
    }

    drop_bounding_capabilities(effective_mask, last_cap)?;
    clear_ambient_capabilities();
    set_process_capabilities(effective_mask)?;
    set_no_new_privs()?;
    verify_capabilities(effective_mask, supported)?;

    log::debug!("Capabilities restricted to {:?}", effective_mask.names());
    Ok(())
}

fn supported_mask(last_cap: u32) -> CapabilityMask {
    let bits = if last_cap >= CapabilityNumber::MAX_CAP {
        u64::MAX
    } else {
        (1u64 << (last_cap + 1)) - 1
    };
    CapabilityMask::from_bits(bits)
}

fn drop_bounding_capabilities(keep: CapabilityMask, last_cap: u32) -> Result<()> {
    for cap in (0..=last_cap).filter_map(CapabilityNumber::new) {
        if keep.contains(cap) {
            continue;
        }
        // SAFETY: prctl(PR_CAPBSET_DROP) takes a capability number and touches no memory.
        let rc = unsafe { libc::prctl(PR_CAPBSET_DROP, cap.value() as libc::c_ulong, 0, 0, 0) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            return Err(cap_error(format!(
                "PR_CAPBSET_DROP({}) failed: {}",
                cap.name().unwrap_or("?"),
                err
            )));
        }
    }
    Ok(())
}

fn clear_ambient_capabilities() {
    // SAFETY: prctl(PR_CAP_AMBIENT, PR_CAP_AMBIENT_CLEAR_ALL) is safe. Returns error
    // on kernels without ambient capability support, where there is nothing to clear.
    let rc = unsafe { libc::prctl(PR_CAP_AMBIENT, PR_CAP_AMBIENT_CLEAR_ALL, 0, 0, 0) };
    if rc != 0 {
        log::warn!("Failed to clear ambient capabilities (may not be supported)");
    }
}

/// Set effective and permitted to `mask`, inheritable to empty, via raw capset(2).
fn set_process_capabilities(mask: CapabilityMask) -> Result<()> {
    #[repr(C)]
    struct CapUserHeader {
        version: u32,
        pid: i32,
    }

    #[repr(C)]
    struct CapUserData {
        effective: u32,
        permitted: u32,
        inheritable: u32,
    }

    let header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };

    let (low, high) = mask.halves();
    // Version 3 requires two data entries: caps 0-31 and caps 32-63.
    let data = [
        CapUserData { effective: low, permitted: low, inheritable: 0 },
        CapUserData { effective: high, permitted: high, inheritable: 0 },
    ];

    // SAFETY: capset(2) with a valid version 3 header (pid 0 = current) and two
    // initialized data entries; both pointers outlive the call.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_capset,
            &header as *const CapUserHeader,
            data.as_ptr(),
        )
    };
    if rc != 0 {
        return Err(cap_error(format!(
            "capset failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

fn verify_capabilities(expected: CapabilityMask, supported: CapabilityMask) -> Result<()> {
    let status = read_capability_status()
        .map_err(|e| cap_error(format!("cannot verify capabilities: {}", e)))?;

    let checks = [
        ("CapEff", status.effective, expected.bits()),
        ("CapPrm", status.permitted, expected.bits()),
        ("CapInh", status.inheritable, 0),
        ("CapAmb", status.ambient.unwrap_or(0), 0),
        ("CapBnd", status.bounding & supported.bits(), expected.bits()),
    ];
    for (field, actual, wanted) in checks {
        if actual != wanted {
            return Err(cap_error(format!(
                "{} is {:016x}, expected {:016x}",
                field, actual, wanted
            )));
        }
    }
    if !status.no_new_privs.unwrap_or(true) {
        return Err(cap_error("NoNewPrivs not set after prctl"));
    }
    Ok(())
}

/// Prevent privilege escalation via execve (setuid, file capabilities).
/// Idempotent and irreversible once set.
pub fn set_no_new_privs() -> Result<()> {
    // SAFETY: prctl(PR_SET_NO_NEW_PRIVS, 1) is safe and idempotent.
    let result = unsafe { libc::prctl(PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if result != 0 {
        return Err(cap_error("Failed to set PR_SET_NO_NEW_PRIVS"));
    }
    log::debug!("Set PR_SET_NO_NEW_PRIVS");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_mask_covers_known_caps() {
        assert_eq!(supported_mask(40).bits(), (1u64 << 41) - 1);
        assert_eq!(supported_mask(63).bits(), u64::MAX);
    }

    #[test]
    fn set_no_new_privs_is_idempotent() {
        let first = set_no_new_privs();
        let second = set_no_new_privs();
        assert_eq!(first.is_ok(), second.is_ok());
    }
}
