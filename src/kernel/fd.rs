//! Descriptor hygiene for processes that never exec.
//!
//! `O_CLOEXEC` only helps across exec. The sandbox init is cloned from a
//! launcher that may hold pipe ends of other launches, so it closes them itself.
use crate::config::types::{Result, SandboxError, SetupStage};
use nix::errno::Errno;
use nix::unistd::close;
use std::fs;
use std::os::fd::RawFd;

/// Close every descriptor above stderr except those in `keep`.
///
/// close_range(2) over the gaps between kept descriptors, falling back to
/// walking /proc/self/fd on kernels without it.
pub fn close_inherited_fds(keep: &[RawFd]) -> Result<()> {
    let mut kept: Vec<RawFd> = keep.iter().copied().filter(|fd| *fd > 2).collect();
    kept.sort_unstable();
    kept.dedup();

    match close_gaps(&kept) {
        Ok(()) => Ok(()),
        Err(e) => {
            log::debug!("close_range unavailable ({}), walking /proc/self/fd", e);
            close_via_proc(&kept)
        }
    }
}

/// Inclusive ranges above stderr that contain none of `kept` (sorted).
fn gaps(kept: &[RawFd]) -> Vec<(u32, u32)> {
    let mut ranges = Vec::new();
    let mut first: u32 = 3;
    for &fd in kept {
        let fd = fd as u32;
        if fd > first {
            ranges.push((first, fd - 1));
        }
        first = fd + 1;
    }
    ranges.push((first, u32::MAX));
    ranges
}

fn close_gaps(kept: &[RawFd]) -> std::result::Result<(), Errno> {
    for (first, last) in gaps(kept) {
        // SAFETY: close_range only closes descriptors; callers hold no
        // references to anything outside `kept`.
        let rc = unsafe { libc::syscall(libc::SYS_close_range, first, last, 0u32) };
        if rc != 0 {
            return Err(Errno::last());
        }
    }
    Ok(())
}

fn close_via_proc(kept: &[RawFd]) -> Result<()> {
    let open: Vec<RawFd> = fs::read_dir("/proc/self/fd")
        .map_err(|e| {
            SandboxError::setup(
                SetupStage::Supervision,
                format!("read /proc/self/fd: {}", e),
            )
        })?
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
        .collect();

    for fd in open.into_iter().filter(|fd| *fd > 2 && !kept.contains(fd)) {
        match close(fd) {
            // The directory handle used for the listing is already gone.
            Ok(()) | Err(Errno::EBADF) => {}
            Err(e) => {
                return Err(SandboxError::setup(
                    SetupStage::Supervision,
                    format!("close fd {}: {}", fd, e),
                ))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::{fcntl, FcntlArg};
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, pipe, ForkResult};
    use std::os::fd::AsRawFd;

    #[test]
    fn gaps_skip_kept_descriptors() {
        assert_eq!(gaps(&[]), vec![(3, u32::MAX)]);
        assert_eq!(gaps(&[3]), vec![(4, u32::MAX)]);
        assert_eq!(gaps(&[5, 6, 9]), vec![(3, 4), (7, 8), (10, u32::MAX)]);
    }

    #[test]
    fn only_kept_descriptors_survive() {
        let (keep_read, keep_write) = pipe().unwrap();
        let (other_read, other_write) = pipe().unwrap();
        let keep = keep_read.as_raw_fd();
        let others = [
            keep_write.as_raw_fd(),
            other_read.as_raw_fd(),
            other_write.as_raw_fd(),
        ];

        // SAFETY: the child only closes and inspects descriptors, then exits.
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let closed = close_inherited_fds(&[keep]).is_ok()
                    && fcntl(keep, FcntlArg::F_GETFD).is_ok()
                    && others
                        .iter()
                        .all(|fd| fcntl(*fd, FcntlArg::F_GETFD) == Err(Errno::EBADF));
                unsafe { libc::_exit(if closed { 0 } else { 1 }) }
            }
            ForkResult::Parent { child } => {
                assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 0));
            }
        }
    }
}
