//! Safe wrappers for console ioctl system calls
//!
//! Every wrapper retries on EINTR: VT ioctls are routinely interrupted by
//! the very SIGUSR1/SIGUSR2 notifications they trigger.

use std::io;
use std::os::unix::io::RawFd;

use log::trace;

fn check(ret: libc::c_int, cmd_name: &str, fd: RawFd) -> Option<io::Result<libc::c_int>> {
    if ret >= 0 {
        trace!("{} on fd {} -> {}", cmd_name, fd, ret);
        return Some(Ok(ret));
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::Interrupted {
        // EINTR: retry the ioctl
        return None;
    }
    Some(Err(io::Error::new(
        err.kind(),
        format!("{} failed on fd {}: {}", cmd_name, fd, err),
    )))
}

/// Execute an ioctl command with an integer argument.
///
/// # Arguments
/// * `fd` - File descriptor
/// * `cmd` - ioctl command number
/// * `arg` - Integer argument
/// * `cmd_name` - Human-readable name for error messages
pub fn ioctl_with_int_arg(
    fd: RawFd,
    cmd: libc::c_ulong,
    arg: libc::c_long,
    cmd_name: &str,
) -> io::Result<libc::c_int> {
    loop {
        // SAFETY: integer-argument ioctl; an invalid fd only yields EBADF.
        let ret = unsafe { libc::ioctl(fd, cmd as _, arg) };
        if let Some(result) = check(ret, cmd_name, fd) {
            return result;
        }
    }
}

/// Execute an ioctl command with a mutable argument.
///
/// The caller must make sure `T` matches the layout the ioctl expects.
pub fn ioctl_with_mut_arg<T>(
    fd: RawFd,
    cmd: libc::c_ulong,
    arg: &mut T,
    cmd_name: &str,
) -> io::Result<libc::c_int> {
    loop {
        // SAFETY: `arg` is a live, exclusively borrowed `T` for the call.
        let ret = unsafe { libc::ioctl(fd, cmd as _, arg as *mut T) };
        if let Some(result) = check(ret, cmd_name, fd) {
            return result;
        }
    }
}

/// Execute an ioctl command with a const argument (passed by reference).
///
/// The caller must make sure `T` matches the layout the ioctl expects.
pub fn ioctl_with_ref_arg<T>(
    fd: RawFd,
    cmd: libc::c_ulong,
    arg: &T,
    cmd_name: &str,
) -> io::Result<libc::c_int> {
    loop {
        // SAFETY: `arg` is a live `T` the kernel only reads.
        let ret = unsafe { libc::ioctl(fd, cmd as _, arg as *const T) };
        if let Some(result) = check(ret, cmd_name, fd) {
            return result;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_fd_reports_command_name() {
        let err = ioctl_with_int_arg(-1, 0x4B3A, 0, "KDSETMODE").unwrap_err();
        assert!(err.to_string().contains("KDSETMODE"));
        assert!(err.to_string().contains("fd -1"));
    }
}
