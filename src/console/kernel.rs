//! Linux console backend
//!
//! VT switching via VT_SETMODE with VT_PROCESS mode, KDSETMODE for the
//! graphics/text toggle, and fbdev for the exit-time framebuffer wipe.
//!
//! Reference: kmscon's src/uterm_vt.c

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};

use log::{debug, info, warn};
use memmap2::MmapOptions;
use nix::unistd::{Gid, Pid, Uid};

use super::backend::{ConsoleBackend, DisplayRelease, KdMode, VtSupport, VtSwitchMode};
use super::ioctl_helpers::{ioctl_with_int_arg, ioctl_with_mut_arg, ioctl_with_ref_arg};
use crate::constants::VT_MANAGER_DEV;

/// Console fd for panic hook recovery.
/// When set (>= 0), the panic hook will restore KD_TEXT and VT_AUTO
/// to prevent the console from being stuck in KD_GRAPHICS mode.
static PANIC_RECOVERY_TTY_FD: AtomicI32 = AtomicI32::new(-1);

// VT ioctl constants (from linux/vt.h)
const VT_OPENQRY: libc::c_ulong = 0x5600;
const VT_SETMODE: libc::c_ulong = 0x5602;
const VT_GETSTATE: libc::c_ulong = 0x5603;
const VT_RELDISP: libc::c_ulong = 0x5605;
const VT_ACTIVATE: libc::c_ulong = 0x5606;
const VT_WAITACTIVE: libc::c_ulong = 0x5607;

// VT_SETMODE constants
const VT_AUTO: libc::c_char = 0;
const VT_PROCESS: libc::c_char = 1;
const VT_ACKACQ: libc::c_long = 2;

// KDSETMODE constants (from linux/kd.h)
const KDSETMODE: libc::c_ulong = 0x4B3A;
const KD_TEXT: libc::c_long = 0x00;
const KD_GRAPHICS: libc::c_long = 0x01;

// fbdev ioctl constants (from linux/fb.h)
const FBIOGET_VSCREENINFO: libc::c_ulong = 0x4600;
const FBIOGET_FSCREENINFO: libc::c_ulong = 0x4602;

/// vt_mode structure for VT_SETMODE ioctl
#[repr(C)]
struct VtMode {
    mode: libc::c_char,    // VT_AUTO or VT_PROCESS
    waitv: libc::c_char,   // unused
    relsig: libc::c_short, // signal to send on release
    acqsig: libc::c_short, // signal to send on acquire
    frsig: libc::c_short,  // unused
}

impl VtMode {
    fn from_switch_mode(mode: VtSwitchMode) -> Self {
        match mode {
            VtSwitchMode::Auto => Self {
                mode: VT_AUTO,
                waitv: 0,
                relsig: 0,
                acqsig: 0,
                frsig: 0,
            },
            VtSwitchMode::Process { acquire, release } => Self {
                mode: VT_PROCESS,
                waitv: 0,
                relsig: release as libc::c_short,
                acqsig: acquire as libc::c_short,
                frsig: 0,
            },
        }
    }
}

/// vt_stat structure for VT_GETSTATE ioctl
#[allow(dead_code)]
#[repr(C)]
#[derive(Default)]
struct VtStat {
    v_active: libc::c_ushort,
    v_signal: libc::c_ushort,
    v_state: libc::c_ushort,
}

/// fb_fix_screeninfo (only smem_len is read)
#[allow(dead_code)]
#[repr(C)]
struct FbFixScreeninfo {
    id: [libc::c_char; 16],
    smem_start: libc::c_ulong,
    smem_len: u32,
    type_: u32,
    type_aux: u32,
    visual: u32,
    xpanstep: u16,
    ypanstep: u16,
    ywrapstep: u16,
    line_length: u32,
    mmio_start: libc::c_ulong,
    mmio_len: u32,
    accel: u32,
    capabilities: u16,
    reserved: [u16; 2],
}

/// fb_var_screeninfo: geometry fields, then 32 words we never look at
#[allow(dead_code)]
#[repr(C)]
struct FbVarScreeninfo {
    xres: u32,
    yres: u32,
    xres_virtual: u32,
    yres_virtual: u32,
    xoffset: u32,
    yoffset: u32,
    bits_per_pixel: u32,
    grayscale: u32,
    rest: [u32; 32],
}

/// Install a panic hook that restores the console to text mode.
///
/// Even with `panic = "abort"`, `std::panic::set_hook` runs before the abort.
/// This ensures KD_TEXT and VT_AUTO are restored so the console is usable.
pub fn setup_panic_hook() {
    let prev = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let fd = PANIC_RECOVERY_TTY_FD.load(Ordering::Relaxed);
        if fd >= 0 {
            // SAFETY: plain ioctls on a raw fd; failures are ignored.
            unsafe { libc::ioctl(fd, KDSETMODE as _, KD_TEXT) };
            let mode = VtMode::from_switch_mode(VtSwitchMode::Auto);
            unsafe { libc::ioctl(fd, VT_SETMODE as _, &mode) };
        }
        // Print panic info to stderr so it's visible on the restored console
        eprintln!("[vtclaim] PANIC: {}", info);
        prev(info);
    }));
}

/// Open the VT manager device (/dev/tty0)
fn open_manager() -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_CLOEXEC)
        .open(VT_MANAGER_DEV)
}

fn vt_state(fd: RawFd) -> io::Result<VtStat> {
    let mut stat = VtStat::default();
    ioctl_with_mut_arg(fd, VT_GETSTATE, &mut stat, "VT_GETSTATE")?;
    Ok(stat)
}

fn framebuffer_size(fd: RawFd) -> io::Result<usize> {
    // SAFETY: plain-old-data ioctl structs, all-zero is a valid value.
    let mut fix: FbFixScreeninfo = unsafe { std::mem::zeroed() };
    if ioctl_with_mut_arg(fd, FBIOGET_FSCREENINFO, &mut fix, "FBIOGET_FSCREENINFO").is_ok()
        && fix.smem_len > 0
    {
        return Ok(fix.smem_len as usize);
    }

    let mut var: FbVarScreeninfo = unsafe { std::mem::zeroed() };
    ioctl_with_mut_arg(fd, FBIOGET_VSCREENINFO, &mut var, "FBIOGET_VSCREENINFO")?;
    let bytes = var.xres_virtual as usize * var.yres_virtual as usize * var.bits_per_pixel as usize
        / 8;
    if bytes == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "framebuffer reports zero size",
        ));
    }
    Ok(bytes)
}

/// Linux VT/KD/fbdev implementation of [`ConsoleBackend`]
#[derive(Debug, Default)]
pub struct KernelBackend;

impl KernelBackend {
    pub fn new() -> Self {
        Self
    }
}

impl ConsoleBackend for KernelBackend {
    fn is_privileged(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }

    fn real_ids(&self) -> (u32, u32) {
        (
            nix::unistd::getuid().as_raw(),
            nix::unistd::getgid().as_raw(),
        )
    }

    fn device_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn detach_controlling_tty(&mut self) -> io::Result<()> {
        use nix::unistd::{getpgid, getpgrp, getpid, getppid, setpgid, setsid};

        // setsid() refuses process group leaders: join the parent's group first
        if getpgrp() == getpid() {
            let ppgid = getpgid(Some(getppid()))?;
            if let Err(e) = setpgid(Pid::from_raw(0), ppgid) {
                warn!("Cannot leave process group {}: {}", ppgid, e);
            }
        }
        let sid = setsid()?;
        debug!("New session {}, controlling tty dropped", sid);
        Ok(())
    }

    fn open_device(&mut self, path: &Path) -> io::Result<OwnedFd> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(path)?;
        Ok(OwnedFd::from(file))
    }

    fn chown_device(&mut self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        nix::unistd::chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))?;
        Ok(())
    }

    fn vt_support(&mut self) -> VtSupport {
        let manager = match open_manager() {
            Ok(file) => file,
            Err(e) => {
                info!("Cannot open {}: {}", VT_MANAGER_DEV, e);
                return VtSupport::Unavailable;
            }
        };
        match vt_state(manager.as_raw_fd()) {
            Ok(_) => VtSupport::Available,
            Err(e) => {
                info!("{} is not a VT manager: {}", VT_MANAGER_DEV, e);
                VtSupport::Unavailable
            }
        }
    }

    fn active_vt(&mut self) -> io::Result<u32> {
        // First try sysfs (no special permissions required)
        if let Ok(content) = std::fs::read_to_string("/sys/class/tty/tty0/active") {
            // Content is like "tty2\n"
            if let Some(num_str) = content.trim().strip_prefix("tty") {
                if let Ok(vt) = num_str.parse::<u32>() {
                    return Ok(vt);
                }
            }
        }

        let manager = open_manager()?;
        Ok(vt_state(manager.as_raw_fd())?.v_active as u32)
    }

    fn free_vt(&mut self) -> io::Result<Option<u32>> {
        let manager = open_manager()?;
        let mut vtno: libc::c_int = -1;
        ioctl_with_mut_arg(manager.as_raw_fd(), VT_OPENQRY, &mut vtno, "VT_OPENQRY")?;
        Ok(u32::try_from(vtno).ok().filter(|&n| n > 0))
    }

    fn activate(&mut self, fd: RawFd, vtno: u32) -> io::Result<()> {
        debug!("Requesting switch to VT{}", vtno);
        ioctl_with_int_arg(fd, VT_ACTIVATE, vtno as libc::c_long, "VT_ACTIVATE").map(drop)
    }

    fn wait_active(&mut self, fd: RawFd, vtno: u32) -> io::Result<()> {
        ioctl_with_int_arg(fd, VT_WAITACTIVE, vtno as libc::c_long, "VT_WAITACTIVE")?;
        info!("VT{} is now active", vtno);
        Ok(())
    }

    fn set_kd_mode(&mut self, fd: RawFd, mode: KdMode) -> io::Result<()> {
        let (arg, name) = match mode {
            KdMode::Text => (KD_TEXT, "KDSETMODE(KD_TEXT)"),
            KdMode::Graphics => (KD_GRAPHICS, "KDSETMODE(KD_GRAPHICS)"),
        };
        ioctl_with_int_arg(fd, KDSETMODE, arg, name)?;
        match mode {
            // From this point, any panic will restore KD_TEXT before aborting.
            KdMode::Graphics => PANIC_RECOVERY_TTY_FD.store(fd, Ordering::Relaxed),
            KdMode::Text => PANIC_RECOVERY_TTY_FD.store(-1, Ordering::Relaxed),
        }
        Ok(())
    }

    fn set_vt_mode(&mut self, fd: RawFd, mode: VtSwitchMode) -> io::Result<()> {
        let vt_mode = VtMode::from_switch_mode(mode);
        ioctl_with_ref_arg(fd, VT_SETMODE, &vt_mode, "VT_SETMODE").map(drop)
    }

    fn set_display_info(&mut self, _fd: RawFd, _display: u32) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "Linux VTs carry no display number",
        ))
    }

    fn release_display(&mut self, fd: RawFd, how: DisplayRelease) -> io::Result<()> {
        let (arg, name) = match how {
            DisplayRelease::Release => (1, "VT_RELDISP(1)"),
            DisplayRelease::AckAcquire => (VT_ACKACQ, "VT_RELDISP(VT_ACKACQ)"),
        };
        ioctl_with_int_arg(fd, VT_RELDISP, arg, name).map(drop)
    }

    fn wipe_framebuffer(&mut self, path: &Path) -> io::Result<usize> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)
            .map_err(|e| io::Error::new(e.kind(), format!("unable to open framebuffer: {}", e)))?;

        let size = framebuffer_size(file.as_raw_fd()).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("unable to retrieve framebuffer attributes: {}", e),
            )
        })?;

        // SAFETY: the mapping is private to this function and dropped
        // (unmapped) before the file is closed.
        let mut fb = unsafe { MmapOptions::new().len(size).map_mut(&file) }
            .map_err(|e| io::Error::new(e.kind(), format!("unable to mmap framebuffer: {}", e)))?;
        fb.fill(0);
        drop(fb);

        debug!("Wiped {} bytes of {}", size, path.display());
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vt_mode_layout() {
        // struct vt_mode is { char, char, short, short, short }
        assert_eq!(std::mem::size_of::<VtMode>(), 8);
        assert_eq!(std::mem::size_of::<VtStat>(), 6);
        assert_eq!(std::mem::size_of::<FbVarScreeninfo>(), 160);
    }

    #[test]
    fn test_process_mode_signals() {
        let mode = VtMode::from_switch_mode(VtSwitchMode::Process {
            acquire: nix::sys::signal::Signal::SIGUSR1,
            release: nix::sys::signal::Signal::SIGUSR2,
        });
        assert_eq!(mode.mode, VT_PROCESS);
        assert_eq!(mode.acqsig, libc::SIGUSR1 as libc::c_short);
        assert_eq!(mode.relsig, libc::SIGUSR2 as libc::c_short);
    }

    /// Runs in a forked child that owns a pty as controlling tty; a
    /// grandchild detaches and must no longer reach /dev/tty.
    #[test]
    fn test_detach_drops_controlling_tty() {
        use nix::fcntl::OFlag;
        use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
        use nix::sys::wait::{waitpid, WaitStatus};
        use nix::unistd::{fork, setsid, ForkResult};

        // Exit codes: 0 detached, 1 tty still reachable, 2 detach failed,
        // 3 no pty could become the controlling tty, 4 fork/wait failed
        const NO_PTY: i32 = 3;

        let Ok(master) = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY) else {
            return;
        };
        if grantpt(&master).is_err() || unlockpt(&master).is_err() {
            return;
        }
        let Ok(slave) = ptsname_r(&master) else {
            return;
        };

        let has_tty = || {
            OpenOptions::new()
                .read(true)
                .write(true)
                .open("/dev/tty")
                .is_ok()
        };

        // SAFETY: the children only make syscalls and leave through _exit.
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let code = (|| {
                    if setsid().is_err() {
                        return NO_PTY;
                    }
                    let Ok(_tty) = OpenOptions::new().read(true).write(true).open(&slave) else {
                        return NO_PTY;
                    };
                    if !has_tty() {
                        return NO_PTY;
                    }
                    match unsafe { fork() } {
                        Ok(ForkResult::Child) => {
                            let code = match KernelBackend::new().detach_controlling_tty() {
                                Err(_) => 2,
                                Ok(()) if has_tty() => 1,
                                Ok(()) => 0,
                            };
                            unsafe { libc::_exit(code) }
                        }
                        Ok(ForkResult::Parent { child }) => match waitpid(child, None) {
                            Ok(WaitStatus::Exited(_, code)) => code,
                            _ => 4,
                        },
                        Err(_) => 4,
                    }
                })();
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => match waitpid(child, None).unwrap() {
                WaitStatus::Exited(_, NO_PTY) => {}
                WaitStatus::Exited(_, code) => {
                    assert_eq!(code, 0, "controlling tty still reachable after detach")
                }
                other => panic!("unexpected child status {:?}", other),
            },
        }
    }

    #[test]
    fn test_wipe_missing_framebuffer_is_error() {
        let mut backend = KernelBackend::new();
        let err = backend
            .wipe_framebuffer(Path::new("/nonexistent/fb-for-test"))
            .unwrap_err();
        assert!(err.to_string().contains("unable to open framebuffer"));
    }
}
