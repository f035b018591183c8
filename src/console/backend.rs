//! Console capability interface
//!
//! `ConsoleBackend` is the whole set of kernel and process primitives the
//! session needs: the VT/KD ioctl dictionary plus privilege, ownership and
//! framebuffer access. `KernelBackend` is the Linux implementation; tests
//! drive the session through an in-memory one.

use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::io::RawFd;
use std::path::Path;

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

/// Console display mode (KDSETMODE)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KdMode {
    /// Character-addressed text console
    Text,
    /// Pixel-addressed graphics; kernel stops drawing the console
    Graphics,
}

/// VT switching policy (VT_SETMODE)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VtSwitchMode {
    /// Kernel switches VTs on its own
    Auto,
    /// Kernel asks the owning process first, via the given signals
    Process { acquire: Signal, release: Signal },
}

/// Argument of VT_RELDISP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayRelease {
    /// Allow the pending switch away from our VT
    Release,
    /// Acknowledge that we took the VT back
    AckAcquire,
}

/// Whether the kernel offers VT multiplexing at all
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VtSupport {
    Available,
    Unavailable,
}

impl VtSupport {
    pub fn is_available(self) -> bool {
        self == VtSupport::Available
    }
}

/// When to zero the framebuffer on close
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WipePolicy {
    /// Wipe unless the architecture's console already clears it (x86)
    #[default]
    Auto,
    Always,
    Never,
}

impl WipePolicy {
    /// Resolve against a target architecture name (`std::env::consts::ARCH`)
    pub fn resolve(self, arch: &str) -> bool {
        match self {
            WipePolicy::Always => true,
            WipePolicy::Never => false,
            WipePolicy::Auto => !matches!(arch, "x86" | "x86_64"),
        }
    }
}

/// Capabilities detected at runtime, consumed by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub vt: VtSupport,
    pub wipe_framebuffer: bool,
}

impl Platform {
    pub fn detect<B: ConsoleBackend + ?Sized>(backend: &mut B, wipe: WipePolicy) -> Self {
        Self {
            vt: backend.vt_support(),
            wipe_framebuffer: wipe.resolve(std::env::consts::ARCH),
        }
    }
}

/// Kernel and process primitives used by the console session
pub trait ConsoleBackend {
    /// True when running with effective uid 0
    fn is_privileged(&self) -> bool;

    /// Real (invoking) uid and gid
    fn real_ids(&self) -> (u32, u32);

    fn device_exists(&self, path: &Path) -> bool;

    /// Start a new session without a controlling terminal
    fn detach_controlling_tty(&mut self) -> io::Result<()>;

    /// Open a console device read/write and non-blocking
    fn open_device(&mut self, path: &Path) -> io::Result<OwnedFd>;

    fn chown_device(&mut self, path: &Path, uid: u32, gid: u32) -> io::Result<()>;

    /// Probe the VT manager
    fn vt_support(&mut self) -> VtSupport;

    /// Currently active VT number (VT_GETSTATE)
    fn active_vt(&mut self) -> io::Result<u32>;

    /// First unused VT (VT_OPENQRY), `None` when all are taken
    fn free_vt(&mut self) -> io::Result<Option<u32>>;

    fn activate(&mut self, fd: RawFd, vtno: u32) -> io::Result<()>;

    /// Block until `vtno` is the active VT
    fn wait_active(&mut self, fd: RawFd, vtno: u32) -> io::Result<()>;

    fn set_kd_mode(&mut self, fd: RawFd, mode: KdMode) -> io::Result<()>;

    fn set_vt_mode(&mut self, fd: RawFd, mode: VtSwitchMode) -> io::Result<()>;

    /// Associate a display number with the VT.
    /// Kernels without the notion report `ErrorKind::Unsupported`.
    fn set_display_info(&mut self, fd: RawFd, display: u32) -> io::Result<()>;

    fn release_display(&mut self, fd: RawFd, how: DisplayRelease) -> io::Result<()>;

    /// Zero-fill the framebuffer at `path`, returning the number of bytes wiped
    fn wipe_framebuffer(&mut self, path: &Path) -> io::Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wipe_policy_resolve() {
        assert!(!WipePolicy::Auto.resolve("x86_64"));
        assert!(!WipePolicy::Auto.resolve("x86"));
        assert!(WipePolicy::Auto.resolve("aarch64"));
        assert!(WipePolicy::Always.resolve("x86_64"));
        assert!(!WipePolicy::Never.resolve("sparc64"));
    }
}
