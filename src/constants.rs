//! Global constants for vtclaim
//!
//! Device paths, VT numbering limits, signal assignments and timing values
//! shared by the console, session and config modules.

use std::time::Duration;

// ============================================================================
// Device Paths
// ============================================================================

/// VT manager device used for VT_GETSTATE / VT_OPENQRY
pub const VT_MANAGER_DEV: &str = "/dev/tty0";

/// Prefix of per-VT device nodes (`/dev/tty3` for VT 3)
pub const VT_DEV_PREFIX: &str = "/dev/tty";

/// System console device (`-C`)
pub const SYSTEM_CONSOLE_DEV: &str = "/dev/console";

/// Conventional framebuffer device node
pub const DEFAULT_FB_DEV: &str = "/dev/fb0";

// ============================================================================
// VT Numbering
// ============================================================================

/// VT number reported when the system console is used directly
pub const CONSOLE_VTNO: u32 = 1;

/// Sentinel VT number: no VT management, device used directly
pub const NO_VT: u32 = 0;

/// Lowest VT number accepted from `vtN`
pub const MIN_VT: u32 = 1;

/// Highest VT number accepted from `vtN` (tty1-tty63)
pub const MAX_VT: u32 = 63;

// ============================================================================
// Signals
// ============================================================================

/// Signal the kernel sends when the VT is handed (back) to us
pub const ACQUIRE_SIGNAL: nix::sys::signal::Signal = nix::sys::signal::Signal::SIGUSR1;

/// Signal the kernel sends when another VT wants the display
pub const RELEASE_SIGNAL: nix::sys::signal::Signal = nix::sys::signal::Signal::SIGUSR2;

// ============================================================================
// Timing
// ============================================================================

/// How long a restarted server generation waits for the VT to come back
pub const DEFAULT_REACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval of the binary's idle loop
pub const IDLE_POLL_INTERVAL_MS: i32 = 250;

/// Device path for VT `vtno`
pub fn vt_device_path(vtno: u32) -> String {
    format!("{}{}", VT_DEV_PREFIX, vtno)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vt_device_path() {
        assert_eq!(vt_device_path(7), "/dev/tty7");
    }
}
