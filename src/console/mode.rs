//! VT mode controller
//!
//! Hardware mode transitions and the process-managed VT switching
//! transaction. Only `claim_process_mode` can fail hard; everything else
//! logs and lets the caller carry on.

use std::io;
use std::os::unix::io::RawFd;

use log::{debug, info, warn};

use super::backend::{ConsoleBackend, KdMode, VtSwitchMode};
use crate::constants::{ACQUIRE_SIGNAL, RELEASE_SIGNAL};
use crate::error::{ConsoleError, Result};

/// Make `vtno` the active VT and wait until the switch has happened.
///
/// `from` names the caller in warnings.
pub fn activate_and_wait<B: ConsoleBackend + ?Sized>(
    backend: &mut B,
    fd: RawFd,
    vtno: u32,
    from: &str,
) {
    if let Err(e) = backend.activate(fd, vtno) {
        warn!("{}: VT_ACTIVATE failed: {}", from, e);
    }
    if let Err(e) = backend.wait_active(fd, vtno) {
        warn!("{}: VT_WAITACTIVE failed: {}", from, e);
    }
}

/// Switch the console to graphics (KD_GRAPHICS)
pub fn enter_graphics_mode<B: ConsoleBackend + ?Sized>(backend: &mut B, fd: RawFd, from: &str) {
    match backend.set_kd_mode(fd, KdMode::Graphics) {
        Ok(()) => info!("Set KD_GRAPHICS mode"),
        Err(e) => warn!("{}: KDSETMODE KD_GRAPHICS failed: {}", from, e),
    }
}

/// Switch the console back to text (KD_TEXT). Result deliberately unchecked.
pub fn enter_text_mode<B: ConsoleBackend + ?Sized>(backend: &mut B, fd: RawFd) {
    if let Err(e) = backend.set_kd_mode(fd, KdMode::Text) {
        debug!("KDSETMODE KD_TEXT: {}", e);
    }
}

/// Take over VT switching: the kernel now asks us (SIGUSR2) before leaving
/// the VT and tells us (SIGUSR1) when we get it back.
pub fn claim_process_mode<B: ConsoleBackend + ?Sized>(
    backend: &mut B,
    fd: RawFd,
    display: u32,
) -> Result<()> {
    let mode = VtSwitchMode::Process {
        acquire: ACQUIRE_SIGNAL,
        release: RELEASE_SIGNAL,
    };
    backend
        .set_vt_mode(fd, mode)
        .map_err(ConsoleError::ClaimFailed)?;
    info!(
        "Process-controlled VT mode enabled ({:?}=acquire, {:?}=release)",
        ACQUIRE_SIGNAL, RELEASE_SIGNAL
    );

    match backend.set_display_info(fd, display) {
        Ok(()) => debug!("VT bound to display :{}", display),
        Err(e) if e.kind() == io::ErrorKind::Unsupported => {
            debug!("VT display info not supported by this kernel")
        }
        Err(e) => warn!("VT_SETDISPINFO failed: {}", e),
    }
    Ok(())
}

/// Give VT switching back to the kernel (VT_AUTO)
pub fn release_process_mode<B: ConsoleBackend + ?Sized>(backend: &mut B, fd: RawFd) {
    match backend.set_vt_mode(fd, VtSwitchMode::Auto) {
        Ok(()) => info!("VT switching returned to VT_AUTO"),
        Err(e) => warn!("Failed to reset VT to VT_AUTO: {}", e),
    }
}
