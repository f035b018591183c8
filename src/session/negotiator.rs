//! VT acquisition negotiator
//!
//! The kernel tells the VT owner about switches with signals (SIGUSR2 on
//! release, SIGUSR1 on acquire). Nothing happens inside signal context: the
//! notification lands in a mailbox (signalfd, or atomic bits set by a
//! fallback handler) and the main flow drains it in [`Negotiator::dispatch`]
//! or [`Negotiator::wait_for_acquire`].

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bitflags::bitflags;
use log::{debug, info, warn};
use nix::sys::signal::{SigSet, SigmaskHow};
use nix::sys::signalfd::{SfdFlags, SignalFd};

use crate::console::{mode, ConsoleBackend, DisplayRelease};
use crate::constants::{ACQUIRE_SIGNAL, RELEASE_SIGNAL};

/// VT switch notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VtEvent {
    /// Kernel requests us to release the VT (SIGUSR2)
    Release,
    /// Kernel grants us the VT (SIGUSR1)
    Acquire,
}

/// Who currently holds the VT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipState {
    /// No process-controlled mode claimed
    Unclaimed,
    /// We hold the VT and may render / switch modes
    ProcessOwned,
    /// Handed to another VT; no mode changes until reacquired
    Released,
    /// Granted back, resuming
    Reacquired,
}

/// Mailbox of pending VT notifications
pub trait VtNotifier {
    /// Next pending notification, without blocking
    fn poll(&mut self) -> Option<VtEvent>;

    /// Wait up to `timeout` for the next notification
    fn wait(&mut self, timeout: Duration) -> Option<VtEvent>;

    /// Pollable fd for event loop integration, if the mailbox has one
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}

// ============================================================================
// Signal mailbox
// ============================================================================

bitflags! {
    /// Signals recorded by the fallback handler
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Pending: u8 {
        const ACQUIRE = 0b01;
        const RELEASE = 0b10;
    }
}

/// Fallback flags for VT switch signals (SIGUSR1/SIGUSR2)
///
/// Normally we receive VT switch events via signalfd with SIGUSR1/2 blocked.
/// If the signals ever leak past the mask, a default SIGUSR2 would
/// terminate the process. The handler keeps the process alive and records
/// the event for the main flow.
static VT_SIG_PENDING: AtomicU8 = AtomicU8::new(0);

extern "C" fn vt_signal_handler(signo: libc::c_int) {
    let bit = if signo == ACQUIRE_SIGNAL as libc::c_int {
        Pending::ACQUIRE
    } else if signo == RELEASE_SIGNAL as libc::c_int {
        Pending::RELEASE
    } else {
        return;
    };
    VT_SIG_PENDING.fetch_or(bit.bits(), Ordering::Relaxed);
}

fn setup_vt_signal_handlers() {
    unsafe {
        libc::signal(
            ACQUIRE_SIGNAL as libc::c_int,
            vt_signal_handler as *const () as libc::sighandler_t,
        );
        libc::signal(
            RELEASE_SIGNAL as libc::c_int,
            vt_signal_handler as *const () as libc::sighandler_t,
        );
    }
}

fn take_pending_vt_event() -> Option<VtEvent> {
    // Prefer Release over Acquire if both are pending.
    let release = Pending::RELEASE.bits();
    if VT_SIG_PENDING.fetch_and(!release, Ordering::Relaxed) & release != 0 {
        return Some(VtEvent::Release);
    }
    let acquire = Pending::ACQUIRE.bits();
    if VT_SIG_PENDING.fetch_and(!acquire, Ordering::Relaxed) & acquire != 0 {
        return Some(VtEvent::Acquire);
    }
    None
}

fn signal_event(signo: u32) -> Option<VtEvent> {
    let signo = signo as i32;
    if signo == RELEASE_SIGNAL as i32 {
        debug!("{:?} received: VT release requested", RELEASE_SIGNAL);
        Some(VtEvent::Release)
    } else if signo == ACQUIRE_SIGNAL as i32 {
        debug!("{:?} received: VT acquire", ACQUIRE_SIGNAL);
        Some(VtEvent::Acquire)
    } else {
        None
    }
}

/// Production mailbox: SIGUSR1/SIGUSR2 routed through a signalfd
pub struct SignalMailbox {
    signal_fd: SignalFd,
    /// Original signal mask to restore on drop
    old_sigmask: SigSet,
}

impl SignalMailbox {
    /// Block the VT signals and start receiving them via signalfd.
    ///
    /// Must be created before the VT is put into process mode so that no
    /// notification can hit the default (terminating) action.
    pub fn new() -> Result<Self> {
        let mut mask = SigSet::empty();
        mask.add(ACQUIRE_SIGNAL);
        mask.add(RELEASE_SIGNAL);

        let old_sigmask = mask
            .thread_swap_mask(SigmaskHow::SIG_BLOCK)
            .context("Failed to block VT signals")?;

        let signal_fd =
            match SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC) {
                Ok(fd) => fd,
                Err(e) => {
                    old_sigmask.thread_set_mask().ok();
                    return Err(e).context("Failed to create signalfd");
                }
            };

        setup_vt_signal_handlers();
        info!(
            "VT notifications via signalfd ({:?}=acquire, {:?}=release)",
            ACQUIRE_SIGNAL, RELEASE_SIGNAL
        );

        Ok(Self {
            signal_fd,
            old_sigmask,
        })
    }

    fn read_signalfd(&mut self) -> Option<VtEvent> {
        match self.signal_fd.read_signal() {
            Ok(Some(siginfo)) => signal_event(siginfo.ssi_signo),
            Ok(None) => None, // No signal pending
            Err(e) => {
                warn!("signalfd read error: {}", e);
                None
            }
        }
    }
}

impl VtNotifier for SignalMailbox {
    fn poll(&mut self) -> Option<VtEvent> {
        take_pending_vt_event().or_else(|| self.read_signalfd())
    }

    fn wait(&mut self, timeout: Duration) -> Option<VtEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = self.poll() {
                return Some(event);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }

            let mut pfd = libc::pollfd {
                fd: self.signal_fd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let timeout_ms = remaining.as_millis().clamp(1, i32::MAX as u128) as libc::c_int;
            let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() != std::io::ErrorKind::Interrupted {
                    warn!("poll on signalfd failed: {}", err);
                    return None;
                }
            }
            // Readable, interrupted or timed out: loop re-checks the mailbox
            // and the deadline.
        }
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.signal_fd.as_raw_fd())
    }
}

impl Drop for SignalMailbox {
    fn drop(&mut self) {
        // Restore original signal mask
        if let Err(e) = self.old_sigmask.thread_set_mask() {
            warn!("Failed to restore signal mask: {}", e);
        }
    }
}

// ============================================================================
// Channel mailbox
// ============================================================================

/// Mailbox fed through a channel, for embedders with their own
/// notification source and for tests
pub struct ChannelNotifier {
    rx: mpsc::Receiver<VtEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (mpsc::Sender<VtEvent>, Self) {
        let (tx, rx) = mpsc::channel();
        (tx, Self { rx })
    }
}

impl VtNotifier for ChannelNotifier {
    fn poll(&mut self) -> Option<VtEvent> {
        self.rx.try_recv().ok()
    }

    fn wait(&mut self, timeout: Duration) -> Option<VtEvent> {
        self.rx.recv_timeout(timeout).ok()
    }
}

// ============================================================================
// State machine
// ============================================================================

/// Release/acquire state machine
pub struct Negotiator<N: VtNotifier> {
    notifier: N,
    state: OwnershipState,
    /// Re-enter KD_GRAPHICS when the VT comes back
    regraphics_on_acquire: bool,
}

impl<N: VtNotifier> Negotiator<N> {
    pub fn new(notifier: N, regraphics_on_acquire: bool) -> Self {
        Self {
            notifier,
            state: OwnershipState::Unclaimed,
            regraphics_on_acquire,
        }
    }

    pub fn state(&self) -> OwnershipState {
        self.state
    }

    pub fn is_owner(&self) -> bool {
        self.state == OwnershipState::ProcessOwned
    }

    pub fn notifier_fd(&self) -> Option<RawFd> {
        self.notifier.raw_fd()
    }

    /// Process-controlled mode was just claimed
    pub fn mark_claimed(&mut self) {
        self.state = OwnershipState::ProcessOwned;
    }

    /// VT switching was handed back to the kernel
    pub fn mark_unclaimed(&mut self) {
        self.state = OwnershipState::Unclaimed;
    }

    /// Drain all pending notifications. Returns how many were handled.
    pub fn dispatch<B: ConsoleBackend + ?Sized>(&mut self, backend: &mut B, fd: RawFd) -> usize {
        let mut handled = 0;
        while let Some(event) = self.notifier.poll() {
            self.handle(backend, fd, event);
            handled += 1;
        }
        handled
    }

    /// Block until we own the VT again or `timeout` passes.
    /// Returns whether ownership was regained.
    pub fn wait_for_acquire<B: ConsoleBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        fd: RawFd,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_owner() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match self.notifier.wait(remaining) {
                Some(event) => self.handle(backend, fd, event),
                None => return self.is_owner(),
            }
        }
        true
    }

    /// Apply one notification
    pub fn handle<B: ConsoleBackend + ?Sized>(&mut self, backend: &mut B, fd: RawFd, event: VtEvent) {
        match (event, self.state) {
            (VtEvent::Release, OwnershipState::ProcessOwned) => {
                info!("VT release requested");
                // Acknowledge release - this allows the VT switch to proceed
                match backend.release_display(fd, DisplayRelease::Release) {
                    Ok(()) => {
                        self.state = OwnershipState::Released;
                        info!("VT released");
                    }
                    Err(e) => warn!("Failed to acknowledge VT release: {}", e),
                }
            }
            (VtEvent::Release, state) => {
                debug!("Ignoring VT release in state {:?}", state);
            }
            (VtEvent::Acquire, OwnershipState::ProcessOwned) => {
                debug!("VT acquire while already owner");
            }
            (VtEvent::Acquire, OwnershipState::Unclaimed) => {
                debug!("Ignoring VT acquire: process mode not claimed");
            }
            (VtEvent::Acquire, OwnershipState::Released | OwnershipState::Reacquired) => {
                info!("VT acquire");
                self.state = OwnershipState::Reacquired;
                if let Err(e) = backend.release_display(fd, DisplayRelease::AckAcquire) {
                    warn!("Failed to acknowledge VT acquire: {}", e);
                }
                if self.regraphics_on_acquire {
                    mode::enter_graphics_mode(backend, fd, "VT acquire");
                }
                self.state = OwnershipState::ProcessOwned;
                info!("VT acquired");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::FakeBackend;

    fn owned_negotiator() -> (mpsc::Sender<VtEvent>, Negotiator<ChannelNotifier>) {
        let (tx, notifier) = ChannelNotifier::new();
        let mut negotiator = Negotiator::new(notifier, true);
        negotiator.mark_claimed();
        (tx, negotiator)
    }

    #[test]
    fn test_release_then_acquire_round_trip() {
        let mut backend = FakeBackend::new();
        let (tx, mut negotiator) = owned_negotiator();

        tx.send(VtEvent::Release).unwrap();
        assert_eq!(negotiator.dispatch(&mut backend, 3), 1);
        assert_eq!(negotiator.state(), OwnershipState::Released);
        assert_eq!(backend.reldisp, vec![DisplayRelease::Release]);

        tx.send(VtEvent::Acquire).unwrap();
        negotiator.dispatch(&mut backend, 3);
        assert_eq!(negotiator.state(), OwnershipState::ProcessOwned);
        assert_eq!(
            backend.reldisp,
            vec![DisplayRelease::Release, DisplayRelease::AckAcquire]
        );
        assert_eq!(backend.kd_mode, Some(crate::console::KdMode::Graphics));
    }

    #[test]
    fn test_acquire_when_owner_is_noop() {
        let mut backend = FakeBackend::new();
        let (tx, mut negotiator) = owned_negotiator();

        tx.send(VtEvent::Acquire).unwrap();
        negotiator.dispatch(&mut backend, 3);
        assert_eq!(negotiator.state(), OwnershipState::ProcessOwned);
        assert!(backend.reldisp.is_empty());
    }

    #[test]
    fn test_failed_release_ack_keeps_ownership() {
        let mut backend = FakeBackend::new();
        backend.fail_reldisp = true;
        let (tx, mut negotiator) = owned_negotiator();

        tx.send(VtEvent::Release).unwrap();
        negotiator.dispatch(&mut backend, 3);
        assert_eq!(negotiator.state(), OwnershipState::ProcessOwned);
    }

    #[test]
    fn test_release_while_unclaimed_is_ignored() {
        let mut backend = FakeBackend::new();
        let (tx, notifier) = ChannelNotifier::new();
        let mut negotiator = Negotiator::new(notifier, false);

        tx.send(VtEvent::Release).unwrap();
        negotiator.dispatch(&mut backend, 3);
        assert_eq!(negotiator.state(), OwnershipState::Unclaimed);
        assert!(backend.reldisp.is_empty());
    }

    #[test]
    fn test_wait_for_acquire_returns_on_notification() {
        let mut backend = FakeBackend::new();
        let (tx, mut negotiator) = owned_negotiator();
        tx.send(VtEvent::Release).unwrap();
        negotiator.dispatch(&mut backend, 3);

        tx.send(VtEvent::Acquire).unwrap();
        let start = Instant::now();
        assert!(negotiator.wait_for_acquire(&mut backend, 3, Duration::from_secs(30)));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(negotiator.is_owner());
    }

    #[test]
    fn test_wait_for_acquire_times_out() {
        let mut backend = FakeBackend::new();
        let (_tx, mut negotiator) = owned_negotiator();
        negotiator.state = OwnershipState::Released;

        assert!(!negotiator.wait_for_acquire(&mut backend, 3, Duration::from_millis(20)));
        assert_eq!(negotiator.state(), OwnershipState::Released);
    }

    #[test]
    fn test_no_regraphics_when_disabled() {
        let mut backend = FakeBackend::new();
        let (tx, notifier) = ChannelNotifier::new();
        let mut negotiator = Negotiator::new(notifier, false);
        negotiator.mark_claimed();

        tx.send(VtEvent::Release).unwrap();
        tx.send(VtEvent::Acquire).unwrap();
        assert_eq!(negotiator.dispatch(&mut backend, 3), 2);
        assert!(negotiator.is_owner());
        assert_eq!(backend.kd_mode, None);
    }

    #[test]
    fn test_pending_bits_prefer_release() {
        VT_SIG_PENDING.store((Pending::ACQUIRE | Pending::RELEASE).bits(), Ordering::Relaxed);
        assert_eq!(take_pending_vt_event(), Some(VtEvent::Release));
        assert_eq!(take_pending_vt_event(), Some(VtEvent::Acquire));
        assert_eq!(take_pending_vt_event(), None);
    }
}
