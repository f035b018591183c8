//! Console session lifecycle
//!
//! `ConsoleSession` takes over a VT (or the console / framebuffer device
//! directly) for each server generation and gives it back on close:
//! - First generation: pick and open the target, claim process-controlled
//!   VT switching, enter graphics mode
//! - Later generations: get the VT back and wait (bounded) until we own it
//! - Close: wipe the framebuffer, restore text mode and automatic VT
//!   switching, return to the VT we started on

pub mod negotiator;

use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

pub use negotiator::{
    ChannelNotifier, Negotiator, OwnershipState, SignalMailbox, VtEvent, VtNotifier,
};

use crate::config::ConsoleConfig;
use crate::console::{
    mode, ConsoleBackend, ConsoleTarget, FramebufferProbe, Platform, ProbedFramebuffer,
};
use crate::constants::{vt_device_path, CONSOLE_VTNO, DEFAULT_FB_DEV, NO_VT, SYSTEM_CONSOLE_DEV};
use crate::error::{ConsoleError, Result};

/// VT the session runs on, fixed by the first generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VtIdentity {
    /// VT number; 0 when the device is used without VT management
    pub number: u32,
    /// VT services are available and managed by us
    pub enabled: bool,
}

/// Resolved first-generation target
struct TargetChoice {
    path: PathBuf,
    is_console_device: bool,
    identity: VtIdentity,
    startup_vt: u32,
}

/// Console ownership across server generations
pub struct ConsoleSession<B: ConsoleBackend, N: VtNotifier> {
    config: ConsoleConfig,
    backend: B,
    negotiator: Negotiator<N>,
    probed: ProbedFramebuffer,
    platform: Option<Platform>,
    target: Option<ConsoleTarget>,
    identity: Option<VtIdentity>,
    /// Active VT before takeover, restored on close
    startup_vt: u32,
    fb_path: Option<PathBuf>,
}

impl<B: ConsoleBackend, N: VtNotifier> ConsoleSession<B, N> {
    pub fn new(config: ConsoleConfig, backend: B, notifier: N) -> Self {
        let negotiator = Negotiator::new(notifier, config.regraphics_on_acquire);
        Self {
            config,
            backend,
            negotiator,
            probed: ProbedFramebuffer::default(),
            platform: None,
            target: None,
            identity: None,
            startup_vt: NO_VT,
            fb_path: None,
        }
    }

    /// Replace the framebuffer probe (default: udev)
    pub fn with_probe(mut self, probe: Box<dyn FramebufferProbe>) -> Self {
        self.probed = ProbedFramebuffer::new(probe);
        self
    }

    /// Take over the console for server generation `generation` (1-based)
    pub fn open(&mut self, generation: u32) -> Result<()> {
        match (generation, self.identity) {
            (1, None) => self.open_first(),
            (1, Some(_)) => {
                warn!("Console already opened, treating generation 1 as a reset");
                self.reopen();
                Ok(())
            }
            (_, None) => Err(ConsoleError::NotOpened),
            (_, Some(_)) => {
                self.reopen();
                Ok(())
            }
        }
    }

    fn open_first(&mut self) -> Result<()> {
        if !self.backend.is_privileged() {
            return Err(ConsoleError::NotPrivileged);
        }

        let fb_path = self.resolve_framebuffer();
        let platform = Platform::detect(&mut self.backend, self.config.wipe_on_close);
        debug!("Platform: {:?}", platform);

        let choice = self.choose_target(&platform, &fb_path)?;

        if !self.config.keep_tty {
            if let Err(e) = self.backend.detach_controlling_tty() {
                warn!("Failed to detach from controlling tty: {}", e);
            }
        }

        let target = ConsoleTarget::open(&mut self.backend, &choice.path, choice.is_console_device)?;
        let (uid, gid) = self.backend.real_ids();
        target.set_owner(&mut self.backend, uid, gid);
        let fd = target.raw_fd();

        self.platform = Some(platform);
        self.fb_path = Some(fb_path);
        self.identity = Some(choice.identity);
        self.startup_vt = choice.startup_vt;
        self.target = Some(target);

        if self.config.share_vts {
            info!("Sharing VT {}, not taking ownership", choice.identity.number);
            return Ok(());
        }

        if choice.identity.enabled {
            let vtno = choice.identity.number;
            mode::activate_and_wait(&mut self.backend, fd, vtno, "console open");
            mode::claim_process_mode(&mut self.backend, fd, self.config.display)?;
            self.negotiator.mark_claimed();
        }

        mode::enter_graphics_mode(&mut self.backend, fd, &choice.path.display().to_string());
        Ok(())
    }

    /// Explicit `-dev`, else the conventional node if present, else the
    /// probed device, else the conventional node anyway
    fn resolve_framebuffer(&self) -> PathBuf {
        if let Some(dev) = &self.config.fb_dev {
            return dev.clone();
        }
        let default = Path::new(DEFAULT_FB_DEV);
        if self.backend.device_exists(default) {
            return default.to_path_buf();
        }
        match self.probed.get() {
            Some(probed) => probed.clone(),
            None => default.to_path_buf(),
        }
    }

    fn choose_target(&mut self, platform: &Platform, fb_path: &Path) -> Result<TargetChoice> {
        let vt_available = platform.vt.is_available();

        if self.config.use_console {
            let startup_vt = if vt_available {
                self.backend
                    .active_vt()
                    .map_err(ConsoleError::CurrentVtUnknown)?
            } else {
                NO_VT
            };
            return Ok(TargetChoice {
                path: PathBuf::from(SYSTEM_CONSOLE_DEV),
                is_console_device: true,
                identity: VtIdentity {
                    number: CONSOLE_VTNO,
                    enabled: vt_available,
                },
                startup_vt,
            });
        }

        if !vt_available {
            info!("VT infrastructure is not available");
            return Ok(TargetChoice {
                path: fb_path.to_path_buf(),
                is_console_device: false,
                identity: VtIdentity {
                    number: NO_VT,
                    enabled: false,
                },
                startup_vt: NO_VT,
            });
        }

        let active = self
            .backend
            .active_vt()
            .map_err(ConsoleError::CurrentVtUnknown)?;

        let (vtno, origin) = if let Some(vtno) = self.config.vt_number {
            (vtno, "command line")
        } else if self.config.share_vts {
            (active, "command line")
        } else {
            match self.backend.free_vt() {
                Ok(Some(vtno)) => (vtno, "probed"),
                Ok(None) => return Err(ConsoleError::NoFreeVt(None)),
                Err(e) => return Err(ConsoleError::NoFreeVt(Some(e))),
            }
        };
        info!("Using VT number {} ({}), started on VT {}", vtno, origin, active);

        Ok(TargetChoice {
            path: PathBuf::from(vt_device_path(vtno)),
            is_console_device: false,
            identity: VtIdentity {
                number: vtno,
                enabled: true,
            },
            startup_vt: active,
        })
    }

    /// Later generation: get the VT back, then give the kernel a bounded
    /// window to hand it over if we don't own it
    fn reopen(&mut self) {
        let Some(identity) = self.identity else {
            return;
        };
        if !identity.enabled || self.config.share_vts {
            return;
        }
        if !self.target.as_ref().is_some_and(ConsoleTarget::is_open) {
            warn!("Console already closed, not reacquiring VT {}", identity.number);
            return;
        }

        let fd = self.raw_fd();
        if self.config.auto_vt_switch {
            mode::activate_and_wait(&mut self.backend, fd, identity.number, "console reopen");
        }

        self.negotiator.dispatch(&mut self.backend, fd);
        if self.negotiator.is_owner() {
            return;
        }

        let timeout = self.config.reacquire_timeout;
        info!("Waiting up to {:?} for VT {} to be handed back", timeout, identity.number);
        if self.negotiator.wait_for_acquire(&mut self.backend, fd, timeout) {
            info!("VT {} reacquired", identity.number);
        } else {
            warn!(
                "VT {} not reacquired within {:?}, continuing",
                identity.number, timeout
            );
        }
    }

    /// Give the console back. Safe to call more than once.
    pub fn close(&mut self) {
        if self.target.is_none() {
            warn!("Console close without a prior open");
            return;
        }
        let fd = self.raw_fd();
        let vt_enabled = self.identity.map(|id| id.enabled).unwrap_or(false);
        // A second close must not blank the restored text console
        let first_close = self.target.as_ref().is_some_and(ConsoleTarget::is_open);

        // The VT belongs to another server: leave its modes alone
        if self.config.share_vts {
            if let Some(target) = self.target.as_mut() {
                target.close();
            }
            return;
        }

        let wipe = self.platform.map(|p| p.wipe_framebuffer).unwrap_or(false);
        if first_close && wipe && !self.config.probe_only {
            if let Some(fb_path) = &self.fb_path {
                match self.backend.wipe_framebuffer(fb_path) {
                    Ok(len) => debug!("Wiped {} bytes of {}", len, fb_path.display()),
                    Err(e) => warn!("Framebuffer wipe skipped: {}", e),
                }
            }
        }

        mode::enter_text_mode(&mut self.backend, fd);

        if vt_enabled {
            mode::release_process_mode(&mut self.backend, fd);
            self.negotiator.mark_unclaimed();
            if self.config.auto_vt_switch {
                mode::activate_and_wait(&mut self.backend, fd, self.startup_vt, "console close");
            }
        }

        if let Some(target) = self.target.as_mut() {
            target.close();
        }
    }

    /// Handle pending VT notifications; call from the event loop whenever
    /// `notifier_fd` is readable. Returns how many were handled.
    pub fn dispatch(&mut self) -> usize {
        let fd = self.raw_fd();
        self.negotiator.dispatch(&mut self.backend, fd)
    }

    /// Pollable fd of the notification mailbox
    pub fn notifier_fd(&self) -> Option<RawFd> {
        self.negotiator.notifier_fd()
    }

    fn raw_fd(&self) -> RawFd {
        self.target.as_ref().map(ConsoleTarget::raw_fd).unwrap_or(-1)
    }

    pub fn state(&self) -> OwnershipState {
        self.negotiator.state()
    }

    pub fn identity(&self) -> Option<VtIdentity> {
        self.identity
    }

    pub fn startup_vt(&self) -> u32 {
        self.startup_vt
    }

    pub fn target(&self) -> Option<&ConsoleTarget> {
        self.target.as_ref()
    }

    pub fn framebuffer_path(&self) -> Option<&Path> {
        self.fb_path.as_deref()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}
