//! Console handle
//!
//! Owns the descriptor of the VT or console device the server runs on.

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use super::backend::ConsoleBackend;
use crate::error::{ConsoleError, Result};

/// Open console or VT device
#[derive(Debug)]
pub struct ConsoleTarget {
    path: PathBuf,
    /// `None` once closed
    fd: Option<OwnedFd>,
    is_console_device: bool,
}

impl ConsoleTarget {
    /// Open `path` read/write, non-blocking
    pub fn open<B: ConsoleBackend + ?Sized>(
        backend: &mut B,
        path: impl Into<PathBuf>,
        is_console_device: bool,
    ) -> Result<Self> {
        let path = path.into();
        let fd = backend
            .open_device(&path)
            .map_err(|source| ConsoleError::CannotOpen {
                path: path.clone(),
                source,
            })?;
        info!("Opened console device {} (fd={})", path.display(), fd.as_raw_fd());
        Ok(Self {
            path,
            fd: Some(fd),
            is_console_device,
        })
    }

    /// Hand the device node to the invoking user (best-effort)
    pub fn set_owner<B: ConsoleBackend + ?Sized>(&self, backend: &mut B, uid: u32, gid: u32) {
        match backend.chown_device(&self.path, uid, gid) {
            Ok(()) => debug!("chown {} to {}:{}", self.path.display(), uid, gid),
            Err(e) => warn!("Failed to change owner of {}: {}", self.path.display(), e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_console_device(&self) -> bool {
        self.is_console_device
    }

    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    /// Raw descriptor for ioctls; `-1` after close
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_ref().map(|fd| fd.as_raw_fd()).unwrap_or(-1)
    }

    pub fn close(&mut self) {
        match self.fd.take() {
            Some(fd) => {
                drop(fd);
                info!("Closed console device {}", self.path.display());
            }
            None => warn!("Console device {} already closed", self.path.display()),
        }
    }
}
