//! Console device access
//!
//! The capability interface (`ConsoleBackend`), its Linux implementation,
//! the console handle and the VT mode controller built on top of them.

pub mod backend;
mod ioctl_helpers;
pub mod kernel;
pub mod mode;
pub mod probe;
pub mod target;

pub use backend::{
    ConsoleBackend, DisplayRelease, KdMode, Platform, VtSupport, VtSwitchMode, WipePolicy,
};
pub use kernel::{setup_panic_hook, KernelBackend};
pub use probe::{FramebufferProbe, NoProbe, ProbedFramebuffer};
#[cfg(target_os = "linux")]
pub use probe::UdevProbe;
pub use target::ConsoleTarget;
