//! vtclaim - VT console ownership for display servers on Linux
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │   ConsoleSession (open / close / reset)  │
//! ├──────────────────────────────────────────┤
//! │  Negotiator  ←  VtNotifier (signalfd)    │
//! │        ↓                                 │
//! │  VT mode controller (VT_SETMODE, KDSET…) │
//! │        ↓                                 │
//! │  ConsoleBackend (ioctls, /dev/ttyN)      │
//! └──────────────────────────────────────────┘
//! ```

pub mod config;
pub mod console;
pub mod constants;
pub mod error;
pub mod session;

pub use config::{ConsoleArgs, ConsoleConfig, Settings};
pub use console::{ConsoleBackend, KernelBackend};
pub use error::ConsoleError;
pub use session::{ConsoleSession, OwnershipState, SignalMailbox, VtIdentity};
