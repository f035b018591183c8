//! Fatal console errors
//!
//! Anything in here aborts console setup. Recoverable failures never become
//! a `ConsoleError`; they are logged where they happen.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsoleError {
    #[error("server must run with effective uid 0")]
    NotPrivileged,

    #[error("cannot determine current VT: {0}")]
    CurrentVtUnknown(#[source] io::Error),

    #[error("cannot find a free VT")]
    NoFreeVt(#[source] Option<io::Error>),

    #[error("cannot open {}: {source}", path.display())]
    CannotOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("VT_SETMODE VT_PROCESS failed: {0}")]
    ClaimFailed(#[source] io::Error),

    #[error("console was never opened for the first server generation")]
    NotOpened,
}

pub type Result<T> = std::result::Result<T, ConsoleError>;
