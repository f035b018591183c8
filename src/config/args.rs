//! Console command-line arguments
//!
//! Recognizes the console-specific tokens and declines everything else so
//! an outer parser can handle it.

use std::path::PathBuf;

use log::debug;

use crate::constants::{MAX_VT, MIN_VT};

/// Values collected by [`ConsoleArgs::process_argument`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsoleArgs {
    /// Don't detach from the controlling tty (debugging)
    pub keep_tty: bool,
    /// Use /dev/console instead of a VT
    pub use_console: bool,
    /// Requested VT (`vtN`)
    pub vt_number: Option<u32>,
    /// Framebuffer / device path (`-dev <path>`)
    pub fb_dev: Option<PathBuf>,
    /// A malformed token asked for the usage text
    pub usage_requested: bool,
}

impl ConsoleArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look at `args[i]` (and possibly `args[i + 1]`).
    ///
    /// Returns the number of tokens consumed, 0 if the token is not ours.
    pub fn process_argument<S: AsRef<str>>(&mut self, args: &[S], i: usize) -> usize {
        let Some(arg) = args.get(i).map(AsRef::as_ref) else {
            return 0;
        };

        match arg {
            "-keeptty" => {
                self.keep_tty = true;
                1
            }
            "-C" => {
                self.use_console = true;
                1
            }
            "-dev" => match args.get(i + 1) {
                Some(path) => {
                    self.fb_dev = Some(PathBuf::from(path.as_ref()));
                    2
                }
                None => 0,
            },
            _ if arg.starts_with("vt") => match parse_vt_token(arg) {
                Some(vtno) => {
                    debug!("VT {} requested on command line", vtno);
                    self.vt_number = Some(vtno);
                    1
                }
                None => {
                    self.usage_requested = true;
                    self.vt_number = None;
                    0
                }
            },
            _ => 0,
        }
    }

    /// Feed a whole argument vector; returns the tokens that were declined
    pub fn parse_all<S: AsRef<str>>(&mut self, args: &[S]) -> Vec<String> {
        let mut rest = Vec::new();
        let mut i = 0;
        while i < args.len() {
            match self.process_argument(args, i) {
                0 => {
                    rest.push(args[i].as_ref().to_string());
                    i += 1;
                }
                n => i += n,
            }
        }
        rest
    }
}

/// `vt7` -> 7. Leading digits after `vt` are the number, anything after
/// them is ignored; no digits or an out-of-range number is malformed.
fn parse_vt_token(token: &str) -> Option<u32> {
    let rest = token.strip_prefix("vt")?;
    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let vtno = rest[..digits_end].parse::<u32>().ok()?;
    (MIN_VT..=MAX_VT).contains(&vtno).then_some(vtno)
}

/// Usage lines for the console options
pub fn usage() -> &'static str {
    concat!(
        "vtX                    Use the specified VT number\n",
        "-dev <fb>              Framebuffer device\n",
        "-keeptty               Don't detach controlling tty\n",
        "                       (for debugging only)\n",
        "-C                     Use /dev/console as the console device\n",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dev_consumes_two() {
        let mut args = ConsoleArgs::new();
        assert_eq!(args.process_argument(&["-dev", "/dev/fb1"], 0), 2);
        assert_eq!(args.fb_dev, Some(PathBuf::from("/dev/fb1")));
    }

    #[test]
    fn test_dev_without_value_is_declined() {
        let mut args = ConsoleArgs::new();
        assert_eq!(args.process_argument(&["-dev"], 0), 0);
        assert_eq!(args.fb_dev, None);
    }

    #[test]
    fn test_flags() {
        let mut args = ConsoleArgs::new();
        assert_eq!(args.process_argument(&["-keeptty"], 0), 1);
        assert!(args.keep_tty);
        assert_eq!(args.process_argument(&["-C"], 0), 1);
        assert!(args.use_console);
        assert_eq!(args.process_argument(&["-unknown"], 0), 0);
    }

    #[test]
    fn test_vt_tokens() {
        assert_eq!(parse_vt_token("vt7"), Some(7));
        assert_eq!(parse_vt_token("vt12x"), Some(12));
        assert_eq!(parse_vt_token("vtX"), None);
        assert_eq!(parse_vt_token("vt"), None);
        assert_eq!(parse_vt_token("vt0"), None);
        assert_eq!(parse_vt_token("vt64"), None);
        assert_eq!(parse_vt_token("vt-3"), None);
    }

    #[test]
    fn test_malformed_vt_requests_usage() {
        let mut args = ConsoleArgs::new();
        assert_eq!(args.process_argument(&["vt3"], 0), 1);
        assert_eq!(args.process_argument(&["vtX"], 0), 0);
        assert_eq!(args.vt_number, None);
        assert!(args.usage_requested);
    }

    #[test]
    fn test_parse_all_returns_declined() {
        let mut args = ConsoleArgs::new();
        let rest = args.parse_all(&["-sharevts", "vt2", "-dev", "/dev/fb0", ":1"]);
        assert_eq!(rest, vec!["-sharevts".to_string(), ":1".to_string()]);
        assert_eq!(args.vt_number, Some(2));
        assert_eq!(args.fb_dev, Some(PathBuf::from("/dev/fb0")));
    }

    #[test]
    fn test_usage_mentions_every_option() {
        for opt in ["vtX", "-dev", "-keeptty", "-C"] {
            assert!(usage().contains(opt));
        }
    }
}
