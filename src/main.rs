//! vtclaim - take over a VT for a display server
//!
//! Claims a VT (or the console / framebuffer when the kernel has no VTs),
//! follows VT switches until SIGTERM, and restores the console on exit.
//! SIGHUP starts a new server generation in place.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Context, Result};
use log::{error, info, warn};

use vtclaim::config::{self, ConsoleArgs, ConsoleConfig, Settings};
use vtclaim::console::{setup_panic_hook, KernelBackend};
use vtclaim::constants::IDLE_POLL_INTERVAL_MS;
use vtclaim::session::{ConsoleSession, SignalMailbox};

/// Shutdown requested via SIGTERM/SIGINT
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Server reset requested via SIGHUP
static RESET_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn shutdown_signal_handler(_signo: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

extern "C" fn reset_signal_handler(_signo: libc::c_int) {
    RESET_REQUESTED.store(true, Ordering::Relaxed);
}

/// Handles SIGTERM (systemd stop), SIGINT (Ctrl+C) and SIGHUP (reset)
fn setup_signal_handlers() {
    unsafe {
        libc::signal(
            libc::SIGTERM,
            shutdown_signal_handler as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGINT,
            shutdown_signal_handler as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGHUP,
            reset_signal_handler as *const () as libc::sighandler_t,
        );
    }
}

/// Print help message
fn print_help() {
    println!(
        r#"vtclaim {} - VT console ownership for display servers

USAGE:
    vtclaim [OPTIONS] [:DISPLAY]

OPTIONS:
    -h, --help             Print this help message
    -V, --version          Print version information
    -sharevts              Share VTs with another display server
    -novtswitch            Don't switch VTs on start and exit
    -configure             Probe only; leave the framebuffer untouched
{}
CONFIG FILE:
    ~/.config/vtclaim/config.toml (or $VTCLAIM_CONFIG)
"#,
        env!("CARGO_PKG_VERSION"),
        indented_usage()
    );
}

fn indented_usage() -> String {
    config::usage()
        .lines()
        .map(|line| format!("    {}\n", line))
        .collect()
}

/// Options handled outside the console argument processor
#[derive(Debug, Default)]
struct OuterArgs {
    share_vts: bool,
    no_vt_switch: bool,
    configure: bool,
    display: Option<u32>,
}

fn parse_outer(rest: &[String]) -> Result<OuterArgs> {
    let mut outer = OuterArgs::default();
    for arg in rest {
        match arg.as_str() {
            "-sharevts" => outer.share_vts = true,
            "-novtswitch" => outer.no_vt_switch = true,
            "-configure" => outer.configure = true,
            _ if arg.starts_with(':') => {
                let display = arg[1..]
                    .parse::<u32>()
                    .with_context(|| format!("Invalid display number: {}", arg))?;
                outer.display = Some(display);
            }
            _ => return Err(anyhow!("Unrecognized option: {}", arg)),
        }
    }
    Ok(outer)
}

/// Wait for the notification fd (or just sleep) for one idle tick
fn idle_wait(fd: Option<std::os::unix::io::RawFd>) {
    match fd {
        Some(fd) => {
            let mut pfd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };
            // EINTR (shutdown/reset signal) just ends the tick early.
            unsafe { libc::poll(&mut pfd, 1, IDLE_POLL_INTERVAL_MS) };
        }
        None => std::thread::sleep(std::time::Duration::from_millis(
            IDLE_POLL_INTERVAL_MS as u64,
        )),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    // --help
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    // --version
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("vtclaim {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let mut console_args = ConsoleArgs::new();
    let rest = console_args.parse_all(&args);
    if console_args.usage_requested {
        eprint!("{}", config::usage());
        std::process::exit(1);
    }
    let outer = match parse_outer(&rest) {
        Ok(outer) => outer,
        Err(e) => {
            eprintln!("{:#}", e);
            eprint!("{}", config::usage());
            std::process::exit(1);
        }
    };

    let settings = Settings::load();
    let mut cfg = ConsoleConfig::new(&console_args, &settings);
    cfg.share_vts |= outer.share_vts;
    if outer.no_vt_switch {
        cfg.auto_vt_switch = false;
    }
    cfg.probe_only = outer.configure;
    cfg.display = outer.display.unwrap_or(0);

    info!("vtclaim starting (display :{})", cfg.display);

    setup_panic_hook();
    setup_signal_handlers();

    // Must exist before process mode is claimed: an unblocked SIGUSR2
    // would terminate us.
    let mailbox = SignalMailbox::new().context("Failed to set up VT notifications")?;
    let mut session = ConsoleSession::new(cfg, KernelBackend::new(), mailbox);

    let mut generation = 1;
    if let Err(e) = session.open(generation) {
        error!("Fatal: {}", e);
        std::process::exit(1);
    }
    if let Some(identity) = session.identity() {
        info!(
            "Console ready: VT {} (started on VT {})",
            identity.number,
            session.startup_vt()
        );
    }

    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);

    loop {
        idle_wait(session.notifier_fd());
        session.dispatch();

        if SHUTDOWN_REQUESTED.load(Ordering::Relaxed) {
            info!("Shutdown requested, restoring console...");
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);
            break;
        }

        if RESET_REQUESTED.swap(false, Ordering::Relaxed) {
            generation += 1;
            info!("Reset requested, starting server generation {}", generation);
            if let Err(e) = session.open(generation) {
                warn!("Reset failed: {}", e);
            }
        }
    }

    session.close();
    info!("vtclaim exited");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_outer() {
        let outer = parse_outer(&strings(&["-sharevts", "-configure", ":2"])).unwrap();
        assert!(outer.share_vts);
        assert!(outer.configure);
        assert!(!outer.no_vt_switch);
        assert_eq!(outer.display, Some(2));
    }

    #[test]
    fn test_parse_outer_rejects_unknown() {
        assert!(parse_outer(&strings(&["-bogus"])).is_err());
        assert!(parse_outer(&strings(&[":x"])).is_err());
    }

    #[test]
    fn test_help_lists_console_options() {
        let usage = indented_usage();
        assert!(usage.contains("    -keeptty"));
        assert!(usage.contains("    vtX"));
    }
}
