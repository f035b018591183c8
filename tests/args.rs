//! Command-line handling through the public API
//!
//! Runs without a VT or root: only argument processing and config merging.

use std::path::PathBuf;

use vtclaim::config::{usage, ConsoleArgs, ConsoleConfig, Settings};

// ========== process_argument ==========

#[test]
fn consumed_token_counts() {
    let mut args = ConsoleArgs::new();
    assert_eq!(args.process_argument(&["-dev", "/dev/fb1"], 0), 2);
    assert_eq!(args.process_argument(&["-keeptty"], 0), 1);
    assert_eq!(args.process_argument(&["-unknown"], 0), 0);
}

#[test]
fn dev_at_end_of_argv_is_declined() {
    let argv = ["vt3", "-dev"];
    let mut args = ConsoleArgs::new();
    assert_eq!(args.process_argument(&argv, 0), 1);
    assert_eq!(args.process_argument(&argv, 1), 0);
    assert_eq!(args.fb_dev, None);
}

#[test]
fn malformed_vt_requests_usage() {
    let mut args = ConsoleArgs::new();
    assert_eq!(args.process_argument(&["vtX"], 0), 0);
    assert!(args.usage_requested);
    assert_eq!(args.vt_number, None);
    assert!(usage().contains("vtX"));
}

#[test]
fn index_past_end_is_declined() {
    let mut args = ConsoleArgs::new();
    assert_eq!(args.process_argument(&["-C"], 5), 0);
    assert!(!args.use_console);
}

// ========== Full argv ==========

#[test]
fn mixed_argv_leaves_outer_options() {
    let argv: Vec<String> = ["-keeptty", ":1", "-C", "vt9", "-novtswitch"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let mut args = ConsoleArgs::new();
    let rest = args.parse_all(&argv);

    assert_eq!(rest, vec![":1".to_string(), "-novtswitch".to_string()]);
    assert!(args.keep_tty);
    assert!(args.use_console);
    assert_eq!(args.vt_number, Some(9));
}

#[test]
fn config_merges_args_over_file() {
    let settings = Settings::parse(
        r#"
        [vt]
        regraphics_on_acquire = false

        [framebuffer]
        device = "/dev/fb1"
        wipe_on_close = "always"
        "#,
    )
    .unwrap();

    let mut args = ConsoleArgs::new();
    args.parse_all(&["vt2", "-dev", "/dev/fb4"]);
    let cfg = ConsoleConfig::new(&args, &settings);

    assert_eq!(cfg.vt_number, Some(2));
    assert_eq!(cfg.fb_dev, Some(PathBuf::from("/dev/fb4")));
    assert!(!cfg.regraphics_on_acquire);
    assert!(cfg.auto_vt_switch);
}
