//! Configuration management
//!
//! Loads the TOML settings file and merges it with the console command-line
//! arguments into one immutable [`ConsoleConfig`].
//! Default config path: ~/.config/vtclaim/config.toml

pub mod args;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};

pub use args::{usage, ConsoleArgs};

use crate::console::WipePolicy;
use crate::constants::DEFAULT_REACQUIRE_TIMEOUT;

/// Settings file contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// VT handling
    pub vt: VtSettings,
    /// Framebuffer handling
    pub framebuffer: FramebufferSettings,
}

/// VT settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VtSettings {
    /// Don't own or switch VTs; run on whichever VT is active
    pub share_vts: bool,
    /// Switch to our VT on start and back to the original VT on exit
    pub auto_vt_switch: bool,
    /// Re-enter graphics mode when the VT is handed back
    pub regraphics_on_acquire: bool,
    /// Seconds a restarted server waits for the VT to come back
    pub reacquire_timeout_secs: u64,
}

impl Default for VtSettings {
    fn default() -> Self {
        Self {
            share_vts: false,
            auto_vt_switch: true,
            regraphics_on_acquire: true,
            reacquire_timeout_secs: DEFAULT_REACQUIRE_TIMEOUT.as_secs(),
        }
    }
}

/// Framebuffer settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FramebufferSettings {
    /// Framebuffer device (empty = probe / default)
    pub device: String,
    /// "auto" (skip on x86), "always" or "never"
    pub wipe_on_close: WipePolicy,
}

impl Settings {
    /// System-wide config path
    const SYSTEM_CONFIG_PATH: &'static str = "/etc/vtclaim/config.toml";

    /// Get the path that would be used for loading config
    /// Returns None if using built-in defaults
    pub fn config_path() -> Option<PathBuf> {
        // 1. VTCLAIM_CONFIG environment variable
        if let Ok(path) = std::env::var("VTCLAIM_CONFIG") {
            let p = std::path::Path::new(&path);
            if p.exists() {
                return Some(p.to_path_buf());
            }
        }

        // 2. User config: ~/.config/vtclaim/config.toml
        if let Some(config_dir) = dirs::config_dir() {
            let config_path = config_dir.join("vtclaim").join("config.toml");
            if config_path.exists() {
                return Some(config_path);
            }
        }

        // 3. System config: /etc/vtclaim/config.toml
        let system_config = std::path::Path::new(Self::SYSTEM_CONFIG_PATH);
        if system_config.exists() {
            return Some(system_config.to_path_buf());
        }

        None
    }

    /// Load configuration with priority:
    /// 1. VTCLAIM_CONFIG environment variable
    /// 2. ~/.config/vtclaim/config.toml (user config)
    /// 3. /etc/vtclaim/config.toml (system config)
    /// 4. Built-in defaults
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            match Self::load_from_file(&path) {
                Ok(settings) => {
                    info!("Loaded config: {}", path.display());
                    return settings;
                }
                Err(e) => {
                    warn!("Failed to load config {}: {:#}", path.display(), e);
                }
            }
        }
        info!("Using built-in default config");
        Self::default()
    }

    /// Load settings from specified path
    fn load_from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

/// Everything the console session needs to know, fixed for the process
/// lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleConfig {
    pub vt_number: Option<u32>,
    pub keep_tty: bool,
    pub use_console: bool,
    /// Explicit framebuffer / device path
    pub fb_dev: Option<PathBuf>,
    pub share_vts: bool,
    pub auto_vt_switch: bool,
    pub regraphics_on_acquire: bool,
    pub reacquire_timeout: Duration,
    pub wipe_on_close: WipePolicy,
    /// X-style display number (`:N`)
    pub display: u32,
    /// Only probing hardware (-configure): leave the framebuffer alone
    pub probe_only: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self::new(&ConsoleArgs::default(), &Settings::default())
    }
}

impl ConsoleConfig {
    /// Merge command-line arguments over file settings
    pub fn new(args: &ConsoleArgs, settings: &Settings) -> Self {
        let file_fb = Some(settings.framebuffer.device.trim())
            .filter(|d| !d.is_empty())
            .map(PathBuf::from);

        Self {
            vt_number: args.vt_number,
            keep_tty: args.keep_tty,
            use_console: args.use_console,
            fb_dev: args.fb_dev.clone().or(file_fb),
            share_vts: settings.vt.share_vts,
            auto_vt_switch: settings.vt.auto_vt_switch,
            regraphics_on_acquire: settings.vt.regraphics_on_acquire,
            reacquire_timeout: Duration::from_secs(settings.vt.reacquire_timeout_secs),
            wipe_on_close: settings.framebuffer.wipe_on_close,
            display: 0,
            probe_only: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ConsoleConfig::default();
        assert!(cfg.auto_vt_switch);
        assert!(!cfg.share_vts);
        assert!(cfg.regraphics_on_acquire);
        assert_eq!(cfg.reacquire_timeout, Duration::from_secs(5));
        assert_eq!(cfg.wipe_on_close, WipePolicy::Auto);
        assert_eq!(cfg.fb_dev, None);
    }

    #[test]
    fn test_parse_settings() {
        let settings = Settings::parse(
            r#"
            [vt]
            share_vts = true
            auto_vt_switch = false
            reacquire_timeout_secs = 2

            [framebuffer]
            device = "/dev/fb1"
            wipe_on_close = "never"
            "#,
        )
        .unwrap();
        assert!(settings.vt.share_vts);
        assert!(!settings.vt.auto_vt_switch);
        assert!(settings.vt.regraphics_on_acquire);

        let cfg = ConsoleConfig::new(&ConsoleArgs::default(), &settings);
        assert_eq!(cfg.reacquire_timeout, Duration::from_secs(2));
        assert_eq!(cfg.fb_dev, Some(PathBuf::from("/dev/fb1")));
        assert_eq!(cfg.wipe_on_close, WipePolicy::Never);
    }

    #[test]
    fn test_command_line_device_wins() {
        let settings = Settings::parse("[framebuffer]\ndevice = \"/dev/fb1\"\n").unwrap();
        let mut args = ConsoleArgs::new();
        args.process_argument(&["-dev", "/dev/fb2"], 0);
        let cfg = ConsoleConfig::new(&args, &settings);
        assert_eq!(cfg.fb_dev, Some(PathBuf::from("/dev/fb2")));
    }

    #[test]
    fn test_bad_wipe_policy_rejected() {
        assert!(Settings::parse("[framebuffer]\nwipe_on_close = \"sometimes\"\n").is_err());
    }
}
