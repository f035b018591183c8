//! Framebuffer device probing
//!
//! Guesses the framebuffer node of the primary display controller when no
//! `-dev` path was given and the conventional node is missing.

use std::cell::OnceCell;
use std::path::PathBuf;

use log::{debug, info};

/// Source of a default framebuffer path
pub trait FramebufferProbe {
    /// Device node of the single matching display device, if any
    fn probe(&self) -> Option<PathBuf>;
}

/// PCI display controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayCandidate {
    pub syspath: PathBuf,
    pub boot_vga: bool,
}

/// Pick the display controller to use: the only one, or the boot VGA device
pub fn select_primary(candidates: &[DisplayCandidate]) -> Option<&DisplayCandidate> {
    match candidates {
        [] => None,
        [only] => Some(only),
        many => {
            let mut primary = many.iter().filter(|c| c.boot_vga);
            match (primary.next(), primary.next()) {
                (Some(c), None) => Some(c),
                _ => None,
            }
        }
    }
}

/// udev-based probe: PCI class 0x03xxxx device -> its `graphics/fb*` child
#[cfg(target_os = "linux")]
#[derive(Debug, Default)]
pub struct UdevProbe;

#[cfg(target_os = "linux")]
impl UdevProbe {
    fn display_candidates() -> std::io::Result<Vec<(DisplayCandidate, udev::Device)>> {
        let mut enumerator = udev::Enumerator::new()?;
        enumerator.match_subsystem("pci")?;

        let mut found = Vec::new();
        for device in enumerator.scan_devices()? {
            let is_display = device
                .attribute_value("class")
                .and_then(|c| c.to_str())
                .map(|c| c.starts_with("0x03"))
                .unwrap_or(false);
            if !is_display {
                continue;
            }
            let boot_vga = device
                .attribute_value("boot_vga")
                .map(|v| v == "1")
                .unwrap_or(false);
            debug!(
                "Display controller: {} (boot_vga={})",
                device.syspath().display(),
                boot_vga
            );
            let candidate = DisplayCandidate {
                syspath: device.syspath().to_path_buf(),
                boot_vga,
            };
            found.push((candidate, device));
        }
        Ok(found)
    }

    fn framebuffer_of(parent: &udev::Device) -> std::io::Result<Option<PathBuf>> {
        let mut enumerator = udev::Enumerator::new()?;
        enumerator.match_subsystem("graphics")?;
        enumerator.match_parent(parent)?;

        for device in enumerator.scan_devices()? {
            let is_fb = device
                .sysname()
                .to_str()
                .map(|name| name.starts_with("fb"))
                .unwrap_or(false);
            if let (true, Some(node)) = (is_fb, device.devnode()) {
                return Ok(Some(node.to_path_buf()));
            }
        }
        Ok(None)
    }
}

#[cfg(target_os = "linux")]
impl FramebufferProbe for UdevProbe {
    fn probe(&self) -> Option<PathBuf> {
        let found = match Self::display_candidates() {
            Ok(found) => found,
            Err(e) => {
                debug!("udev enumeration failed: {}", e);
                return None;
            }
        };

        let candidates: Vec<DisplayCandidate> = found.iter().map(|(c, _)| c.clone()).collect();
        let primary = select_primary(&candidates)?;
        let (_, device) = found.iter().find(|(c, _)| c == primary)?;

        match Self::framebuffer_of(device) {
            Ok(Some(path)) => {
                info!("Got framebuffer device from probe: {}", path.display());
                Some(path)
            }
            Ok(None) => None,
            Err(e) => {
                debug!("udev framebuffer lookup failed: {}", e);
                None
            }
        }
    }
}

/// Probe that never finds anything
#[derive(Debug, Default)]
pub struct NoProbe;

impl FramebufferProbe for NoProbe {
    fn probe(&self) -> Option<PathBuf> {
        None
    }
}

/// Probe result computed at most once per process
pub struct ProbedFramebuffer {
    probe: Box<dyn FramebufferProbe>,
    result: OnceCell<Option<PathBuf>>,
}

impl ProbedFramebuffer {
    pub fn new(probe: Box<dyn FramebufferProbe>) -> Self {
        Self {
            probe,
            result: OnceCell::new(),
        }
    }

    pub fn get(&self) -> Option<&PathBuf> {
        self.result.get_or_init(|| self.probe.probe()).as_ref()
    }
}

impl Default for ProbedFramebuffer {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        let probe: Box<dyn FramebufferProbe> = Box::new(UdevProbe);
        #[cfg(not(target_os = "linux"))]
        let probe: Box<dyn FramebufferProbe> = Box::new(NoProbe);
        Self::new(probe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct CountingProbe {
        calls: Rc<Cell<u32>>,
    }

    impl FramebufferProbe for CountingProbe {
        fn probe(&self) -> Option<PathBuf> {
            self.calls.set(self.calls.get() + 1);
            Some(PathBuf::from("/dev/fb1"))
        }
    }

    fn candidate(name: &str, boot_vga: bool) -> DisplayCandidate {
        DisplayCandidate {
            syspath: PathBuf::from(name),
            boot_vga,
        }
    }

    #[test]
    fn test_probe_is_memoized() {
        let calls = Rc::new(Cell::new(0));
        let probed = ProbedFramebuffer::new(Box::new(CountingProbe {
            calls: calls.clone(),
        }));
        assert_eq!(probed.get(), Some(&PathBuf::from("/dev/fb1")));
        assert_eq!(probed.get(), Some(&PathBuf::from("/dev/fb1")));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_select_primary() {
        assert_eq!(select_primary(&[]), None);

        let single = [candidate("a", false)];
        assert_eq!(select_primary(&single), Some(&single[0]));

        let two = [candidate("a", false), candidate("b", true)];
        assert_eq!(select_primary(&two), Some(&two[1]));

        let ambiguous = [candidate("a", false), candidate("b", false)];
        assert_eq!(select_primary(&ambiguous), None);
    }

    #[test]
    fn test_no_probe() {
        let probed = ProbedFramebuffer::new(Box::new(NoProbe));
        assert_eq!(probed.get(), None);
    }
}
