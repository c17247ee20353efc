//! Interface enumeration from sysfs.
//!
//! `/sys/class/net/<name>/address` holds each interface's hardware address;
//! the loopback device is never a capture candidate.

use std::fs;
use std::path::PathBuf;

use tracing::{debug, warn};

use mop_core::{HardwareAddr, Interface, Suppression};

use super::CaptureError;
use crate::config::InterfaceSelection;

/// Default sysfs network class directory.
pub const SYSFS_NET: &str = "/sys/class/net";

const LOOPBACK: &str = "lo";

/// View of a sysfs `class/net` directory.
#[derive(Debug, Clone)]
pub struct SysfsNet {
    root: PathBuf,
}

impl Default for SysfsNet {
    fn default() -> Self {
        Self::new(SYSFS_NET)
    }
}

impl SysfsNet {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Lists non-loopback interface names, sorted.
    pub fn list(&self) -> Result<Vec<String>, CaptureError> {
        let entries = fs::read_dir(&self.root).map_err(|e| CaptureError::Enumerate {
            path: self.root.clone(),
            error: e.to_string(),
        })?;

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name != LOOPBACK)
            .collect();
        names.sort();
        Ok(names)
    }

    /// Reads an interface's hardware address.
    pub fn hardware_address(&self, name: &str) -> Result<HardwareAddr, CaptureError> {
        let path = self.root.join(name).join("address");
        let text = fs::read_to_string(&path).map_err(|e| CaptureError::Address {
            interface: name.to_string(),
            error: e.to_string(),
        })?;
        text.parse().map_err(|e: mop_core::DomainError| CaptureError::Address {
            interface: name.to_string(),
            error: e.to_string(),
        })
    }

    /// Builds an [`Interface`] for `name`.
    pub fn interface(&self, name: &str, suppression: Suppression) -> Result<Interface, CaptureError> {
        let address = self.hardware_address(name)?;
        Interface::new(name, address, suppression).map_err(|e| CaptureError::InvalidInterface {
            interface: name.to_string(),
            error: e.to_string(),
        })
    }

    /// Resolves a selection into interfaces.
    ///
    /// Interfaces that cannot be resolved are reported and left out; the
    /// caller decides whether what remains is enough.
    pub fn resolve(
        &self,
        selection: &InterfaceSelection,
        suppression: Suppression,
    ) -> Result<Vec<Interface>, CaptureError> {
        let names = match selection {
            InterfaceSelection::All => self.list()?,
            InterfaceSelection::Named(names) => names.clone(),
        };

        let mut interfaces = Vec::with_capacity(names.len());
        for name in names {
            match self.interface(&name, suppression) {
                Ok(iface) => {
                    debug!(interface = %iface, "Resolved interface");
                    interfaces.push(iface);
                }
                Err(e) => {
                    warn!(interface = %name, error = %e, "Skipping interface");
                }
            }
        }
        Ok(interfaces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_sysfs(ifaces: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, address) in ifaces {
            let iface_dir = dir.path().join(name);
            fs::create_dir_all(&iface_dir).unwrap();
            fs::write(iface_dir.join("address"), format!("{address}\n")).unwrap();
        }
        dir
    }

    #[test]
    fn test_list_excludes_loopback_and_sorts() {
        let dir = fake_sysfs(&[
            ("lo", "00:00:00:00:00:00"),
            ("eth1", "08:00:2b:00:00:02"),
            ("eth0", "08:00:2b:00:00:01"),
        ]);
        let sysfs = SysfsNet::new(dir.path());
        assert_eq!(sysfs.list().unwrap(), vec!["eth0", "eth1"]);
    }

    #[test]
    fn test_hardware_address() {
        let dir = fake_sysfs(&[("eth0", "08:00:2b:00:00:01")]);
        let sysfs = SysfsNet::new(dir.path());
        assert_eq!(
            sysfs.hardware_address("eth0").unwrap(),
            HardwareAddr::new([0x08, 0x00, 0x2b, 0, 0, 1])
        );
        assert!(matches!(
            sysfs.hardware_address("eth9"),
            Err(CaptureError::Address { .. })
        ));
    }

    #[test]
    fn test_resolve_all_carries_suppression() {
        let dir = fake_sysfs(&[("eth0", "08:00:2b:00:00:01"), ("eth1", "08:00:2b:00:00:02")]);
        let sysfs = SysfsNet::new(dir.path());

        let ifaces = sysfs.resolve(&InterfaceSelection::All, Suppression::V4).unwrap();
        assert_eq!(ifaces.len(), 2);
        assert!(ifaces.iter().all(|i| i.suppression() == Suppression::V4));
    }

    #[test]
    fn test_resolve_named_skips_missing() {
        let dir = fake_sysfs(&[("eth0", "08:00:2b:00:00:01"), ("bad0", "not-a-mac")]);
        let sysfs = SysfsNet::new(dir.path());

        let selection = InterfaceSelection::Named(vec![
            "eth0".to_string(),
            "bad0".to_string(),
            "missing0".to_string(),
        ]);
        let ifaces = sysfs.resolve(&selection, Suppression::None).unwrap();
        let names: Vec<&str> = ifaces.iter().map(|i| i.name()).collect();
        assert_eq!(names, vec!["eth0"]);
    }

    #[test]
    fn test_missing_root_is_enumeration_error() {
        let sysfs = SysfsNet::new("/nonexistent/sys/class/net");
        assert!(matches!(
            sysfs.resolve(&InterfaceSelection::All, Suppression::None),
            Err(CaptureError::Enumerate { .. })
        ));
    }
}
