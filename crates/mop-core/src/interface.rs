//! Network attachment points the daemon captures on.

use std::fmt;

use crate::{DomainError, DomainResult, HardwareAddr, MopVersion, ProtocolType};

/// Which legacy MOP version, if any, an interface ignores.
///
/// Suppressing both versions at once is not representable; use
/// [`Suppression::from_flags`] to build one from the operator's flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Suppression {
    #[default]
    None,
    /// Do not process MOP V3 (dump/load) messages
    V3,
    /// Do not process MOP V4 (remote console) messages
    V4,
}

impl Suppression {
    /// Builds a suppression from the `-3` / `-4` style flag pair.
    ///
    /// # Errors
    ///
    /// `DomainError::ConflictingSuppression` if both flags are set.
    pub fn from_flags(suppress_v3: bool, suppress_v4: bool) -> DomainResult<Self> {
        match (suppress_v3, suppress_v4) {
            (true, true) => Err(DomainError::ConflictingSuppression),
            (true, false) => Ok(Self::V3),
            (false, true) => Ok(Self::V4),
            (false, false) => Ok(Self::None),
        }
    }

    pub fn suppresses_version(&self, version: MopVersion) -> bool {
        matches!(
            (self, version),
            (Self::V3, MopVersion::V3) | (Self::V4, MopVersion::V4)
        )
    }

    /// Returns true if frames of `protocol` must be ignored.
    pub fn suppresses(&self, protocol: ProtocolType) -> bool {
        protocol
            .mop_version()
            .is_some_and(|version| self.suppresses_version(version))
    }
}

/// A network interface: name, own hardware address and suppression setting.
///
/// Built once at startup and shared immutably afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    name: String,
    hardware_address: HardwareAddr,
    suppression: Suppression,
}

impl Interface {
    /// Creates an interface description.
    ///
    /// # Errors
    ///
    /// `DomainError::InvalidInterfaceName` for empty names or names
    /// containing whitespace, `/` or NUL.
    pub fn new(
        name: impl Into<String>,
        hardware_address: HardwareAddr,
        suppression: Suppression,
    ) -> DomainResult<Self> {
        let name = name.into();
        let unusable = name.is_empty()
            || name
                .chars()
                .any(|c| c.is_whitespace() || c == '/' || c == '\0');
        if unusable {
            return Err(DomainError::InvalidInterfaceName { name });
        }

        Ok(Self {
            name,
            hardware_address,
            suppression,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hardware_address(&self) -> HardwareAddr {
        self.hardware_address
    }

    pub fn suppression(&self) -> Suppression {
        self.suppression
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.hardware_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_flags() {
        assert_eq!(Suppression::from_flags(false, false).unwrap(), Suppression::None);
        assert_eq!(Suppression::from_flags(true, false).unwrap(), Suppression::V3);
        assert_eq!(Suppression::from_flags(false, true).unwrap(), Suppression::V4);
        assert_eq!(
            Suppression::from_flags(true, true),
            Err(DomainError::ConflictingSuppression)
        );
    }

    #[test]
    fn test_suppresses_by_protocol() {
        assert!(Suppression::V3.suppresses(ProtocolType::DumpLoad));
        assert!(!Suppression::V3.suppresses(ProtocolType::RemoteConsole));
        assert!(Suppression::V4.suppresses(ProtocolType::RemoteConsole));
        assert!(!Suppression::V4.suppresses(ProtocolType::DumpLoad));
        assert!(!Suppression::None.suppresses(ProtocolType::DumpLoad));
        assert!(!Suppression::V3.suppresses(ProtocolType::Other(0x6004)));
    }

    #[test]
    fn test_interface_name_validation() {
        let addr = HardwareAddr::new([8, 0, 0x2b, 1, 2, 3]);
        assert!(Interface::new("eth0", addr, Suppression::None).is_ok());
        assert!(Interface::new("", addr, Suppression::None).is_err());
        assert!(Interface::new("eth 0", addr, Suppression::None).is_err());
        assert!(Interface::new("../eth0", addr, Suppression::None).is_err());
    }

    #[test]
    fn test_interface_display() {
        let iface =
            Interface::new("eth0", HardwareAddr::new([8, 0, 0x2b, 1, 2, 3]), Suppression::V4)
                .unwrap();
        assert_eq!(iface.to_string(), "eth0 (08:00:2b:01:02:03)");
    }
}
