//! Captured link-layer frames and their MOP classification tags.

use std::fmt;

use crate::HardwareAddr;

// ============================================================================
// Protocol Identifiers
// ============================================================================

/// Ethertype / SNAP protocol id of MOP Dump/Load.
pub const PROTO_DUMP_LOAD: u16 = 0x6001;

/// Ethertype / SNAP protocol id of MOP Remote Console.
pub const PROTO_REMOTE_CONSOLE: u16 = 0x6002;

/// First ethertype of the DEC protocol block.
pub const DEC_FAMILY_FIRST: u16 = 0x6000;

/// Last ethertype of the DEC protocol block.
pub const DEC_FAMILY_LAST: u16 = 0x6009;

/// Protocol type tag carried by a frame.
///
/// `Other` holds the raw ethertype or SNAP protocol id. Frames whose type
/// could not be determined are tagged `Other(0)`, which is outside the DEC
/// family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolType {
    /// MOP Dump/Load (program loading and memory dumps)
    DumpLoad,
    /// MOP Remote Console
    RemoteConsole,
    /// Any other protocol id
    Other(u16),
}

impl ProtocolType {
    /// Maps a raw ethertype or SNAP protocol id to a tag.
    pub fn from_code(code: u16) -> Self {
        match code {
            PROTO_DUMP_LOAD => Self::DumpLoad,
            PROTO_REMOTE_CONSOLE => Self::RemoteConsole,
            other => Self::Other(other),
        }
    }

    /// Returns the raw protocol id.
    pub fn code(&self) -> u16 {
        match self {
            Self::DumpLoad => PROTO_DUMP_LOAD,
            Self::RemoteConsole => PROTO_REMOTE_CONSOLE,
            Self::Other(code) => *code,
        }
    }

    /// Returns true if the frame belongs to the DEC protocol family the
    /// daemon serves.
    pub fn is_in_family(&self) -> bool {
        (DEC_FAMILY_FIRST..=DEC_FAMILY_LAST).contains(&self.code())
    }

    /// The legacy MOP version an operator suppresses to silence this type.
    pub fn mop_version(&self) -> Option<MopVersion> {
        match self {
            Self::DumpLoad => Some(MopVersion::V3),
            Self::RemoteConsole => Some(MopVersion::V4),
            Self::Other(_) => None,
        }
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DumpLoad => write!(f, "dump/load"),
            Self::RemoteConsole => write!(f, "remote console"),
            Self::Other(code) => write!(f, "0x{code:04x}"),
        }
    }
}

/// Legacy MOP protocol versions that can be suppressed per interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MopVersion {
    V3,
    V4,
}

impl fmt::Display for MopVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V3 => write!(f, "V3"),
            Self::V4 => write!(f, "V4"),
        }
    }
}

// ============================================================================
// Frame
// ============================================================================

/// How the protocol id was carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Ethernet II: the type field holds the ethertype.
    EthernetII,
    /// IEEE 802.3 length field followed by LLC/SNAP.
    Ieee8023Snap,
    /// IEEE 802.3 without a SNAP header.
    Ieee8023,
}

/// One received link-layer frame.
///
/// Frames only live for the duration of classification and dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub destination: HardwareAddr,
    pub source: HardwareAddr,
    pub framing: Framing,
    pub protocol: ProtocolType,
    /// Bytes following the link-layer (and SNAP) header.
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(
        destination: HardwareAddr,
        source: HardwareAddr,
        framing: Framing,
        protocol: ProtocolType,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            destination,
            source,
            framing,
            protocol,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_from_code() {
        assert_eq!(ProtocolType::from_code(0x6001), ProtocolType::DumpLoad);
        assert_eq!(ProtocolType::from_code(0x6002), ProtocolType::RemoteConsole);
        assert_eq!(ProtocolType::from_code(0x0800), ProtocolType::Other(0x0800));
    }

    #[test]
    fn test_family_membership() {
        assert!(ProtocolType::DumpLoad.is_in_family());
        assert!(ProtocolType::RemoteConsole.is_in_family());
        // LAT is DEC but not handled
        assert!(ProtocolType::Other(0x6004).is_in_family());
        assert!(!ProtocolType::Other(0x0800).is_in_family());
        assert!(!ProtocolType::Other(0).is_in_family());
    }

    #[test]
    fn test_version_mapping_is_fixed() {
        assert_eq!(ProtocolType::DumpLoad.mop_version(), Some(MopVersion::V3));
        assert_eq!(ProtocolType::RemoteConsole.mop_version(), Some(MopVersion::V4));
        assert_eq!(ProtocolType::Other(0x6004).mop_version(), None);
    }

    #[test]
    fn test_protocol_display() {
        assert_eq!(ProtocolType::DumpLoad.to_string(), "dump/load");
        assert_eq!(ProtocolType::Other(0x86dd).to_string(), "0x86dd");
    }
}
