//! Link-layer frame decoding.
//!
//! Two framings carry MOP:
//!
//! ```text
//! Ethernet II   | dst(6) | src(6) | ethertype(2) >= 0x0600 | payload ...
//! 802.3 + SNAP  | dst(6) | src(6) | length(2) <= 1500 | AA AA 03 | OUI(3) | pid(2) | payload ...
//! ```
//!
//! Decoding never fails on content: anything with a complete header becomes a
//! [`Frame`], with unknown or unrecognisable types tagged `ProtocolType::Other`.
//! Only frames too short to carry addresses and a type field are rejected.

use thiserror::Error;

use mop_core::{Frame, Framing, HardwareAddr, ProtocolType};

/// Destination + source + type/length.
pub const ETHER_HEADER_LEN: usize = 14;

/// Largest value of the type/length field that is a length (IEEE 802.3).
const MAX_8023_LENGTH: u16 = 1500;

/// Smallest value of the type/length field that is an ethertype.
const MIN_ETHERTYPE: u16 = 0x0600;

/// LLC header announcing SNAP: DSAP, SSAP, control.
const LLC_SNAP: [u8; 3] = [0xaa, 0xaa, 0x03];

/// Digital Equipment Corporation OUI.
const DEC_OUI: [u8; 3] = [0x08, 0x00, 0x2b];

/// LLC (3) + OUI (3) + protocol id (2).
const SNAP_HEADER_LEN: usize = 8;

/// Errors from frame decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("Frame too short: {len} bytes (need at least {min})")]
    Truncated { len: usize, min: usize },
}

/// Decodes a captured frame.
///
/// # Errors
///
/// `FrameError::Truncated` if `bytes` is shorter than an Ethernet header.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, FrameError> {
    let truncated = || FrameError::Truncated {
        len: bytes.len(),
        min: ETHER_HEADER_LEN,
    };

    let destination = HardwareAddr::from_slice(bytes).ok_or_else(truncated)?;
    let source = bytes
        .get(HardwareAddr::LEN..)
        .and_then(HardwareAddr::from_slice)
        .ok_or_else(truncated)?;
    let type_or_len = read_u16(bytes, 12).ok_or_else(truncated)?;
    let body = bytes.get(ETHER_HEADER_LEN..).unwrap_or_default();

    if type_or_len >= MIN_ETHERTYPE {
        return Ok(Frame::new(
            destination,
            source,
            Framing::EthernetII,
            ProtocolType::from_code(type_or_len),
            body.to_vec(),
        ));
    }

    // 802.3: the payload is bounded by the length field, padding follows.
    let declared = usize::from(type_or_len.min(MAX_8023_LENGTH));
    let body = body.get(..declared).unwrap_or(body);

    match decode_snap(body) {
        Some((protocol, payload)) => Ok(Frame::new(
            destination,
            source,
            Framing::Ieee8023Snap,
            protocol,
            payload.to_vec(),
        )),
        None => Ok(Frame::new(
            destination,
            source,
            Framing::Ieee8023,
            ProtocolType::Other(0),
            body.to_vec(),
        )),
    }
}

/// Splits an LLC/SNAP header off an 802.3 body.
///
/// Only the DEC OUI yields a meaningful protocol id; other organisations'
/// ids are not ethertypes and are tagged `Other(0)`.
fn decode_snap(body: &[u8]) -> Option<(ProtocolType, &[u8])> {
    if body.get(..3)? != LLC_SNAP {
        return None;
    }
    let oui = body.get(3..6)?;
    let pid = read_u16(body, 6)?;
    let payload = body.get(SNAP_HEADER_LEN..)?;

    let protocol = if oui == DEC_OUI {
        ProtocolType::from_code(pid)
    } else {
        ProtocolType::Other(0)
    };
    Some((protocol, payload))
}

fn read_u16(bytes: &[u8], offset: usize) -> Option<u16> {
    let pair: [u8; 2] = bytes.get(offset..offset + 2)?.try_into().ok()?;
    Some(u16::from_be_bytes(pair))
}
