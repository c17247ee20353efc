//! Link-layer hardware addresses.

use std::fmt;
use std::str::FromStr;

use crate::{DomainError, DomainResult};

/// A 48-bit IEEE 802 hardware (MAC) address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct HardwareAddr([u8; 6]);

impl HardwareAddr {
    /// Length of an EUI-48 address in bytes.
    pub const LEN: usize = 6;

    /// The all-zero address.
    pub const ZERO: HardwareAddr = HardwareAddr([0; 6]);

    /// The broadcast address `ff:ff:ff:ff:ff:ff`.
    pub const BROADCAST: HardwareAddr = HardwareAddr([0xff; 6]);

    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Builds an address from the first six bytes of `bytes`.
    ///
    /// Returns `None` if fewer than six bytes are available.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let octets: [u8; 6] = bytes.get(..Self::LEN)?.try_into().ok()?;
        Some(Self(octets))
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for HardwareAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for HardwareAddr {
    type Err = DomainError;

    /// Parses `08:00:2b:01:02:03` or `08-00-2B-01-02-03`.
    fn from_str(s: &str) -> DomainResult<Self> {
        let invalid = || DomainError::InvalidHardwareAddr {
            value: s.to_string(),
        };

        let trimmed = s.trim();
        let mut octets = [0u8; 6];
        let mut parts = trimmed.split([':', '-']);

        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.is_empty() || part.len() > 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }

        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self(octets))
    }
}

impl From<[u8; 6]> for HardwareAddr {
    fn from(octets: [u8; 6]) -> Self {
        Self(octets)
    }
}
