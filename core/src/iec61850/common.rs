//! # IEC 61850 Common Wire Types
//!
//! This module defines the shared link-layer and ASN.1 types used by the
//! Sampled Values (IEC 61850-9-2) and GOOSE (IEC 61850-8-1) codecs: EtherType
//! constants, MAC addresses, the 802.1Q VLAN tag and the 61850 `UtcTime`
//! timestamp, together with the codec error type.
//!
//! ## Key Components
//!
//! - `ParseError`: Enumerates frame encode/decode failures (BER overflow,
//!   truncation, unexpected tags, malformed MAC or VLAN fields).
//! - `MacAddress`: Six-byte hardware address parsed from the strict
//!   `XX:XX:XX:XX:XX:XX` text form.
//! - `VlanTag`: Validated 802.1Q priority/DEI/VID triple with TCI encoding.
//! - `UtcTime`: Seconds + binary-fraction timestamp used by `refrTm` and the
//!   GOOSE `t` field.
//!
//! ## Usage
//!
//! These types are consumed by the `ber`, `sampled_values` and `goose`
//! modules, and by the publisher configuration validation in the registry.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// 802.1Q VLAN tag protocol identifier.
pub const ETHERTYPE_VLAN: u16 = 0x8100;
/// IEC 61850-9-2 Sampled Values EtherType.
pub const ETHERTYPE_SV: u16 = 0x88BA;
/// IEC 61850-8-1 GOOSE EtherType.
pub const ETHERTYPE_GOOSE: u16 = 0x88B8;

/// Represents errors surfaced by the SV/GOOSE codec layer.
///
/// # Variants
///
/// * `BerOverflow`: A BER length of 65536 or more was requested.
/// * `Truncated`: A declared length reaches beyond the captured frame.
/// * `InvalidTag`: A tag other than the single legal tag for a position.
/// * `InvalidMac`: A MAC string not matching `XX:XX:XX:XX:XX:XX`.
/// * `InvalidVlan`: VLAN priority above 7 or VLAN id above 4095.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    BerOverflow { message: String },
    Truncated { message: String },
    InvalidTag { message: String },
    InvalidMac { message: String },
    InvalidVlan { message: String },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParseError::BerOverflow { message } => write!(f, "BER overflow: {}", message),
            ParseError::Truncated { message } => write!(f, "Truncated frame: {}", message),
            ParseError::InvalidTag { message } => write!(f, "Invalid tag: {}", message),
            ParseError::InvalidMac { message } => write!(f, "Invalid MAC address: {}", message),
            ParseError::InvalidVlan { message } => write!(f, "Invalid VLAN field: {}", message),
        }
    }
}

impl std::error::Error for ParseError {}

/// Six-byte Ethernet hardware address.
///
/// The canonical text form is exactly 17 characters, upper- or lower-case hex
/// pairs separated by colons (`01:0C:CD:04:00:01`). Parsing rejects any other
/// shape; `Display` renders upper-case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Parses a MAC address from the strict `XX:XX:XX:XX:XX:XX` form.
    ///
    /// # Parameters
    ///
    /// * `s`: Candidate text, which must be exactly 17 characters with `:` at
    ///   positions 2, 5, 8, 11 and 14 and hex digits everywhere else.
    ///
    /// # Returns
    ///
    /// * `Ok(MacAddress)`: The parsed six-byte address.
    /// * `Err(ParseError::InvalidMac)`: For any malformed input.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let bytes = s.as_bytes();
        if bytes.len() != 17 {
            return Err(ParseError::InvalidMac {
                message: format!("expected 17 characters (XX:XX:XX:XX:XX:XX), got {}", s.len()),
            });
        }
        let mut out = [0u8; 6];
        for (i, &b) in bytes.iter().enumerate() {
            if i % 3 == 2 {
                if b != b':' {
                    return Err(ParseError::InvalidMac {
                        message: format!("expected ':' at position {}", i),
                    });
                }
            } else if !b.is_ascii_hexdigit() {
                return Err(ParseError::InvalidMac {
                    message: format!("non-hex character at position {}", i),
                });
            }
        }
        for (idx, chunk) in out.iter_mut().enumerate() {
            let pos = idx * 3;
            *chunk = u8::from_str_radix(&s[pos..pos + 2], 16).map_err(|_| {
                ParseError::InvalidMac {
                    message: format!("non-hex byte at position {}", pos),
                }
            })?;
        }
        Ok(MacAddress(out))
    }

    /// Returns the raw six bytes in transmission order.
    pub fn bytes(&self) -> [u8; 6] {
        self.0
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        MacAddress(bytes)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// Validated 802.1Q VLAN tag.
///
/// # Fields
///
/// * `priority`: PCP, 3 bits (0-7).
/// * `dei`: Drop Eligible Indicator.
/// * `id`: VID, 12 bits (0-4095).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanTag {
    priority: u8,
    dei: bool,
    id: u16,
}

impl VlanTag {
    /// Creates a VLAN tag, validating the field ranges.
    ///
    /// # Returns
    ///
    /// * `Ok(VlanTag)`: When `priority <= 7` and `id <= 4095`.
    /// * `Err(ParseError::InvalidVlan)`: Otherwise.
    pub fn new(priority: u8, dei: bool, id: u16) -> Result<Self, ParseError> {
        if priority > 7 {
            return Err(ParseError::InvalidVlan {
                message: format!("priority must be 0-7, got {}", priority),
            });
        }
        if id > 4095 {
            return Err(ParseError::InvalidVlan {
                message: format!("id must be 0-4095, got {}", id),
            });
        }
        Ok(VlanTag { priority, dei, id })
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn dei(&self) -> bool {
        self.dei
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// Returns the Tag Control Information word: `prio<<13 | dei<<12 | id`.
    pub fn tci(&self) -> u16 {
        ((self.priority as u16) << 13) | ((self.dei as u16) << 12) | self.id
    }

    /// Encodes the tag as the four on-wire bytes `0x81 0x00 TCI_hi TCI_lo`.
    pub fn encoded(&self) -> [u8; 4] {
        let tci = self.tci();
        [0x81, 0x00, (tci >> 8) as u8, (tci & 0xFF) as u8]
    }
}

/// IEC 61850 `UtcTime`: epoch seconds plus a 2^-32 binary fraction.
///
/// The `defined` flag mirrors the optionality of `refrTm`; an undefined
/// timestamp is simply not emitted by the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtcTime {
    pub seconds: u32,
    pub fraction: u32,
    pub defined: bool,
}

impl UtcTime {
    /// Creates a defined timestamp from epoch seconds and sub-second
    /// nanoseconds. The nanoseconds are rescaled to the 2^32 binary fraction
    /// the wire format carries.
    pub fn new(seconds: u32, fraction_ns: u32) -> Self {
        let fraction = ((fraction_ns as u64) << 32) / 1_000_000_000;
        UtcTime {
            seconds,
            fraction: fraction as u32,
            defined: true,
        }
    }

    /// An undefined (absent) timestamp.
    pub fn undefined() -> Self {
        UtcTime {
            seconds: 0,
            fraction: 0,
            defined: false,
        }
    }

    /// The current wall-clock time as a defined `UtcTime`.
    pub fn now() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        UtcTime::new(now.as_secs() as u32, now.subsec_nanos())
    }

    /// Recovers the sub-second part in nanoseconds.
    pub fn fraction_ns(&self) -> u32 {
        (((self.fraction as u64) * 1_000_000_000) >> 32) as u32
    }

    /// Encodes the timestamp as 8 big-endian bytes: seconds then fraction.
    pub fn to_hex(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&self.seconds.to_be_bytes());
        buf[4..8].copy_from_slice(&self.fraction.to_be_bytes());
        buf
    }

    /// Decodes a timestamp from 8 big-endian bytes.
    ///
    /// # Returns
    ///
    /// * `Ok(UtcTime)`: The decoded, defined timestamp.
    /// * `Err(ParseError::Truncated)`: If fewer than 8 bytes are supplied.
    pub fn from_hex(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < 8 {
            return Err(ParseError::Truncated {
                message: format!("UtcTime needs 8 bytes, got {}", bytes.len()),
            });
        }
        Ok(UtcTime {
            seconds: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            fraction: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            defined: true,
        })
    }
}
