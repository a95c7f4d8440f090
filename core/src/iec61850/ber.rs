//! # BER Length Codec and TLV Walker
//!
//! ITU-T X.690 Basic Encoding Rules as restricted by IEC 61850: lengths use
//! the short form up to 127 and the one- or two-byte long forms (`0x81 L`,
//! `0x82 Hi Lo`) up to 65535. Longer lengths are refused in both directions.
//!
//! `TlvReader` is the bounds-checked cursor every frame walk in this crate
//! goes through; a declared length that reaches past the captured frame is a
//! `ParseError::Truncated`, never a wild read.

use super::common::ParseError;

/// Encodes a BER length field.
///
/// # Parameters
///
/// * `length`: The content length to encode.
///
/// # Returns
///
/// * `Ok(Vec<u8>)`: 1 byte for lengths up to 127, `0x81 L` for 128-255,
///   `0x82 Hi Lo` for 256-65535.
/// * `Err(ParseError::BerOverflow)`: For lengths of 65536 or more.
pub fn encode_ber_length(length: usize) -> Result<Vec<u8>, ParseError> {
    if length <= 0x7F {
        Ok(vec![length as u8])
    } else if length <= 0xFF {
        Ok(vec![0x81, length as u8])
    } else if length <= 0xFFFF {
        Ok(vec![0x82, (length >> 8) as u8, (length & 0xFF) as u8])
    } else {
        Err(ParseError::BerOverflow {
            message: format!("length {} exceeds 65535", length),
        })
    }
}

/// Decodes a BER length field starting at `pos`.
///
/// # Returns
///
/// * `Ok((length, next_pos))`: The decoded length and the offset of the first
///   content byte.
/// * `Err(ParseError::Truncated)`: If the buffer ends inside the length field.
/// * `Err(ParseError::BerOverflow)`: For long forms beyond two length bytes.
pub fn decode_ber_length(buf: &[u8], pos: usize) -> Result<(usize, usize), ParseError> {
    let first = *buf.get(pos).ok_or_else(|| ParseError::Truncated {
        message: format!("length byte at {} beyond frame of {} bytes", pos, buf.len()),
    })?;

    match first {
        0x00..=0x7F => Ok((first as usize, pos + 1)),
        0x81 => {
            let b = *buf.get(pos + 1).ok_or_else(|| ParseError::Truncated {
                message: format!("0x81 length at {} truncated", pos),
            })?;
            Ok((b as usize, pos + 2))
        }
        0x82 => {
            if pos + 3 > buf.len() {
                return Err(ParseError::Truncated {
                    message: format!("0x82 length at {} truncated", pos),
                });
            }
            Ok((
                ((buf[pos + 1] as usize) << 8) | buf[pos + 2] as usize,
                pos + 3,
            ))
        }
        other => Err(ParseError::BerOverflow {
            message: format!("unsupported length form 0x{:02X} at {}", other, pos),
        }),
    }
}

/// One tag-length-value element with its value located inside the source
/// buffer.
#[derive(Debug, Clone, Copy)]
pub struct Tlv {
    pub tag: u8,
    pub value_start: usize,
    pub value_len: usize,
}

/// Bounds-checked cursor over a run of TLV elements inside `buf[..end]`.
pub struct TlvReader<'a> {
    buf: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> TlvReader<'a> {
    /// Creates a reader over `buf[start..end]`.
    ///
    /// # Returns
    ///
    /// * `Err(ParseError::Truncated)`: If `end` reaches past the buffer.
    pub fn new(buf: &'a [u8], start: usize, end: usize) -> Result<Self, ParseError> {
        if end > buf.len() || start > end {
            return Err(ParseError::Truncated {
                message: format!(
                    "TLV window {}..{} outside frame of {} bytes",
                    start,
                    end,
                    buf.len()
                ),
            });
        }
        Ok(TlvReader {
            buf,
            pos: start,
            end,
        })
    }

    /// Current cursor offset into the source buffer.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// True when the window is fully consumed.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.end
    }

    /// Reads the next TLV, validating that its value lies inside the window.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(Tlv))`: The next element.
    /// * `Ok(None)`: When the window is exhausted.
    /// * `Err(ParseError::Truncated)`: When a header or declared value would
    ///   cross the window end.
    pub fn next_tlv(&mut self) -> Result<Option<Tlv>, ParseError> {
        if self.pos >= self.end {
            return Ok(None);
        }
        if self.pos + 2 > self.end {
            return Err(ParseError::Truncated {
                message: format!("TLV header at {} truncated", self.pos),
            });
        }
        let tag = self.buf[self.pos];
        let (value_len, value_start) = decode_ber_length(self.buf, self.pos + 1)?;
        if value_start + value_len > self.end {
            return Err(ParseError::Truncated {
                message: format!(
                    "TLV value at {} ({} bytes) exceeds window end {}",
                    value_start, value_len, self.end
                ),
            });
        }
        self.pos = value_start + value_len;
        Ok(Some(Tlv {
            tag,
            value_start,
            value_len,
        }))
    }

    /// Reads the next TLV and requires it to carry `expected_tag`.
    pub fn expect_tag(&mut self, expected_tag: u8) -> Result<Tlv, ParseError> {
        match self.next_tlv()? {
            Some(tlv) if tlv.tag == expected_tag => Ok(tlv),
            Some(tlv) => Err(ParseError::InvalidTag {
                message: format!(
                    "expected tag 0x{:02X} at {}, got 0x{:02X}",
                    expected_tag,
                    tlv.value_start - 2,
                    tlv.tag
                ),
            }),
            None => Err(ParseError::Truncated {
                message: format!("expected tag 0x{:02X}, window exhausted", expected_tag),
            }),
        }
    }

    /// Borrows the value bytes of a previously read TLV.
    pub fn value(&self, tlv: &Tlv) -> &'a [u8] {
        &self.buf[tlv.value_start..tlv.value_start + tlv.value_len]
    }
}

/// Reads a big-endian signed 32-bit integer from a 1-4 byte BER INTEGER
/// content, sign-extending short encodings.
pub fn decode_i32(bytes: &[u8]) -> Result<i32, ParseError> {
    if bytes.is_empty() || bytes.len() > 4 {
        return Err(ParseError::InvalidTag {
            message: format!("INTEGER content of {} bytes", bytes.len()),
        });
    }
    let mut value: i32 = if bytes[0] & 0x80 != 0 { -1 } else { 0 };
    for &b in bytes {
        value = (value << 8) | b as i32;
    }
    Ok(value)
}
