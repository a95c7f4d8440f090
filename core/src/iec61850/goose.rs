//! # IEC 61850-8-1 GOOSE Frame Codec
//!
//! Encoder and bounds-checked decoder for GOOSE frames. The goosePdu fields
//! are context-tagged `[0]`..`[11]` in fixed order; `allData` is a sequence
//! of tagged `Data` elements whose length field must switch to the BER long
//! form as soon as the payload exceeds 127 bytes (300 booleans encode to 900
//! bytes, declared `0x82 0x03 0x84`).
//!
//! The trip path only interprets boolean and integer leaves; every other
//! `Data` type round-trips through `GooseData::Unknown` untouched. The flat
//! boolean view (`bool_view`) is the payload the trip-rule engine consumes:
//! one byte per top-level element, 1 for a boolean true, 0 otherwise.
//!
//! ## Usage
//!
//! The sniffer decodes captured GOOSE traffic with `GooseFrame::from_hex`;
//! the CLI mock relay and the test suites encode trip frames with
//! `GooseFrame::encode`.

use super::ber::{decode_ber_length, decode_i32, encode_ber_length, TlvReader};
use super::common::{MacAddress, ParseError, UtcTime, VlanTag, ETHERTYPE_GOOSE};
use super::sampled_values::ethertype_of;

/// Offset of the APPID word relative to the frame start for a VLAN-tagged
/// GOOSE frame.
const APPID_OFFSET: usize = 18;

/// One element of the GOOSE `allData` sequence.
///
/// Boolean and integer leaves are fully interpreted by the trip path; the
/// remaining MMS data types and nested containers are carried structurally
/// so a decoded frame re-encodes byte for byte.
#[derive(Debug, Clone, PartialEq)]
pub enum GooseData {
    Array(Vec<GooseData>),
    Structure(Vec<GooseData>),
    Boolean(bool),
    BitString(Vec<u8>),
    Integer(i32),
    Unsigned(u32),
    FloatingPoint(Vec<u8>),
    /// IEEE 754 double, 8 bytes big-endian on the wire.
    Real(f64),
    OctetString(Vec<u8>),
    VisibleString(String),
    BinaryTime(Vec<u8>),
    Bcd(i32),
    BooleanArray(Vec<u8>),
    ObjId(String),
    MmsString(String),
    UtcTime(UtcTime),
    /// Any tag this codec does not interpret; preserved verbatim.
    Unknown { tag: u8, bytes: Vec<u8> },
}

impl GooseData {
    fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), ParseError> {
        match self {
            GooseData::Array(items) => encode_container(0xA1, items, out),
            GooseData::Structure(items) => encode_container(0xA2, items, out),
            GooseData::Boolean(value) => {
                out.extend_from_slice(&[0x83, 0x01, if *value { 0xFF } else { 0x00 }]);
                Ok(())
            }
            GooseData::BitString(bits) => encode_primitive(0x84, bits, out),
            GooseData::Integer(value) => {
                out.extend_from_slice(&[0x85, 0x04]);
                out.extend_from_slice(&value.to_be_bytes());
                Ok(())
            }
            GooseData::Unsigned(value) => {
                out.extend_from_slice(&[0x86, 0x04]);
                out.extend_from_slice(&value.to_be_bytes());
                Ok(())
            }
            GooseData::FloatingPoint(bytes) => encode_primitive(0x87, bytes, out),
            GooseData::Real(value) => {
                out.extend_from_slice(&[0x88, 0x08]);
                out.extend_from_slice(&value.to_be_bytes());
                Ok(())
            }
            GooseData::OctetString(bytes) => encode_primitive(0x89, bytes, out),
            GooseData::VisibleString(s) => encode_primitive(0x8A, s.as_bytes(), out),
            GooseData::BinaryTime(bytes) => encode_primitive(0x8B, bytes, out),
            GooseData::Bcd(value) => {
                out.extend_from_slice(&[0x8C, 0x04]);
                out.extend_from_slice(&value.to_be_bytes());
                Ok(())
            }
            GooseData::BooleanArray(bits) => encode_primitive(0x8D, bits, out),
            GooseData::ObjId(s) => encode_primitive(0x8E, s.as_bytes(), out),
            GooseData::MmsString(s) => encode_primitive(0x8F, s.as_bytes(), out),
            GooseData::UtcTime(t) => encode_primitive(0x90, &t.to_hex(), out),
            GooseData::Unknown { tag, bytes } => encode_primitive(*tag, bytes, out),
        }
    }

    fn decode(tag: u8, value: &[u8], frame: &[u8], value_start: usize) -> Result<Self, ParseError> {
        Ok(match tag {
            0xA1 => GooseData::Array(decode_container(frame, value_start, value.len())?),
            0xA2 => GooseData::Structure(decode_container(frame, value_start, value.len())?),
            0x83 => GooseData::Boolean(value.first().is_some_and(|&b| b != 0)),
            0x84 => GooseData::BitString(value.to_vec()),
            0x85 => GooseData::Integer(decode_i32(value)?),
            0x86 => {
                if value.is_empty() || value.len() > 4 {
                    return Err(ParseError::InvalidTag {
                        message: format!("Unsigned content of {} bytes", value.len()),
                    });
                }
                let mut v: u32 = 0;
                for &b in value {
                    v = (v << 8) | b as u32;
                }
                GooseData::Unsigned(v)
            }
            0x87 => GooseData::FloatingPoint(value.to_vec()),
            0x88 => {
                if value.len() != 8 {
                    return Err(ParseError::InvalidTag {
                        message: format!("Real content of {} bytes", value.len()),
                    });
                }
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(value);
                GooseData::Real(f64::from_be_bytes(bytes))
            }
            0x89 => GooseData::OctetString(value.to_vec()),
            0x8A => GooseData::VisibleString(String::from_utf8_lossy(value).into_owned()),
            0x8B => GooseData::BinaryTime(value.to_vec()),
            0x8C => GooseData::Bcd(decode_i32(value)?),
            0x8D => GooseData::BooleanArray(value.to_vec()),
            0x8E => GooseData::ObjId(String::from_utf8_lossy(value).into_owned()),
            0x8F => GooseData::MmsString(String::from_utf8_lossy(value).into_owned()),
            0x90 => GooseData::UtcTime(UtcTime::from_hex(value)?),
            other => GooseData::Unknown {
                tag: other,
                bytes: value.to_vec(),
            },
        })
    }
}

fn encode_container(tag: u8, items: &[GooseData], out: &mut Vec<u8>) -> Result<(), ParseError> {
    let mut inner = Vec::new();
    for item in items {
        item.encode_into(&mut inner)?;
    }
    out.push(tag);
    out.extend_from_slice(&encode_ber_length(inner.len())?);
    out.extend_from_slice(&inner);
    Ok(())
}

fn encode_primitive(tag: u8, bytes: &[u8], out: &mut Vec<u8>) -> Result<(), ParseError> {
    out.push(tag);
    out.extend_from_slice(&encode_ber_length(bytes.len())?);
    out.extend_from_slice(bytes);
    Ok(())
}

fn decode_container(frame: &[u8], start: usize, len: usize) -> Result<Vec<GooseData>, ParseError> {
    let mut reader = TlvReader::new(frame, start, start + len)?;
    let mut items = Vec::new();
    while let Some(tlv) = reader.next_tlv()? {
        items.push(GooseData::decode(
            tlv.tag,
            reader.value(&tlv),
            frame,
            tlv.value_start,
        )?);
    }
    Ok(items)
}

/// A complete GOOSE PDU.
///
/// # Fields
///
/// The fields appear on the wire in declaration order, context-tagged
/// `[0]`..`[11]`. `num_dat_set_entries` is recomputed from `all_data` at
/// encode time.
#[derive(Debug, Clone)]
pub struct GooseFrame {
    pub app_id: u16,
    pub gocb_ref: String,
    pub time_allowed_to_live: i32,
    pub dat_set: String,
    pub go_id: Option<String>,
    pub t: UtcTime,
    pub st_num: i32,
    pub sq_num: i32,
    pub simulation: bool,
    pub conf_rev: i32,
    pub nds_com: bool,
    pub num_dat_set_entries: i32,
    pub all_data: Vec<GooseData>,
}

impl GooseFrame {
    /// Encodes the frame as a full VLAN-tagged Ethernet frame.
    ///
    /// # Returns
    ///
    /// * `Ok(Vec<u8>)`: The frame image.
    /// * `Err(ParseError::BerOverflow)`: If a nested length exceeds 65535.
    pub fn encode(
        &self,
        mac_dst: &MacAddress,
        mac_src: &MacAddress,
        vlan: &VlanTag,
    ) -> Result<Vec<u8>, ParseError> {
        let pdu = self.encode_pdu()?;
        let pdu_len_field = encode_ber_length(pdu.len())?;

        let total_len = APPID_OFFSET + 2 + 2 + 4 + 1 + pdu_len_field.len() + pdu.len();
        let mut bytes = Vec::with_capacity(total_len);

        bytes.extend_from_slice(&mac_dst.bytes());
        bytes.extend_from_slice(&mac_src.bytes());
        bytes.extend_from_slice(&vlan.encoded());
        bytes.extend_from_slice(&ETHERTYPE_GOOSE.to_be_bytes());
        bytes.extend_from_slice(&self.app_id.to_be_bytes());

        let length = (total_len - APPID_OFFSET) as u16;
        bytes.extend_from_slice(&length.to_be_bytes());
        bytes.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);

        bytes.push(0x61);
        bytes.extend_from_slice(&pdu_len_field);
        bytes.extend_from_slice(&pdu);

        Ok(bytes)
    }

    fn encode_pdu(&self) -> Result<Vec<u8>, ParseError> {
        let mut pdu = Vec::with_capacity(128 + self.all_data.len() * 3);

        encode_primitive(0x80, self.gocb_ref.as_bytes(), &mut pdu)?;

        pdu.extend_from_slice(&[0x81, 0x04]);
        pdu.extend_from_slice(&self.time_allowed_to_live.to_be_bytes());

        encode_primitive(0x82, self.dat_set.as_bytes(), &mut pdu)?;

        if let Some(go_id) = &self.go_id {
            encode_primitive(0x83, go_id.as_bytes(), &mut pdu)?;
        }

        pdu.extend_from_slice(&[0x84, 0x08]);
        pdu.extend_from_slice(&self.t.to_hex());

        pdu.extend_from_slice(&[0x85, 0x04]);
        pdu.extend_from_slice(&self.st_num.to_be_bytes());

        pdu.extend_from_slice(&[0x86, 0x04]);
        pdu.extend_from_slice(&self.sq_num.to_be_bytes());

        pdu.extend_from_slice(&[0x87, 0x01, if self.simulation { 0xFF } else { 0x00 }]);

        pdu.extend_from_slice(&[0x88, 0x04]);
        pdu.extend_from_slice(&self.conf_rev.to_be_bytes());

        pdu.extend_from_slice(&[0x89, 0x01, if self.nds_com { 0xFF } else { 0x00 }]);

        pdu.extend_from_slice(&[0x8A, 0x04]);
        pdu.extend_from_slice(&(self.all_data.len() as i32).to_be_bytes());

        let mut all_data = Vec::new();
        for data in &self.all_data {
            data.encode_into(&mut all_data)?;
        }
        pdu.push(0xAB);
        pdu.extend_from_slice(&encode_ber_length(all_data.len())?);
        pdu.extend_from_slice(&all_data);

        Ok(pdu)
    }

    /// Decodes a captured GOOSE frame.
    ///
    /// Every TLV read validates its declared length against the capture;
    /// unknown optional tags inside the PDU are skipped by length.
    ///
    /// # Returns
    ///
    /// * `Ok(GooseFrame)`: The decoded PDU.
    /// * `Err(ParseError)`: On a non-GOOSE EtherType, missing goosePdu tag,
    ///   or any truncation.
    pub fn from_hex(frame: &[u8]) -> Result<GooseFrame, ParseError> {
        let (ethertype, payload) = ethertype_of(frame)?;
        if ethertype != ETHERTYPE_GOOSE {
            return Err(ParseError::InvalidTag {
                message: format!("EtherType 0x{:04X} is not GOOSE", ethertype),
            });
        }
        if payload + 8 > frame.len() {
            return Err(ParseError::Truncated {
                message: "GOOSE header (APPID/length/reserved) truncated".to_string(),
            });
        }
        let app_id = u16::from_be_bytes([frame[payload], frame[payload + 1]]);
        let pos = payload + 8;

        if frame.get(pos) != Some(&0x61) {
            return Err(ParseError::InvalidTag {
                message: format!("expected goosePdu tag 0x61 at {}", pos),
            });
        }
        let (pdu_len, content_start) = decode_ber_length(frame, pos + 1)?;
        let pdu_end = content_start + pdu_len;
        if pdu_end > frame.len() {
            return Err(ParseError::Truncated {
                message: format!("goosePdu length {} exceeds frame", pdu_len),
            });
        }

        let mut out = GooseFrame {
            app_id,
            gocb_ref: String::new(),
            time_allowed_to_live: 0,
            dat_set: String::new(),
            go_id: None,
            t: UtcTime::undefined(),
            st_num: 0,
            sq_num: 0,
            simulation: false,
            conf_rev: 0,
            nds_com: false,
            num_dat_set_entries: 0,
            all_data: Vec::new(),
        };

        let mut reader = TlvReader::new(frame, content_start, pdu_end)?;
        while let Some(tlv) = reader.next_tlv()? {
            let value = reader.value(&tlv);
            match tlv.tag {
                0x80 => out.gocb_ref = String::from_utf8_lossy(value).into_owned(),
                0x81 => out.time_allowed_to_live = decode_i32(value)?,
                0x82 => out.dat_set = String::from_utf8_lossy(value).into_owned(),
                0x83 => out.go_id = Some(String::from_utf8_lossy(value).into_owned()),
                0x84 => out.t = UtcTime::from_hex(value)?,
                0x85 => out.st_num = decode_i32(value)?,
                0x86 => out.sq_num = decode_i32(value)?,
                0x87 => out.simulation = value.first().is_some_and(|&b| b != 0),
                0x88 => out.conf_rev = decode_i32(value)?,
                0x89 => out.nds_com = value.first().is_some_and(|&b| b != 0),
                0x8A => out.num_dat_set_entries = decode_i32(value)?,
                0xAB => {
                    out.all_data = decode_container(frame, tlv.value_start, tlv.value_len)?;
                }
                // Unknown optional tags are skipped by length.
                _ => {}
            }
        }

        Ok(out)
    }

    /// Flat boolean view of `allData`: one byte per top-level element, 1 for
    /// a boolean true, 0 for everything else (including nested containers).
    pub fn bool_view(&self) -> Vec<u8> {
        self.all_data
            .iter()
            .map(|d| match d {
                GooseData::Boolean(true) => 1u8,
                _ => 0u8,
            })
            .collect()
    }
}
