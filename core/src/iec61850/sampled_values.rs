//! # IEC 61850-9-2 Sampled Values Frame Codec
//!
//! This module builds and parses Sampled Values frames. The encoder produces
//! the full Ethernet + 802.1Q + savPdu byte image and records the offsets of
//! each ASDU's `smpCnt` and `seqData` fields, so a running publisher patches
//! the live frame in place instead of re-encoding on every tick. The parser
//! walks a captured frame with bounds checks at every TLV and exposes the
//! per-ASDU sample words.
//!
//! ## Key Components
//!
//! - `SampledValueFrame`: The savPdu field set (svID, smpCnt, confRev,
//!   smpSynch and the optional datSet/refrTm/smpRate/smpMod).
//! - `EncodedSvFrame`: The rendered bytes plus per-ASDU patch offsets.
//! - `SvFrameInfo` / `SvAsduInfo`: The decoded view used by the sniffer and
//!   by tests.
//!
//! ## Usage
//!
//! Publishers build one `EncodedSvFrame` at configure time and patch it per
//! tick; the sniffer calls `parse_sv_frame` on captured traffic and forwards
//! the decoded samples to the analyzer.

use super::ber::{decode_ber_length, encode_ber_length, TlvReader};
use super::common::{MacAddress, ParseError, UtcTime, VlanTag, ETHERTYPE_SV, ETHERTYPE_VLAN};

/// Offset of the APPID word relative to the frame start (after the Ethernet
/// addresses, VLAN tag and SV EtherType). The on-wire `Length` field counts
/// from the APPID to the end of the PDU.
const APPID_OFFSET: usize = 18;

/// Field set of one savPdu, shared by every ASDU the frame carries.
///
/// # Fields
///
/// * `app_id`: APPID word after the SV EtherType.
/// * `no_asdu`: ASDU count per frame.
/// * `sv_id`: IEC visible-string stream identifier.
/// * `dat_set`: Optional data-set reference (`0x81`).
/// * `smp_cnt`: Initial sample counter value.
/// * `conf_rev`: Configuration revision (`0x83`, 4 bytes).
/// * `refr_tm`: Optional refresh time (`0x84`, 8 bytes).
/// * `smp_synch`: Synchronization source byte (`0x85`).
/// * `smp_rate`: Optional sample rate (`0x86`, 2 bytes).
/// * `smp_mod`: Optional sample mode (`0x88`, 2 bytes).
#[derive(Debug, Clone)]
pub struct SampledValueFrame {
    pub app_id: u16,
    pub no_asdu: u8,
    pub sv_id: String,
    pub dat_set: Option<String>,
    pub smp_cnt: u16,
    pub conf_rev: u32,
    pub refr_tm: UtcTime,
    pub smp_synch: u8,
    pub smp_rate: Option<u16>,
    pub smp_mod: Option<u16>,
}

/// A rendered SV frame together with the byte offsets a publisher patches on
/// every tick.
///
/// # Fields
///
/// * `bytes`: The complete Ethernet frame image.
/// * `smp_cnt_offsets`: Per-ASDU offset of the 2-byte `smpCnt` value.
/// * `seq_data_offsets`: Per-ASDU offset of the first `seqData` byte; each
///   channel occupies 8 bytes (value word + quality word) from there.
#[derive(Debug, Clone)]
pub struct EncodedSvFrame {
    pub bytes: Vec<u8>,
    pub smp_cnt_offsets: Vec<usize>,
    pub seq_data_offsets: Vec<usize>,
}

impl EncodedSvFrame {
    /// Patches the `smpCnt` of one ASDU in place.
    pub fn patch_smp_cnt(&mut self, asdu: usize, smp_cnt: u16) {
        let pos = self.smp_cnt_offsets[asdu];
        self.bytes[pos] = (smp_cnt >> 8) as u8;
        self.bytes[pos + 1] = (smp_cnt & 0xFF) as u8;
    }

    /// Patches one channel's sample value and quality word in place.
    pub fn patch_sample(&mut self, asdu: usize, channel: usize, value: i32, quality: u32) {
        let pos = self.seq_data_offsets[asdu] + channel * 8;
        self.bytes[pos..pos + 4].copy_from_slice(&value.to_be_bytes());
        self.bytes[pos + 4..pos + 8].copy_from_slice(&quality.to_be_bytes());
    }
}

impl SampledValueFrame {
    /// Encodes the frame and records the per-ASDU patch offsets.
    ///
    /// All ASDUs are rendered identically (same svID and initial counter);
    /// the publisher differentiates them by patching.
    ///
    /// # Parameters
    ///
    /// * `mac_dst` / `mac_src`: Ethernet addresses.
    /// * `vlan`: Validated 802.1Q tag.
    /// * `channel_count`: Channels per ASDU; `seqData` is `8 * channel_count`
    ///   bytes of zeroed value/quality words.
    ///
    /// # Returns
    ///
    /// * `Ok(EncodedSvFrame)`: The rendered frame and offsets.
    /// * `Err(ParseError::BerOverflow)`: If a nested length exceeds 65535.
    pub fn encode(
        &self,
        mac_dst: &MacAddress,
        mac_src: &MacAddress,
        vlan: &VlanTag,
        channel_count: u8,
    ) -> Result<EncodedSvFrame, ParseError> {
        // One ASDU body; smpCnt/seqData offsets are relative to its start.
        let (asdu_body, rel_smp_cnt, rel_seq_data) = self.encode_asdu_body(channel_count)?;

        let asdu_len_field = encode_ber_length(asdu_body.len())?;
        let asdu_block_len = 1 + asdu_len_field.len() + asdu_body.len();

        let seq_of_asdu_len = asdu_block_len * self.no_asdu as usize;
        let seq_len_field = encode_ber_length(seq_of_asdu_len)?;

        // savPdu body: noASDU then the sequence-of-ASDU container.
        let savpdu_len = 3 + 1 + seq_len_field.len() + seq_of_asdu_len;
        let savpdu_len_field = encode_ber_length(savpdu_len)?;

        let total_len =
            APPID_OFFSET + 2 + 2 + 4 + 1 + savpdu_len_field.len() + savpdu_len;
        let mut bytes = Vec::with_capacity(total_len);

        bytes.extend_from_slice(&mac_dst.bytes());
        bytes.extend_from_slice(&mac_src.bytes());
        bytes.extend_from_slice(&vlan.encoded());
        bytes.extend_from_slice(&ETHERTYPE_SV.to_be_bytes());
        bytes.extend_from_slice(&self.app_id.to_be_bytes());

        // Length counts from the APPID word to the end of the PDU.
        let length = (total_len - APPID_OFFSET) as u16;
        bytes.extend_from_slice(&length.to_be_bytes());

        // Reserved 1 and 2.
        bytes.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);

        bytes.push(0x60);
        bytes.extend_from_slice(&savpdu_len_field);

        // noASDU
        bytes.extend_from_slice(&[0x80, 0x01, self.no_asdu]);

        bytes.push(0xA2);
        bytes.extend_from_slice(&seq_len_field);

        let mut smp_cnt_offsets = Vec::with_capacity(self.no_asdu as usize);
        let mut seq_data_offsets = Vec::with_capacity(self.no_asdu as usize);
        for _ in 0..self.no_asdu {
            bytes.push(0x30);
            bytes.extend_from_slice(&asdu_len_field);
            let body_start = bytes.len();
            bytes.extend_from_slice(&asdu_body);
            smp_cnt_offsets.push(body_start + rel_smp_cnt);
            seq_data_offsets.push(body_start + rel_seq_data);
        }

        debug_assert_eq!(bytes.len(), total_len);

        Ok(EncodedSvFrame {
            bytes,
            smp_cnt_offsets,
            seq_data_offsets,
        })
    }

    /// Renders one ASDU body and returns the relative offsets of the
    /// `smpCnt` value and the first `seqData` byte.
    fn encode_asdu_body(&self, channel_count: u8) -> Result<(Vec<u8>, usize, usize), ParseError> {
        let mut body = Vec::with_capacity(64 + channel_count as usize * 8);

        // svID
        body.push(0x80);
        body.extend_from_slice(&encode_ber_length(self.sv_id.len())?);
        body.extend_from_slice(self.sv_id.as_bytes());

        if let Some(dat_set) = &self.dat_set {
            body.push(0x81);
            body.extend_from_slice(&encode_ber_length(dat_set.len())?);
            body.extend_from_slice(dat_set.as_bytes());
        }

        // smpCnt
        body.extend_from_slice(&[0x82, 0x02]);
        let rel_smp_cnt = body.len();
        body.extend_from_slice(&self.smp_cnt.to_be_bytes());

        // confRev
        body.extend_from_slice(&[0x83, 0x04]);
        body.extend_from_slice(&self.conf_rev.to_be_bytes());

        if self.refr_tm.defined {
            body.extend_from_slice(&[0x84, 0x08]);
            body.extend_from_slice(&self.refr_tm.to_hex());
        }

        // smpSynch
        body.extend_from_slice(&[0x85, 0x01, self.smp_synch]);

        if let Some(rate) = self.smp_rate {
            body.extend_from_slice(&[0x86, 0x02]);
            body.extend_from_slice(&rate.to_be_bytes());
        }

        // seqData: one zeroed value/quality pair per channel.
        body.push(0x87);
        body.extend_from_slice(&encode_ber_length(channel_count as usize * 8)?);
        let rel_seq_data = body.len();
        body.resize(body.len() + channel_count as usize * 8, 0);

        if let Some(smp_mod) = self.smp_mod {
            body.extend_from_slice(&[0x88, 0x02]);
            body.extend_from_slice(&smp_mod.to_be_bytes());
        }

        Ok((body, rel_smp_cnt, rel_seq_data))
    }
}

/// Decoded view of one ASDU.
#[derive(Debug, Clone)]
pub struct SvAsduInfo {
    pub sv_id: String,
    pub smp_cnt: u16,
    pub conf_rev: u32,
    pub smp_synch: u8,
    /// One `(value, quality)` pair per channel.
    pub samples: Vec<(i32, u32)>,
}

/// Decoded view of a captured SV frame.
#[derive(Debug, Clone)]
pub struct SvFrameInfo {
    pub mac_dst: MacAddress,
    pub mac_src: MacAddress,
    pub app_id: u16,
    pub asdus: Vec<SvAsduInfo>,
}

/// Locates the EtherType of a captured frame, skipping an optional 802.1Q
/// tag. Returns `(ethertype, payload_offset)`.
pub fn ethertype_of(frame: &[u8]) -> Result<(u16, usize), ParseError> {
    if frame.len() < 14 {
        return Err(ParseError::Truncated {
            message: format!("frame of {} bytes has no Ethernet header", frame.len()),
        });
    }
    let outer = u16::from_be_bytes([frame[12], frame[13]]);
    if outer == ETHERTYPE_VLAN {
        if frame.len() < 18 {
            return Err(ParseError::Truncated {
                message: "VLAN-tagged frame shorter than 18 bytes".to_string(),
            });
        }
        Ok((u16::from_be_bytes([frame[16], frame[17]]), 18))
    } else {
        Ok((outer, 14))
    }
}

/// Parses a captured Sampled Values frame.
///
/// # Parameters
///
/// * `frame`: The full captured Ethernet frame (with or without VLAN tag).
///
/// # Returns
///
/// * `Ok(SvFrameInfo)`: Decoded header and per-ASDU samples.
/// * `Err(ParseError)`: On a non-SV EtherType, unexpected tag, or any
///   declared length that escapes the capture.
pub fn parse_sv_frame(frame: &[u8]) -> Result<SvFrameInfo, ParseError> {
    let (ethertype, payload) = ethertype_of(frame)?;
    if ethertype != ETHERTYPE_SV {
        return Err(ParseError::InvalidTag {
            message: format!("EtherType 0x{:04X} is not Sampled Values", ethertype),
        });
    }
    if payload + 8 > frame.len() {
        return Err(ParseError::Truncated {
            message: "SV header (APPID/length/reserved) truncated".to_string(),
        });
    }

    let app_id = u16::from_be_bytes([frame[payload], frame[payload + 1]]);
    let mut pos = payload + 8;

    if frame.get(pos) != Some(&0x60) {
        return Err(ParseError::InvalidTag {
            message: format!("expected savPdu tag 0x60 at {}", pos),
        });
    }
    let (savpdu_len, content_start) = decode_ber_length(frame, pos + 1)?;
    let savpdu_end = content_start + savpdu_len;
    if savpdu_end > frame.len() {
        return Err(ParseError::Truncated {
            message: format!("savPdu length {} exceeds frame", savpdu_len),
        });
    }

    let mut reader = TlvReader::new(frame, content_start, savpdu_end)?;
    let no_asdu_tlv = reader.expect_tag(0x80)?;
    let no_asdu = *reader.value(&no_asdu_tlv).first().unwrap_or(&0);

    // Skip optional security, then require the sequence-of-ASDU container.
    let mut seq_tlv = reader.next_tlv()?.ok_or_else(|| ParseError::Truncated {
        message: "savPdu ends before sequence-of-ASDU".to_string(),
    })?;
    if seq_tlv.tag == 0x81 {
        seq_tlv = reader.expect_tag(0xA2)?;
    } else if seq_tlv.tag != 0xA2 {
        return Err(ParseError::InvalidTag {
            message: format!("expected sequence-of-ASDU tag 0xA2, got 0x{:02X}", seq_tlv.tag),
        });
    }

    let mut asdus = Vec::with_capacity(no_asdu as usize);
    let mut asdu_reader = TlvReader::new(
        frame,
        seq_tlv.value_start,
        seq_tlv.value_start + seq_tlv.value_len,
    )?;
    for _ in 0..no_asdu {
        let asdu_tlv = match asdu_reader.next_tlv()? {
            Some(tlv) => tlv,
            None => break,
        };
        if asdu_tlv.tag != 0x30 {
            return Err(ParseError::InvalidTag {
                message: format!("expected ASDU tag 0x30, got 0x{:02X}", asdu_tlv.tag),
            });
        }
        asdus.push(parse_asdu(frame, &asdu_tlv)?);
    }

    let mut dst = [0u8; 6];
    let mut src = [0u8; 6];
    dst.copy_from_slice(&frame[0..6]);
    src.copy_from_slice(&frame[6..12]);

    Ok(SvFrameInfo {
        mac_dst: MacAddress(dst),
        mac_src: MacAddress(src),
        app_id,
        asdus,
    })
}

fn parse_asdu(frame: &[u8], asdu_tlv: &super::ber::Tlv) -> Result<SvAsduInfo, ParseError> {
    let mut reader = TlvReader::new(
        frame,
        asdu_tlv.value_start,
        asdu_tlv.value_start + asdu_tlv.value_len,
    )?;

    let mut info = SvAsduInfo {
        sv_id: String::new(),
        smp_cnt: 0,
        conf_rev: 0,
        smp_synch: 0,
        samples: Vec::new(),
    };

    while let Some(tlv) = reader.next_tlv()? {
        let value = reader.value(&tlv);
        match tlv.tag {
            0x80 => info.sv_id = String::from_utf8_lossy(value).into_owned(),
            0x82 => {
                if value.len() != 2 {
                    return Err(ParseError::InvalidTag {
                        message: format!("smpCnt of {} bytes", value.len()),
                    });
                }
                info.smp_cnt = u16::from_be_bytes([value[0], value[1]]);
            }
            0x83 => {
                if value.len() != 4 {
                    return Err(ParseError::InvalidTag {
                        message: format!("confRev of {} bytes", value.len()),
                    });
                }
                info.conf_rev = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
            }
            0x85 => info.smp_synch = *value.first().unwrap_or(&0),
            0x87 => {
                for chunk in value.chunks_exact(8) {
                    let sample = i32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    let quality = u32::from_be_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
                    info.samples.push((sample, quality));
                }
            }
            // datSet, refrTm, smpRate, smpMod and unknown optional tags are
            // skipped by length.
            _ => {}
        }
    }

    Ok(info)
}
