// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright lrwpan-tsch Contributors 2025.

//! IEEE 802.15.4/15.4e MAC header codec.
//!
//! Each MAC header carries, in order and with absent parts omitted:
//!
//! ```text
//! Frame Control      : 2 octets
//! Sequence Number    : 0/1 octet
//! Dst PAN Id         : 0/2 octets
//! Dst Address        : 0/2/8 octets
//! Src PAN Id         : 0/2 octets
//! Src Address        : 0/2/8 octets
//! Aux Sec Header     : 0/5/6/10/14 octets
//! IE chain           : variable (frame version 2 only)
//! ```
//!
//! For frame version 2 (IEEE 802.15.4e) bits 7-9 of the frame control
//! field are reinterpreted as reserved / sequence-number-suppression /
//! IE-list-present, and PAN ID presence follows the version-2 elision
//! rules; see [`Header::pan_id_presence`].

use crate::net::stream::{Reader, Writer};
use crate::net::CodecError;

pub type PanID = u16;

pub const BROADCAST_SHORT_ADDR: u16 = 0xffff;
pub const BROADCAST_PAN_ID: u16 = 0xffff;

/// Header IE ID of the 15.4e ACK/NACK time-correction IE.
pub const ACK_IE_ID: u8 = 0x1e;
/// Header IE ID terminating a chain that is followed by payload IEs.
pub const IE_PAYLOAD_TERMINATOR: u8 = 0x7e;
/// Header IE ID terminating a chain with no payload IEs.
pub const IE_NO_PAYLOAD_TERMINATOR: u8 = 0x7f;

const MAX_IE_CONTENT: usize = 0x7f;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Beacon = 0,
    Data = 1,
    Acknowledgement = 2,
    MACCommand = 3,
    LLDN = 4,
    Multipurpose = 5,
}

impl FrameType {
    fn from_fcf(bits: u16) -> Result<FrameType, CodecError> {
        match bits {
            0 => Ok(FrameType::Beacon),
            1 => Ok(FrameType::Data),
            2 => Ok(FrameType::Acknowledgement),
            3 => Ok(FrameType::MACCommand),
            4 => Ok(FrameType::LLDN),
            5 => Ok(FrameType::Multipurpose),
            _ => Err(CodecError::ReservedType),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
pub enum FrameVersion {
    V2003 = 0,
    V2006 = 1,
    V2015 = 2,
}

impl FrameVersion {
    fn from_fcf(bits: u16) -> Result<FrameVersion, CodecError> {
        match bits {
            0 => Ok(FrameVersion::V2003),
            1 => Ok(FrameVersion::V2006),
            2 => Ok(FrameVersion::V2015),
            _ => Err(CodecError::UnsupportedVersion),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    NotPresent = 0,
    Reserved = 1,
    Short = 2,
    Long = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAddress {
    Short(u16),
    Long([u8; 8]),
}

impl MacAddress {
    pub fn address_mode(&self) -> AddressMode {
        match self {
            MacAddress::Short(_) => AddressMode::Short,
            MacAddress::Long(_) => AddressMode::Long,
        }
    }
}

/// Security level field of the auxiliary security header. Reserved for
/// future use; no security suite is implemented on top of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityLevel {
    None = 0,
    Mic32 = 1,
    Mic64 = 2,
    Mic128 = 3,
    Enc = 4,
    EncMic32 = 5,
    EncMic64 = 6,
    EncMic128 = 7,
}

impl SecurityLevel {
    fn from_bits(bits: u8) -> SecurityLevel {
        match bits & 0x7 {
            0 => SecurityLevel::None,
            1 => SecurityLevel::Mic32,
            2 => SecurityLevel::Mic64,
            3 => SecurityLevel::Mic128,
            4 => SecurityLevel::Enc,
            5 => SecurityLevel::EncMic32,
            6 => SecurityLevel::EncMic64,
            _ => SecurityLevel::EncMic128,
        }
    }
}

/// Key identifier of the auxiliary security header, one variant per key
/// identifier mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyId {
    Implicit,
    Index(u8),
    Source4Index([u8; 4], u8),
    Source8Index([u8; 8], u8),
}

impl KeyId {
    fn mode(&self) -> u8 {
        match self {
            KeyId::Implicit => 0,
            KeyId::Index(_) => 1,
            KeyId::Source4Index(_, _) => 2,
            KeyId::Source8Index(_, _) => 3,
        }
    }
}

/// Auxiliary security header. Serialized as 5, 6, 10 or 14 octets
/// depending on the key identifier mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Security {
    pub level: SecurityLevel,
    pub frame_counter: u32,
    pub key_id: KeyId,
}

/// One element of the 15.4e header IE chain. The two-octet descriptor
/// packs content length (7 bits), element type (1 bit, transmitted as
/// bit 0) and the element ID (8 bits).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InformationElement {
    pub id: u8,
    pub element_type: u8,
    pub content: Vec<u8>,
}

impl InformationElement {
    pub fn is_terminator(&self) -> bool {
        self.id == IE_PAYLOAD_TERMINATOR || self.id == IE_NO_PAYLOAD_TERMINATOR
    }
}

/// A parsed or to-be-encoded MAC header.
///
/// `seq_suppressed` mirrors the frame-control bit and is meaningful for
/// version-2 frames only: the sequence number is serialized iff the frame
/// version is not 2 or suppression is off.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub frame_type: FrameType,
    pub frame_pending: bool,
    pub ack_requested: bool,
    pub pan_id_compression: bool,
    pub version: FrameVersion,
    pub seq_suppressed: bool,
    pub seq: Option<u8>,
    pub dst_pan: Option<PanID>,
    pub dst_addr: Option<MacAddress>,
    pub src_pan: Option<PanID>,
    pub src_addr: Option<MacAddress>,
    pub security: Option<Security>,
    pub ies: Vec<InformationElement>,
}

impl Header {
    /// A data-frame skeleton at the 15.4e version, everything else off.
    pub fn new(frame_type: FrameType) -> Header {
        Header {
            frame_type,
            frame_pending: false,
            ack_requested: false,
            pan_id_compression: false,
            version: FrameVersion::V2015,
            seq_suppressed: false,
            seq: None,
            dst_pan: None,
            dst_addr: None,
            src_pan: None,
            src_addr: None,
            security: None,
            ies: Vec::new(),
        }
    }

    pub fn is_ack(&self) -> bool {
        self.frame_type == FrameType::Acknowledgement
    }

    pub fn is_data(&self) -> bool {
        self.frame_type == FrameType::Data
    }

    /// Append the 15.4e ACK time-correction IE (big-endian content).
    pub fn push_ack_ie(&mut self, correction: u16) {
        self.ies.push(InformationElement {
            id: ACK_IE_ID,
            element_type: 0,
            content: correction.to_be_bytes().to_vec(),
        });
    }

    /// Terminate the header IE chain; no payload IEs follow.
    pub fn terminate_no_payload(&mut self) {
        self.ies.push(InformationElement {
            id: IE_NO_PAYLOAD_TERMINATOR,
            element_type: 0,
            content: Vec::new(),
        });
    }

    /// The time correction carried in an ACK IE, if one is present.
    pub fn ack_ie_correction(&self) -> Option<u16> {
        self.ies.iter().find(|ie| ie.id == ACK_IE_ID).and_then(|ie| {
            let bytes: [u8; 2] = ie.content.as_slice().try_into().ok()?;
            Some(u16::from_be_bytes(bytes))
        })
    }

    fn seq_present(&self) -> bool {
        self.version != FrameVersion::V2015 || !self.seq_suppressed
    }

    fn ies_present(&self) -> bool {
        self.version == FrameVersion::V2015 && !self.ies.is_empty()
    }

    /// PAN ID presence on the wire, `(dst_pan, src_pan)`.
    ///
    /// Version 2, compression off: the destination PAN rides along whenever
    /// a destination address is present, otherwise the source PAN rides
    /// along when only a source address is present. Version 2, compression
    /// on: one destination PAN when both addresses are present, none when
    /// exactly one is, one destination PAN when neither is. Versions below
    /// 2 carry a PAN for each present address, except that compression
    /// with both addresses elides the source PAN (inferred on decode).
    fn pan_id_presence(
        version: FrameVersion,
        compression: bool,
        dst_present: bool,
        src_present: bool,
    ) -> (bool, bool) {
        if version == FrameVersion::V2015 {
            if !compression {
                (dst_present, !dst_present && src_present)
            } else {
                match (dst_present, src_present) {
                    (true, true) => (true, false),
                    (false, false) => (true, false),
                    _ => (false, false),
                }
            }
        } else {
            (dst_present, src_present && !(compression && dst_present))
        }
    }

    fn fcf(&self) -> u16 {
        let dst_mode = self
            .dst_addr
            .map_or(AddressMode::NotPresent, |a| a.address_mode());
        let src_mode = self
            .src_addr
            .map_or(AddressMode::NotPresent, |a| a.address_mode());

        let mut fcf = self.frame_type as u16 & 0x7;
        fcf |= (self.security.is_some() as u16) << 3;
        fcf |= (self.frame_pending as u16) << 4;
        fcf |= (self.ack_requested as u16) << 5;
        fcf |= (self.pan_id_compression as u16) << 6;
        if self.version == FrameVersion::V2015 {
            fcf |= (self.seq_suppressed as u16) << 8;
            fcf |= (self.ies_present() as u16) << 9;
        }
        fcf |= (dst_mode as u16) << 10;
        fcf |= (self.version as u16) << 12;
        fcf |= (src_mode as u16) << 14;
        fcf
    }

    /// Serialize the header into `out`, returning the number of bytes
    /// written.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<usize, CodecError> {
        if !self.ies.is_empty() && self.version != FrameVersion::V2015 {
            return Err(CodecError::UnsupportedIe);
        }

        let mut w = Writer::new(out);
        w.write_u16_le(self.fcf());

        if self.seq_present() {
            w.write_u8(self.seq.unwrap_or(0));
        }

        let (dst_pan_present, src_pan_present) = Self::pan_id_presence(
            self.version,
            self.pan_id_compression,
            self.dst_addr.is_some(),
            self.src_addr.is_some(),
        );
        if dst_pan_present {
            w.write_u16_le(self.dst_pan.unwrap_or(BROADCAST_PAN_ID));
        }
        if let Some(addr) = self.dst_addr {
            Self::encode_address(&mut w, addr);
        }
        if src_pan_present {
            w.write_u16_le(self.src_pan.unwrap_or(BROADCAST_PAN_ID));
        }
        if let Some(addr) = self.src_addr {
            Self::encode_address(&mut w, addr);
        }

        if let Some(sec) = &self.security {
            let ctrl = (sec.level as u8 & 0x7) | (sec.key_id.mode() << 3);
            w.write_u8(ctrl);
            w.write_u32_le(sec.frame_counter);
            match sec.key_id {
                KeyId::Implicit => {}
                KeyId::Index(index) => w.write_u8(index),
                KeyId::Source4Index(src, index) => {
                    w.write_bytes(&src);
                    w.write_u8(index);
                }
                KeyId::Source8Index(src, index) => {
                    w.write_bytes(&src);
                    w.write_u8(index);
                }
            }
        }

        if self.ies_present() {
            for ie in &self.ies {
                if ie.content.len() > MAX_IE_CONTENT {
                    return Err(CodecError::UnsupportedIe);
                }
                let desc = ((ie.content.len() as u16) << 9)
                    | ((ie.id as u16) << 1)
                    | (ie.element_type as u16 & 0x1);
                w.write_u16_le(desc);
                w.write_bytes(&ie.content);
            }
        }

        Ok(w.written())
    }

    fn encode_address(w: &mut Writer, addr: MacAddress) {
        match addr {
            MacAddress::Short(a) => w.write_u16_le(a),
            MacAddress::Long(a) => w.write_bytes(&a),
        }
    }

    /// Parse a MAC header off the front of `buf`. Returns the header and
    /// the number of bytes it occupies (the MAC payload offset).
    pub fn decode(buf: &[u8]) -> Result<(Header, usize), CodecError> {
        let mut r = Reader::new(buf);
        let fcf = r.read_u16_le()?;

        let frame_type = FrameType::from_fcf(fcf & 0x7)?;
        let version = FrameVersion::from_fcf((fcf >> 12) & 0x3)?;
        let sec_enabled = fcf & (1 << 3) != 0;
        let frame_pending = fcf & (1 << 4) != 0;
        let ack_requested = fcf & (1 << 5) != 0;
        let pan_id_compression = fcf & (1 << 6) != 0;
        let (seq_suppressed, ies_present) = if version == FrameVersion::V2015 {
            (fcf & (1 << 8) != 0, fcf & (1 << 9) != 0)
        } else {
            (false, false)
        };
        let dst_mode = Self::address_mode((fcf >> 10) & 0x3)?;
        let src_mode = Self::address_mode((fcf >> 14) & 0x3)?;

        let seq = if version != FrameVersion::V2015 || !seq_suppressed {
            Some(r.read_u8()?)
        } else {
            None
        };

        let (dst_pan_present, src_pan_present) = Self::pan_id_presence(
            version,
            pan_id_compression,
            dst_mode != AddressMode::NotPresent,
            src_mode != AddressMode::NotPresent,
        );

        let dst_pan = if dst_pan_present {
            Some(r.read_u16_le()?)
        } else {
            None
        };
        let dst_addr = Self::decode_address(&mut r, dst_mode)?;
        let mut src_pan = if src_pan_present {
            Some(r.read_u16_le()?)
        } else {
            None
        };
        let src_addr = Self::decode_address(&mut r, src_mode)?;

        // An elided source PAN means the sender shares the destination
        // PAN; recover it so callers see a complete header.
        if src_addr.is_some() && !src_pan_present {
            src_pan = dst_pan;
        }

        let security = if sec_enabled {
            let ctrl = r.read_u8()?;
            let level = SecurityLevel::from_bits(ctrl & 0x7);
            let frame_counter = r.read_u32_le()?;
            let key_id = match (ctrl >> 3) & 0x3 {
                0 => KeyId::Implicit,
                1 => KeyId::Index(r.read_u8()?),
                2 => {
                    let mut src = [0; 4];
                    src.copy_from_slice(r.read_bytes(4)?);
                    KeyId::Source4Index(src, r.read_u8()?)
                }
                _ => {
                    let mut src = [0; 8];
                    src.copy_from_slice(r.read_bytes(8)?);
                    KeyId::Source8Index(src, r.read_u8()?)
                }
            };
            Some(Security {
                level,
                frame_counter,
                key_id,
            })
        } else {
            None
        };

        let mut ies = Vec::new();
        if ies_present {
            loop {
                let desc = r.read_u16_le()?;
                let len = (desc >> 9) as usize;
                let id = ((desc >> 1) & 0xff) as u8;
                let element_type = (desc & 0x1) as u8;
                let content = r.read_bytes(len)?.to_vec();
                let element = InformationElement {
                    id,
                    element_type,
                    content,
                };
                let terminated = element.is_terminator();
                ies.push(element);
                if terminated {
                    break;
                }
            }
        }

        Ok((
            Header {
                frame_type,
                frame_pending,
                ack_requested,
                pan_id_compression,
                version,
                seq_suppressed,
                seq,
                dst_pan,
                dst_addr,
                src_pan,
                src_addr,
                security,
                ies,
            },
            r.position(),
        ))
    }

    fn address_mode(bits: u16) -> Result<AddressMode, CodecError> {
        match bits {
            0 => Ok(AddressMode::NotPresent),
            2 => Ok(AddressMode::Short),
            3 => Ok(AddressMode::Long),
            _ => Err(CodecError::ReservedType),
        }
    }

    fn decode_address(
        r: &mut Reader,
        mode: AddressMode,
    ) -> Result<Option<MacAddress>, CodecError> {
        match mode {
            AddressMode::NotPresent | AddressMode::Reserved => Ok(None),
            AddressMode::Short => Ok(Some(MacAddress::Short(r.read_u16_le()?))),
            AddressMode::Long => {
                let mut addr = [0; 8];
                addr.copy_from_slice(r.read_bytes(8)?);
                Ok(Some(MacAddress::Long(addr)))
            }
        }
    }
}
