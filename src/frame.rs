//! 802.11 MAC frame headers and encoding
//
// Copyright 2021 Ryan Kurte

use core::fmt;

use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;

use crate::Ts;

/// Frame check sequence length, appended by the PHY
pub const FCS_LEN: usize = 4;

/// ACK frame size including FCS
pub const ACK_SIZE: usize = 14;

/// CTS frame size including FCS
pub const CTS_SIZE: usize = 14;

/// RTS frame size including FCS
pub const RTS_SIZE: usize = 20;

/// Largest Duration/ID value that carries a duration, larger values are reserved
pub const MAX_DURATION: u16 = 32767;

/// Sequence numbers are 12 bits
pub const SEQ_MODULO: u16 = 4096;

/// Convert a time to a Duration/ID field value
pub fn duration_id(t: Ts) -> u16 {
    if t > MAX_DURATION as Ts {
        MAX_DURATION
    } else {
        t as u16
    }
}

/// 48-bit IEEE MAC address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    /// Group (multicast or broadcast) addresses have the I/G bit set
    pub fn is_group(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    /// Locally administered unicast address with the provided index
    pub fn local(index: u16) -> Self {
        let i = index.to_be_bytes();
        MacAddr([0x02, 0x00, 0x00, 0x00, i[0], i[1]])
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

/// Frame decoding errors
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecodeError {
    /// Buffer too short for the indicated frame type
    NotEnoughBytes,
    /// Unsupported frame type / subtype combination
    InvalidFrameType(u8, u8),
    /// Unsupported protocol version
    InvalidVersion(u8),
    /// Four address (WDS) frames are not supported
    FourAddress,
}

/// Frame types understood by the MAC
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameType {
    Beacon,
    /// Other management frames by subtype
    Mgmt(u8),
    Data,
    QosData,
    Rts,
    Cts,
    Ack,
}

const TYPE_MGMT: u8 = 0;
const TYPE_CTL: u8 = 1;
const TYPE_DATA: u8 = 2;

impl FrameType {
    /// (type, subtype) pair for the frame control field
    pub fn bits(&self) -> (u8, u8) {
        match self {
            FrameType::Beacon => (TYPE_MGMT, 8),
            FrameType::Mgmt(s) => (TYPE_MGMT, *s & 0x0f),
            FrameType::Data => (TYPE_DATA, 0),
            FrameType::QosData => (TYPE_DATA, 8),
            FrameType::Rts => (TYPE_CTL, 11),
            FrameType::Cts => (TYPE_CTL, 12),
            FrameType::Ack => (TYPE_CTL, 13),
        }
    }

    pub fn from_bits(ty: u8, subtype: u8) -> Result<Self, DecodeError> {
        let t = match (ty, subtype) {
            (TYPE_MGMT, 8) => FrameType::Beacon,
            (TYPE_MGMT, s) => FrameType::Mgmt(s),
            (TYPE_DATA, 0) => FrameType::Data,
            (TYPE_DATA, 8) => FrameType::QosData,
            (TYPE_CTL, 11) => FrameType::Rts,
            (TYPE_CTL, 12) => FrameType::Cts,
            (TYPE_CTL, 13) => FrameType::Ack,
            _ => return Err(DecodeError::InvalidFrameType(ty, subtype)),
        };
        Ok(t)
    }

    pub fn is_ctl(&self) -> bool {
        self.bits().0 == TYPE_CTL
    }

    pub fn is_data(&self) -> bool {
        self.bits().0 == TYPE_DATA
    }

    pub fn is_mgmt(&self) -> bool {
        self.bits().0 == TYPE_MGMT
    }
}

bitflags::bitflags! {
    /// Flags byte of the frame control field
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct FcFlags: u8 {
        const TO_DS          = 0b0000_0001;
        const FROM_DS        = 0b0000_0010;
        const MORE_FRAGMENTS = 0b0000_0100;
        const RETRY          = 0b0000_1000;
        const PWR_MGT        = 0b0001_0000;
        const MORE_DATA      = 0b0010_0000;
        const PROTECTED      = 0b0100_0000;
        const ORDER          = 0b1000_0000;
    }
}

/// QoS acknowledgment policy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AckPolicy {
    Normal,
    NoAck,
    NoExplicit,
    Block,
}

/// QoS control field
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct QosControl {
    pub tid: u8,
    pub ack_policy: AckPolicy,
}

impl QosControl {
    fn encode(&self) -> u16 {
        let policy: u16 = match self.ack_policy {
            AckPolicy::Normal => 0,
            AckPolicy::NoAck => 1,
            AckPolicy::NoExplicit => 2,
            AckPolicy::Block => 3,
        };
        (self.tid & 0x0f) as u16 | (policy << 5)
    }

    fn decode(v: u16) -> Self {
        let ack_policy = match (v >> 5) & 0b11 {
            0 => AckPolicy::Normal,
            1 => AckPolicy::NoAck,
            2 => AckPolicy::NoExplicit,
            _ => AckPolicy::Block,
        };
        Self {
            tid: (v & 0x0f) as u8,
            ack_policy,
        }
    }
}

/// 802.11 MAC header
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Header {
    pub kind: FrameType,
    pub flags: FcFlags,
    /// Duration/ID in microseconds
    pub duration: u16,
    /// Receiver address
    pub addr1: MacAddr,
    /// Transmitter address
    pub addr2: MacAddr,
    pub addr3: MacAddr,
    /// Sequence control, fragment number in bits 0..4 and sequence number in 4..16
    pub seq_ctrl: u16,
    pub qos: Option<QosControl>,
}

impl Header {
    pub fn new(kind: FrameType, addr1: MacAddr, addr2: MacAddr) -> Self {
        let qos = match kind {
            FrameType::QosData => Some(QosControl {
                tid: 0,
                ack_policy: AckPolicy::Normal,
            }),
            _ => None,
        };
        Self {
            kind,
            flags: FcFlags::empty(),
            duration: 0,
            addr1,
            addr2,
            addr3: MacAddr::default(),
            seq_ctrl: 0,
            qos,
        }
    }

    /// Encoded header length in bytes
    pub fn len(&self) -> usize {
        match self.kind {
            FrameType::Ack | FrameType::Cts => 10,
            FrameType::Rts => 16,
            FrameType::QosData => 26,
            _ => 24,
        }
    }

    pub fn is_retry(&self) -> bool {
        self.flags.contains(FcFlags::RETRY)
    }

    pub fn set_retry(&mut self, retry: bool) {
        self.flags.set(FcFlags::RETRY, retry);
    }

    pub fn more_fragments(&self) -> bool {
        self.flags.contains(FcFlags::MORE_FRAGMENTS)
    }

    pub fn set_more_fragments(&mut self, more: bool) {
        self.flags.set(FcFlags::MORE_FRAGMENTS, more);
    }

    pub fn sequence_number(&self) -> u16 {
        self.seq_ctrl >> 4
    }

    pub fn set_sequence_number(&mut self, seq: u16) {
        self.seq_ctrl = ((seq % SEQ_MODULO) << 4) | (self.seq_ctrl & 0x0f);
    }

    pub fn fragment_number(&self) -> u8 {
        (self.seq_ctrl & 0x0f) as u8
    }

    pub fn set_fragment_number(&mut self, frag: u8) {
        self.seq_ctrl = (self.seq_ctrl & !0x0f) | (frag & 0x0f) as u16;
    }

    /// Fragments are any MPDU with a non-zero fragment number or more fragments pending
    pub fn is_fragment(&self) -> bool {
        self.fragment_number() > 0 || self.more_fragments()
    }

    pub fn tid(&self) -> Option<u8> {
        self.qos.map(|q| q.tid)
    }

    /// Whether the receiver is expected to respond with an ACK
    pub fn expects_ack(&self) -> bool {
        if self.addr1.is_group() || self.kind.is_ctl() {
            return false;
        }
        match self.qos {
            Some(q) => q.ack_policy == AckPolicy::Normal,
            None => true,
        }
    }

    /// Encode the header into the provided buffer, returning the encoded length
    pub fn encode(&self, buff: &mut [u8]) -> Result<usize, DecodeError> {
        let len = self.len();
        if buff.len() < len {
            return Err(DecodeError::NotEnoughBytes);
        }

        let (ty, subtype) = self.kind.bits();
        buff[0] = (subtype << 4) | (ty << 2);
        buff[1] = self.flags.bits();
        LittleEndian::write_u16(&mut buff[2..4], self.duration);
        buff[4..10].copy_from_slice(&self.addr1.0);

        match self.kind {
            FrameType::Ack | FrameType::Cts => (),
            FrameType::Rts => buff[10..16].copy_from_slice(&self.addr2.0),
            _ => {
                buff[10..16].copy_from_slice(&self.addr2.0);
                buff[16..22].copy_from_slice(&self.addr3.0);
                LittleEndian::write_u16(&mut buff[22..24], self.seq_ctrl);
            }
        }

        if let (FrameType::QosData, Some(q)) = (self.kind, self.qos) {
            LittleEndian::write_u16(&mut buff[24..26], q.encode());
        }

        Ok(len)
    }

    /// Decode a header from the provided buffer, returning the header and its length
    pub fn decode(buff: &[u8]) -> Result<(Self, usize), DecodeError> {
        if buff.len() < 10 {
            return Err(DecodeError::NotEnoughBytes);
        }

        let version = buff[0] & 0b11;
        if version != 0 {
            return Err(DecodeError::InvalidVersion(version));
        }

        let kind = FrameType::from_bits((buff[0] >> 2) & 0b11, buff[0] >> 4)?;
        let flags = FcFlags::from_bits_truncate(buff[1]);

        if flags.contains(FcFlags::TO_DS | FcFlags::FROM_DS) {
            return Err(DecodeError::FourAddress);
        }

        let mut h = Header::new(kind, MacAddr::default(), MacAddr::default());
        h.flags = flags;

        if buff.len() < h.len() {
            return Err(DecodeError::NotEnoughBytes);
        }

        h.duration = LittleEndian::read_u16(&buff[2..4]);
        h.addr1.0.copy_from_slice(&buff[4..10]);

        match kind {
            FrameType::Ack | FrameType::Cts => (),
            FrameType::Rts => h.addr2.0.copy_from_slice(&buff[10..16]),
            _ => {
                h.addr2.0.copy_from_slice(&buff[10..16]);
                h.addr3.0.copy_from_slice(&buff[16..22]);
                h.seq_ctrl = LittleEndian::read_u16(&buff[22..24]);
            }
        }

        if kind == FrameType::QosData {
            h.qos = Some(QosControl::decode(LittleEndian::read_u16(&buff[24..26])));
        }

        Ok((h, h.len()))
    }
}

/// MAC frame (MPDU) with owned payload
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub header: Header,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Request to send from `ta` to `ra`
    pub fn rts(ra: MacAddr, ta: MacAddr, duration: u16) -> Self {
        let mut header = Header::new(FrameType::Rts, ra, ta);
        header.duration = duration;
        Self::new(header, Bytes::new())
    }

    /// Clear to send addressed to `ra`
    pub fn cts(ra: MacAddr, duration: u16) -> Self {
        let mut header = Header::new(FrameType::Cts, ra, MacAddr::default());
        header.duration = duration;
        Self::new(header, Bytes::new())
    }

    /// Acknowledgement addressed to `ra`
    pub fn ack(ra: MacAddr, duration: u16) -> Self {
        let mut header = Header::new(FrameType::Ack, ra, MacAddr::default());
        header.duration = duration;
        Self::new(header, Bytes::new())
    }

    /// PSDU size on air (header, body and FCS)
    pub fn size(&self) -> usize {
        self.header.len() + self.payload.len() + FCS_LEN
    }

    /// Encode header and body (without FCS) into the provided buffer
    pub fn encode(&self, buff: &mut [u8]) -> Result<usize, DecodeError> {
        let n = self.header.encode(buff)?;
        let end = n + self.payload.len();
        if buff.len() < end {
            return Err(DecodeError::NotEnoughBytes);
        }
        buff[n..end].copy_from_slice(&self.payload);
        Ok(end)
    }

    /// Decode a frame (without FCS) from the provided buffer
    pub fn decode(buff: &[u8]) -> Result<Self, DecodeError> {
        let (header, n) = Header::decode(buff)?;

        // Control frames carry no body
        let payload = match header.kind.is_ctl() {
            true => Bytes::new(),
            false => Bytes::copy_from_slice(&buff[n..]),
        };

        Ok(Self { header, payload })
    }
}
