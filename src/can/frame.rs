use serde::ser::SerializeStruct;

/// Bit layout of a 29-bit J1939 identifier, from the top down: 3 priority bits, the 18-bit PGN
/// (extended data page, data page, PDU format, PDU specific), and the 8-bit source address.
const PRIORITY_SHIFT: u32 = 26;
const PGN_SHIFT: u32 = 8;
const PGN_MASK: u32 = 0x3FFFF;
const PDU_FORMAT_SHIFT: u32 = 16;
const PDU_SPECIFIC_SHIFT: u32 = 8;

/// PDU formats below 0xF0 are PDU1: the PDU specific byte is a destination address. From 0xF0 up
/// they are PDU2 group extensions, part of the PGN itself, and the frame is implicitly global.
const PDU2_FORMAT_FLOOR: u32 = 0xF0;

/// A single 29-bit-identifier CAN frame as read from or written to the bus
///
/// [CanFrame]s are restricted to 8 data bytes. Reconstructed transport-layer payloads live in
/// [CanMessage]s instead.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CanFrame {
    /// Driver timestamp in microseconds
    pub timestamp_us: u32,
    /// Hardware channel index the frame was read from / should be written to
    pub channel: u8,
    /// The full 29-bit identifier (priority, PGN, and source address)
    pub identifier: u32,
    pub dlc: usize,
    /// ISOBUS traffic is all extended-frame; standard 11-bit frames get passed through untouched
    pub is_extended: bool,

    data: [u8; 8],
}

impl Default for CanFrame {
    fn default() -> Self {
        Self {
            timestamp_us: 0,
            channel: 0,
            identifier: 0,
            dlc: 0,
            is_extended: true,
            data: [0; 8],
        }
    }
}

/// [CanFrame]s are restricted to 8-bytes, [CanMessage]s are arbitrarily sized
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CanMessage {
    pub timestamp_us: u32,
    pub channel: u8,
    pub priority: u8,
    pub pgn: u32,
    pub src: u8,
    pub dst: u8,
    pub data: Vec<u8>,
}

impl From<CanFrame> for CanMessage {
    fn from(frame: CanFrame) -> CanMessage {
        CanMessage {
            priority: frame.priority(),
            pgn: frame.pgn(),
            src: frame.src(),
            dst: frame.dst(),
            timestamp_us: frame.timestamp_us,
            channel: frame.channel,
            data: frame.data().into(),
        }
    }
}

/// Compose a 29-bit identifier from its parts
///
/// A PDU1 `pgn` must have a zero low byte; `dst` is packed into it. A PDU2 `pgn` is already
/// complete, so `dst` is ignored.
#[inline]
#[must_use]
pub fn canid(priority: u8, pgn: u32, dst: u8, src: u8) -> u32 {
    let mut pgn_bits = pgn & PGN_MASK;
    if (pgn_bits >> PGN_SHIFT) & 0xFF < PDU2_FORMAT_FLOOR {
        pgn_bits |= dst as u32;
    }
    (((priority & 0x07) as u32) << PRIORITY_SHIFT) | (pgn_bits << PGN_SHIFT) | src as u32
}

impl CanFrame {
    pub fn new(timestamp_us: u32, channel: u8, identifier: u32, data: &[u8]) -> Self {
        debug_assert!(data.len() <= 8);
        let dlc = data.len().min(8);
        let mut buf = [0; 8];
        buf[..dlc].copy_from_slice(&data[..dlc]);
        Self {
            timestamp_us,
            channel,
            identifier,
            dlc,
            is_extended: true,
            data: buf,
        }
    }

    #[inline]
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data[..self.dlc]
    }

    /// The low byte of the identifier is always the sender's address
    #[inline]
    #[must_use]
    pub fn src(&self) -> u8 {
        self.identifier as u8
    }

    /// Destination address: the PDU specific byte for PDU1 frames, 0xFF (global) for PDU2
    #[inline]
    #[must_use]
    pub fn dst(&self) -> u8 {
        if self.is_point_to_point() {
            self.pdu_specific() as u8
        } else {
            0xFF
        }
    }

    #[inline]
    #[must_use]
    pub fn priority(&self) -> u8 {
        ((self.identifier >> PRIORITY_SHIFT) & 0x07) as u8
    }

    #[inline]
    #[must_use]
    pub fn is_point_to_point(&self) -> bool {
        self.pdu_format() < PDU2_FORMAT_FLOOR
    }

    #[inline]
    #[must_use]
    pub fn pdu_format(&self) -> u32 {
        (self.identifier >> PDU_FORMAT_SHIFT) & 0xFF
    }

    #[inline]
    #[must_use]
    pub fn pdu_specific(&self) -> u32 {
        (self.identifier >> PDU_SPECIFIC_SHIFT) & 0xFF
    }

    /// The 18-bit PGN, with the destination address masked back out of PDU1 identifiers
    #[inline]
    #[must_use]
    pub fn pgn(&self) -> u32 {
        let pgn = (self.identifier >> PGN_SHIFT) & PGN_MASK;
        if self.is_point_to_point() {
            pgn & !0xFF
        } else {
            pgn
        }
    }
}

impl serde::Serialize for CanFrame {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("CanFrame", 9)?;
        state.serialize_field("timestamp_us", &self.timestamp_us)?;
        state.serialize_field("channel", &self.channel)?;
        state.serialize_field("canid", &format!("{:#X}", self.identifier))?;
        state.serialize_field("dlc", &self.dlc)?;
        state.serialize_field("priority", &self.priority())?;
        state.serialize_field("src", &format!("{:#X}", self.src()))?;
        state.serialize_field("dst", &format!("{:#X}", self.dst()))?;
        state.serialize_field("pgn", &format!("{:#X}", self.pgn()))?;
        state.serialize_field("data", &hex::encode_upper(self.data()))?;
        state.end()
    }
}

impl serde::Serialize for CanMessage {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("CanMessage", 8)?;
        state.serialize_field("timestamp_us", &self.timestamp_us)?;
        state.serialize_field("channel", &self.channel)?;
        state.serialize_field("priority", &self.priority)?;
        state.serialize_field("src", &format!("{:#X}", self.src))?;
        state.serialize_field("dst", &format!("{:#X}", self.dst))?;
        state.serialize_field("pgn", &format!("{:#X}", self.pgn))?;
        state.serialize_field("size", &self.data.len())?;
        state.serialize_field("data", &hex::encode_upper(&self.data))?;
        state.end()
    }
}
