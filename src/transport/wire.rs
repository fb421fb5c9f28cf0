//! Byte-level encoding of the ETP control and data frames
//!
//! All ETP.CM frames are 8 bytes with the PGN being transported packed little-endian into bytes
//! 5..=7:
//!
//! | Message | Byte 0 | Bytes 1..=4                | Bytes 5..=7 |
//! |---------|--------|----------------------------|-------------|
//! | RTS     | `0x14` | total size (u32 LE)        | PGN (LE)    |
//! | CTS     | `0x15` | packets, next packet (24b) | PGN (LE)    |
//! | DPO     | `0x16` | packets, offset (24b)      | PGN (LE)    |
//! | EOMA    | `0x17` | total size (u32 LE)        | PGN (LE)    |
//! | Abort   | `0xFF` | reason, `FF FF FF`         | PGN (LE)    |
//!
//! ETP.DT frames carry the burst-local sequence number in byte 0 and seven payload bytes after
//! it, padded with `0xFF` past the end of the message.

use crate::transport::{MAX_TRANSFER_SIZE, PACKET_PAYLOAD_SIZE};

const CONTROL_BYTE_RTS: u8 = 0x14;
const CONTROL_BYTE_CTS: u8 = 0x15;
const CONTROL_BYTE_DPO: u8 = 0x16;
const CONTROL_BYTE_EOMA: u8 = 0x17;
const CONTROL_BYTE_ABORT: u8 = 0xFF;

/// Why a session was torn down, as carried in ETP.Conn_Abort byte 1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Node is already engaged in a session for this PGN
    AlreadyInSession = 1,
    /// Not enough system resources to accept the transfer
    SystemResources = 2,
    /// A timeout expired with no retries left
    Timeout = 3,
    /// CTS received while data transfer was in progress
    ClearToSendWhileSending = 4,
    /// Too many retransmit requests
    MaxRetransmitLimit = 5,
    /// DPO didn't match the expected offset
    UnexpectedDataPacketOffset = 6,
    /// Data frame sequence number out of order
    BadSequenceNumber = 7,
    /// Data frame sequence number repeated
    DuplicateSequenceNumber = 8,
    /// Announced size exceeds what ETP can carry
    TotalSizeTooBig = 9,
    /// Catch-all for everything else
    AnyOtherError = 250,
}

impl From<u8> for AbortReason {
    fn from(value: u8) -> Self {
        match value {
            1 => AbortReason::AlreadyInSession,
            2 => AbortReason::SystemResources,
            3 => AbortReason::Timeout,
            4 => AbortReason::ClearToSendWhileSending,
            5 => AbortReason::MaxRetransmitLimit,
            6 => AbortReason::UnexpectedDataPacketOffset,
            7 => AbortReason::BadSequenceNumber,
            8 => AbortReason::DuplicateSequenceNumber,
            9 => AbortReason::TotalSizeTooBig,
            _ => AbortReason::AnyOtherError,
        }
    }
}

/// A decoded ETP.CM frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    RequestToSend {
        total_size: u32,
        pgn: u32,
    },
    ClearToSend {
        /// How many packets the receiver will accept in the next burst; 0 holds the sender
        num_packets: u8,
        /// 1-based number of the next packet the receiver expects
        next_packet: u32,
        pgn: u32,
    },
    DataPacketOffset {
        /// How many packets the following burst actually contains
        num_packets: u8,
        /// Offset in 255-packet windows; packet identity is `offset * 255 + sequence`
        offset: u32,
        pgn: u32,
    },
    EndOfMessageAcknowledge {
        total_size: u32,
        pgn: u32,
    },
    Abort {
        reason: AbortReason,
        pgn: u32,
    },
}

fn pack_pgn(buf: &mut [u8; 8], pgn: u32) {
    buf[5] = (pgn & 0xFF) as u8;
    buf[6] = ((pgn >> 8) & 0xFF) as u8;
    buf[7] = ((pgn >> 16) & 0xFF) as u8;
}

fn unpack_pgn(data: &[u8]) -> u32 {
    (data[5] as u32) | ((data[6] as u32) << 8) | ((data[7] as u32) << 16)
}

fn pack_u24(buf: &mut [u8; 8], at: usize, value: u32) {
    buf[at] = (value & 0xFF) as u8;
    buf[at + 1] = ((value >> 8) & 0xFF) as u8;
    buf[at + 2] = ((value >> 16) & 0xFF) as u8;
}

fn unpack_u24(data: &[u8], at: usize) -> u32 {
    (data[at] as u32) | ((data[at + 1] as u32) << 8) | ((data[at + 2] as u32) << 16)
}

impl ControlMessage {
    /// The PGN of the payload being transported, common to every ETP.CM variant
    #[must_use]
    pub fn pgn(&self) -> u32 {
        match *self {
            ControlMessage::RequestToSend { pgn, .. }
            | ControlMessage::ClearToSend { pgn, .. }
            | ControlMessage::DataPacketOffset { pgn, .. }
            | ControlMessage::EndOfMessageAcknowledge { pgn, .. }
            | ControlMessage::Abort { pgn, .. } => pgn,
        }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; 8] {
        let mut buf = [0xFF; 8];
        match *self {
            ControlMessage::RequestToSend { total_size, pgn } => {
                buf[0] = CONTROL_BYTE_RTS;
                buf[1..5].copy_from_slice(&total_size.to_le_bytes());
                pack_pgn(&mut buf, pgn);
            }
            ControlMessage::ClearToSend {
                num_packets,
                next_packet,
                pgn,
            } => {
                buf[0] = CONTROL_BYTE_CTS;
                buf[1] = num_packets;
                pack_u24(&mut buf, 2, next_packet);
                pack_pgn(&mut buf, pgn);
            }
            ControlMessage::DataPacketOffset {
                num_packets,
                offset,
                pgn,
            } => {
                buf[0] = CONTROL_BYTE_DPO;
                buf[1] = num_packets;
                pack_u24(&mut buf, 2, offset);
                pack_pgn(&mut buf, pgn);
            }
            ControlMessage::EndOfMessageAcknowledge { total_size, pgn } => {
                buf[0] = CONTROL_BYTE_EOMA;
                buf[1..5].copy_from_slice(&total_size.to_le_bytes());
                pack_pgn(&mut buf, pgn);
            }
            ControlMessage::Abort { reason, pgn } => {
                buf[0] = CONTROL_BYTE_ABORT;
                buf[1] = reason as u8;
                pack_pgn(&mut buf, pgn);
            }
        }
        buf
    }

    pub fn decode(data: &[u8]) -> eyre::Result<ControlMessage> {
        if data.len() != 8 {
            eyre::bail!("ETP.CM frames are 8 bytes, got {}", data.len());
        }
        let pgn = unpack_pgn(data);
        match data[0] {
            CONTROL_BYTE_RTS => {
                let total_size = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
                Ok(ControlMessage::RequestToSend { total_size, pgn })
            }
            CONTROL_BYTE_CTS => Ok(ControlMessage::ClearToSend {
                num_packets: data[1],
                next_packet: unpack_u24(data, 2),
                pgn,
            }),
            CONTROL_BYTE_DPO => Ok(ControlMessage::DataPacketOffset {
                num_packets: data[1],
                offset: unpack_u24(data, 2),
                pgn,
            }),
            CONTROL_BYTE_EOMA => {
                let total_size = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
                Ok(ControlMessage::EndOfMessageAcknowledge { total_size, pgn })
            }
            CONTROL_BYTE_ABORT => Ok(ControlMessage::Abort {
                reason: data[1].into(),
                pgn,
            }),
            control => eyre::bail!("Unknown ETP.CM control byte {control:#04X}"),
        }
    }
}

/// Encode one ETP.DT frame: burst-local sequence number plus up to 7 payload bytes
#[must_use]
pub(crate) fn encode_data_frame(sequence: u8, payload: &[u8]) -> [u8; 8] {
    debug_assert!(payload.len() <= PACKET_PAYLOAD_SIZE as usize);
    let mut buf = [0xFF; 8];
    buf[0] = sequence;
    buf[1..1 + payload.len()].copy_from_slice(payload);
    buf
}

/// Split an ETP.DT frame into its sequence number and payload bytes
pub(crate) fn decode_data_frame(data: &[u8]) -> eyre::Result<(u8, &[u8])> {
    if data.len() != 8 {
        eyre::bail!("ETP.DT frames are 8 bytes, got {}", data.len());
    }
    let sequence = data[0];
    if sequence == 0 {
        eyre::bail!("ETP.DT sequence numbers are 1-based, got 0");
    }
    Ok((sequence, &data[1..]))
}

/// Sanity bound used when validating an announced transfer size
#[inline]
#[must_use]
pub(crate) fn size_fits_protocol(total_size: u32) -> bool {
    total_size <= MAX_TRANSFER_SIZE
}
