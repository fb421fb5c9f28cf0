//! The per-transfer state carried by the session manager

use crate::can::CfHandle;
use crate::transport::{PACKETS_PER_DPO_WINDOW, PACKET_PAYLOAD_SIZE};

/// Whether this end of the session is producing or consuming the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Transmit,
    Receive,
}

/// The states an ETP session can be in
///
/// `Send*` states have an outbound frame ready to go and advance when the write succeeds;
/// `WaitFor*` states are armed with a timeout and advance when the matching inbound frame
/// arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateMachineState {
    None,
    SendRequestToSend,
    WaitForClearToSend,
    SendClearToSend,
    WaitForDataPacketOffset,
    SendDataPacketOffset,
    SendDataTransferPackets,
    WaitForDataTransferPacket,
    WaitForEndOfMessageAcknowledge,
    SendEndOfMessageAcknowledge,
}

/// Default transient-timeout retry budget before a session aborts
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u8 = 3;

/// One in-flight extended transport session
///
/// Uniquely keyed by (source, destination, PGN) per direction. The payload buffer is owned
/// exclusively by the session and always holds exactly `total_size` bytes: the full message on
/// the transmit side, the partially filled reassembly buffer on the receive side.
pub struct EtpSession {
    pub(crate) direction: Direction,
    pub(crate) state: StateMachineState,
    /// The control function producing the payload
    pub(crate) source: CfHandle,
    /// The control function consuming the payload
    pub(crate) destination: CfHandle,
    /// PGN of the message being transported
    pub(crate) pgn: u32,
    pub(crate) payload: Vec<u8>,
    pub(crate) total_size: u32,
    /// Highest packet number confirmed by flow control (CTS on the transmit side, a completed
    /// burst on the receive side)
    pub(crate) last_acknowledged_packet: u32,
    /// Transmit: next packet number to put on the wire. Receive: next packet number expected
    pub(crate) next_packet: u32,
    /// Current offset in 255-packet windows
    pub(crate) data_packet_offset: u32,
    /// Size of the burst agreed by the current CTS/DPO exchange
    pub(crate) packets_in_burst: u8,
    /// Packets still outstanding within the current burst
    pub(crate) burst_packets_remaining: u8,
    /// Timestamp (ms) of the last state-relevant event, the base for timeout checks
    pub(crate) timestamp_ms: u32,

    retry_attempts: u8,
    max_retry_attempts: u8,
}

impl EtpSession {
    /// Create the sending half of a session; the payload buffer is handed over whole
    pub(crate) fn new_transmit(
        source: CfHandle,
        destination: CfHandle,
        pgn: u32,
        payload: Vec<u8>,
        now_ms: u32,
    ) -> Self {
        let total_size = payload.len() as u32;
        Self {
            direction: Direction::Transmit,
            state: StateMachineState::SendRequestToSend,
            source,
            destination,
            pgn,
            payload,
            total_size,
            last_acknowledged_packet: 0,
            next_packet: 1,
            data_packet_offset: 0,
            packets_in_burst: 0,
            burst_packets_remaining: 0,
            timestamp_ms: now_ms,
            retry_attempts: 0,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
        }
    }

    /// Create the receiving half of a session with a zeroed reassembly buffer
    pub(crate) fn new_receive(
        source: CfHandle,
        destination: CfHandle,
        pgn: u32,
        total_size: u32,
        now_ms: u32,
    ) -> Self {
        Self {
            direction: Direction::Receive,
            state: StateMachineState::SendClearToSend,
            source,
            destination,
            pgn,
            payload: vec![0; total_size as usize],
            total_size,
            last_acknowledged_packet: 0,
            next_packet: 1,
            data_packet_offset: 0,
            packets_in_burst: 0,
            burst_packets_remaining: 0,
            timestamp_ms: now_ms,
            retry_attempts: 0,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
        }
    }

    #[inline]
    #[must_use]
    pub fn get_state(&self) -> StateMachineState {
        self.state
    }

    /// Move to `state` and restart the timeout clock
    pub(crate) fn set_state(&mut self, state: StateMachineState, now_ms: u32) {
        tracing::trace!("ETP session state {:?} -> {state:?}", self.state);
        self.state = state;
        self.timestamp_ms = now_ms;
    }

    #[inline]
    #[must_use]
    pub fn get_direction(&self) -> Direction {
        self.direction
    }

    #[inline]
    #[must_use]
    pub fn get_total_size(&self) -> u32 {
        self.total_size
    }

    /// Number of 7-byte packets in the whole transfer
    #[inline]
    #[must_use]
    pub fn total_packets(&self) -> u32 {
        self.total_size.div_ceil(PACKET_PAYLOAD_SIZE)
    }

    /// The 255-packet window a given 1-based packet number falls into
    #[inline]
    #[must_use]
    pub(crate) fn window_of(packet: u32) -> u32 {
        (packet - 1) / PACKETS_PER_DPO_WINDOW
    }

    /// The burst-local sequence number of a given 1-based packet number
    #[inline]
    #[must_use]
    pub(crate) fn sequence_of(packet: u32) -> u8 {
        ((packet - 1) % PACKETS_PER_DPO_WINDOW + 1) as u8
    }

    /// Current retry attempt count
    #[inline]
    #[must_use]
    pub fn get_retry_attempts(&self) -> u8 {
        self.retry_attempts
    }

    #[inline]
    #[must_use]
    pub fn get_max_retry_attempts(&self) -> u8 {
        self.max_retry_attempts
    }

    /// Set a session-specific retry budget
    pub fn set_max_retry_attempts(&mut self, value: u8) {
        self.max_retry_attempts = value;
    }

    /// Reset the retry attempt counter to zero; any valid protocol progress does this
    pub fn reset_retry_attempts(&mut self) {
        self.retry_attempts = 0;
    }

    /// Increment the retry attempt counter, saturating at the budget
    pub fn increment_retry_attempts(&mut self) {
        if self.retry_attempts < self.max_retry_attempts {
            self.retry_attempts += 1;
        }
    }

    /// Whether the retry budget still has room for another attempt
    #[inline]
    #[must_use]
    pub(crate) fn can_retry(&self) -> bool {
        self.retry_attempts < self.max_retry_attempts
    }

    /// Fraction of the payload confirmed delivered, for progress reporting
    #[must_use]
    pub fn percent_complete(&self) -> f32 {
        if self.total_packets() == 0 {
            return 0.0;
        }
        self.last_acknowledged_packet as f32 / self.total_packets() as f32 * 100.0
    }
}
