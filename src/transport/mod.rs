//! ISO 11783-3 Extended Transport Protocol
//!
//! Transport Protocol is specified in ISO 11783-3:5.10, and Extended Transport Protocol in ISO
//! 11783-3:5.11. The maximum TP message size is 255 packets of 7 bytes/packet, giving a total of
//! 1,785 bytes. ETP picks up where TP leaves off: point-to-point only, 1,786 bytes up to
//! 2^24-1 packets of 7 bytes/packet, giving a total of 117,440,505 bytes.
//!
//! ETP uses two PGNs:
//!
//! 1. `0xC700` - Extended Data Transfer (ETP.DT)
//! 2. `0xC800` - Extended Connection Management (ETP.CM)
//!
//!    The first byte of an ETP.CM message (the Control Byte) selects the message kind:
//!
//!    1. `0x14` - Request To Send (ETP.CM_RTS)
//!    2. `0x15` - Clear To Send (ETP.CM_CTS)
//!    3. `0x16` - Data Packet Offset (ETP.CM_DPO)
//!    4. `0x17` - End of Message Acknowledgement (ETP.CM_EOMA)
//!    5. `0xFF` - Connection Abort (ETP.Conn_Abort)
//!
//! Every transfer is one session between two control functions: RTS, then repeated
//! CTS/DPO/data-burst rounds under receiver flow control, then EOMA. Either side may abort at any
//! time with a reason code. Timeouts in the wait states are recovered by a bounded number of
//! retries before the session aborts.

mod manager;
mod session;
mod wire;

pub use manager::{EtpConfig, EtpSessionManager, FrameSink, SessionEvent, SessionOutcome};
pub use session::{Direction, EtpSession, StateMachineState};
pub use wire::{AbortReason, ControlMessage};

/// Extended Connection Management PGN (ETP.CM)
pub const ETP_CONNECTION_MANAGEMENT_PGN: u32 = 0xC800;

/// Extended Data Transfer PGN (ETP.DT)
pub const ETP_DATA_TRANSFER_PGN: u32 = 0xC700;

/// ETP carries anything too big for TP, whose ceiling is 255 packets * 7 bytes
pub const MIN_TRANSFER_SIZE: u32 = 1786;

/// 2^24 - 1 packets of 7 bytes each
pub const MAX_TRANSFER_SIZE: u32 = 117_440_505;

/// Data bytes per ETP.DT frame (the eighth byte is the sequence number)
pub const PACKET_PAYLOAD_SIZE: u32 = 7;

/// Sequence numbers per data packet offset window
pub const PACKETS_PER_DPO_WINDOW: u32 = 255;

/// Transport messages go out at the lowest priority
pub const ETP_PRIORITY: u8 = 7;

/// T1: maximum gap between consecutive data frames within a burst
pub const T1_DATA_GAP_TIMEOUT_MS: u32 = 750;

/// T3: maximum wait for the peer's next control message (CTS, DPO, EOMA)
pub const T3_CONTROL_TIMEOUT_MS: u32 = 1250;
