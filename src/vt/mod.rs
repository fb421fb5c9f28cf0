//! Virtual Terminal server pieces: the typed object pool and the per-client managed working set
//!
//! A VT client uploads its UI as an IOP (ISO Object Pool) blob, usually through an ETP session
//! since pools run well past the short-transport ceiling. The [ManagedWorkingSet] accumulates the
//! raw bytes, parses them into [VtObject]s on a worker thread, and keeps enough failure state to
//! restart a botched transfer.

mod objects;
mod working_set;

pub use objects::{parse_iop_into_objects, ChildRef, MacroRef, VtObject};
pub use working_set::{ManagedWorkingSet, ObjectPoolProcessingState};

/// Sentinel object ID meaning "no object"
pub const NULL_OBJECT_ID: u16 = 0xFFFF;

/// PGN of messages from the VT server to a client
pub const VT_TO_ECU_PGN: u32 = 0xE600;

/// PGN of messages from a client to the VT server, including object pool transfers
pub const ECU_TO_VT_PGN: u32 = 0xE700;
