//! One VT client's working set as managed by the server
//!
//! The bus thread feeds raw IOP bytes in as the ETP session delivers them; a worker thread parses
//! the accumulated blob into [VtObject]s; the VT server observes the result and the failure
//! state from wherever it runs. Cross-thread accessors use atomics where a single word suffices
//! and one mutex for everything structured.

use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::can::CfHandle;
use crate::dispatch::CallbackHandle;
use crate::vt::objects::parse_iop_into_objects;
use crate::vt::{VtObject, NULL_OBJECT_ID};

/// Lifecycle of the object pool parsing worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectPoolProcessingState {
    /// No worker has been started
    None,
    /// The worker is parsing
    Running,
    /// The worker finished and the object list is populated
    Success,
    /// The worker hit a malformed pool; the object list is empty
    Fail,
    /// The worker has been joined and will never touch the object list again
    Joined,
}

/// Everything structured lives under one mutex; the worker and any observer thread take it in
/// short critical sections
struct Shared {
    iop_raw_chunks: Vec<Vec<u8>>,
    iop_size: u32,
    object_list: Vec<VtObject>,
    processing_state: ObjectPoolProcessingState,
    callback_handles: Vec<CallbackHandle>,
    was_loaded_from_non_volatile_memory: bool,
    deletion_requested: bool,
    failed_object_pool_size: u32,
    retry_count: u8,
}

/// A single client's object pool ingestion state on the VT server
pub struct ManagedWorkingSet {
    associated_control_function: Option<CfHandle>,
    shared: Arc<Mutex<Shared>>,
    transferred_iop_size: AtomicU32,
    working_set_maintenance_timestamp_ms: AtomicU32,
    auxiliary_input_maintenance_timestamp_ms: AtomicU32,
    focused_object: AtomicU16,
    parsing_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ManagedWorkingSet {
    /// Whole-transfer restart budget; independent of the ETP session's transient retry budget
    pub const MAX_RETRY_COUNT: u8 = 5;

    /// A working set not (yet) bound to a client control function
    pub fn new() -> Self {
        Self::with_control_function(None)
    }

    pub fn with_control_function(control_function: Option<CfHandle>) -> Self {
        Self {
            associated_control_function: control_function,
            shared: Arc::new(Mutex::new(Shared {
                iop_raw_chunks: Vec::new(),
                iop_size: 0,
                object_list: Vec::new(),
                processing_state: ObjectPoolProcessingState::None,
                callback_handles: Vec::new(),
                was_loaded_from_non_volatile_memory: false,
                deletion_requested: false,
                failed_object_pool_size: 0,
                retry_count: 0,
            })),
            transferred_iop_size: AtomicU32::new(0),
            working_set_maintenance_timestamp_ms: AtomicU32::new(0),
            auxiliary_input_maintenance_timestamp_ms: AtomicU32::new(0),
            focused_object: AtomicU16::new(NULL_OBJECT_ID),
            parsing_thread: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn get_control_function(&self) -> Option<CfHandle> {
        self.associated_control_function
    }

    // --------------------------------------------------------------------------------------
    // IOP accumulation

    /// Append one chunk of raw IOP data as delivered by the transport
    ///
    /// Chunk ordering is the caller's responsibility.
    pub fn add_iop_raw_data(&self, data: Vec<u8>) {
        let len = data.len() as u32;
        self.shared.lock().unwrap().iop_raw_chunks.push(data);
        self.transferred_iop_size.fetch_add(len, Ordering::Relaxed);
    }

    /// Whether any IOP data has been added to this working set
    #[must_use]
    pub fn get_any_object_pools(&self) -> bool {
        !self.shared.lock().unwrap().iop_raw_chunks.is_empty()
    }

    /// The declared total pool size from the client's object pool transfer announcement
    pub fn set_iop_size(&self, size: u32) {
        self.shared.lock().unwrap().iop_size = size;
    }

    #[must_use]
    pub fn get_iop_size(&self) -> u32 {
        self.shared.lock().unwrap().iop_size
    }

    /// Bytes received so far; monotonically non-decreasing within one transfer
    #[must_use]
    pub fn get_transferred_iop_size(&self) -> u32 {
        self.transferred_iop_size.load(Ordering::Relaxed)
    }

    /// Percentage of the declared pool that has arrived
    #[must_use]
    pub fn iop_load_percentage(&self) -> f32 {
        let declared = self.get_iop_size();
        if declared == 0 {
            return 0.0;
        }
        self.get_transferred_iop_size() as f32 / declared as f32 * 100.0
    }

    #[must_use]
    pub fn is_object_pool_transfer_in_progress(&self) -> bool {
        let transferred = self.get_transferred_iop_size();
        transferred > 0 && transferred < self.get_iop_size()
    }

    /// Throw away transfer state ahead of a restart, keeping the failure tracking
    ///
    /// Joins any live worker first so nothing races the reset.
    pub fn reset_transfer(&self) {
        self.join_parsing_thread();
        let mut shared = self.shared.lock().unwrap();
        shared.iop_raw_chunks.clear();
        shared.object_list.clear();
        shared.processing_state = ObjectPoolProcessingState::None;
        self.transferred_iop_size.store(0, Ordering::Relaxed);
    }

    // --------------------------------------------------------------------------------------
    // Parsing worker

    /// Launch the worker that parses the accumulated chunks into objects
    ///
    /// No-op if a worker is already running un-joined.
    pub fn start_parsing_thread(&self) {
        let mut thread_slot = self.parsing_thread.lock().unwrap();
        if thread_slot.is_some() {
            return;
        }
        self.shared.lock().unwrap().processing_state = ObjectPoolProcessingState::Running;

        let shared = Arc::clone(&self.shared);
        *thread_slot = Some(std::thread::spawn(move || {
            let combined: Vec<u8> = {
                let shared = shared.lock().unwrap();
                shared.iop_raw_chunks.concat()
            };
            match parse_iop_into_objects(&combined) {
                Ok(objects) => {
                    let mut shared = shared.lock().unwrap();
                    shared.object_list = objects;
                    shared.processing_state = ObjectPoolProcessingState::Success;
                }
                Err(e) => {
                    tracing::warn!("Object pool parsing failed: {e:#}");
                    let mut shared = shared.lock().unwrap();
                    shared.object_list.clear();
                    shared.processing_state = ObjectPoolProcessingState::Fail;
                }
            }
        }));
    }

    /// Join the worker if one exists; idempotent
    ///
    /// After this returns the processing state is `Joined` (if a worker ever ran) and nothing
    /// will touch the object list but the callers themselves.
    pub fn join_parsing_thread(&self) {
        let handle = self.parsing_thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!("Object pool parsing worker panicked");
            }
            self.shared.lock().unwrap().processing_state = ObjectPoolProcessingState::Joined;
        }
    }

    #[must_use]
    pub fn get_object_pool_processing_state(&self) -> ObjectPoolProcessingState {
        self.shared.lock().unwrap().processing_state
    }

    // --------------------------------------------------------------------------------------
    // Parsed object access

    #[must_use]
    pub fn get_object_list(&self) -> Vec<VtObject> {
        self.shared.lock().unwrap().object_list.clone()
    }

    #[must_use]
    pub fn get_number_objects(&self) -> usize {
        self.shared.lock().unwrap().object_list.len()
    }

    #[must_use]
    pub fn get_object_by_id(&self, object_id: u16) -> Option<VtObject> {
        self.shared
            .lock()
            .unwrap()
            .object_list
            .iter()
            .find(|object| object.id() == object_id)
            .cloned()
    }

    /// Add an object directly, e.g. one restored from non-volatile memory
    ///
    /// Refused if the ID is already taken.
    pub fn add_object(&self, object: VtObject) -> bool {
        let mut shared = self.shared.lock().unwrap();
        if shared.object_list.iter().any(|o| o.id() == object.id()) {
            return false;
        }
        shared.object_list.push(object);
        true
    }

    pub fn remove_object(&self, object_id: u16) -> bool {
        let mut shared = self.shared.lock().unwrap();
        let before = shared.object_list.len();
        shared.object_list.retain(|object| object.id() != object_id);
        shared.object_list.len() != before
    }

    /// Focus `object_id`, which must exist in the pool or be [NULL_OBJECT_ID]
    ///
    /// Returns false (and changes nothing) otherwise.
    pub fn set_object_focus(&self, object_id: u16) -> bool {
        if object_id != NULL_OBJECT_ID && self.get_object_by_id(object_id).is_none() {
            tracing::warn!("Refusing focus on unknown object {object_id:#06X}");
            return false;
        }
        self.focused_object.store(object_id, Ordering::Relaxed);
        true
    }

    #[must_use]
    pub fn get_object_focus(&self) -> u16 {
        self.focused_object.load(Ordering::Relaxed)
    }

    // --------------------------------------------------------------------------------------
    // Failure tracking for transfer restart

    /// Record a failed pool transfer so a reconnecting client can restart it
    ///
    /// Pair with [clear_failed_object_pool_transfer](Self::clear_failed_object_pool_transfer)
    /// once a restart succeeds.
    pub fn track_failed_object_pool_transfer(&self, data_size: u32) {
        let mut shared = self.shared.lock().unwrap();
        shared.failed_object_pool_size = data_size;
    }

    #[must_use]
    pub fn has_failed_object_pool_transfer(&self) -> bool {
        self.shared.lock().unwrap().failed_object_pool_size > 0
    }

    #[must_use]
    pub fn get_failed_object_pool_size(&self) -> u32 {
        self.shared.lock().unwrap().failed_object_pool_size
    }

    /// Forget the failed transfer: size and retry count reset together
    pub fn clear_failed_object_pool_transfer(&self) {
        let mut shared = self.shared.lock().unwrap();
        shared.failed_object_pool_size = 0;
        shared.retry_count = 0;
    }

    /// Count one restart attempt, saturating at [MAX_RETRY_COUNT](Self::MAX_RETRY_COUNT)
    pub fn increment_retry_count(&self) {
        let mut shared = self.shared.lock().unwrap();
        if shared.retry_count < Self::MAX_RETRY_COUNT {
            shared.retry_count += 1;
        }
    }

    #[must_use]
    pub fn get_retry_count(&self) -> u8 {
        self.shared.lock().unwrap().retry_count
    }

    pub fn reset_retry_count(&self) {
        self.shared.lock().unwrap().retry_count = 0;
    }

    // --------------------------------------------------------------------------------------
    // Server bookkeeping

    /// Cooperative teardown flag; the server observes it on its next tick
    pub fn request_deletion(&self) {
        self.shared.lock().unwrap().deletion_requested = true;
    }

    #[must_use]
    pub fn is_deletion_requested(&self) -> bool {
        self.shared.lock().unwrap().deletion_requested
    }

    #[must_use]
    pub fn get_was_object_pool_loaded_from_non_volatile_memory(&self) -> bool {
        self.shared.lock().unwrap().was_loaded_from_non_volatile_memory
    }

    pub fn set_was_object_pool_loaded_from_non_volatile_memory(&self, value: bool) {
        self.shared.lock().unwrap().was_loaded_from_non_volatile_memory = value;
    }

    /// Park a dispatcher registration here so a transfer restart keeps it alive
    pub fn save_callback_handle(&self, handle: CallbackHandle) {
        self.shared.lock().unwrap().callback_handles.push(handle);
    }

    /// Drop every saved registration; the owner unregisters them from the dispatcher
    pub fn clear_callback_handles(&self) -> Vec<CallbackHandle> {
        std::mem::take(&mut self.shared.lock().unwrap().callback_handles)
    }

    pub fn set_working_set_maintenance_message_timestamp_ms(&self, value: u32) {
        self.working_set_maintenance_timestamp_ms
            .store(value, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get_working_set_maintenance_message_timestamp_ms(&self) -> u32 {
        self.working_set_maintenance_timestamp_ms.load(Ordering::Relaxed)
    }

    pub fn set_auxiliary_input_maintenance_timestamp_ms(&self, value: u32) {
        self.auxiliary_input_maintenance_timestamp_ms
            .store(value, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get_auxiliary_input_maintenance_timestamp_ms(&self) -> u32 {
        self.auxiliary_input_maintenance_timestamp_ms.load(Ordering::Relaxed)
    }
}

impl Default for ManagedWorkingSet {
    fn default() -> Self {
        Self::new()
    }
}

/// The worker must never outlive the working set
impl Drop for ManagedWorkingSet {
    fn drop(&mut self) {
        self.join_parsing_thread();
    }
}
