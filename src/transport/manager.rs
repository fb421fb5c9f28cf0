//! The ETP session manager: owns every active session and advances them
//!
//! The manager is single-threaded by design: the bus thread feeds it inbound `0xC800`/`0xC700`
//! frames via [EtpSessionManager::process_frame] and drives time via
//! [EtpSessionManager::update], which callers must invoke at 10 Hz or better. Outbound frames go
//! through the [FrameSink] handed in at construction; a refused write is simply retried on the
//! next tick, since the protocol's own timeouts already bound how long that can go on.

use crate::can::{canid, CanFrame, CanMessage, CfHandle, ControlFunctionRegistry, Name};
use crate::dispatch::{CallbackHandle, EventDispatcher};
use crate::timing::timed_out;
use crate::transport::session::{Direction, EtpSession, StateMachineState};
use crate::transport::wire::{
    self, decode_data_frame, encode_data_frame, AbortReason, ControlMessage,
};
use crate::transport::{
    ETP_CONNECTION_MANAGEMENT_PGN, ETP_DATA_TRANSFER_PGN, ETP_PRIORITY, MAX_TRANSFER_SIZE,
    MIN_TRANSFER_SIZE, PACKETS_PER_DPO_WINDOW, PACKET_PAYLOAD_SIZE, T1_DATA_GAP_TIMEOUT_MS,
    T3_CONTROL_TIMEOUT_MS,
};

/// Destination for outbound frames; returns false if the frame could not be queued
pub type FrameSink = Box<dyn FnMut(&CanFrame) -> bool + Send>;

/// Tunables for the session manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EtpConfig {
    /// Packets to request per CTS; clamped to the current 255-packet DPO window
    pub packets_per_cts: u8,
    /// Transient-timeout retry budget handed to every new session
    pub max_retry_attempts: u8,
    /// Largest transfer this node will allocate a buffer for; anything bigger gets refused with
    /// abort reason 2 even though the protocol itself could carry it
    pub max_transfer_size: u32,
}

impl Default for EtpConfig {
    fn default() -> Self {
        Self {
            packets_per_cts: 0xFF,
            max_retry_attempts: 3,
            max_transfer_size: MAX_TRANSFER_SIZE,
        }
    }
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    /// This node gave up and sent the ETP.Conn_Abort
    Aborted(AbortReason),
    /// The peer sent the ETP.Conn_Abort
    AbortedByPeer(AbortReason),
}

/// Emitted whenever a session leaves the manager, successfully or not
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEvent {
    pub direction: Direction,
    pub pgn: u32,
    /// Address of the control function producing the payload
    pub source: u8,
    /// Address of the control function consuming the payload
    pub destination: u8,
    pub total_size: u32,
    pub outcome: SessionOutcome,
}

/// What one servicing pass over a session accomplished
enum Service {
    /// The session moved forward and may be able to move again this tick
    Advanced,
    /// Nothing to do until a frame arrives or a timeout fires
    Idle,
    /// The session was torn down
    Removed,
}

pub struct EtpSessionManager {
    config: EtpConfig,
    channel: u8,
    sessions: Vec<EtpSession>,
    frame_sink: FrameSink,
    messages: EventDispatcher<CanMessage>,
    session_events: EventDispatcher<SessionEvent>,
}

impl EtpSessionManager {
    pub fn new(config: EtpConfig, channel: u8, frame_sink: FrameSink) -> Self {
        Self {
            config,
            channel,
            sessions: Vec::new(),
            frame_sink,
            messages: EventDispatcher::new(),
            session_events: EventDispatcher::new(),
        }
    }

    /// Listen for payloads assembled by completed receive sessions
    pub fn add_message_listener<F: FnMut(&CanMessage) + Send + 'static>(
        &mut self,
        listener: F,
    ) -> CallbackHandle {
        self.messages.add_listener(listener)
    }

    pub fn remove_message_listener(&mut self, handle: CallbackHandle) {
        self.messages.remove_listener(handle);
    }

    /// Listen for session terminations, successful or not
    pub fn add_session_event_listener<F: FnMut(&SessionEvent) + Send + 'static>(
        &mut self,
        listener: F,
    ) -> CallbackHandle {
        self.session_events.add_listener(listener)
    }

    pub fn remove_session_event_listener(&mut self, handle: CallbackHandle) {
        self.session_events.remove_listener(handle);
    }

    /// The sessions currently owned by the manager
    #[must_use]
    pub fn sessions(&self) -> &[EtpSession] {
        &self.sessions
    }

    /// Start a transmit session carrying `payload` to `destination`
    ///
    /// The transfer begins on the next [update] tick with an RTS. Refuses payloads outside the
    /// ETP size range, payloads over the configured cap, and a second session to a peer that is
    /// already in one.
    pub fn send(
        &mut self,
        registry: &ControlFunctionRegistry,
        source: CfHandle,
        destination: CfHandle,
        pgn: u32,
        payload: Vec<u8>,
        now_ms: u32,
    ) -> eyre::Result<()> {
        let total_size = u32::try_from(payload.len())
            .map_err(|_| eyre::eyre!("Payload of {} bytes cannot fit in ETP", payload.len()))?;
        if total_size < MIN_TRANSFER_SIZE {
            eyre::bail!(
                "Payload of {total_size} bytes belongs to the short-packet transport, not ETP"
            );
        }
        if !wire::size_fits_protocol(total_size) {
            eyre::bail!("Payload of {total_size} bytes exceeds the ETP maximum");
        }
        if total_size > self.config.max_transfer_size {
            eyre::bail!(
                "Payload of {total_size} bytes exceeds the configured cap of {}",
                self.config.max_transfer_size
            );
        }
        let Some(source_cf) = registry.get(source) else {
            eyre::bail!("Source control function is no longer registered");
        };
        if !source_cf.is_internal() {
            eyre::bail!("Transfers can only originate from an internal control function");
        }
        if registry.get(destination).is_none() {
            eyre::bail!("Destination control function is no longer registered");
        }
        if self
            .find_session(Direction::Transmit, source, destination, None)
            .is_some()
        {
            eyre::bail!("Already in a transmit session with this control function");
        }

        let mut session = EtpSession::new_transmit(source, destination, pgn, payload, now_ms);
        session.set_max_retry_attempts(self.config.max_retry_attempts);
        tracing::debug!(
            "Start ETP tx session. pgn: {pgn:#X} size: {total_size} packets: {}",
            session.total_packets()
        );
        self.sessions.push(session);
        Ok(())
    }

    /// Feed one inbound frame to the manager
    ///
    /// Frames that are not ETP.CM / ETP.DT, or that are not addressed to an internal control
    /// function, are ignored.
    pub fn process_frame(
        &mut self,
        registry: &mut ControlFunctionRegistry,
        frame: &CanFrame,
        now_ms: u32,
    ) {
        match frame.pgn() {
            ETP_CONNECTION_MANAGEMENT_PGN => self.process_control_frame(registry, frame, now_ms),
            ETP_DATA_TRANSFER_PGN => self.process_data_frame(registry, frame, now_ms),
            _ => {}
        }
    }

    /// Advance every session: evaluate timeouts and drain ready `Send*` states
    ///
    /// Call at 10 Hz or better against a monotonic millisecond clock.
    pub fn update(&mut self, registry: &mut ControlFunctionRegistry, now_ms: u32) {
        let mut idx = 0;
        while idx < self.sessions.len() {
            loop {
                match self.service_session(registry, idx, now_ms) {
                    Service::Advanced => continue,
                    Service::Idle => {
                        idx += 1;
                        break;
                    }
                    Service::Removed => break,
                }
            }
        }
    }

    /// Abort every active session, e.g. when the frame driver dies
    pub fn abort_all(
        &mut self,
        registry: &ControlFunctionRegistry,
        reason: AbortReason,
        now_ms: u32,
    ) {
        while !self.sessions.is_empty() {
            self.abort_session(registry, 0, reason, now_ms);
        }
    }

    fn find_session(
        &self,
        direction: Direction,
        source: CfHandle,
        destination: CfHandle,
        pgn: Option<u32>,
    ) -> Option<usize> {
        self.sessions.iter().position(|s| {
            s.direction == direction
                && s.source == source
                && s.destination == destination
                && pgn.is_none_or(|p| s.pgn == p)
        })
    }

    /// Current addresses of (payload source, payload destination), if both still resolve
    fn session_addresses(
        &self,
        registry: &ControlFunctionRegistry,
        idx: usize,
    ) -> Option<(u8, u8)> {
        let session = &self.sessions[idx];
        let source = registry.get(session.source)?.address;
        let destination = registry.get(session.destination)?.address;
        Some((source, destination))
    }

    fn emit_control(&mut self, src: u8, dst: u8, msg: &ControlMessage, now_ms: u32) -> bool {
        let id = canid(ETP_PRIORITY, ETP_CONNECTION_MANAGEMENT_PGN, dst, src);
        let frame = CanFrame::new(now_ms.wrapping_mul(1000), self.channel, id, &msg.encode());
        (self.frame_sink)(&frame)
    }

    fn emit_data(&mut self, src: u8, dst: u8, sequence: u8, chunk: &[u8], now_ms: u32) -> bool {
        let id = canid(ETP_PRIORITY, ETP_DATA_TRANSFER_PGN, dst, src);
        let frame = CanFrame::new(
            now_ms.wrapping_mul(1000),
            self.channel,
            id,
            &encode_data_frame(sequence, chunk),
        );
        (self.frame_sink)(&frame)
    }

    /// Best-effort abort notification to the peer, addressed from our end of the session
    fn emit_abort_for(
        &mut self,
        registry: &ControlFunctionRegistry,
        idx: usize,
        reason: AbortReason,
        now_ms: u32,
    ) {
        let pgn = self.sessions[idx].pgn;
        let direction = self.sessions[idx].direction;
        if let Some((source, destination)) = self.session_addresses(registry, idx) {
            let (local, peer) = match direction {
                Direction::Transmit => (source, destination),
                Direction::Receive => (destination, source),
            };
            self.emit_control(local, peer, &ControlMessage::Abort { reason, pgn }, now_ms);
        }
    }

    /// Tear a session down, notify the peer, and publish the outcome
    fn abort_session(
        &mut self,
        registry: &ControlFunctionRegistry,
        idx: usize,
        reason: AbortReason,
        now_ms: u32,
    ) {
        self.emit_abort_for(registry, idx, reason, now_ms);
        self.remove_session(registry, idx, SessionOutcome::Aborted(reason));
    }

    fn remove_session(
        &mut self,
        registry: &ControlFunctionRegistry,
        idx: usize,
        outcome: SessionOutcome,
    ) {
        let (source, destination) = self.session_addresses(registry, idx).unwrap_or((0xFE, 0xFE));
        let session = self.sessions.remove(idx);
        let event = SessionEvent {
            direction: session.direction,
            pgn: session.pgn,
            source,
            destination,
            total_size: session.total_size,
            outcome,
        };
        match outcome {
            SessionOutcome::Completed => {
                tracing::debug!(
                    "Finished ETP session. pgn: {:#X} size: {}",
                    event.pgn,
                    event.total_size
                );
            }
            SessionOutcome::Aborted(reason) | SessionOutcome::AbortedByPeer(reason) => {
                tracing::warn!(
                    "Aborted ETP session. pgn: {:#X} size: {} reason: {reason:?}",
                    event.pgn,
                    event.total_size
                );
            }
        }
        self.session_events.invoke(&event);
    }

    /// A receive session got everything and the EOMA went out: hand the payload up
    fn complete_receive(
        &mut self,
        registry: &ControlFunctionRegistry,
        idx: usize,
        now_ms: u32,
    ) {
        let (source, destination) = self.session_addresses(registry, idx).unwrap_or((0xFE, 0xFE));
        let session = &self.sessions[idx];
        let message = CanMessage {
            timestamp_us: now_ms.wrapping_mul(1000),
            channel: self.channel,
            priority: ETP_PRIORITY,
            pgn: session.pgn,
            src: source,
            dst: destination,
            data: self.sessions[idx].payload.clone(),
        };
        self.messages.invoke(&message);
        self.remove_session(registry, idx, SessionOutcome::Completed);
    }

    // ------------------------------------------------------------------------------------------
    // Inbound frame handling

    fn process_control_frame(
        &mut self,
        registry: &mut ControlFunctionRegistry,
        frame: &CanFrame,
        now_ms: u32,
    ) {
        if !registry.is_internal_address(frame.dst()) {
            return;
        }
        let msg = match ControlMessage::decode(frame.data()) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("Dropping malformed ETP.CM frame: {e}");
                return;
            }
        };
        match msg {
            ControlMessage::RequestToSend { total_size, pgn } => {
                self.handle_request_to_send(registry, frame, total_size, pgn, now_ms);
            }
            ControlMessage::ClearToSend {
                num_packets,
                next_packet,
                pgn,
            } => {
                self.handle_clear_to_send(registry, frame, num_packets, next_packet, pgn, now_ms);
            }
            ControlMessage::DataPacketOffset {
                num_packets,
                offset,
                pgn,
            } => {
                self.handle_data_packet_offset(registry, frame, num_packets, offset, pgn, now_ms);
            }
            ControlMessage::EndOfMessageAcknowledge { total_size, pgn } => {
                self.handle_end_of_message_acknowledge(registry, frame, total_size, pgn);
            }
            ControlMessage::Abort { reason, pgn } => {
                self.handle_peer_abort(registry, frame, reason, pgn);
            }
        }
    }

    fn handle_request_to_send(
        &mut self,
        registry: &mut ControlFunctionRegistry,
        frame: &CanFrame,
        total_size: u32,
        pgn: u32,
        now_ms: u32,
    ) {
        // The peer may be a control function we've never partnered with; track it so the
        // session's handles resolve for the rest of the transfer
        let source = match registry.resolve(frame.src()) {
            Some(handle) => handle,
            None => match registry.register_partner(Name(0), frame.src()) {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::warn!("Cannot track RTS sender {:#04X}: {e}", frame.src());
                    return;
                }
            },
        };
        // Checked by the caller
        let Some(destination) = registry.resolve(frame.dst()) else {
            return;
        };

        if let Some(existing) = self.find_session(Direction::Receive, source, destination, None) {
            // One session per peer pair; a second RTS kills the first rather than corrupting it
            self.abort_session(registry, existing, AbortReason::AlreadyInSession, now_ms);
            return;
        }
        if !wire::size_fits_protocol(total_size) {
            self.refuse_rts(frame, pgn, AbortReason::TotalSizeTooBig, now_ms);
            return;
        }
        if total_size < MIN_TRANSFER_SIZE {
            tracing::warn!("RTS for {total_size} bytes is below the ETP minimum");
            self.refuse_rts(frame, pgn, AbortReason::AnyOtherError, now_ms);
            return;
        }
        if total_size > self.config.max_transfer_size {
            self.refuse_rts(frame, pgn, AbortReason::SystemResources, now_ms);
            return;
        }

        let mut session = EtpSession::new_receive(source, destination, pgn, total_size, now_ms);
        session.set_max_retry_attempts(self.config.max_retry_attempts);
        tracing::debug!(
            "Start ETP rx session. pgn: {pgn:#X} size: {total_size} packets: {}",
            session.total_packets()
        );
        self.sessions.push(session);
    }

    /// Refuse an RTS we never built a session for
    fn refuse_rts(
        &mut self,
        frame: &CanFrame,
        pgn: u32,
        reason: AbortReason,
        now_ms: u32,
    ) {
        tracing::warn!(
            "Refusing RTS from {:#04X}. pgn: {pgn:#X} reason: {reason:?}",
            frame.src()
        );
        self.emit_control(
            frame.dst(),
            frame.src(),
            &ControlMessage::Abort { reason, pgn },
            now_ms,
        );
    }

    fn handle_clear_to_send(
        &mut self,
        registry: &mut ControlFunctionRegistry,
        frame: &CanFrame,
        num_packets: u8,
        next_packet: u32,
        pgn: u32,
        now_ms: u32,
    ) {
        // A CTS comes from the payload's consumer, so the session's source is our address
        let (Some(source), Some(destination)) =
            (registry.resolve(frame.dst()), registry.resolve(frame.src()))
        else {
            return;
        };
        let Some(idx) = self.find_session(Direction::Transmit, source, destination, Some(pgn))
        else {
            tracing::warn!("CTS from {:#04X} with no matching tx session", frame.src());
            return;
        };

        match self.sessions[idx].state {
            StateMachineState::WaitForClearToSend
            | StateMachineState::WaitForEndOfMessageAcknowledge => {}
            StateMachineState::SendDataPacketOffset
            | StateMachineState::SendDataTransferPackets => {
                self.abort_session(registry, idx, AbortReason::ClearToSendWhileSending, now_ms);
                return;
            }
            state => {
                tracing::warn!("Ignoring CTS in state {state:?}");
                return;
            }
        }

        if num_packets == 0 {
            // The receiver wants us to hold off; restart the wait without spending a retry. A
            // hold makes no sense once all the data is out, so it cannot rewind an EOMA wait
            let session = &mut self.sessions[idx];
            if session.state == StateMachineState::WaitForClearToSend {
                session.reset_retry_attempts();
                session.set_state(StateMachineState::WaitForClearToSend, now_ms);
            }
            return;
        }

        let total_packets = self.sessions[idx].total_packets();
        if next_packet == 0 || next_packet > total_packets {
            self.abort_session(registry, idx, AbortReason::AnyOtherError, now_ms);
            return;
        }

        // Bursts never cross a 255-packet DPO window; a greedy CTS gets clamped
        let window_remaining =
            (EtpSession::window_of(next_packet) + 1) * PACKETS_PER_DPO_WINDOW - (next_packet - 1);
        let total_remaining = total_packets - (next_packet - 1);
        let burst = (num_packets as u32)
            .min(window_remaining)
            .min(total_remaining) as u8;

        let session = &mut self.sessions[idx];
        session.reset_retry_attempts();
        session.last_acknowledged_packet = next_packet - 1;
        session.next_packet = next_packet;
        session.data_packet_offset = EtpSession::window_of(next_packet);
        session.packets_in_burst = burst;
        session.burst_packets_remaining = burst;
        session.set_state(StateMachineState::SendDataPacketOffset, now_ms);
    }

    fn handle_data_packet_offset(
        &mut self,
        registry: &mut ControlFunctionRegistry,
        frame: &CanFrame,
        num_packets: u8,
        offset: u32,
        pgn: u32,
        now_ms: u32,
    ) {
        let (Some(source), Some(destination)) =
            (registry.resolve(frame.src()), registry.resolve(frame.dst()))
        else {
            return;
        };
        let Some(idx) = self.find_session(Direction::Receive, source, destination, Some(pgn))
        else {
            tracing::warn!("DPO from {:#04X} with no matching rx session", frame.src());
            return;
        };

        match self.sessions[idx].state {
            StateMachineState::WaitForDataPacketOffset => {}
            StateMachineState::WaitForDataTransferPacket => {
                let session = &mut self.sessions[idx];
                let untouched = session.burst_packets_remaining == session.packets_in_burst;
                if untouched && offset == session.data_packet_offset {
                    // The sender retried a DPO we already accepted
                    session.set_state(StateMachineState::WaitForDataTransferPacket, now_ms);
                } else {
                    self.abort_session(
                        registry,
                        idx,
                        AbortReason::UnexpectedDataPacketOffset,
                        now_ms,
                    );
                }
                return;
            }
            state => {
                tracing::warn!("Ignoring DPO in state {state:?}");
                return;
            }
        }

        let session = &self.sessions[idx];
        let expected_offset = EtpSession::window_of(session.next_packet);
        let within_total =
            (session.next_packet - 1) + num_packets as u32 <= session.total_packets();
        if offset != expected_offset
            || num_packets == 0
            || num_packets > session.packets_in_burst
            || !within_total
        {
            self.abort_session(registry, idx, AbortReason::UnexpectedDataPacketOffset, now_ms);
            return;
        }

        let session = &mut self.sessions[idx];
        session.reset_retry_attempts();
        session.data_packet_offset = offset;
        session.packets_in_burst = num_packets;
        session.burst_packets_remaining = num_packets;
        session.set_state(StateMachineState::WaitForDataTransferPacket, now_ms);
    }

    fn handle_end_of_message_acknowledge(
        &mut self,
        registry: &mut ControlFunctionRegistry,
        frame: &CanFrame,
        total_size: u32,
        pgn: u32,
    ) {
        let (Some(source), Some(destination)) =
            (registry.resolve(frame.dst()), registry.resolve(frame.src()))
        else {
            return;
        };
        let Some(idx) = self.find_session(Direction::Transmit, source, destination, Some(pgn))
        else {
            tracing::warn!("EOMA from {:#04X} with no matching tx session", frame.src());
            return;
        };
        if self.sessions[idx].state != StateMachineState::WaitForEndOfMessageAcknowledge {
            tracing::warn!(
                "Ignoring EOMA in state {:?}",
                self.sessions[idx].state
            );
            return;
        }
        if total_size != self.sessions[idx].total_size {
            tracing::warn!(
                "EOMA acknowledges {total_size} bytes of a {} byte transfer",
                self.sessions[idx].total_size
            );
        }
        self.remove_session(registry, idx, SessionOutcome::Completed);
    }

    fn handle_peer_abort(
        &mut self,
        registry: &mut ControlFunctionRegistry,
        frame: &CanFrame,
        reason: AbortReason,
        pgn: u32,
    ) {
        // The abort's sender is the peer; it could be either end of the payload flow
        let (Some(peer), Some(local)) =
            (registry.resolve(frame.src()), registry.resolve(frame.dst()))
        else {
            return;
        };
        let idx = self
            .find_session(Direction::Transmit, local, peer, Some(pgn))
            .or_else(|| self.find_session(Direction::Receive, peer, local, Some(pgn)));
        let Some(idx) = idx else {
            return;
        };
        self.remove_session(registry, idx, SessionOutcome::AbortedByPeer(reason));
    }

    fn process_data_frame(
        &mut self,
        registry: &mut ControlFunctionRegistry,
        frame: &CanFrame,
        now_ms: u32,
    ) {
        if !registry.is_internal_address(frame.dst()) {
            return;
        }
        let (Some(source), Some(destination)) =
            (registry.resolve(frame.src()), registry.resolve(frame.dst()))
        else {
            return;
        };
        // ETP.DT carries no PGN, so the (source, destination) pair is the whole key; that is why
        // a pair may only ever have one receive session going
        let Some(idx) = self.find_session(Direction::Receive, source, destination, None) else {
            return;
        };
        if self.sessions[idx].state != StateMachineState::WaitForDataTransferPacket {
            tracing::warn!(
                "Ignoring ETP.DT in state {:?}",
                self.sessions[idx].state
            );
            return;
        }

        let (sequence, payload) = match decode_data_frame(frame.data()) {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!("Dropping malformed ETP.DT frame: {e}");
                return;
            }
        };

        let expected = EtpSession::sequence_of(self.sessions[idx].next_packet);
        if sequence < expected {
            self.abort_session(registry, idx, AbortReason::DuplicateSequenceNumber, now_ms);
            return;
        }
        if sequence > expected {
            self.abort_session(registry, idx, AbortReason::BadSequenceNumber, now_ms);
            return;
        }

        let session = &mut self.sessions[idx];
        let packet = session.next_packet;
        let start = ((packet - 1) * PACKET_PAYLOAD_SIZE) as usize;
        let end = (start + PACKET_PAYLOAD_SIZE as usize).min(session.total_size as usize);
        session.payload[start..end].copy_from_slice(&payload[..end - start]);
        session.next_packet += 1;
        session.burst_packets_remaining -= 1;
        session.reset_retry_attempts();
        session.timestamp_ms = now_ms;

        if session.burst_packets_remaining == 0 {
            session.last_acknowledged_packet = session.next_packet - 1;
            if session.next_packet > session.total_packets() {
                session.set_state(StateMachineState::SendEndOfMessageAcknowledge, now_ms);
            } else {
                session.set_state(StateMachineState::SendClearToSend, now_ms);
            }
        }
    }

    // ------------------------------------------------------------------------------------------
    // Tick-driven state servicing

    fn service_session(
        &mut self,
        registry: &mut ControlFunctionRegistry,
        idx: usize,
        now_ms: u32,
    ) -> Service {
        let Some((source, destination)) = self.session_addresses(registry, idx) else {
            // An endpoint lost its address; the session cannot even abort politely
            tracing::warn!("Dropping ETP session with an unresolvable control function");
            self.remove_session(
                registry,
                idx,
                SessionOutcome::Aborted(AbortReason::AnyOtherError),
            );
            return Service::Removed;
        };

        match self.sessions[idx].state {
            StateMachineState::None => Service::Idle,

            StateMachineState::SendRequestToSend => {
                let msg = ControlMessage::RequestToSend {
                    total_size: self.sessions[idx].total_size,
                    pgn: self.sessions[idx].pgn,
                };
                if self.emit_control(source, destination, &msg, now_ms) {
                    self.sessions[idx].set_state(StateMachineState::WaitForClearToSend, now_ms);
                    Service::Advanced
                } else {
                    Service::Idle
                }
            }

            StateMachineState::WaitForClearToSend => {
                if !timed_out(now_ms, self.sessions[idx].timestamp_ms, T3_CONTROL_TIMEOUT_MS) {
                    return Service::Idle;
                }
                if self.sessions[idx].can_retry() {
                    self.sessions[idx].increment_retry_attempts();
                    tracing::debug!(
                        "ETP CTS timeout, retry {}/{}",
                        self.sessions[idx].get_retry_attempts(),
                        self.sessions[idx].get_max_retry_attempts()
                    );
                    let msg = ControlMessage::RequestToSend {
                        total_size: self.sessions[idx].total_size,
                        pgn: self.sessions[idx].pgn,
                    };
                    self.emit_control(source, destination, &msg, now_ms);
                    self.sessions[idx].timestamp_ms = now_ms;
                    Service::Idle
                } else {
                    self.abort_session(registry, idx, AbortReason::Timeout, now_ms);
                    Service::Removed
                }
            }

            StateMachineState::SendClearToSend => {
                if self.send_clear_to_send(idx, source, destination, now_ms) {
                    self.sessions[idx]
                        .set_state(StateMachineState::WaitForDataPacketOffset, now_ms);
                    Service::Advanced
                } else {
                    Service::Idle
                }
            }

            StateMachineState::WaitForDataPacketOffset => {
                if !timed_out(now_ms, self.sessions[idx].timestamp_ms, T3_CONTROL_TIMEOUT_MS) {
                    return Service::Idle;
                }
                if self.sessions[idx].can_retry() {
                    self.sessions[idx].increment_retry_attempts();
                    tracing::debug!(
                        "ETP DPO timeout, retry {}/{}",
                        self.sessions[idx].get_retry_attempts(),
                        self.sessions[idx].get_max_retry_attempts()
                    );
                    self.send_clear_to_send(idx, source, destination, now_ms);
                    self.sessions[idx].timestamp_ms = now_ms;
                    Service::Idle
                } else {
                    self.abort_session(registry, idx, AbortReason::Timeout, now_ms);
                    Service::Removed
                }
            }

            StateMachineState::SendDataPacketOffset => {
                let session = &self.sessions[idx];
                let msg = ControlMessage::DataPacketOffset {
                    num_packets: session.packets_in_burst,
                    offset: session.data_packet_offset,
                    pgn: session.pgn,
                };
                if self.emit_control(source, destination, &msg, now_ms) {
                    self.sessions[idx]
                        .set_state(StateMachineState::SendDataTransferPackets, now_ms);
                    Service::Advanced
                } else {
                    Service::Idle
                }
            }

            StateMachineState::SendDataTransferPackets => {
                // Stream the whole burst; a refused write parks the session here and the next
                // tick picks the burst back up where it stopped
                while self.sessions[idx].burst_packets_remaining > 0 {
                    let session = &self.sessions[idx];
                    let packet = session.next_packet;
                    let sequence = EtpSession::sequence_of(packet);
                    let start = ((packet - 1) * PACKET_PAYLOAD_SIZE) as usize;
                    let end =
                        (start + PACKET_PAYLOAD_SIZE as usize).min(session.total_size as usize);
                    let mut chunk = [0u8; PACKET_PAYLOAD_SIZE as usize];
                    chunk[..end - start].copy_from_slice(&session.payload[start..end]);
                    if !self.emit_data(source, destination, sequence, &chunk[..end - start], now_ms)
                    {
                        return Service::Idle;
                    }
                    let session = &mut self.sessions[idx];
                    session.next_packet += 1;
                    session.burst_packets_remaining -= 1;
                }
                let session = &mut self.sessions[idx];
                if session.next_packet > session.total_packets() {
                    session.set_state(StateMachineState::WaitForEndOfMessageAcknowledge, now_ms);
                } else {
                    session.set_state(StateMachineState::WaitForClearToSend, now_ms);
                }
                Service::Advanced
            }

            StateMachineState::WaitForDataTransferPacket => {
                if !timed_out(now_ms, self.sessions[idx].timestamp_ms, T1_DATA_GAP_TIMEOUT_MS) {
                    return Service::Idle;
                }
                if self.sessions[idx].can_retry() {
                    self.sessions[idx].increment_retry_attempts();
                    tracing::debug!(
                        "ETP data gap timeout, re-requesting from packet {} (retry {}/{})",
                        self.sessions[idx].next_packet,
                        self.sessions[idx].get_retry_attempts(),
                        self.sessions[idx].get_max_retry_attempts()
                    );
                    // Ask the sender to pick the burst back up from the gap
                    if self.send_clear_to_send(idx, source, destination, now_ms) {
                        self.sessions[idx]
                            .set_state(StateMachineState::WaitForDataPacketOffset, now_ms);
                    } else {
                        self.sessions[idx].timestamp_ms = now_ms;
                    }
                    Service::Idle
                } else {
                    self.abort_session(registry, idx, AbortReason::Timeout, now_ms);
                    Service::Removed
                }
            }

            StateMachineState::WaitForEndOfMessageAcknowledge => {
                if !timed_out(now_ms, self.sessions[idx].timestamp_ms, T3_CONTROL_TIMEOUT_MS) {
                    return Service::Idle;
                }
                if self.sessions[idx].can_retry() {
                    self.sessions[idx].increment_retry_attempts();
                    tracing::debug!(
                        "ETP EOMA timeout, re-announcing final burst (retry {}/{})",
                        self.sessions[idx].get_retry_attempts(),
                        self.sessions[idx].get_max_retry_attempts()
                    );
                    // There is no sender-side control frame for this state; re-announcing the
                    // final burst prompts a receiver that lost the tail to re-request it
                    let session = &self.sessions[idx];
                    let msg = ControlMessage::DataPacketOffset {
                        num_packets: session.packets_in_burst,
                        offset: session.data_packet_offset,
                        pgn: session.pgn,
                    };
                    self.emit_control(source, destination, &msg, now_ms);
                    self.sessions[idx].timestamp_ms = now_ms;
                    Service::Idle
                } else {
                    self.abort_session(registry, idx, AbortReason::Timeout, now_ms);
                    Service::Removed
                }
            }

            StateMachineState::SendEndOfMessageAcknowledge => {
                let session = &self.sessions[idx];
                let msg = ControlMessage::EndOfMessageAcknowledge {
                    total_size: session.total_size,
                    pgn: session.pgn,
                };
                // EOMA goes from the payload's consumer back to its producer
                if self.emit_control(destination, source, &msg, now_ms) {
                    self.complete_receive(registry, idx, now_ms);
                    Service::Removed
                } else {
                    Service::Idle
                }
            }
        }
    }

    /// Emit a CTS for the receive session at `idx`, requesting the next burst
    ///
    /// Records the requested count so the answering DPO can be validated against it.
    fn send_clear_to_send(
        &mut self,
        idx: usize,
        source: u8,
        destination: u8,
        now_ms: u32,
    ) -> bool {
        let session = &self.sessions[idx];
        let next = session.next_packet;
        let window_remaining =
            (EtpSession::window_of(next) + 1) * PACKETS_PER_DPO_WINDOW - (next - 1);
        let total_remaining = session.total_packets() - (next - 1);
        let request = (self.config.packets_per_cts as u32)
            .min(window_remaining)
            .min(total_remaining) as u8;
        let msg = ControlMessage::ClearToSend {
            num_packets: request,
            next_packet: next,
            pgn: session.pgn,
        };
        // CTS goes from the payload's consumer back to its producer
        let sent = self.emit_control(destination, source, &msg, now_ms);
        if sent {
            self.sessions[idx].packets_in_burst = request;
            self.sessions[idx].burst_packets_remaining = request;
        }
        sent
    }
}
