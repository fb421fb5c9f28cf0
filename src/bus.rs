//! The bus thread: one owner for the driver, the addressing registry, and the transport
//!
//! Everything protocol-visible happens on this thread; other threads only ever see the working
//! sets and the dispatcher callbacks. Outbound frames from the session manager land in a queue
//! that each tick flushes to the driver, so a refused hardware write is retried on the next tick
//! without the state machines having to care.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::can::{CanDriver, CanFrame, ControlFunctionRegistry, DriverRegistry};
use crate::timing::MonotonicClock;
use crate::transport::{AbortReason, EtpConfig, EtpSessionManager};

/// Tick period for [CanBus::spawn]; 10 ms comfortably beats the manager's 10 Hz floor
const TICK_PERIOD: Duration = Duration::from_millis(10);

/// Upper bound on frames drained from the driver per tick, so a flooded bus cannot starve the
/// timeout evaluation
const MAX_FRAMES_PER_TICK: usize = 512;

pub struct CanBus {
    channel: u8,
    registry: ControlFunctionRegistry,
    drivers: DriverRegistry,
    manager: EtpSessionManager,
    clock: MonotonicClock,
    outbound: Arc<Mutex<VecDeque<CanFrame>>>,
    driver_valid: bool,
}

impl CanBus {
    pub fn new(channel: u8, driver: Box<dyn CanDriver + Send>, config: EtpConfig) -> Self {
        let outbound = Arc::new(Mutex::new(VecDeque::new()));
        let queue = Arc::clone(&outbound);
        let manager = EtpSessionManager::new(
            config,
            channel,
            Box::new(move |frame| {
                queue.lock().unwrap().push_back(*frame);
                true
            }),
        );
        let mut drivers = DriverRegistry::new();
        drivers.register(channel, driver);
        Self {
            channel,
            registry: ControlFunctionRegistry::new(),
            drivers,
            manager,
            clock: MonotonicClock::new(),
            outbound,
            driver_valid: false,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &ControlFunctionRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ControlFunctionRegistry {
        &mut self.registry
    }

    #[must_use]
    pub fn manager(&self) -> &EtpSessionManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut EtpSessionManager {
        &mut self.manager
    }

    /// Start a transmit session; see [EtpSessionManager::send]
    pub fn send(
        &mut self,
        source: crate::can::CfHandle,
        destination: crate::can::CfHandle,
        pgn: u32,
        payload: Vec<u8>,
    ) -> eyre::Result<()> {
        let now_ms = self.clock.now_ms();
        self.manager
            .send(&self.registry, source, destination, pgn, payload, now_ms)
    }

    /// One pass of the bus loop against the wall clock
    pub fn tick(&mut self) {
        let now_ms = self.clock.now_ms();
        self.tick_at(now_ms);
    }

    /// One pass of the bus loop at an explicit time, for replay and tests
    pub fn tick_at(&mut self, now_ms: u32) {
        let Some(driver) = self.drivers.driver(self.channel) else {
            return;
        };
        if !driver.get_is_valid() {
            if self.driver_valid {
                tracing::error!(
                    "CAN driver on channel {} went invalid; aborting all sessions",
                    self.channel
                );
                self.driver_valid = false;
                // Anything queued can no longer be delivered
                self.outbound.lock().unwrap().clear();
                self.manager
                    .abort_all(&self.registry, AbortReason::AnyOtherError, now_ms);
            }
            // Nothing gets scheduled until the driver comes back
            return;
        }
        self.driver_valid = true;

        // Interleave protocol updates with the reads so back-to-back control frames in a replay
        // see the same state progression they would on a live bus
        let mut frame = CanFrame::default();
        for _ in 0..MAX_FRAMES_PER_TICK {
            let Some(driver) = self.drivers.driver(self.channel) else {
                return;
            };
            if !driver.read_frame(&mut frame) {
                break;
            }
            self.manager
                .process_frame(&mut self.registry, &frame, now_ms);
            self.manager.update(&mut self.registry, now_ms);
        }
        self.manager.update(&mut self.registry, now_ms);

        // Flush what the protocol produced; a refused write parks the rest for the next tick
        let Some(driver) = self.drivers.driver(self.channel) else {
            return;
        };
        let mut queue = self.outbound.lock().unwrap();
        while let Some(next) = queue.front() {
            if driver.write_frame(next) {
                queue.pop_front();
            } else {
                tracing::debug!("Driver refused a frame; {} left queued", queue.len());
                break;
            }
        }
    }

    /// Run the bus loop on its own thread at 100 Hz until `stop` is raised
    ///
    /// Returns the bus itself from the join so the owner can tear it down.
    pub fn spawn(mut self, stop: Arc<AtomicBool>) -> JoinHandle<CanBus> {
        std::thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                self.tick();
                std::thread::sleep(TICK_PERIOD);
            }
            self
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::can::{canid, CanMessage, MockDriver, Name};
    use crate::transport::{
        ControlMessage, SessionOutcome, ETP_CONNECTION_MANAGEMENT_PGN, ETP_DATA_TRANSFER_PGN,
        ETP_PRIORITY,
    };

    fn control_frame(src: u8, dst: u8, msg: &ControlMessage) -> CanFrame {
        let id = canid(ETP_PRIORITY, ETP_CONNECTION_MANAGEMENT_PGN, dst, src);
        CanFrame::new(0, 0, id, &msg.encode())
    }

    fn data_frame(src: u8, dst: u8, sequence: u8, payload: &[u8]) -> CanFrame {
        let mut data = [0xFF; 8];
        data[0] = sequence;
        data[1..1 + payload.len()].copy_from_slice(payload);
        let id = canid(ETP_PRIORITY, ETP_DATA_TRANSFER_PGN, dst, src);
        CanFrame::new(0, 0, id, &data)
    }

    /// A [MockDriver] whose state stays visible to the test after the bus boxes it
    #[derive(Clone, Default)]
    struct SharedDriver(Arc<Mutex<MockDriver>>);

    impl CanDriver for SharedDriver {
        fn open(&mut self) {
            self.0.lock().unwrap().open();
        }
        fn close(&mut self) {
            self.0.lock().unwrap().close();
        }
        fn get_is_valid(&self) -> bool {
            self.0.lock().unwrap().get_is_valid()
        }
        fn read_frame(&mut self, frame: &mut CanFrame) -> bool {
            self.0.lock().unwrap().read_frame(frame)
        }
        fn write_frame(&mut self, frame: &CanFrame) -> bool {
            self.0.lock().unwrap().write_frame(frame)
        }
    }

    const SENDER: u8 = 0x81;
    const RECEIVER: u8 = 0x26;
    const PGN: u32 = 0xE700;

    /// Queue a complete 1786-byte inbound transfer (256 packets: 255 + 1) onto the driver
    fn seed_inbound_transfer(driver: &SharedDriver, payload: &[u8]) {
        assert_eq!(payload.len(), 1786);
        let mut mock = driver.0.lock().unwrap();
        mock.rx_queue.push_back(control_frame(
            SENDER,
            RECEIVER,
            &ControlMessage::RequestToSend {
                total_size: 1786,
                pgn: PGN,
            },
        ));
        mock.rx_queue.push_back(control_frame(
            SENDER,
            RECEIVER,
            &ControlMessage::DataPacketOffset {
                num_packets: 255,
                offset: 0,
                pgn: PGN,
            },
        ));
        for packet in 1..=255usize {
            let start = (packet - 1) * 7;
            mock.rx_queue.push_back(data_frame(
                SENDER,
                RECEIVER,
                packet as u8,
                &payload[start..start + 7],
            ));
        }
        mock.rx_queue.push_back(control_frame(
            SENDER,
            RECEIVER,
            &ControlMessage::DataPacketOffset {
                num_packets: 1,
                offset: 1,
                pgn: PGN,
            },
        ));
        mock.rx_queue
            .push_back(data_frame(SENDER, RECEIVER, 1, &payload[1785..]));
    }

    #[test]
    fn test_bus_receives_full_transfer() {
        let driver = SharedDriver::default();
        let mut bus = CanBus::new(0, Box::new(driver.clone()), EtpConfig::default());
        bus.registry_mut()
            .claim_internal(Name(0x0A), RECEIVER)
            .unwrap();

        let payload: Vec<u8> = (0..1786).map(|i| (i % 253) as u8).collect();
        let messages = Arc::new(Mutex::new(Vec::<CanMessage>::new()));
        let sink = Arc::clone(&messages);
        bus.manager_mut()
            .add_message_listener(move |m| sink.lock().unwrap().push(m.clone()));

        seed_inbound_transfer(&driver, &payload);
        for tick in 0..8 {
            bus.tick_at(tick * 10);
        }

        let messages = messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].data, payload);
        assert_eq!(messages[0].src, SENDER);
        assert_eq!(messages[0].dst, RECEIVER);

        // The flow-control answers went out through the driver
        let mock = driver.0.lock().unwrap();
        let decoded: Vec<_> = mock
            .tx_log
            .iter()
            .map(|f| ControlMessage::decode(f.data()).unwrap())
            .collect();
        assert_eq!(
            decoded,
            vec![
                ControlMessage::ClearToSend {
                    num_packets: 255,
                    next_packet: 1,
                    pgn: PGN
                },
                ControlMessage::ClearToSend {
                    num_packets: 1,
                    next_packet: 256,
                    pgn: PGN
                },
                ControlMessage::EndOfMessageAcknowledge {
                    total_size: 1786,
                    pgn: PGN
                },
            ]
        );
        assert_eq!(mock.tx_log[0].identifier, canid(7, 0xC800, SENDER, RECEIVER));
    }

    #[test]
    fn test_driver_loss_aborts_everything() {
        let driver = SharedDriver::default();
        let mut bus = CanBus::new(0, Box::new(driver.clone()), EtpConfig::default());
        bus.registry_mut()
            .claim_internal(Name(0x0A), RECEIVER)
            .unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        bus.manager_mut()
            .add_session_event_listener(move |e| sink.lock().unwrap().push(*e));

        driver.0.lock().unwrap().rx_queue.push_back(control_frame(
            SENDER,
            RECEIVER,
            &ControlMessage::RequestToSend {
                total_size: 1786,
                pgn: PGN,
            },
        ));
        bus.tick_at(0);
        assert_eq!(bus.manager().sessions().len(), 1);

        // The hardware dies: the registry's reopen attempt has to keep failing
        {
            let mut mock = driver.0.lock().unwrap();
            mock.fail_open = true;
            mock.close();
        }
        bus.tick_at(10);
        {
            let events = events.lock().unwrap();
            assert_eq!(events.len(), 1);
            assert_eq!(
                events[0].outcome,
                SessionOutcome::Aborted(AbortReason::AnyOtherError)
            );
        }
        assert!(bus.manager().sessions().is_empty());

        // Still dead: nothing further happens
        bus.tick_at(20);
        assert_eq!(events.lock().unwrap().len(), 1);

        // The hardware comes back and the bus resumes scheduling
        driver.0.lock().unwrap().fail_open = false;
        driver.0.lock().unwrap().rx_queue.push_back(control_frame(
            SENDER,
            RECEIVER,
            &ControlMessage::RequestToSend {
                total_size: 1786,
                pgn: PGN,
            },
        ));
        bus.tick_at(30);
        assert_eq!(bus.manager().sessions().len(), 1);
    }
}
