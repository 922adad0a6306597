//! Relay wiring: GATT events in, card exchanges on a worker thread.
//!
//! ```text
//! GattEvent ──> PeripheralConversation ──ConversationEvent──> card worker
//!                      ^                                          │
//!                      └──────────────── CardResponse ────────────┘
//! ```
//!
//! The wireless side runs on the caller's thread ([`Relay::run`] or
//! [`Relay::handle_gatt_event`]); the card side runs on its own thread and
//! may block for as long as the card takes. Both channels are bounded.
//!
//! Ending a conversation clears the shared correlator from the wireless
//! side, so a card busy with one request never starts the ones queued
//! behind it.

use crate::card::CardTransport;
use crate::config::RelayConfig;
use crate::correlator::{CardLink, CardResponse, DrainOutcome, RequestCorrelator};
use crate::error::{RelayError, Result};
use crate::peripheral::{ConversationEvent, GattEvent, GattServer, PeripheralConversation};
use crate::sequence::ApduEnvelope;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use log::{debug, error, info, warn};
use std::thread::JoinHandle;

/// Instructions for the card worker.
enum CardControl {
    Attach(Box<dyn CardTransport>),
    Detach,
    Kick,
    Shutdown,
}

/// A running relay: peripheral state machine plus card worker.
pub struct Relay<G: GattServer> {
    peripheral: PeripheralConversation<G>,
    correlator: RequestCorrelator,
    responses: Receiver<CardResponse>,
    control: Sender<CardControl>,
    worker: Option<JoinHandle<()>>,
}

impl<G: GattServer> Relay<G> {
    /// Build the peripheral and spawn the card worker.
    pub fn start(gatt: G, config: &RelayConfig) -> Result<Self> {
        config.validate()?;

        let (upstream_tx, upstream_rx) = bounded(config.channel_depth);
        let (response_tx, response_rx) = bounded(config.channel_depth);
        let (control_tx, control_rx) = bounded(config.channel_depth);

        let correlator = RequestCorrelator::new(response_tx);
        let peripheral = PeripheralConversation::new(gatt, config, correlator.clone(), upstream_tx)?;

        let worker_correlator = correlator.clone();
        let worker = std::thread::Builder::new()
            .name("card-worker".into())
            .spawn(move || card_worker(worker_correlator, upstream_rx, control_rx))
            .map_err(|e| RelayError::thread_spawn("card-worker", e))?;

        info!(
            "Relay started ({} format, capacity {})",
            config.format, config.capacity
        );
        Ok(Self {
            peripheral,
            correlator,
            responses: response_rx,
            control: control_tx,
            worker: Some(worker),
        })
    }

    /// The peripheral state machine.
    pub fn peripheral(&self) -> &PeripheralConversation<G> {
        &self.peripheral
    }

    /// Number of requests waiting for the card.
    pub fn pending_requests(&self) -> usize {
        self.correlator.len()
    }

    /// Attach a card; pending requests are sent to it.
    pub fn attach_card(&self, card: Box<dyn CardTransport>) -> Result<()> {
        self.send_control(CardControl::Attach(card))
    }

    /// Detach the current card.
    pub fn detach_card(&self) -> Result<()> {
        self.send_control(CardControl::Detach)
    }

    /// Retry pending requests on the attached card.
    pub fn kick(&self) -> Result<()> {
        self.send_control(CardControl::Kick)
    }

    fn send_control(&self, control: CardControl) -> Result<()> {
        self.control
            .send(control)
            .map_err(|_| RelayError::ChannelClosed)
    }

    /// Process one GATT callback.
    ///
    /// Rejected operations are logged; only a dead card worker is an error.
    pub fn handle_gatt_event(&mut self, event: GattEvent) -> Result<()> {
        match self.peripheral.handle_event(event) {
            Err(RelayError::ChannelClosed) => Err(RelayError::ChannelClosed),
            Err(e) => {
                warn!("GATT operation rejected: {}", e);
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    /// Deliver every card response that is ready, without blocking.
    pub fn pump_responses(&mut self) -> usize {
        let ready: Vec<CardResponse> = self.responses.try_iter().collect();
        let count = ready.len();
        for CardResponse { id, response } in ready {
            self.deliver(id, response);
        }
        count
    }

    fn deliver(&mut self, id: u64, response: ApduEnvelope) {
        if let Err(e) = self.peripheral.deliver_response(id, response) {
            warn!("Response for request {} not delivered: {}", id, e);
        }
    }

    /// Pump GATT events and card responses until `events` closes.
    pub fn run(&mut self, events: Receiver<GattEvent>) -> Result<()> {
        let responses = self.responses.clone();
        loop {
            select! {
                recv(events) -> event => match event {
                    Ok(event) => self.handle_gatt_event(event)?,
                    Err(_) => {
                        info!("GATT event source closed, stopping relay");
                        return Ok(());
                    }
                },
                recv(responses) -> response => match response {
                    Ok(CardResponse { id, response }) => self.deliver(id, response),
                    Err(_) => {
                        error!("Card worker stopped");
                        return Err(RelayError::ChannelClosed);
                    }
                },
            }
        }
    }
}

impl<G: GattServer> Drop for Relay<G> {
    fn drop(&mut self) {
        let _ = self.control.send(CardControl::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Card worker panicked");
            }
        }
    }
}

fn card_worker(
    correlator: RequestCorrelator,
    upstream: Receiver<ConversationEvent>,
    control: Receiver<CardControl>,
) {
    let mut card = CardLink::new();
    debug!("Card worker running");

    loop {
        let drain_now = select! {
            recv(upstream) -> event => match event {
                Ok(ConversationEvent::RequestAssembled { id, request }) => {
                    correlator.enqueue(id, request)
                }
                Ok(ConversationEvent::ConversationFinished) => {
                    // Already cleared by the peripheral
                    debug!("Conversation finished");
                    false
                }
                Err(_) => break,
            },
            recv(control) -> msg => match msg {
                Ok(CardControl::Attach(transport)) => {
                    info!("Card attached");
                    card.attach(transport);
                    true
                }
                Ok(CardControl::Detach) => {
                    info!("Card detached");
                    card.detach();
                    false
                }
                Ok(CardControl::Kick) => true,
                Ok(CardControl::Shutdown) | Err(_) => break,
            },
        };

        if !drain_now {
            continue;
        }
        match correlator.drain(&mut card) {
            Ok(DrainOutcome::Drained { relayed }) if relayed > 0 => {
                debug!("Drained {} requests", relayed)
            }
            Ok(DrainOutcome::Drained { .. }) | Ok(DrainOutcome::NoCard { .. }) => {}
            Ok(DrainOutcome::Halted { relayed, error }) => warn!(
                "Card halted after {} requests: {} (waiting for reconnect)",
                relayed, error
            ),
            Err(e) => {
                error!("Stopping card worker: {}", e);
                break;
            }
        }
    }
    debug!("Card worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::{
        CharacteristicRole, FragmentationFormat, CONVERSATION_FINISHED_CHAR_UUID,
        READ_RESPONSE_CHAR_UUID, WRITE_CHAR_UUID,
    };
    use crate::card::{CardError, SimulatedCard};
    use crate::peripheral::{DeviceId, GattError, GattStatus};
    use crate::sequence;
    use std::io;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    const CENTRAL: DeviceId = DeviceId(7);

    #[derive(Clone, Default)]
    struct SharedGatt {
        notifications: Arc<Mutex<usize>>,
        reads: Arc<Mutex<Vec<(GattStatus, Vec<u8>)>>>,
    }

    impl GattServer for SharedGatt {
        fn send_response(
            &mut self,
            _device: DeviceId,
            request_id: u32,
            status: GattStatus,
            _offset: u16,
            value: &[u8],
        ) -> std::result::Result<(), GattError> {
            // Reads use request ids from 1000 up
            if request_id >= 1000 {
                self.reads.lock().unwrap().push((status, value.to_vec()));
            }
            Ok(())
        }

        fn notify(
            &mut self,
            _device: DeviceId,
            _role: CharacteristicRole,
            _value: &[u8],
        ) -> std::result::Result<(), GattError> {
            *self.notifications.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn start(gatt: SharedGatt) -> Relay<SharedGatt> {
        let mut relay = Relay::start(gatt, &RelayConfig::default()).unwrap();
        relay
            .handle_gatt_event(GattEvent::ConnectionStateChanged {
                device: CENTRAL,
                connected: true,
            })
            .unwrap();
        relay
    }

    fn send_request(relay: &mut Relay<SharedGatt>, apdu: &[u8]) {
        let blob = sequence::encode(&ApduEnvelope::from(vec![apdu.to_vec()])).unwrap();
        for fragment in FragmentationFormat::Sequenced.fragmenter(512, &blob).unwrap() {
            relay
                .handle_gatt_event(GattEvent::CharacteristicWrite {
                    device: CENTRAL,
                    request_id: 1,
                    characteristic: WRITE_CHAR_UUID,
                    response_needed: true,
                    offset: 0,
                    value: fragment,
                })
                .unwrap();
        }
    }

    /// Pump responses until `done` holds or a second passes.
    fn pump_until(relay: &mut Relay<SharedGatt>, done: impl Fn(&Relay<SharedGatt>) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(1);
        while Instant::now() < deadline {
            relay.pump_responses();
            if done(&*relay) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_request_answered_by_attached_card() {
        let gatt = SharedGatt::default();
        let mut relay = start(gatt.clone());
        relay.attach_card(Box::new(SimulatedCard::always_ok())).unwrap();

        send_request(&mut relay, &[0x00, 0xA4, 0x04, 0x00, 0x00]);
        assert!(pump_until(&mut relay, |r| r.peripheral().has_pending_response()));
        assert_eq!(*gatt.notifications.lock().unwrap(), 1);

        relay
            .handle_gatt_event(GattEvent::CharacteristicRead {
                device: CENTRAL,
                request_id: 1000,
                characteristic: READ_RESPONSE_CHAR_UUID,
                offset: 0,
            })
            .unwrap();
        let (status, value) = gatt.reads.lock().unwrap()[0].clone();
        assert_eq!(status, GattStatus::Success);
        assert_eq!(value, vec![0, 1, 0, 1, 0x00, 0x01, 0x00, 0x02, 0x90, 0x00]);
    }

    #[test]
    fn test_request_waits_for_card() {
        let mut relay = start(SharedGatt::default());
        send_request(&mut relay, &[0x00, 0xB0, 0x00, 0x00]);
        assert!(pump_until(&mut relay, |r| r.pending_requests() == 1));
        assert!(!relay.peripheral().has_pending_response());

        relay.attach_card(Box::new(SimulatedCard::always_ok())).unwrap();
        assert!(pump_until(&mut relay, |r| r.peripheral().has_pending_response()));
        assert_eq!(relay.pending_requests(), 0);
    }

    #[test]
    fn test_failed_card_retried_on_kick() {
        let mut relay = start(SharedGatt::default());
        let mut failures = 1;
        relay
            .attach_card(Box::new(SimulatedCard::new(move |_| {
                if failures > 0 {
                    failures -= 1;
                    Err(CardError::io(io::ErrorKind::BrokenPipe, "tag lost"))
                } else {
                    Ok(vec![0x90, 0x00])
                }
            })))
            .unwrap();

        send_request(&mut relay, &[0x00, 0xA4, 0x04, 0x00]);
        assert!(pump_until(&mut relay, |r| r.pending_requests() == 1));

        relay.kick().unwrap();
        assert!(pump_until(&mut relay, |r| r.peripheral().has_pending_response()));
    }

    #[test]
    fn test_finish_drops_pending_requests() {
        let mut relay = start(SharedGatt::default());
        send_request(&mut relay, &[0x01]);
        send_request(&mut relay, &[0x02]);
        assert!(pump_until(&mut relay, |r| r.pending_requests() == 2));

        relay
            .handle_gatt_event(GattEvent::CharacteristicWrite {
                device: CENTRAL,
                request_id: 2,
                characteristic: CONVERSATION_FINISHED_CHAR_UUID,
                response_needed: false,
                offset: 0,
                value: vec![0; 4],
            })
            .unwrap();
        assert!(pump_until(&mut relay, |r| r.pending_requests() == 0));

        relay.attach_card(Box::new(SimulatedCard::always_ok())).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        relay.pump_responses();
        assert!(!relay.peripheral().has_pending_response());
    }

    #[test]
    fn test_finish_during_drain_abandons_queued_requests() {
        let mut relay = start(SharedGatt::default());
        let calls = Arc::new(Mutex::new(Vec::new()));
        let calls_clone = calls.clone();
        let (started_tx, started_rx) = bounded(8);
        relay
            .attach_card(Box::new(SimulatedCard::new(move |cmd| {
                calls_clone.lock().unwrap().push(cmd.to_vec());
                let _ = started_tx.try_send(());
                std::thread::sleep(Duration::from_millis(100));
                Ok(vec![0x90, 0x00])
            })))
            .unwrap();

        send_request(&mut relay, &[0x01]);
        send_request(&mut relay, &[0x02]);
        send_request(&mut relay, &[0x03]);
        started_rx.recv_timeout(Duration::from_secs(1)).unwrap();

        // Request 1 is at the card
        relay
            .handle_gatt_event(GattEvent::CharacteristicWrite {
                device: CENTRAL,
                request_id: 2,
                characteristic: CONVERSATION_FINISHED_CHAR_UUID,
                response_needed: false,
                offset: 0,
                value: vec![0; 4],
            })
            .unwrap();
        assert_eq!(relay.pending_requests(), 0);

        std::thread::sleep(Duration::from_millis(300));
        relay.pump_responses();
        assert_eq!(*calls.lock().unwrap(), vec![vec![0x01]]);
        assert!(!relay.peripheral().has_pending_response());

        // The next conversation still reaches the card
        send_request(&mut relay, &[0x04]);
        assert!(pump_until(&mut relay, |r| r.peripheral().has_pending_response()));
        assert_eq!(*calls.lock().unwrap(), vec![vec![0x01], vec![0x04]]);
    }

    #[test]
    fn test_run_stops_when_events_close() {
        let mut relay = Relay::start(SharedGatt::default(), &RelayConfig::default()).unwrap();
        let (tx, rx) = bounded(1);
        tx.send(GattEvent::MtuChanged {
            device: CENTRAL,
            mtu: 185,
        })
        .unwrap();
        drop(tx);
        assert_eq!(relay.run(rx), Ok(()));
    }
}
