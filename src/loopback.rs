//! In-process loopback between a client and a relay peripheral.
//!
//! [`LoopbackLink`] implements [`CentralLink`] by turning every central
//! operation into the [`GattEvent`] the platform stack would raise on the
//! peripheral, and by routing the peripheral's GATT responses and
//! notifications back. The relay runs on its own thread, exactly as it would
//! behind a real radio.
//!
//! # Example
//!
//! ```
//! use apdu_ble_relay::card::SimulatedCard;
//! use apdu_ble_relay::loopback::LoopbackLink;
//! use apdu_ble_relay::{ClientConversation, RelayConfig};
//!
//! let config = RelayConfig::default();
//! let link = LoopbackLink::spawn(&config, Box::new(SimulatedCard::always_ok())).unwrap();
//! let mut client = ClientConversation::new(link, &config).unwrap();
//! client.connect().unwrap();
//! assert_eq!(client.transceive_one(&[0x00, 0xA4, 0x04, 0x00, 0x00]).unwrap(), vec![0x90, 0x00]);
//! ```

use crate::ble::{CharacteristicRole, CCCD_UUID};
use crate::card::CardTransport;
use crate::client::{CentralLink, ConnectSignal, LinkError, ReadCompletion};
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::peripheral::{DeviceId, GattError, GattEvent, GattServer, GattStatus};
use crate::relay::Relay;
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error};
use std::thread::JoinHandle;

/// Device id the loopback central appears as.
pub const LOOPBACK_DEVICE: DeviceId = DeviceId(0x00_00_5E_00_53_01);

/// Depth of the notification channel.
const NOTIFICATION_DEPTH: usize = 4;

/// GATT response travelling back to the central.
#[derive(Debug)]
struct GattReply {
    request_id: u32,
    status: GattStatus,
    value: Vec<u8>,
}

/// Peripheral-side GATT server of the loopback.
struct LoopbackGatt {
    replies: Sender<GattReply>,
    notifications: Sender<Vec<u8>>,
}

impl GattServer for LoopbackGatt {
    fn send_response(
        &mut self,
        _device: DeviceId,
        request_id: u32,
        status: GattStatus,
        _offset: u16,
        value: &[u8],
    ) -> std::result::Result<(), GattError> {
        self.replies
            .send(GattReply {
                request_id,
                status,
                value: value.to_vec(),
            })
            .map_err(|_| GattError::Disconnected)
    }

    fn notify(
        &mut self,
        _device: DeviceId,
        _role: CharacteristicRole,
        value: &[u8],
    ) -> std::result::Result<(), GattError> {
        self.notifications
            .try_send(value.to_vec())
            .map_err(|_| GattError::Busy)
    }
}

/// Central link wired to an in-process relay.
pub struct LoopbackLink {
    events: Option<Sender<GattEvent>>,
    replies: Receiver<GattReply>,
    notifications: Receiver<Vec<u8>>,
    next_request_id: u32,
    connected: bool,
    relay: Option<JoinHandle<Result<()>>>,
}

impl LoopbackLink {
    /// Start a relay with `card` attached and return a link to it.
    pub fn spawn(config: &RelayConfig, card: Box<dyn CardTransport>) -> Result<Self> {
        let (event_tx, event_rx) = bounded(config.channel_depth);
        let (reply_tx, reply_rx) = bounded(config.channel_depth);
        let (notify_tx, notify_rx) = bounded(NOTIFICATION_DEPTH);

        let gatt = LoopbackGatt {
            replies: reply_tx,
            notifications: notify_tx,
        };
        let mut relay = Relay::start(gatt, config)?;
        relay.attach_card(card)?;

        let handle = std::thread::Builder::new()
            .name("loopback-relay".into())
            .spawn(move || relay.run(event_rx))
            .map_err(|e| RelayError::thread_spawn("loopback-relay", e))?;

        Ok(Self {
            events: Some(event_tx),
            replies: reply_rx,
            notifications: notify_rx,
            next_request_id: 0,
            connected: false,
            relay: Some(handle),
        })
    }

    fn post(&self, event: GattEvent) -> std::result::Result<(), LinkError> {
        self.events
            .as_ref()
            .ok_or(LinkError::Disconnected)?
            .send(event)
            .map_err(|_| LinkError::Disconnected)
    }

    fn next_request_id(&mut self) -> u32 {
        self.next_request_id = self.next_request_id.wrapping_add(1);
        self.next_request_id
    }

    /// Post `event` and wait for the GATT response to `request_id`.
    fn request(
        &mut self,
        request_id: u32,
        event: GattEvent,
    ) -> std::result::Result<Vec<u8>, LinkError> {
        if !self.connected {
            return Err(LinkError::Disconnected);
        }
        self.post(event)?;
        loop {
            let reply = self.replies.recv().map_err(|_| LinkError::Disconnected)?;
            if reply.request_id != request_id {
                debug!("Skipping reply to request {}", reply.request_id);
                continue;
            }
            return match reply.status {
                GattStatus::Success => Ok(reply.value),
                status => Err(LinkError::Rejected {
                    status: status.code(),
                }),
            };
        }
    }
}

impl CentralLink for LoopbackLink {
    fn open(&mut self, done: ConnectSignal) -> std::result::Result<(), LinkError> {
        self.post(GattEvent::ConnectionStateChanged {
            device: LOOPBACK_DEVICE,
            connected: true,
        })?;
        self.connected = true;
        let _ = done.send(Ok(()));
        Ok(())
    }

    fn read(&mut self, role: CharacteristicRole) -> std::result::Result<ReadCompletion, LinkError> {
        let request_id = self.next_request_id();
        let result = self.request(
            request_id,
            GattEvent::CharacteristicRead {
                device: LOOPBACK_DEVICE,
                request_id,
                characteristic: role.uuid(),
                offset: 0,
            },
        );
        let (tx, rx) = bounded(1);
        let _ = tx.send(result);
        Ok(rx)
    }

    fn write(
        &mut self,
        role: CharacteristicRole,
        value: &[u8],
    ) -> std::result::Result<(), LinkError> {
        let request_id = self.next_request_id();
        self.request(
            request_id,
            GattEvent::CharacteristicWrite {
                device: LOOPBACK_DEVICE,
                request_id,
                characteristic: role.uuid(),
                response_needed: true,
                offset: 0,
                value: value.to_vec(),
            },
        )
        .map(|_| ())
    }

    fn subscribe(
        &mut self,
        _role: CharacteristicRole,
    ) -> std::result::Result<Receiver<Vec<u8>>, LinkError> {
        let request_id = self.next_request_id();
        self.request(
            request_id,
            GattEvent::DescriptorWrite {
                device: LOOPBACK_DEVICE,
                request_id,
                descriptor: CCCD_UUID,
                response_needed: true,
                offset: 0,
                value: vec![0x01, 0x00],
            },
        )?;
        Ok(self.notifications.clone())
    }

    fn release(&mut self) {
        if self.connected {
            self.connected = false;
            let _ = self.post(GattEvent::ConnectionStateChanged {
                device: LOOPBACK_DEVICE,
                connected: false,
            });
        }
    }
}

impl Drop for LoopbackLink {
    fn drop(&mut self) {
        self.release();
        // Closing the event channel stops the relay
        self.events = None;
        if let Some(handle) = self.relay.take() {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Loopback relay failed: {}", e),
                Err(_) => error!("Loopback relay panicked"),
            }
        }
    }
}
