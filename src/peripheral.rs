//! Peripheral side of the APDU relay.
//!
//! [`PeripheralConversation`] is the GATT state machine of the relay
//! service. It is driven by [`GattEvent`]s from the platform stack, answers
//! through a [`GattServer`], and talks to the card side over a bounded
//! channel of [`ConversationEvent`]s.
//!
//! # Session Lifecycle
//!
//! ```text
//! Write*  -> assembly buffer -> complete -> RequestAssembled(id) upstream
//! deliver_response(id) -> emitter -> NotifyReady
//! Read(ReadResponse)* -> one fragment per read until the emitter is exhausted
//! ConversationFinished write / disconnect -> reset, clear correlator,
//!                                            ConversationFinished upstream
//! ```
//!
//! Finishing clears the shared [`RequestCorrelator`] on the calling thread,
//! so queued card work is abandoned even while the card side is busy.
//!
//! At most one assembly buffer and one emitter exist at a time. Framing
//! errors reset the assembly buffer and are reported, never fatal to the
//! session.

use crate::ble::{
    AssemblyBuffer, CharacteristicRole, FragmentEmitter, FragmentationFormat, CCCD_UUID,
    FINISH_SENTINEL,
};
use crate::config::RelayConfig;
use crate::correlator::RequestCorrelator;
use crate::error::RelayError;
use crate::sequence::{self, ApduEnvelope};
use crossbeam_channel::Sender;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::fmt;
use zeroize::Zeroize;

/// Value sent on NotifyReady when a response is staged.
pub const NOTIFY_READY_VALUE: &[u8] = b"OK";

/// Identifier of a connected central.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:012X}", self.0)
    }
}

/// Status carried by a GATT response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    Failure,
}

impl GattStatus {
    /// ATT status code.
    pub fn code(self) -> u16 {
        match self {
            Self::Success => 0x0000,
            Self::Failure => 0x0101,
        }
    }
}

/// Failures reported by the GATT stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    /// The stack cannot accept the send right now.
    Busy,
    /// The target device is no longer connected.
    Disconnected,
    /// Any other stack failure.
    Stack(String),
}

impl fmt::Display for GattError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "GATT stack busy"),
            Self::Disconnected => write!(f, "device disconnected"),
            Self::Stack(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for GattError {}

/// Outbound half of the platform GATT server.
pub trait GattServer {
    /// Answer a read or write request.
    fn send_response(
        &mut self,
        device: DeviceId,
        request_id: u32,
        status: GattStatus,
        offset: u16,
        value: &[u8],
    ) -> Result<(), GattError>;

    /// Send a notification on a characteristic.
    fn notify(
        &mut self,
        device: DeviceId,
        role: CharacteristicRole,
        value: &[u8],
    ) -> Result<(), GattError>;
}

/// Callbacks from the platform GATT server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    ConnectionStateChanged {
        device: DeviceId,
        connected: bool,
    },
    CharacteristicWrite {
        device: DeviceId,
        request_id: u32,
        characteristic: u128,
        response_needed: bool,
        offset: u16,
        value: Vec<u8>,
    },
    CharacteristicRead {
        device: DeviceId,
        request_id: u32,
        characteristic: u128,
        offset: u16,
    },
    DescriptorRead {
        device: DeviceId,
        request_id: u32,
        descriptor: u128,
        offset: u16,
        /// Current descriptor value held by the stack.
        value: Vec<u8>,
    },
    DescriptorWrite {
        device: DeviceId,
        request_id: u32,
        descriptor: u128,
        response_needed: bool,
        offset: u16,
        value: Vec<u8>,
    },
    ExecuteWrite {
        device: DeviceId,
        request_id: u32,
        execute: bool,
    },
    MtuChanged {
        device: DeviceId,
        mtu: u16,
    },
    NotificationSent {
        device: DeviceId,
        status: GattStatus,
    },
}

/// Events handed to the card side.
#[derive(Debug, PartialEq, Eq)]
pub enum ConversationEvent {
    /// A complete request was reassembled and decoded.
    RequestAssembled { id: u64, request: ApduEnvelope },
    /// The central ended the conversation or the link dropped. The
    /// correlator has already been cleared when this arrives.
    ConversationFinished,
}

/// Per-link buffers.
#[derive(Debug, Default)]
struct ConversationSession {
    assembly: Option<AssemblyBuffer>,
    emitter: Option<FragmentEmitter>,
}

impl ConversationSession {
    fn reset_assembly(&mut self) {
        if let Some(mut assembly) = self.assembly.take() {
            assembly.clear();
        }
    }

    fn reset(&mut self) {
        self.reset_assembly();
        self.emitter = None;
    }

    fn is_idle(&self) -> bool {
        self.assembly.is_none() && self.emitter.is_none()
    }
}

/// GATT state machine of the relay service.
pub struct PeripheralConversation<G> {
    gatt: G,
    format: FragmentationFormat,
    capacity: usize,
    ack_retry_attempts: u32,
    correlator: RequestCorrelator,
    upstream: Sender<ConversationEvent>,
    session: ConversationSession,
    connected: Option<DeviceId>,
    outstanding: HashSet<u64>,
}

impl<G: GattServer> PeripheralConversation<G> {
    /// Create a conversation serving `gatt`.
    ///
    /// Request ids are minted from the correlator's id source, which is
    /// cleared when the conversation ends; assembled requests and
    /// conversation resets are sent on `upstream`.
    pub fn new(
        gatt: G,
        config: &RelayConfig,
        correlator: RequestCorrelator,
        upstream: Sender<ConversationEvent>,
    ) -> Result<Self, RelayError> {
        config.validate()?;
        Ok(Self {
            gatt,
            format: config.format,
            capacity: config.capacity,
            ack_retry_attempts: config.ack_retry_attempts,
            correlator,
            upstream,
            session: ConversationSession::default(),
            connected: None,
            outstanding: HashSet::new(),
        })
    }

    /// Fragment capacity served on MaxMemory.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fragmentation format in use.
    pub fn format(&self) -> FragmentationFormat {
        self.format
    }

    /// The central that receives notifications.
    pub fn connected_device(&self) -> Option<DeviceId> {
        self.connected
    }

    /// True while a response is staged for reading.
    pub fn has_pending_response(&self) -> bool {
        self.session.emitter.is_some()
    }

    /// True while a request is partially received.
    pub fn is_assembling(&self) -> bool {
        self.session.assembly.is_some()
    }

    /// True if `id` was handed upstream and not yet answered.
    pub fn is_outstanding(&self, id: u64) -> bool {
        self.outstanding.contains(&id)
    }

    /// The GATT server.
    pub fn gatt(&self) -> &G {
        &self.gatt
    }

    /// Mutable access to the GATT server.
    pub fn gatt_mut(&mut self) -> &mut G {
        &mut self.gatt
    }

    /// Process one stack callback.
    pub fn handle_event(&mut self, event: GattEvent) -> Result<(), RelayError> {
        match event {
            GattEvent::ConnectionStateChanged { device, connected } => {
                self.on_connection_state(device, connected)
            }
            GattEvent::CharacteristicWrite {
                device,
                request_id,
                characteristic,
                response_needed,
                offset,
                value,
            } => self.on_write(device, request_id, characteristic, response_needed, offset, value),
            GattEvent::CharacteristicRead {
                device,
                request_id,
                characteristic,
                offset,
            } => self.on_read(device, request_id, characteristic, offset),
            GattEvent::DescriptorRead {
                device,
                request_id,
                descriptor,
                offset,
                value,
            } => {
                debug!("Descriptor read {:032x} from {}", descriptor, device);
                self.respond(device, request_id, GattStatus::Success, offset, &value)?;
                Ok(())
            }
            GattEvent::DescriptorWrite {
                device,
                request_id,
                descriptor,
                response_needed,
                offset,
                value,
            } => {
                if descriptor == CCCD_UUID {
                    let enabled = value.first().is_some_and(|b| b & 0x01 != 0);
                    info!(
                        "Notifications {} by {}",
                        if enabled { "enabled" } else { "disabled" },
                        device
                    );
                } else {
                    debug!("Descriptor write {:032x} from {}", descriptor, device);
                }
                if response_needed {
                    self.respond(device, request_id, GattStatus::Success, offset, &value)?;
                }
                Ok(())
            }
            GattEvent::ExecuteWrite {
                device,
                request_id,
                execute,
            } => {
                debug!("Execute write (execute={}) from {}", execute, device);
                self.respond(device, request_id, GattStatus::Success, 0, &[])?;
                Ok(())
            }
            GattEvent::MtuChanged { device, mtu } => {
                info!("MTU for {} changed to {}", device, mtu);
                Ok(())
            }
            GattEvent::NotificationSent { device, status } => {
                match status {
                    GattStatus::Success => debug!("Notification delivered to {}", device),
                    GattStatus::Failure => warn!("Notification to {} failed", device),
                }
                Ok(())
            }
        }
    }

    /// Stage the card response for request `id` and notify the central.
    pub fn deliver_response(&mut self, id: u64, response: ApduEnvelope) -> Result<(), RelayError> {
        if !self.outstanding.remove(&id) {
            warn!("Discarding response for request {}: not outstanding", id);
            return Err(RelayError::StaleResponse { id });
        }

        let mut blob = sequence::encode(&response)?;
        let emitter = self.format.fragmenter(self.capacity, &blob);
        blob.zeroize();
        self.session.emitter = Some(emitter?);
        info!("Response for request {} staged ({} APDUs)", id, response.len());

        let Some(device) = self.connected else {
            warn!("Response ready but no central connected");
            return Err(RelayError::NotConnected);
        };
        if let Err(e) = self
            .gatt
            .notify(device, CharacteristicRole::NotifyReady, NOTIFY_READY_VALUE)
        {
            error!("Failed to notify {}: {}", device, e);
            return Err(e.into());
        }
        Ok(())
    }

    /// Reset the session, abandon queued card work and tell the card side
    /// the conversation is over.
    ///
    /// Safe to call any number of times.
    pub fn force_finish(&mut self) -> Result<(), RelayError> {
        if !self.session.is_idle() || !self.outstanding.is_empty() {
            info!("Finishing conversation");
        }
        self.session.reset();
        self.outstanding.clear();
        self.correlator.clear();
        self.upstream
            .send(ConversationEvent::ConversationFinished)
            .map_err(|_| RelayError::ChannelClosed)
    }

    fn on_connection_state(&mut self, device: DeviceId, connected: bool) -> Result<(), RelayError> {
        if connected {
            info!("Central {} connected", device);
            if let Some(previous) = self.connected.replace(device) {
                if previous != device {
                    warn!("Central {} replaces {}", device, previous);
                    return self.force_finish();
                }
            }
            Ok(())
        } else {
            info!("Central {} disconnected", device);
            match self.connected {
                Some(current) if current != device => {
                    debug!("{} is not the current central, session kept", device);
                    Ok(())
                }
                _ => {
                    self.connected = None;
                    self.force_finish()
                }
            }
        }
    }

    fn on_write(
        &mut self,
        device: DeviceId,
        request_id: u32,
        characteristic: u128,
        response_needed: bool,
        offset: u16,
        mut value: Vec<u8>,
    ) -> Result<(), RelayError> {
        if response_needed {
            if let Err(e) = self.respond(device, request_id, GattStatus::Success, offset, &value) {
                error!("Failed to acknowledge write from {}: {}", device, e);
            }
        }

        let result = match CharacteristicRole::from_uuid(characteristic) {
            _ if offset != 0 => {
                warn!("Ignoring write at offset {} (long writes unsupported)", offset);
                Err(RelayError::UnsupportedOperation(format!(
                    "write at offset {}",
                    offset
                )))
            }
            Some(CharacteristicRole::Write) => self.append_request_packet(&value),
            Some(CharacteristicRole::ConversationFinished) => {
                if value != FINISH_SENTINEL {
                    debug!("Finish marker {} (expected 00000000)", hex::encode_upper(&value));
                }
                self.force_finish()
            }
            Some(role) => {
                warn!("Write to {} is not supported", role);
                Err(RelayError::UnsupportedOperation(format!("write to {}", role)))
            }
            None => {
                warn!("Write to unknown characteristic {:032x}", characteristic);
                Err(RelayError::UnsupportedOperation(format!(
                    "write to {:032x}",
                    characteristic
                )))
            }
        };
        value.zeroize();
        result
    }

    fn append_request_packet(&mut self, packet: &[u8]) -> Result<(), RelayError> {
        debug!("Request packet received ({} bytes)", packet.len());
        let format = self.format;
        let assembly = self.session.assembly.get_or_insert_with(|| format.defragmenter());

        if let Err(e) = assembly.append_packet(packet) {
            error!("Dropping partial request: {}", e);
            self.session.reset_assembly();
            return Err(e.into());
        }
        if !assembly.is_complete() {
            return Ok(());
        }

        let mut blob = assembly.take_blob();
        self.session.assembly = None;
        let decoded = sequence::decode(&blob);
        blob.zeroize();

        let request = match decoded {
            Ok(request) => request,
            Err(e) => {
                error!("Rejecting request: {}", e);
                return Err(e.into());
            }
        };

        let id = self.correlator.ids().next_id();
        self.outstanding.insert(id);
        info!("Request {} assembled ({} APDUs), sending to card", id, request.len());
        self.upstream
            .send(ConversationEvent::RequestAssembled { id, request })
            .map_err(|_| RelayError::ChannelClosed)
    }

    fn on_read(
        &mut self,
        device: DeviceId,
        request_id: u32,
        characteristic: u128,
        offset: u16,
    ) -> Result<(), RelayError> {
        match CharacteristicRole::from_uuid(characteristic) {
            Some(CharacteristicRole::ReadResponse) => {
                let fragment = self
                    .session
                    .emitter
                    .as_mut()
                    .and_then(FragmentEmitter::next_fragment);
                let Some(fragment) = fragment else {
                    warn!("Read of response with nothing staged");
                    self.session.emitter = None;
                    self.respond(device, request_id, GattStatus::Failure, offset, &[])?;
                    return Ok(());
                };
                if self
                    .session
                    .emitter
                    .as_ref()
                    .is_some_and(FragmentEmitter::is_exhausted)
                {
                    debug!("Last response fragment served");
                    self.session.emitter = None;
                }
                self.respond(device, request_id, GattStatus::Success, offset, &fragment)?;
                Ok(())
            }
            Some(CharacteristicRole::MaxMemory) => {
                let capacity = u32::try_from(self.capacity).unwrap_or(u32::MAX);
                debug!("Serving capacity {} to {}", capacity, device);
                self.respond(
                    device,
                    request_id,
                    GattStatus::Success,
                    offset,
                    &capacity.to_be_bytes(),
                )?;
                Ok(())
            }
            other => {
                let name = other
                    .map(|role| role.to_string())
                    .unwrap_or_else(|| format!("{:032x}", characteristic));
                warn!("Read of {} is not supported", name);
                self.respond(device, request_id, GattStatus::Failure, offset, &[])?;
                Err(RelayError::UnsupportedOperation(format!("read of {}", name)))
            }
        }
    }

    /// Send a GATT response, retrying while the stack reports busy.
    fn respond(
        &mut self,
        device: DeviceId,
        request_id: u32,
        status: GattStatus,
        offset: u16,
        value: &[u8],
    ) -> Result<(), GattError> {
        let mut attempt = 1;
        loop {
            match self.gatt.send_response(device, request_id, status, offset, value) {
                Err(GattError::Busy) if attempt < self.ack_retry_attempts => {
                    debug!(
                        "GATT busy answering request {}, retry {}/{}",
                        request_id, attempt, self.ack_retry_attempts
                    );
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

impl<G> fmt::Debug for PeripheralConversation<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeripheralConversation")
            .field("format", &self.format)
            .field("capacity", &self.capacity)
            .field("connected", &self.connected)
            .field("session", &self.session)
            .field("outstanding", &self.outstanding.len())
            .finish()
    }
}
