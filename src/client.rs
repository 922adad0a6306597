//! Central side of the APDU relay.
//!
//! [`ClientConversation`] drives a remote relay peripheral through a
//! [`CentralLink`] and presents it as an APDU transport:
//!
//! ```text
//! Idle -> Connecting -> Negotiating -> Ready -> (Sending <-> Receiving) -> Closed
//! ```
//!
//! `connect` is bounded by the connect timeout, then probes MaxMemory for
//! the fragment capacity (bounded by the probe timeout, falling back to the
//! configured capacity). `transceive` writes every request fragment, waits
//! for NotifyReady, and reads ReadResponse until the response is complete.
//! It has no internal timeout.

use crate::ble::{CharacteristicRole, FragmentationFormat, FINISH_SENTINEL};
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::sequence::{self, ApduEnvelope};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, error, info, warn};
use std::fmt;
use std::time::Duration;
use zeroize::Zeroize;

/// Depth of each error subscriber's channel.
const ERROR_SUBSCRIBER_DEPTH: usize = 8;

/// One-shot completion of a link open.
pub type ConnectSignal = Sender<std::result::Result<(), LinkError>>;

/// Completion of a single characteristic read.
pub type ReadCompletion = Receiver<std::result::Result<Vec<u8>, LinkError>>;

/// Central-side GATT operations on the relay service.
pub trait CentralLink {
    /// Start opening the link. The outcome is sent on `done` once known.
    fn open(&mut self, done: ConnectSignal) -> std::result::Result<(), LinkError>;

    /// Start reading a characteristic. The value arrives on the returned receiver.
    fn read(&mut self, role: CharacteristicRole) -> std::result::Result<ReadCompletion, LinkError>;

    /// Write a characteristic and wait for the acknowledgement.
    fn write(&mut self, role: CharacteristicRole, value: &[u8])
        -> std::result::Result<(), LinkError>;

    /// Enable notifications on a characteristic.
    fn subscribe(
        &mut self,
        role: CharacteristicRole,
    ) -> std::result::Result<Receiver<Vec<u8>>, LinkError>;

    /// Tear the link down.
    fn release(&mut self);
}

/// Central link failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The peripheral went away.
    Disconnected,
    /// The peripheral answered with a failure status.
    Rejected { status: u16 },
    /// The platform stack failed.
    Stack(String),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "peripheral disconnected"),
            Self::Rejected { status } => write!(f, "request rejected (status 0x{:04X})", status),
            Self::Stack(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for LinkError {}

/// Client conversation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connecting,
    Negotiating,
    Ready,
    Sending,
    Receiving,
    Closed,
}

/// APDU transport over a remote relay peripheral.
pub struct ClientConversation<L: CentralLink> {
    link: L,
    format: FragmentationFormat,
    connect_timeout: Duration,
    probe_timeout: Duration,
    fallback_capacity: usize,
    capacity: usize,
    state: ClientState,
    notifications: Option<Receiver<Vec<u8>>>,
    error_subscribers: Vec<Sender<RelayError>>,
}

impl<L: CentralLink> ClientConversation<L> {
    /// Create an idle conversation over `link`.
    pub fn new(link: L, config: &RelayConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            link,
            format: config.format,
            connect_timeout: config.connect_timeout(),
            probe_timeout: config.probe_timeout(),
            fallback_capacity: config.fallback_capacity,
            capacity: config.fallback_capacity,
            state: ClientState::Idle,
            notifications: None,
            error_subscribers: Vec::new(),
        })
    }

    /// Current state.
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// True once connected and until closed.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            ClientState::Ready | ClientState::Sending | ClientState::Receiving
        )
    }

    /// Fragment capacity negotiated with the peripheral.
    pub fn max_transceive_length(&self) -> usize {
        self.capacity
    }

    /// Connect timeout.
    pub fn timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Change the connect timeout used by the next [`connect`](Self::connect).
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.connect_timeout = timeout;
    }

    /// The underlying link.
    pub fn link(&self) -> &L {
        &self.link
    }

    /// Receive every failed transceive until the receiver is dropped.
    pub fn subscribe_errors(&mut self) -> Receiver<RelayError> {
        let (tx, rx) = bounded(ERROR_SUBSCRIBER_DEPTH);
        self.error_subscribers.push(tx);
        rx
    }

    /// Open the link and negotiate the fragment capacity.
    pub fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        self.state = ClientState::Connecting;
        info!("Connecting (timeout {} ms)", self.connect_timeout.as_millis());

        let (done_tx, done_rx) = bounded(1);
        if let Err(e) = self.link.open(done_tx) {
            return Err(self.abort_connect(e.into()));
        }
        match done_rx.recv_timeout(self.connect_timeout) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(self.abort_connect(e.into())),
            Err(RecvTimeoutError::Timeout) => {
                let waited = self.connect_timeout;
                return Err(self.abort_connect(RelayError::HandshakeTimeout { waited }));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(self.abort_connect(LinkError::Disconnected.into()))
            }
        }

        self.state = ClientState::Negotiating;
        self.capacity = self.probe_capacity();

        match self.link.subscribe(CharacteristicRole::NotifyReady) {
            Ok(rx) => self.notifications = Some(rx),
            Err(e) => return Err(self.abort_connect(e.into())),
        }

        self.state = ClientState::Ready;
        info!("Connected, capacity {} bytes", self.capacity);
        Ok(())
    }

    fn abort_connect(&mut self, err: RelayError) -> RelayError {
        error!("Connect failed: {}", err);
        self.link.release();
        self.state = ClientState::Idle;
        err
    }

    /// Read MaxMemory, falling back on any failure.
    fn probe_capacity(&mut self) -> usize {
        let completion = match self.link.read(CharacteristicRole::MaxMemory) {
            Ok(rx) => rx,
            Err(e) => {
                warn!("Capacity probe failed: {}, using {}", e, self.fallback_capacity);
                return self.fallback_capacity;
            }
        };

        let value = match completion.recv_timeout(self.probe_timeout) {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                warn!("Capacity probe failed: {}, using {}", e, self.fallback_capacity);
                return self.fallback_capacity;
            }
            Err(_) => {
                warn!(
                    "Capacity probe timed out after {} ms, using {}",
                    self.probe_timeout.as_millis(),
                    self.fallback_capacity
                );
                return self.fallback_capacity;
            }
        };

        let Ok(bytes) = <[u8; 4]>::try_from(value.as_slice()) else {
            warn!(
                "Malformed capacity {}, using {}",
                hex::encode_upper(&value),
                self.fallback_capacity
            );
            return self.fallback_capacity;
        };
        let probed = u32::from_be_bytes(bytes) as usize;
        if probed < self.format.min_capacity() {
            warn!(
                "Capacity {} unusable for {} format, using {}",
                probed, self.format, self.fallback_capacity
            );
            return self.fallback_capacity;
        }
        if probed > self.fallback_capacity {
            debug!("Capacity {} clamped to {}", probed, self.fallback_capacity);
        }
        probed.min(self.fallback_capacity)
    }

    /// Send a sequence of command APDUs and return the responses in order.
    pub fn transceive(&mut self, commands: &ApduEnvelope) -> Result<ApduEnvelope> {
        if !self.is_connected() {
            return Err(RelayError::NotConnected);
        }
        match self.exchange(commands) {
            Ok(responses) => {
                self.state = ClientState::Ready;
                Ok(responses)
            }
            Err(e) => {
                warn!("Transceive failed: {}", e);
                if e == RelayError::Link(LinkError::Disconnected) {
                    self.shutdown();
                } else {
                    self.state = ClientState::Ready;
                }
                self.report_error(&e);
                Err(e)
            }
        }
    }

    fn exchange(&mut self, commands: &ApduEnvelope) -> Result<ApduEnvelope> {
        commands.check_limits()?;
        let mut blob = sequence::encode(commands)?;
        let emitter = self.format.fragmenter(self.capacity, &blob);
        blob.zeroize();
        let emitter = emitter?;

        let notifications = self
            .notifications
            .clone()
            .ok_or(RelayError::NotConnected)?;
        let stale = notifications.try_iter().count();
        if stale > 0 {
            debug!("Discarded {} stale notifications", stale);
        }

        self.state = ClientState::Sending;
        let mut fragments = 0;
        for fragment in emitter {
            self.link.write(CharacteristicRole::Write, &fragment)?;
            fragments += 1;
        }
        debug!("Request sent in {} fragments ({} APDUs)", fragments, commands.len());

        self.state = ClientState::Receiving;
        notifications
            .recv()
            .map_err(|_| RelayError::Link(LinkError::Disconnected))?;

        let mut assembly = self.format.defragmenter();
        while !assembly.is_complete() {
            let completion = self.link.read(CharacteristicRole::ReadResponse)?;
            let value = completion
                .recv()
                .map_err(|_| RelayError::Link(LinkError::Disconnected))??;
            assembly.append_packet(&value)?;
        }

        let mut blob = assembly.take_blob();
        let responses = sequence::decode(&blob);
        blob.zeroize();
        let responses = responses?;
        debug!("Received {} response APDUs", responses.len());
        Ok(responses)
    }

    /// Send one command APDU and return its response.
    pub fn transceive_one(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        let responses = self.transceive(&ApduEnvelope::from(vec![command.to_vec()]))?;
        if responses.len() != 1 {
            let err = RelayError::ResponseCountMismatch {
                expected: 1,
                actual: responses.len(),
            };
            self.report_error(&err);
            return Err(err);
        }
        let mut apdus = responses.into_inner();
        apdus.pop().ok_or(RelayError::ResponseCountMismatch {
            expected: 1,
            actual: 0,
        })
    }

    /// Send one command APDU and check the response status word.
    ///
    /// Entries of `accepted` above `0xFF` are full status words; smaller
    /// entries match SW1 only (`0x61` accepts any `61XX`).
    pub fn transceive_expecting(&mut self, command: &[u8], accepted: &[u16]) -> Result<Vec<u8>> {
        let response = self.transceive_one(command)?;
        if status_accepted(&response, accepted) {
            Ok(response)
        } else {
            let err = RelayError::UnexpectedStatus { response };
            self.report_error(&err);
            Err(err)
        }
    }

    /// End the conversation and release the link. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.is_connected() {
            if let Err(e) = self
                .link
                .write(CharacteristicRole::ConversationFinished, &FINISH_SENTINEL)
            {
                warn!("Could not signal conversation end: {}", e);
            }
            info!("Conversation closed");
        }
        if self.state != ClientState::Closed {
            self.shutdown();
        }
    }

    fn shutdown(&mut self) {
        self.link.release();
        self.notifications = None;
        self.state = ClientState::Closed;
    }

    fn report_error(&mut self, err: &RelayError) {
        self.error_subscribers
            .retain(|tx| match tx.try_send(err.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    debug!("Error subscriber lagging, report dropped");
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            });
    }
}

impl<L: CentralLink> Drop for ClientConversation<L> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<L: CentralLink> fmt::Debug for ClientConversation<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConversation")
            .field("format", &self.format)
            .field("state", &self.state)
            .field("capacity", &self.capacity)
            .finish()
    }
}

fn status_accepted(response: &[u8], accepted: &[u16]) -> bool {
    let [.., sw1, sw2] = response else {
        return false;
    };
    let sw = u16::from_be_bytes([*sw1, *sw2]);
    accepted.iter().any(|&expected| {
        if expected <= 0xFF {
            u16::from(*sw1) == expected
        } else {
            sw == expected
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::Fragment;
    use std::collections::VecDeque;

    /// Scripted peripheral: records writes, answers reads from queues.
    #[derive(Default)]
    struct ScriptedLink {
        connect: Option<std::result::Result<(), LinkError>>,
        max_memory: Option<std::result::Result<Vec<u8>, LinkError>>,
        responses: VecDeque<Vec<u8>>,
        notify_tx: Option<Sender<Vec<u8>>>,
        notify_on_write: bool,
        written: Vec<(CharacteristicRole, Vec<u8>)>,
        released: usize,
    }

    impl ScriptedLink {
        fn ready(max_memory: &[u8]) -> Self {
            Self {
                connect: Some(Ok(())),
                max_memory: Some(Ok(max_memory.to_vec())),
                notify_on_write: true,
                ..Self::default()
            }
        }
    }

    impl CentralLink for ScriptedLink {
        fn open(&mut self, done: ConnectSignal) -> std::result::Result<(), LinkError> {
            if let Some(result) = self.connect.clone() {
                let _ = done.send(result);
            } else {
                // Never completes: keep the sender alive past the timeout
                std::mem::forget(done);
            }
            Ok(())
        }

        fn read(&mut self, role: CharacteristicRole) -> std::result::Result<ReadCompletion, LinkError> {
            let (tx, rx) = bounded(1);
            match role {
                CharacteristicRole::MaxMemory => match self.max_memory.clone() {
                    Some(result) => {
                        let _ = tx.send(result);
                    }
                    None => std::mem::forget(tx),
                },
                CharacteristicRole::ReadResponse => {
                    let value = self
                        .responses
                        .pop_front()
                        .ok_or(LinkError::Rejected { status: 0x0101 });
                    let _ = tx.send(value);
                }
                _ => return Err(LinkError::Rejected { status: 0x0101 }),
            }
            Ok(rx)
        }

        fn write(
            &mut self,
            role: CharacteristicRole,
            value: &[u8],
        ) -> std::result::Result<(), LinkError> {
            self.written.push((role, value.to_vec()));
            if role == CharacteristicRole::Write && self.notify_on_write {
                if let Some(tx) = &self.notify_tx {
                    let _ = tx.try_send(b"OK".to_vec());
                }
            }
            Ok(())
        }

        fn subscribe(
            &mut self,
            _role: CharacteristicRole,
        ) -> std::result::Result<Receiver<Vec<u8>>, LinkError> {
            let (tx, rx) = bounded(4);
            self.notify_tx = Some(tx);
            Ok(rx)
        }

        fn release(&mut self) {
            self.released += 1;
            self.notify_tx = None;
        }
    }

    fn fast_config() -> RelayConfig {
        RelayConfig {
            connect_timeout_ms: 50,
            probe_timeout_ms: 50,
            ..RelayConfig::default()
        }
    }

    fn connected(link: ScriptedLink) -> ClientConversation<ScriptedLink> {
        let mut client = ClientConversation::new(link, &fast_config()).unwrap();
        client.connect().unwrap();
        client
    }

    /// Response fragments for `envelope` at `capacity`.
    fn response_fragments(envelope: &ApduEnvelope, capacity: usize) -> VecDeque<Vec<u8>> {
        let blob = sequence::encode(envelope).unwrap();
        FragmentationFormat::Sequenced
            .fragmenter(capacity, &blob)
            .unwrap()
            .collect()
    }

    // ==================== Connect Tests ====================

    #[test]
    fn test_connect_uses_probed_capacity() {
        let client = connected(ScriptedLink::ready(&[0x00, 0x00, 0x00, 0x14]));
        assert_eq!(client.state(), ClientState::Ready);
        assert!(client.is_connected());
        assert_eq!(client.max_transceive_length(), 20);
    }

    #[test]
    fn test_connect_timeout_is_handshake_timeout() {
        let link = ScriptedLink::default();
        let mut client = ClientConversation::new(link, &fast_config()).unwrap();

        let err = client.connect().unwrap_err();
        assert_eq!(
            err,
            RelayError::HandshakeTimeout {
                waited: Duration::from_millis(50)
            }
        );
        assert_eq!(client.state(), ClientState::Idle);
        assert_eq!(client.link().released, 1);
    }

    #[test]
    fn test_connect_failure_reported() {
        let link = ScriptedLink {
            connect: Some(Err(LinkError::Stack("bond lost".into()))),
            ..ScriptedLink::default()
        };
        let mut client = ClientConversation::new(link, &fast_config()).unwrap();
        assert!(matches!(client.connect(), Err(RelayError::Link(_))));
        assert!(!client.is_connected());
    }

    #[test]
    fn test_probe_timeout_falls_back() {
        let link = ScriptedLink {
            connect: Some(Ok(())),
            max_memory: None,
            ..ScriptedLink::default()
        };
        let client = connected(link);
        assert_eq!(client.max_transceive_length(), 512);
    }

    #[test]
    fn test_probe_malformed_falls_back() {
        let client = connected(ScriptedLink::ready(&[0x02, 0x00]));
        assert_eq!(client.max_transceive_length(), 512);

        // Too small for the sequenced header
        let client = connected(ScriptedLink::ready(&[0x00, 0x00, 0x00, 0x04]));
        assert_eq!(client.max_transceive_length(), 512);
    }

    #[test]
    fn test_probe_clamped_to_fallback() {
        let client = connected(ScriptedLink::ready(&[0x00, 0x01, 0x00, 0x00]));
        assert_eq!(client.max_transceive_length(), 512);
    }

    #[test]
    fn test_set_timeout() {
        let mut client = ClientConversation::new(ScriptedLink::default(), &fast_config()).unwrap();
        assert_eq!(client.timeout(), Duration::from_millis(50));
        client.set_timeout(Duration::from_millis(10));
        assert_eq!(client.timeout(), Duration::from_millis(10));
    }

    // ==================== Transceive Tests ====================

    #[test]
    fn test_transceive_sends_fragments_and_reads_response() {
        let mut link = ScriptedLink::ready(&[0x00, 0x00, 0x00, 0x08]);
        let response = ApduEnvelope::from(vec![vec![0x6F, 0x10, 0x90, 0x00]]);
        link.responses = response_fragments(&response, 8);
        let mut client = connected(link);

        let commands = ApduEnvelope::from(vec![vec![0x00, 0xA4, 0x04, 0x00, 0x00]]);
        assert_eq!(client.transceive(&commands).unwrap(), response);
        assert_eq!(client.state(), ClientState::Ready);

        // 9-byte blob at 4 payload bytes per fragment
        let writes: Vec<&Vec<u8>> = client
            .link()
            .written
            .iter()
            .filter(|(role, _)| *role == CharacteristicRole::Write)
            .map(|(_, v)| v)
            .collect();
        assert_eq!(writes.len(), 3);
        assert_eq!(Fragment::from_bytes(writes[2]).unwrap().sequence, 3);
    }

    #[test]
    fn test_transceive_one_count_mismatch() {
        let mut link = ScriptedLink::ready(&[0x00, 0x00, 0x02, 0x00]);
        link.responses = response_fragments(
            &ApduEnvelope::from(vec![vec![0x90, 0x00], vec![0x90, 0x00]]),
            512,
        );
        let mut client = connected(link);

        assert_eq!(
            client.transceive_one(&[0x00, 0xB0, 0x00, 0x00]),
            Err(RelayError::ResponseCountMismatch {
                expected: 1,
                actual: 2
            })
        );
    }

    #[test]
    fn test_transceive_rejects_oversized_request() {
        let mut client = connected(ScriptedLink::ready(&[0x00, 0x00, 0x02, 0x00]));
        let too_long = ApduEnvelope::from(vec![vec![0x00; 256]]);
        assert!(matches!(
            client.transceive(&too_long),
            Err(RelayError::SequenceLimitExceeded(_))
        ));
        assert!(client.link().written.is_empty());
        assert!(client.is_connected());
    }

    #[test]
    fn test_transceive_requires_connect() {
        let mut client = ClientConversation::new(ScriptedLink::default(), &fast_config()).unwrap();
        assert_eq!(
            client.transceive(&ApduEnvelope::new()),
            Err(RelayError::NotConnected)
        );
    }

    #[test]
    fn test_failed_read_reported_to_subscribers() {
        let mut client = connected(ScriptedLink::ready(&[0x00, 0x00, 0x02, 0x00]));
        let errors = client.subscribe_errors();

        // No response fragments queued, the read is rejected
        let err = client.transceive_one(&[0x00, 0xA4, 0x04, 0x00]).unwrap_err();
        assert_eq!(err, RelayError::Link(LinkError::Rejected { status: 0x0101 }));
        assert_eq!(errors.try_recv().unwrap(), err);
        assert_eq!(client.state(), ClientState::Ready);
    }

    #[test]
    fn test_dropped_subscriber_pruned() {
        let mut client = connected(ScriptedLink::ready(&[0x00, 0x00, 0x02, 0x00]));
        drop(client.subscribe_errors());
        let _ = client.transceive_one(&[0x00]);
        assert!(client.error_subscribers.is_empty());
    }

    // ==================== Status Word Tests ====================

    #[test]
    fn test_status_accepted() {
        assert!(status_accepted(&[0x90, 0x00], &[0x9000]));
        assert!(status_accepted(&[0x01, 0x61, 0x10], &[0x9000, 0x61]));
        assert!(!status_accepted(&[0x6A, 0x82], &[0x9000, 0x61]));
        assert!(!status_accepted(&[0x90], &[0x9000]));
    }

    #[test]
    fn test_transceive_expecting_unexpected_status() {
        let mut link = ScriptedLink::ready(&[0x00, 0x00, 0x02, 0x00]);
        link.responses = response_fragments(&ApduEnvelope::from(vec![vec![0x6A, 0x82]]), 512);
        let mut client = connected(link);

        assert_eq!(
            client.transceive_expecting(&[0x00, 0xA4, 0x04, 0x00], &[0x9000]),
            Err(RelayError::UnexpectedStatus {
                response: vec![0x6A, 0x82]
            })
        );
    }

    // ==================== Close Tests ====================

    #[test]
    fn test_close_sends_finish_once() {
        let mut client = connected(ScriptedLink::ready(&[0x00, 0x00, 0x02, 0x00]));
        client.close();
        client.close();

        let finishes: Vec<_> = client
            .link()
            .written
            .iter()
            .filter(|(role, _)| *role == CharacteristicRole::ConversationFinished)
            .collect();
        assert_eq!(finishes.len(), 1);
        assert_eq!(finishes[0].1, FINISH_SENTINEL.to_vec());
        assert_eq!(client.state(), ClientState::Closed);
        assert_eq!(client.link().released, 1);
    }
}
