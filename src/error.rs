//! Crate-wide error taxonomy.
//!
//! Each module reports failures through its own small error type; this enum
//! is what the conversations and the relay surface to callers.

use crate::ble::FragmentError;
use crate::card::CardError;
use crate::client::LinkError;
use crate::config::ConfigError;
use crate::peripheral::GattError;
use crate::sequence::SequenceError;
use std::fmt;
use std::time::Duration;

/// Result alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors surfaced by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// A fragment could not be built or appended.
    Framing(FragmentError),
    /// An APDU envelope exceeds the count or length bounds.
    SequenceLimitExceeded(SequenceError),
    /// An APDU envelope ended before its declared data.
    Truncated(SequenceError),
    /// The request names an endpoint or option the relay does not serve.
    UnsupportedOperation(String),
    /// A response arrived for a request that is no longer pending.
    StaleResponse { id: u64 },
    /// The card transport failed.
    CardTransport(CardError),
    /// The link was not established in time.
    HandshakeTimeout { waited: Duration },
    /// The peer answered with a different number of APDUs than were sent.
    ResponseCountMismatch { expected: usize, actual: usize },
    /// The card answered with a status word the caller does not accept.
    UnexpectedStatus { response: Vec<u8> },
    /// The central-side link failed.
    Link(LinkError),
    /// The GATT server rejected a send.
    Gatt(GattError),
    /// Configuration is invalid.
    Config(ConfigError),
    /// The conversation has no open link.
    NotConnected,
    /// The other end of an internal channel is gone.
    ChannelClosed,
    /// A relay thread could not be started.
    ThreadSpawn { thread: String, message: String },
}

impl RelayError {
    /// Wrap the error from spawning the thread named `thread`.
    pub fn thread_spawn(thread: &str, e: std::io::Error) -> Self {
        Self::ThreadSpawn {
            thread: thread.to_string(),
            message: e.to_string(),
        }
    }
}

impl From<FragmentError> for RelayError {
    fn from(e: FragmentError) -> Self {
        Self::Framing(e)
    }
}

impl From<SequenceError> for RelayError {
    fn from(e: SequenceError) -> Self {
        match e {
            SequenceError::Truncated { .. } => Self::Truncated(e),
            _ => Self::SequenceLimitExceeded(e),
        }
    }
}

impl From<CardError> for RelayError {
    fn from(e: CardError) -> Self {
        Self::CardTransport(e)
    }
}

impl From<LinkError> for RelayError {
    fn from(e: LinkError) -> Self {
        Self::Link(e)
    }
}

impl From<GattError> for RelayError {
    fn from(e: GattError) -> Self {
        Self::Gatt(e)
    }
}

impl From<ConfigError> for RelayError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Framing(e) => write!(f, "framing error: {}", e),
            Self::SequenceLimitExceeded(e) | Self::Truncated(e) => write!(f, "{}", e),
            Self::UnsupportedOperation(what) => write!(f, "unsupported operation: {}", what),
            Self::StaleResponse { id } => write!(f, "stale response for request {}", id),
            Self::CardTransport(e) => write!(f, "card transport: {}", e),
            Self::HandshakeTimeout { waited } => {
                write!(f, "handshake timed out after {} ms", waited.as_millis())
            }
            Self::ResponseCountMismatch { expected, actual } => write!(
                f,
                "expected {} response APDUs, got {}",
                expected, actual
            ),
            Self::UnexpectedStatus { response } => {
                write!(f, "unexpected card status: {}", hex::encode_upper(response))
            }
            Self::Link(e) => write!(f, "link error: {}", e),
            Self::Gatt(e) => write!(f, "GATT error: {}", e),
            Self::Config(e) => write!(f, "config error: {}", e),
            Self::NotConnected => write!(f, "not connected"),
            Self::ChannelClosed => write!(f, "relay channel closed"),
            Self::ThreadSpawn { thread, message } => {
                write!(f, "failed to start {} thread: {}", thread, message)
            }
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Framing(e) => Some(e),
            Self::SequenceLimitExceeded(e) | Self::Truncated(e) => Some(e),
            Self::CardTransport(e) => Some(e),
            Self::Link(e) => Some(e),
            Self::Gatt(e) => Some(e),
            Self::Config(e) => Some(e),
            _ => None,
        }
    }
}
