//! Local smart-card transport.
//!
//! The card is reached through a link that can appear and disappear at any
//! time (a card tapped against a reader, a token plugged in). The relay only
//! needs three primitives from it, captured by [`CardTransport`].

use std::fmt;
use std::io;

/// Blocking APDU exchange with a smart card.
pub trait CardTransport: Send {
    /// True while the link to the card is open.
    fn is_connected(&self) -> bool;

    /// Open the link to the card.
    fn connect(&mut self) -> Result<(), CardError>;

    /// Send one command APDU and return the response APDU.
    fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, CardError>;
}

impl<T: CardTransport + ?Sized> CardTransport for Box<T> {
    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn connect(&mut self) -> Result<(), CardError> {
        (**self).connect()
    }

    fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, CardError> {
        (**self).transceive(command)
    }
}

/// Card transport failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardError {
    /// No card is attached.
    NotPresent,
    /// The link reported an I/O failure.
    Io { kind: io::ErrorKind, message: String },
}

impl CardError {
    /// Build an I/O failure.
    pub fn io(kind: io::ErrorKind, message: impl Into<String>) -> Self {
        Self::Io {
            kind,
            message: message.into(),
        }
    }

    /// The I/O error kind of this failure.
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            Self::NotPresent => io::ErrorKind::NotConnected,
            Self::Io { kind, .. } => *kind,
        }
    }
}

impl From<io::Error> for CardError {
    fn from(e: io::Error) -> Self {
        Self::io(e.kind(), e.to_string())
    }
}

impl fmt::Display for CardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotPresent => write!(f, "no card attached"),
            Self::Io { kind, message } => write!(f, "card I/O error ({:?}): {}", kind, message),
        }
    }
}

impl std::error::Error for CardError {}

type Responder = Box<dyn FnMut(&[u8]) -> Result<Vec<u8>, CardError> + Send>;

/// In-process card driven by a closure.
///
/// Used by the loopback demo and by tests to stand in for a physical card.
pub struct SimulatedCard {
    responder: Responder,
    connected: bool,
    connects: usize,
}

impl SimulatedCard {
    /// Create a card that answers every command through `responder`.
    pub fn new<F>(responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Result<Vec<u8>, CardError> + Send + 'static,
    {
        Self {
            responder: Box::new(responder),
            connected: false,
            connects: 0,
        }
    }

    /// Card that answers `90 00` to everything.
    pub fn always_ok() -> Self {
        Self::new(|_| Ok(vec![0x90, 0x00]))
    }

    /// Number of times the link has been opened.
    pub fn connect_count(&self) -> usize {
        self.connects
    }
}

impl CardTransport for SimulatedCard {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn connect(&mut self) -> Result<(), CardError> {
        self.connected = true;
        self.connects += 1;
        Ok(())
    }

    fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, CardError> {
        if !self.connected {
            return Err(CardError::io(io::ErrorKind::NotConnected, "link not open"));
        }
        let result = (self.responder)(command);
        if result.is_err() {
            self.connected = false;
        }
        result
    }
}

impl fmt::Debug for SimulatedCard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedCard")
            .field("connected", &self.connected)
            .field("connects", &self.connects)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_card_requires_connect() {
        let mut card = SimulatedCard::always_ok();
        assert!(!card.is_connected());
        assert_eq!(card.transceive(&[0x00]).unwrap_err().kind(), io::ErrorKind::NotConnected);

        card.connect().unwrap();
        assert_eq!(card.transceive(&[0x00, 0xA4]).unwrap(), vec![0x90, 0x00]);
        assert_eq!(card.connect_count(), 1);
    }

    #[test]
    fn test_simulated_card_failure_drops_link() {
        let mut card = SimulatedCard::new(|_| Err(CardError::io(io::ErrorKind::BrokenPipe, "tag lost")));
        card.connect().unwrap();
        let err = card.transceive(&[0x00]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(!card.is_connected());
    }

    #[test]
    fn test_card_error_from_io() {
        let err: CardError = io::Error::new(io::ErrorKind::TimedOut, "slow card").into();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(err.to_string().contains("slow card"));
    }
}
