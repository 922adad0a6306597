//! APDU-over-BLE relay.
//!
//! Relays ISO-7816 APDUs between a BLE central and a smart card reachable
//! only through a separate local transport. The peripheral side reassembles
//! request fragments, queues the APDUs for the card and serves the card's
//! answers back fragment by fragment; the central side presents the remote
//! card as a plain APDU transport.

pub mod ble;
pub mod card;
pub mod client;
pub mod config;
pub mod correlator;
pub mod error;
pub mod loopback;
pub mod peripheral;
pub mod relay;
pub mod sequence;

// Re-export commonly used items
pub use ble::{CharacteristicRole, FragmentationFormat};
pub use card::{CardError, CardTransport};
pub use client::{CentralLink, ClientConversation, ClientState, LinkError};
pub use config::{ConfigError, RelayConfig};
pub use correlator::{PendingCardOperation, RequestCorrelator};
pub use error::{RelayError, Result};
pub use peripheral::{GattEvent, GattServer, PeripheralConversation};
pub use relay::Relay;
pub use sequence::{ApduEnvelope, SequenceError};
