//! GATT service layout for the APDU relay.
//!
//! # GATT Service Structure
//!
//! ```text
//! Service: APDU Relay
//! ├── Write (Write) - Inbound request fragments
//! ├── ReadResponse (Read) - Outbound response fragments, one per read
//! ├── NotifyReady (Notify) - Signals that a response is ready to be read
//! ├── MaxMemory (Read) - Peripheral fragment capacity, u32 big-endian
//! └── ConversationFinished (Write) - Four zero bytes end the session
//! ```
//!
//! Both sides derive the characteristic identifiers from this table, so a
//! role is always addressed by the same UUID.

use std::fmt;

/// APDU relay service UUID.
pub const SERVICE_UUID: u128 = 0x8e790d52_bb90_4967_a4a5_3f21aa9e05eb;

/// UUID for the Write characteristic.
pub const WRITE_CHAR_UUID: u128 = 0x8e79ecae_bb90_4967_a4a5_3f21aa9e05eb;

/// UUID for the ConversationFinished characteristic.
pub const CONVERSATION_FINISHED_CHAR_UUID: u128 = 0x8e798746_bb90_4967_a4a5_3f21aa9e05eb;

/// UUID for the NotifyReady characteristic.
pub const NOTIFY_READY_CHAR_UUID: u128 = 0x8e795e92_bb90_4967_a4a5_3f21aa9e05eb;

/// UUID for the ReadResponse characteristic.
pub const READ_RESPONSE_CHAR_UUID: u128 = 0x8e7927a7_bb90_4967_a4a5_3f21aa9e05eb;

/// UUID for the MaxMemory characteristic.
pub const MAX_MEMORY_CHAR_UUID: u128 = 0x8e79e13b_bb90_4967_a4a5_3f21aa9e05eb;

/// Client characteristic configuration descriptor (enables notifications).
pub const CCCD_UUID: u128 = 0x00002902_0000_1000_8000_00805f9b34fb;

/// Value written to ConversationFinished to end a session.
pub const FINISH_SENTINEL: [u8; 4] = [0x00; 4];

/// Characteristics of the APDU relay service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicRole {
    /// Request fragments, central to peripheral.
    Write,
    /// Response fragments, peripheral to central.
    ReadResponse,
    /// Response-ready notification.
    NotifyReady,
    /// Peripheral fragment capacity.
    MaxMemory,
    /// End-of-session marker.
    ConversationFinished,
}

impl CharacteristicRole {
    /// Every role in service order.
    pub const ALL: [Self; 5] = [
        Self::Write,
        Self::ReadResponse,
        Self::NotifyReady,
        Self::MaxMemory,
        Self::ConversationFinished,
    ];

    /// Stable 128-bit identifier of this characteristic.
    pub const fn uuid(self) -> u128 {
        match self {
            Self::Write => WRITE_CHAR_UUID,
            Self::ReadResponse => READ_RESPONSE_CHAR_UUID,
            Self::NotifyReady => NOTIFY_READY_CHAR_UUID,
            Self::MaxMemory => MAX_MEMORY_CHAR_UUID,
            Self::ConversationFinished => CONVERSATION_FINISHED_CHAR_UUID,
        }
    }

    /// Look up the role for a characteristic UUID.
    pub fn from_uuid(uuid: u128) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.uuid() == uuid)
    }

    /// Short name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Write => "write",
            Self::ReadResponse => "read_response",
            Self::NotifyReady => "notify_ready",
            Self::MaxMemory => "max_memory",
            Self::ConversationFinished => "conversation_finished",
        }
    }
}

impl fmt::Display for CharacteristicRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Render a 128-bit UUID in the canonical hyphenated form.
pub fn format_uuid(uuid: u128) -> String {
    let hex = format!("{:032x}", uuid);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_roundtrip() {
        for role in CharacteristicRole::ALL {
            assert_eq!(CharacteristicRole::from_uuid(role.uuid()), Some(role));
        }
        assert_eq!(CharacteristicRole::from_uuid(SERVICE_UUID), None);
        assert_eq!(CharacteristicRole::from_uuid(CCCD_UUID), None);
    }

    #[test]
    fn test_uuids_distinct() {
        let mut uuids: Vec<u128> = CharacteristicRole::ALL.iter().map(|r| r.uuid()).collect();
        uuids.push(SERVICE_UUID);
        uuids.sort_unstable();
        uuids.dedup();
        assert_eq!(uuids.len(), 6);
    }

    #[test]
    fn test_format_uuid() {
        assert_eq!(
            format_uuid(SERVICE_UUID),
            "8e790d52-bb90-4967-a4a5-3f21aa9e05eb"
        );
        assert_eq!(format_uuid(CCCD_UUID), "00002902-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn test_role_display() {
        assert_eq!(CharacteristicRole::MaxMemory.to_string(), "max_memory");
    }
}
