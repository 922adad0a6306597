//! BLE transport components.
//!
//! This module contains the GATT service layout and the packet fragmentation
//! that carries APDU sequences across BLE's small characteristic values.

mod characteristic;
mod fragmentation;

pub use characteristic::{
    format_uuid, CharacteristicRole, CCCD_UUID, CONVERSATION_FINISHED_CHAR_UUID,
    FINISH_SENTINEL, MAX_MEMORY_CHAR_UUID, NOTIFY_READY_CHAR_UUID, READ_RESPONSE_CHAR_UUID,
    SERVICE_UUID, WRITE_CHAR_UUID,
};
pub use fragmentation::{
    AssemblyBuffer, Fragment, FragmentEmitter, FragmentError, FragmentationFormat,
    SEQUENCED_HEADER_SIZE, TERMINAL_CHUNK,
};
