//! BLE packet fragmentation and reassembly.
//!
//! GATT characteristic values are far smaller than an APDU exchange (20-512
//! bytes depending on the negotiated MTU). This module splits an encoded
//! APDU sequence into characteristic-sized fragments and reassembles them on
//! the other side.
//!
//! Two wire formats exist. Both ends of a link must be configured with the
//! same one; the format is never negotiated inline.
//!
//! # Offset Format
//!
//! Raw payload chunks without any header:
//! ```text
//! [chunk: <= capacity bytes]...[chunk][0x00]
//! ```
//!
//! Each pull returns the next `capacity`-sized slice of the blob. Once the
//! blob is exhausted a single `0x00` byte is emitted as the terminal chunk.
//! An empty blob produces the terminal chunk straight away.
//!
//! The payload is always an encoded APDU sequence, which may itself end in
//! `0x00`. The receiver therefore only takes `[0x00]` as the terminal once
//! the bytes collected so far form a complete sequence; before that it is
//! data.
//!
//! # Sequenced Format
//!
//! Each fragment has a 4-byte header:
//! ```text
//! [total_packets: u16][sequence: u16][payload: <= capacity - 4 bytes]
//! ```
//!
//! Both fields are big-endian and `sequence` is 1-based. An empty blob is
//! still sent as one packet with an empty payload so the receiver can detect
//! completion.
//!
//! Fragments are appended in arrival order. The link is assumed to deliver
//! writes in send order; `sequence` is only used to detect the final packet.
//!
//! # Example
//!
//! ```
//! use apdu_ble_relay::ble::FragmentationFormat;
//!
//! let blob: Vec<u8> = (0..47).collect();
//! let mut emitter = FragmentationFormat::Sequenced.fragmenter(20, &blob).unwrap();
//! let mut assembly = FragmentationFormat::Sequenced.defragmenter();
//!
//! while let Some(fragment) = emitter.next_fragment() {
//!     assembly.append_packet(&fragment).unwrap();
//! }
//! assert!(assembly.is_complete());
//! assert_eq!(assembly.take_blob(), blob);
//! ```

use crate::sequence;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// Header size of the sequenced format (total + sequence).
pub const SEQUENCED_HEADER_SIZE: usize = 4;

/// Terminal chunk of the offset format.
pub const TERMINAL_CHUNK: [u8; 1] = [0x00];

/// Fragmentation wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentationFormat {
    /// Headerless chunks followed by a one-byte terminal chunk.
    Offset,
    /// Fixed 4-byte `[total][sequence]` header on every fragment.
    #[default]
    Sequenced,
}

impl FragmentationFormat {
    /// Per-fragment header overhead in bytes.
    pub const fn header_size(self) -> usize {
        match self {
            Self::Offset => 0,
            Self::Sequenced => SEQUENCED_HEADER_SIZE,
        }
    }

    /// Smallest capacity this format can work with.
    pub const fn min_capacity(self) -> usize {
        self.header_size() + 1
    }

    /// Build an emitter that serves `blob` in fragments of at most
    /// `capacity` bytes.
    ///
    /// Returns `Err(FragmentError::CapacityTooSmall)` if `capacity` leaves no
    /// room for payload.
    pub fn fragmenter(self, capacity: usize, blob: &[u8]) -> Result<FragmentEmitter, FragmentError> {
        match self {
            Self::Offset => OffsetEmitter::new(capacity, blob).map(FragmentEmitter::Offset),
            Self::Sequenced => {
                SequencedEmitter::new(capacity, blob).map(FragmentEmitter::Sequenced)
            }
        }
    }

    /// Build an empty reassembly buffer for this format.
    pub fn defragmenter(self) -> AssemblyBuffer {
        match self {
            Self::Offset => AssemblyBuffer::Offset(OffsetAssembly::default()),
            Self::Sequenced => AssemblyBuffer::Sequenced(SequencedAssembly::default()),
        }
    }
}

impl std::fmt::Display for FragmentationFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Offset => write!(f, "offset"),
            Self::Sequenced => write!(f, "sequenced"),
        }
    }
}

/// A single fragment of the sequenced format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Number of fragments the blob was split into.
    pub total: u16,
    /// 1-based position of this fragment.
    pub sequence: u16,
    /// Payload data (without header).
    pub payload: Vec<u8>,
}

impl Fragment {
    /// Create a new fragment.
    pub fn new(total: u16, sequence: u16, payload: Vec<u8>) -> Self {
        Self {
            total,
            sequence,
            payload,
        }
    }

    /// Check if this is the final fragment of its blob.
    #[inline]
    pub fn is_last(&self) -> bool {
        self.sequence == self.total
    }

    /// Serialize fragment to bytes (header + payload).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(SEQUENCED_HEADER_SIZE + self.payload.len());
        bytes.extend_from_slice(&self.total.to_be_bytes());
        bytes.extend_from_slice(&self.sequence.to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Deserialize fragment from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FragmentError> {
        if bytes.len() < SEQUENCED_HEADER_SIZE {
            return Err(FragmentError::TooShort { len: bytes.len() });
        }
        let total = u16::from_be_bytes([bytes[0], bytes[1]]);
        let sequence = u16::from_be_bytes([bytes[2], bytes[3]]);
        if total == 0 || sequence == 0 || sequence > total {
            return Err(FragmentError::InvalidHeader { total, sequence });
        }
        Ok(Self {
            total,
            sequence,
            payload: bytes[SEQUENCED_HEADER_SIZE..].to_vec(),
        })
    }
}

/// Errors that can occur during fragmentation/reassembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentError {
    /// Fragment data is too short to contain a header.
    TooShort { len: usize },
    /// Header fields are inconsistent (zero total, zero or overflowing sequence).
    InvalidHeader { total: u16, sequence: u16 },
    /// Capacity leaves no room for payload.
    CapacityTooSmall { capacity: usize, min: usize },
    /// Blob needs more fragments than the 16-bit total can express.
    TooManyFragments { len: usize },
    /// A fragment arrived after the blob was already complete.
    AlreadyComplete,
}

impl std::fmt::Display for FragmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooShort { len } => write!(
                f,
                "fragment too short: {} bytes (header is {})",
                len, SEQUENCED_HEADER_SIZE
            ),
            Self::InvalidHeader { total, sequence } => write!(
                f,
                "invalid fragment header: sequence {} of {}",
                sequence, total
            ),
            Self::CapacityTooSmall { capacity, min } => {
                write!(f, "capacity {} too small (minimum: {})", capacity, min)
            }
            Self::TooManyFragments { len } => {
                write!(f, "blob of {} bytes needs more than {} fragments", len, u16::MAX)
            }
            Self::AlreadyComplete => write!(f, "fragment received after blob completed"),
        }
    }
}

impl std::error::Error for FragmentError {}

// ==================== Emitters ====================

/// Serves the fragments of one outgoing blob.
#[derive(Debug)]
pub enum FragmentEmitter {
    /// Offset format emitter.
    Offset(OffsetEmitter),
    /// Sequenced format emitter.
    Sequenced(SequencedEmitter),
}

impl FragmentEmitter {
    /// Next fragment to put on the wire, or `None` once everything
    /// (including the offset format's terminal chunk) has been served.
    pub fn next_fragment(&mut self) -> Option<Vec<u8>> {
        match self {
            Self::Offset(e) => e.next_fragment(),
            Self::Sequenced(e) => e.next_fragment(),
        }
    }

    /// True once [`next_fragment`](Self::next_fragment) has nothing left.
    pub fn is_exhausted(&self) -> bool {
        match self {
            Self::Offset(e) => e.terminal_sent,
            Self::Sequenced(e) => e.sent >= e.total,
        }
    }
}

impl Iterator for FragmentEmitter {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        self.next_fragment()
    }
}

/// Emitter for the offset format.
pub struct OffsetEmitter {
    capacity: usize,
    blob: Vec<u8>,
    offset: usize,
    terminal_sent: bool,
}

impl OffsetEmitter {
    fn new(capacity: usize, blob: &[u8]) -> Result<Self, FragmentError> {
        let min = FragmentationFormat::Offset.min_capacity();
        if capacity < min {
            return Err(FragmentError::CapacityTooSmall { capacity, min });
        }
        Ok(Self {
            capacity,
            blob: blob.to_vec(),
            offset: 0,
            terminal_sent: false,
        })
    }

    fn next_fragment(&mut self) -> Option<Vec<u8>> {
        if self.offset < self.blob.len() {
            let end = (self.offset + self.capacity).min(self.blob.len());
            let chunk = self.blob[self.offset..end].to_vec();
            self.offset = end;
            return Some(chunk);
        }
        if self.terminal_sent {
            return None;
        }
        self.terminal_sent = true;
        Some(TERMINAL_CHUNK.to_vec())
    }
}

impl std::fmt::Debug for OffsetEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffsetEmitter")
            .field("capacity", &self.capacity)
            .field("len", &self.blob.len())
            .field("offset", &self.offset)
            .field("terminal_sent", &self.terminal_sent)
            .finish()
    }
}

impl Drop for OffsetEmitter {
    fn drop(&mut self) {
        self.blob.zeroize();
    }
}

/// Emitter for the sequenced format.
pub struct SequencedEmitter {
    max_payload: usize,
    blob: Vec<u8>,
    total: u16,
    sent: u16,
}

impl SequencedEmitter {
    fn new(capacity: usize, blob: &[u8]) -> Result<Self, FragmentError> {
        if capacity <= SEQUENCED_HEADER_SIZE {
            return Err(FragmentError::CapacityTooSmall {
                capacity,
                min: FragmentationFormat::Sequenced.min_capacity(),
            });
        }
        let max_payload = capacity - SEQUENCED_HEADER_SIZE;
        let carried = blob.len().max(1);
        let total = u16::try_from(carried.div_ceil(max_payload))
            .map_err(|_| FragmentError::TooManyFragments { len: blob.len() })?;

        Ok(Self {
            max_payload,
            blob: blob.to_vec(),
            total,
            sent: 0,
        })
    }

    /// Number of fragments this blob is split into.
    pub fn total(&self) -> u16 {
        self.total
    }

    fn next_fragment(&mut self) -> Option<Vec<u8>> {
        if self.sent >= self.total {
            return None;
        }
        let offset = self.max_payload * self.sent as usize;
        let end = (offset + self.max_payload).min(self.blob.len());
        let payload = self.blob.get(offset..end).unwrap_or_default().to_vec();
        self.sent += 1;
        Some(Fragment::new(self.total, self.sent, payload).to_bytes())
    }
}

impl std::fmt::Debug for SequencedEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequencedEmitter")
            .field("max_payload", &self.max_payload)
            .field("len", &self.blob.len())
            .field("total", &self.total)
            .field("sent", &self.sent)
            .finish()
    }
}

impl Drop for SequencedEmitter {
    fn drop(&mut self) {
        self.blob.zeroize();
    }
}

// ==================== Assembly ====================

/// Reassembles the fragments of one incoming blob.
#[derive(Debug)]
pub enum AssemblyBuffer {
    /// Offset format reassembly.
    Offset(OffsetAssembly),
    /// Sequenced format reassembly.
    Sequenced(SequencedAssembly),
}

impl AssemblyBuffer {
    /// Add one inbound characteristic value.
    pub fn append_packet(&mut self, data: &[u8]) -> Result<(), FragmentError> {
        match self {
            Self::Offset(a) => a.append_packet(data),
            Self::Sequenced(a) => a.append_packet(data),
        }
    }

    /// True once the whole blob has been received.
    pub fn is_complete(&self) -> bool {
        match self {
            Self::Offset(a) => a.terminated,
            Self::Sequenced(a) => a.last_sequence.is_some() && a.last_sequence == a.declared_total,
        }
    }

    /// True if no fragment has been appended yet.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Offset(a) => a.chunks.is_empty() && !a.terminated,
            Self::Sequenced(a) => a.received_count == 0,
        }
    }

    /// Number of fragments appended so far.
    pub fn received_count(&self) -> usize {
        match self {
            Self::Offset(a) => a.chunks.len(),
            Self::Sequenced(a) => a.received_count,
        }
    }

    /// Concatenate the received payloads, leaving the buffer empty.
    pub fn take_blob(&mut self) -> Vec<u8> {
        let chunks = match self {
            Self::Offset(a) => &mut a.chunks,
            Self::Sequenced(a) => &mut a.chunks,
        };
        let blob = chunks.concat();
        self.clear();
        blob
    }

    /// Discard all received data.
    pub fn clear(&mut self) {
        match self {
            Self::Offset(a) => a.clear(),
            Self::Sequenced(a) => a.clear(),
        }
    }
}

fn zeroize_chunks(chunks: &mut Vec<Vec<u8>>) {
    for chunk in chunks.iter_mut() {
        chunk.zeroize();
    }
    chunks.clear();
}

/// Reassembly state for the offset format.
#[derive(Default)]
pub struct OffsetAssembly {
    chunks: Vec<Vec<u8>>,
    terminated: bool,
}

impl OffsetAssembly {
    fn append_packet(&mut self, data: &[u8]) -> Result<(), FragmentError> {
        if self.terminated {
            return Err(FragmentError::AlreadyComplete);
        }
        if data == TERMINAL_CHUNK && self.holds_complete_sequence() {
            self.terminated = true;
        } else {
            self.chunks.push(data.to_vec());
        }
        Ok(())
    }

    fn holds_complete_sequence(&self) -> bool {
        let mut collected = self.chunks.concat();
        let complete = sequence::envelope_len(&collected).is_some_and(|len| len <= collected.len());
        collected.zeroize();
        complete
    }

    fn clear(&mut self) {
        zeroize_chunks(&mut self.chunks);
        self.terminated = false;
    }
}

impl std::fmt::Debug for OffsetAssembly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffsetAssembly")
            .field("chunks", &self.chunks.len())
            .field("terminated", &self.terminated)
            .finish()
    }
}

impl Drop for OffsetAssembly {
    fn drop(&mut self) {
        zeroize_chunks(&mut self.chunks);
    }
}

/// Reassembly state for the sequenced format.
#[derive(Default)]
pub struct SequencedAssembly {
    chunks: Vec<Vec<u8>>,
    /// Total announced by the first fragment.
    declared_total: Option<u16>,
    /// Sequence number of the most recently appended fragment.
    last_sequence: Option<u16>,
    received_count: usize,
}

impl SequencedAssembly {
    /// Total announced by the first fragment, if any arrived.
    pub fn declared_total(&self) -> Option<u16> {
        self.declared_total
    }

    fn append_packet(&mut self, data: &[u8]) -> Result<(), FragmentError> {
        if self.declared_total.is_some() && self.last_sequence == self.declared_total {
            return Err(FragmentError::AlreadyComplete);
        }
        let fragment = Fragment::from_bytes(data)?;

        let declared = *self.declared_total.get_or_insert(fragment.total);
        if fragment.total != declared {
            log::debug!(
                "Fragment declares {} packets, keeping first declaration of {}",
                fragment.total,
                declared
            );
        }

        self.chunks.push(fragment.payload);
        self.last_sequence = Some(fragment.sequence);
        self.received_count += 1;
        Ok(())
    }

    fn clear(&mut self) {
        zeroize_chunks(&mut self.chunks);
        self.declared_total = None;
        self.last_sequence = None;
        self.received_count = 0;
    }
}

impl std::fmt::Debug for SequencedAssembly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequencedAssembly")
            .field("declared_total", &self.declared_total)
            .field("last_sequence", &self.last_sequence)
            .field("received_count", &self.received_count)
            .finish()
    }
}

impl Drop for SequencedAssembly {
    fn drop(&mut self) {
        zeroize_chunks(&mut self.chunks);
    }
}
