//! APDU sequence envelope.
//!
//! A single request or response travelling over the link may carry several
//! APDUs. They are packed into one blob before fragmentation and unpacked
//! after reassembly.
//!
//! # Envelope Format
//!
//! ```text
//! [count: u16][len_1: u16][apdu_1: len_1 bytes]...[len_n: u16][apdu_n: len_n bytes]
//! ```
//!
//! All integers are big-endian. No compression, no padding.
//!
//! # Example
//!
//! ```
//! use apdu_ble_relay::sequence::{decode, encode, ApduEnvelope};
//!
//! let envelope = ApduEnvelope::from(vec![vec![0x00, 0xA4, 0x04, 0x00, 0x00]]);
//! let blob = encode(&envelope).unwrap();
//! assert_eq!(blob, vec![0x00, 0x01, 0x00, 0x05, 0x00, 0xA4, 0x04, 0x00, 0x00]);
//! assert_eq!(decode(&blob).unwrap(), envelope);
//! ```

use zeroize::Zeroize;

/// Maximum number of APDUs in one envelope.
pub const MAX_APDU_COUNT: usize = 100;

/// Maximum length of a single APDU inside an envelope.
pub const MAX_APDU_LEN: usize = 255;

/// Size of the count prefix and of each length prefix.
const LEN_PREFIX_SIZE: usize = 2;

/// Ordered list of raw command or response APDUs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApduEnvelope {
    apdus: Vec<Vec<u8>>,
}

impl ApduEnvelope {
    /// Create an empty envelope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an APDU to the end of the envelope.
    pub fn push(&mut self, apdu: impl Into<Vec<u8>>) {
        self.apdus.push(apdu.into());
    }

    /// Number of APDUs.
    pub fn len(&self) -> usize {
        self.apdus.len()
    }

    /// True if the envelope holds no APDUs.
    pub fn is_empty(&self) -> bool {
        self.apdus.is_empty()
    }

    /// Iterate over the APDUs in order.
    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.apdus.iter().map(Vec::as_slice)
    }

    /// Borrow the APDUs as a slice.
    pub fn as_slice(&self) -> &[Vec<u8>] {
        &self.apdus
    }

    /// Consume the envelope, returning the APDUs.
    pub fn into_inner(self) -> Vec<Vec<u8>> {
        let mut this = std::mem::ManuallyDrop::new(self);
        std::mem::take(&mut this.apdus)
    }

    /// Check the count and per-APDU length limits that `decode` enforces.
    ///
    /// Senders call this before encoding so an envelope the peer would
    /// reject never leaves the device.
    pub fn check_limits(&self) -> Result<(), SequenceError> {
        if self.apdus.len() > MAX_APDU_COUNT {
            return Err(SequenceError::CountExceeded {
                count: self.apdus.len(),
            });
        }
        if let Some((index, apdu)) = self
            .apdus
            .iter()
            .enumerate()
            .find(|(_, apdu)| apdu.len() > MAX_APDU_LEN)
        {
            return Err(SequenceError::LengthExceeded {
                index,
                len: apdu.len(),
            });
        }
        Ok(())
    }
}

impl From<Vec<Vec<u8>>> for ApduEnvelope {
    fn from(apdus: Vec<Vec<u8>>) -> Self {
        Self { apdus }
    }
}

impl FromIterator<Vec<u8>> for ApduEnvelope {
    fn from_iter<I: IntoIterator<Item = Vec<u8>>>(iter: I) -> Self {
        Self {
            apdus: iter.into_iter().collect(),
        }
    }
}

impl Drop for ApduEnvelope {
    fn drop(&mut self) {
        for apdu in &mut self.apdus {
            apdu.zeroize();
        }
    }
}

/// Errors raised while encoding or decoding an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceError {
    /// Declared APDU count is above [`MAX_APDU_COUNT`].
    CountExceeded { count: usize },
    /// An APDU is longer than [`MAX_APDU_LEN`].
    LengthExceeded { index: usize, len: usize },
    /// The blob ended before the declared data.
    Truncated { needed: usize, available: usize },
    /// A count or length does not fit the 16-bit wire field.
    TooLarge { len: usize },
}

impl SequenceError {
    /// True for violations of the count/length bounds.
    pub fn is_limit_exceeded(&self) -> bool {
        matches!(
            self,
            Self::CountExceeded { .. } | Self::LengthExceeded { .. }
        )
    }
}

impl std::fmt::Display for SequenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CountExceeded { count } => write!(
                f,
                "sequence limit exceeded: {} APDUs (max {})",
                count, MAX_APDU_COUNT
            ),
            Self::LengthExceeded { index, len } => write!(
                f,
                "sequence limit exceeded: APDU {} is {} bytes (max {})",
                index, len, MAX_APDU_LEN
            ),
            Self::Truncated { needed, available } => write!(
                f,
                "sequence truncated: needed {} bytes, {} available",
                needed, available
            ),
            Self::TooLarge { len } => write!(f, "value {} does not fit a u16 field", len),
        }
    }
}

impl std::error::Error for SequenceError {}

/// Pack an envelope into a single blob.
///
/// Only the 16-bit field width is enforced here; the protocol limits are
/// checked by [`ApduEnvelope::check_limits`] and by [`decode`].
pub fn encode(envelope: &ApduEnvelope) -> Result<Vec<u8>, SequenceError> {
    let total: usize = LEN_PREFIX_SIZE
        + envelope
            .iter()
            .map(|apdu| LEN_PREFIX_SIZE + apdu.len())
            .sum::<usize>();
    let mut blob = Vec::with_capacity(total);

    blob.extend_from_slice(&to_u16(envelope.len())?.to_be_bytes());
    for apdu in envelope.iter() {
        blob.extend_from_slice(&to_u16(apdu.len())?.to_be_bytes());
        blob.extend_from_slice(apdu);
    }

    Ok(blob)
}

/// Unpack a blob produced by [`encode`].
pub fn decode(blob: &[u8]) -> Result<ApduEnvelope, SequenceError> {
    let mut reader = Reader::new(blob);

    let count = reader.read_u16()? as usize;
    if count > MAX_APDU_COUNT {
        return Err(SequenceError::CountExceeded { count });
    }

    let mut apdus = Vec::with_capacity(count);
    for index in 0..count {
        let len = reader.read_u16()? as usize;
        if len > MAX_APDU_LEN {
            return Err(SequenceError::LengthExceeded { index, len });
        }
        apdus.push(reader.read_bytes(len)?.to_vec());
    }

    Ok(ApduEnvelope::from(apdus))
}

/// Length of the envelope at the start of `blob`, or `None` while its
/// count, length prefixes or APDU bytes are still incomplete.
///
/// Limits are not checked; that is left to [`decode`].
pub fn envelope_len(blob: &[u8]) -> Option<usize> {
    let mut reader = Reader::new(blob);
    let count = reader.read_u16().ok()?;
    for _ in 0..count {
        let len = reader.read_u16().ok()? as usize;
        reader.read_bytes(len).ok()?;
    }
    Some(reader.offset)
}

fn to_u16(len: usize) -> Result<u16, SequenceError> {
    u16::try_from(len).map_err(|_| SequenceError::TooLarge { len })
}

/// Cursor over a borrowed blob.
struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], SequenceError> {
        let available = self.bytes.len() - self.offset;
        if available < len {
            return Err(SequenceError::Truncated {
                needed: len,
                available,
            });
        }
        let slice = &self.bytes[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn read_u16(&mut self) -> Result<u16, SequenceError> {
        let bytes = self.read_bytes(LEN_PREFIX_SIZE)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(apdus: &[&[u8]]) -> ApduEnvelope {
        apdus.iter().map(|a| a.to_vec()).collect()
    }

    // ==================== Encode Tests ====================

    #[test]
    fn test_encode_single_apdu() {
        let blob = encode(&envelope(&[&[0x00, 0xA4, 0x04, 0x00, 0x00]])).unwrap();
        assert_eq!(blob, vec![0x00, 0x01, 0x00, 0x05, 0x00, 0xA4, 0x04, 0x00, 0x00]);
    }

    #[test]
    fn test_encode_empty_envelope() {
        assert_eq!(encode(&ApduEnvelope::new()).unwrap(), vec![0x00, 0x00]);
    }

    #[test]
    fn test_encode_empty_apdu_element() {
        let blob = encode(&envelope(&[&[], &[0x90, 0x00]])).unwrap();
        assert_eq!(blob, vec![0x00, 0x02, 0x00, 0x00, 0x00, 0x02, 0x90, 0x00]);
    }

    // ==================== Decode Tests ====================

    #[test]
    fn test_decode_rejects_count_101() {
        let mut blob = vec![0x00, 101];
        for _ in 0..101 {
            blob.extend_from_slice(&[0x00, 0x00]);
        }
        let err = decode(&blob).unwrap_err();
        assert_eq!(err, SequenceError::CountExceeded { count: 101 });
        assert!(err.is_limit_exceeded());
    }

    #[test]
    fn test_decode_rejects_length_256() {
        let mut blob = vec![0x00, 0x01, 0x01, 0x00];
        blob.extend(std::iter::repeat(0xAB).take(256));
        let err = decode(&blob).unwrap_err();
        assert_eq!(err, SequenceError::LengthExceeded { index: 0, len: 256 });
        assert!(err.is_limit_exceeded());
    }

    #[test]
    fn test_decode_truncated_payload() {
        // Declares 5 bytes, carries 3
        let blob = [0x00, 0x01, 0x00, 0x05, 0x00, 0xA4, 0x04];
        assert_eq!(
            decode(&blob),
            Err(SequenceError::Truncated {
                needed: 5,
                available: 3
            })
        );
    }

    #[test]
    fn test_decode_truncated_header() {
        assert!(matches!(decode(&[]), Err(SequenceError::Truncated { .. })));
        assert!(matches!(decode(&[0x00]), Err(SequenceError::Truncated { .. })));
        // Count says 2, only one entry present
        assert!(matches!(
            decode(&[0x00, 0x02, 0x00, 0x01, 0xFF]),
            Err(SequenceError::Truncated { .. })
        ));
    }

    #[test]
    fn test_decode_accepts_limits_exactly() {
        let apdus: Vec<Vec<u8>> = (0..MAX_APDU_COUNT).map(|_| vec![0x5A; MAX_APDU_LEN]).collect();
        let original = ApduEnvelope::from(apdus);
        let decoded = decode(&encode(&original).unwrap()).unwrap();
        assert_eq!(decoded.len(), MAX_APDU_COUNT);
        assert_eq!(decoded, original);
    }

    // ==================== Boundary Tests ====================

    #[test]
    fn test_envelope_len_needs_every_declared_byte() {
        let blob = encode(&envelope(&[&[0x00, 0xA4, 0x04, 0x00, 0x00]])).unwrap();
        // Ends in 0x00 long before it is complete
        for end in 0..blob.len() {
            assert_eq!(envelope_len(&blob[..end]), None, "prefix of {} bytes", end);
        }
        assert_eq!(envelope_len(&blob), Some(9));
        assert_eq!(envelope_len(&[0x00, 0x00]), Some(2));
    }

    // ==================== Round-trip Tests ====================

    #[test]
    fn test_roundtrip_mixed_lengths() {
        let original: ApduEnvelope = (0..=40u8).map(|n| (0..n * 6).collect()).collect();
        assert!(original.check_limits().is_ok());
        assert_eq!(decode(&encode(&original).unwrap()).unwrap(), original);
    }

    // ==================== Limit Check Tests ====================

    #[test]
    fn test_check_limits() {
        let too_many: ApduEnvelope = (0..101).map(|_| vec![0x00]).collect();
        assert_eq!(
            too_many.check_limits(),
            Err(SequenceError::CountExceeded { count: 101 })
        );

        let too_long = envelope(&[&[0x00], &[0xEE; 256]]);
        assert_eq!(
            too_long.check_limits(),
            Err(SequenceError::LengthExceeded { index: 1, len: 256 })
        );
    }

    #[test]
    fn test_into_inner_preserves_bytes() {
        let original = envelope(&[&[0x90, 0x00]]);
        assert_eq!(original.into_inner(), vec![vec![0x90, 0x00]]);
    }
}
