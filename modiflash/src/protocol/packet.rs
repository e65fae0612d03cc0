//! MODI wire packet envelope and compact payload encoding.
//!
//! Every frame on the serial bus is one JSON object with fixed single-letter
//! keys:
//!
//! ```text
//! {"c":40,"s":4095,"d":4095,"b":"/w8=","l":2}
//! ```
//!
//! - `c`: command opcode
//! - `s` / `d`: 12-bit source / destination bus addresses (0xFFF = broadcast)
//! - `b`: base64 of the raw payload buffer (0-8 bytes)
//! - `l`: declared payload length in bytes
//!
//! The payload buffer itself uses a compact variable-width tuple encoding
//! ([`encode_values`]) shared with the on-device firmware; it must be
//! reproduced bit-for-bit.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Broadcast bus address.
pub const BROADCAST_ID: u16 = 0xFFF;

/// Maximum payload size in bytes.
pub const MAX_PAYLOAD: usize = 8;

/// One decoded bus packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Command opcode.
    pub command: u8,
    /// 12-bit source address.
    pub source: u16,
    /// 12-bit destination address.
    pub destination: u16,
    /// Raw payload bytes.
    pub data: Vec<u8>,
    /// Declared payload length.
    pub length: u8,
}

/// JSON envelope with the fixed single-letter keys.
#[derive(Serialize, Deserialize)]
struct Envelope {
    c: u8,
    s: u16,
    d: u16,
    b: String,
    l: u8,
}

impl Packet {
    /// Build a packet from raw payload bytes.
    #[allow(clippy::cast_possible_truncation)] // payload is at most 8 bytes
    pub fn new(command: u8, source: u16, destination: u16, data: Vec<u8>) -> Self {
        let length = data.len().min(u8::MAX as usize) as u8;
        Self {
            command,
            source,
            destination,
            data,
            length,
        }
    }

    /// Build a packet whose payload is the compact tuple encoding of
    /// `values` (see [`encode_values`]).
    pub fn with_values(command: u8, source: u16, destination: u16, values: &[i64]) -> Self {
        Self::new(command, source, destination, encode_values(values))
    }

    /// Serialize to the JSON wire form.
    #[allow(clippy::unwrap_used)] // Envelope has no unserializable fields
    pub fn encode(&self) -> Vec<u8> {
        let envelope = Envelope {
            c: self.command,
            s: self.source,
            d: self.destination,
            b: BASE64.encode(&self.data),
            l: self.length,
        };
        serde_json::to_vec(&envelope).unwrap()
    }

    /// Parse one JSON frame back into a packet.
    ///
    /// Any malformed frame (not a single JSON object, missing keys, invalid
    /// base64) yields [`Error::MalformedPacket`]; callers treat that as
    /// "no message this tick", never as fatal.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let envelope: Envelope = serde_json::from_slice(frame)
            .map_err(|e| Error::MalformedPacket(e.to_string()))?;
        let data = BASE64
            .decode(envelope.b.as_bytes())
            .map_err(|e| Error::MalformedPacket(format!("payload base64: {e}")))?;
        Ok(Self {
            command: envelope.c,
            source: envelope.s,
            destination: envelope.d,
            data,
            length: envelope.l,
        })
    }

    /// Slice the payload into little-endian unsigned integers of the given
    /// field sizes.
    pub fn unpack(&self, sizes: &[usize]) -> Vec<u64> {
        unpack_bytes(&self.data, sizes)
    }
}

/// Encode a logical value tuple into the compact payload buffer.
///
/// Rules, shared with the device firmware:
/// - `0` marks an absent slot: the position stays zero and the cursor
///   advances one byte;
/// - `0 < v < 256` occupies exactly one byte;
/// - `v < 0` occupies four bytes, little-endian two's complement;
/// - `v >= 256` occupies its own slot plus the run of absent slots that
///   immediately follow it, little-endian.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn encode_values(values: &[i64]) -> Vec<u8> {
    let mut data = vec![0u8; values.len()];
    let mut idx = 0;
    while idx < values.len() {
        let value = values[idx];
        if value == 0 {
            idx += 1;
        } else if value >= 256 {
            let width = absent_run(values, idx).min(MAX_PAYLOAD);
            let le = value.to_le_bytes();
            data[idx..idx + width].copy_from_slice(&le[..width]);
            idx += width;
        } else if value < 0 {
            let le = (value as i32).to_le_bytes();
            data[idx..idx + 4].copy_from_slice(&le);
            idx += 4;
        } else {
            data[idx] = value as u8;
            idx += 1;
        }
    }
    data
}

/// Length of the slot starting at `begin`: one byte plus every directly
/// following absent slot.
fn absent_run(values: &[i64], begin: usize) -> usize {
    let mut length = 1;
    for &v in &values[begin + 1..] {
        if v != 0 {
            break;
        }
        length += 1;
    }
    length
}

/// Slice raw payload bytes into little-endian unsigned integers.
///
/// Fields running past the end of the buffer read as zero-padded, matching
/// the device's fixed 8-byte buffer semantics.
pub fn unpack_bytes(data: &[u8], sizes: &[usize]) -> Vec<u64> {
    let mut result = Vec::with_capacity(sizes.len());
    let mut idx = 0;
    for &size in sizes {
        let mut word = [0u8; 8];
        let end = (idx + size).min(data.len());
        if idx < data.len() {
            word[..end - idx].copy_from_slice(&data[idx..end]);
        }
        result.push(u64::from_le_bytes(word));
        idx += size;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip() {
        let packet = Packet::with_values(0x28, BROADCAST_ID, BROADCAST_ID, &[0xFF, 0x0F]);
        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_envelope_key_order() {
        let packet = Packet::new(0x09, 0, 0xFFF, vec![4, 2]);
        let json = String::from_utf8(packet.encode()).unwrap();
        assert_eq!(json, r#"{"c":9,"s":0,"d":4095,"b":"BAI=","l":2}"#);
    }

    #[test]
    fn test_encode_values_all_absent() {
        assert_eq!(encode_values(&[0, 0, 0, 0]), vec![0; 4]);
    }

    #[test]
    fn test_encode_values_small() {
        assert_eq!(encode_values(&[0xFF, 0x0F]), vec![0xFF, 0x0F]);
    }

    #[test]
    fn test_encode_values_large_spans_absent_slots() {
        // 0x1234 lands in its own slot plus the two absent slots after it.
        let data = encode_values(&[0x1234, 0, 0, 7]);
        assert_eq!(data, vec![0x34, 0x12, 0x00, 7]);
    }

    #[test]
    fn test_encode_values_negative() {
        let data = encode_values(&[-2, 0, 0, 0, 9]);
        assert_eq!(data, vec![0xFE, 0xFF, 0xFF, 0xFF, 9]);
    }

    #[test]
    fn test_unpack_roundtrip() {
        let data = encode_values(&[0x1234, 0, 5]);
        let fields = unpack_bytes(&data, &[2, 1]);
        assert_eq!(fields, vec![0x1234, 5]);
    }

    #[test]
    fn test_unpack_uuid_and_version() {
        // 6-byte uuid + 2-byte version, the identity-response layout.
        let mut data = 0x0000_1234_5678_u64.to_le_bytes()[..6].to_vec();
        data.extend_from_slice(&0x4204_u16.to_le_bytes());
        let fields = unpack_bytes(&data, &[6, 2]);
        assert_eq!(fields, vec![0x0000_1234_5678, 0x4204]);
    }

    #[test]
    fn test_unpack_short_buffer_zero_padded() {
        let fields = unpack_bytes(&[0xAB], &[4, 1]);
        assert_eq!(fields, vec![0xAB, 0]);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Packet::decode(b"not json"),
            Err(Error::MalformedPacket(_))
        ));
        assert!(matches!(
            Packet::decode(br#"{"c":1}"#),
            Err(Error::MalformedPacket(_))
        ));
    }
}
