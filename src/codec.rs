//! Frame Codec — fixed-size record serialization and the batch wire envelope.
//!
//! Replaces the source's raw-pointer-into-field-array marshalling with a
//! typed codec over a declared field list, and fixes the wire byte order to
//! little-endian instead of inheriting host-native order (see DESIGN.md).

use crate::error::{Error, Result};
use crate::plot::PlotRecord;

/// drone_id(u32) + node_id(u32) + timestamp(i64) + latitude(f32) + longitude(f32)
pub const RECORD_SIZE: usize = 4 + 4 + 8 + 4 + 4;

/// Serializes a single record into its fixed-size wire representation.
/// `flags` is local metadata only and is never serialized.
pub fn serialize(record: &PlotRecord) -> [u8; RECORD_SIZE] {
    let mut buf = [0u8; RECORD_SIZE];
    buf[0..4].copy_from_slice(&record.drone_id.to_le_bytes());
    buf[4..8].copy_from_slice(&record.node_id.to_le_bytes());
    buf[8..16].copy_from_slice(&record.timestamp.to_le_bytes());
    buf[16..20].copy_from_slice(&record.latitude.to_le_bytes());
    buf[20..24].copy_from_slice(&record.longitude.to_le_bytes());
    buf
}

/// Deserializes a record starting at `offset` in `buf`. Fails when fewer
/// than `RECORD_SIZE` bytes remain.
pub fn deserialize(buf: &[u8], offset: usize) -> Result<PlotRecord> {
    if buf.len() < offset + RECORD_SIZE {
        return Err(Error::Framing(format!(
            "not enough bytes to deserialize a record: need {RECORD_SIZE}, have {}",
            buf.len().saturating_sub(offset)
        )));
    }
    let b = &buf[offset..offset + RECORD_SIZE];
    let drone_id = u32::from_le_bytes(b[0..4].try_into().unwrap());
    let node_id = u32::from_le_bytes(b[4..8].try_into().unwrap());
    let timestamp = i64::from_le_bytes(b[8..16].try_into().unwrap());
    let latitude = f32::from_le_bytes(b[16..20].try_into().unwrap());
    let longitude = f32::from_le_bytes(b[20..24].try_into().unwrap());
    Ok(PlotRecord::new(drone_id, node_id, timestamp, latitude, longitude))
}

/// Encodes a batch of records as `[u32 count][count × record]`.
pub fn encode_batch(records: &[PlotRecord]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + records.len() * RECORD_SIZE);
    buf.extend_from_slice(&(records.len() as u32).to_le_bytes());
    for r in records {
        buf.extend_from_slice(&serialize(r));
    }
    buf
}

/// Decodes a batch message, rejecting any payload whose length is not
/// exactly `4 + k * RECORD_SIZE` for some count k (which itself must match
/// the embedded count field).
pub fn decode_batch(buf: &[u8]) -> Result<Vec<PlotRecord>> {
    if buf.len() < 4 {
        return Err(Error::Framing(format!(
            "batch message too short: {} bytes",
            buf.len()
        )));
    }
    let count = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
    let expected_len = 4 + count * RECORD_SIZE;
    if buf.len() != expected_len {
        return Err(Error::Framing(format!(
            "batch message length {} does not match count {count} (expected {expected_len})",
            buf.len()
        )));
    }
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        out.push(deserialize(buf, 4 + i * RECORD_SIZE)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PlotRecord {
        PlotRecord::new(1, 2, 100, 12.5, -34.25)
    }

    #[test]
    fn record_round_trip_preserves_semantic_fields() {
        let r = sample();
        let bytes = serialize(&r);
        let back = deserialize(&bytes, 0).unwrap();
        assert_eq!(back.drone_id, r.drone_id);
        assert_eq!(back.node_id, r.node_id);
        assert_eq!(back.timestamp, r.timestamp);
        assert_eq!(back.latitude, r.latitude);
        assert_eq!(back.longitude, r.longitude);
        // flags are not part of the wire format
        assert_eq!(back.flags(), 0);
    }

    #[test]
    fn deserialize_fails_on_short_buffer() {
        let bytes = serialize(&sample());
        assert!(deserialize(&bytes[..RECORD_SIZE - 1], 0).is_err());
    }

    #[test]
    fn batch_round_trip_preserves_order() {
        let records = vec![
            PlotRecord::new(1, 1, 100, 0.0, 0.0),
            PlotRecord::new(2, 2, 101, 1.5, -1.5),
            PlotRecord::new(3, 3, 102, -9.0, 9.0),
        ];
        let encoded = encode_batch(&records);
        let decoded = decode_batch(&encoded).unwrap();
        assert_eq!(decoded.len(), records.len());
        for (a, b) in decoded.iter().zip(records.iter()) {
            assert_eq!(a.drone_id, b.drone_id);
            assert_eq!(a.node_id, b.node_id);
            assert_eq!(a.timestamp, b.timestamp);
            assert_eq!(a.latitude, b.latitude);
            assert_eq!(a.longitude, b.longitude);
        }
    }

    #[test]
    fn empty_batch_round_trips() {
        let encoded = encode_batch(&[]);
        assert_eq!(encoded.len(), 4);
        let decoded = decode_batch(&encoded).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn decode_batch_rejects_wrong_length() {
        let mut encoded = encode_batch(&[sample()]);
        encoded.push(0xAB); // one stray byte
        assert!(decode_batch(&encoded).is_err());
    }

    #[test]
    fn decode_batch_rejects_short_header() {
        assert!(decode_batch(&[1, 2, 3]).is_err());
    }
}
