// File: src/codec.rs
//
// Stable binary wire encoding for events: a version byte followed by
// length-prefixed fields. Strings are u32-length-prefixed UTF-8,
// integers are big-endian i64, the payload is JSON bytes, metadata is a
// count-prefixed list of key/value pairs.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use trading_engine_core::error::{EventError, EventResult};
use trading_engine_core::event::{EventEnvelope, EventMetadata};

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

fn put_str(buf: &mut BytesMut, value: &str) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

fn put_bytes(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

fn get_str(buf: &mut Bytes) -> EventResult<String> {
    let raw = get_bytes(buf)?;
    String::from_utf8(raw).map_err(|e| EventError::DeserializationError {
        message: format!("field is not valid UTF-8: {}", e),
    })
}

fn get_bytes(buf: &mut Bytes) -> EventResult<Vec<u8>> {
    if buf.remaining() < 4 {
        return Err(EventError::DeserializationError {
            message: "truncated length prefix".to_string(),
        });
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(EventError::DeserializationError {
            message: format!("truncated field: need {} bytes, have {}", len, buf.remaining()),
        });
    }
    Ok(buf.copy_to_bytes(len).to_vec())
}

fn get_i64(buf: &mut Bytes) -> EventResult<i64> {
    if buf.remaining() < 8 {
        return Err(EventError::DeserializationError {
            message: "truncated i64 field".to_string(),
        });
    }
    Ok(buf.get_i64())
}

/// Encode an event into its wire representation.
pub fn encode_event(event: &EventEnvelope) -> EventResult<Bytes> {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_u8(WIRE_VERSION);
    put_str(&mut buf, &event.event_id.to_string());
    put_str(&mut buf, &event.aggregate_id);
    put_str(&mut buf, &event.aggregate_kind);
    put_str(&mut buf, &event.event_kind);
    buf.put_i64(event.version);
    let nanos = event
        .occurred_at
        .timestamp_nanos_opt()
        .ok_or_else(|| EventError::SerializationError {
            message: format!("timestamp {} out of nanosecond range", event.occurred_at),
        })?;
    buf.put_i64(nanos);
    put_bytes(&mut buf, &serde_json::to_vec(&event.payload)?);

    let metadata = event.metadata.to_map();
    buf.put_u32(metadata.len() as u32);
    // Sorted so identical metadata always encodes identically.
    let mut entries: Vec<(&String, &String)> = metadata.iter().collect();
    entries.sort();
    for (key, value) in entries {
        put_str(&mut buf, key);
        put_str(&mut buf, value);
    }
    Ok(buf.freeze())
}

/// Decode an event from its wire representation.
pub fn decode_event(raw: &[u8]) -> EventResult<EventEnvelope> {
    let mut buf = Bytes::copy_from_slice(raw);
    if buf.remaining() < 1 {
        return Err(EventError::DeserializationError {
            message: "empty frame".to_string(),
        });
    }
    let version = buf.get_u8();
    if version != WIRE_VERSION {
        return Err(EventError::DeserializationError {
            message: format!("unsupported wire version {}", version),
        });
    }

    let event_id = get_str(&mut buf)?;
    let event_id = Uuid::parse_str(&event_id).map_err(|e| EventError::DeserializationError {
        message: format!("bad event id '{}': {}", event_id, e),
    })?;
    let aggregate_id = get_str(&mut buf)?;
    let aggregate_kind = get_str(&mut buf)?;
    let event_kind = get_str(&mut buf)?;
    let event_version = get_i64(&mut buf)?;
    let nanos = get_i64(&mut buf)?;
    let occurred_at = DateTime::<Utc>::from_timestamp_nanos(nanos);
    let payload: serde_json::Value =
        serde_json::from_slice(&get_bytes(&mut buf)?).map_err(|e| {
            EventError::DeserializationError {
                message: format!("payload is not valid JSON: {}", e),
            }
        })?;

    if buf.remaining() < 4 {
        return Err(EventError::DeserializationError {
            message: "truncated metadata count".to_string(),
        });
    }
    let entry_count = buf.get_u32() as usize;
    // Each entry carries at least two length prefixes; a count the
    // remaining frame cannot hold is a corrupt header, not an
    // allocation request.
    if entry_count.saturating_mul(8) > buf.remaining() {
        return Err(EventError::DeserializationError {
            message: format!(
                "metadata count {} exceeds remaining frame ({} bytes)",
                entry_count,
                buf.remaining()
            ),
        });
    }
    let mut map = HashMap::with_capacity(entry_count);
    for _ in 0..entry_count {
        let key = get_str(&mut buf)?;
        let value = get_str(&mut buf)?;
        map.insert(key, value);
    }

    Ok(EventEnvelope {
        event_id,
        aggregate_id,
        aggregate_kind,
        event_kind,
        version: event_version,
        occurred_at,
        payload,
        metadata: EventMetadata::from_map(map),
    })
}
