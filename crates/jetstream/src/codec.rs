//! Binary format for persisted stream entries
//!
//! Format:
//! ```text
//! [version: u8]
//! [timestamp_micros: i64]
//! [sequence: u64]
//! [subject_len: u16][subject_bytes]
//! [header_count: u16]
//! For each header:
//!   [header_id: u8]
//!   If header_id == 0xFF (custom):
//!     [name_len: u16][name_bytes]
//!   [value_len: u16][value_bytes]
//! [payload_len: u32]
//! [payload_bytes]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::DateTime;

use crate::message::{StoredMessage, headers};

const FORMAT_VERSION: u8 = 1;
const CUSTOM_HEADER: u8 = 0xFF;

/// Headers encoded as a single byte
const KNOWN_HEADERS: &[(u8, &str)] = &[
    (0x01, headers::KV_OPERATION),
    (0x02, headers::CONTENT_TYPE),
];

/// Errors that can occur during serialization/deserialization
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    /// Buffer too small
    #[error("Buffer too small while reading {0}")]
    BufferTooSmall(&'static str),

    /// A field does not fit its length prefix
    #[error("Field too long: {0}")]
    FieldTooLong(&'static str),

    /// Invalid header ID
    #[error("Invalid header ID: {0}")]
    InvalidHeaderId(u8),

    /// Timestamp out of range
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(i64),

    /// String decode error
    #[error("Invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// Entry written by an unknown format version
    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u8),
}

fn header_id(name: &str) -> Option<u8> {
    KNOWN_HEADERS
        .iter()
        .find(|(_, known)| *known == name)
        .map(|(id, _)| *id)
}

fn header_name(id: u8) -> Option<&'static str> {
    KNOWN_HEADERS
        .iter()
        .find(|(known, _)| *known == id)
        .map(|(_, name)| *name)
}

fn put_str_u16(buf: &mut BytesMut, value: &str, field: &'static str) -> Result<(), FormatError> {
    let len = u16::try_from(value.len()).map_err(|_| FormatError::FieldTooLong(field))?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn get_u16_len(buf: &mut &[u8], field: &'static str) -> Result<usize, FormatError> {
    if buf.remaining() < 2 {
        return Err(FormatError::BufferTooSmall(field));
    }
    Ok(usize::from(buf.get_u16()))
}

fn get_string(buf: &mut &[u8], len: usize, field: &'static str) -> Result<String, FormatError> {
    if buf.remaining() < len {
        return Err(FormatError::BufferTooSmall(field));
    }
    let bytes = buf.copy_to_bytes(len);
    Ok(String::from_utf8(bytes.to_vec())?)
}

/// Serialize a stored message into binary format
pub fn serialize_entry(message: &StoredMessage) -> Result<Bytes, FormatError> {
    let header_count =
        u16::try_from(message.headers.len()).map_err(|_| FormatError::FieldTooLong("headers"))?;
    let payload_len =
        u32::try_from(message.payload.len()).map_err(|_| FormatError::FieldTooLong("payload"))?;

    let header_bytes: usize = message
        .headers
        .iter()
        .map(|(name, value)| 1 + 2 + name.len() + 2 + value.len())
        .sum();
    let size = 1 + 8 + 8 + 2 + message.subject.len() + 2 + header_bytes + 4 + message.payload.len();

    let mut buf = BytesMut::with_capacity(size);
    buf.put_u8(FORMAT_VERSION);
    buf.put_i64(message.timestamp.timestamp_micros());
    buf.put_u64(message.sequence);
    put_str_u16(&mut buf, &message.subject, "subject")?;

    buf.put_u16(header_count);
    for (name, value) in &message.headers {
        match header_id(name) {
            Some(id) => buf.put_u8(id),
            None => {
                buf.put_u8(CUSTOM_HEADER);
                put_str_u16(&mut buf, name, "header name")?;
            }
        }
        put_str_u16(&mut buf, value, "header value")?;
    }

    buf.put_u32(payload_len);
    buf.put_slice(&message.payload);

    Ok(buf.freeze())
}

/// Deserialize a stored message from binary format
pub fn deserialize_entry(data: &[u8]) -> Result<StoredMessage, FormatError> {
    let mut buf = data;

    if buf.remaining() < 1 + 8 + 8 {
        return Err(FormatError::BufferTooSmall("entry prefix"));
    }

    let version = buf.get_u8();
    if version != FORMAT_VERSION {
        return Err(FormatError::UnsupportedVersion(version));
    }

    let micros = buf.get_i64();
    let timestamp =
        DateTime::from_timestamp_micros(micros).ok_or(FormatError::InvalidTimestamp(micros))?;
    let sequence = buf.get_u64();

    let subject_len = get_u16_len(&mut buf, "subject length")?;
    let subject = get_string(&mut buf, subject_len, "subject")?;

    let header_count = get_u16_len(&mut buf, "header count")?;
    let mut message_headers = Vec::with_capacity(header_count);
    for _ in 0..header_count {
        if !buf.has_remaining() {
            return Err(FormatError::BufferTooSmall("header id"));
        }

        let id = buf.get_u8();
        let name = if id == CUSTOM_HEADER {
            let name_len = get_u16_len(&mut buf, "header name length")?;
            get_string(&mut buf, name_len, "header name")?
        } else {
            header_name(id)
                .ok_or(FormatError::InvalidHeaderId(id))?
                .to_string()
        };

        let value_len = get_u16_len(&mut buf, "header value length")?;
        let value = get_string(&mut buf, value_len, "header value")?;
        message_headers.push((name, value));
    }

    if buf.remaining() < 4 {
        return Err(FormatError::BufferTooSmall("payload length"));
    }
    let payload_len = buf.get_u32() as usize;
    if buf.remaining() < payload_len {
        return Err(FormatError::BufferTooSmall("payload"));
    }
    let payload = buf.copy_to_bytes(payload_len);

    Ok(StoredMessage {
        sequence,
        subject,
        payload,
        headers: message_headers,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{TimeZone, Utc};

    fn sample() -> StoredMessage {
        StoredMessage {
            sequence: 42,
            subject: "$KV.profiles.sue.color".to_string(),
            payload: Bytes::from_static(b"blue"),
            headers: vec![
                (headers::KV_OPERATION.to_string(), "DEL".to_string()),
                ("X-Trace".to_string(), "abc".to_string()),
            ],
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
        }
    }

    #[test]
    fn test_known_and_custom_headers_survive() {
        let message = sample();
        let decoded = deserialize_entry(&serialize_entry(&message).unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_known_header_is_compact() {
        let mut with_known = sample();
        with_known.headers = vec![(headers::KV_OPERATION.to_string(), "DEL".to_string())];
        let mut with_custom = sample();
        with_custom.headers = vec![("KV-Operatiom".to_string(), "DEL".to_string())];

        let known_len = serialize_entry(&with_known).unwrap().len();
        let custom_len = serialize_entry(&with_custom).unwrap().len();
        assert_eq!(custom_len - known_len, 2 + headers::KV_OPERATION.len());
    }

    #[test]
    fn test_truncated_entry_rejected() {
        let encoded = serialize_entry(&sample()).unwrap();
        let truncated = &encoded[..encoded.len() - 2];

        assert!(matches!(
            deserialize_entry(truncated),
            Err(FormatError::BufferTooSmall("payload"))
        ));
        assert!(matches!(
            deserialize_entry(&[]),
            Err(FormatError::BufferTooSmall(_))
        ));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut encoded = serialize_entry(&sample()).unwrap().to_vec();
        encoded[0] = 9;

        assert!(matches!(
            deserialize_entry(&encoded),
            Err(FormatError::UnsupportedVersion(9))
        ));
    }
}
