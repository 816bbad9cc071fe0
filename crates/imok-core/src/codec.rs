//! Wire codec for messages.
//!
//! The compact binary record is what travels over the narrowband link:
//!
//! ```text
//! offset size field
//! 0      1    magic/version (0xA1)
//! 1      1    flags: bit0 downlink, bit1 location, bit2 accuracy, bit3 ack
//! 2      8    message id (u64, big-endian)
//! 10     8    timestamp, ms since Unix epoch (i64, big-endian)
//! 18     8    lat e7 (i32), lon e7 (i32)       when bit1
//! +      2    accuracy in metres (u16)         when bit2
//! +      8    acknowledged message id (u64)    when bit3
//! rest   n    UTF-8 text
//! ```
//!
//! Links that only carry printable text use the uppercase hex armor of the
//! same bytes. [`decode_payload`] accepts either form and also understands
//! the legacy plain-text and `["LOCATION","<lat>","<lon>"]` payloads.
//!
//! Relay JSON helpers ([`DownlinkRequest`], [`harvest_entry`]) cover the
//! submission body and the stored uplink record shape.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::message::{Direction, Location, Message, MessageId};

/// Magic/version byte that opens every binary record.
pub const MAGIC: u8 = 0xA1;

/// Length of the fixed header (magic, flags, id, timestamp).
pub const HEADER_LEN: usize = 18;

const FLAG_DOWNLINK: u8 = 0x01;
const FLAG_LOCATION: u8 = 0x02;
const FLAG_ACCURACY: u8 = 0x04;
const FLAG_ACK: u8 = 0x08;
const KNOWN_FLAGS: u8 = FLAG_DOWNLINK | FLAG_LOCATION | FLAG_ACCURACY | FLAG_ACK;

/// A decoded wire record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// A text and/or location message.
    Message(Message),
    /// Confirmation that `acked` was received.
    Ack {
        /// Id of the acknowledgment record itself.
        id: MessageId,
        /// Direction the acknowledgment travels.
        direction: Direction,
        /// Id of the message being confirmed.
        acked: MessageId,
        /// When the acknowledgment was produced.
        timestamp: DateTime<Utc>,
    },
}

fn header(flags: u8, id: MessageId, timestamp: DateTime<Utc>, capacity: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(capacity);
    out.push(MAGIC);
    out.push(flags);
    out.extend_from_slice(&id.0.to_be_bytes());
    out.extend_from_slice(&timestamp.timestamp_millis().to_be_bytes());
    out
}

fn message_flags(m: &Message) -> u8 {
    let mut flags = 0;
    if m.direction() == Direction::Downlink {
        flags |= FLAG_DOWNLINK;
    }
    if let Some(loc) = m.location() {
        flags |= FLAG_LOCATION;
        if loc.accuracy_m().is_some() {
            flags |= FLAG_ACCURACY;
        }
    }
    flags
}

fn fixed_len(m: &Message) -> usize {
    let mut len = HEADER_LEN;
    if let Some(loc) = m.location() {
        len += 8;
        if loc.accuracy_m().is_some() {
            len += 2;
        }
    }
    len
}

fn encode_with_text(m: &Message, text: &str) -> Vec<u8> {
    let mut out = header(
        message_flags(m),
        m.id(),
        m.timestamp(),
        fixed_len(m) + text.len(),
    );
    if let Some(loc) = m.location() {
        out.extend_from_slice(&loc.lat_e7().to_be_bytes());
        out.extend_from_slice(&loc.lon_e7().to_be_bytes());
        if let Some(acc) = loc.accuracy_m() {
            out.extend_from_slice(&acc.to_be_bytes());
        }
    }
    out.extend_from_slice(text.as_bytes());
    out
}

/// Size of the binary record for `m`.
pub fn encoded_len(m: &Message) -> usize {
    fixed_len(m) + m.text().len()
}

/// Encode a message as a binary record.
pub fn encode(m: &Message) -> Vec<u8> {
    encode_with_text(m, m.text())
}

/// Encode a message, truncating its text so the record fits in `budget`.
///
/// This is lossy: the text is cut at the last character boundary that fits.
/// Fails with [`Error::PayloadTooLarge`] when even the empty-text record
/// exceeds the budget.
pub fn encode_truncated(m: &Message, budget: usize) -> Result<Vec<u8>> {
    let fixed = fixed_len(m);
    if fixed > budget {
        return Err(Error::PayloadTooLarge {
            len: fixed,
            mtu: budget,
        });
    }
    let room = budget - fixed;
    let text = m.text();
    if text.len() <= room {
        return Ok(encode_with_text(m, text));
    }
    let mut cut = room;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    Ok(encode_with_text(m, &text[..cut]))
}

/// Encode an acknowledgment record for `acked`.
pub fn encode_ack(
    id: MessageId,
    direction: Direction,
    acked: MessageId,
    timestamp: DateTime<Utc>,
) -> Vec<u8> {
    let mut flags = FLAG_ACK;
    if direction == Direction::Downlink {
        flags |= FLAG_DOWNLINK;
    }
    let mut out = header(flags, id, timestamp, HEADER_LEN + 8);
    out.extend_from_slice(&acked.0.to_be_bytes());
    out
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take<const N: usize>(&mut self, field: &str) -> Result<[u8; N]> {
        let end = self.pos + N;
        let slice = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| Error::Decode(format!("record truncated in {field}")))?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

/// Decode a binary record.
pub fn decode(bytes: &[u8]) -> Result<Record> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::Decode(format!(
            "record of {} bytes is shorter than the {HEADER_LEN}-byte header",
            bytes.len()
        )));
    }
    if bytes[0] != MAGIC {
        return Err(Error::Decode(format!("bad magic byte 0x{:02X}", bytes[0])));
    }
    let flags = bytes[1];
    if flags & !KNOWN_FLAGS != 0 {
        return Err(Error::Decode(format!("unknown flags 0x{flags:02X}")));
    }

    let mut r = Reader { buf: bytes, pos: 2 };
    let id = MessageId(u64::from_be_bytes(r.take::<8>("id")?));
    let ms = i64::from_be_bytes(r.take::<8>("timestamp")?);
    let timestamp = DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::Decode(format!("timestamp out of range: {ms}")))?;
    let direction = if flags & FLAG_DOWNLINK != 0 {
        Direction::Downlink
    } else {
        Direction::Uplink
    };

    if flags & FLAG_ACK != 0 {
        if flags & (FLAG_LOCATION | FLAG_ACCURACY) != 0 {
            return Err(Error::Decode("ack record carries a location".into()));
        }
        let acked = MessageId(u64::from_be_bytes(r.take::<8>("acked id")?));
        return Ok(Record::Ack {
            id,
            direction,
            acked,
            timestamp,
        });
    }

    let location = if flags & FLAG_LOCATION != 0 {
        let lat = i32::from_be_bytes(r.take::<4>("latitude")?);
        let lon = i32::from_be_bytes(r.take::<4>("longitude")?);
        let loc = Location::from_e7(lat, lon).map_err(|e| Error::Decode(e.to_string()))?;
        if flags & FLAG_ACCURACY != 0 {
            Some(loc.with_accuracy(u16::from_be_bytes(r.take::<2>("accuracy")?)))
        } else {
            Some(loc)
        }
    } else if flags & FLAG_ACCURACY != 0 {
        return Err(Error::Decode("accuracy without location".into()));
    } else {
        None
    };

    let text = std::str::from_utf8(r.rest())
        .map_err(|e| Error::Decode(format!("text is not UTF-8: {e}")))?
        .to_string();

    Ok(Record::Message(Message::from_parts(
        id, direction, timestamp, location, text,
    )))
}

/// Hex-armor a binary record for text-only links.
pub fn armor(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

/// Reverse [`armor`]. Accepts either case and surrounding whitespace.
pub fn dearmor(text: &str) -> Result<Vec<u8>> {
    hex::decode(text.trim()).map_err(|e| Error::Decode(format!("bad hex armor: {e}")))
}

fn looks_armored(bytes: &[u8]) -> bool {
    bytes.len() >= HEADER_LEN * 2
        && bytes.len() % 2 == 0
        && bytes[..2].eq_ignore_ascii_case(b"A1")
        && bytes.iter().all(u8::is_ascii_hexdigit)
}

/// Decode any payload a device or the relay may carry.
///
/// Binary records and their hex armor decode strictly. Anything else is a
/// legacy payload: `["LOCATION","<lat>","<lon>"]` becomes a location-only
/// message and other UTF-8 becomes a text message. Legacy messages take
/// `record_time` as their timestamp and an id derived from it and the
/// payload, so the same record always decodes to the same value.
pub fn decode_payload(
    bytes: &[u8],
    record_time: DateTime<Utc>,
    direction: Direction,
) -> Result<Record> {
    if bytes.first() == Some(&MAGIC) {
        return decode(bytes);
    }
    let trimmed = bytes.trim_ascii();
    if looks_armored(trimmed) {
        let text = std::str::from_utf8(trimmed).map_err(|e| Error::Decode(e.to_string()))?;
        if let Ok(record) = dearmor(text).and_then(|raw| decode(&raw)) {
            return Ok(record);
        }
    }
    decode_legacy(bytes, record_time, direction)
}

fn decode_legacy(bytes: &[u8], record_time: DateTime<Utc>, direction: Direction) -> Result<Record> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::Decode(format!("payload is not UTF-8: {e}")))?;
    let record_time = crate::message::truncate_to_millis(record_time);
    let id = MessageId::from_digest(record_time.timestamp_millis(), bytes);

    if let Some(location) = parse_legacy_location(text)? {
        return Ok(Record::Message(Message::from_parts(
            id,
            direction,
            record_time,
            Some(location),
            String::new(),
        )));
    }
    Ok(Record::Message(Message::from_parts(
        id,
        direction,
        record_time,
        None,
        text.to_string(),
    )))
}

fn parse_legacy_location(text: &str) -> Result<Option<Location>> {
    let Ok(serde_json::Value::Array(items)) = serde_json::from_str::<serde_json::Value>(text)
    else {
        return Ok(None);
    };
    if items.len() != 3 || items[0].as_str() != Some("LOCATION") {
        return Ok(None);
    }
    let coord = |v: &serde_json::Value| -> Option<f64> {
        match v {
            serde_json::Value::String(s) => s.trim().parse().ok(),
            serde_json::Value::Number(n) => n.as_f64(),
            _ => None,
        }
    };
    let (Some(lat), Some(lon)) = (coord(&items[1]), coord(&items[2])) else {
        return Err(Error::Decode(format!("unparseable legacy location: {text}")));
    };
    Location::from_degrees(lat, lon)
        .map(Some)
        .map_err(|e| Error::Decode(e.to_string()))
}

/// Encode a location in the legacy JSON form.
pub fn encode_legacy_location(location: &Location) -> String {
    serde_json::json!([
        "LOCATION",
        format!("{:.7}", location.latitude()),
        format!("{:.7}", location.longitude())
    ])
    .to_string()
}

/// Body of a relay downlink submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownlinkRequest {
    /// Destination UDP port on the device.
    pub port: u16,
    /// Always `"base64"`.
    pub payload_type: String,
    /// Base64 of the datagram.
    pub payload: String,
}

impl DownlinkRequest {
    /// Wrap a datagram for submission.
    pub fn new(port: u16, datagram: &[u8]) -> Self {
        DownlinkRequest {
            port,
            payload_type: "base64".to_string(),
            payload: BASE64.encode(datagram),
        }
    }
}

/// Extract `(time_ms, payload)` from one stored uplink record.
///
/// `content` may be an object with a base64 `payload`, a JSON string holding
/// such an object, or a bare string. A payload that is not valid base64 is
/// taken verbatim.
pub fn harvest_entry(entry: &serde_json::Value) -> Result<(i64, Vec<u8>)> {
    let time_ms = entry
        .get("time")
        .and_then(serde_json::Value::as_i64)
        .ok_or_else(|| Error::Decode("record without time".into()))?;

    let payload_field = |obj: &serde_json::Value| -> Option<String> {
        obj.get("payload")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
    };
    let raw = match entry.get("content") {
        Some(content @ serde_json::Value::Object(_)) => payload_field(content).unwrap_or_default(),
        Some(serde_json::Value::String(s)) => match serde_json::from_str::<serde_json::Value>(s) {
            Ok(inner @ serde_json::Value::Object(_)) => payload_field(&inner).unwrap_or_default(),
            _ => s.clone(),
        },
        Some(other) => return Err(Error::Decode(format!("unexpected content: {other}"))),
        None => return Err(Error::Decode("record without content".into())),
    };

    let payload = BASE64
        .decode(raw.as_bytes())
        .unwrap_or_else(|_| raw.into_bytes());
    Ok((time_ms, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    fn sample() -> Message {
        Message::new(MessageId::new(0xCAFE, 9), Direction::Uplink, "I'm OK")
            .with_timestamp(ts(1_700_000_000_123))
            .with_location(
                Location::from_degrees(35.6812362, 139.7671248)
                    .unwrap()
                    .with_accuracy(8),
            )
    }

    fn unwrap_message(r: Record) -> Message {
        match r {
            Record::Message(m) => m,
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn binary_layout() {
        let m = Message::new(MessageId(0x0102030405060708), Direction::Downlink, "hi")
            .with_timestamp(ts(0x10));
        let bytes = encode(&m);
        assert_eq!(bytes[0], MAGIC);
        assert_eq!(bytes[1], FLAG_DOWNLINK);
        assert_eq!(&bytes[2..10], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[10..18], &[0, 0, 0, 0, 0, 0, 0, 0x10]);
        assert_eq!(&bytes[18..], b"hi");
        assert_eq!(encoded_len(&m), bytes.len());
    }

    #[test]
    fn round_trip_with_location_and_accuracy() {
        let m = sample();
        let bytes = encode(&m);
        assert_eq!(bytes.len(), HEADER_LEN + 8 + 2 + "I'm OK".len());
        assert_eq!(unwrap_message(decode(&bytes).unwrap()), m);
    }

    #[test]
    fn round_trip_location_only() {
        let loc = Location::from_degrees(-33.8688, 151.2093).unwrap();
        let m = Message::location_only(MessageId(5), Direction::Uplink, loc)
            .with_timestamp(ts(1_000));
        let bytes = encode(&m);
        assert_eq!(bytes.len(), 26);
        let back = unwrap_message(decode(&bytes).unwrap());
        assert_eq!(back, m);
        assert_eq!(back.text(), "");
    }

    #[test]
    fn decode_is_idempotent() {
        let bytes = encode(&sample());
        assert_eq!(decode(&bytes).unwrap(), decode(&bytes).unwrap());
    }

    #[test]
    fn decode_rejects_short_record() {
        let bytes = encode(&sample());
        let err = decode(&bytes[..HEADER_LEN - 1]).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        // Location flag set but coordinates cut off.
        let err = decode(&bytes[..HEADER_LEN + 4]).unwrap_err();
        assert!(err.to_string().contains("latitude") || err.to_string().contains("longitude"));
    }

    #[test]
    fn decode_rejects_bad_magic_and_flags() {
        let mut bytes = encode(&sample());
        bytes[0] = 0xA2;
        assert!(matches!(decode(&bytes), Err(Error::Decode(_))));
        let mut bytes = encode(&sample());
        bytes[1] |= 0x80;
        assert!(decode(&bytes).unwrap_err().to_string().contains("flags"));
    }

    #[test]
    fn decode_rejects_out_of_range_location() {
        let mut bytes = encode(&sample());
        bytes[18..22].copy_from_slice(&910_000_000i32.to_be_bytes());
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        assert!(err.to_string().contains("latitude"));
    }

    #[test]
    fn decode_rejects_invalid_utf8() {
        let m = Message::new(MessageId(1), Direction::Uplink, "").with_timestamp(ts(1));
        let mut bytes = encode(&m);
        bytes.extend_from_slice(&[0xFF, 0xFE]);
        assert!(decode(&bytes).unwrap_err().to_string().contains("UTF-8"));
    }

    #[test]
    fn truncation_is_lossy_on_char_boundary() {
        // Each "あ" is three bytes.
        let m = Message::new(MessageId(1), Direction::Uplink, "ああああ").with_timestamp(ts(1));
        let bytes = encode_truncated(&m, HEADER_LEN + 7).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 6);
        let back = unwrap_message(decode(&bytes).unwrap());
        assert_eq!(back.text(), "ああ");
        assert_ne!(back, m);
        assert_eq!(back.id(), m.id());
    }

    #[test]
    fn truncation_keeps_fitting_message_intact() {
        let m = sample();
        let bytes = encode_truncated(&m, 1024).unwrap();
        assert_eq!(bytes, encode(&m));
    }

    #[test]
    fn truncation_fails_when_header_does_not_fit() {
        let err = encode_truncated(&sample(), 20).unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { len: 28, mtu: 20 }));
    }

    #[test]
    fn ack_round_trip() {
        let bytes = encode_ack(MessageId(2), Direction::Uplink, MessageId(77), ts(5));
        assert_eq!(bytes.len(), HEADER_LEN + 8);
        match decode(&bytes).unwrap() {
            Record::Ack {
                id,
                direction,
                acked,
                timestamp,
            } => {
                assert_eq!(id, MessageId(2));
                assert_eq!(direction, Direction::Uplink);
                assert_eq!(acked, MessageId(77));
                assert_eq!(timestamp, ts(5));
            }
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[test]
    fn armored_payload_decodes() {
        let m = sample();
        let armored = armor(&encode(&m));
        assert!(armored.starts_with("A1"));
        assert!(armored.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
        let back = decode_payload(armored.as_bytes(), ts(0), Direction::Downlink).unwrap();
        assert_eq!(unwrap_message(back), m);
    }

    #[test]
    fn legacy_text_gets_deterministic_id() {
        let at = ts(1_700_000_000_000);
        let a = unwrap_message(decode_payload(b"hello", at, Direction::Uplink).unwrap());
        let b = unwrap_message(decode_payload(b"hello", at, Direction::Uplink).unwrap());
        assert_eq!(a, b);
        assert_eq!(a.text(), "hello");
        assert_eq!(a.timestamp(), at);
        assert_eq!(a.id(), MessageId::from_digest(at.timestamp_millis(), b"hello"));
    }

    #[test]
    fn legacy_location_json() {
        let raw = br#"["LOCATION","35.681236","139.767125"]"#;
        let m = unwrap_message(decode_payload(raw, ts(10), Direction::Uplink).unwrap());
        let loc = m.location().unwrap();
        assert_eq!(loc.lat_e7(), 356_812_360);
        assert_eq!(loc.lon_e7(), 1_397_671_250);
        assert_eq!(m.text(), "");

        let bad = br#"["LOCATION","north","139.7"]"#;
        assert!(decode_payload(bad, ts(10), Direction::Uplink).is_err());
    }

    #[test]
    fn legacy_location_encoding() {
        let loc = Location::from_degrees(35.5, -120.25).unwrap();
        assert_eq!(
            encode_legacy_location(&loc),
            r#"["LOCATION","35.5000000","-120.2500000"]"#
        );
    }

    #[test]
    fn downlink_request_json() {
        let req = DownlinkRequest::new(55555, b"hi");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"port": 55555, "payloadType": "base64", "payload": "aGk="})
        );
    }

    #[test]
    fn harvest_entry_shapes() {
        let obj = serde_json::json!({"time": 100, "content": {"payload": "aGk="}});
        assert_eq!(harvest_entry(&obj).unwrap(), (100, b"hi".to_vec()));

        let nested = serde_json::json!({"time": 101, "content": "{\"payload\":\"aGk=\"}"});
        assert_eq!(harvest_entry(&nested).unwrap(), (101, b"hi".to_vec()));

        let plain = serde_json::json!({"time": 102, "content": "not base64!"});
        assert_eq!(harvest_entry(&plain).unwrap(), (102, b"not base64!".to_vec()));

        let no_time = serde_json::json!({"content": {"payload": "aGk="}});
        assert!(harvest_entry(&no_time).is_err());
    }
}
