//! Messages, broker commands and the length-prefixed frame codec
//!
//! Every frame is a big-endian `u32` length followed by a one-byte command
//! tag and the command body. Strings carry an `i16` length (`-1` for none),
//! byte arrays an `i32` length.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ClientError, ServerError};

pub type ProducerId = u64;
pub type RequestId = u64;
pub type SequenceId = u64;

/// Protocol revision announced in `Connect`
pub const PROTOCOL_VERSION: i32 = 1;

/// Frames above this size are rejected before buffering
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Longest string an `i16` length prefix can carry
pub const MAX_STRING_LEN: usize = i16::MAX as usize;

/// Bytes of a `Send` frame that precede its messages: tag, producer id,
/// both sequence ids and the message count
pub const SEND_FRAME_OVERHEAD: usize = 1 + 8 + 8 + 8 + 4;

/// Largest message section a single `Send` frame may carry
pub const MAX_BATCH_BYTES: usize = MAX_FRAME_SIZE - SEND_FRAME_OVERHEAD;

/// A message to publish; immutable once handed to a producer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub payload: Bytes,
    pub key: Option<String>,
    pub properties: HashMap<String, String>,
    /// Application event time in milliseconds since the epoch
    pub event_time: Option<u64>,
}

impl Message {
    pub fn new<V: Into<Bytes>>(payload: V) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_key<K: Into<String>>(mut self, key: K) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_property<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_event_time(mut self, event_time: u64) -> Self {
        self.event_time = Some(event_time);
        self
    }

    /// Payload size checked against the negotiated maximum
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Bytes this message occupies inside a `Send` frame
    pub fn encoded_len(&self) -> usize {
        let key = 2 + self.key.as_ref().map_or(0, String::len);
        let properties: usize = self
            .properties
            .iter()
            .map(|(k, v)| 2 + k.len() + 2 + v.len())
            .sum();
        key + 4 + self.payload.len() + 8 + 4 + properties
    }

    /// Check that the message fits the wire format
    pub fn validate(&self) -> Result<(), ClientError> {
        let strings = self
            .key
            .iter()
            .chain(self.properties.iter().flat_map(|(k, v)| [k, v]));
        for s in strings {
            if s.len() > MAX_STRING_LEN {
                return Err(ClientError::MessageTooLarge {
                    size: s.len(),
                    max_size: MAX_STRING_LEN,
                });
            }
        }

        let size = self.encoded_len();
        if size > MAX_BATCH_BYTES {
            return Err(ClientError::MessageTooLarge {
                size,
                max_size: MAX_BATCH_BYTES,
            });
        }
        Ok(())
    }
}

impl From<&str> for Message {
    fn from(payload: &str) -> Self {
        Message::new(Bytes::copy_from_slice(payload.as_bytes()))
    }
}

impl From<String> for Message {
    fn from(payload: String) -> Self {
        Message::new(payload)
    }
}

impl From<Vec<u8>> for Message {
    fn from(payload: Vec<u8>) -> Self {
        Message::new(payload)
    }
}

/// Where the broker stored an acknowledged message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub sequence_id: SequenceId,
    pub ledger_id: u64,
    pub entry_id: u64,
    /// Position among the messages covered by one receipt
    pub batch_index: u32,
}

/// Result of a topic lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    /// The named broker owns the topic
    Connect { broker_url: String },
    /// Ask the named broker instead
    Redirect { broker_url: String },
    Failed { code: ServerError, message: String },
}

/// Commands exchanged with the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect {
        client_version: String,
        auth_method: String,
        auth_data: Bytes,
        protocol_version: i32,
    },
    Connected {
        server_version: String,
        max_message_size: u32,
    },
    /// `request_id` 0 denotes a connection-level error
    Error {
        request_id: RequestId,
        code: ServerError,
        message: String,
    },
    Ping,
    Pong,
    Lookup {
        request_id: RequestId,
        topic: String,
    },
    LookupResponse {
        request_id: RequestId,
        outcome: LookupOutcome,
    },
    Producer {
        request_id: RequestId,
        producer_id: ProducerId,
        topic: String,
        producer_name: Option<String>,
    },
    ProducerSuccess {
        request_id: RequestId,
        producer_name: String,
        last_sequence_id: i64,
    },
    Send {
        producer_id: ProducerId,
        sequence_id: SequenceId,
        highest_sequence_id: SequenceId,
        messages: Vec<Message>,
    },
    /// Cumulative: acknowledges every message up to `sequence_id`
    SendReceipt {
        producer_id: ProducerId,
        sequence_id: SequenceId,
        ledger_id: u64,
        entry_id: u64,
    },
    SendError {
        producer_id: ProducerId,
        sequence_id: SequenceId,
        code: ServerError,
        message: String,
    },
    CloseProducer {
        request_id: RequestId,
        producer_id: ProducerId,
    },
    Success {
        request_id: RequestId,
    },
}

impl Command {
    /// Request id for responses routed back to a waiting caller
    pub fn response_request_id(&self) -> Option<RequestId> {
        match self {
            Command::LookupResponse { request_id, .. }
            | Command::ProducerSuccess { request_id, .. }
            | Command::Success { request_id } => Some(*request_id),
            Command::Error { request_id, .. } if *request_id != 0 => Some(*request_id),
            _ => None,
        }
    }

    /// Replace the request id of an outgoing request
    pub fn set_request_id(&mut self, id: RequestId) {
        match self {
            Command::Lookup { request_id, .. }
            | Command::Producer { request_id, .. }
            | Command::CloseProducer { request_id, .. } => *request_id = id,
            _ => {}
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Command::Connect { .. } => 1,
            Command::Connected { .. } => 2,
            Command::Error { .. } => 3,
            Command::Ping => 4,
            Command::Pong => 5,
            Command::Lookup { .. } => 6,
            Command::LookupResponse { .. } => 7,
            Command::Producer { .. } => 8,
            Command::ProducerSuccess { .. } => 9,
            Command::Send { .. } => 10,
            Command::SendReceipt { .. } => 11,
            Command::SendError { .. } => 12,
            Command::CloseProducer { .. } => 13,
            Command::Success { .. } => 14,
        }
    }
}

/// Wire helpers shared by the encoder and decoder
pub mod wire {
    use super::*;

    /// Write a length-prefixed string
    pub fn put_string(buf: &mut BytesMut, s: &str) -> Result<(), ClientError> {
        let len = i16::try_from(s.len()).map_err(|_| ClientError::MessageTooLarge {
            size: s.len(),
            max_size: MAX_STRING_LEN,
        })?;
        buf.put_i16(len);
        buf.put_slice(s.as_bytes());
        Ok(())
    }

    pub fn put_opt_string(buf: &mut BytesMut, s: Option<&str>) -> Result<(), ClientError> {
        match s {
            Some(s) => put_string(buf, s),
            None => {
                buf.put_i16(-1);
                Ok(())
            }
        }
    }

    /// Write bytes array with length prefix
    pub fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) -> Result<(), ClientError> {
        let len = i32::try_from(bytes.len()).map_err(|_| ClientError::MessageTooLarge {
            size: bytes.len(),
            max_size: i32::MAX as usize,
        })?;
        buf.put_i32(len);
        buf.put_slice(bytes);
        Ok(())
    }

    fn ensure(buf: &Bytes, needed: usize, what: &str) -> Result<(), ClientError> {
        if buf.remaining() < needed {
            return Err(ClientError::protocol(format!(
                "Insufficient bytes for {}",
                what
            )));
        }
        Ok(())
    }

    pub fn get_u8(buf: &mut Bytes) -> Result<u8, ClientError> {
        ensure(buf, 1, "u8")?;
        Ok(buf.get_u8())
    }

    pub fn get_i16(buf: &mut Bytes) -> Result<i16, ClientError> {
        ensure(buf, 2, "i16")?;
        Ok(buf.get_i16())
    }

    pub fn get_i32(buf: &mut Bytes) -> Result<i32, ClientError> {
        ensure(buf, 4, "i32")?;
        Ok(buf.get_i32())
    }

    pub fn get_u32(buf: &mut Bytes) -> Result<u32, ClientError> {
        ensure(buf, 4, "u32")?;
        Ok(buf.get_u32())
    }

    pub fn get_u64(buf: &mut Bytes) -> Result<u64, ClientError> {
        ensure(buf, 8, "u64")?;
        Ok(buf.get_u64())
    }

    pub fn get_i64(buf: &mut Bytes) -> Result<i64, ClientError> {
        ensure(buf, 8, "i64")?;
        Ok(buf.get_i64())
    }

    /// Read a length-prefixed string
    pub fn get_opt_string(buf: &mut Bytes) -> Result<Option<String>, ClientError> {
        let len = get_i16(buf)?;
        if len == -1 {
            return Ok(None);
        }
        if len < 0 {
            return Err(ClientError::protocol("Invalid string length"));
        }
        ensure(buf, len as usize, "string")?;
        let bytes = buf.split_to(len as usize);
        let s = String::from_utf8(bytes.to_vec())
            .map_err(|_| ClientError::protocol("Invalid UTF-8 string"))?;
        Ok(Some(s))
    }

    pub fn get_string(buf: &mut Bytes) -> Result<String, ClientError> {
        get_opt_string(buf)?.ok_or_else(|| ClientError::protocol("Unexpected null string"))
    }

    /// Read bytes array with length prefix
    pub fn get_opt_bytes(buf: &mut Bytes) -> Result<Option<Bytes>, ClientError> {
        let len = get_i32(buf)?;
        if len == -1 {
            return Ok(None);
        }
        if len < 0 {
            return Err(ClientError::protocol("Invalid bytes length"));
        }
        ensure(buf, len as usize, "bytes")?;
        Ok(Some(buf.split_to(len as usize)))
    }

    pub fn get_bytes(buf: &mut Bytes) -> Result<Bytes, ClientError> {
        get_opt_bytes(buf)?.ok_or_else(|| ClientError::protocol("Unexpected null bytes"))
    }
}

fn put_message(buf: &mut BytesMut, message: &Message) -> Result<(), ClientError> {
    wire::put_opt_string(buf, message.key.as_deref())?;
    wire::put_bytes(buf, &message.payload)?;
    buf.put_i64(message.event_time.map(|t| t as i64).unwrap_or(-1));
    buf.put_u32(message.properties.len() as u32);
    for (k, v) in &message.properties {
        wire::put_string(buf, k)?;
        wire::put_string(buf, v)?;
    }
    Ok(())
}

fn get_message(buf: &mut Bytes) -> Result<Message, ClientError> {
    let key = wire::get_opt_string(buf)?;
    let payload = wire::get_bytes(buf)?;
    let event_time = match wire::get_i64(buf)? {
        t if t < 0 => None,
        t => Some(t as u64),
    };
    let count = wire::get_u32(buf)?;
    let mut properties = HashMap::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let k = wire::get_string(buf)?;
        let v = wire::get_string(buf)?;
        properties.insert(k, v);
    }
    Ok(Message {
        payload,
        key,
        properties,
        event_time,
    })
}

fn encode_body(command: &Command, buf: &mut BytesMut) -> Result<(), ClientError> {
    match command {
        Command::Connect {
            client_version,
            auth_method,
            auth_data,
            protocol_version,
        } => {
            wire::put_string(buf, client_version)?;
            wire::put_string(buf, auth_method)?;
            wire::put_bytes(buf, auth_data)?;
            buf.put_i32(*protocol_version);
        }
        Command::Connected {
            server_version,
            max_message_size,
        } => {
            wire::put_string(buf, server_version)?;
            buf.put_u32(*max_message_size);
        }
        Command::Error {
            request_id,
            code,
            message,
        } => {
            buf.put_u64(*request_id);
            buf.put_i16((*code).into());
            wire::put_string(buf, message)?;
        }
        Command::Ping | Command::Pong => {}
        Command::Lookup { request_id, topic } => {
            buf.put_u64(*request_id);
            wire::put_string(buf, topic)?;
        }
        Command::LookupResponse {
            request_id,
            outcome,
        } => {
            buf.put_u64(*request_id);
            match outcome {
                LookupOutcome::Connect { broker_url } => {
                    buf.put_u8(0);
                    wire::put_string(buf, broker_url)?;
                }
                LookupOutcome::Redirect { broker_url } => {
                    buf.put_u8(1);
                    wire::put_string(buf, broker_url)?;
                }
                LookupOutcome::Failed { code, message } => {
                    buf.put_u8(2);
                    buf.put_i16((*code).into());
                    wire::put_string(buf, message)?;
                }
            }
        }
        Command::Producer {
            request_id,
            producer_id,
            topic,
            producer_name,
        } => {
            buf.put_u64(*request_id);
            buf.put_u64(*producer_id);
            wire::put_string(buf, topic)?;
            wire::put_opt_string(buf, producer_name.as_deref())?;
        }
        Command::ProducerSuccess {
            request_id,
            producer_name,
            last_sequence_id,
        } => {
            buf.put_u64(*request_id);
            wire::put_string(buf, producer_name)?;
            buf.put_i64(*last_sequence_id);
        }
        Command::Send {
            producer_id,
            sequence_id,
            highest_sequence_id,
            messages,
        } => {
            buf.put_u64(*producer_id);
            buf.put_u64(*sequence_id);
            buf.put_u64(*highest_sequence_id);
            buf.put_u32(messages.len() as u32);
            for message in messages {
                put_message(buf, message)?;
            }
        }
        Command::SendReceipt {
            producer_id,
            sequence_id,
            ledger_id,
            entry_id,
        } => {
            buf.put_u64(*producer_id);
            buf.put_u64(*sequence_id);
            buf.put_u64(*ledger_id);
            buf.put_u64(*entry_id);
        }
        Command::SendError {
            producer_id,
            sequence_id,
            code,
            message,
        } => {
            buf.put_u64(*producer_id);
            buf.put_u64(*sequence_id);
            buf.put_i16((*code).into());
            wire::put_string(buf, message)?;
        }
        Command::CloseProducer {
            request_id,
            producer_id,
        } => {
            buf.put_u64(*request_id);
            buf.put_u64(*producer_id);
        }
        Command::Success { request_id } => {
            buf.put_u64(*request_id);
        }
    }
    Ok(())
}

fn decode_body(tag: u8, buf: &mut Bytes) -> Result<Command, ClientError> {
    let command = match tag {
        1 => Command::Connect {
            client_version: wire::get_string(buf)?,
            auth_method: wire::get_string(buf)?,
            auth_data: wire::get_bytes(buf)?,
            protocol_version: wire::get_i32(buf)?,
        },
        2 => Command::Connected {
            server_version: wire::get_string(buf)?,
            max_message_size: wire::get_u32(buf)?,
        },
        3 => Command::Error {
            request_id: wire::get_u64(buf)?,
            code: ServerError::from(wire::get_i16(buf)?),
            message: wire::get_string(buf)?,
        },
        4 => Command::Ping,
        5 => Command::Pong,
        6 => Command::Lookup {
            request_id: wire::get_u64(buf)?,
            topic: wire::get_string(buf)?,
        },
        7 => {
            let request_id = wire::get_u64(buf)?;
            let outcome = match wire::get_u8(buf)? {
                0 => LookupOutcome::Connect {
                    broker_url: wire::get_string(buf)?,
                },
                1 => LookupOutcome::Redirect {
                    broker_url: wire::get_string(buf)?,
                },
                2 => LookupOutcome::Failed {
                    code: ServerError::from(wire::get_i16(buf)?),
                    message: wire::get_string(buf)?,
                },
                other => {
                    return Err(ClientError::protocol(format!(
                        "Unknown lookup outcome {}",
                        other
                    )))
                }
            };
            Command::LookupResponse {
                request_id,
                outcome,
            }
        }
        8 => Command::Producer {
            request_id: wire::get_u64(buf)?,
            producer_id: wire::get_u64(buf)?,
            topic: wire::get_string(buf)?,
            producer_name: wire::get_opt_string(buf)?,
        },
        9 => Command::ProducerSuccess {
            request_id: wire::get_u64(buf)?,
            producer_name: wire::get_string(buf)?,
            last_sequence_id: wire::get_i64(buf)?,
        },
        10 => {
            let producer_id = wire::get_u64(buf)?;
            let sequence_id = wire::get_u64(buf)?;
            let highest_sequence_id = wire::get_u64(buf)?;
            let count = wire::get_u32(buf)?;
            let mut messages = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                messages.push(get_message(buf)?);
            }
            Command::Send {
                producer_id,
                sequence_id,
                highest_sequence_id,
                messages,
            }
        }
        11 => Command::SendReceipt {
            producer_id: wire::get_u64(buf)?,
            sequence_id: wire::get_u64(buf)?,
            ledger_id: wire::get_u64(buf)?,
            entry_id: wire::get_u64(buf)?,
        },
        12 => Command::SendError {
            producer_id: wire::get_u64(buf)?,
            sequence_id: wire::get_u64(buf)?,
            code: ServerError::from(wire::get_i16(buf)?),
            message: wire::get_string(buf)?,
        },
        13 => Command::CloseProducer {
            request_id: wire::get_u64(buf)?,
            producer_id: wire::get_u64(buf)?,
        },
        14 => Command::Success {
            request_id: wire::get_u64(buf)?,
        },
        other => {
            return Err(ClientError::protocol(format!(
                "Unknown command tag {}",
                other
            )))
        }
    };

    if buf.has_remaining() {
        return Err(ClientError::protocol(format!(
            "{} trailing bytes after command tag {}",
            buf.remaining(),
            tag
        )));
    }
    Ok(command)
}

/// Frame codec used on both ends of a broker connection
#[derive(Debug, Clone)]
pub struct BrokerCodec {
    max_frame_size: usize,
}

impl BrokerCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for BrokerCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<Command> for BrokerCodec {
    type Error = ClientError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();

        // Length is filled in once the body is written
        dst.put_u32(0);
        dst.put_u8(item.tag());
        if let Err(e) = encode_body(&item, dst) {
            dst.truncate(start);
            return Err(e);
        }

        let frame_len = dst.len() - start - 4;
        if frame_len > self.max_frame_size {
            dst.truncate(start);
            return Err(ClientError::MessageTooLarge {
                size: frame_len,
                max_size: self.max_frame_size,
            });
        }
        (&mut dst[start..start + 4]).put_u32(frame_len as u32);
        Ok(())
    }
}

impl Decoder for BrokerCodec {
    type Item = Command;
    type Error = ClientError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None); // Need at least length prefix
        }

        let frame_len = (&src[0..4]).get_u32() as usize;
        if frame_len == 0 {
            return Err(ClientError::protocol("Empty frame"));
        }
        if frame_len > self.max_frame_size {
            return Err(ClientError::protocol(format!(
                "Frame of {} bytes exceeds limit {}",
                frame_len, self.max_frame_size
            )));
        }
        if src.len() < 4 + frame_len {
            src.reserve(4 + frame_len - src.len());
            return Ok(None); // Need complete frame
        }

        src.advance(4);
        let mut frame = src.split_to(frame_len).freeze();
        let tag = frame.get_u8();
        decode_body(tag, &mut frame).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(command: Command) -> BytesMut {
        let mut buf = BytesMut::new();
        BrokerCodec::new().encode(command, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_send_frame_preserves_batch() {
        let messages = vec![
            Message::from("Hello World! 0"),
            Message::from("Hello World! 1")
                .with_key("user-1")
                .with_property("source", "demo")
                .with_event_time(1_700_000_000_000),
        ];
        let command = Command::Send {
            producer_id: 3,
            sequence_id: 10,
            highest_sequence_id: 11,
            messages,
        };

        let mut buf = encode(command.clone());
        let decoded = BrokerCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, command);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let full = encode(Command::Lookup {
            request_id: 1,
            topic: "persistent://t/ns/topic".to_string(),
        });
        let mut codec = BrokerCodec::new();

        let mut partial = BytesMut::from(&full[..full.len() - 3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[full.len() - 3..]);
        assert!(matches!(
            codec.decode(&mut partial).unwrap(),
            Some(Command::Lookup { request_id: 1, .. })
        ));
    }

    #[test]
    fn test_multiple_frames_in_one_buffer() {
        let mut buf = encode(Command::Ping);
        buf.extend_from_slice(&encode(Command::Success { request_id: 9 }));

        let mut codec = BrokerCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Command::Ping));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Command::Success { request_id: 9 })
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_unknown_tag_is_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(200);
        assert!(matches!(
            BrokerCodec::new().decode(&mut buf),
            Err(ClientError::Protocol { .. })
        ));
    }

    #[test]
    fn test_truncated_body_is_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u8(14); // Success needs 8 bytes of request id
        buf.put_u16(7);
        assert!(BrokerCodec::new().decode(&mut buf).is_err());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = BrokerCodec::with_max_frame_size(16);
        let mut buf = BytesMut::new();
        let err = codec
            .encode(
                Command::Send {
                    producer_id: 1,
                    sequence_id: 0,
                    highest_sequence_id: 0,
                    messages: vec![Message::new(vec![0u8; 64])],
                },
                &mut buf,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::MessageTooLarge { max_size: 16, .. }
        ));
        assert!(buf.is_empty());

        let mut incoming = BytesMut::new();
        incoming.put_u32(1024);
        assert!(codec.decode(&mut incoming).is_err());
    }

    #[test]
    fn test_long_key_fails_encode_without_corrupting_buffer() {
        let mut buf = encode(Command::Ping);
        let before = buf.len();

        let err = BrokerCodec::new()
            .encode(
                Command::Send {
                    producer_id: 1,
                    sequence_id: 0,
                    highest_sequence_id: 0,
                    messages: vec![Message::from("payload").with_key("k".repeat(40_000))],
                },
                &mut buf,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::MessageTooLarge {
                size: 40_000,
                max_size: MAX_STRING_LEN
            }
        ));

        // The frame queued before the failure is still intact
        assert_eq!(buf.len(), before);
        assert_eq!(BrokerCodec::new().decode(&mut buf).unwrap(), Some(Command::Ping));
    }

    #[test]
    fn test_message_validation() {
        assert!(Message::from("ok").with_key("k".repeat(MAX_STRING_LEN)).validate().is_ok());
        assert!(matches!(
            Message::from("ok")
                .with_property("name", "v".repeat(MAX_STRING_LEN + 1))
                .validate(),
            Err(ClientError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_encoded_len_matches_codec() {
        let messages = vec![
            Message::from("plain"),
            Message::from("keyed")
                .with_key("user-7")
                .with_property("a", "1")
                .with_property("bb", "22")
                .with_event_time(5),
        ];
        let expected: usize = messages.iter().map(Message::encoded_len).sum();

        let buf = encode(Command::Send {
            producer_id: 1,
            sequence_id: 0,
            highest_sequence_id: 1,
            messages,
        });
        assert_eq!(buf.len(), 4 + SEND_FRAME_OVERHEAD + expected);
    }

    #[test]
    fn test_response_request_ids() {
        assert_eq!(Command::Success { request_id: 4 }.response_request_id(), Some(4));
        assert_eq!(
            Command::Error {
                request_id: 0,
                code: ServerError::AuthenticationError,
                message: String::new()
            }
            .response_request_id(),
            None
        );
        assert_eq!(Command::Ping.response_request_id(), None);

        let mut lookup = Command::Lookup {
            request_id: 0,
            topic: "t".to_string(),
        };
        lookup.set_request_id(42);
        assert_eq!(
            lookup,
            Command::Lookup {
                request_id: 42,
                topic: "t".to_string()
            }
        );
    }
}
