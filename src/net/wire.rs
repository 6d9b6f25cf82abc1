//! Wire envelope and framing (spec §6).
//!
//! Grounded in `original_source/src/messaging/Message.h`/`MessageType.h`
//! (a message-type tag in front of a serialized payload, dispatched by the
//! receiving end) and `networking/BaseTcpClient_impl.h` (the length-prefixed
//! "number of messages" header used for batched `OverlayTransportMessage`
//! sends). `rmp-serde` replaces the original's `mutils` binary archive
//! format for the payload itself; the framing in front of it — length
//! prefix, type tag, batch count — is hand-rolled to match spec §6's exact
//! layout rather than left to MessagePack, whose own tags don't line up
//! with the big-endian, word-sized fields the original's receivers expect.

use crate::error::{Error, Result};
use crate::types::{AggregationMessage, OverlayTransportMessage, PingMessage, QueryRequest, SignatureRequest, SignatureResponse};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Platform word size assumed for the length prefix and batch count (spec
/// §6: `size_t`-width fields). The original only ever ran on 64-bit hosts;
/// this crate makes the same assumption rather than parameterising over it.
const WORD_SIZE: usize = 8;

/// 2-byte big-endian tag identifying which payload variant follows,
/// mirroring the original's `MessageType` enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
enum MessageType {
    Overlay = 0,
    Ping = 1,
    Aggregation = 2,
    QueryRequest = 3,
    SignatureRequest = 4,
    SignatureResponse = 5,
}

impl MessageType {
    fn from_u16(tag: u16) -> Result<Self> {
        match tag {
            0 => Ok(Self::Overlay),
            1 => Ok(Self::Ping),
            2 => Ok(Self::Aggregation),
            3 => Ok(Self::QueryRequest),
            4 => Ok(Self::SignatureRequest),
            5 => Ok(Self::SignatureResponse),
            _ => Err(Error::InvalidMessageBody("unrecognised wire MessageType")),
        }
    }
}

/// Every payload shape that can cross the wire between two processes.
#[derive(Debug, Clone)]
pub enum WirePayload {
    Overlay(Vec<OverlayTransportMessage>),
    Ping(PingMessage),
    Aggregation(AggregationMessage),
    QueryRequest(QueryRequest),
    SignatureRequest(SignatureRequest),
    SignatureResponse(SignatureResponse),
}

impl WirePayload {
    fn message_type(&self) -> MessageType {
        match self {
            Self::Overlay(_) => MessageType::Overlay,
            Self::Ping(_) => MessageType::Ping,
            Self::Aggregation(_) => MessageType::Aggregation,
            Self::QueryRequest(_) => MessageType::QueryRequest,
            Self::SignatureRequest(_) => MessageType::SignatureRequest,
            Self::SignatureResponse(_) => MessageType::SignatureResponse,
        }
    }
}

/// The fixed framing placed in front of every wire payload (spec §6): a
/// 2-byte big-endian `MessageType` tag, followed by a word-sized
/// little-endian message count — present only for meter-to-meter overlay
/// batches, since a utility-bound send is always exactly one message and
/// carries no count.
struct Header {
    message_type: MessageType,
    message_count: Option<u64>,
}

impl Header {
    fn encoded_len(&self) -> usize {
        2 + if self.message_count.is_some() { WORD_SIZE } else { 0 }
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u16(self.message_type as u16);
        if let Some(count) = self.message_count {
            buf.put_u64_le(count);
        }
    }

    fn read(frame: &mut Bytes) -> Result<Self> {
        if frame.len() < 2 {
            return Err(Error::InvalidMessageBody("wire frame too short for a MessageType tag"));
        }
        let message_type = MessageType::from_u16(frame.get_u16())?;
        let message_count = if message_type == MessageType::Overlay {
            if frame.len() < WORD_SIZE {
                return Err(Error::InvalidMessageBody("overlay batch frame missing its message count"));
            }
            Some(frame.get_u64_le())
        } else {
            None
        };
        Ok(Self { message_type, message_count })
    }
}

/// Encodes `payload` as `[u64 LE total length][Header][rmp-serde body]`,
/// the unit a `net::tcp` connection reads and writes in full before handing
/// it to the caller.
pub fn encode(payload: &WirePayload) -> Result<Bytes> {
    let (body, message_count) = match payload {
        WirePayload::Overlay(messages) => (
            rmp_serde::to_vec(messages).map_err(|e| Error::Serialisation(e.to_string()))?,
            Some(messages.len() as u64),
        ),
        WirePayload::Ping(m) => (rmp_serde::to_vec(m).map_err(|e| Error::Serialisation(e.to_string()))?, None),
        WirePayload::Aggregation(m) => (rmp_serde::to_vec(m).map_err(|e| Error::Serialisation(e.to_string()))?, None),
        WirePayload::QueryRequest(m) => (rmp_serde::to_vec(m).map_err(|e| Error::Serialisation(e.to_string()))?, None),
        WirePayload::SignatureRequest(m) => (rmp_serde::to_vec(m).map_err(|e| Error::Serialisation(e.to_string()))?, None),
        WirePayload::SignatureResponse(m) => (rmp_serde::to_vec(m).map_err(|e| Error::Serialisation(e.to_string()))?, None),
    };
    let header = Header {
        message_type: payload.message_type(),
        message_count,
    };
    let frame_len = header.encoded_len() + body.len();
    let mut buf = BytesMut::with_capacity(WORD_SIZE + frame_len);
    buf.put_u64_le(frame_len as u64);
    header.write(&mut buf);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Decodes a frame body (everything after the length prefix has already
/// been stripped off by the caller).
pub fn decode(mut frame: Bytes) -> Result<WirePayload> {
    if frame.is_empty() {
        return Err(Error::InvalidMessageBody("empty wire frame"));
    }
    let header = Header::read(&mut frame)?;
    match header.message_type {
        MessageType::Overlay => {
            let messages: Vec<OverlayTransportMessage> =
                rmp_serde::from_slice(&frame).map_err(|e| Error::Serialisation(e.to_string()))?;
            if let Some(count) = header.message_count {
                if count as usize != messages.len() {
                    return Err(Error::InvalidMessageBody("overlay batch message count did not match its body"));
                }
            }
            Ok(WirePayload::Overlay(messages))
        }
        MessageType::Ping => Ok(WirePayload::Ping(
            rmp_serde::from_slice(&frame).map_err(|e| Error::Serialisation(e.to_string()))?,
        )),
        MessageType::Aggregation => Ok(WirePayload::Aggregation(
            rmp_serde::from_slice(&frame).map_err(|e| Error::Serialisation(e.to_string()))?,
        )),
        MessageType::QueryRequest => Ok(WirePayload::QueryRequest(
            rmp_serde::from_slice(&frame).map_err(|e| Error::Serialisation(e.to_string()))?,
        )),
        MessageType::SignatureRequest => Ok(WirePayload::SignatureRequest(
            rmp_serde::from_slice(&frame).map_err(|e| Error::Serialisation(e.to_string()))?,
        )),
        MessageType::SignatureResponse => Ok(WirePayload::SignatureResponse(
            rmp_serde::from_slice(&frame).map_err(|e| Error::Serialisation(e.to_string()))?,
        )),
    }
}

/// The length prefix's on-wire size, used by `net::tcp` to know how many
/// bytes to read before attempting to decode a frame.
pub const LENGTH_PREFIX_SIZE: usize = WORD_SIZE;

pub fn read_length_prefix(bytes: &[u8]) -> u64 {
    u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MeterId;

    #[test]
    fn ping_round_trips_through_encode_decode() {
        let payload = WirePayload::Ping(PingMessage::request(3 as MeterId));
        let encoded = encode(&payload).unwrap();
        let len = read_length_prefix(&encoded[..LENGTH_PREFIX_SIZE]) as usize;
        assert_eq!(len + LENGTH_PREFIX_SIZE, encoded.len());
        let decoded = decode(encoded.slice(LENGTH_PREFIX_SIZE..)).unwrap();
        match decoded {
            WirePayload::Ping(p) => assert_eq!(p.sender_id, 3),
            other => panic!("wrong variant decoded: {:?}", other),
        }
    }

    #[test]
    fn overlay_batch_carries_a_message_count() {
        let payload = WirePayload::Overlay(Vec::new());
        let encoded = encode(&payload).unwrap();
        // length prefix (8) + tag (2) + count (8), zero messages follow.
        assert_eq!(encoded.len(), LENGTH_PREFIX_SIZE + 2 + WORD_SIZE);
        let decoded = decode(encoded.slice(LENGTH_PREFIX_SIZE..)).unwrap();
        match decoded {
            WirePayload::Overlay(messages) => assert!(messages.is_empty()),
            other => panic!("wrong variant decoded: {:?}", other),
        }
    }

    #[test]
    fn non_overlay_payload_carries_no_count() {
        let payload = WirePayload::Ping(PingMessage::request(7 as MeterId));
        let encoded = encode(&payload).unwrap();
        // length prefix (8) + tag (2), no count, then the rmp-serde body.
        assert!(encoded.len() > LENGTH_PREFIX_SIZE + 2);
    }

    #[test]
    fn empty_frame_is_rejected() {
        assert!(decode(Bytes::new()).is_err());
    }

    #[test]
    fn mismatched_overlay_count_is_rejected() {
        let body = rmp_serde::to_vec(&Vec::<OverlayTransportMessage>::new()).unwrap();
        let mut buf = BytesMut::new();
        buf.put_u16(MessageType::Overlay as u16);
        buf.put_u64_le(1); // claims one message, body has zero
        buf.put_slice(&body);
        assert!(decode(buf.freeze()).is_err());
    }
}
