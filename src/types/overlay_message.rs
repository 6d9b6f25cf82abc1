use crate::fixed_point::FixedPoint;
use crate::types::value::{AgreementValue, SignedValue, ValueContribution};
use crate::types::MeterId;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// The payload carried by an `OverlayMessage`, re-architected from the
/// original's downcast-on-a-class-hierarchy design (spec §9) into a tagged
/// variant matching `MessageBodyType` one-for-one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    /// The empty body used for dummy round-advancing messages.
    None,
    /// One more layer of onion encryption still to peel.
    Overlay(Box<OverlayMessage>),
    /// A message still carrying an explicit remaining source-routed path.
    Path(Box<PathOverlayMessage>),
    /// A contribution being shuffled to a proxy.
    Value(ValueContribution),
    /// A contribution plus accumulated signatures (Crusader phase 1).
    Signed(SignedValue),
    /// A signed value vouched for by an accepter proxy (Crusader phase 2).
    Agreement(AgreementValue),
    /// A partial-sum vector, when traveling as an overlay payload rather
    /// than as a standalone `AggregationMessage`.
    AggregationValue(Vec<FixedPoint>),
    /// An opaque byte blob (used by the blind-signature sub-protocol's
    /// onion-wrapped requests, and by tests).
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
}

impl MessageBody {
    /// A short, stable name for the body's variant, used in
    /// `Error::InvalidMessageBody` and trace logging.
    pub fn kind_name(&self) -> &'static str {
        match self {
            MessageBody::None => "none",
            MessageBody::Overlay(_) => "overlay",
            MessageBody::Path(_) => "path_overlay",
            MessageBody::Value(_) => "value_contribution",
            MessageBody::Signed(_) => "signed_value",
            MessageBody::Agreement(_) => "agreement_value",
            MessageBody::AggregationValue(_) => "aggregation_value",
            MessageBody::Bytes(_) => "bytes",
        }
    }
}

/// A message routed over the overlay, optionally encrypted for its
/// immediate destination and optionally flooded every round until delivered
/// (spec §3).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OverlayMessage {
    /// The query this message belongs to.
    pub query_number: u64,
    /// The next hop (or final recipient) for this message.
    pub destination: MeterId,
    /// Whether `body` is encrypted for `destination` and must be decrypted
    /// before inspection.
    pub is_encrypted: bool,
    /// Whether this message should be re-sent every round until it reaches
    /// `destination` (used by the high-failure-tolerant Scatter phase).
    pub flood: bool,
    /// The payload.
    pub body: Box<MessageBody>,
}

impl OverlayMessage {
    /// Constructs a new, unencrypted, non-flooded overlay message.
    pub fn new(query_number: u64, destination: MeterId, body: MessageBody) -> Self {
        Self {
            query_number,
            destination,
            is_encrypted: false,
            flood: false,
            body: Box::new(body),
        }
    }

    /// Builder-style setter marking this message as flooded.
    pub fn flooded(mut self) -> Self {
        self.flood = true;
        self
    }

    /// Builder-style setter marking this message's body as encrypted.
    pub fn encrypted(mut self) -> Self {
        self.is_encrypted = true;
        self
    }

    /// The dummy, empty-bodied message a meter sends to a partner when it
    /// has nothing else to send this round, so the partner can observe
    /// `is_final_message` and advance (spec §4.1 step 2).
    pub fn dummy(query_number: u64, destination: MeterId) -> Self {
        Self::new(query_number, destination, MessageBody::None)
    }
}

/// An `OverlayMessage` extended with an explicit remaining source route
/// (spec §3). Each hop pops the head of `remaining_path` into `destination`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PathOverlayMessage {
    /// The wrapped overlay message fields.
    pub inner: OverlayMessage,
    /// The hops still to traverse after the current `inner.destination`.
    pub remaining_path: VecDeque<MeterId>,
}

impl PathOverlayMessage {
    /// Constructs a new path-routed message. `path` must not include the
    /// source; its first element becomes the immediate destination.
    pub fn new(query_number: u64, path: &[MeterId], body: MessageBody) -> Self {
        let mut remaining: VecDeque<MeterId> = path.iter().copied().collect();
        let destination = remaining.pop_front().expect("path must have at least one hop");
        Self {
            inner: OverlayMessage::new(query_number, destination, body),
            remaining_path: remaining,
        }
    }

    /// Pops the next hop off `remaining_path` into `inner.destination`,
    /// returning `true` if there was another hop to pop (i.e. this message
    /// should keep being forwarded rather than delivered locally).
    pub fn advance(&mut self) -> bool {
        match self.remaining_path.pop_front() {
            Some(next) => {
                self.inner.destination = next;
                true
            }
            None => false,
        }
    }
}

/// Exactly one of these is exchanged per overlay round per gossip partner
/// (spec §3). `is_final_message` flags the last transport message of a
/// round's batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OverlayTransportMessage {
    /// The meter that sent this transport message.
    pub sender_id: MeterId,
    /// The overlay round the sender believes it is in.
    pub sender_round: i64,
    /// Whether this is the last transport message of the sender's batch
    /// for this round.
    pub is_final_message: bool,
    /// The wrapped overlay message.
    pub body: OverlayMessage,
}

impl OverlayTransportMessage {
    /// Constructs a new transport message.
    pub fn new(sender_id: MeterId, sender_round: i64, is_final_message: bool, body: OverlayMessage) -> Self {
        Self {
            sender_id,
            sender_round,
            is_final_message,
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_overlay_message_advances_hop_by_hop() {
        let mut msg = PathOverlayMessage::new(1, &[10, 20, 30], MessageBody::None);
        assert_eq!(msg.inner.destination, 10);
        assert!(msg.advance());
        assert_eq!(msg.inner.destination, 20);
        assert!(msg.advance());
        assert_eq!(msg.inner.destination, 30);
        assert!(!msg.advance());
    }

    #[test]
    fn dummy_message_has_none_body() {
        let dummy = OverlayMessage::dummy(5, 2);
        assert_eq!(*dummy.body, MessageBody::None);
    }
}
