//! In-memory `Network` double used by tests (spec §6, SPEC_FULL §10.6).
//!
//! Not part of the protocol core; modeled on the style of
//! `routing::comm::Comm`'s connection registry but backed by channels
//! instead of sockets, so integration tests can drive a whole gossip round
//! without touching the OS network stack.

use crate::error::{Error, Result};
use crate::net::Network;
use crate::types::{AggregationMessage, MeterId, OverlayTransportMessage, PingMessage, QueryRequest, SignatureRequest, SignatureResponse};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A message as delivered by `InMemoryNetwork`, tagged with which `Network`
/// method produced it so a test harness can dispatch without re-deriving
/// the message type from its contents.
#[derive(Debug, Clone)]
pub enum Delivered {
    OverlayBatch(Vec<OverlayTransportMessage>),
    Aggregation(AggregationMessage),
    Ping(PingMessage),
    SignatureRequest(SignatureRequest),
    Query(QueryRequest),
    SignatureResponse(SignatureResponse),
}

type Inbox = mpsc::UnboundedSender<Delivered>;

/// A shared switchboard every simulated participant registers an inbox
/// with; `InMemoryNetwork` handles for different ids all share one
/// switchboard so sends from one reach the others' inboxes directly.
#[derive(Default)]
pub struct Switchboard {
    inboxes: DashMap<MeterId, Inbox>,
    /// Ids present in this set have their sends silently dropped, modeling
    /// a crashed or unreachable peer without removing its inbox.
    unreachable: DashMap<MeterId, ()>,
}

impl Switchboard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `id` and returns the receiving end of its inbox.
    pub fn register(self: &Arc<Self>, id: MeterId) -> mpsc::UnboundedReceiver<Delivered> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.insert(id, tx);
        rx
    }

    /// Marks `id` as unreachable; sends to it are dropped, matching a
    /// crashed meter in the crash-tolerant/high-failure-tolerant variants.
    pub fn set_unreachable(&self, id: MeterId, unreachable: bool) {
        if unreachable {
            self.unreachable.insert(id, ());
        } else {
            self.unreachable.remove(&id);
        }
    }

    fn deliver(&self, recipient: MeterId, message: Delivered) -> Result<()> {
        if self.unreachable.contains_key(&recipient) {
            return Ok(());
        }
        match self.inboxes.get(&recipient) {
            Some(inbox) => inbox
                .send(message)
                .map_err(|_| Error::PartnerUnreachable(recipient)),
            None => Err(Error::PartnerUnreachable(recipient)),
        }
    }
}

/// One participant's `Network` handle onto a shared `Switchboard`.
pub struct InMemoryNetwork {
    switchboard: Arc<Switchboard>,
}

impl InMemoryNetwork {
    pub fn new(switchboard: Arc<Switchboard>) -> Self {
        Self { switchboard }
    }
}

#[async_trait]
impl Network for InMemoryNetwork {
    async fn send_overlay_batch(&self, messages: Vec<OverlayTransportMessage>, recipient: MeterId) -> Result<()> {
        self.switchboard.deliver(recipient, Delivered::OverlayBatch(messages))
    }

    async fn send_aggregation(&self, message: AggregationMessage, recipient: MeterId) -> Result<()> {
        self.switchboard.deliver(recipient, Delivered::Aggregation(message))
    }

    async fn send_ping(&self, message: PingMessage, recipient: MeterId) -> Result<()> {
        self.switchboard.deliver(recipient, Delivered::Ping(message))
    }

    async fn send_signature_request(&self, message: SignatureRequest) -> Result<()> {
        self.switchboard
            .deliver(crate::types::UTILITY_ID, Delivered::SignatureRequest(message))
    }

    async fn send_query(&self, message: QueryRequest, recipient: MeterId) -> Result<()> {
        self.switchboard.deliver(recipient, Delivered::Query(message))
    }

    async fn send_signature_response(&self, message: SignatureResponse, recipient: MeterId) -> Result<()> {
        self.switchboard.deliver(recipient, Delivered::SignatureResponse(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PingMessage;

    #[tokio::test]
    async fn delivers_to_the_right_inbox_only() {
        let board = Switchboard::new();
        let mut rx_a = board.register(0);
        let mut rx_b = board.register(1);

        let net = InMemoryNetwork::new(Arc::clone(&board));
        net.send_ping(PingMessage::request(0), 1).await.unwrap();

        assert!(matches!(rx_b.recv().await, Some(Delivered::Ping(_))));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn unreachable_peer_drops_sends_without_error() {
        let board = Switchboard::new();
        let mut rx = board.register(2);
        board.set_unreachable(2, true);

        let net = InMemoryNetwork::new(Arc::clone(&board));
        net.send_ping(PingMessage::request(0), 2).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_recipient_is_an_error() {
        let board = Switchboard::new();
        let net = InMemoryNetwork::new(board);
        assert!(net.send_ping(PingMessage::request(0), 99).await.is_err());
    }
}
