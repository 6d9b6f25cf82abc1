//! The `Network` capability (spec §6).
//!
//! Grounded in `original_source/src/NetworkClient.h` and
//! `UtilityNetworkClient.h`: the protocol core never opens a socket
//! itself, it calls through this trait, and a concrete transport
//! (`net::tcp`) or test double (`net::mock`) supplies the implementation.

pub mod mock;
pub mod tcp;
pub mod wire;

use crate::error::Result;
use crate::types::{AggregationMessage, MeterId, OverlayTransportMessage, PingMessage, QueryRequest, SignatureRequest, SignatureResponse, UTILITY_ID};
use async_trait::async_trait;

/// Everything a meter or the utility needs to exchange messages with the
/// rest of the system, overloaded by payload shape the way
/// `NetworkClient`/`UtilityNetworkClient` are in the original (Rust has no
/// true overloading, so each shape gets its own named method instead).
#[async_trait]
pub trait Network: Send + Sync {
    /// Sends a batch of overlay-round messages to `recipient` in one
    /// connection, mirroring the original's "send the whole outgoing list
    /// as one TCP write" batching (spec §4.1: one batch per round).
    async fn send_overlay_batch(&self, messages: Vec<OverlayTransportMessage>, recipient: MeterId) -> Result<()>;

    /// Sends a single aggregation-tree message. `recipient` may be
    /// `UTILITY_ID`, in which case implementations route to the utility's
    /// configured address instead of a meter's.
    async fn send_aggregation(&self, message: AggregationMessage, recipient: MeterId) -> Result<()>;

    /// Sends a gossip-round liveness ping or its response.
    async fn send_ping(&self, message: PingMessage, recipient: MeterId) -> Result<()>;

    /// Sends a blind-signature request to the utility (Byzantine variant).
    async fn send_signature_request(&self, message: SignatureRequest) -> Result<()>;

    /// Utility-side: starts a query at the given meter.
    async fn send_query(&self, message: QueryRequest, recipient: MeterId) -> Result<()>;

    /// Utility-side: returns a blind signature to the requesting meter.
    async fn send_signature_response(&self, message: SignatureResponse, recipient: MeterId) -> Result<()>;
}

/// Returns true if `id` names the utility rather than an ordinary meter,
/// the one piece of routing logic every `Network` implementation needs
/// (the original's `UTILITY_NODE_ID` special-casing in `TcpNetworkClient`).
pub fn is_utility(id: MeterId) -> bool {
    id == UTILITY_ID
}
