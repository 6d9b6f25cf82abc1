//! Real TCP transport (spec §6, SPEC_FULL §10.6).
//!
//! Grounded in `original_source/src/networking/TcpNetworkClient.cpp` (one
//! outbound connection per send, with the utility singled out by id) and
//! in `routing::comm::Comm`'s cached-connection idiom, replacing qp2p/QUIC
//! with plain `tokio::net::TcpStream` since this protocol has no need for
//! QUIC's multiplexed streams.

use crate::error::{Error, Result};
use crate::net::wire::{self, WirePayload, LENGTH_PREFIX_SIZE};
use crate::net::Network;
use crate::types::{AggregationMessage, MeterId, OverlayTransportMessage, PingMessage, QueryRequest, SignatureRequest, SignatureResponse, UTILITY_ID};
use async_trait::async_trait;
use futures::lock::Mutex as AsyncMutex;
use lru_time_cache::LruCache;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{trace, warn};

const CONNECTION_CACHE_SIZE: usize = 1024;
const CONNECTION_CACHE_TTL: Duration = Duration::from_secs(300);

/// Upper bound on a single frame's body, checked against the untrusted
/// length prefix before allocating a buffer for it. The largest legitimate
/// frame is a full `OverlayTransportMessage` batch, which is nowhere near
/// this size even for large `N`; this only guards against a peer sending a
/// bogus length prefix to force an outsized allocation.
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Real TCP `Network` implementation, addressing peers by `MeterId`
/// through a static id-to-address table (spec §6: addresses are
/// provisioned at startup, there is no dynamic membership).
pub struct TcpNetwork {
    my_address: SocketAddr,
    utility_address: SocketAddr,
    addresses: HashMap<MeterId, SocketAddr>,
    connections: AsyncMutex<LruCache<MeterId, Arc<AsyncMutex<TcpStream>>>>,
}

impl TcpNetwork {
    pub fn new(my_address: SocketAddr, utility_address: SocketAddr, addresses: HashMap<MeterId, SocketAddr>) -> Self {
        Self {
            my_address,
            utility_address,
            addresses,
            connections: AsyncMutex::new(LruCache::with_expiry_duration_and_capacity(
                CONNECTION_CACHE_TTL,
                CONNECTION_CACHE_SIZE,
            )),
        }
    }

    fn address_of(&self, id: MeterId) -> Result<SocketAddr> {
        if id == UTILITY_ID {
            return Ok(self.utility_address);
        }
        self.addresses
            .get(&id)
            .copied()
            .ok_or(Error::PartnerUnreachable(id))
    }

    async fn connection_to(&self, id: MeterId) -> Result<Arc<AsyncMutex<TcpStream>>> {
        let cached = self.connections.lock().await.get(&id).cloned();
        if let Some(conn) = cached {
            return Ok(conn);
        }
        let addr = self.address_of(id)?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::Crypto(format!("connect to {} failed: {}", addr, e)))?;
        let conn = Arc::new(AsyncMutex::new(stream));
        self.connections.lock().await.insert(id, Arc::clone(&conn));
        Ok(conn)
    }

    async fn send_payload(&self, recipient: MeterId, payload: WirePayload) -> Result<()> {
        let frame = wire::encode(&payload)?;
        let conn = self.connection_to(recipient).await?;
        let mut stream = conn.lock().await;
        if stream.write_all(&frame).await.is_err() {
            drop(stream);
            self.connections.lock().await.remove(&recipient);
            let conn = self.connection_to(recipient).await?;
            let mut stream = conn.lock().await;
            stream
                .write_all(&frame)
                .await
                .map_err(|_| Error::PartnerUnreachable(recipient))?;
        }
        trace!(%recipient, bytes = frame.len(), "sent wire frame");
        Ok(())
    }
}

#[async_trait]
impl Network for TcpNetwork {
    async fn send_overlay_batch(&self, messages: Vec<OverlayTransportMessage>, recipient: MeterId) -> Result<()> {
        self.send_payload(recipient, WirePayload::Overlay(messages)).await
    }

    async fn send_aggregation(&self, message: AggregationMessage, recipient: MeterId) -> Result<()> {
        self.send_payload(recipient, WirePayload::Aggregation(message)).await
    }

    async fn send_ping(&self, message: PingMessage, recipient: MeterId) -> Result<()> {
        self.send_payload(recipient, WirePayload::Ping(message)).await
    }

    async fn send_signature_request(&self, message: SignatureRequest) -> Result<()> {
        self.send_payload(UTILITY_ID, WirePayload::SignatureRequest(message)).await
    }

    async fn send_query(&self, message: QueryRequest, recipient: MeterId) -> Result<()> {
        self.send_payload(recipient, WirePayload::QueryRequest(message)).await
    }

    async fn send_signature_response(&self, message: SignatureResponse, recipient: MeterId) -> Result<()> {
        self.send_payload(recipient, WirePayload::SignatureResponse(message)).await
    }
}

/// Reads one length-prefixed frame off `stream`, returning its decoded
/// payload. Used by the listener loop that feeds incoming messages to a
/// meter's or the utility's protocol state machine.
pub async fn read_frame(stream: &mut TcpStream) -> Result<WirePayload> {
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| Error::Crypto(format!("frame length read failed: {}", e)))?;
    let len = wire::read_length_prefix(&len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::InvalidMessageBody("wire frame length prefix exceeds the maximum frame size"));
    }

    let mut body = vec![0u8; len];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|e| Error::Crypto(format!("frame body read failed: {}", e)))?;
    wire::decode(bytes::Bytes::from(body))
}

/// Accepts connections on `my_address` forever, decoding one frame per
/// connection and handing it to `on_message`. Mirrors the original's
/// one-shot-connection-per-send protocol: each inbound `TcpStream` carries
/// exactly one frame before the sender closes it.
pub async fn listen<F>(listener: tokio::net::TcpListener, mut on_message: F) -> Result<()>
where
    F: FnMut(WirePayload) + Send,
{
    loop {
        let (mut stream, peer) = listener
            .accept()
            .await
            .map_err(|e| Error::Crypto(format!("accept failed: {}", e)))?;
        match read_frame(&mut stream).await {
            Ok(payload) => on_message(payload),
            Err(e) => warn!(%peer, error = %e, "dropped an unreadable incoming frame"),
        }
    }
}
