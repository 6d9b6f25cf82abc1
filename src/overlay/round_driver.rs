//! The overlay round driver (spec §4.1): one per-meter engine that drives
//! the gossip overlay's synchronous rounds, independent of which phase
//! (Shuffle/Scatter/Echo/Gather/Agreement) is currently using it.
//!
//! Grounded in `original_source/src/ProtocolState_impl.h`
//! (`send_overlay_message_batch`, `handle_overlay_message`,
//! `handle_round_timeout`, `super_end_overlay_round`). The original's
//! `ProtocolState<Impl>` is a CRTP base class that calls back into its
//! subclass (`impl_this->...`); the natural Rust translation of that
//! cross-call is a trait object (`RoundHandler`) the driver holds rather
//! than a compile-time template parameter, since Rust has no CRTP.
//!
//! Spec §9 flags the original's `end_overlay_round` as recursing into
//! itself when the predecessor is already known dead; `advance_round`
//! below replaces that recursion with an explicit loop.

use crate::crypto::Crypto;
use crate::error::Result;
use crate::net::Network;
use crate::overlay::graph::{predecessor, target};
use crate::timer::{Timer, TimerId};
use crate::types::{MessageBody, MeterId, OverlayMessage, OverlayTransportMessage, PingMessage};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// What a phase does with a message that has reached this meter (the
/// innermost onion layer was this meter's, or the message was never
/// wrapped). Implemented by each of `phases::{shuffle,scatter,echo,gather,agreement}`.
pub trait RoundHandler: Send {
    /// Whether this phase is still actively driving overlay rounds.
    /// Mirrors `is_in_overlay_phase`: once aggregation has taken over, the
    /// driver stops re-arming timeouts (`super_end_overlay_round`'s
    /// early-return for `is_last_round`).
    fn is_active(&self) -> bool;

    /// Handles one fully-unwrapped message body addressed to this meter in
    /// the current round.
    fn handle_message(&mut self, sender_id: MeterId, body: MessageBody) -> Result<()>;

    /// The total number of rounds this phase runs for (spec §4.3/§4.4:
    /// `t + 2*log2N + 1`, `2t + log2N^2 + 1`, etc., computed by the phase
    /// from `t` and `N`).
    fn total_rounds(&self) -> i64;

    /// Called once per round, just before the outgoing batch is formed, so
    /// a phase that keeps re-flooding messages until they reach their
    /// destination (Scatter/Gather, spec §4.3) can inject this round's
    /// copies into the batch. `comm_target` is this round's send partner
    /// (`target(meter_id, round)`). Most phases never re-flood and use the
    /// default empty implementation.
    fn prepare_round(&mut self, comm_target: MeterId) -> Vec<OverlayMessage> {
        let _ = comm_target;
        Vec::new()
    }
}

/// Outcome of delivering one inbound `OverlayTransportMessage`.
#[derive(Debug, PartialEq, Eq)]
pub enum DeliverOutcome {
    /// The message was handled (or buffered/dropped); no further action.
    Handled,
    /// This was the batch's final message; the caller should call
    /// `advance_round`.
    RoundComplete,
}

/// The result of advancing past a round boundary.
#[derive(Debug, PartialEq, Eq)]
pub enum RoundOutcome {
    /// The overlay is now waiting in a new round for further messages.
    Waiting,
    /// This phase has exhausted its round budget; the caller should
    /// transition to the next phase.
    PhaseComplete,
}

/// Per-meter engine driving the gossip overlay (spec §4.1). One instance is
/// created per query and discarded once the overlay phases finish; the
/// subsequent tree-aggregation phase does not use rounds at all.
pub struct RoundDriver {
    meter_id: MeterId,
    num_meters: u64,
    network: Arc<dyn Network>,
    crypto: Arc<dyn Crypto>,
    timer: Arc<dyn Timer>,
    round_timeout_ms: u64,
    on_timeout: Arc<dyn Fn() + Send + Sync>,

    current_round: i64,
    current_query_number: u64,
    is_last_round: bool,
    ping_response_from_predecessor: bool,
    round_timeout_timer: Option<TimerId>,

    pub failed_meter_ids: HashSet<MeterId>,
    pub outgoing_messages: Vec<OverlayMessage>,
    waiting_messages: Vec<OverlayMessage>,
    future_overlay_messages: Vec<OverlayTransportMessage>,
}

impl RoundDriver {
    /// `on_timeout` should enqueue a "round timeout fired" event onto the
    /// owning meter actor's own mailbox (see `meter::MeterActor`), so the
    /// actual timeout handling still runs on the actor's single-threaded
    /// processing loop rather than inside the timer's own task.
    pub fn new(
        meter_id: MeterId,
        num_meters: u64,
        network: Arc<dyn Network>,
        crypto: Arc<dyn Crypto>,
        timer: Arc<dyn Timer>,
        round_timeout_ms: u64,
        on_timeout: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        Self {
            meter_id,
            num_meters,
            network,
            crypto,
            timer,
            round_timeout_ms,
            on_timeout,
            current_round: -1,
            current_query_number: 0,
            is_last_round: false,
            ping_response_from_predecessor: false,
            round_timeout_timer: None,
            failed_meter_ids: HashSet::new(),
            outgoing_messages: Vec::new(),
            waiting_messages: Vec::new(),
            future_overlay_messages: Vec::new(),
        }
    }

    /// Resets per-query state and starts round 0 by "ending round -1"
    /// (`encrypted_multicast_to_proxies`'s pattern in the original). The
    /// caller is expected to have already populated `outgoing_messages`
    /// with this meter's initial onions.
    pub async fn start_query(&mut self, query_number: u64, handler: &mut dyn RoundHandler) -> Result<RoundOutcome> {
        self.current_round = -1;
        self.current_query_number = query_number;
        self.is_last_round = false;
        self.ping_response_from_predecessor = false;
        self.failed_meter_ids.clear();
        self.waiting_messages.clear();
        if let Some(id) = self.round_timeout_timer.take() {
            self.timer.cancel(id);
        }
        self.advance_round(handler).await
    }

    fn current_round_index(&self) -> i64 {
        self.current_round
    }

    /// Moves to a new phase handler within the same query, keeping the
    /// round counter running rather than resetting it to `-1` the way
    /// `start_query` does. Mirrors the original's `agreement_start_round =
    /// overlay_round` pattern: Shuffle into Echo, Shuffle into Agreement
    /// phase 1, and Agreement phase 1 into phase 2 all continue counting
    /// rounds from where the previous phase left off, since `total_rounds`
    /// on the new handler is computed from the just-finished phase's last
    /// round number, not from zero.
    pub async fn begin_phase(&mut self, handler: &mut dyn RoundHandler) -> Result<RoundOutcome> {
        self.is_last_round = false;
        self.advance_round(handler).await
    }

    /// Implements spec §4.1 step 8 and its explicit-loop redesign: ends the
    /// current round and keeps ending immediately-following rounds for as
    /// long as this meter already knows its new predecessor is dead,
    /// instead of recursing the way the original's `end_overlay_round` did.
    pub async fn advance_round(&mut self, handler: &mut dyn RoundHandler) -> Result<RoundOutcome> {
        loop {
            if let Some(id) = self.round_timeout_timer.take() {
                self.timer.cancel(id);
            }
            if self.is_last_round {
                return Ok(RoundOutcome::PhaseComplete);
            }

            self.current_round += 1;
            self.ping_response_from_predecessor = false;
            trace!(meter_id = self.meter_id, round = self.current_round, "ending round, advancing");

            if self.current_round + 1 >= handler.total_rounds() {
                self.is_last_round = true;
            }

            // Spec §4.1 step 1: replay future-buffered messages addressed to
            // this round *before* forming/sending this round's batch, so a
            // message that arrived early and needs forwarding lands in
            // `waiting_messages` in time to ride this round's batch instead
            // of missing its gossip-partner window by a full round.
            let round = self.current_round;
            let query = self.current_query_number;
            let mut ready = Vec::new();
            self.future_overlay_messages.retain(|m| {
                if m.sender_round == round && m.body.query_number == query {
                    ready.push(m.clone());
                    false
                } else {
                    true
                }
            });
            for message in ready {
                self.deliver(message, handler)?;
            }

            let comm_target = target(self.meter_id, self.current_round, self.num_meters);
            for extra in handler.prepare_round(comm_target) {
                self.outgoing_messages.push(extra);
            }
            self.send_batch().await?;
            self.arm_timeout();

            let pred = predecessor(self.meter_id, self.current_round, self.num_meters);
            if !self.failed_meter_ids.contains(&pred) {
                if self.network.send_ping(PingMessage::request(self.meter_id), pred).await.is_err() {
                    debug!(meter_id = self.meter_id, predecessor = pred, "predecessor is down");
                    self.failed_meter_ids.insert(pred);
                }
            }

            if self.failed_meter_ids.contains(&pred) {
                trace!(meter_id = self.meter_id, round = self.current_round, predecessor = pred, "predecessor already dead, ending round early");
                continue;
            }
            return Ok(RoundOutcome::Waiting);
        }
    }

    async fn send_batch(&mut self) -> Result<()> {
        let comm_target = target(self.meter_id, self.current_round, self.num_meters);
        let mut to_send = Vec::new();
        let mut still_waiting = Vec::new();

        // A flooded message is re-sent every round, regardless of
        // destination, until the round it actually reaches that
        // destination — at which point it is sent one last time and
        // dropped from the flood set (spec §4.3 HFT paragraph).
        for message in self.waiting_messages.drain(..) {
            let reached = message.destination == comm_target;
            if message.flood || reached {
                let keep_flooding = message.flood && !reached;
                if keep_flooding {
                    still_waiting.push(message.clone());
                }
                to_send.push(message);
            } else {
                still_waiting.push(message);
            }
        }
        self.waiting_messages = still_waiting;

        for message in self.outgoing_messages.drain(..) {
            let reached = message.destination == comm_target;
            if message.flood || reached {
                if message.flood && !reached {
                    self.waiting_messages.push(message.clone());
                }
                to_send.push(message);
            } else {
                self.waiting_messages.push(message);
            }
        }

        let transports: Vec<OverlayTransportMessage> = if to_send.is_empty() {
            vec![OverlayTransportMessage::new(
                self.meter_id,
                self.current_round,
                true,
                OverlayMessage::dummy(self.current_query_number, comm_target),
            )]
        } else {
            let n = to_send.len();
            to_send
                .into_iter()
                .enumerate()
                .map(|(i, body)| OverlayTransportMessage::new(self.meter_id, self.current_round, i + 1 == n, body))
                .collect()
        };

        if self.network.send_overlay_batch(transports, comm_target).await.is_err() {
            debug!(meter_id = self.meter_id, target = comm_target, "send target is down");
            self.failed_meter_ids.insert(comm_target);
        }
        Ok(())
    }

    fn arm_timeout(&mut self) {
        let callback = Arc::clone(&self.on_timeout);
        let id = self.timer.register(self.round_timeout_ms, Box::new(move || callback()));
        self.round_timeout_timer = Some(id);
    }

    /// Called by the owning actor when the round-timeout fires. Implements
    /// spec §4.1 step 7: if the predecessor answered a ping since the last
    /// arming, re-ping and keep waiting; otherwise end the round.
    pub async fn handle_round_timeout(&mut self, handler: &mut dyn RoundHandler) -> Result<RoundOutcome> {
        if self.ping_response_from_predecessor {
            self.ping_response_from_predecessor = false;
            let pred = predecessor(self.meter_id, self.current_round, self.num_meters);
            trace!(meter_id = self.meter_id, round = self.current_round, predecessor = pred, "still waiting, predecessor was alive recently");
            self.arm_timeout();
            if self.network.send_ping(PingMessage::request(self.meter_id), pred).await.is_err() {
                self.failed_meter_ids.insert(pred);
            }
            Ok(RoundOutcome::Waiting)
        } else {
            debug!(meter_id = self.meter_id, round = self.current_round, "round timed out");
            self.advance_round(handler).await
        }
    }

    /// Handles a ping message (request or response) per spec §4.1 step 4's
    /// failure-detection companion.
    pub async fn handle_ping(&mut self, message: PingMessage) -> Result<()> {
        if !message.is_response {
            let reply = PingMessage::response(self.meter_id);
            trace!(meter_id = self.meter_id, from = message.sender_id, "replying to ping");
            let _ = self.network.send_ping(reply, message.sender_id).await;
        } else if message.sender_id == predecessor(self.meter_id, self.current_round, self.num_meters) {
            self.ping_response_from_predecessor = true;
        }
        Ok(())
    }

    /// Implements spec §4.1's delivery rules for one inbound
    /// `OverlayTransportMessage`, returning whether this was the round's
    /// final message.
    pub fn deliver(&mut self, message: OverlayTransportMessage, handler: &mut dyn RoundHandler) -> Result<DeliverOutcome> {
        if target(message.sender_id, message.sender_round, self.num_meters) != self.meter_id {
            debug!(meter_id = self.meter_id, sender = message.sender_id, "dropping message from the wrong gossip partner");
            return Ok(DeliverOutcome::Handled);
        }

        if message.body.query_number > self.current_query_number {
            self.future_overlay_messages.push(message);
            return Ok(DeliverOutcome::Handled);
        }
        if message.body.query_number < self.current_query_number {
            debug!(meter_id = self.meter_id, "dropping message for a stale query");
            return Ok(DeliverOutcome::Handled);
        }
        if message.sender_round > self.current_round {
            self.future_overlay_messages.push(message);
            return Ok(DeliverOutcome::Handled);
        }
        if message.sender_round < self.current_round {
            debug!(meter_id = self.meter_id, "dropping message for a stale round");
            return Ok(DeliverOutcome::Handled);
        }

        if handler.is_active() {
            if let Some(id) = self.round_timeout_timer.take() {
                self.timer.cancel(id);
            }
            self.arm_timeout();
        }

        let is_final = message.is_final_message;
        let sender_id = message.sender_id;
        let mut body = message.body;
        if body.is_encrypted {
            body = self.crypto.rsa_decrypt_message(body)?;
        }
        let query_number = body.query_number;
        let destination = body.destination;
        let flood = body.flood;
        let kind = *body.body;

        match kind {
            MessageBody::Overlay(inner) => {
                self.waiting_messages.push(*inner);
            }
            MessageBody::Path(mut path_msg) => {
                if path_msg.advance() {
                    // More hops remain: keep the route attached and forward
                    // to the newly-advanced destination, rather than
                    // unwrapping to `inner` and losing `remaining_path`.
                    let next_destination = path_msg.inner.destination;
                    self.waiting_messages.push(OverlayMessage {
                        query_number,
                        destination: next_destination,
                        is_encrypted: false,
                        flood,
                        body: Box::new(MessageBody::Path(path_msg)),
                    });
                } else if path_msg.inner.destination == self.meter_id {
                    handler.handle_message(sender_id, *path_msg.inner.body)?;
                } else {
                    self.waiting_messages.push(path_msg.inner);
                }
            }
            other if destination == self.meter_id => {
                handler.handle_message(sender_id, other)?;
            }
            other => {
                self.waiting_messages.push(OverlayMessage {
                    query_number,
                    destination,
                    is_encrypted: false,
                    flood,
                    body: Box::new(other),
                });
            }
        }

        if is_final {
            Ok(DeliverOutcome::RoundComplete)
        } else {
            Ok(DeliverOutcome::Handled)
        }
    }

    pub fn enqueue_outgoing(&mut self, message: OverlayMessage) {
        self.outgoing_messages.push(message);
    }

    pub fn current_round_number(&self) -> i64 {
        self.current_round_index()
    }
}

/// A `RoundHandler` that is never active and has zero rounds, used as a
/// placeholder before a meter's first query and to satisfy the type when
/// no phase-specific dispatch is needed (e.g. in isolated `RoundDriver`
/// tests).
pub struct NullHandler {
    active: AtomicBool,
}

impl Default for NullHandler {
    fn default() -> Self {
        Self { active: AtomicBool::new(true) }
    }
}

impl RoundHandler for NullHandler {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    fn handle_message(&mut self, _sender_id: MeterId, _body: MessageBody) -> Result<()> {
        Ok(())
    }

    fn total_rounds(&self) -> i64 {
        i64::MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::null::NullCrypto;
    use crate::net::mock::{InMemoryNetwork, Switchboard};
    use crate::timer::tokio_timer::TokioTimer;
    use std::sync::Mutex;

    struct CountingHandler {
        rounds: i64,
        received: Vec<MessageBody>,
    }

    impl RoundHandler for CountingHandler {
        fn is_active(&self) -> bool {
            true
        }
        fn handle_message(&mut self, _sender_id: MeterId, body: MessageBody) -> Result<()> {
            self.received.push(body);
            Ok(())
        }
        fn total_rounds(&self) -> i64 {
            self.rounds
        }
    }

    fn driver(meter_id: MeterId, num_meters: u64, board: &Arc<Switchboard>) -> RoundDriver {
        let network = Arc::new(InMemoryNetwork::new(Arc::clone(board)));
        let crypto = Arc::new(NullCrypto::new(meter_id));
        let timer = Arc::new(TokioTimer::new());
        let fired = Arc::new(Mutex::new(false));
        RoundDriver::new(meter_id, num_meters, network, crypto, timer, 20, Arc::new(move || {
            *fired.lock().unwrap() = true;
        }))
    }

    #[tokio::test]
    async fn starting_a_query_sends_round_zero_immediately() {
        let board = Switchboard::new();
        let mut rx_target = board.register(1);
        let _rx_pred = board.register(target(0, -1, 5).min(4).max(0));
        let mut d = driver(0, 5, &board);
        let mut handler = CountingHandler { rounds: 10, received: vec![] };
        d.enqueue_outgoing(OverlayMessage::new(1, 1, MessageBody::Bytes(b"hi".to_vec())));
        let outcome = d.start_query(1, &mut handler).await.unwrap();
        assert_eq!(outcome, RoundOutcome::Waiting);
        assert_eq!(d.current_round_number(), 0);
        assert!(rx_target.try_recv().is_ok());
    }

    #[tokio::test]
    async fn empty_outgoing_batch_sends_a_dummy_message() {
        let board = Switchboard::new();
        let target_id = target(0, 0, 5);
        let mut rx_target = board.register(target_id);
        let mut d = driver(0, 5, &board);
        let mut handler = CountingHandler { rounds: 10, received: vec![] };
        d.start_query(1, &mut handler).await.unwrap();
        match rx_target.try_recv().unwrap() {
            crate::net::mock::Delivered::OverlayBatch(batch) => {
                assert_eq!(batch.len(), 1);
                assert_eq!(*batch[0].body.body, MessageBody::None);
            }
            other => panic!("unexpected delivery: {:?}", other),
        }
    }

    #[test]
    fn wrong_gossip_partner_is_dropped_not_buffered() {
        let board = Switchboard::new();
        let mut d = driver(0, 101, &board);
        d.current_query_number = 1;
        d.current_round = 0;
        let mut handler = CountingHandler { rounds: 10, received: vec![] };
        let bogus = OverlayTransportMessage::new(3, 0, true, OverlayMessage::dummy(1, 0));
        let outcome = d.deliver(bogus, &mut handler).unwrap();
        assert_eq!(outcome, DeliverOutcome::Handled);
        assert!(handler.received.is_empty());
        assert!(d.future_overlay_messages.is_empty());
    }

    #[test]
    fn future_query_message_is_buffered() {
        let board = Switchboard::new();
        let mut d = driver(0, 101, &board);
        d.current_query_number = 1;
        d.current_round = 0;
        let mut handler = CountingHandler { rounds: 10, received: vec![] };
        let sender = predecessor(0, 0, 101);
        let future = OverlayTransportMessage::new(sender, 0, true, OverlayMessage::dummy(2, 0));
        d.deliver(future, &mut handler).unwrap();
        assert_eq!(d.future_overlay_messages.len(), 1);
    }
}
