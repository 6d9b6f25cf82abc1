//! The per-meter actor (spec §5, §7): a single-threaded cooperative state
//! machine that owns one meter's slice of the protocol — its overlay round
//! driver, its current phase, and whatever contributions/aggregates it is
//! holding for the query presently in flight.
//!
//! Grounded in `original_source/src/MeterClient.{h,cpp}` and
//! `ProtocolState.h`: the original is itself a single-threaded event-loop
//! object dispatching on message type and `currentState`; here that loop is
//! a `tokio` task draining an `mpsc` mailbox, and `currentState` becomes the
//! `Phase` enum below. No handler ever awaits mid-body, so two events can
//! never interleave inside one meter (spec §5's "no two handlers for the
//! same meter may execute in parallel").

use crate::config::ProtocolVariant;
use crate::crypto::{sign_payload, Crypto};
use crate::device::{price_fn_from_bytes, MeterCapability};
use crate::error::Result;
use crate::fixed_point::FixedPoint;
use crate::net::Network;
use crate::overlay::build_proxy_onions;
use crate::overlay::graph::{aggregation_tree_children, aggregation_tree_parent, log2_ceil, pick_proxies};
use crate::overlay::round_driver::{DeliverOutcome, NullHandler, RoundDriver, RoundHandler, RoundOutcome};
use crate::phases;
use crate::phases::agreement::{build_phase_two_outgoing, AgreementPhase1Handler, AgreementPhase2Handler};
use crate::phases::aggregate::AggregationState;
use crate::phases::echo::{build_echo_onions, EchoHandler};
use crate::phases::gather::{build_gather_onions, GatherHandler};
use crate::phases::scatter::{build_initial_flood_onions, pick_relays, ScatterHandler};
use crate::phases::shuffle::{build_initial_onions, ShuffleHandler};
use crate::timer::Timer;
use crate::types::{
    AggregationMessage, MeterId, OverlayTransportMessage, PingMessage, QueryRequest, QueryType,
    SignatureRequest, SignatureResponse, SignedValue, ValueContribution, ValueTuple,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Everything that can arrive at a meter's mailbox: a new query from the
/// utility, one round's worth of overlay traffic, a liveness ping, an
/// aggregation-tree message from a child, the utility's answer to a blind
/// signature request, or this meter's own round timeout firing.
#[derive(Debug)]
pub enum MeterEvent {
    Query(QueryRequest),
    OverlayBatch(Vec<OverlayTransportMessage>),
    Ping(PingMessage),
    Aggregation(AggregationMessage),
    SignatureResponse(SignatureResponse),
    RoundTimeout,
}

/// A cheap, cloneable handle to a running meter actor's mailbox.
#[derive(Clone)]
pub struct MeterHandle {
    tx: mpsc::UnboundedSender<MeterEvent>,
}

impl MeterHandle {
    pub fn send(&self, event: MeterEvent) {
        // The only way this fails is the actor task having already
        // stopped (panicked or been dropped); nothing to do but drop the
        // event, same as a crashed peer silently missing a message.
        let _ = self.tx.send(event);
    }
}

/// Which stage of the protocol a meter is presently in. Holds owned,
/// concrete handler values rather than `Box<dyn RoundHandler>` so phase
/// transitions can call each handler's own consuming accessor
/// (`into_proxy_values`, `accepted_values`, ...) by pattern matching,
/// which a trait object alone couldn't offer without downcasting.
enum Phase {
    /// Nothing in flight for this meter right now.
    Idle,
    /// Byzantine only: waiting for the utility's blind signature over this
    /// meter's own measurement before Shuffle can start.
    AwaitingSignature { value: ValueTuple, proxies: Vec<MeterId> },
    Shuffle(ShuffleHandler),
    Scatter(ScatterHandler),
    Echo(EchoHandler),
    Gather(GatherHandler),
    Agreement1(AgreementPhase1Handler),
    Agreement2(AgreementPhase2Handler),
    /// Round-independent: waiting for this meter's tree children to report.
    Aggregate(AggregationState),
}

impl Phase {
    fn as_round_handler(&mut self) -> Option<&mut dyn RoundHandler> {
        match self {
            Phase::Shuffle(h) => Some(h),
            Phase::Scatter(h) => Some(h),
            Phase::Echo(h) => Some(h),
            Phase::Gather(h) => Some(h),
            Phase::Agreement1(h) => Some(h),
            Phase::Agreement2(h) => Some(h),
            Phase::Idle | Phase::AwaitingSignature { .. } | Phase::Aggregate(_) => None,
        }
    }
}

/// One meter's slice of the protocol: its identity, its deployment
/// parameters, its persistent `RoundDriver`, and whatever phase/query state
/// it is presently holding.
///
/// `t` and the aggregation group count `G` are taken as plain constructor
/// inputs rather than derived from `num_meters`/`variant` internally — see
/// `DESIGN.md`'s note on why a real deployment's `Config`-derived values and
/// a toy-sized test's hand-picked values both need to reach this type the
/// same way.
pub struct MeterActor {
    my_id: MeterId,
    num_meters: u64,
    t: u64,
    variant: ProtocolVariant,
    num_groups: usize,
    network: Arc<dyn Network>,
    crypto: Arc<dyn Crypto>,
    capability: Arc<dyn MeterCapability>,

    /// Lives for the actor's whole lifetime, not just one query (see
    /// `DESIGN.md`): its `future_overlay_messages` buffer is the only place
    /// a subsequent query's overlay traffic can land while this query is
    /// still finishing Aggregate.
    driver: RoundDriver,
    phase: Phase,
    current_query: Option<u64>,
    proxies: Vec<MeterId>,
    measurement_len: usize,
    own_contributions: HashSet<ValueContribution>,
    /// Aggregation messages that arrived before this meter reached
    /// Aggregate for their query (a child can finish and report before its
    /// parent has even left Shuffle), keyed implicitly by `query_number`.
    pending_aggregation: Vec<AggregationMessage>,
}

impl MeterActor {
    /// Spawns the actor's mailbox loop as a `tokio` task and returns a
    /// handle to it. `round_timeout_ms` is forwarded straight to the
    /// `RoundDriver`; the driver's own timeout callback re-enqueues
    /// `MeterEvent::RoundTimeout` onto this same mailbox, so timeout
    /// handling runs on the actor's single-threaded loop like every other
    /// event.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        my_id: MeterId,
        num_meters: u64,
        t: u64,
        num_groups: usize,
        variant: ProtocolVariant,
        network: Arc<dyn Network>,
        crypto: Arc<dyn Crypto>,
        timer: Arc<dyn Timer>,
        capability: Arc<dyn MeterCapability>,
        round_timeout_ms: u64,
    ) -> (MeterHandle, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<MeterEvent>();
        let handle = MeterHandle { tx: tx.clone() };
        let mut actor = Self::new(
            my_id, num_meters, t, num_groups, variant, network, crypto, timer, capability, round_timeout_ms, tx,
        );
        let join = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(error) = actor.handle_event(event).await {
                    warn!(meter_id = actor.my_id, %error, "error handling meter event");
                }
            }
        });
        (handle, join)
    }

    /// Constructs the actor without spawning its loop, for callers (tests)
    /// that want to drive events one at a time themselves.
    /// `self_sender` must be the sending half of the mailbox this actor
    /// will eventually be driven from, so the round driver's timeout
    /// callback re-enqueues onto the right channel.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        my_id: MeterId,
        num_meters: u64,
        t: u64,
        num_groups: usize,
        variant: ProtocolVariant,
        network: Arc<dyn Network>,
        crypto: Arc<dyn Crypto>,
        timer: Arc<dyn Timer>,
        capability: Arc<dyn MeterCapability>,
        round_timeout_ms: u64,
        self_sender: mpsc::UnboundedSender<MeterEvent>,
    ) -> Self {
        let on_timeout_tx = self_sender;
        let on_timeout: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            let _ = on_timeout_tx.send(MeterEvent::RoundTimeout);
        });
        let driver = RoundDriver::new(my_id, num_meters, Arc::clone(&network), Arc::clone(&crypto), timer, round_timeout_ms, on_timeout);
        Self {
            my_id,
            num_meters,
            t,
            variant,
            num_groups,
            network,
            crypto,
            capability,
            driver,
            phase: Phase::Idle,
            current_query: None,
            proxies: Vec::new(),
            measurement_len: 0,
            own_contributions: HashSet::new(),
            pending_aggregation: Vec::new(),
        }
    }

    pub fn my_id(&self) -> MeterId {
        self.my_id
    }

    pub fn current_query(&self) -> Option<u64> {
        self.current_query
    }

    /// Dispatches one mailbox event. Synchronous handlers only touch
    /// `self`'s own state; the one place this method awaits is sending
    /// onto the network, same granularity as the original's per-message
    /// handlers.
    pub async fn handle_event(&mut self, event: MeterEvent) -> Result<()> {
        match event {
            MeterEvent::Query(request) => self.on_query(request).await,
            MeterEvent::OverlayBatch(batch) => self.on_overlay_batch(batch).await,
            MeterEvent::Ping(ping) => self.driver.handle_ping(ping).await,
            MeterEvent::Aggregation(message) => self.on_aggregation_message(message).await,
            MeterEvent::SignatureResponse(response) => self.on_signature_response(response).await,
            MeterEvent::RoundTimeout => self.on_round_timeout().await,
        }
    }

    fn query_rng(&self, query_number: u64) -> StdRng {
        let seed = (self.my_id as u64)
            ^ query_number.wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ ((self.num_meters) << 32);
        StdRng::seed_from_u64(seed)
    }

    fn measure(&self, request: &QueryRequest) -> Result<Vec<FixedPoint>> {
        let measurements = match request.request_type {
            QueryType::TotalConsumption => vec![self.capability.measure_consumption(request.time_window_minutes)],
            QueryType::ShiftableConsumption => {
                vec![self.capability.measure_shiftable_consumption(request.time_window_minutes)]
            }
            QueryType::DailyConsumption => vec![self.capability.measure_daily_consumption()],
            QueryType::ProjectedUsage => {
                let bytes = request.price_fn.as_deref().unwrap_or(&[]);
                let price_fn = price_fn_from_bytes(bytes)?;
                self.capability.simulate_projected_usage(&price_fn, request.time_window_minutes)
            }
        };
        Ok(measurements)
    }

    /// A new query preempts whatever this meter was doing for an older one
    /// (spec §7: "strictly greater `query_number` preempts"); an
    /// already-in-flight or older query number is ignored.
    async fn on_query(&mut self, request: QueryRequest) -> Result<()> {
        if let Some(current) = self.current_query {
            if request.query_number <= current {
                debug!(
                    meter_id = self.my_id,
                    query_number = request.query_number,
                    current,
                    "ignoring query that does not strictly advance the query number"
                );
                return Ok(());
            }
        }

        self.current_query = Some(request.query_number);
        self.own_contributions.clear();
        self.pending_aggregation.retain(|m| m.query_number >= request.query_number);

        let measurements = self.measure(&request)?;
        self.measurement_len = measurements.len();

        let mut rng = self.query_rng(request.query_number);
        let proxies = pick_proxies(self.my_id, self.num_groups, self.num_meters as usize, &mut rng)?;
        self.proxies = proxies.clone();
        let value = ValueTuple::new(request.query_number, measurements, proxies.clone());

        match self.variant {
            ProtocolVariant::Byzantine => {
                let blinded = self
                    .crypto
                    .rsa_blind(&rmp_serde::to_vec(&value).map_err(|e| crate::error::Error::Serialisation(e.to_string()))?)?;
                self.phase = Phase::AwaitingSignature { value, proxies };
                self.network
                    .send_signature_request(SignatureRequest {
                        sender_id: self.my_id,
                        blinded_value: blinded,
                    })
                    .await
            }
            ProtocolVariant::CrashTolerant => {
                let contribution = ValueContribution::unsigned(value);
                self.start_shuffle(request.query_number, contribution, false).await
            }
            ProtocolVariant::HighFailureTolerant => {
                let contribution = ValueContribution::unsigned(value);
                self.start_scatter(request.query_number, contribution, &mut rng).await
            }
        }
    }

    async fn on_signature_response(&mut self, response: SignatureResponse) -> Result<()> {
        let (value, proxies) = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::AwaitingSignature { value, proxies } => (value, proxies),
            other => {
                self.phase = other;
                debug!(meter_id = self.my_id, "ignoring signature response while not awaiting one");
                return Ok(());
            }
        };
        let signature = self.crypto.rsa_unblind(&response.blinded_signature)?;
        let query_number = value.query_number;
        self.proxies = proxies;
        let contribution = ValueContribution::new(value, signature);
        self.start_shuffle(query_number, contribution, true).await
    }

    async fn start_shuffle(&mut self, query_number: u64, contribution: ValueContribution, verify_signature: bool) -> Result<()> {
        let proxies = self.proxies.clone();
        let onions = build_initial_onions(self.my_id, &proxies, self.num_meters as usize, &*self.crypto, query_number, contribution)?;
        for onion in onions {
            self.driver.enqueue_outgoing(onion);
        }
        let total_rounds = match self.variant {
            ProtocolVariant::Byzantine => phases::byzantine_rounds(self.t, self.num_meters as usize),
            _ => phases::crash_tolerant_rounds(self.t, self.num_meters as usize),
        };
        self.phase = Phase::Shuffle(ShuffleHandler::new(Arc::clone(&self.crypto), verify_signature, total_rounds));
        let outcome = {
            let handler = self.phase.as_round_handler().expect("shuffle phase just set");
            self.driver.start_query(query_number, handler).await?
        };
        self.drive(query_number, outcome).await
    }

    async fn start_scatter(&mut self, query_number: u64, contribution: ValueContribution, rng: &mut StdRng) -> Result<()> {
        let proxies = self.proxies.clone();
        let relays = pick_relays(self.my_id, &proxies, self.num_meters as usize, rng);
        let onions = build_initial_flood_onions(&proxies, &relays, &*self.crypto, query_number, contribution)?;
        for onion in onions {
            self.driver.enqueue_outgoing(onion);
        }
        let total_rounds = phases::flood_rounds(self.t, self.num_meters as usize);
        self.phase = Phase::Scatter(ScatterHandler::new(total_rounds));
        let outcome = {
            let handler = self.phase.as_round_handler().expect("scatter phase just set");
            self.driver.start_query(query_number, handler).await?
        };
        self.drive(query_number, outcome).await
    }

    async fn start_agreement1(&mut self, query_number: u64, proxy_values: HashSet<ValueContribution>) -> Result<RoundOutcome> {
        let next_round = self.driver.current_round_number() + 1;
        let mut seed: HashMap<ValueContribution, SignedValue> = HashMap::new();
        let mut onions = Vec::new();
        for contribution in &proxy_values {
            let signature = sign_payload(&*self.crypto, contribution)?;
            let signed_value = SignedValue::new(Arc::new(contribution.clone()), self.my_id, signature);
            let others: Vec<MeterId> = contribution.value.proxies.iter().copied().filter(|p| *p != self.my_id).collect();
            if !others.is_empty() {
                let built = build_proxy_onions(self.my_id, &others, self.num_meters as usize, next_round, &*self.crypto, query_number, {
                    let signed_value = signed_value.clone();
                    move |_proxy| crate::types::MessageBody::Signed(signed_value.clone())
                })?;
                onions.extend(built);
            }
            seed.insert(contribution.clone(), signed_value);
        }
        for onion in onions {
            self.driver.enqueue_outgoing(onion);
        }
        let total_rounds = next_round + phases::byzantine_rounds(self.t, self.num_meters as usize);
        self.phase = Phase::Agreement1(AgreementPhase1Handler::new(Arc::clone(&self.crypto), total_rounds, seed));
        let handler = self.phase.as_round_handler().expect("agreement1 phase just set");
        self.driver.begin_phase(handler).await
    }

    /// Advances through handler transitions (`RoundDriver::begin_phase` /
    /// `PhaseComplete`) until the driver settles on `Waiting`, or the
    /// protocol reaches the round-independent Aggregate phase.
    async fn drive(&mut self, query_number: u64, mut outcome: RoundOutcome) -> Result<()> {
        loop {
            match outcome {
                RoundOutcome::Waiting => return Ok(()),
                RoundOutcome::PhaseComplete => match self.transition(query_number).await? {
                    Some(next) => outcome = next,
                    None => return Ok(()),
                },
            }
        }
    }

    /// Moves from one finished overlay phase to the next, or (for the last
    /// overlay phase of each variant) into Aggregate. Returns `None` once
    /// Aggregate has taken over, since it is round-independent and has no
    /// `RoundOutcome` of its own.
    async fn transition(&mut self, query_number: u64) -> Result<Option<RoundOutcome>> {
        let phase = std::mem::replace(&mut self.phase, Phase::Idle);
        match phase {
            Phase::Shuffle(handler) => {
                let proxy_values = handler.into_proxy_values();
                match self.variant {
                    ProtocolVariant::CrashTolerant => {
                        let next_round = self.driver.current_round_number() + 1;
                        let onions = build_echo_onions(self.my_id, self.num_meters as usize, next_round, &*self.crypto, query_number, &proxy_values)?;
                        for onion in onions {
                            self.driver.enqueue_outgoing(onion);
                        }
                        let total_rounds = next_round + phases::crash_tolerant_rounds(self.t, self.num_meters as usize);
                        self.phase = Phase::Echo(EchoHandler::new(total_rounds, proxy_values));
                        let handler = self.phase.as_round_handler().expect("echo phase just set");
                        Ok(Some(self.driver.begin_phase(handler).await?))
                    }
                    ProtocolVariant::Byzantine => Ok(Some(self.start_agreement1(query_number, proxy_values).await?)),
                    ProtocolVariant::HighFailureTolerant => {
                        unreachable!("high-failure-tolerant never enters Shuffle")
                    }
                }
            }
            Phase::Scatter(handler) => {
                let proxy_values = handler.into_proxy_values();
                let next_round = self.driver.current_round_number() + 1;
                let onions = build_gather_onions(self.my_id, self.num_meters as usize, next_round, &*self.crypto, query_number, &proxy_values)?;
                for onion in onions {
                    self.driver.enqueue_outgoing(onion);
                }
                let total_rounds = next_round + phases::flood_rounds(self.t, self.num_meters as usize);
                self.phase = Phase::Gather(GatherHandler::new(total_rounds, proxy_values));
                let handler = self.phase.as_round_handler().expect("gather phase just set");
                Ok(Some(self.driver.begin_phase(handler).await?))
            }
            Phase::Echo(handler) => {
                self.own_contributions = handler.into_proxy_values();
                self.start_aggregate(query_number).await?;
                Ok(None)
            }
            Phase::Gather(handler) => {
                self.own_contributions = handler.into_proxy_values();
                self.start_aggregate(query_number).await?;
                Ok(None)
            }
            Phase::Agreement1(handler) => {
                let signed_proxy_values = handler.into_signed_proxy_values();
                let next_round = self.driver.current_round_number() + 1;
                let log2n = log2_ceil(self.num_meters as usize) as usize;
                let signature_quorum = log2n + 1;
                let outgoing = build_phase_two_outgoing(
                    self.my_id,
                    &*self.crypto,
                    self.num_meters as usize,
                    next_round,
                    query_number,
                    &signed_proxy_values,
                    signature_quorum,
                )?;
                for onion in outgoing {
                    self.driver.enqueue_outgoing(onion);
                }
                let total_rounds = next_round + phases::byzantine_rounds(self.t, self.num_meters as usize);
                self.phase = Phase::Agreement2(AgreementPhase2Handler::new(Arc::clone(&self.crypto), total_rounds, log2n, signed_proxy_values));
                let handler = self.phase.as_round_handler().expect("agreement2 phase just set");
                Ok(Some(self.driver.begin_phase(handler).await?))
            }
            Phase::Agreement2(handler) => {
                let log2n = log2_ceil(self.num_meters as usize) as usize;
                self.own_contributions = handler.accepted_values(log2n + 1);
                self.start_aggregate(query_number).await?;
                Ok(None)
            }
            other @ (Phase::Idle | Phase::AwaitingSignature { .. } | Phase::Aggregate(_)) => {
                self.phase = other;
                Ok(None)
            }
        }
    }

    async fn start_aggregate(&mut self, query_number: u64) -> Result<()> {
        let (left, right) = aggregation_tree_children(self.my_id, self.num_groups, self.num_meters as usize);
        let children: Vec<MeterId> = [left, right].into_iter().flatten().collect();
        let parent = aggregation_tree_parent(self.my_id, self.num_groups, self.num_meters as usize);
        let mut state = AggregationState::new(query_number, parent, &children, &self.driver.failed_meter_ids, self.measurement_len);

        let (mine, rest): (Vec<_>, Vec<_>) = self
            .pending_aggregation
            .drain(..)
            .partition(|m| m.query_number == query_number);
        self.pending_aggregation = rest;
        for message in &mine {
            state.receive_from_child(message);
        }

        if state.is_complete() {
            self.finish_aggregate(state).await
        } else {
            self.phase = Phase::Aggregate(state);
            Ok(())
        }
    }

    async fn finish_aggregate(&mut self, state: AggregationState) -> Result<()> {
        let (recipient, message) = state.finish(self.my_id, &self.own_contributions);
        self.network.send_aggregation(message, recipient).await?;
        self.phase = Phase::Idle;
        Ok(())
    }

    /// Aggregation messages are round-independent and can arrive well
    /// before this meter has itself finished overlay rounds and reached
    /// Aggregate (a shallow tree child can finish long before a deep one's
    /// ancestors do), so anything for a query this meter isn't in
    /// Aggregate for yet is buffered rather than dropped.
    async fn on_aggregation_message(&mut self, message: AggregationMessage) -> Result<()> {
        let current = match self.current_query {
            Some(q) => q,
            None => {
                self.pending_aggregation.push(message);
                return Ok(());
            }
        };
        if message.query_number < current {
            debug!(meter_id = self.my_id, query_number = message.query_number, "dropping aggregation message for a stale query");
            return Ok(());
        }
        if message.query_number > current {
            self.pending_aggregation.push(message);
            return Ok(());
        }
        match &mut self.phase {
            Phase::Aggregate(state) => {
                state.receive_from_child(&message);
                if state.is_complete() {
                    let state = match std::mem::replace(&mut self.phase, Phase::Idle) {
                        Phase::Aggregate(state) => state,
                        _ => unreachable!("just matched Aggregate"),
                    };
                    self.finish_aggregate(state).await?;
                }
            }
            _ => self.pending_aggregation.push(message),
        }
        Ok(())
    }

    async fn on_overlay_batch(&mut self, batch: Vec<OverlayTransportMessage>) -> Result<()> {
        let query_number = self.current_query.unwrap_or(0);
        for message in batch {
            let deliver_outcome = match self.phase.as_round_handler() {
                Some(handler) => self.driver.deliver(message, handler)?,
                None => self.driver.deliver(message, &mut NullHandler::default())?,
            };
            if deliver_outcome == DeliverOutcome::RoundComplete {
                let round_outcome = match self.phase.as_round_handler() {
                    Some(handler) => self.driver.advance_round(handler).await?,
                    None => self.driver.advance_round(&mut NullHandler::default()).await?,
                };
                self.drive(query_number, round_outcome).await?;
            }
        }
        Ok(())
    }

    async fn on_round_timeout(&mut self) -> Result<()> {
        let query_number = self.current_query.unwrap_or(0);
        let outcome = match self.phase.as_round_handler() {
            Some(handler) => self.driver.handle_round_timeout(handler).await?,
            None => {
                debug!(meter_id = self.my_id, "ignoring round timeout outside an overlay phase");
                return Ok(());
            }
        };
        self.drive(query_number, outcome).await
    }
}

/// Two independent meter identities run on one host, sharing one
/// `Network`/`Timer` pair of handles but otherwise fully separate
/// `MeterActor`s with their own ids, keys, and protocol state (spec §9's
/// `set_second_id` discussion: padding a non-prime deployment up to the
/// next prime by running one extra identity somewhere rather than forcing
/// every physical meter to be unique hardware).
pub struct VirtualIdentity {
    pub primary: MeterHandle,
    pub secondary: MeterHandle,
}

impl VirtualIdentity {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        primary_id: MeterId,
        secondary_id: MeterId,
        num_meters: u64,
        t: u64,
        num_groups: usize,
        variant: ProtocolVariant,
        network: Arc<dyn Network>,
        primary_crypto: Arc<dyn Crypto>,
        secondary_crypto: Arc<dyn Crypto>,
        timer: Arc<dyn Timer>,
        capability: Arc<dyn MeterCapability>,
        round_timeout_ms: u64,
    ) -> Self {
        let (primary, _) = MeterActor::spawn(
            primary_id,
            num_meters,
            t,
            num_groups,
            variant,
            Arc::clone(&network),
            primary_crypto,
            Arc::clone(&timer),
            Arc::clone(&capability),
            round_timeout_ms,
        );
        let (secondary, _) = MeterActor::spawn(
            secondary_id, num_meters, t, num_groups, variant, network, secondary_crypto, timer, capability, round_timeout_ms,
        );
        Self { primary, secondary }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::null::NullCrypto;
    use crate::device::SimulatedMeter;
    use crate::net::mock::{InMemoryNetwork, Switchboard};
    use crate::timer::tokio_timer::TokioTimer;

    fn spawn_meter(
        id: MeterId,
        num_meters: u64,
        t: u64,
        num_groups: usize,
        variant: ProtocolVariant,
        board: &Arc<Switchboard>,
    ) -> (MeterHandle, mpsc::UnboundedReceiver<crate::net::mock::Delivered>) {
        let rx = board.register(id);
        let network: Arc<dyn Network> = Arc::new(InMemoryNetwork::new(Arc::clone(board)));
        let crypto: Arc<dyn Crypto> = Arc::new(NullCrypto::new(id));
        let timer: Arc<dyn Timer> = Arc::new(TokioTimer::new());
        let capability: Arc<dyn MeterCapability> = Arc::new(SimulatedMeter::new(id as u64, 500.0));
        let (handle, _join) = MeterActor::spawn(id, num_meters, t, num_groups, variant, network, crypto, timer, capability, 50);
        (handle, rx)
    }

    #[tokio::test]
    async fn a_fresh_meter_ignores_a_stale_query_number() {
        let board = Switchboard::new();
        let _other_rxs: Vec<_> = (0..7).map(|id| board.register(id)).collect();
        let network: Arc<dyn Network> = Arc::new(InMemoryNetwork::new(Arc::clone(&board)));
        let crypto: Arc<dyn Crypto> = Arc::new(NullCrypto::new(0));
        let timer: Arc<dyn Timer> = Arc::new(TokioTimer::new());
        let capability: Arc<dyn MeterCapability> = Arc::new(SimulatedMeter::new(0, 500.0));
        let (tx, rx) = mpsc::unbounded_channel();
        let mut actor = MeterActor::new(0, 7, 2, 3, ProtocolVariant::CrashTolerant, network, crypto, timer, capability, 50, tx);
        drop(rx);
        actor
            .handle_event(MeterEvent::Query(QueryRequest::new(QueryType::TotalConsumption, 60, 5)))
            .await
            .unwrap();
        assert_eq!(actor.current_query(), Some(5));
        actor
            .handle_event(MeterEvent::Query(QueryRequest::new(QueryType::TotalConsumption, 60, 5)))
            .await
            .unwrap();
        assert_eq!(actor.current_query(), Some(5));
    }

    #[tokio::test]
    async fn crash_tolerant_query_kicks_off_a_shuffle_and_sends_overlay_traffic() {
        let board = Switchboard::new();
        // target(0, round 0, 7 meters) == 1: meter 0's first gossip partner.
        let mut target_rx = board.register(1);
        let (handle, _rx0) = spawn_meter(0, 7, 3, 4, ProtocolVariant::CrashTolerant, &board);
        let _other_rxs: Vec<_> = (2..7).map(|id| board.register(id)).collect();

        handle.send(MeterEvent::Query(QueryRequest::new(QueryType::TotalConsumption, 60, 1)));

        let delivered = tokio::time::timeout(std::time::Duration::from_secs(1), target_rx.recv()).await;
        assert!(matches!(delivered, Ok(Some(_))), "expected meter 0's round-0 batch to reach meter 1");
    }
}
