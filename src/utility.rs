//! The utility's query coordinator (spec §4.7): issues queries one at a
//! time from a priority-ordered batch, collects meters' blind-signature
//! requests, waits for aggregation results to reach quorum (or time out),
//! and tallies the final answer.
//!
//! Grounded in `original_source/src/UtilityClient.cpp`: a single-threaded
//! object holding one in-flight query's state, a min-heap of queued
//! queries waiting their turn, and a round-count-based watchdog per query.

use crate::config::ProtocolVariant;
use crate::crypto::Crypto;
use crate::error::Result;
use crate::net::Network;
use crate::overlay::graph::log2_ceil;
use crate::timer::{Timer, TimerId};
use crate::types::{
    AggregationMessage, MeterId, QueryRequest, QueryType, SignatureRequest, SignatureResponse, UTILITY_ID,
};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// The outcome of one finished query, handed to whoever is waiting on it.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub query_number: u64,
    /// `None` if no result reached the required threshold before timeout
    /// (spec §4.7 "End of query": "if none exists, the query failed").
    pub body: Option<Vec<crate::fixed_point::FixedPoint>>,
    pub num_contributors: u32,
}

/// Mailbox events the utility coordinator reacts to.
#[derive(Debug)]
pub enum UtilityEvent {
    /// A new query to enqueue (not necessarily started immediately).
    SubmitQuery(QueryRequest),
    Aggregation(AggregationMessage),
    SignatureRequest(SignatureRequest),
    /// The current query's watchdog has fired.
    QueryTimeout(u64),
}

/// One queued query, ordered by `query_number` so the coordinator always
/// starts the earliest-submitted query next (spec §4.7's batch-queue
/// requirement), irrespective of the order `start_queries` received them in.
struct QueuedQuery(QueryRequest);

impl PartialEq for QueuedQuery {
    fn eq(&self, other: &Self) -> bool {
        self.0.query_number == other.0.query_number
    }
}
impl Eq for QueuedQuery {}
impl PartialOrd for QueuedQuery {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedQuery {
    fn cmp(&self, other: &Self) -> Ordering {
        // `BinaryHeap` is a max-heap; reverse so the smallest query_number
        // (the oldest submitted query) sorts first.
        other.0.query_number.cmp(&self.0.query_number)
    }
}

/// State for the one query presently running.
struct InFlightQuery {
    request: QueryRequest,
    /// Every aggregation message received so far for this query, keyed by
    /// the structural equality of its body (spec §9's redesign flag:
    /// explicit group-by-equality instead of an unindexed multiset scan).
    results_by_body: HashMap<Vec<crate::fixed_point::FixedPoint>, (u32, u32)>,
    watchdog: TimerId,
}

/// Round budget a query's watchdog is sized from (spec §4.7's
/// `rounds_for_query`), converted to milliseconds by the caller using the
/// same `round_timeout_ms` the meters themselves use.
pub fn rounds_for_query(variant: ProtocolVariant, t: u64, num_meters: u64) -> u64 {
    let log2n = log2_ceil(num_meters as usize) as u64;
    let n = num_meters;
    match variant {
        ProtocolVariant::Byzantine => 6 * t + 3 * log2n * log2n + 3 + log2_ceil_ratio(n, 2 * t + 1),
        ProtocolVariant::HighFailureTolerant => 2 * log2n + 2 * t + log2_ceil_ratio(n, t + 1),
        ProtocolVariant::CrashTolerant => 2 * t + 4 * log2n + 2 + log2_ceil_ratio(n, t + 1),
    }
}

/// `ceil(log2(a / b))` for the `ceil(log2(N/G))` term in `rounds_for_query`.
/// `log2_ceil` only takes an integer, so the ratio is rounded up first —
/// this slightly over-estimates the exact real-valued formula, which only
/// makes the resulting watchdog a little more generous, never tighter.
fn log2_ceil_ratio(a: u64, b: u64) -> u64 {
    if b == 0 {
        0
    } else {
        let rounded_up = (a + b - 1) / b;
        log2_ceil(rounded_up.max(1) as usize) as u64
    }
}

/// The utility's coordinator: owns the query queue, the in-flight query's
/// quorum/voting state, and per-meter blind-signature bookkeeping.
pub struct UtilityCoordinator {
    num_meters: u64,
    t: u64,
    variant: ProtocolVariant,
    network: Arc<dyn Network>,
    crypto: Arc<dyn Crypto>,
    timer: Arc<dyn Timer>,
    round_timeout_ms: u64,
    self_tx: mpsc::UnboundedSender<UtilityEvent>,

    pending: BinaryHeap<QueuedQuery>,
    current: Option<InFlightQuery>,
    /// Meters that have already had a blind signature issued for the
    /// current query (spec §4.7: "once per meter per query").
    signed_this_query: std::collections::HashSet<MeterId>,
    results_tx: Option<mpsc::UnboundedSender<QueryResult>>,
}

impl UtilityCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        num_meters: u64,
        t: u64,
        variant: ProtocolVariant,
        network: Arc<dyn Network>,
        crypto: Arc<dyn Crypto>,
        timer: Arc<dyn Timer>,
        round_timeout_ms: u64,
        self_tx: mpsc::UnboundedSender<UtilityEvent>,
    ) -> Self {
        Self {
            num_meters,
            t,
            variant,
            network,
            crypto,
            timer,
            round_timeout_ms,
            self_tx,
            pending: BinaryHeap::new(),
            current: None,
            signed_this_query: std::collections::HashSet::new(),
            results_tx: None,
        }
    }

    /// Registers the channel query results are published to. Optional:
    /// a coordinator with no subscriber still runs queries, it just has
    /// nowhere to report the answer.
    pub fn subscribe_results(&mut self, results_tx: mpsc::UnboundedSender<QueryResult>) {
        self.results_tx = Some(results_tx);
    }

    /// Enqueues one query. If nothing is currently running, starts it
    /// immediately.
    pub async fn start_query(&mut self, request: QueryRequest) -> Result<()> {
        self.pending.push(QueuedQuery(request));
        self.maybe_start_next().await
    }

    /// Enqueues a whole batch at once, preserving `start_query`'s
    /// one-at-a-time, `query_number`-ordered semantics (spec §4.7).
    pub async fn start_queries(&mut self, requests: Vec<QueryRequest>) -> Result<()> {
        for request in requests {
            self.pending.push(QueuedQuery(request));
        }
        self.maybe_start_next().await
    }

    async fn maybe_start_next(&mut self) -> Result<()> {
        if self.current.is_some() {
            return Ok(());
        }
        let Some(QueuedQuery(request)) = self.pending.pop() else {
            return Ok(());
        };

        info!(query_number = request.query_number, "starting query");
        self.signed_this_query.clear();
        let rounds = rounds_for_query(self.variant, self.t, self.num_meters);
        let watchdog_ms = rounds * self.round_timeout_ms;
        let query_number = request.query_number;
        let tx = self.self_tx.clone();
        let watchdog = self.timer.register(
            watchdog_ms,
            Box::new(move || {
                let _ = tx.send(UtilityEvent::QueryTimeout(query_number));
            }),
        );
        self.current = Some(InFlightQuery {
            request: request.clone(),
            results_by_body: HashMap::new(),
            watchdog,
        });

        for meter_id in 0..self.num_meters as MeterId {
            self.network.send_query(request.clone(), meter_id).await?;
        }
        Ok(())
    }

    pub async fn handle_event(&mut self, event: UtilityEvent) -> Result<()> {
        match event {
            UtilityEvent::SubmitQuery(request) => self.start_query(request).await,
            UtilityEvent::Aggregation(message) => self.on_aggregation_message(message).await,
            UtilityEvent::SignatureRequest(request) => self.on_signature_request(request).await,
            UtilityEvent::QueryTimeout(query_number) => self.on_query_timeout(query_number).await,
        }
    }

    /// Blind-signs `request.blinded_value` on the utility's behalf, once
    /// per meter per query (spec §4.7, §6). A repeated request from the
    /// same meter for the query already in flight is ignored rather than
    /// re-signed, matching the "once per meter per query" invariant.
    async fn on_signature_request(&mut self, request: SignatureRequest) -> Result<()> {
        if !self.signed_this_query.insert(request.sender_id) {
            debug!(sender_id = request.sender_id, "ignoring repeated signature request for this query");
            return Ok(());
        }
        let blinded_signature = self.crypto.rsa_sign_blinded(&request.blinded_value)?;
        self.network
            .send_signature_response(
                SignatureResponse {
                    sender_id: UTILITY_ID,
                    blinded_signature,
                },
                request.sender_id,
            )
            .await
    }

    /// Folds one (possibly already-combined) aggregation message into the
    /// current query's per-body tally, ending the query once enough
    /// contributors agree on the same body (spec §4.7 "End of query"):
    /// `2t` distinct contributors for Byzantine, `t` otherwise.
    async fn on_aggregation_message(&mut self, message: AggregationMessage) -> Result<()> {
        let quorum = match self.variant {
            ProtocolVariant::Byzantine => 2 * self.t,
            _ => self.t,
        };

        let current = match &mut self.current {
            Some(current) if current.request.query_number == message.query_number => current,
            _ => {
                debug!(query_number = message.query_number, "dropping aggregation message for a query that isn't running");
                return Ok(());
            }
        };

        let entry = current
            .results_by_body
            .entry(message.body.clone())
            .or_insert((0, 0));
        entry.0 += 1;
        entry.1 = entry.1.max(message.num_contributors);

        let reached_quorum = entry.0 as u64 >= quorum;
        if reached_quorum {
            let query_number = current.request.query_number;
            self.end_query(query_number).await?;
        }
        Ok(())
    }

    async fn on_query_timeout(&mut self, query_number: u64) -> Result<()> {
        let still_running = matches!(&self.current, Some(current) if current.request.query_number == query_number);
        if !still_running {
            return Ok(());
        }
        warn!(query_number, "query timed out before reaching quorum");
        self.end_query(query_number).await
    }

    /// Finishes the in-flight query (spec §4.7 "End of query"), whether
    /// reached early via the `2t`/`t` count-based quorum in
    /// `on_aggregation_message` or by the watchdog firing with the results
    /// so far: `tally()` always runs and applies its own, stricter
    /// acceptance rule (Byzantine's `t+1`-equal-reports majority, CT/HFT's
    /// highest-`num_contributors` body). Whether the early-exit count was
    /// reached is only ever a hint to run sooner — it is never itself the
    /// success criterion, so a watchdog timeout with enough matching
    /// reports to satisfy `tally()` still reports a result instead of
    /// being forced to `None`.
    async fn end_query(&mut self, query_number: u64) -> Result<()> {
        let current = match self.current.take() {
            Some(current) if current.request.query_number == query_number => current,
            other => {
                self.current = other;
                return Ok(());
            }
        };
        self.timer.cancel(current.watchdog);

        let result = self.tally(&current);

        let (body, num_contributors) = match result {
            Some((body, contributors)) => (Some(body), contributors),
            None => (None, 0),
        };

        if let Some(tx) = &self.results_tx {
            let _ = tx.send(QueryResult {
                query_number,
                body,
                num_contributors,
            });
        }

        self.maybe_start_next().await
    }

    fn tally(&self, current: &InFlightQuery) -> Option<(Vec<crate::fixed_point::FixedPoint>, u32)> {
        match self.variant {
            ProtocolVariant::Byzantine => {
                let quorum = self.t + 1;
                current
                    .results_by_body
                    .iter()
                    .find(|(_, (reports, _))| *reports as u64 >= quorum)
                    .map(|(body, (_, contributors))| (body.clone(), *contributors))
            }
            ProtocolVariant::CrashTolerant | ProtocolVariant::HighFailureTolerant => current
                .results_by_body
                .iter()
                .max_by_key(|(_, (_, contributors))| *contributors)
                .map(|(body, (_, contributors))| (body.clone(), *contributors)),
        }
    }
}

/// Builds the one `QueryRequest` variant that needs an out-of-band price
/// table attached (spec §3), keeping `UtilityCoordinator` itself agnostic
/// to how a `ProjectedUsage` query's price function was produced.
pub fn projected_usage_query(query_number: u64, time_window_minutes: u32, price_table: &[crate::fixed_point::FixedPoint]) -> Result<QueryRequest> {
    let bytes = crate::device::price_fn_to_bytes(price_table)?;
    Ok(QueryRequest::with_price_fn(QueryType::ProjectedUsage, time_window_minutes, query_number, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::null::NullCrypto;
    use crate::fixed_point::FixedPoint;
    use crate::net::mock::{InMemoryNetwork, Switchboard};
    use crate::timer::tokio_timer::TokioTimer;

    fn coordinator(variant: ProtocolVariant, num_meters: u64, t: u64) -> (UtilityCoordinator, Arc<Switchboard>, mpsc::UnboundedReceiver<UtilityEvent>) {
        let board = Switchboard::new();
        let network: Arc<dyn Network> = Arc::new(InMemoryNetwork::new(Arc::clone(&board)));
        let crypto: Arc<dyn Crypto> = Arc::new(NullCrypto::new(UTILITY_ID));
        let timer: Arc<dyn Timer> = Arc::new(TokioTimer::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = UtilityCoordinator::new(num_meters, t, variant, network, crypto, timer, 50, tx);
        (coordinator, board, rx)
    }

    fn message(body: Vec<i64>, contributors: u32, query_number: u64) -> AggregationMessage {
        AggregationMessage {
            sender_id: 0,
            query_number,
            num_contributors: contributors,
            body: body.into_iter().map(FixedPoint::from_int).collect(),
        }
    }

    #[tokio::test]
    async fn crash_tolerant_ends_the_query_once_t_agree() {
        let (mut coordinator, _board, _rx) = coordinator(ProtocolVariant::CrashTolerant, 7, 3);
        let mut results = mpsc::unbounded_channel();
        coordinator.subscribe_results(results.0);
        coordinator
            .start_query(QueryRequest::new(QueryType::TotalConsumption, 60, 1))
            .await
            .unwrap();

        for _ in 0..3 {
            coordinator.on_aggregation_message(message(vec![600], 3, 1)).await.unwrap();
        }

        let result = results.1.recv().await.unwrap();
        assert_eq!(result.query_number, 1);
        assert_eq!(result.body, Some(vec![FixedPoint::from_int(600)]));
    }

    #[tokio::test]
    async fn byzantine_picks_the_first_body_reaching_t_plus_one_equal_reports() {
        let (mut coordinator, _board, _rx) = coordinator(ProtocolVariant::Byzantine, 7, 3);
        let mut results = mpsc::unbounded_channel();
        coordinator.subscribe_results(results.0);
        coordinator
            .start_query(QueryRequest::new(QueryType::TotalConsumption, 60, 1))
            .await
            .unwrap();

        // Below Byzantine's 2t end-of-query quorum so the query doesn't
        // auto-finish; force end_query directly. Its own t+1 tally
        // threshold is independent of (and looser than) the 2t early-exit
        // count, so it still reports the majority body.
        for _ in 0..4 {
            coordinator.on_aggregation_message(message(vec![600], 3, 1)).await.unwrap();
        }
        assert!(coordinator.current.is_some(), "4 reports is below 2t=6 for N=7");
        coordinator.end_query(1).await.unwrap();

        let result = results.1.recv().await.unwrap();
        assert_eq!(result.body, Some(vec![FixedPoint::from_int(600)]));
    }

    #[tokio::test]
    async fn a_query_with_no_majority_fails() {
        let (mut coordinator, _board, _rx) = coordinator(ProtocolVariant::Byzantine, 7, 3);
        let mut results = mpsc::unbounded_channel();
        coordinator.subscribe_results(results.0);
        coordinator
            .start_query(QueryRequest::new(QueryType::TotalConsumption, 60, 1))
            .await
            .unwrap();
        coordinator.end_query(1).await.unwrap();

        let result = results.1.recv().await.unwrap();
        assert_eq!(result.body, None);
    }

    #[tokio::test]
    async fn a_watchdog_timeout_still_reports_a_result_that_already_met_the_tally_threshold() {
        // Byzantine, N=7, t=3: t+1=4 is enough for `tally()` to pick a
        // winner even though the 2t=6 early-exit count was never reached.
        let (mut coordinator, _board, _rx) = coordinator(ProtocolVariant::Byzantine, 7, 3);
        let mut results = mpsc::unbounded_channel();
        coordinator.subscribe_results(results.0);
        coordinator
            .start_query(QueryRequest::new(QueryType::TotalConsumption, 60, 1))
            .await
            .unwrap();

        for _ in 0..4 {
            coordinator.on_aggregation_message(message(vec![600], 3, 1)).await.unwrap();
        }
        assert!(coordinator.current.is_some(), "4 reports is below 2t=6 for N=7");
        coordinator.on_query_timeout(1).await.unwrap();

        let result = results.1.recv().await.unwrap();
        assert_eq!(result.body, Some(vec![FixedPoint::from_int(600)]));
    }

    #[tokio::test]
    async fn queued_queries_start_in_query_number_order() {
        let (mut coordinator, _board, _rx) = coordinator(ProtocolVariant::CrashTolerant, 7, 3);
        coordinator
            .start_queries(vec![
                QueryRequest::new(QueryType::TotalConsumption, 60, 5),
                QueryRequest::new(QueryType::TotalConsumption, 60, 2),
            ])
            .await
            .unwrap();
        assert_eq!(coordinator.current.as_ref().unwrap().request.query_number, 2);
    }

    #[tokio::test]
    async fn a_meter_only_gets_one_signature_per_query() {
        let (mut coordinator, _board, _rx) = coordinator(ProtocolVariant::Byzantine, 7, 3);
        coordinator
            .start_query(QueryRequest::new(QueryType::TotalConsumption, 60, 1))
            .await
            .unwrap();
        assert!(coordinator.signed_this_query.insert(2));
        assert!(!coordinator.signed_this_query.insert(2));
    }
}
