//! Echo: crash-tolerant redundancy re-send. Each contribution collected
//! during Shuffle is forwarded along fresh node-disjoint paths to every
//! other proxy in its `proxies` list, so delivery survives up to `t`
//! crashed proxies (spec §4.4a).

use crate::crypto::Crypto;
use crate::error::Result;
use crate::overlay::build_proxy_onions;
use crate::overlay::round_driver::RoundHandler;
use crate::types::{MessageBody, MeterId, OverlayMessage, ValueContribution};
use std::collections::HashSet;
use tracing::warn;

/// Builds the re-send onions for every contribution in `proxy_values`,
/// one per other proxy in that contribution's own proxy list.
pub fn build_echo_onions(
    my_id: MeterId,
    num_meters: usize,
    start_round: i64,
    crypto: &dyn Crypto,
    query_number: u64,
    proxy_values: &HashSet<ValueContribution>,
) -> Result<Vec<OverlayMessage>> {
    let mut outgoing = Vec::new();
    for contribution in proxy_values {
        let others: Vec<MeterId> = contribution
            .value
            .proxies
            .iter()
            .copied()
            .filter(|p| *p != my_id)
            .collect();
        if others.is_empty() {
            continue;
        }
        let onions = build_proxy_onions(my_id, &others, num_meters, start_round, crypto, query_number, {
            let contribution = contribution.clone();
            move |_proxy| MessageBody::Value(contribution.clone())
        })?;
        outgoing.extend(onions);
    }
    Ok(outgoing)
}

/// Accumulates re-sent contributions, deduplicating by structural equality
/// exactly like `ShuffleHandler` (spec §4.4a: "duplicates suppressed").
pub struct EchoHandler {
    total_rounds: i64,
    proxy_values: HashSet<ValueContribution>,
}

impl EchoHandler {
    /// Seeded with the contributions already accumulated during Shuffle, so
    /// Echo's output is a superset of Shuffle's.
    pub fn new(total_rounds: i64, seed: HashSet<ValueContribution>) -> Self {
        Self {
            total_rounds,
            proxy_values: seed,
        }
    }

    pub fn into_proxy_values(self) -> HashSet<ValueContribution> {
        self.proxy_values
    }
}

impl RoundHandler for EchoHandler {
    fn is_active(&self) -> bool {
        true
    }

    fn handle_message(&mut self, sender_id: MeterId, body: MessageBody) -> Result<()> {
        match body {
            MessageBody::Value(v) => {
                let _ = self.proxy_values.insert(v);
                Ok(())
            }
            other => {
                warn!(sender_id, kind = other.kind_name(), "dropping non-contribution message in echo phase");
                Ok(())
            }
        }
    }

    fn total_rounds(&self) -> i64 {
        self.total_rounds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed_point::FixedPoint;
    use crate::types::ValueTuple;

    #[test]
    fn seeded_values_survive_into_the_result() {
        let mut seed = HashSet::new();
        seed.insert(ValueContribution::unsigned(ValueTuple::new(1, vec![FixedPoint::from_int(1)], vec![1, 2])));
        let handler = EchoHandler::new(5, seed.clone());
        assert_eq!(handler.into_proxy_values(), seed);
    }
}
