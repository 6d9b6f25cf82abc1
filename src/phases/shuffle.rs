//! Shuffle: anonymous onion-routed delivery of each meter's contribution to
//! its proxies, for the crash-tolerant and Byzantine variants (spec §4.3).

use crate::crypto::{verify_payload, Crypto};
use crate::error::Result;
use crate::overlay::build_proxy_onions;
use crate::overlay::round_driver::RoundHandler;
use crate::types::{MessageBody, MeterId, OverlayMessage, ValueContribution, UTILITY_ID};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

/// Builds each proxy's onion for this meter's contribution (spec §4.3 step
/// 1-2). Called once, before the meter's `RoundDriver::start_query`.
pub fn build_initial_onions(
    my_id: MeterId,
    proxies: &[MeterId],
    num_meters: usize,
    crypto: &dyn Crypto,
    query_number: u64,
    contribution: ValueContribution,
) -> Result<Vec<OverlayMessage>> {
    build_proxy_onions(my_id, proxies, num_meters, 0, crypto, query_number, move |_proxy| {
        MessageBody::Value(contribution.clone())
    })
}

/// Collects `ValueContribution`s arriving from other meters' Shuffle onions.
pub struct ShuffleHandler {
    crypto: Arc<dyn Crypto>,
    verify_utility_signature: bool,
    total_rounds: i64,
    proxy_values: HashSet<ValueContribution>,
}

impl ShuffleHandler {
    /// `verify_utility_signature` is set for the Byzantine variant, which
    /// rejects contributions the utility never blind-signed; the
    /// crash-tolerant variant runs the same code path with an always-zero
    /// signature and `verify_utility_signature = false`.
    pub fn new(crypto: Arc<dyn Crypto>, verify_utility_signature: bool, total_rounds: i64) -> Self {
        Self {
            crypto,
            verify_utility_signature,
            total_rounds,
            proxy_values: HashSet::new(),
        }
    }

    /// Consumes the handler, returning every contribution accepted this
    /// phase, ready to be handed to Echo/Crusader Agreement.
    pub fn into_proxy_values(self) -> HashSet<ValueContribution> {
        self.proxy_values
    }
}

impl RoundHandler for ShuffleHandler {
    fn is_active(&self) -> bool {
        true
    }

    fn handle_message(&mut self, sender_id: MeterId, body: MessageBody) -> Result<()> {
        let contribution = match body {
            MessageBody::Value(v) => v,
            other => {
                warn!(sender_id, kind = other.kind_name(), "dropping non-contribution message in shuffle phase");
                return Ok(());
            }
        };
        if self.verify_utility_signature {
            match verify_payload(&*self.crypto, &contribution.value, &contribution.signature, UTILITY_ID) {
                Ok(true) => {}
                _ => {
                    warn!(sender_id, "dropping contribution with invalid utility signature");
                    return Ok(());
                }
            }
        }
        let _ = self.proxy_values.insert(contribution);
        Ok(())
    }

    fn total_rounds(&self) -> i64 {
        self.total_rounds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::null::NullCrypto;
    use crate::fixed_point::FixedPoint;
    use crate::types::ValueTuple;

    fn contribution() -> ValueContribution {
        ValueContribution::unsigned(ValueTuple::new(1, vec![FixedPoint::from_int(3)], vec![1, 2, 3]))
    }

    #[test]
    fn accepts_unsigned_contribution_when_not_byzantine() {
        let mut handler = ShuffleHandler::new(Arc::new(NullCrypto::new(0)), false, 10);
        handler.handle_message(1, MessageBody::Value(contribution())).unwrap();
        assert_eq!(handler.proxy_values.len(), 1);
    }

    #[test]
    fn duplicate_contribution_is_deduplicated() {
        let mut handler = ShuffleHandler::new(Arc::new(NullCrypto::new(0)), false, 10);
        handler.handle_message(1, MessageBody::Value(contribution())).unwrap();
        handler.handle_message(1, MessageBody::Value(contribution())).unwrap();
        assert_eq!(handler.proxy_values.len(), 1);
    }

    #[test]
    fn wrong_body_kind_is_dropped_without_error() {
        let mut handler = ShuffleHandler::new(Arc::new(NullCrypto::new(0)), false, 10);
        handler.handle_message(1, MessageBody::None).unwrap();
        assert!(handler.proxy_values.is_empty());
    }
}
