//! Crusader Agreement: two rounds-driven phases of Byzantine agreement
//! among the proxies of each aggregation group (spec §4.4b), grounded in
//! `original_source/src/CrusaderAgreementState.cpp`.
//!
//! The two phases run as two independent `RoundDriver` passes orchestrated
//! by the meter actor rather than as one `RoundHandler` spanning both —
//! each phase has its own message shape (`SignedValue` vs `AgreementValue`)
//! and its own round budget, so giving each its own handler keeps the
//! per-phase logic as simple as Shuffle/Echo's.

use crate::crypto::{sign_payload, verify_payload, Crypto};
use crate::error::Result;
use crate::overlay::build_proxy_onions;
use crate::overlay::round_driver::RoundHandler;
use crate::types::{AgreementValue, MessageBody, MeterId, OverlayMessage, SignedValue, ValueContribution, UTILITY_ID};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

/// Phase 1: meters exchange `SignedValue`s (a contribution plus the set of
/// proxies who have vouched for it so far) and accumulate signatures.
pub struct AgreementPhase1Handler {
    crypto: Arc<dyn Crypto>,
    total_rounds: i64,
    signed_proxy_values: HashMap<ValueContribution, SignedValue>,
}

impl AgreementPhase1Handler {
    /// `seed` is this meter's own freshly-signed `SignedValue` for every
    /// contribution it held in `proxy_values` after Shuffle — the starting
    /// state the original sends out before the first round (spec §4.3 step 4).
    pub fn new(crypto: Arc<dyn Crypto>, total_rounds: i64, seed: HashMap<ValueContribution, SignedValue>) -> Self {
        Self {
            crypto,
            total_rounds,
            signed_proxy_values: seed,
        }
    }

    pub fn into_signed_proxy_values(self) -> HashMap<ValueContribution, SignedValue> {
        self.signed_proxy_values
    }
}

impl RoundHandler for AgreementPhase1Handler {
    fn is_active(&self) -> bool {
        true
    }

    fn handle_message(&mut self, sender_id: MeterId, body: MessageBody) -> Result<()> {
        let sv = match body {
            MessageBody::Signed(sv) => sv,
            other => {
                warn!(sender_id, kind = other.kind_name(), "dropping non-signed-value message in agreement phase 1");
                return Ok(());
            }
        };
        match verify_payload(&*self.crypto, &sv.value.value, &sv.value.signature, UTILITY_ID) {
            Ok(true) => {}
            _ => {
                warn!(sender_id, "dropping signed value with invalid utility signature");
                return Ok(());
            }
        }
        let key = (*sv.value).clone();
        self.signed_proxy_values
            .entry(key)
            .and_modify(|existing| existing.merge_signatures(&sv.signatures))
            .or_insert(sv);
        Ok(())
    }

    fn total_rounds(&self) -> i64 {
        self.total_rounds
    }
}

/// Builds each qualifying `SignedValue`'s phase-2 `AgreementValue` and
/// routes it to the value's other proxies (spec §4.4b "End of Phase 1").
pub fn build_phase_two_outgoing(
    my_id: MeterId,
    crypto: &dyn Crypto,
    num_meters: usize,
    start_round: i64,
    query_number: u64,
    signed_proxy_values: &HashMap<ValueContribution, SignedValue>,
    signature_quorum: usize,
) -> Result<Vec<OverlayMessage>> {
    let mut outgoing = Vec::new();
    for signed in signed_proxy_values.values() {
        if signed.signatures.len() < signature_quorum {
            continue;
        }
        let accepter_signature = sign_payload(crypto, signed)?;
        let agreement_value = AgreementValue {
            signed_value: signed.clone(),
            accepter_id: my_id,
            accepter_signature,
        };
        let others: Vec<MeterId> = signed.value.value.proxies.iter().copied().filter(|p| *p != my_id).collect();
        if others.is_empty() {
            continue;
        }
        let onions = build_proxy_onions(my_id, &others, num_meters, start_round, crypto, query_number, {
            let agreement_value = agreement_value.clone();
            move |_proxy| MessageBody::Agreement(agreement_value.clone())
        })?;
        outgoing.extend(onions);
    }
    Ok(outgoing)
}

/// Phase 2: meters exchange `AgreementValue`s (a `SignedValue` vouched for
/// by one accepter) and merge the ones with enough surviving signatures.
pub struct AgreementPhase2Handler {
    crypto: Arc<dyn Crypto>,
    total_rounds: i64,
    peer_signature_quorum: usize,
    signed_proxy_values: HashMap<ValueContribution, SignedValue>,
}

impl AgreementPhase2Handler {
    pub fn new(
        crypto: Arc<dyn Crypto>,
        total_rounds: i64,
        peer_signature_quorum: usize,
        seed: HashMap<ValueContribution, SignedValue>,
    ) -> Self {
        Self {
            crypto,
            total_rounds,
            peer_signature_quorum,
            signed_proxy_values: seed,
        }
    }

    /// Spec §4.4b "End of Phase 2": values whose final signature set has
    /// reached `log2N + 1` are accepted.
    pub fn accepted_values(self, acceptance_quorum: usize) -> HashSet<ValueContribution> {
        self.signed_proxy_values
            .into_iter()
            .filter(|(_, sv)| sv.signatures.len() >= acceptance_quorum)
            .map(|(value, _)| value)
            .collect()
    }
}

impl RoundHandler for AgreementPhase2Handler {
    fn is_active(&self) -> bool {
        true
    }

    fn handle_message(&mut self, sender_id: MeterId, body: MessageBody) -> Result<()> {
        let av = match body {
            MessageBody::Agreement(av) => av,
            other => {
                warn!(sender_id, kind = other.kind_name(), "dropping non-agreement-value message in agreement phase 2");
                return Ok(());
            }
        };
        match verify_payload(&*self.crypto, &av.signed_value, &av.accepter_signature, av.accepter_id) {
            Ok(true) => {}
            _ => {
                warn!(sender_id, "dropping agreement value with invalid accepter signature");
                return Ok(());
            }
        }
        let valid_signatures: std::collections::BTreeMap<_, _> = av
            .signed_value
            .signatures
            .iter()
            .filter(|(signer, _)| **signer != av.accepter_id)
            .filter(|(signer, sig)| {
                verify_payload(&*self.crypto, &av.signed_value.value.value, sig, **signer).unwrap_or(false)
            })
            .map(|(signer, sig)| (*signer, sig.clone()))
            .collect();
        if valid_signatures.len() < self.peer_signature_quorum {
            warn!(sender_id, "dropping agreement value below peer signature quorum");
            return Ok(());
        }
        let key = (*av.signed_value.value).clone();
        let mut cleaned = av.signed_value;
        cleaned.signatures = valid_signatures;
        self.signed_proxy_values
            .entry(key)
            .and_modify(|existing| existing.merge_signatures(&cleaned.signatures))
            .or_insert(cleaned);
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
    use crate::types::{Signature, ValueTuple};

    fn contribution() -> ValueContribution {
        ValueContribution::unsigned(ValueTuple::new(1, vec![FixedPoint::from_int(2)], vec![1, 2, 3]))
    }

    #[test]
    fn phase_one_merges_signatures_for_the_same_value() {
        let crypto: Arc<dyn Crypto> = Arc::new(NullCrypto::new(0));
        let mut handler = AgreementPhase1Handler::new(Arc::clone(&crypto), 10, HashMap::new());
        let value = Arc::new(contribution());
        let sv1 = SignedValue::new(Arc::clone(&value), 1, Signature::zero());
        let sv2 = SignedValue::new(Arc::clone(&value), 2, Signature::zero());
        handler.handle_message(1, MessageBody::Signed(sv1)).unwrap();
        handler.handle_message(2, MessageBody::Signed(sv2)).unwrap();
        let merged = handler.into_signed_proxy_values();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.values().next().unwrap().signatures.len(), 2);
    }

    #[test]
    fn phase_two_accepts_values_reaching_quorum() {
        let mut signed_proxy_values = HashMap::new();
        let value = Arc::new(contribution());
        let mut sv = SignedValue::new(Arc::clone(&value), 1, Signature::zero());
        sv.merge_signatures(&std::collections::BTreeMap::from([(2, Signature::zero()), (3, Signature::zero())]));
        signed_proxy_values.insert((*value).clone(), sv);
        let handler = AgreementPhase2Handler::new(Arc::new(NullCrypto::new(0)), 10, 1, signed_proxy_values);
        let accepted = handler.accepted_values(2);
        assert_eq!(accepted.len(), 1);
    }
}
