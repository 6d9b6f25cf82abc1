use crate::fixed_point::FixedPoint;
use crate::types::MeterId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Length, in bytes, of an RSA-2048 signature (spec §6).
pub const SIGNATURE_LEN: usize = 256;

/// A fixed-length RSA-2048 signature, or an all-zero placeholder in variants
/// that don't sign contributions (spec §3: "in other variants it is an
/// array of zeros").
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "serde_bytes")] pub Vec<u8>);

impl Signature {
    /// An all-zero signature of the expected length, used where no real
    /// signature is produced (crash-tolerant / high-failure-tolerant
    /// variants).
    pub fn zero() -> Self {
        Self(vec![0u8; SIGNATURE_LEN])
    }

    /// Wraps a byte vector as a signature, without checking its length.
    /// Crypto implementations are expected to always produce `SIGNATURE_LEN`
    /// bytes; malformed signatures simply fail verification.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Returns the raw signature bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// True if every byte is zero, i.e. this is the crash-tolerant /
    /// high-failure-tolerant placeholder.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            write!(f, "Signature(zero, {} bytes)", self.0.len())
        } else {
            write!(
                f,
                "Signature({:02x}{:02x}.. {} bytes)",
                self.0.get(0).copied().unwrap_or(0),
                self.0.get(1).copied().unwrap_or(0),
                self.0.len()
            )
        }
    }
}

/// One meter's contribution: a set of measurements, plus the list of proxy
/// meters it has been routed to during Shuffle (spec §3).
///
/// Equality is structural: two meters reporting identical measurements are
/// still distinct `ValueTuple`s if they were assigned different proxy sets
/// (which is the common case, since proxies are chosen per-meter).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueTuple {
    /// The query this contribution belongs to.
    pub query_number: u64,
    /// The reported measurements, in query-defined order.
    pub measurements: Vec<FixedPoint>,
    /// The meters this contribution's owner selected as proxies for this
    /// query (spec §4.5 `pick_proxies`).
    pub proxies: Vec<MeterId>,
}

impl ValueTuple {
    /// Constructs a new contribution.
    pub fn new(query_number: u64, measurements: Vec<FixedPoint>, proxies: Vec<MeterId>) -> Self {
        Self {
            query_number,
            measurements,
            proxies,
        }
    }
}

/// A `ValueTuple` plus the utility's blind signature over it (Byzantine
/// variant), or an all-zero placeholder signature otherwise (spec §3).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueContribution {
    /// The contributed tuple.
    pub value: ValueTuple,
    /// The utility's blind signature over `value`, or `Signature::zero()`.
    pub signature: Signature,
}

impl ValueContribution {
    /// Constructs a new contribution with the given signature.
    pub fn new(value: ValueTuple, signature: Signature) -> Self {
        Self { value, signature }
    }

    /// Constructs a new contribution with an all-zero placeholder
    /// signature, for the crash-tolerant / high-failure-tolerant variants.
    pub fn unsigned(value: ValueTuple) -> Self {
        Self {
            value,
            signature: Signature::zero(),
        }
    }
}

/// A `ValueContribution` plus the set of per-meter signatures collected
/// during phase 1 of Crusader Agreement (spec §3, §4.4b).
///
/// `value` is reference-counted because the same contribution is looked up
/// by structural equality from many places (the `signed_proxy_values` map
/// key and its stored value both reference it); spec §9 calls out this
/// sharing requirement explicitly.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignedValue {
    /// The value being vouched for.
    pub value: Arc<ValueContribution>,
    /// Accumulated per-signer signatures over `value`.
    pub signatures: BTreeMap<MeterId, Signature>,
}

impl SignedValue {
    /// Constructs a `SignedValue` carrying a single signer's signature.
    pub fn new(value: Arc<ValueContribution>, signer: MeterId, signature: Signature) -> Self {
        let mut signatures = BTreeMap::new();
        let _ = signatures.insert(signer, signature);
        Self { value, signatures }
    }

    /// Merges `other`'s signatures into this one. Used both when a phase-1
    /// message repeats a value already seen, and when a phase-2
    /// `AgreementValue`'s signature set is merged in.
    pub fn merge_signatures(&mut self, other: &BTreeMap<MeterId, Signature>) {
        for (signer, sig) in other {
            let _ = self.signatures.entry(*signer).or_insert_with(|| sig.clone());
        }
    }
}

/// A `SignedValue` vouched for by an "accepter" proxy during phase 2 of
/// Crusader Agreement (spec §3, §4.4b).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgreementValue {
    /// The signed value being propagated.
    pub signed_value: SignedValue,
    /// The proxy vouching for it.
    pub accepter_id: MeterId,
    /// That proxy's signature over `signed_value`.
    pub accepter_signature: Signature,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_proxy_sets_make_distinct_tuples() {
        let a = ValueTuple::new(0, vec![FixedPoint::from_int(1)], vec![1, 2]);
        let b = ValueTuple::new(0, vec![FixedPoint::from_int(1)], vec![3, 4]);
        assert_ne!(a, b);
    }

    #[test]
    fn zero_signature_is_recognized() {
        assert!(Signature::zero().is_zero());
        assert!(!Signature::from_bytes(vec![1u8; SIGNATURE_LEN]).is_zero());
    }
}
