use crate::types::MeterId;
use serde::{Deserialize, Serialize};

/// A meter's request that the utility blind-sign an opaque blob (the
/// blinded `ValueTuple`), used only in the Byzantine variant (spec §3, §6).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignatureRequest {
    /// The requesting meter.
    pub sender_id: MeterId,
    /// The blinded value to be signed.
    #[serde(with = "serde_bytes")]
    pub blinded_value: Vec<u8>,
}

/// The utility's reply to a `SignatureRequest`: the blinded signature,
/// still to be unblinded by the requester.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignatureResponse {
    /// Always the utility's id.
    pub sender_id: MeterId,
    /// The blind-signed blob.
    #[serde(with = "serde_bytes")]
    pub blinded_signature: Vec<u8>,
}
