//! The `Crypto` capability (spec §6).
//!
//! The protocol core only ever talks to this trait; the physical RSA
//! implementation (`rsa_crypto`) and the no-op implementation used by the
//! crash-tolerant / high-failure-tolerant variants (`null`) are both
//! "external" in the sense of spec §1 ("Cryptographic primitive
//! implementations ... the core sees a `Crypto` capability").

pub mod keys;
pub mod null;
pub mod rsa_crypto;

use crate::error::Result;
use crate::types::{MeterId, OverlayMessage, Signature};
use serde::Serialize;

/// Cryptographic operations needed by the meter and utility protocol
/// state machines (spec §6).
pub trait Crypto: Send + Sync {
    /// This identity's own id, used to select the right key pair when a
    /// single process hosts more than one meter (`VirtualIdentity`).
    fn my_id(&self) -> MeterId;

    /// Encrypts `msg`'s body for `recipient`, setting `is_encrypted`.
    /// Used by the onion builder to wrap each successive layer.
    fn rsa_encrypt_message(&self, msg: OverlayMessage, recipient: MeterId) -> Result<OverlayMessage>;

    /// Decrypts `msg`'s body with this identity's private key, clearing
    /// `is_encrypted`. The caller is expected to already be the intended
    /// recipient (the overlay round driver never calls this on a message
    /// addressed elsewhere).
    fn rsa_decrypt_message(&self, msg: OverlayMessage) -> Result<OverlayMessage>;

    /// Signs an arbitrary byte string with this identity's private key.
    fn rsa_sign_bytes(&self, payload: &[u8]) -> Result<Signature>;

    /// Verifies `signature` over `payload` against `signer_id`'s known
    /// public key.
    fn rsa_verify_bytes(&self, payload: &[u8], signature: &Signature, signer_id: MeterId) -> Result<bool>;

    /// Blinds `value` for submission to the utility's blind-signing
    /// endpoint (Byzantine variant only), returning the opaque blob to
    /// send in a `SignatureRequest`. Remembers the blinding factor used,
    /// to be consumed by the next `rsa_unblind` call.
    fn rsa_blind(&self, value_bytes: &[u8]) -> Result<Vec<u8>>;

    /// The utility's side of blind signing: signs an already-blinded blob
    /// without ever seeing the unblinded value.
    fn rsa_sign_blinded(&self, blinded: &[u8]) -> Result<Vec<u8>>;

    /// Unblinds a blind signature returned by the utility, using the
    /// blinding factor recorded by the most recent `rsa_blind` call.
    fn rsa_unblind(&self, blinded_signature: &[u8]) -> Result<Signature>;
}

/// Serializes `payload` with the same codec used for the wire format, then
/// signs the resulting bytes. A free function (rather than a generic trait
/// method) so `Crypto` stays object-safe.
pub fn sign_payload<T: Serialize>(crypto: &dyn Crypto, payload: &T) -> Result<Signature> {
    let bytes = rmp_serde::to_vec(payload)
        .map_err(|e| crate::error::Error::Serialisation(e.to_string()))?;
    crypto.rsa_sign_bytes(&bytes)
}

/// Serializes `payload` identically to `sign_payload` and verifies
/// `signature` over the result.
pub fn verify_payload<T: Serialize>(
    crypto: &dyn Crypto,
    payload: &T,
    signature: &Signature,
    signer_id: MeterId,
) -> Result<bool> {
    let bytes = rmp_serde::to_vec(payload)
        .map_err(|e| crate::error::Error::Serialisation(e.to_string()))?;
    crypto.rsa_verify_bytes(&bytes, signature, signer_id)
}
