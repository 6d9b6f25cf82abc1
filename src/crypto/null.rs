//! A no-op `Crypto` implementation for the crash-tolerant and
//! high-failure-tolerant variants, which never sign or encrypt anything
//! (spec §3: signatures are "an array of zeros" outside the Byzantine
//! variant). Onion messages are still marked `is_encrypted` so the round
//! driver's decrypt-then-unwrap logic runs unchanged; "decryption" here is
//! the identity function.

use crate::crypto::Crypto;
use crate::error::Result;
use crate::types::{MeterId, OverlayMessage, Signature};

/// A `Crypto` capability that performs no real cryptography: encryption and
/// decryption are identity operations, signatures are always the all-zero
/// placeholder, and verification always succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCrypto {
    id: MeterId,
}

impl NullCrypto {
    /// Constructs a `NullCrypto` for the given identity.
    pub fn new(id: MeterId) -> Self {
        Self { id }
    }
}

impl Crypto for NullCrypto {
    fn my_id(&self) -> MeterId {
        self.id
    }

    fn rsa_encrypt_message(&self, mut msg: OverlayMessage, _recipient: MeterId) -> Result<OverlayMessage> {
        msg.is_encrypted = true;
        Ok(msg)
    }

    fn rsa_decrypt_message(&self, mut msg: OverlayMessage) -> Result<OverlayMessage> {
        msg.is_encrypted = false;
        Ok(msg)
    }

    fn rsa_sign_bytes(&self, _payload: &[u8]) -> Result<Signature> {
        Ok(Signature::zero())
    }

    fn rsa_verify_bytes(&self, _payload: &[u8], _signature: &Signature, _signer_id: MeterId) -> Result<bool> {
        Ok(true)
    }

    fn rsa_blind(&self, value_bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(value_bytes.to_vec())
    }

    fn rsa_sign_blinded(&self, blinded: &[u8]) -> Result<Vec<u8>> {
        Ok(blinded.to_vec())
    }

    fn rsa_unblind(&self, _blinded_signature: &[u8]) -> Result<Signature> {
        Ok(Signature::zero())
    }
}
