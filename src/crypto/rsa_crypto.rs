//! RSA-2048-backed `Crypto` implementation (Byzantine variant), including
//! the Chaum blind-signature sub-protocol.
//!
//! Grounded in `original_source/src/util/CryptoPPLibrary.h`'s surface
//! (`rsa_encrypt`/`rsa_decrypt`/`rsa_sign`/`rsa_verify`/`rsa_blind`/
//! `rsa_sign_blinded`/`rsa_unblind_signature`, including its single
//! outstanding `last_blind_inverse` field), reimplemented against the
//! `rsa` crate since Crypto++ itself isn't available as a Rust crate.

use crate::crypto::Crypto;
use crate::error::{Error, Result};
use crate::types::{MessageBody, MeterId, OverlayMessage, Signature, SIGNATURE_LEN};
use num_bigint_dig::{BigUint, ModInverse, RandBigInt};
use rand::rngs::OsRng;
use rsa::{Hash, PaddingScheme, PublicKey, PublicKeyParts, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;

fn signing_padding() -> PaddingScheme {
    PaddingScheme::new_pkcs1v15_sign(Some(Hash::SHA2_256))
}

fn encrypting_padding() -> PaddingScheme {
    PaddingScheme::new_pkcs1v15_encrypt()
}

fn digest(payload: &[u8]) -> Vec<u8> {
    Sha256::digest(payload).to_vec()
}

/// Real RSA-2048 cryptography for one meter or the utility.
///
/// `utility_id` names which entry of `public_keys` is consulted for the
/// blind-signature sub-protocol (only the utility signs blinded values);
/// for the utility's own instance, `private_key` doubles as the signing
/// key used in `rsa_sign_blinded`.
pub struct RsaCrypto {
    id: MeterId,
    private_key: RsaPrivateKey,
    public_keys: HashMap<MeterId, RsaPublicKey>,
    utility_id: MeterId,
    pending_blind_factor: Mutex<Option<BigUint>>,
}

impl RsaCrypto {
    /// Constructs an `RsaCrypto` for identity `id`, with `private_key` as
    /// its own key and `public_keys` containing every other participant's
    /// public key (including the utility's, under `utility_id`).
    pub fn new(
        id: MeterId,
        private_key: RsaPrivateKey,
        public_keys: HashMap<MeterId, RsaPublicKey>,
        utility_id: MeterId,
    ) -> Self {
        Self {
            id,
            private_key,
            public_keys,
            utility_id,
            pending_blind_factor: Mutex::new(None),
        }
    }

    fn public_key_for(&self, signer_id: MeterId) -> Result<&RsaPublicKey> {
        self.public_keys
            .get(&signer_id)
            .ok_or_else(|| Error::Crypto(format!("no public key known for meter {}", signer_id)))
    }

    fn utility_public_key(&self) -> Result<&RsaPublicKey> {
        self.public_key_for(self.utility_id)
    }
}

impl Crypto for RsaCrypto {
    fn my_id(&self) -> MeterId {
        self.id
    }

    fn rsa_encrypt_message(&self, mut msg: OverlayMessage, recipient: MeterId) -> Result<OverlayMessage> {
        let plaintext = rmp_serde::to_vec(&msg.body).map_err(|e| Error::Serialisation(e.to_string()))?;
        let public_key = self.public_key_for(recipient)?;
        let mut rng = OsRng;
        let ciphertext = public_key
            .encrypt(&mut rng, encrypting_padding(), &plaintext[..])
            .map_err(|e| Error::Crypto(format!("RSA encrypt failed: {}", e)))?;
        msg.body = Box::new(MessageBody::Bytes(ciphertext));
        msg.is_encrypted = true;
        Ok(msg)
    }

    fn rsa_decrypt_message(&self, mut msg: OverlayMessage) -> Result<OverlayMessage> {
        if !msg.is_encrypted {
            return Ok(msg);
        }
        let ciphertext = match msg.body.as_ref() {
            MessageBody::Bytes(bytes) => bytes.clone(),
            other => return Err(Error::InvalidMessageBody(other.kind_name())),
        };
        let plaintext = self
            .private_key
            .decrypt(encrypting_padding(), &ciphertext)
            .map_err(|e| Error::Crypto(format!("RSA decrypt failed: {}", e)))?;
        let body: MessageBody =
            rmp_serde::from_slice(&plaintext).map_err(|e| Error::Serialisation(e.to_string()))?;
        msg.body = Box::new(body);
        msg.is_encrypted = false;
        Ok(msg)
    }

    fn rsa_sign_bytes(&self, payload: &[u8]) -> Result<Signature> {
        let hashed = digest(payload);
        let sig = self
            .private_key
            .sign(signing_padding(), &hashed)
            .map_err(|e| Error::Crypto(format!("RSA sign failed: {}", e)))?;
        Ok(Signature::from_bytes(sig))
    }

    fn rsa_verify_bytes(&self, payload: &[u8], signature: &Signature, signer_id: MeterId) -> Result<bool> {
        let public_key = self.public_key_for(signer_id)?;
        let hashed = digest(payload);
        Ok(public_key
            .verify(signing_padding(), &hashed, signature.as_bytes())
            .is_ok())
    }

    fn rsa_blind(&self, value_bytes: &[u8]) -> Result<Vec<u8>> {
        let utility_key = self.utility_public_key()?;
        let n = utility_key.n();
        let e = utility_key.e();

        // Full-domain-hash the value down to a representative in Z_n,
        // since an arbitrary-length ValueTuple won't otherwise fit the
        // modulus (a textbook simplification of Chaum blinding, acceptable
        // for this protocol's purposes).
        let m = BigUint::from_bytes_be(&digest(value_bytes)) % n;

        let mut rng = OsRng;
        let r = loop {
            let candidate = rng.gen_biguint_below(n);
            if candidate > BigUint::from(1u32) {
                break candidate;
            }
        };
        let r_inv = r
            .clone()
            .mod_inverse(n)
            .and_then(|v| v.to_biguint())
            .ok_or_else(|| Error::Crypto("blinding factor not invertible mod n".to_string()))?;
        *self.pending_blind_factor.lock().expect("blind factor mutex poisoned") = Some(r_inv);

        let blinded = (m * r.modpow(e, n)) % n;
        Ok(blinded.to_bytes_be())
    }

    fn rsa_sign_blinded(&self, blinded: &[u8]) -> Result<Vec<u8>> {
        // Only meaningful when called on the utility's own RsaCrypto, whose
        // private_key is the utility's signing key.
        let n = self.private_key.n();
        let d = self
            .private_key
            .d();
        let blinded_int = BigUint::from_bytes_be(blinded) % n;
        let signed = blinded_int.modpow(d, n);
        Ok(signed.to_bytes_be())
    }

    fn rsa_unblind(&self, blinded_signature: &[u8]) -> Result<Signature> {
        let utility_key = self.utility_public_key()?;
        let n = utility_key.n();
        let r_inv = self
            .pending_blind_factor
            .lock()
            .expect("blind factor mutex poisoned")
            .take()
            .ok_or_else(|| Error::Crypto("rsa_unblind called without a pending rsa_blind".to_string()))?;
        let s_prime = BigUint::from_bytes_be(blinded_signature) % n;
        let s = (s_prime * r_inv) % n;
        let mut bytes = s.to_bytes_be();
        if bytes.len() < SIGNATURE_LEN {
            let mut padded = vec![0u8; SIGNATURE_LEN - bytes.len()];
            padded.append(&mut bytes);
            bytes = padded;
        }
        Ok(Signature::from_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng as RandOsRng;
    use rsa::RsaPrivateKey;

    fn make_keypair(bits: usize) -> (RsaPrivateKey, RsaPublicKey) {
        let mut rng = RandOsRng;
        let private_key = RsaPrivateKey::new(&mut rng, bits).expect("key generation failed");
        let public_key = private_key.to_public_key();
        (private_key, public_key)
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let (sk, pk) = make_keypair(1024);
        let mut keys = HashMap::new();
        keys.insert(0, pk);
        let crypto = RsaCrypto::new(0, sk, keys, -1);

        let payload = b"a value contribution";
        let sig = crypto.rsa_sign_bytes(payload).unwrap();
        assert!(crypto.rsa_verify_bytes(payload, &sig, 0).unwrap());
        assert!(!crypto
            .rsa_verify_bytes(b"a different payload", &sig, 0)
            .unwrap());
    }

    #[test]
    fn blind_sign_unblind_matches_direct_signature() {
        let (utility_sk, utility_pk) = make_keypair(1024);

        let mut meter_keys = HashMap::new();
        meter_keys.insert(-1, utility_pk.clone());
        let (meter_sk, _meter_pk) = make_keypair(1024);
        let meter_crypto = RsaCrypto::new(0, meter_sk, meter_keys, -1);

        let mut utility_keys = HashMap::new();
        utility_keys.insert(-1, utility_pk);
        let utility_crypto = RsaCrypto::new(-1, utility_sk, utility_keys, -1);

        let value_bytes = b"value-tuple-bytes";
        let blinded = meter_crypto.rsa_blind(value_bytes).unwrap();
        let blind_signed = utility_crypto.rsa_sign_blinded(&blinded).unwrap();
        let unblinded = meter_crypto.rsa_unblind(&blind_signed).unwrap();

        // The unblinded signature should match a direct RSA signature of
        // the same full-domain-hash representative computed by the utility.
        let n = utility_crypto.private_key.n();
        let m = BigUint::from_bytes_be(&digest(value_bytes)) % n;
        let direct = m.modpow(utility_crypto.private_key.d(), n).to_bytes_be();
        assert_eq!(unblinded.as_bytes()[SIGNATURE_LEN - direct.len()..], direct[..]);
    }
}
