//! Onion construction over a node-disjoint path (spec §4.2).
//!
//! Ported from `original_source/src/messaging/OnionBuilder.cpp`: build the
//! innermost layer first (addressed to the final hop), then wrap it in
//! successively outer layers addressed to each preceding hop, encrypting
//! each layer for its own addressee.

use crate::crypto::Crypto;
use crate::error::Result;
use crate::types::{MessageBody, MeterId, OverlayMessage};

/// Wraps `payload` in nested single-hop encryptions along `path`, such that
/// repeated decryption by `path[0], path[1], ..., path[n-1]` in turn yields
/// `payload` addressed to `path[n-1]`. The outermost layer (what the source
/// sends) is addressed to `path[0]`.
pub fn build_encrypted_onion(
    path: &[MeterId],
    payload: MessageBody,
    query_number: u64,
    crypto: &dyn Crypto,
) -> Result<OverlayMessage> {
    assert!(!path.is_empty(), "onion path must have at least one hop");

    let last = *path.last().unwrap();
    let mut current = crypto.rsa_encrypt_message(
        OverlayMessage::new(query_number, last, payload).encrypted(),
        last,
    )?;

    for &hop in path[..path.len() - 1].iter().rev() {
        let wrapped = OverlayMessage::new(query_number, hop, MessageBody::Overlay(Box::new(current))).encrypted();
        current = crypto.rsa_encrypt_message(wrapped, hop)?;
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::null::NullCrypto;

    #[test]
    fn peeling_every_layer_yields_the_payload_at_the_final_hop() {
        let crypto = NullCrypto::default();
        let path = vec![1, 2, 3];
        let payload = MessageBody::Bytes(b"hello".to_vec());
        let mut onion = build_encrypted_onion(&path, payload.clone(), 7, &crypto).unwrap();

        for &hop in &path {
            assert_eq!(onion.destination, hop);
            assert!(onion.is_encrypted);
            onion = crypto.rsa_decrypt_message(onion).unwrap();
            match *onion.body {
                MessageBody::Overlay(inner) => onion = *inner,
                MessageBody::Bytes(_) => {
                    assert_eq!(hop, *path.last().unwrap());
                    assert_eq!(*onion.body, payload);
                    return;
                }
                _ => panic!("unexpected body at hop {}", hop),
            }
        }
        panic!("never reached the payload");
    }
}
