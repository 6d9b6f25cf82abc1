//! The gossip overlay: graph arithmetic, node-disjoint path finding, onion
//! construction, and the per-round driver built from them (spec §4.1-§4.2).

pub mod graph;
pub mod onion;
pub mod path_finder;
pub mod round_driver;

use crate::crypto::Crypto;
use crate::error::Result;
use crate::types::{MessageBody, MeterId, OverlayMessage};

/// Builds one onion-wrapped `OverlayMessage` per proxy, each along its own
/// node-disjoint path starting in round `start_round` (spec §4.3 step 1-2).
/// `payload_for` is called once per proxy so callers can address a distinct
/// `ValueContribution`/`SignedValue` per recipient (e.g. the Echo phase
/// re-sending under the recipient's own key).
pub fn build_proxy_onions<F>(
    source: MeterId,
    proxies: &[MeterId],
    num_meters: usize,
    start_round: i64,
    crypto: &dyn Crypto,
    query_number: u64,
    mut payload_for: F,
) -> Result<Vec<OverlayMessage>>
where
    F: FnMut(MeterId) -> MessageBody,
{
    let paths = path_finder::find_paths(source, proxies, num_meters, start_round)?;
    let mut onions = Vec::with_capacity(proxies.len());
    for (proxy, path) in proxies.iter().zip(paths.iter()) {
        let payload = payload_for(*proxy);
        onions.push(onion::build_encrypted_onion(path, payload, query_number, crypto)?);
    }
    Ok(onions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::null::NullCrypto;

    #[test]
    fn builds_one_onion_per_proxy_along_disjoint_paths() {
        let crypto = NullCrypto::new(0);
        let proxies = vec![10, 40, 70];
        let onions = build_proxy_onions(0, &proxies, 101, 0, &crypto, 1, |_proxy| {
            MessageBody::Bytes(b"contribution".to_vec())
        })
        .unwrap();
        assert_eq!(onions.len(), proxies.len());
        for onion in &onions {
            assert!(onion.is_encrypted);
            assert_eq!(onion.query_number, 1);
        }
    }
}
