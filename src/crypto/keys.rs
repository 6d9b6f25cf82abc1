//! DER key-file and peer-address loading for the `meter`/`coordinator`
//! binaries (spec §6: "DER-encoded RSA keys; file name pattern
//! `pubkey_<id>.der` / `privkey_<id>.der`", and the whitespace-separated
//! meter-id/address map file).
//!
//! Not needed by the crash-tolerant/high-failure-tolerant variants (they
//! run `crypto::null::NullCrypto` instead), so every function here is only
//! called from the Byzantine startup path.

use crate::error::{Error, Result};
use crate::types::MeterId;
use rsa::pkcs1::{FromRsaPrivateKey, FromRsaPublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

/// Loads `<folder>/privkey_<id>.der` as a PKCS#1 DER-encoded RSA private key.
pub fn load_private_key(folder: &Path, id: MeterId) -> Result<RsaPrivateKey> {
    let path = folder.join(format!("privkey_{}.der", id));
    let bytes = std::fs::read(&path)
        .map_err(|e| Error::Configuration(format!("reading private key {}: {}", path.display(), e)))?;
    RsaPrivateKey::from_pkcs1_der(&bytes)
        .map_err(|e| Error::Configuration(format!("parsing private key {}: {}", path.display(), e)))
}

/// Loads `<folder>/pubkey_<id>.der` as a PKCS#1 DER-encoded RSA public key.
pub fn load_public_key(folder: &Path, id: MeterId) -> Result<RsaPublicKey> {
    let path = folder.join(format!("pubkey_{}.der", id));
    let bytes = std::fs::read(&path)
        .map_err(|e| Error::Configuration(format!("reading public key {}: {}", path.display(), e)))?;
    RsaPublicKey::from_pkcs1_der(&bytes)
        .map_err(|e| Error::Configuration(format!("parsing public key {}: {}", path.display(), e)))
}

/// Loads every other participant's public key out of `folder`, one
/// `pubkey_<id>.der` per id in `ids` (spec §6's public-key-folder CLI
/// argument), keyed by id for `RsaCrypto::new`.
pub fn load_public_keys(folder: &Path, ids: impl IntoIterator<Item = MeterId>) -> Result<HashMap<MeterId, RsaPublicKey>> {
    ids.into_iter().map(|id| Ok((id, load_public_key(folder, id)?))).collect()
}

/// Parses an ip-map file: one `<meter-id> <ip>:<port>` record per line,
/// whitespace-separated (spec §6).
pub fn load_peer_addresses(path: &Path) -> Result<HashMap<MeterId, SocketAddr>> {
    let contents =
        std::fs::read_to_string(path).map_err(|e| Error::Configuration(format!("reading peer map {}: {}", path.display(), e)))?;
    let mut addresses = HashMap::new();
    for (line_number, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let id_str = parts
            .next()
            .ok_or_else(|| Error::Configuration(format!("peer map line {}: missing meter id", line_number + 1)))?;
        let addr_str = parts
            .next()
            .ok_or_else(|| Error::Configuration(format!("peer map line {}: missing address", line_number + 1)))?;
        let id: MeterId = id_str
            .parse()
            .map_err(|_| Error::Configuration(format!("peer map line {}: invalid meter id {}", line_number + 1, id_str)))?;
        let addr: SocketAddr = addr_str
            .parse()
            .map_err(|_| Error::Configuration(format!("peer map line {}: invalid address {}", line_number + 1, addr_str)))?;
        addresses.insert(id, addr);
    }
    Ok(addresses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_whitespace_separated_peer_map() {
        let path = tempfile_with_contents("peers_ok", "0 127.0.0.1:9000\n1\t127.0.0.1:9001\n\n2 127.0.0.1:9002\n");
        let addresses = load_peer_addresses(&path).unwrap();
        assert_eq!(addresses.len(), 3);
        assert_eq!(addresses[&1], "127.0.0.1:9001".parse().unwrap());
    }

    #[test]
    fn rejects_a_malformed_line() {
        let path = tempfile_with_contents("peers_bad", "not-a-number 127.0.0.1:9000\n");
        assert!(load_peer_addresses(&path).is_err());
    }

    fn tempfile_with_contents(label: &str, contents: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("meter_aggregation_test_{}_{}_{}.txt", label, std::process::id(), contents.len()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }
}
