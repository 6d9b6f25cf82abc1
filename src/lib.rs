//! Privacy-preserving distributed smart-meter data aggregation (spec §1).
//!
//! Meters `0..N` (`N` prime) periodically answer utility queries by
//! contributing a measurement without revealing which meter produced it:
//! onion-routed shuffling (or flood-based scattering) disperses each
//! contribution to a handful of proxies, an optional Byzantine agreement
//! phase filters out dishonest proxies, and a balanced binary tree per
//! aggregation group folds surviving contributions into one pointwise-summed
//! answer for the utility.
//!
//! Grounded in `original_source/` (the `ProtocolState`/`MeterClient`/
//! `UtilityClient`/`CrusaderAgreementState`/`TreeAggregationState` C++
//! sources) and in the `fakelionel-safe_network` teacher crate's ambient
//! stack and idiom (see `DESIGN.md` for the per-module grounding ledger).

pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod fixed_point;
pub mod meter;
pub mod net;
pub mod overlay;
pub mod phases;
pub mod timer;
pub mod types;
pub mod utility;

pub use error::{Error, Result};
