//! Crate-wide error type.
//!
//! Modeled on `src/types/errors.rs` in the teacher crate: a single
//! `thiserror`-derived enum with a specialised `Result` alias, rather than a
//! collection of ad-hoc error structs per module.

use crate::types::MeterId;
use std::result;
use thiserror::Error;

/// A specialised `Result` type for this crate.
pub type Result<T> = result::Result<T, Error>;

/// Errors surfaced by the protocol core.
///
/// Most variants correspond directly to the error kinds in spec §7; see the
/// doc comment on each variant for the handling policy, since the policy
/// varies (some are locally dropped, some are fatal at startup).
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// The network reported that a peer could not be reached. The caller
    /// should add the peer to `failed_meter_ids` and continue; this is
    /// never fatal to the query.
    #[error("meter {0} is unreachable")]
    PartnerUnreachable(MeterId),

    /// A message carried a `query_number` older than the current query.
    /// Dropped with a warning; never buffered.
    #[error("message for stale query {got}, currently running {current}")]
    WrongQueryNumber {
        /// The query number the message carried.
        got: u64,
        /// The query number currently active on this meter.
        current: u64,
    },

    /// A message carried a `sender_round` older than the current round.
    /// Dropped.
    #[error("message for stale round {got}, currently in round {current}")]
    WrongRound {
        /// The round the message carried.
        got: i64,
        /// The round currently active on this meter.
        current: i64,
    },

    /// The sender of a transport message is not this meter's gossip
    /// partner for the round it claims. Always dropped.
    #[error("meter {sender} is not the gossip partner of {expected} for this round")]
    WrongGossipPartner {
        /// The id the message claims to be from.
        sender: MeterId,
        /// The id that should have sent this round's message.
        expected: MeterId,
    },

    /// A cryptographic signature failed verification. The single offending
    /// value is dropped; this does not poison the rest of the protocol
    /// state.
    #[error("invalid signature from meter {0}")]
    InvalidSignature(MeterId),

    /// A message body was not a legal variant for the phase that received
    /// it. Dropped with a warning.
    #[error("message body {0} is not valid for the current phase")]
    InvalidMessageBody(&'static str),

    /// The path finder exhausted its round horizon before reaching every
    /// target. Fatal for this meter's contribution to the current query
    /// only; other meters proceed unaffected.
    #[error("no node-disjoint path found to meter {0} within the round horizon")]
    PathNotFound(MeterId),

    /// The utility's per-query watchdog fired before quorum was reached.
    #[error("query {0} timed out before reaching quorum")]
    QueryTimeout(u64),

    /// A fatal startup misconfiguration: non-prime network size, a missing
    /// key file, or an invalid CLI argument. The process must exit non-zero.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Wraps a serialization/deserialization failure from the wire codec.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Wraps a failure from the `Crypto` capability (key load, encrypt,
    /// decrypt, blind/unblind).
    #[error("cryptography error: {0}")]
    Crypto(String),

    /// Raised when too many aggregation groups are requested for the
    /// current network size (each group would be size 1 or less).
    #[error("too many aggregation groups ({groups}) for {meters} meters")]
    TooManyGroups {
        /// The requested number of groups.
        groups: usize,
        /// The total number of meters.
        meters: usize,
    },

    /// Raised by the path finder when asked for node-disjoint paths to a
    /// target set that cannot possibly be disjoint (spec §8 boundary case:
    /// `|T| >= N - 1`).
    #[error("cannot find disjoint paths to {targets} targets out of {meters} meters")]
    TooManyTargets {
        /// The number of requested targets.
        targets: usize,
        /// The total number of meters.
        meters: usize,
    },
}
