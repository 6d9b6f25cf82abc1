//! Phase controllers driven by `overlay::round_driver::RoundDriver`
//! (Shuffle/Scatter, Echo/Gather, Crusader Agreement) plus the
//! round-independent tree aggregation state machine (spec §4.3-§4.6).
//!
//! Each onion/flood phase is one `RoundHandler` implementation; the meter
//! actor (`crate::meter`) owns the `RoundDriver` and swaps handlers as the
//! protocol moves from phase to phase, matching the original's single
//! `ProtocolState` object whose behavior changes as its `currentState`
//! field advances (`original_source/src/ProtocolState.h`).

pub mod aggregate;
pub mod agreement;
pub mod echo;
pub mod gather;
pub mod scatter;
pub mod shuffle;

use crate::overlay::graph::log2_ceil;

/// Round budget for onion-routed Shuffle (crash-tolerant) and Echo (spec §4.3, §4.4a).
pub fn crash_tolerant_rounds(t: u64, num_meters: usize) -> i64 {
    let log2n = log2_ceil(num_meters) as i64;
    t as i64 + 2 * log2n + 1
}

/// Round budget for onion-routed Shuffle (Byzantine) and each Crusader
/// Agreement phase (spec §4.3, §4.4b) — both share `2t + log2N^2 + 1`.
pub fn byzantine_rounds(t: u64, num_meters: usize) -> i64 {
    let log2n = log2_ceil(num_meters) as i64;
    2 * t as i64 + log2n * log2n + 1
}

/// Round budget for flood-based Scatter and Gather (spec §4.3, §4.4a).
pub fn flood_rounds(t: u64, num_meters: usize) -> i64 {
    let log2n = log2_ceil(num_meters) as i64;
    log2n + t as i64
}
