//! Gather: the high-failure-tolerant variant's redundancy re-send. Spec
//! §4.4a describes the exact same node-disjoint re-send algorithm as Echo,
//! just under a different round budget (`phases::flood_rounds`) and used
//! by the HFT variant instead of the crash-tolerant one, so this module
//! re-exports Echo's implementation under Gather's name rather than
//! duplicating it.

pub use crate::phases::echo::{build_echo_onions as build_gather_onions, EchoHandler as GatherHandler};
