use crate::fixed_point::FixedPoint;
use crate::types::MeterId;
use serde::{Deserialize, Serialize};

/// A partial (or final) aggregate, carried up the aggregation tree towards
/// the utility (spec §3, §4.6).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregationMessage {
    /// The meter that produced this (possibly already-combined) message.
    pub sender_id: MeterId,
    /// The query this aggregate belongs to.
    pub query_number: u64,
    /// How many distinct contributions have been folded into `body` so far.
    pub num_contributors: u32,
    /// The pointwise-summed measurement vector.
    pub body: Vec<FixedPoint>,
}

impl AggregationMessage {
    /// Constructs a fresh, all-zero aggregate of the given length,
    /// attributed to `sender_id`, with a single (not yet counted)
    /// contributor.
    pub fn zero(sender_id: MeterId, query_number: u64, length: usize) -> Self {
        Self {
            sender_id,
            query_number,
            num_contributors: 0,
            body: vec![FixedPoint::zero(); length],
        }
    }

    /// Pointwise-adds `other`'s body into this one and accumulates its
    /// contributor count.
    pub fn merge(&mut self, other: &AggregationMessage) {
        crate::fixed_point::pointwise_add(&mut self.body, &other.body);
        self.num_contributors += other.num_contributors;
    }

    /// Adds a single contribution's measurement vector, counting it as one
    /// contributor.
    pub fn add_contribution(&mut self, values: &[FixedPoint]) {
        crate::fixed_point::pointwise_add(&mut self.body, values);
        self.num_contributors += 1;
    }
}
