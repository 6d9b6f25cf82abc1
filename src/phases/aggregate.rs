//! Tree Aggregation: the round-independent final phase that folds each
//! group's contributions up a balanced binary tree to its root, then to the
//! utility (spec §4.6).
//!
//! `original_source/src/TreeAggregationState.{h,cpp}` declares this state
//! machine but its method bodies were empty in the retrieved source; the
//! behavior below is built directly from spec §4.6's completion condition
//! and own-contribution folding rule (recorded as an Open Question
//! decision in `DESIGN.md`), not ported from C++.

use crate::fixed_point::{pointwise_add, FixedPoint};
use crate::types::{AggregationMessage, MeterId, ValueContribution, UTILITY_ID};
use std::collections::HashSet;

/// Per-query aggregation state for one meter's position in its group's
/// tree (spec §4.5 for tree shape, §4.6 for the state machine itself).
pub struct AggregationState {
    query_number: u64,
    parent: Option<MeterId>,
    children_needed: usize,
    children_received_from: usize,
    partial: Vec<FixedPoint>,
    num_contributors: u32,
}

impl AggregationState {
    /// `children` is this meter's full set of tree children;
    /// `failed_meter_ids` filters out any already known dead, so a child
    /// lost before Aggregate started never blocks completion.
    pub fn new(
        query_number: u64,
        parent: Option<MeterId>,
        children: &[MeterId],
        failed_meter_ids: &HashSet<MeterId>,
        measurement_len: usize,
    ) -> Self {
        let children_needed = children.iter().filter(|c| !failed_meter_ids.contains(c)).count();
        Self {
            query_number,
            parent,
            children_needed,
            children_received_from: 0,
            partial: vec![FixedPoint::zero(); measurement_len],
            num_contributors: 1,
        }
    }

    pub fn query_number(&self) -> u64 {
        self.query_number
    }

    /// Folds one child's partial aggregate into this meter's own.
    pub fn receive_from_child(&mut self, message: &AggregationMessage) {
        pointwise_add(&mut self.partial, &message.body);
        self.num_contributors += message.num_contributors;
        self.children_received_from += 1;
    }

    /// True once every live child has reported (spec §4.6 "Completion condition").
    pub fn is_complete(&self) -> bool {
        self.children_received_from >= self.children_needed
    }

    /// Finishes the state: folds in this meter's own accepted contributions
    /// (each counting as one contributor) and produces the message to
    /// forward to `parent`, or to the utility if this meter is a group
    /// root. Consumes `self` since a meter never re-enters Aggregate for
    /// the same query (spec §4.6: "Transition to Idle").
    pub fn finish(mut self, my_id: MeterId, own_contributions: &HashSet<ValueContribution>) -> (MeterId, AggregationMessage) {
        for contribution in own_contributions {
            pointwise_add(&mut self.partial, &contribution.value.measurements);
            self.num_contributors += 1;
        }
        let recipient = self.parent.unwrap_or(UTILITY_ID);
        let message = AggregationMessage {
            sender_id: my_id,
            query_number: self.query_number,
            num_contributors: self.num_contributors,
            body: self.partial,
        };
        (recipient, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValueTuple;

    fn aggregation_message(sender: MeterId, values: Vec<i64>, contributors: u32) -> AggregationMessage {
        AggregationMessage {
            sender_id: sender,
            query_number: 1,
            num_contributors: contributors,
            body: values.into_iter().map(FixedPoint::from_int).collect(),
        }
    }

    #[test]
    fn completes_once_every_live_child_has_reported() {
        let failed = HashSet::new();
        let mut state = AggregationState::new(1, Some(0), &[1, 2], &failed, 2);
        assert!(!state.is_complete());
        state.receive_from_child(&aggregation_message(1, vec![1, 2], 1));
        assert!(!state.is_complete());
        state.receive_from_child(&aggregation_message(2, vec![3, 4], 1));
        assert!(state.is_complete());
    }

    #[test]
    fn failed_children_are_excluded_from_the_threshold() {
        let mut failed = HashSet::new();
        failed.insert(2);
        let mut state = AggregationState::new(1, Some(0), &[1, 2], &failed, 2);
        state.receive_from_child(&aggregation_message(1, vec![1, 2], 1));
        assert!(state.is_complete());
    }

    #[test]
    fn finish_folds_own_contribution_and_routes_to_parent() {
        let failed = HashSet::new();
        let mut state = AggregationState::new(1, Some(9), &[1], &failed, 1);
        state.receive_from_child(&aggregation_message(1, vec![5], 1));
        let mut own = HashSet::new();
        own.insert(ValueContribution::unsigned(ValueTuple::new(1, vec![FixedPoint::from_int(2)], vec![])));
        let (recipient, message) = state.finish(0, &own);
        assert_eq!(recipient, 9);
        assert_eq!(message.num_contributors, 3);
        assert_eq!(message.body[0], FixedPoint::from_int(7));
    }

    #[test]
    fn root_routes_to_the_utility() {
        let failed = HashSet::new();
        let state = AggregationState::new(1, None, &[], &failed, 1);
        let (recipient, _) = state.finish(0, &HashSet::new());
        assert_eq!(recipient, UTILITY_ID);
    }
}
