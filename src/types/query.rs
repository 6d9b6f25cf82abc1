use serde::{Deserialize, Serialize};

/// A query, as issued by the utility to every meter (spec §3).
///
/// Immutable once constructed; `query_number` is monotone across a utility's
/// lifetime and uniquely identifies one run of the protocol. Meters reject
/// (buffer or drop, per spec §7) any message whose `query_number` doesn't
/// match the query they are currently running.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// What kind of aggregate is being requested.
    pub request_type: QueryType,
    /// The width, in minutes, of the measurement window each meter should
    /// report over.
    pub time_window_minutes: u32,
    /// Monotone identifier of this query instance.
    pub query_number: u64,
    /// For `QueryType::ProjectedUsage`, the serialized price function
    /// consulted by `MeterCapability::simulate_projected_usage`. Opaque to
    /// the protocol core; only the meter capability interprets it.
    pub price_fn: Option<Vec<u8>>,
}

impl QueryRequest {
    /// Builds a new `QueryRequest` with no price function.
    pub fn new(request_type: QueryType, time_window_minutes: u32, query_number: u64) -> Self {
        Self {
            request_type,
            time_window_minutes,
            query_number,
            price_fn: None,
        }
    }

    /// Builds a new `QueryRequest` carrying a price function, for
    /// `QueryType::ProjectedUsage` queries.
    pub fn with_price_fn(
        request_type: QueryType,
        time_window_minutes: u32,
        query_number: u64,
        price_fn: Vec<u8>,
    ) -> Self {
        Self {
            request_type,
            time_window_minutes,
            query_number,
            price_fn: Some(price_fn),
        }
    }
}

/// The kind of aggregate being requested. The protocol core treats this
/// opaquely and passes it through to `MeterCapability`; the tree aggregation
/// machinery is agnostic to which of these produced the contributed vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryType {
    /// Sum of each meter's total consumption over the window.
    TotalConsumption,
    /// Sum of each meter's shiftable (deferrable) consumption over the window.
    ShiftableConsumption,
    /// Sum of each meter's daily consumption.
    DailyConsumption,
    /// Sum of each meter's projected usage under a supplied price function.
    ProjectedUsage,
}
