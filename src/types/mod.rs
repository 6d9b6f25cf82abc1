//! Wire and protocol data types (spec §3).

mod aggregation;
mod overlay_message;
mod ping;
mod query;
mod signature_msg;
mod value;

pub use aggregation::AggregationMessage;
pub use overlay_message::{MessageBody, OverlayMessage, OverlayTransportMessage, PathOverlayMessage};
pub use ping::PingMessage;
pub use query::{QueryRequest, QueryType};
pub use signature_msg::{SignatureRequest, SignatureResponse};
pub use value::{AgreementValue, Signature, SignedValue, ValueContribution, ValueTuple, SIGNATURE_LEN};

/// A meter or utility identifier. The utility is always `-1`; meters are
/// `0..N`. Signed so the utility's sentinel id fits the same type.
pub type MeterId = i64;

/// The utility's well-known identifier (spec §2).
pub const UTILITY_ID: MeterId = -1;
