use crate::types::MeterId;
use serde::{Deserialize, Serialize};

/// A liveness probe sent to a gossip predecessor, or the reply to one
/// (spec §3, §4.1 step 4).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingMessage {
    /// The meter sending this ping (request or response).
    pub sender_id: MeterId,
    /// `false` for a liveness probe, `true` for the reply to one.
    pub is_response: bool,
}

impl PingMessage {
    /// Constructs a liveness-probe request.
    pub fn request(sender_id: MeterId) -> Self {
        Self {
            sender_id,
            is_response: false,
        }
    }

    /// Constructs the reply to a liveness-probe request.
    pub fn response(sender_id: MeterId) -> Self {
        Self {
            sender_id,
            is_response: true,
        }
    }
}
