//! Session parameters exchanged during session establishment.

use std::time::Duration;

/// Per-session operational parameters.
///
/// Defaults are the Matter-recommended values; CASE/PASE may override any of
/// them during establishment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParameters {
    /// Retransmission base interval while the peer is idle.
    pub session_idle_interval: Duration,
    /// Retransmission base interval while the peer is active.
    pub session_active_interval: Duration,
    /// How long after traffic the peer stays "active".
    pub session_active_threshold: Duration,
    /// How many command paths one invoke request to this peer may carry.
    pub max_paths_per_invoke: u16,
    /// Peer's Interaction Model revision.
    pub interaction_model_revision: u8,
}

impl Default for SessionParameters {
    fn default() -> Self {
        SessionParameters {
            session_idle_interval: Duration::from_millis(500),
            session_active_interval: Duration::from_millis(300),
            session_active_threshold: Duration::from_secs(4),
            max_paths_per_invoke: 1,
            interaction_model_revision: crate::INTERACTION_MODEL_REVISION,
        }
    }
}

impl SessionParameters {
    /// Worst-case time for a reliable message to be delivered or declared
    /// lost, i.e. the full retransmission schedule.
    pub fn max_transmission_time(&self) -> Duration {
        let mut total = Duration::ZERO;
        for send_count in 1..=crate::mrp::MRP_MAX_TRANSMISSIONS {
            total += crate::mrp::mrp_backoff_ceiling(self, send_count);
        }
        total
    }
}
