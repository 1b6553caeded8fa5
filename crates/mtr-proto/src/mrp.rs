//! Message Reliability Protocol retransmission schedule.
//!
//! The wait before transmission `n+1` is
//! `base * MARGIN * BASE^(max(0, n - THRESHOLD))`, scaled by a random
//! jitter in `[1.0, 1.25)`. `base` is the session's active or idle
//! retransmission interval.

use std::time::Duration;

use crate::SessionParameters;

/// Total transmissions (first send + retries) before declaring peer loss.
pub const MRP_MAX_TRANSMISSIONS: u32 = 5;
/// Exponential backoff base.
pub const MRP_BACKOFF_BASE: f64 = 1.6;
/// Multiplicative jitter span.
pub const MRP_BACKOFF_JITTER: f64 = 0.25;
/// Safety margin over the nominal interval.
pub const MRP_BACKOFF_MARGIN: f64 = 1.1;
/// Retransmissions before the exponential term kicks in.
pub const MRP_BACKOFF_THRESHOLD: u32 = 1;

/// How long a received reliable message may wait for a piggybacked ack
/// before a standalone ack goes out.
pub const MRP_STANDALONE_ACK_DELAY: Duration = Duration::from_millis(200);

/// Convenience bundle for callers that only care about the schedule.
#[derive(Debug, Clone, Copy)]
pub struct MrpParameters {
    pub max_transmissions: u32,
}

impl Default for MrpParameters {
    fn default() -> Self {
        MrpParameters {
            max_transmissions: MRP_MAX_TRANSMISSIONS,
        }
    }
}

/// Wait before the next transmission, given that `send_count` transmissions
/// have already happened. Includes random jitter.
pub fn mrp_backoff(params: &SessionParameters, send_count: u32) -> Duration {
    let jitter = 1.0 + rand::random::<f64>() * MRP_BACKOFF_JITTER;
    backoff_with_factor(params, send_count, jitter)
}

/// Deterministic upper bound of the same interval (jitter at its maximum).
pub fn mrp_backoff_ceiling(params: &SessionParameters, send_count: u32) -> Duration {
    backoff_with_factor(params, send_count, 1.0 + MRP_BACKOFF_JITTER)
}

fn backoff_with_factor(params: &SessionParameters, send_count: u32, jitter: f64) -> Duration {
    // The first transmission uses the active interval; the peer may have
    // fallen idle by the time retries start, so retries use the larger of
    // the two once past the threshold.
    let base = if send_count <= MRP_BACKOFF_THRESHOLD {
        params.session_active_interval
    } else {
        params.session_idle_interval.max(params.session_active_interval)
    };
    let exponent = send_count.saturating_sub(MRP_BACKOFF_THRESHOLD);
    let scale = MRP_BACKOFF_MARGIN * MRP_BACKOFF_BASE.powi(exponent as i32) * jitter;
    base.mul_f64(scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_monotonically() {
        let params = SessionParameters::default();
        let mut last = Duration::ZERO;
        for send_count in 1..=MRP_MAX_TRANSMISSIONS {
            let next = mrp_backoff_ceiling(&params, send_count);
            assert!(next > last, "send {send_count}: {next:?} <= {last:?}");
            last = next;
        }
    }

    #[test]
    fn jittered_backoff_stays_within_ceiling() {
        let params = SessionParameters::default();
        for send_count in 1..=MRP_MAX_TRANSMISSIONS {
            let ceiling = mrp_backoff_ceiling(&params, send_count);
            for _ in 0..32 {
                assert!(mrp_backoff(&params, send_count) <= ceiling);
            }
        }
    }

    #[test]
    fn first_retry_uses_active_interval_with_margin_only() {
        let params = SessionParameters::default();
        let floor = params.session_active_interval.mul_f64(MRP_BACKOFF_MARGIN);
        assert!(mrp_backoff(&params, 1) >= floor);
        assert!(mrp_backoff_ceiling(&params, 1) <= floor.mul_f64(1.0 + MRP_BACKOFF_JITTER));
    }
}
