//! Persisted subscription state.
//!
//! A [`PeerSubscriptionRecord`] is the projection of a live server
//! subscription sufficient to re-establish it after a restart: identity,
//! the original request paths, and the negotiated intervals.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::path::{AttributePath, EventPath};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSubscriptionRecord {
    pub subscription_id: u32,
    pub fabric_index: u8,
    pub node_id: u64,
    pub attribute_requests: Vec<AttributePath>,
    pub event_requests: Vec<EventPath>,
    pub fabric_filtered: bool,
    pub min_interval_seconds: u32,
    pub max_interval_seconds: u32,
}

#[derive(Debug, thiserror::Error)]
#[error("subscription store: {0}")]
pub struct StoreError(pub String);

/// Simple async KV-style store for subscription snapshots.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn save(&self, record: &PeerSubscriptionRecord) -> Result<(), StoreError>;
    async fn remove(&self, subscription_id: u32) -> Result<(), StoreError>;
    async fn load_all(&self) -> Result<Vec<PeerSubscriptionRecord>, StoreError>;
}
