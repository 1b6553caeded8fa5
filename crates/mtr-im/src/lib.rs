// mtr-im: the Matter Interaction Model layer.
//
// Server-side verb handling (read/write/invoke/subscribe/timed) over the
// exchange layer, the server subscription engine with persistence and
// re-establishment, the client-side verbs, and the command batcher.

use std::time::Duration;

pub mod batcher;
pub mod client;
pub mod data_model;
pub mod error;
pub mod messages;
pub mod path;
pub mod server;
pub mod store;
pub mod subscription;

pub use batcher::CommandBatcher;
pub use client::{
    ClientSubscription, ClientSubscriptions, CommandRequest, CommandResponse, InteractionClient,
    SubscribeMode,
};
pub use data_model::{
    AccessControl, AttributeChange, AttributeValue, DataModel, EventRecord, InvokeOutcome,
    PermissiveAccessControl, SubjectDescriptor, WriteItem, WriteOp,
};
pub use error::InteractionError;
pub use path::{
    AttributePath, CommandPath, ConcreteAttributePath, ConcreteEventPath, EventPath,
};
pub use server::InteractionServer;
pub use store::{PeerSubscriptionRecord, StoreError, SubscriptionStore};
pub use subscription::{SubscriptionEngine, SubscriptionSeed};

/// Operational knobs of the interaction layer.
///
/// Defaults follow the Matter-recommended values.
#[derive(Debug, Clone)]
pub struct InteractionConfig {
    /// How many command paths one inbound invoke may carry; also what this
    /// node advertises to peers.
    pub max_paths_per_invoke: u16,
    /// Lower clamp for negotiated subscription min intervals.
    pub default_min_interval_floor: Duration,
    /// Upper clamp for negotiated subscription max intervals.
    pub subscription_max_interval_limit: Duration,
    /// Timed-interaction window when the request names none.
    pub timed_request_timeout: Duration,
    /// Extended response window while a fail-safe is armed.
    pub failsafe_response_timeout: Duration,
    /// Per-peer connection budget when re-establishing persisted
    /// subscriptions after a restart.
    pub resubscribe_connect_timeout: Duration,
    /// How long to wait for a peer's StatusResponse between chunks.
    pub peer_response_timeout: Duration,
    /// Client-side split threshold for read paths per exchange.
    pub read_path_budget: usize,
    /// Serve requests arriving on unsecured sessions. Only for development
    /// setups where session establishment runs outside this process.
    pub allow_unsecured_sessions: bool,
}

impl Default for InteractionConfig {
    fn default() -> Self {
        InteractionConfig {
            max_paths_per_invoke: 9,
            default_min_interval_floor: Duration::from_secs(1),
            subscription_max_interval_limit: Duration::from_secs(60 * 60),
            timed_request_timeout: Duration::from_secs(10),
            failsafe_response_timeout: Duration::from_secs(30),
            resubscribe_connect_timeout: Duration::from_secs(2),
            peer_response_timeout: Duration::from_secs(30),
            read_path_budget: 9,
            allow_unsecured_sessions: false,
        }
    }
}
