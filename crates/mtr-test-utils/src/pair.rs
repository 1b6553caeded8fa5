//! A pre-connected two-node harness: full exchange + interaction stacks on
//! both ends of an in-process loopback link.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mtr_exchange::{
    ExchangeConfig, ExchangeManager, NodeId, PeerAddress, SecureSessionConfig, SessionKeys,
    SessionManager,
};
use mtr_im::client::ClientSubscriptions;
use mtr_im::data_model::PermissiveAccessControl;
use mtr_im::store::{PeerSubscriptionRecord, StoreError, SubscriptionStore};
use mtr_im::{
    InteractionClient, InteractionConfig, InteractionServer, SubscriptionEngine,
};
use mtr_proto::SessionParameters;
use tokio::sync::mpsc;

use crate::data_model::TestDataModel;
use crate::loopback::{Faults, LoopbackChannel, NullCrypto};

pub const NODE_A_ID: u64 = 0xa11ce;
pub const NODE_B_ID: u64 = 0xb0b;
pub const FABRIC: u8 = 1;

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// Subscription store backed by a map; enough to test persistence and
/// restart re-establishment.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<u32, PeerSubscriptionRecord>>,
}

impl MemoryStore {
    pub fn records(&self) -> Vec<PeerSubscriptionRecord> {
        self.records.lock().expect("records lock").values().cloned().collect()
    }

    pub fn insert(&self, record: PeerSubscriptionRecord) {
        self.records
            .lock()
            .expect("records lock")
            .insert(record.subscription_id, record);
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn save(&self, record: &PeerSubscriptionRecord) -> Result<(), StoreError> {
        self.insert(record.clone());
        Ok(())
    }

    async fn remove(&self, subscription_id: u32) -> Result<(), StoreError> {
        self.records
            .lock()
            .expect("records lock")
            .remove(&subscription_id);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<PeerSubscriptionRecord>, StoreError> {
        Ok(self.records())
    }
}

// ---------------------------------------------------------------------------
// TestNode
// ---------------------------------------------------------------------------

pub struct TestNode {
    pub sessions: Arc<SessionManager>,
    pub manager: ExchangeManager,
    pub data_model: Arc<TestDataModel>,
    pub server: Arc<InteractionServer>,
    pub engine: SubscriptionEngine,
    pub client_subscriptions: Arc<ClientSubscriptions>,
    pub store: Arc<MemoryStore>,
    pub config: InteractionConfig,
}

impl TestNode {
    pub fn new(node_id: u64, config: InteractionConfig) -> Self {
        let sessions = Arc::new(SessionManager::new(NodeId(node_id)));
        let manager = ExchangeManager::new(
            sessions.clone(),
            Arc::new(NullCrypto),
            ExchangeConfig::default(),
        );
        let data_model = Arc::new(TestDataModel::new());
        let acl = Arc::new(PermissiveAccessControl);
        let store = Arc::new(MemoryStore::default());
        let engine = SubscriptionEngine::new(
            manager.clone(),
            data_model.clone(),
            acl.clone(),
            config.clone(),
            Some(store.clone()),
        );
        let client_subscriptions = ClientSubscriptions::new();
        let server = InteractionServer::new(
            data_model.clone(),
            acl,
            config.clone(),
            engine.clone(),
            client_subscriptions.clone(),
        );
        manager
            .add_protocol_handler(server.clone())
            .expect("IM handler registration");
        TestNode {
            sessions,
            manager,
            data_model,
            server,
            engine,
            client_subscriptions,
            store,
            config,
        }
    }

    /// An interaction client on this node targeting `peer`.
    pub fn client_for(&self, peer: PeerAddress) -> Arc<InteractionClient> {
        InteractionClient::new(
            self.manager.clone(),
            peer,
            self.config.clone(),
            self.client_subscriptions.clone(),
        )
    }
}

// ---------------------------------------------------------------------------
// NodePair
// ---------------------------------------------------------------------------

pub struct NodePair {
    pub a: TestNode,
    pub b: TestNode,
    /// Faults applied to packets A sends toward B.
    pub a_to_b_faults: Arc<Faults>,
    /// Faults applied to packets B sends toward A.
    pub b_to_a_faults: Arc<Faults>,
}

impl NodePair {
    pub fn peer_b() -> PeerAddress {
        PeerAddress::new(FABRIC, NODE_B_ID)
    }

    pub fn peer_a() -> PeerAddress {
        PeerAddress::new(FABRIC, NODE_A_ID)
    }

    /// Two nodes with an established secure session between them.
    pub fn connected(params: SessionParameters) -> Self {
        Self::connected_with_config(params, InteractionConfig::default())
    }

    pub fn connected_with_config(
        params: SessionParameters,
        config: InteractionConfig,
    ) -> Self {
        let a = TestNode::new(NODE_A_ID, config.clone());
        let b = TestNode::new(NODE_B_ID, config);

        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a_to_b_faults = Arc::new(Faults::default());
        let b_to_a_faults = Arc::new(Faults::default());

        let chan_a_to_b = Arc::new(LoopbackChannel::new(
            a_tx,
            a_to_b_faults.clone(),
            "loop:a->b",
        ));
        let chan_b_to_a = Arc::new(LoopbackChannel::new(
            b_tx,
            b_to_a_faults.clone(),
            "loop:b->a",
        ));

        let keys = SessionKeys {
            encrypt_key: vec![0u8; 16],
            decrypt_key: vec![0u8; 16],
        };
        a.sessions.add_secure_session(SecureSessionConfig {
            local_session_id: 1,
            peer_session_id: 2,
            peer: Self::peer_b(),
            local_node_id: NodeId(NODE_A_ID),
            keys: keys.clone(),
            params: params.clone(),
            channel: chan_a_to_b.clone(),
        });
        b.sessions.add_secure_session(SecureSessionConfig {
            local_session_id: 2,
            peer_session_id: 1,
            peer: Self::peer_a(),
            local_node_id: NodeId(NODE_B_ID),
            keys,
            params,
            channel: chan_b_to_a.clone(),
        });

        // Pump each direction into the far side's ingest point.
        let b_manager = b.manager.clone();
        tokio::spawn(async move {
            while let Some(bytes) = a_rx.recv().await {
                b_manager.on_message(chan_b_to_a.clone(), bytes).await;
            }
        });
        let a_manager = a.manager.clone();
        tokio::spawn(async move {
            while let Some(bytes) = b_rx.recv().await {
                a_manager.on_message(chan_a_to_b.clone(), bytes).await;
            }
        });

        NodePair {
            a,
            b,
            a_to_b_faults,
            b_to_a_faults,
        }
    }

    /// Client on node A talking to node B.
    pub fn client(&self) -> Arc<InteractionClient> {
        self.a.client_for(Self::peer_b())
    }
}
