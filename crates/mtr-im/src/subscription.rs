//! Server-side subscription engine.
//!
//! Each active subscription is a task that watches data-model change
//! notifications and pushes `ReportData` over fresh exchanges, honoring the
//! min-interval floor and the keep-alive send interval. The engine owns the
//! task handles, the establishment block-list, and the persisted snapshots.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mtr_exchange::{ExchangeManager, PeerAddress, Session, SessionEvent};
use mtr_proto::{PROTOCOL_ID_INTERACTION_MODEL, Status};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::InteractionConfig;
use crate::data_model::{AccessControl, DataModel, SubjectDescriptor};
use crate::error::InteractionError;
use crate::messages::{AttributeData, AttributeReport, AttributeStatus, SubscribeRequestMessage};
use crate::path::{AttributePath, ConcreteAttributePath, EventPath};
use crate::server::ImMessenger;
use crate::store::{PeerSubscriptionRecord, SubscriptionStore};

// ---------------------------------------------------------------------------
// SubscriptionSeed
// ---------------------------------------------------------------------------

/// Everything needed to start (or restart) one server subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionSeed {
    pub id: u32,
    pub attribute_requests: Vec<AttributePath>,
    pub event_requests: Vec<EventPath>,
    pub fabric_filtered: bool,
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub send_interval: Duration,
}

impl SubscriptionSeed {
    /// Negotiate publisher-side intervals from the subscriber's request.
    ///
    /// The ceiling is clamped into `[max(floor, 1 s), limit]`, so a
    /// zero/zero request still yields a non-zero interval. The send
    /// interval backs off from the max interval to leave retransmission
    /// budget before the subscriber declares us lost.
    pub fn negotiate(
        id: u32,
        request: &SubscribeRequestMessage,
        default_floor: Duration,
        limit: Duration,
    ) -> Self {
        let min_interval = Duration::from_secs(u64::from(request.min_interval_floor_seconds));
        let lower = min_interval.max(default_floor).max(Duration::from_secs(1));
        let ceiling = Duration::from_secs(u64::from(request.max_interval_ceiling_seconds));
        let max_interval = ceiling.clamp(lower, limit.max(lower));
        SubscriptionSeed {
            id,
            attribute_requests: request.attribute_requests.clone(),
            event_requests: request.event_requests.clone(),
            fabric_filtered: request.fabric_filtered,
            min_interval,
            max_interval,
            send_interval: send_interval_for(max_interval),
        }
    }

    pub fn from_record(record: &PeerSubscriptionRecord) -> Self {
        let max_interval = Duration::from_secs(u64::from(record.max_interval_seconds.max(1)));
        SubscriptionSeed {
            id: record.subscription_id,
            attribute_requests: record.attribute_requests.clone(),
            event_requests: record.event_requests.clone(),
            fabric_filtered: record.fabric_filtered,
            min_interval: Duration::from_secs(u64::from(record.min_interval_seconds)),
            max_interval,
            send_interval: send_interval_for(max_interval),
        }
    }

    fn to_record(&self, peer: PeerAddress) -> PeerSubscriptionRecord {
        PeerSubscriptionRecord {
            subscription_id: self.id,
            fabric_index: peer.fabric_index,
            node_id: peer.node_id.0,
            attribute_requests: self.attribute_requests.clone(),
            event_requests: self.event_requests.clone(),
            fabric_filtered: self.fabric_filtered,
            min_interval_seconds: self.min_interval.as_secs() as u32,
            max_interval_seconds: self.max_interval.as_secs() as u32,
        }
    }
}

fn send_interval_for(max_interval: Duration) -> Duration {
    max_interval.saturating_sub((max_interval / 4).min(Duration::from_secs(5)))
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct SubHandle {
    peer: PeerAddress,
    shutdown: watch::Sender<bool>,
}

struct EngineState {
    subs: HashMap<u32, SubHandle>,
    next_id: u32,
    establishing: HashSet<PeerAddress>,
}

struct EngineInner {
    manager: ExchangeManager,
    dm: Arc<dyn DataModel>,
    acl: Arc<dyn AccessControl>,
    config: InteractionConfig,
    store: Option<Arc<dyn SubscriptionStore>>,
    state: Mutex<EngineState>,
}

#[derive(Clone)]
pub struct SubscriptionEngine {
    inner: Arc<EngineInner>,
}

/// In-flight establishment marker; dropping it unblocks the peer.
pub struct EstablishmentGuard {
    inner: Arc<EngineInner>,
    peer: PeerAddress,
}

impl Drop for EstablishmentGuard {
    fn drop(&mut self) {
        self.inner
            .state
            .lock()
            .expect("engine state")
            .establishing
            .remove(&self.peer);
    }
}

impl SubscriptionEngine {
    pub fn new(
        manager: ExchangeManager,
        dm: Arc<dyn DataModel>,
        acl: Arc<dyn AccessControl>,
        config: InteractionConfig,
        store: Option<Arc<dyn SubscriptionStore>>,
    ) -> Self {
        let inner = Arc::new(EngineInner {
            manager,
            dm,
            acl,
            config,
            store,
            state: Mutex::new(EngineState {
                subs: HashMap::new(),
                next_id: rand::random(),
                establishing: HashSet::new(),
            }),
        });
        let engine = SubscriptionEngine { inner };
        engine.spawn_session_event_task();
        engine
    }

    /// Subscriptions die with their peers and fabrics.
    fn spawn_session_event_task(&self) {
        let engine = self.clone();
        let mut events = engine.inner.manager.sessions().subscribe_events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::PeerLost(peer)) => {
                        // Keep the store records; a restart (or explicit
                        // re-establishment) can revive these.
                        engine.stop_peer_tasks(peer);
                    }
                    Ok(SessionEvent::FabricRemoved(fabric)) => {
                        engine.cancel_fabric(fabric).await;
                    }
                    Ok(SessionEvent::SessionClosed { .. }) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "session events lagged in subscription engine");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // Id allocation and establishment tracking
    // -----------------------------------------------------------------------

    /// Monotonic publisher-unique id; wraps at 2³² and skips live ids.
    pub fn allocate_id(&self) -> u32 {
        let mut state = self.inner.state.lock().expect("engine state");
        loop {
            let id = state.next_id;
            state.next_id = state.next_id.wrapping_add(1);
            if !state.subs.contains_key(&id) {
                return id;
            }
        }
    }

    /// Mark establishment started for `peer`; `None` when one is already
    /// in flight (the re-establishment path checks this and skips).
    pub fn begin_establishment(&self, peer: PeerAddress) -> Option<EstablishmentGuard> {
        let mut state = self.inner.state.lock().expect("engine state");
        if !state.establishing.insert(peer) {
            return None;
        }
        Some(EstablishmentGuard {
            inner: self.inner.clone(),
            peer,
        })
    }

    pub fn is_establishing(&self, peer: PeerAddress) -> bool {
        self.inner
            .state
            .lock()
            .expect("engine state")
            .establishing
            .contains(&peer)
    }

    pub fn active_count(&self) -> usize {
        self.inner.state.lock().expect("engine state").subs.len()
    }

    // -----------------------------------------------------------------------
    // Activation
    // -----------------------------------------------------------------------

    /// Start the report loop for an established subscription and persist
    /// its snapshot. The establishment guard is released once the handle
    /// is registered.
    pub async fn activate(&self, seed: SubscriptionSeed, session: Arc<Session>, guard: EstablishmentGuard) {
        let peer = session.peer();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        {
            let mut state = self.inner.state.lock().expect("engine state");
            state.subs.insert(
                seed.id,
                SubHandle {
                    peer,
                    shutdown: shutdown_tx,
                },
            );
        }
        if let Some(store) = &self.inner.store {
            if let Err(e) = store.save(&seed.to_record(peer)).await {
                warn!(subscription_id = seed.id, error = %e, "failed to persist subscription");
            }
        }
        info!(
            subscription_id = seed.id,
            %peer,
            max_interval_s = seed.max_interval.as_secs(),
            "subscription active"
        );
        drop(guard);

        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_subscription(seed, session, shutdown_rx).await;
        });
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Explicit cancel: stop the task and forget the snapshot.
    pub async fn cancel(&self, subscription_id: u32) {
        let handle = self
            .inner
            .state
            .lock()
            .expect("engine state")
            .subs
            .remove(&subscription_id);
        if let Some(handle) = handle {
            let _ = handle.shutdown.send(true);
            debug!(subscription_id, "subscription cancelled");
        }
        if let Some(store) = &self.inner.store {
            let _ = store.remove(subscription_id).await;
        }
    }

    /// Cancel every subscription held by `peer` (fabric + node match).
    pub async fn cancel_peer(&self, peer: PeerAddress) {
        let ids: Vec<u32> = {
            let state = self.inner.state.lock().expect("engine state");
            state
                .subs
                .iter()
                .filter(|(_, h)| h.peer == peer)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in ids {
            self.cancel(id).await;
        }
    }

    pub async fn cancel_fabric(&self, fabric_index: u8) {
        let ids: Vec<u32> = {
            let state = self.inner.state.lock().expect("engine state");
            state
                .subs
                .iter()
                .filter(|(_, h)| h.peer.fabric_index == fabric_index)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in ids {
            self.cancel(id).await;
        }
    }

    /// Stop tasks for a lost peer but keep the persisted snapshots.
    fn stop_peer_tasks(&self, peer: PeerAddress) {
        let mut state = self.inner.state.lock().expect("engine state");
        state.subs.retain(|id, handle| {
            if handle.peer == peer {
                info!(subscription_id = id, %peer, "subscription stopped, peer lost");
                let _ = handle.shutdown.send(true);
                false
            } else {
                true
            }
        });
    }

    /// Stop everything without touching the store (node shutdown).
    pub async fn close_all(&self) {
        let mut state = self.inner.state.lock().expect("engine state");
        for (_, handle) in state.subs.drain() {
            let _ = handle.shutdown.send(true);
        }
    }

    // -----------------------------------------------------------------------
    // Re-establishment after restart
    // -----------------------------------------------------------------------

    /// Replay persisted subscriptions: connect to each peer (bounded by the
    /// configured timeout) and revive the subscription under its original
    /// id, priming it with a fresh report. Peers already establishing a
    /// fresh subscription are skipped. Returns how many were revived.
    pub async fn resume_persisted<C, Fut>(&self, connect: C) -> usize
    where
        C: Fn(PeerAddress) -> Fut,
        Fut: Future<Output = Result<Arc<Session>, InteractionError>>,
    {
        let Some(store) = self.inner.store.clone() else {
            return 0;
        };
        let records = match store.load_all().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "failed to load persisted subscriptions");
                return 0;
            }
        };
        let mut revived = 0;
        for record in records {
            let peer = PeerAddress::new(record.fabric_index, record.node_id);
            if self.is_establishing(peer) {
                info!(%peer, "skipping re-establishment, fresh subscribe in flight");
                continue;
            }
            let connected = tokio::time::timeout(
                self.inner.config.resubscribe_connect_timeout,
                connect(peer),
            )
            .await;
            match connected {
                Ok(Ok(session)) => {
                    match self.establish_former_subscription(&record, session).await {
                        Ok(()) => revived += 1,
                        Err(e) => {
                            warn!(subscription_id = record.subscription_id, error = %e,
                                "re-establishment failed");
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!(%peer, error = %e, "peer connection failed, subscription not revived");
                }
                Err(_) => {
                    warn!(%peer, "peer connection timed out, subscription not revived");
                }
            }
        }
        revived
    }

    /// Revive one persisted subscription on an existing session: prime it
    /// with an initial report under the original id and activate, without
    /// re-running the SubscribeRequest exchange.
    pub async fn establish_former_subscription(
        &self,
        record: &PeerSubscriptionRecord,
        session: Arc<Session>,
    ) -> Result<(), InteractionError> {
        let peer = session.peer();
        let Some(guard) = self.begin_establishment(peer) else {
            return Err(InteractionError::EstablishmentInProgress(peer));
        };
        let seed = SubscriptionSeed::from_record(record);

        let reports = self.read_request_paths(&seed, peer).await;
        let exchange = self
            .inner
            .manager
            .initiate_for_session(&session, PROTOCOL_ID_INTERACTION_MODEL)?;
        let mut m = ImMessenger::new(exchange, self.inner.config.peer_response_timeout);
        let primed = m
            .send_report_stream(Some(seed.id), reports, Vec::new(), true)
            .await;
        m.close().await;
        primed?;

        info!(subscription_id = seed.id, %peer, "former subscription re-established");
        self.activate(seed, session, guard).await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Report loop
    // -----------------------------------------------------------------------

    async fn run_subscription(
        &self,
        seed: SubscriptionSeed,
        session: Arc<Session>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut changes = self.inner.dm.changes();
        let mut last_report = Instant::now();
        let mut dirty: BTreeSet<ConcreteAttributePath> = BTreeSet::new();
        let mut resync = false;
        let peer = session.peer();

        loop {
            let deadline = if dirty.is_empty() && !resync {
                last_report + seed.send_interval
            } else {
                last_report + seed.min_interval
            };
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
                change = changes.recv() => match change {
                    Ok(change) => {
                        if seed.fabric_filtered
                            && change.fabric_index.is_some_and(|f| f != peer.fabric_index)
                        {
                            continue;
                        }
                        if seed.attribute_requests.iter().any(|p| p.matches(&change.path)) {
                            dirty.insert(change.path);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        // Missed notifications: next report re-reads everything.
                        resync = true;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    let reports = if resync {
                        self.read_request_paths(&seed, peer).await
                    } else {
                        self.read_dirty_paths(&seed, peer, &dirty).await
                    };
                    match self.push_report(&seed, &session, reports).await {
                        Ok(()) => {
                            last_report = Instant::now();
                            dirty.clear();
                            resync = false;
                        }
                        Err(InteractionError::PeerStatus(status)) => {
                            info!(
                                subscription_id = seed.id,
                                %status,
                                "subscriber rejected report, closing subscription"
                            );
                            if status == Status::InvalidSubscription {
                                if let Some(store) = &self.inner.store {
                                    let _ = store.remove(seed.id).await;
                                }
                            }
                            break;
                        }
                        Err(e) => {
                            // Report delivery failed through the MRP
                            // retries: treat as peer loss.
                            warn!(subscription_id = seed.id, error = %e, "report delivery failed");
                            break;
                        }
                    }
                }
            }
        }

        self.inner
            .state
            .lock()
            .expect("engine state")
            .subs
            .remove(&seed.id);
        debug!(subscription_id = seed.id, "subscription task ended");
    }

    async fn push_report(
        &self,
        seed: &SubscriptionSeed,
        session: &Arc<Session>,
        reports: Vec<AttributeReport>,
    ) -> Result<(), InteractionError> {
        let exchange = self
            .inner
            .manager
            .initiate_for_session(session, PROTOCOL_ID_INTERACTION_MODEL)?;
        let mut m = ImMessenger::new(exchange, self.inner.config.peer_response_timeout);
        let sent = m
            .send_report_stream(Some(seed.id), reports, Vec::new(), true)
            .await;
        m.close().await;
        sent
    }

    async fn read_dirty_paths(
        &self,
        seed: &SubscriptionSeed,
        peer: PeerAddress,
        dirty: &BTreeSet<ConcreteAttributePath>,
    ) -> Vec<AttributeReport> {
        let subject = SubjectDescriptor {
            peer,
            is_group: false,
        };
        let fabric_filter = seed.fabric_filtered.then_some(peer.fabric_index);
        let mut reports = Vec::new();
        for path in dirty {
            if !self.inner.acl.allow_read(&subject, path) {
                continue;
            }
            match self.inner.dm.read_attribute(path, fabric_filter).await {
                Ok(value) => reports.push(AttributeReport::Data(AttributeData {
                    data_version: Some(value.data_version),
                    path: (*path).into(),
                    data: value.value,
                })),
                Err(status) => reports.push(AttributeReport::Status(AttributeStatus {
                    path: (*path).into(),
                    status,
                })),
            }
        }
        reports
    }

    async fn read_request_paths(
        &self,
        seed: &SubscriptionSeed,
        peer: PeerAddress,
    ) -> Vec<AttributeReport> {
        let subject = SubjectDescriptor {
            peer,
            is_group: false,
        };
        let fabric_filter = seed.fabric_filtered.then_some(peer.fabric_index);
        let mut reports = Vec::new();
        for request in &seed.attribute_requests {
            let Ok(concretes) = self.inner.dm.expand_attribute_path(request) else {
                continue;
            };
            for concrete in concretes {
                if !self.inner.acl.allow_read(&subject, &concrete) {
                    continue;
                }
                match self.inner.dm.read_attribute(&concrete, fabric_filter).await {
                    Ok(value) => reports.push(AttributeReport::Data(AttributeData {
                        data_version: Some(value.data_version),
                        path: concrete.into(),
                        data: value.value,
                    })),
                    Err(status) => reports.push(AttributeReport::Status(AttributeStatus {
                        path: concrete.into(),
                        status,
                    })),
                }
            }
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(min: u16, max: u16) -> SubscribeRequestMessage {
        SubscribeRequestMessage {
            keep_subscriptions: true,
            min_interval_floor_seconds: min,
            max_interval_ceiling_seconds: max,
            attribute_requests: vec![],
            event_requests: vec![],
            fabric_filtered: false,
            interaction_model_revision: None,
        }
    }

    #[test]
    fn zero_zero_request_negotiates_a_nonzero_interval() {
        let seed = SubscriptionSeed::negotiate(
            1,
            &request(0, 0),
            Duration::from_secs(1),
            Duration::from_secs(3600),
        );
        assert!(seed.max_interval >= Duration::from_secs(1));
        assert!(seed.send_interval > Duration::ZERO);
        assert!(seed.send_interval <= seed.max_interval);
    }

    #[test]
    fn ceiling_is_clamped_to_the_publisher_limit() {
        let seed = SubscriptionSeed::negotiate(
            1,
            &request(0, u16::MAX),
            Duration::from_secs(1),
            Duration::from_secs(3600),
        );
        assert_eq!(seed.max_interval, Duration::from_secs(3600));
    }

    #[test]
    fn send_interval_leaves_retransmission_budget() {
        assert_eq!(
            send_interval_for(Duration::from_secs(60)),
            Duration::from_secs(55)
        );
        assert_eq!(
            send_interval_for(Duration::from_secs(4)),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn record_round_trips_through_seed() {
        let seed = SubscriptionSeed::negotiate(
            7,
            &SubscribeRequestMessage {
                keep_subscriptions: false,
                min_interval_floor_seconds: 2,
                max_interval_ceiling_seconds: 120,
                attribute_requests: vec![AttributePath::concrete(1, 6, 0)],
                event_requests: vec![],
                fabric_filtered: true,
                interaction_model_revision: None,
            },
            Duration::from_secs(1),
            Duration::from_secs(3600),
        );
        let record = seed.to_record(PeerAddress::new(2, 0xBEEF));
        let restored = SubscriptionSeed::from_record(&record);
        assert_eq!(restored.id, 7);
        assert_eq!(restored.max_interval, seed.max_interval);
        assert_eq!(restored.attribute_requests, seed.attribute_requests);
        assert!(restored.fabric_filtered);
    }
}
