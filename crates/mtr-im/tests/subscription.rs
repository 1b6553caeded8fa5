//! Subscription engine behavior: establishment, report timing, cancellation
//! semantics, and restart re-establishment.

use std::time::Duration;

use mtr_exchange::ExchangeError;
use mtr_im::messages::SubscribeRequestMessage;
use mtr_im::path::ConcreteAttributePath;
use mtr_im::store::PeerSubscriptionRecord;
use mtr_im::{InteractionError, SubscribeMode};
use mtr_proto::SessionParameters;
use mtr_test_utils::NodePair;
use mtr_test_utils::data_model::{ON_OFF_ATTRIBUTE, ON_OFF_CLUSTER};
use mtr_tlv::Value;

fn on_off_path() -> ConcreteAttributePath {
    ConcreteAttributePath {
        endpoint: 1,
        cluster: ON_OFF_CLUSTER,
        attribute: ON_OFF_ATTRIBUTE,
    }
}

fn subscribe_request(min_s: u16, max_s: u16) -> SubscribeRequestMessage {
    SubscribeRequestMessage {
        keep_subscriptions: true,
        min_interval_floor_seconds: min_s,
        max_interval_ceiling_seconds: max_s,
        attribute_requests: vec![on_off_path().into()],
        event_requests: vec![],
        fabric_filtered: false,
        interaction_model_revision: None,
    }
}

async fn recv_report(
    sub: &mut mtr_im::ClientSubscription,
    within: Duration,
) -> mtr_im::messages::DataReportMessage {
    tokio::time::timeout(within, sub.reports.recv())
        .await
        .expect("timed out waiting for a report")
        .expect("subscription channel closed")
}

/// Activation runs on the publisher after the subscriber's final ack;
/// poll instead of racing it.
async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

// ---------------------------------------------------------------------------
// Establishment + priming
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subscribe_primes_with_current_values() {
    let pair = NodePair::connected(SessionParameters::default());
    let client = pair.client();

    let mut sub = client
        .subscribe(subscribe_request(0, 60), SubscribeMode::Once, None)
        .await
        .unwrap();

    let primed = recv_report(&mut sub, Duration::from_secs(5)).await;
    assert_eq!(primed.subscription_id, Some(sub.subscription_id()));
    assert_eq!(primed.attribute_reports.len(), 1);
    wait_until(|| pair.b.engine.active_count() == 1).await;
}

// ---------------------------------------------------------------------------
// Scenario: mutation report + max-interval keep-alive
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn mutation_report_then_keepalive_at_interval_boundary() {
    let pair = NodePair::connected(SessionParameters::default());
    let client = pair.client();

    // minFloor 0, maxCeiling 2 s.
    let mut sub = client
        .subscribe(subscribe_request(0, 2), SubscribeMode::Once, None)
        .await
        .unwrap();
    let _primed = recv_report(&mut sub, Duration::from_secs(5)).await;

    // A mutation shortly after establishment produces a prompt report.
    pair.b
        .data_model
        .set_attribute(on_off_path(), Value::Bool(true));
    let report = recv_report(&mut sub, Duration::from_secs(3)).await;
    assert!(
        report
            .attribute_reports
            .iter()
            .any(|r| matches!(r, mtr_im::messages::AttributeReport::Data(d)
                if d.data == Value::Bool(true))),
        "change report should carry the new value"
    );

    // No further mutation: the next report is the keep-alive, no later
    // than the negotiated max interval.
    let keepalive = recv_report(&mut sub, Duration::from_secs(3)).await;
    assert_eq!(keepalive.subscription_id, Some(sub.subscription_id()));
}

// ---------------------------------------------------------------------------
// keepSubscriptions = false cancels the peer's previous subscriptions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fresh_subscribe_without_keep_cancels_existing() {
    let pair = NodePair::connected(SessionParameters::default());
    let client = pair.client();

    let first = client
        .subscribe(subscribe_request(0, 60), SubscribeMode::Once, None)
        .await
        .unwrap();
    assert_eq!(pair.b.engine.active_count(), 1);

    let mut replace = subscribe_request(0, 60);
    replace.keep_subscriptions = false;
    let second = client
        .subscribe(replace, SubscribeMode::Once, None)
        .await
        .unwrap();

    assert_ne!(first.subscription_id(), second.subscription_id());
    let second_id = second.subscription_id();
    wait_until(|| {
        let records = pair.b.store.records();
        pair.b.engine.active_count() == 1
            && records.len() == 1
            && records[0].subscription_id == second_id
    })
    .await;
}

// ---------------------------------------------------------------------------
// Persistence + restart re-establishment
// ---------------------------------------------------------------------------

#[tokio::test]
async fn persisted_subscription_re_establishes_under_its_original_id() {
    let pair = NodePair::connected(SessionParameters::default());

    // The subscriber (node A) knows subscription 4242 from before the
    // publisher's restart and re-attaches its route.
    let mut reports = pair.a.client_subscriptions.register(4242);

    // The publisher (node B) restarts with this snapshot on disk.
    pair.b.store.insert(PeerSubscriptionRecord {
        subscription_id: 4242,
        fabric_index: NodePair::peer_a().fabric_index,
        node_id: NodePair::peer_a().node_id.0,
        attribute_requests: vec![on_off_path().into()],
        event_requests: vec![],
        fabric_filtered: false,
        min_interval_seconds: 0,
        max_interval_seconds: 60,
    });

    let sessions = pair.b.sessions.clone();
    let revived = pair
        .b
        .engine
        .resume_persisted(move |peer| {
            let sessions = sessions.clone();
            async move {
                sessions
                    .session_for_peer(&peer)
                    .ok_or(InteractionError::Exchange(ExchangeError::NoSession(peer)))
            }
        })
        .await;
    assert_eq!(revived, 1);
    assert_eq!(pair.b.engine.active_count(), 1);

    // The primed report arrives under the original id.
    let primed = tokio::time::timeout(Duration::from_secs(5), reports.recv())
        .await
        .expect("no primed report")
        .expect("route closed");
    assert_eq!(primed.subscription_id, Some(4242));
    assert!(!primed.attribute_reports.is_empty());
}

#[tokio::test]
async fn re_establishment_skips_peers_already_establishing() {
    let pair = NodePair::connected(SessionParameters::default());

    pair.b.store.insert(PeerSubscriptionRecord {
        subscription_id: 7,
        fabric_index: NodePair::peer_a().fabric_index,
        node_id: NodePair::peer_a().node_id.0,
        attribute_requests: vec![on_off_path().into()],
        event_requests: vec![],
        fabric_filtered: false,
        min_interval_seconds: 0,
        max_interval_seconds: 60,
    });

    // A fresh subscribe from the same peer is mid-establishment.
    let _guard = pair
        .b
        .engine
        .begin_establishment(NodePair::peer_a())
        .expect("establishment guard");

    let sessions = pair.b.sessions.clone();
    let revived = pair
        .b
        .engine
        .resume_persisted(move |peer| {
            let sessions = sessions.clone();
            async move {
                sessions
                    .session_for_peer(&peer)
                    .ok_or(InteractionError::Exchange(ExchangeError::NoSession(peer)))
            }
        })
        .await;
    assert_eq!(revived, 0, "in-flight establishment blocks the revival");
    assert_eq!(pair.b.engine.active_count(), 0);
}

// ---------------------------------------------------------------------------
// Interval validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn max_interval_below_min_interval_is_rejected() {
    let pair = NodePair::connected(SessionParameters::default());
    let client = pair.client();

    let result = client
        .subscribe(subscribe_request(10, 5), SubscribeMode::Once, None)
        .await;
    let err = result.err().expect("subscribe must be rejected");
    match err {
        InteractionError::PeerStatus(status) => {
            assert_eq!(status, mtr_proto::Status::InvalidAction);
        }
        other => panic!("expected InvalidAction, got {other:?}"),
    }
    assert_eq!(pair.b.engine.active_count(), 0);
}
