//! End-to-end interaction tests over a connected loopback node pair.

use std::time::Duration;

use mtr_im::client::CommandRequest;
use mtr_im::messages::{AttributeData, StatusResponseMessage, WriteRequestMessage};
use mtr_im::path::{AttributePath, CommandPath, ConcreteAttributePath};
use mtr_proto::{ImOpcode, SessionParameters, Status};
use mtr_test_utils::data_model::{
    ECHO_CLUSTER, ECHO_COMMAND, ON_OFF_ATTRIBUTE, ON_OFF_CLUSTER, TEST_LIST_ATTRIBUTE,
};
use mtr_test_utils::NodePair;
use mtr_tlv::Value;

fn batching_params() -> SessionParameters {
    SessionParameters {
        max_paths_per_invoke: 4,
        ..SessionParameters::default()
    }
}

fn on_off_path() -> ConcreteAttributePath {
    ConcreteAttributePath {
        endpoint: 1,
        cluster: ON_OFF_CLUSTER,
        attribute: ON_OFF_ATTRIBUTE,
    }
}

// ---------------------------------------------------------------------------
// Read / write round trips
// ---------------------------------------------------------------------------

#[tokio::test]
async fn read_after_write_returns_the_written_value() {
    let pair = NodePair::connected(SessionParameters::default());
    let client = pair.client();

    let statuses = client
        .write(
            vec![AttributeData {
                data_version: None,
                path: on_off_path().into(),
                data: Value::Bool(true),
            }],
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].status, Status::Success);

    let (reports, _) = client
        .read(vec![on_off_path().into()], vec![], false, None)
        .await
        .unwrap();
    assert_eq!(reports.len(), 1);
    match &reports[0] {
        mtr_im::messages::AttributeReport::Data(data) => {
            assert_eq!(data.data, Value::Bool(true));
        }
        other => panic!("expected data report, got {other:?}"),
    }
}

#[tokio::test]
async fn repeated_writes_of_the_same_value_yield_identical_statuses() {
    let pair = NodePair::connected(SessionParameters::default());
    let client = pair.client();

    let write = vec![AttributeData {
        data_version: None,
        path: on_off_path().into(),
        data: Value::Bool(true),
    }];
    let first = client.write(write.clone(), None, None).await.unwrap();
    let second = client.write(write, None, None).await.unwrap();
    assert_eq!(first[0].status, second[0].status);
}

#[tokio::test]
async fn wildcard_endpoint_read_expands_to_existing_attributes() {
    let pair = NodePair::connected(SessionParameters::default());
    let client = pair.client();

    let (reports, _) = client
        .read(
            vec![AttributePath {
                endpoint: None,
                cluster: Some(ON_OFF_CLUSTER),
                attribute: Some(ON_OFF_ATTRIBUTE),
                list_index: None,
            }],
            vec![],
            false,
            None,
        )
        .await
        .unwrap();
    assert_eq!(reports.len(), 1, "only endpoint 1 carries on/off");
}

#[tokio::test]
async fn unknown_attribute_read_reports_a_path_status() {
    let pair = NodePair::connected(SessionParameters::default());
    let client = pair.client();

    let (reports, _) = client
        .read(
            vec![AttributePath::concrete(1, ON_OFF_CLUSTER, 0x4444)],
            vec![],
            false,
            None,
        )
        .await
        .unwrap();
    match &reports[0] {
        mtr_im::messages::AttributeReport::Status(status) => {
            assert_eq!(status.status, Status::UnsupportedAttribute);
        }
        other => panic!("expected status report, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// List write semantics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_add_without_prior_replace_is_busy_and_leaves_data_unchanged() {
    let pair = NodePair::connected(SessionParameters::default());
    let client = pair.client();

    let statuses = client
        .write(
            vec![AttributeData {
                data_version: None,
                path: AttributePath {
                    endpoint: Some(1),
                    cluster: Some(ON_OFF_CLUSTER),
                    attribute: Some(TEST_LIST_ATTRIBUTE),
                    list_index: Some(None),
                },
                data: Value::Unsigned(1),
            }],
            None,
            None,
        )
        .await
        .unwrap();

    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].status, Status::Busy);
    let list = pair
        .b
        .data_model
        .attribute(&ConcreteAttributePath {
            endpoint: 1,
            cluster: ON_OFF_CLUSTER,
            attribute: TEST_LIST_ATTRIBUTE,
        })
        .unwrap();
    assert_eq!(list, Value::Array(vec![]), "data model unchanged");
}

#[tokio::test]
async fn list_add_immediately_after_replace_all_succeeds() {
    let pair = NodePair::connected(SessionParameters::default());
    let client = pair.client();

    let list_path = |list_index| AttributePath {
        endpoint: Some(1),
        cluster: Some(ON_OFF_CLUSTER),
        attribute: Some(TEST_LIST_ATTRIBUTE),
        list_index,
    };
    let statuses = client
        .write(
            vec![
                AttributeData {
                    data_version: None,
                    path: list_path(None),
                    data: Value::Array(vec![Value::Unsigned(7)]),
                },
                AttributeData {
                    data_version: None,
                    path: list_path(Some(None)),
                    data: Value::Unsigned(8),
                },
            ],
            None,
            None,
        )
        .await
        .unwrap();

    assert_eq!(statuses.len(), 2);
    assert!(statuses.iter().all(|s| s.status == Status::Success));
    let list = pair
        .b
        .data_model
        .attribute(&ConcreteAttributePath {
            endpoint: 1,
            cluster: ON_OFF_CLUSTER,
            attribute: TEST_LIST_ATTRIBUTE,
        })
        .unwrap();
    assert_eq!(
        list,
        Value::Array(vec![Value::Unsigned(7), Value::Unsigned(8)])
    );
}

// ---------------------------------------------------------------------------
// Invoke routing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn batched_invokes_resolve_to_their_callers() {
    let pair = NodePair::connected(batching_params());
    let client = pair.client();

    // Back-to-back single-command invokes on a batching peer.
    let c_on = client.clone();
    let on = tokio::spawn(async move {
        c_on.invoke(
            vec![CommandRequest {
                path: CommandPath::new(1, ON_OFF_CLUSTER, 1),
                fields: None,
            }],
            None,
            None,
        )
        .await
    });
    let c_off = client.clone();
    let off = tokio::spawn(async move {
        c_off
            .invoke(
                vec![CommandRequest {
                    path: CommandPath::new(1, ON_OFF_CLUSTER, 0),
                    fields: None,
                }],
                None,
                None,
            )
            .await
    });

    let on = on.await.unwrap().unwrap();
    let off = off.await.unwrap().unwrap();
    assert_eq!(on.len(), 1);
    assert_eq!(off.len(), 1);
    assert_eq!(on[0].path, CommandPath::new(1, ON_OFF_CLUSTER, 1));
    assert_eq!(off[0].path, CommandPath::new(1, ON_OFF_CLUSTER, 0));
    assert_eq!(on[0].status, Status::Success);
    assert_eq!(off[0].status, Status::Success);

    let invoked = pair.b.data_model.invoked.lock().unwrap().clone();
    assert_eq!(invoked.len(), 2, "both commands reached the data model");
}

#[tokio::test]
async fn echo_command_round_trips_fields_through_the_batcher() {
    let pair = NodePair::connected(batching_params());
    let client = pair.client();

    let fields = Value::Structure(vec![(mtr_tlv::Tag::Context(0), Value::Unsigned(99))]);
    let responses = client
        .invoke(
            vec![CommandRequest {
                path: CommandPath::new(1, ECHO_CLUSTER, ECHO_COMMAND),
                fields: Some(fields.clone()),
            }],
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].fields.as_ref(), Some(&fields));
}

#[tokio::test]
async fn over_limit_invoke_splits_into_parallel_exchanges() {
    let pair = NodePair::connected(batching_params());
    let client = pair.client();

    // Five commands against a limit of four: two exchanges.
    let commands: Vec<CommandRequest> = (0..5)
        .map(|i| CommandRequest {
            path: CommandPath::new(1, ECHO_CLUSTER, ECHO_COMMAND),
            fields: Some(Value::Unsigned(i)),
        })
        .collect();
    let responses = client.invoke(commands, None, None).await.unwrap();
    assert_eq!(responses.len(), 5);
    let invoked = pair.b.data_model.invoked.lock().unwrap().clone();
    assert_eq!(invoked.len(), 5);
}

#[tokio::test]
async fn single_invoke_to_the_root_endpoint_bypasses_the_batcher() {
    let pair = NodePair::connected(batching_params());
    let client = pair.client();

    // Endpoint 0 commands go out immediately even on a batching peer.
    let responses = client
        .invoke(
            vec![CommandRequest {
                path: CommandPath::new(0, ECHO_CLUSTER, ECHO_COMMAND),
                fields: Some(Value::Unsigned(5)),
            }],
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].fields, Some(Value::Unsigned(5)));
    assert_eq!(
        responses[0].command_ref, None,
        "single direct invoke elides the wire commandRef"
    );
}

#[tokio::test]
async fn exactly_at_limit_stays_in_one_exchange() {
    let pair = NodePair::connected(batching_params());
    let client = pair.client();

    let commands: Vec<CommandRequest> = (0..4)
        .map(|i| CommandRequest {
            path: CommandPath::new(1, ECHO_CLUSTER, i),
            fields: None,
        })
        .collect();
    // Commands 1..4 are unsupported; only command 0 echoes. All four get
    // a routed response either way.
    let responses = client.invoke(commands, None, None).await.unwrap();
    assert_eq!(responses.len(), 4);
}

// ---------------------------------------------------------------------------
// Timed interactions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn timed_write_inside_the_window_succeeds() {
    let pair = NodePair::connected(SessionParameters::default());
    let client = pair.client();

    let statuses = client
        .write(
            vec![AttributeData {
                data_version: None,
                path: on_off_path().into(),
                data: Value::Bool(true),
            }],
            Some(Duration::from_secs(5)),
            None,
        )
        .await
        .unwrap();
    assert_eq!(statuses[0].status, Status::Success);
}

#[tokio::test]
async fn write_flagged_timed_without_a_timed_request_is_a_mismatch() {
    let pair = NodePair::connected(SessionParameters::default());

    let mut exchange = pair
        .a
        .manager
        .initiate(NodePair::peer_b(), mtr_proto::PROTOCOL_ID_INTERACTION_MODEL)
        .unwrap();
    let request = WriteRequestMessage {
        suppress_response: false,
        timed_request: true,
        write_requests: vec![AttributeData {
            data_version: None,
            path: on_off_path().into(),
            data: Value::Bool(true),
        }],
        more_chunked_messages: false,
        interaction_model_revision: None,
    };
    exchange
        .send(ImOpcode::WriteRequest as u8, &request.encode().unwrap())
        .await
        .unwrap();

    let reply = exchange.next().await.unwrap();
    assert_eq!(reply.message_type, ImOpcode::StatusResponse as u8);
    let status = StatusResponseMessage::decode(&reply.payload).unwrap().status;
    assert_eq!(status, Status::TimedRequestMismatch);
    exchange.close().await;
}

// ---------------------------------------------------------------------------
// Abort tokens
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancelled_token_aborts_before_any_wire_traffic() {
    let pair = NodePair::connected(SessionParameters::default());
    let client = pair.client();

    let token = tokio_util::sync::CancellationToken::new();
    token.cancel();
    let result = client
        .read(vec![on_off_path().into()], vec![], false, Some(&token))
        .await;
    assert!(matches!(result, Err(mtr_im::InteractionError::Aborted)));
    assert!(pair.b.data_model.invoked.lock().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Read splitting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn read_with_many_paths_splits_and_merges() {
    let pair = NodePair::connected(SessionParameters::default());
    let client = pair.client();

    // 11 paths with a budget of 9: two exchanges, all results merged.
    let mut paths = Vec::new();
    for _ in 0..11 {
        paths.push(AttributePath::from(on_off_path()));
    }
    let (reports, _) = client.read(paths, vec![], false, None).await.unwrap();
    assert_eq!(reports.len(), 11);
}

// ---------------------------------------------------------------------------
// Write under packet loss (MRP retransmission)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn write_survives_a_dropped_request_packet() {
    let pair = NodePair::connected(SessionParameters::default());
    let client = pair.client();

    // First transmission of the next A->B packet vanishes; MRP retries.
    pair.a_to_b_faults.drop_next();
    let statuses = client
        .write(
            vec![AttributeData {
                data_version: None,
                path: on_off_path().into(),
                data: Value::Bool(true),
            }],
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(statuses[0].status, Status::Success);
}

#[tokio::test]
async fn duplicated_request_packet_is_applied_once() {
    let pair = NodePair::connected(batching_params());
    let client = pair.client();

    pair.a_to_b_faults.duplicate_next();
    let responses = client
        .invoke(
            vec![
                CommandRequest {
                    path: CommandPath::new(1, ON_OFF_CLUSTER, 1),
                    fields: None,
                },
                CommandRequest {
                    path: CommandPath::new(1, ON_OFF_CLUSTER, 0),
                    fields: None,
                },
            ],
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(responses.len(), 2);
    let invoked = pair.b.data_model.invoked.lock().unwrap().clone();
    assert_eq!(invoked.len(), 2, "duplicate delivery must not re-invoke");
}
