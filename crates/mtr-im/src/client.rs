//! Client-side Interaction Model verbs.
//!
//! The client owns an exchange factory bound to one peer. Reads split over
//! the per-request path budget, invokes route through the batcher when the
//! peer supports it, and subscriptions come in one-shot and sustained
//! flavors. Every verb honors an optional cancellation token at its
//! suspension points.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mtr_exchange::{ExchangeManager, PeerAddress};
use mtr_proto::{ImOpcode, PROTOCOL_ID_INTERACTION_MODEL, Status};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::InteractionConfig;
use crate::batcher::{CommandBatcher, InvokeSink};
use crate::error::InteractionError;
use crate::messages::{
    AttributeData, AttributeReport, AttributeStatus, CommandData, DataReportMessage, EventReport,
    InvokeRequestMessage, InvokeResponseEntry, InvokeResponseMessage, ReadRequestMessage,
    StatusResponseMessage, SubscribeRequestMessage, SubscribeResponseMessage, TimedRequestMessage,
    WriteRequestMessage, WriteResponseMessage,
};
use crate::path::{AttributePath, CommandPath, EventPath};
use crate::server::ImMessenger;

// ---------------------------------------------------------------------------
// Requests / responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub path: CommandPath,
    pub fields: Option<mtr_tlv::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    pub path: CommandPath,
    pub fields: Option<mtr_tlv::Value>,
    pub status: Status,
    pub command_ref: Option<u16>,
}

fn check_abort(abort: Option<&CancellationToken>) -> Result<(), InteractionError> {
    if abort.is_some_and(CancellationToken::is_cancelled) {
        Err(InteractionError::Aborted)
    } else {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Client subscription registry
// ---------------------------------------------------------------------------

/// Routes unsolicited `ReportData` (pushed by publishers) to the local
/// subscription that owns the subscription id.
#[derive(Default)]
pub struct ClientSubscriptions {
    routes: Mutex<HashMap<u32, mpsc::Sender<DataReportMessage>>>,
}

impl ClientSubscriptions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver a pushed report. Returns false when the id is unknown, in
    /// which case the caller answers `InvalidSubscription`.
    pub(crate) async fn deliver(&self, subscription_id: u32, report: DataReportMessage) -> bool {
        let route = {
            let routes = self.routes.lock().expect("routes lock");
            routes.get(&subscription_id).cloned()
        };
        match route {
            Some(tx) => tx.send(report).await.is_ok(),
            None => false,
        }
    }

    /// Attach a route for a known subscription id. Used internally when a
    /// subscribe completes, and by embedders re-attaching to a publisher
    /// that re-establishes a persisted subscription after its restart.
    pub fn register(&self, subscription_id: u32) -> mpsc::Receiver<DataReportMessage> {
        let (tx, rx) = mpsc::channel(8);
        self.routes
            .lock()
            .expect("routes lock")
            .insert(subscription_id, tx);
        rx
    }

    pub fn unregister(&self, subscription_id: u32) {
        self.routes
            .lock()
            .expect("routes lock")
            .remove(&subscription_id);
    }
}

/// A live client-side subscription: pushed reports appear on `reports`;
/// the channel closes when the subscription dies (or, in sustained mode,
/// only when retries are abandoned or the handle is cancelled).
pub struct ClientSubscription {
    subscription_id: u32,
    pub reports: mpsc::Receiver<DataReportMessage>,
    cancel: CancellationToken,
}

impl ClientSubscription {
    pub fn subscription_id(&self) -> u32 {
        self.subscription_id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ClientSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeMode {
    /// Close on peer loss.
    Once,
    /// Re-subscribe on loss with exponential backoff.
    Sustain,
}

// ---------------------------------------------------------------------------
// InteractionClient
// ---------------------------------------------------------------------------

pub struct InteractionClient {
    manager: ExchangeManager,
    peer: PeerAddress,
    config: InteractionConfig,
    subscriptions: Arc<ClientSubscriptions>,
    batcher: CommandBatcher,
}

impl InteractionClient {
    pub fn new(
        manager: ExchangeManager,
        peer: PeerAddress,
        config: InteractionConfig,
        subscriptions: Arc<ClientSubscriptions>,
    ) -> Arc<Self> {
        let invoker = Arc::new(DirectInvoker {
            manager: manager.clone(),
            peer,
            config: config.clone(),
        });
        let batcher = CommandBatcher::new(invoker);
        Arc::new(InteractionClient {
            manager,
            peer,
            config,
            subscriptions,
            batcher,
        })
    }

    pub fn peer(&self) -> PeerAddress {
        self.peer
    }

    pub fn batcher(&self) -> &CommandBatcher {
        &self.batcher
    }

    fn messenger(&self) -> Result<ImMessenger, InteractionError> {
        let exchange = self
            .manager
            .initiate(self.peer, PROTOCOL_ID_INTERACTION_MODEL)?;
        Ok(ImMessenger::new(
            exchange,
            self.config.peer_response_timeout,
        ))
    }

    /// The peer's advertised invoke batching limit.
    fn peer_invoke_limit(&self) -> usize {
        self.manager
            .sessions()
            .session_for_peer(&self.peer)
            .map_or(1, |s| usize::from(s.params().max_paths_per_invoke).max(1))
    }

    // -----------------------------------------------------------------------
    // Read
    // -----------------------------------------------------------------------

    /// Read attributes and events, transparently splitting into multiple
    /// exchanges when the path count exceeds the per-request budget.
    pub async fn read(
        &self,
        attribute_requests: Vec<AttributePath>,
        event_requests: Vec<EventPath>,
        fabric_filtered: bool,
        abort: Option<&CancellationToken>,
    ) -> Result<(Vec<AttributeReport>, Vec<EventReport>), InteractionError> {
        let budget = self.config.read_path_budget.max(1);
        let mut attribute_reports = Vec::new();
        let mut event_reports = Vec::new();

        let mut first = true;
        let mut attr_groups: Vec<Vec<AttributePath>> = attribute_requests
            .chunks(budget)
            .map(<[AttributePath]>::to_vec)
            .collect();
        if attr_groups.is_empty() {
            attr_groups.push(Vec::new());
        }
        for group in attr_groups {
            check_abort(abort)?;
            let events = if first {
                event_requests.clone()
            } else {
                Vec::new()
            };
            first = false;
            if group.is_empty() && events.is_empty() {
                continue;
            }
            let (mut attrs, mut events) = self
                .read_once(group, events, fabric_filtered, abort)
                .await?;
            attribute_reports.append(&mut attrs);
            event_reports.append(&mut events);
        }
        Ok((attribute_reports, event_reports))
    }

    async fn read_once(
        &self,
        attribute_requests: Vec<AttributePath>,
        event_requests: Vec<EventPath>,
        fabric_filtered: bool,
        abort: Option<&CancellationToken>,
    ) -> Result<(Vec<AttributeReport>, Vec<EventReport>), InteractionError> {
        check_abort(abort)?;
        let mut m = self.messenger()?;
        let request = ReadRequestMessage {
            attribute_requests,
            event_requests,
            fabric_filtered,
            interaction_model_revision: None,
        };
        m.send(ImOpcode::ReadRequest, &request.encode()?).await?;

        let mut attribute_reports = Vec::new();
        let mut event_reports = Vec::new();
        loop {
            check_abort(abort)?;
            let (opcode, payload) = m.next().await?;
            match opcode {
                ImOpcode::ReportData => {
                    let mut report = DataReportMessage::decode(&payload)?;
                    attribute_reports.append(&mut report.attribute_reports);
                    event_reports.append(&mut report.event_reports);
                    if report.more_chunked_messages {
                        m.send_status(Status::Success).await?;
                        continue;
                    }
                    if !report.suppress_response {
                        m.send_status(Status::Success).await?;
                    }
                    break;
                }
                ImOpcode::StatusResponse => {
                    let status = StatusResponseMessage::decode(&payload)?.status;
                    m.close().await;
                    return Err(InteractionError::PeerStatus(status));
                }
                other => {
                    m.close().await;
                    return Err(InteractionError::UnexpectedMessage(other as u8));
                }
            }
        }
        m.close().await;
        Ok((attribute_reports, event_reports))
    }

    // -----------------------------------------------------------------------
    // Write
    // -----------------------------------------------------------------------

    pub async fn write(
        &self,
        writes: Vec<AttributeData>,
        timed: Option<Duration>,
        abort: Option<&CancellationToken>,
    ) -> Result<Vec<AttributeStatus>, InteractionError> {
        check_abort(abort)?;
        let exchange = self
            .manager
            .initiate(self.peer, PROTOCOL_ID_INTERACTION_MODEL)?;
        // A timed write usually guards a fail-safe-armed flow; give the
        // peer the extended response window.
        let response_timeout = if timed.is_some() {
            self.config
                .failsafe_response_timeout
                .max(self.config.peer_response_timeout)
        } else {
            self.config.peer_response_timeout
        };
        let mut m = ImMessenger::new(exchange, response_timeout);
        if let Some(timeout) = timed {
            let request = TimedRequestMessage {
                timeout_ms: timeout.as_millis().min(u128::from(u16::MAX)) as u16,
            };
            m.send(ImOpcode::TimedRequest, &request.encode()?).await?;
            m.expect_status_success().await?;
            check_abort(abort)?;
        }
        let request = WriteRequestMessage {
            suppress_response: false,
            timed_request: timed.is_some(),
            write_requests: writes,
            more_chunked_messages: false,
            interaction_model_revision: None,
        };
        m.send(ImOpcode::WriteRequest, &request.encode()?).await?;

        let (opcode, payload) = m.next().await?;
        let result = match opcode {
            ImOpcode::WriteResponse => Ok(WriteResponseMessage::decode(&payload)?.write_responses),
            ImOpcode::StatusResponse => {
                let status = StatusResponseMessage::decode(&payload)?.status;
                Err(InteractionError::PeerStatus(status))
            }
            other => Err(InteractionError::UnexpectedMessage(other as u8)),
        };
        m.close().await;
        result
    }

    // -----------------------------------------------------------------------
    // Invoke
    // -----------------------------------------------------------------------

    /// Route an invoke: over-limit requests split into parallel exchanges,
    /// single batchable commands coalesce in the batcher, everything else
    /// goes straight out.
    pub async fn invoke(
        &self,
        mut commands: Vec<CommandRequest>,
        timed: Option<Duration>,
        abort: Option<&CancellationToken>,
    ) -> Result<Vec<CommandResponse>, InteractionError> {
        check_abort(abort)?;
        let limit = self.peer_invoke_limit();

        if commands.len() > limit {
            // Parallel exchanges, merged in completion order.
            let mut join = JoinSet::new();
            for chunk in commands.chunks(limit) {
                let invoker = DirectInvoker {
                    manager: self.manager.clone(),
                    peer: self.peer,
                    config: self.config.clone(),
                };
                let chunk = chunk.to_vec();
                join.spawn(async move { invoker.invoke_now(chunk, None, None).await });
            }
            let mut merged = Vec::new();
            while let Some(result) = join.join_next().await {
                check_abort(abort)?;
                let responses =
                    result.map_err(|_| InteractionError::BatcherClosed)??;
                merged.extend(responses);
            }
            return Ok(merged);
        }

        if commands.len() == 1
            && commands[0].path.endpoint != 0
            && timed.is_none()
            && limit > 1
        {
            let command = commands.pop().expect("length checked");
            let response = self.batcher.enqueue(command, Duration::ZERO).await?;
            return Ok(response.into_iter().collect());
        }

        let invoker = DirectInvoker {
            manager: self.manager.clone(),
            peer: self.peer,
            config: self.config.clone(),
        };
        invoker.invoke_now(commands, timed, None).await
    }

    // -----------------------------------------------------------------------
    // Subscribe
    // -----------------------------------------------------------------------

    pub async fn subscribe(
        self: &Arc<Self>,
        request: SubscribeRequestMessage,
        mode: SubscribeMode,
        abort: Option<&CancellationToken>,
    ) -> Result<ClientSubscription, InteractionError> {
        check_abort(abort)?;
        let established = self.subscribe_once(&request, abort).await?;
        let cancel = abort.map_or_else(CancellationToken::new, CancellationToken::child_token);

        let (user_tx, user_rx) = mpsc::channel(8);
        let registry_rx = self.subscriptions.register(established.subscription_id);

        // Push the primed reports to the consumer before any live ones.
        for report in &established.primed {
            let _ = user_tx.send(report.clone()).await;
        }

        let client = self.clone();
        let token = cancel.clone();
        let initial_id = established.subscription_id;
        tokio::spawn(async move {
            client
                .run_client_subscription(established, request, mode, user_tx, registry_rx, token)
                .await;
        });

        Ok(ClientSubscription {
            subscription_id: initial_id,
            reports: user_rx,
            cancel,
        })
    }

    async fn subscribe_once(
        &self,
        request: &SubscribeRequestMessage,
        abort: Option<&CancellationToken>,
    ) -> Result<EstablishedSubscription, InteractionError> {
        let mut m = self.messenger()?;
        m.send(ImOpcode::SubscribeRequest, &request.encode()?)
            .await?;
        let mut primed = Vec::new();
        let established = loop {
            check_abort(abort)?;
            let (opcode, payload) = m.next().await?;
            match opcode {
                ImOpcode::ReportData => {
                    let report = DataReportMessage::decode(&payload)?;
                    let suppress = report.suppress_response;
                    primed.push(report);
                    if !suppress {
                        m.send_status(Status::Success).await?;
                    }
                }
                ImOpcode::SubscribeResponse => {
                    let response = SubscribeResponseMessage::decode(&payload)?;
                    break EstablishedSubscription {
                        subscription_id: response.subscription_id,
                        max_interval: Duration::from_secs(u64::from(
                            response.max_interval_seconds,
                        )),
                        primed,
                    };
                }
                ImOpcode::StatusResponse => {
                    let status = StatusResponseMessage::decode(&payload)?.status;
                    m.close().await;
                    return Err(InteractionError::PeerStatus(status));
                }
                other => {
                    m.close().await;
                    return Err(InteractionError::UnexpectedMessage(other as u8));
                }
            }
        };
        m.close().await;
        info!(
            subscription_id = established.subscription_id,
            peer = %self.peer,
            max_interval_s = established.max_interval.as_secs(),
            "client subscription established"
        );
        Ok(established)
    }

    /// Liveness + (for sustained subscriptions) re-establishment loop.
    async fn run_client_subscription(
        self: Arc<Self>,
        mut established: EstablishedSubscription,
        request: SubscribeRequestMessage,
        mode: SubscribeMode,
        user_tx: mpsc::Sender<DataReportMessage>,
        mut registry_rx: mpsc::Receiver<DataReportMessage>,
        token: CancellationToken,
    ) {
        'outer: loop {
            let timeout = established.max_interval + self.config.peer_response_timeout;
            let mut deadline = Instant::now() + timeout;
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        self.subscriptions.unregister(established.subscription_id);
                        break 'outer;
                    }
                    report = registry_rx.recv() => match report {
                        Some(report) => {
                            deadline = Instant::now() + timeout;
                            if user_tx.send(report).await.is_err() {
                                // Consumer dropped the handle.
                                self.subscriptions.unregister(established.subscription_id);
                                break 'outer;
                            }
                        }
                        None => break,
                    },
                    _ = tokio::time::sleep_until(deadline) => {
                        warn!(
                            subscription_id = established.subscription_id,
                            "subscription liveness window missed"
                        );
                        break;
                    }
                }
            }

            self.subscriptions
                .unregister(established.subscription_id);
            match mode {
                SubscribeMode::Once => break,
                SubscribeMode::Sustain => {
                    match self.resubscribe_with_backoff(&request, &token).await {
                        Some(next) => {
                            registry_rx = self.subscriptions.register(next.subscription_id);
                            for report in &next.primed {
                                if user_tx.send(report.clone()).await.is_err() {
                                    self.subscriptions.unregister(next.subscription_id);
                                    break 'outer;
                                }
                            }
                            established = next;
                        }
                        None => break,
                    }
                }
            }
        }
        debug!("client subscription task ended");
    }

    /// Exponential backoff with jitter until the peer accepts again or the
    /// caller cancels.
    async fn resubscribe_with_backoff(
        &self,
        request: &SubscribeRequestMessage,
        token: &CancellationToken,
    ) -> Option<EstablishedSubscription> {
        let mut delay = Duration::from_secs(2);
        let cap = Duration::from_secs(600);
        loop {
            let jittered = delay.mul_f64(1.0 + rand::random::<f64>() * 0.25);
            tokio::select! {
                _ = token.cancelled() => return None,
                _ = tokio::time::sleep(jittered) => {}
            }
            match self.subscribe_once(request, None).await {
                Ok(established) => {
                    info!(
                        subscription_id = established.subscription_id,
                        "sustained subscription re-established"
                    );
                    return Some(established);
                }
                Err(e) => {
                    debug!(error = %e, next_delay_s = delay.as_secs(), "re-subscribe failed");
                    delay = (delay * 2).min(cap);
                }
            }
        }
    }
}

struct EstablishedSubscription {
    subscription_id: u32,
    max_interval: Duration,
    primed: Vec<DataReportMessage>,
}

// ---------------------------------------------------------------------------
// Direct (non-batched) invoke
// ---------------------------------------------------------------------------

/// Owns the wire mechanics of one invoke exchange; shared by the client
/// and the batcher.
pub(crate) struct DirectInvoker {
    pub(crate) manager: ExchangeManager,
    pub(crate) peer: PeerAddress,
    pub(crate) config: InteractionConfig,
}

impl DirectInvoker {
    /// Send one invoke request. `refs` assigns commandRefs (batcher);
    /// `None` auto-assigns positional refs. The `commandRef` field is
    /// elided on the wire when only one command is carried, matching
    /// deployed peers.
    pub(crate) async fn invoke_now(
        &self,
        commands: Vec<CommandRequest>,
        timed: Option<Duration>,
        refs: Option<Vec<u16>>,
    ) -> Result<Vec<CommandResponse>, InteractionError> {
        let include_refs = commands.len() > 1;
        let invoke_requests: Vec<CommandData> = commands
            .iter()
            .enumerate()
            .map(|(i, command)| CommandData {
                path: command.path,
                fields: command.fields.clone(),
                command_ref: include_refs.then(|| {
                    refs.as_ref().map_or(i as u16, |r| r[i])
                }),
            })
            .collect();

        let exchange = self
            .manager
            .initiate(self.peer, PROTOCOL_ID_INTERACTION_MODEL)?;
        let response_timeout = if timed.is_some() {
            self.config
                .failsafe_response_timeout
                .max(self.config.peer_response_timeout)
        } else {
            self.config.peer_response_timeout
        };
        let mut m = ImMessenger::new(exchange, response_timeout);

        if let Some(timeout) = timed {
            let request = TimedRequestMessage {
                timeout_ms: timeout.as_millis().min(u128::from(u16::MAX)) as u16,
            };
            m.send(ImOpcode::TimedRequest, &request.encode()?).await?;
            m.expect_status_success().await?;
        }

        let request = InvokeRequestMessage {
            suppress_response: false,
            timed_request: timed.is_some(),
            invoke_requests,
            interaction_model_revision: None,
        };
        m.send(ImOpcode::InvokeRequest, &request.encode()?).await?;

        let mut responses = Vec::new();
        loop {
            let (opcode, payload) = m.next().await?;
            match opcode {
                ImOpcode::InvokeResponse => {
                    let message = InvokeResponseMessage::decode(&payload)?;
                    for entry in message.invoke_responses {
                        responses.push(match entry {
                            InvokeResponseEntry::Command(data) => CommandResponse {
                                path: data.path,
                                fields: data.fields,
                                status: Status::Success,
                                command_ref: data.command_ref,
                            },
                            InvokeResponseEntry::Status(status) => CommandResponse {
                                path: status.path,
                                fields: None,
                                status: status.status,
                                command_ref: status.command_ref,
                            },
                        });
                    }
                    if message.more_chunked_messages {
                        m.send_status(Status::Success).await?;
                        continue;
                    }
                    break;
                }
                ImOpcode::StatusResponse => {
                    let status = StatusResponseMessage::decode(&payload)?.status;
                    m.close().await;
                    return Err(InteractionError::PeerStatus(status));
                }
                other => {
                    m.close().await;
                    return Err(InteractionError::UnexpectedMessage(other as u8));
                }
            }
        }
        m.close().await;
        Ok(responses)
    }
}

#[async_trait::async_trait]
impl InvokeSink for DirectInvoker {
    fn max_paths_per_invoke(&self) -> u16 {
        self.manager
            .sessions()
            .session_for_peer(&self.peer)
            .map_or(1, |s| s.params().max_paths_per_invoke.max(1))
    }

    async fn invoke(
        &self,
        commands: Vec<CommandRequest>,
        refs: Vec<u16>,
    ) -> Result<Vec<CommandResponse>, InteractionError> {
        self.invoke_now(commands, None, Some(refs)).await
    }
}
