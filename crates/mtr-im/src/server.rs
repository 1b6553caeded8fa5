//! Server-side Interaction Model: one request interaction per exchange.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use mtr_exchange::{Exchange, ProtocolHandler};
use mtr_proto::{ImOpcode, PROTOCOL_ID_INTERACTION_MODEL, Status};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::InteractionConfig;
use crate::client::ClientSubscriptions;
use crate::data_model::{
    AccessControl, DataModel, SubjectDescriptor, WriteItem, WriteOp,
};
use crate::error::InteractionError;
use crate::messages::{
    AttributeData, AttributeReport, AttributeStatus, CommandData, CommandStatus,
    DataReportMessage, EventReport, InvokeRequestMessage, InvokeResponseEntry,
    InvokeResponseMessage, ReadRequestMessage, StatusResponseMessage, SubscribeRequestMessage,
    SubscribeResponseMessage, TimedRequestMessage, WriteRequestMessage, WriteResponseMessage,
};
use crate::path::{AttributePath, ConcreteAttributePath, EventPath, is_global_attribute};
use crate::subscription::{SubscriptionEngine, SubscriptionSeed};

/// Conservative byte cost of the ReportData envelope around the report
/// entry arrays (subscription id, flags, revision, containers).
const REPORT_ENVELOPE_OVERHEAD: usize = 48;

// ---------------------------------------------------------------------------
// Messenger
// ---------------------------------------------------------------------------

/// Framing helper for one IM interaction on one exchange.
pub(crate) struct ImMessenger {
    exchange: Exchange,
    response_timeout: std::time::Duration,
}

impl ImMessenger {
    pub(crate) fn new(exchange: Exchange, response_timeout: std::time::Duration) -> Self {
        ImMessenger {
            exchange,
            response_timeout,
        }
    }

    pub(crate) fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    pub(crate) fn exchange_mut(&mut self) -> &mut Exchange {
        &mut self.exchange
    }

    pub(crate) async fn next(&mut self) -> Result<(ImOpcode, Bytes), InteractionError> {
        let message = self.exchange.next().await?;
        match ImOpcode::from_u8(message.message_type) {
            Some(opcode) => Ok((opcode, message.payload)),
            None => Err(InteractionError::UnexpectedMessage(message.message_type)),
        }
    }

    async fn next_within_timeout(&mut self) -> Result<(ImOpcode, Bytes), InteractionError> {
        let limit = self.response_timeout;
        let message = self.exchange.next_within(limit).await?;
        match ImOpcode::from_u8(message.message_type) {
            Some(opcode) => Ok((opcode, message.payload)),
            None => Err(InteractionError::UnexpectedMessage(message.message_type)),
        }
    }

    pub(crate) async fn send(
        &mut self,
        opcode: ImOpcode,
        payload: &[u8],
    ) -> Result<(), InteractionError> {
        self.exchange.send(opcode as u8, payload).await?;
        Ok(())
    }

    pub(crate) async fn send_status(&mut self, status: Status) -> Result<(), InteractionError> {
        let payload = StatusResponseMessage::new(status).encode()?;
        self.send(ImOpcode::StatusResponse, &payload).await
    }

    /// Wait for the peer's StatusResponse between chunks; any non-success
    /// status aborts the stream.
    pub(crate) async fn expect_status_success(&mut self) -> Result<(), InteractionError> {
        let (opcode, payload) = self.next_within_timeout().await?;
        match opcode {
            ImOpcode::StatusResponse => {
                let status = StatusResponseMessage::decode(&payload)?.status;
                if status.is_success() {
                    Ok(())
                } else {
                    Err(InteractionError::PeerStatus(status))
                }
            }
            other => Err(InteractionError::UnexpectedMessage(other as u8)),
        }
    }

    /// Stream report entries as chunked `ReportData` messages.
    ///
    /// Intermediate chunks carry `moreChunkedMessages` and wait for a
    /// StatusResponse. The final chunk either self-terminates
    /// (`suppressResponse`, plain reads) or waits for one more
    /// StatusResponse (subscription priming and pushed reports).
    pub(crate) async fn send_report_stream(
        &mut self,
        subscription_id: Option<u32>,
        attribute_reports: Vec<AttributeReport>,
        event_reports: Vec<EventReport>,
        final_expects_status: bool,
    ) -> Result<(), InteractionError> {
        let budget = self
            .exchange
            .max_payload_size()
            .saturating_sub(REPORT_ENVELOPE_OVERHEAD);

        // Greedy fill: an entry spills to the next chunk when its encoded
        // form would push the current chunk past the budget.
        let mut chunks: Vec<(Vec<AttributeReport>, Vec<EventReport>)> = vec![(vec![], vec![])];
        let mut used = 0usize;
        for report in attribute_reports {
            let len = report.encode_fragment()?.len();
            let current = chunks.last().expect("chunks never empty");
            if used + len > budget && !(current.0.is_empty() && current.1.is_empty()) {
                chunks.push((vec![], vec![]));
                used = 0;
            }
            chunks.last_mut().expect("chunks never empty").0.push(report);
            used += len;
        }
        for report in event_reports {
            let len = report.encode_fragment()?.len();
            let current = chunks.last().expect("chunks never empty");
            if used + len > budget && !(current.0.is_empty() && current.1.is_empty()) {
                chunks.push((vec![], vec![]));
                used = 0;
            }
            chunks.last_mut().expect("chunks never empty").1.push(report);
            used += len;
        }

        let last = chunks.len() - 1;
        for (i, (attrs, events)) in chunks.into_iter().enumerate() {
            let is_last = i == last;
            let message = DataReportMessage {
                subscription_id,
                attribute_reports: attrs,
                event_reports: events,
                more_chunked_messages: !is_last,
                suppress_response: is_last && !final_expects_status,
            };
            let payload = message.encode()?;
            self.send(ImOpcode::ReportData, &payload).await?;
            if !is_last || final_expects_status {
                self.expect_status_success().await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn close(self) {
        self.exchange.close().await;
    }
}

// ---------------------------------------------------------------------------
// InteractionServer
// ---------------------------------------------------------------------------

pub struct InteractionServer {
    dm: Arc<dyn DataModel>,
    acl: Arc<dyn AccessControl>,
    config: InteractionConfig,
    subscriptions: SubscriptionEngine,
    client_reports: Arc<ClientSubscriptions>,
}

impl InteractionServer {
    pub fn new(
        dm: Arc<dyn DataModel>,
        acl: Arc<dyn AccessControl>,
        config: InteractionConfig,
        subscriptions: SubscriptionEngine,
        client_reports: Arc<ClientSubscriptions>,
    ) -> Arc<Self> {
        Arc::new(InteractionServer {
            dm,
            acl,
            config,
            subscriptions,
            client_reports,
        })
    }

    pub fn subscription_engine(&self) -> &SubscriptionEngine {
        &self.subscriptions
    }

    fn subject_of(exchange: &Exchange) -> SubjectDescriptor {
        SubjectDescriptor {
            peer: exchange.session().peer(),
            is_group: exchange.session().is_group(),
        }
    }

    // -----------------------------------------------------------------------
    // Interaction dispatch
    // -----------------------------------------------------------------------

    async fn serve(&self, exchange: Exchange) -> Result<(), InteractionError> {
        let mut m = ImMessenger::new(exchange, self.config.peer_response_timeout);
        loop {
            let (opcode, payload) = m.next().await?;
            match opcode {
                ImOpcode::TimedRequest => {
                    let request = TimedRequestMessage::decode(&payload)?;
                    let timeout = if request.timeout_ms == 0 {
                        self.config.timed_request_timeout
                    } else {
                        std::time::Duration::from_millis(u64::from(request.timeout_ms))
                    };
                    m.exchange_mut().set_timed_deadline(Instant::now() + timeout);
                    debug!(timeout_ms = timeout.as_millis() as u64, "timed interaction armed");
                    m.send_status(Status::Success).await?;
                    // The Write or Invoke follows on this same exchange.
                    continue;
                }
                ImOpcode::ReadRequest => {
                    self.handle_read(&mut m, &payload).await?;
                }
                ImOpcode::SubscribeRequest => {
                    self.handle_subscribe(&mut m, &payload).await?;
                }
                ImOpcode::WriteRequest => {
                    self.handle_write(&mut m, payload).await?;
                }
                ImOpcode::InvokeRequest => {
                    self.handle_invoke(&mut m, &payload).await?;
                }
                ImOpcode::ReportData => {
                    // Unsolicited report: data for one of our client-side
                    // subscriptions, or a stray publisher.
                    self.handle_unsolicited_report(&mut m, &payload).await?;
                }
                ImOpcode::StatusResponse => {
                    // Peer abandoned the interaction.
                    debug!("interaction ended by peer status");
                }
                other => {
                    warn!(opcode = other as u8, "request type not valid to start an interaction");
                    m.send_status(Status::InvalidAction).await?;
                }
            }
            break;
        }
        m.close().await;
        Ok(())
    }

    fn log_peer_revision(&self, revision: Option<u8>) {
        if let Some(revision) = revision {
            if revision > mtr_proto::INTERACTION_MODEL_REVISION {
                debug!(peer_revision = revision, "peer speaks a newer IM revision");
            }
        }
    }

    /// Enforce the timed-interaction preconditions shared by Write and
    /// Invoke. Consumes the armed window. Returns the status to answer
    /// with when the request is not acceptable.
    fn check_timed(exchange: &mut Exchange, timed_flag: bool) -> Result<bool, Status> {
        match exchange.timed_deadline() {
            Some(deadline) => {
                if Instant::now() > deadline {
                    exchange.clear_timed_deadline();
                    return Err(Status::Timeout);
                }
                if !timed_flag {
                    return Err(Status::TimedRequestMismatch);
                }
                exchange.clear_timed_deadline();
                Ok(true)
            }
            None => {
                if timed_flag {
                    Err(Status::TimedRequestMismatch)
                } else {
                    Ok(false)
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Read
    // -----------------------------------------------------------------------

    async fn handle_read(
        &self,
        m: &mut ImMessenger,
        payload: &[u8],
    ) -> Result<(), InteractionError> {
        let request = ReadRequestMessage::decode(payload)?;
        self.log_peer_revision(request.interaction_model_revision);
        if m.exchange().session().is_group() {
            // Reads are unicast-only.
            return m.send_status(Status::InvalidAction).await;
        }
        let subject = Self::subject_of(m.exchange());
        let fabric_filter = request
            .fabric_filtered
            .then_some(subject.peer.fabric_index);

        let attribute_reports = self
            .collect_attribute_reports(&request.attribute_requests, fabric_filter, &subject)
            .await;
        let event_reports = self.collect_event_reports(&request.event_requests).await;

        m.send_report_stream(None, attribute_reports, event_reports, false)
            .await
    }

    async fn collect_attribute_reports(
        &self,
        requests: &[AttributePath],
        fabric_filter: Option<u8>,
        subject: &SubjectDescriptor,
    ) -> Vec<AttributeReport> {
        let mut reports = Vec::new();
        for path in requests {
            // Wildcard cluster may only name globally defined attributes.
            if path.cluster.is_none()
                && path.attribute.is_some_and(|a| !is_global_attribute(a))
            {
                reports.push(AttributeReport::Status(AttributeStatus {
                    path: path.clone(),
                    status: Status::InvalidAction,
                }));
                continue;
            }
            let concretes = match self.dm.expand_attribute_path(path) {
                Ok(c) => c,
                Err(status) => {
                    reports.push(AttributeReport::Status(AttributeStatus {
                        path: path.clone(),
                        status,
                    }));
                    continue;
                }
            };
            for concrete in concretes {
                if !self.acl.allow_read(subject, &concrete) {
                    reports.push(AttributeReport::Status(AttributeStatus {
                        path: concrete.into(),
                        status: Status::UnsupportedAccess,
                    }));
                    continue;
                }
                match self.dm.read_attribute(&concrete, fabric_filter).await {
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

    async fn collect_event_reports(&self, requests: &[EventPath]) -> Vec<EventReport> {
        let mut reports = Vec::new();
        for path in requests {
            // Event reads never accept a wildcard cluster.
            if path.cluster.is_none() {
                reports.push(EventReport::Status {
                    path: path.clone(),
                    status: Status::InvalidAction,
                });
                continue;
            }
            let concretes = match self.dm.expand_event_path(path) {
                Ok(c) => c,
                Err(status) => {
                    reports.push(EventReport::Status {
                        path: path.clone(),
                        status,
                    });
                    continue;
                }
            };
            for concrete in concretes {
                for record in self.dm.read_events(&concrete, 0).await {
                    reports.push(EventReport::Data(crate::messages::EventData {
                        path: record.path,
                        event_number: record.event_number,
                        priority: record.priority,
                        data: record.data,
                    }));
                }
            }
        }
        reports
    }

    // -----------------------------------------------------------------------
    // Write
    // -----------------------------------------------------------------------

    async fn handle_write(
        &self,
        m: &mut ImMessenger,
        payload: Bytes,
    ) -> Result<(), InteractionError> {
        let mut request = WriteRequestMessage::decode(&payload)?;
        self.log_peer_revision(request.interaction_model_revision);

        let is_timed = match Self::check_timed(m.exchange_mut(), request.timed_request) {
            Ok(t) => t,
            Err(status) => return m.send_status(status).await,
        };
        let is_group = m.exchange().session().is_group();
        if is_timed && (is_group || request.more_chunked_messages) {
            // Timed writes are unicast and unchunked.
            return m.send_status(Status::InvalidAction).await;
        }
        let suppress = request.suppress_response || is_group;
        let subject = Self::subject_of(m.exchange());

        // List-ADD is valid only immediately after a successful REPLACE-ALL
        // of the same attribute; the tracker survives chunk boundaries.
        let mut replace_tracker: Option<ConcreteAttributePath> = None;
        let mut responses: Vec<AttributeStatus> = Vec::new();

        loop {
            self.process_write_chunk(&request, &subject, &mut replace_tracker, &mut responses)
                .await;

            if !request.more_chunked_messages {
                break;
            }
            m.send_status(Status::Success).await?;
            let (opcode, payload) = m.next().await?;
            if opcode != ImOpcode::WriteRequest {
                warn!(opcode = opcode as u8, "expected chunked WriteRequest continuation");
                return m.send_status(Status::InvalidAction).await;
            }
            request = WriteRequestMessage::decode(&payload)?;
        }

        if suppress {
            return Ok(());
        }
        let response = WriteResponseMessage {
            write_responses: responses,
        };
        m.send(ImOpcode::WriteResponse, &response.encode()?).await
    }

    async fn process_write_chunk(
        &self,
        request: &WriteRequestMessage,
        subject: &SubjectDescriptor,
        replace_tracker: &mut Option<ConcreteAttributePath>,
        responses: &mut Vec<AttributeStatus>,
    ) {
        let mut batch: Vec<WriteItem> = Vec::new();
        // responses index each batched item will fill after the flush
        let mut batch_slots: Vec<usize> = Vec::new();
        // batch index of the REPLACE that currently arms the tracker
        let mut armed_batch_index: Option<usize> = None;

        for data in &request.write_requests {
            let Some(concrete) = data.path.as_concrete() else {
                responses.push(AttributeStatus {
                    path: data.path.clone(),
                    status: Status::InvalidAction,
                });
                *replace_tracker = None;
                continue;
            };
            if !self.acl.allow_write(subject, &concrete) {
                responses.push(AttributeStatus {
                    path: data.path.clone(),
                    status: Status::UnsupportedAccess,
                });
                *replace_tracker = None;
                continue;
            }
            let op = match data.path.list_index {
                None => WriteOp::Replace,
                Some(None) => WriteOp::Append,
                Some(Some(index)) => WriteOp::Update(index),
            };
            match op {
                WriteOp::Append => {
                    if *replace_tracker != Some(concrete) {
                        // Standalone ADD with no preceding REPLACE-ALL.
                        responses.push(AttributeStatus {
                            path: data.path.clone(),
                            status: Status::Busy,
                        });
                        *replace_tracker = None;
                        continue;
                    }
                }
                WriteOp::Replace => {
                    *replace_tracker = Some(concrete);
                    armed_batch_index = Some(batch.len());
                }
                WriteOp::Update(_) => {
                    *replace_tracker = None;
                }
            }
            batch_slots.push(responses.len());
            responses.push(AttributeStatus {
                path: data.path.clone(),
                status: Status::Failure,
            });
            batch.push(WriteItem {
                path: concrete,
                op,
                value: data.data.clone(),
            });
        }

        if batch.is_empty() {
            return;
        }
        let results = self.dm.write_attributes(batch).await;
        for (slot, (_, status)) in batch_slots.iter().zip(results.iter()) {
            responses[*slot].status = *status;
        }
        // A failed REPLACE does not license a following ADD.
        if let Some(index) = armed_batch_index {
            if results.get(index).is_some_and(|(_, s)| !s.is_success()) {
                *replace_tracker = None;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Invoke
    // -----------------------------------------------------------------------

    async fn handle_invoke(
        &self,
        m: &mut ImMessenger,
        payload: &[u8],
    ) -> Result<(), InteractionError> {
        let request = InvokeRequestMessage::decode(payload)?;
        self.log_peer_revision(request.interaction_model_revision);

        if let Err(status) = Self::check_timed(m.exchange_mut(), request.timed_request) {
            return m.send_status(status).await;
        }
        if request.invoke_requests.len() > usize::from(self.config.max_paths_per_invoke) {
            return m.send_status(Status::InvalidAction).await;
        }
        let batched = request.invoke_requests.len() > 1;
        if batched {
            // Batched entries must carry distinct paths and commandRefs.
            let mut paths = HashSet::new();
            let mut refs = HashSet::new();
            for command in &request.invoke_requests {
                let Some(command_ref) = command.command_ref else {
                    return m.send_status(Status::InvalidAction).await;
                };
                if !paths.insert(command.path) || !refs.insert(command_ref) {
                    return m.send_status(Status::InvalidAction).await;
                }
            }
        }

        let subject = Self::subject_of(m.exchange());
        let mut entries: Vec<InvokeResponseEntry> = Vec::new();
        for command in &request.invoke_requests {
            if !self.acl.allow_invoke(&subject, &command.path) {
                entries.push(InvokeResponseEntry::Status(CommandStatus {
                    path: command.path,
                    status: Status::UnsupportedAccess,
                    command_ref: command.command_ref,
                }));
                continue;
            }
            let outcome = self
                .dm
                .invoke(&command.path, command.fields.clone(), &subject)
                .await;
            entries.push(match outcome {
                crate::data_model::InvokeOutcome::Response(fields) => {
                    InvokeResponseEntry::Command(CommandData {
                        path: command.path,
                        fields: Some(fields),
                        command_ref: command.command_ref,
                    })
                }
                crate::data_model::InvokeOutcome::Status(status) => {
                    InvokeResponseEntry::Status(CommandStatus {
                        path: command.path,
                        status,
                        command_ref: command.command_ref,
                    })
                }
            });
        }

        if m.exchange().session().is_group() || request.suppress_response {
            // Results are drained silently.
            return Ok(());
        }

        self.send_invoke_response_stream(m, entries).await
    }

    async fn send_invoke_response_stream(
        &self,
        m: &mut ImMessenger,
        entries: Vec<InvokeResponseEntry>,
    ) -> Result<(), InteractionError> {
        let budget = m
            .exchange()
            .max_payload_size()
            .saturating_sub(REPORT_ENVELOPE_OVERHEAD);
        let mut chunks: Vec<Vec<InvokeResponseEntry>> = vec![vec![]];
        let mut used = 0usize;
        for entry in entries {
            let len = entry.encode_fragment()?.len();
            if used + len > budget && !chunks.last().expect("nonempty").is_empty() {
                chunks.push(Vec::new());
                used = 0;
            }
            chunks.last_mut().expect("nonempty").push(entry);
            used += len;
        }
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let message = InvokeResponseMessage {
                suppress_response: false,
                invoke_responses: chunk,
                more_chunked_messages: i < last,
            };
            m.send(ImOpcode::InvokeResponse, &message.encode()?).await?;
            if i < last {
                m.expect_status_success().await?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Subscribe
    // -----------------------------------------------------------------------

    async fn handle_subscribe(
        &self,
        m: &mut ImMessenger,
        payload: &[u8],
    ) -> Result<(), InteractionError> {
        let request = SubscribeRequestMessage::decode(payload)?;
        self.log_peer_revision(request.interaction_model_revision);

        if m.exchange().session().is_group() {
            return m.send_status(Status::InvalidAction).await;
        }
        if request.max_interval_ceiling_seconds < request.min_interval_floor_seconds {
            return m.send_status(Status::InvalidAction).await;
        }

        let session = m.exchange().session().clone();
        let peer = session.peer();
        let subject = Self::subject_of(m.exchange());

        if !request.keep_subscriptions {
            self.subscriptions.cancel_peer(peer).await;
        }

        let Some(guard) = self.subscriptions.begin_establishment(peer) else {
            warn!(%peer, "subscribe while another establishment is in flight");
            return m.send_status(Status::Busy).await;
        };
        let subscription_id = self.subscriptions.allocate_id();
        info!(subscription_id, %peer, "subscription establishment started");

        let seed = SubscriptionSeed::negotiate(
            subscription_id,
            &request,
            self.config.default_min_interval_floor,
            self.config.subscription_max_interval_limit,
        );

        // Prime with an initial data report, identical to a Read response
        // except that the final chunk waits for the subscriber's status.
        let fabric_filter = request
            .fabric_filtered
            .then_some(peer.fabric_index);
        let attribute_reports = self
            .collect_attribute_reports(&request.attribute_requests, fabric_filter, &subject)
            .await;
        let event_reports = self.collect_event_reports(&request.event_requests).await;

        if let Err(e) = m
            .send_report_stream(
                Some(subscription_id),
                attribute_reports,
                event_reports,
                true,
            )
            .await
        {
            warn!(subscription_id, error = %e, "subscription priming failed");
            let _ = m.send_status(Status::Failure).await;
            drop(guard);
            return Ok(());
        }

        let response = SubscribeResponseMessage {
            subscription_id,
            max_interval_seconds: seed.max_interval.as_secs() as u16,
        };
        m.send(ImOpcode::SubscribeResponse, &response.encode()?)
            .await?;

        self.subscriptions.activate(seed, session, guard).await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Unsolicited reports (client-side subscriptions)
    // -----------------------------------------------------------------------

    async fn handle_unsolicited_report(
        &self,
        m: &mut ImMessenger,
        payload: &[u8],
    ) -> Result<(), InteractionError> {
        let mut report = DataReportMessage::decode(payload)?;
        loop {
            let known = match report.subscription_id {
                Some(id) => self.client_reports.deliver(id, report.clone()).await,
                None => false,
            };
            if !known {
                debug!(
                    subscription_id = report.subscription_id,
                    "report for unknown subscription"
                );
                return m.send_status(Status::InvalidSubscription).await;
            }
            let more = report.more_chunked_messages;
            if more || !report.suppress_response {
                m.send_status(Status::Success).await?;
            }
            if !more {
                return Ok(());
            }
            let (opcode, payload) = m.next().await?;
            if opcode != ImOpcode::ReportData {
                return Err(InteractionError::UnexpectedMessage(opcode as u8));
            }
            report = DataReportMessage::decode(&payload)?;
        }
    }
}

#[async_trait::async_trait]
impl ProtocolHandler for InteractionServer {
    fn protocol_id(&self) -> u16 {
        PROTOCOL_ID_INTERACTION_MODEL
    }

    fn requires_secure_session(&self) -> bool {
        !self.config.allow_unsecured_sessions
    }

    async fn on_new_exchange(
        &self,
        exchange: Exchange,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        match self.serve(exchange).await {
            Ok(()) => Ok(()),
            // Shutdown-flavored failures are expected teardown noise.
            Err(e) if e.is_shutdown() => {
                debug!(error = %e, "interaction ended by shutdown");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn on_close(&self) {
        self.subscriptions.close_all().await;
    }
}
