//! The data-model dispatch surface and access-control seam.
//!
//! Cluster implementations live behind [`DataModel`]; the interaction
//! server only routes paths, gates access, and frames responses.

use async_trait::async_trait;
use mtr_exchange::{FabricIndex, PeerAddress};
use mtr_proto::Status;
use mtr_tlv::Value;
use tokio::sync::broadcast;

use crate::path::{
    AttributePath, CommandPath, ConcreteAttributePath, ConcreteEventPath, EventPath,
};

/// Who is asking. Derived from the session carrying the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubjectDescriptor {
    pub peer: PeerAddress,
    pub is_group: bool,
}

/// A read result: the value plus its cluster data version.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeValue {
    pub data_version: u32,
    pub value: Value,
}

/// Which of the three write forms a request used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    /// Plain write, or whole-list replace for list attributes.
    Replace,
    /// List append (`listIndex` present and null).
    Append,
    /// Indexed list element write.
    Update(u16),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteItem {
    pub path: ConcreteAttributePath,
    pub op: WriteOp,
    pub value: Value,
}

/// Result of one command invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum InvokeOutcome {
    /// A response command with fields; echoed with the caller's commandRef.
    Response(Value),
    Status(Status),
}

/// Change notification fanned out to subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeChange {
    pub path: ConcreteAttributePath,
    /// Set for fabric-scoped data; lets fabric-filtered subscriptions skip
    /// foreign-fabric changes.
    pub fabric_index: Option<FabricIndex>,
}

/// A stored event, replayed into event reports.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub path: ConcreteEventPath,
    pub event_number: u64,
    pub priority: u8,
    pub data: Value,
}

#[async_trait]
pub trait DataModel: Send + Sync {
    /// Expand a request path to the concrete paths it covers. For a
    /// concrete path that does not exist, the error status names what is
    /// missing (endpoint, cluster, or attribute). Wildcards expand to only
    /// what exists, possibly nothing.
    fn expand_attribute_path(
        &self,
        path: &AttributePath,
    ) -> Result<Vec<ConcreteAttributePath>, Status>;

    fn expand_event_path(&self, path: &EventPath) -> Result<Vec<ConcreteEventPath>, Status>;

    async fn read_attribute(
        &self,
        path: &ConcreteAttributePath,
        fabric_filter: Option<FabricIndex>,
    ) -> Result<AttributeValue, Status>;

    async fn read_events(&self, path: &ConcreteEventPath, min_event_number: u64)
    -> Vec<EventRecord>;

    /// Apply a batch of validated writes; one status per item, in order.
    async fn write_attributes(
        &self,
        items: Vec<WriteItem>,
    ) -> Vec<(ConcreteAttributePath, Status)>;

    async fn invoke(
        &self,
        path: &CommandPath,
        fields: Option<Value>,
        subject: &SubjectDescriptor,
    ) -> InvokeOutcome;

    /// Subscribe to attribute-change notifications.
    fn changes(&self) -> broadcast::Receiver<AttributeChange>;
}

/// Access-control gate, consulted per concrete path.
pub trait AccessControl: Send + Sync {
    fn allow_read(&self, subject: &SubjectDescriptor, path: &ConcreteAttributePath) -> bool;
    fn allow_write(&self, subject: &SubjectDescriptor, path: &ConcreteAttributePath) -> bool;
    fn allow_invoke(&self, subject: &SubjectDescriptor, path: &CommandPath) -> bool;
}

/// Allows everything; embedders install a real ACL implementation.
pub struct PermissiveAccessControl;

impl AccessControl for PermissiveAccessControl {
    fn allow_read(&self, _subject: &SubjectDescriptor, _path: &ConcreteAttributePath) -> bool {
        true
    }

    fn allow_write(&self, _subject: &SubjectDescriptor, _path: &ConcreteAttributePath) -> bool {
        true
    }

    fn allow_invoke(&self, _subject: &SubjectDescriptor, _path: &CommandPath) -> bool {
        true
    }
}
