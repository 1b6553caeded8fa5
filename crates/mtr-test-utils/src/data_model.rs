//! In-memory data model: a root endpoint, an on/off light on endpoint 1,
//! a writable list attribute, and an echo command cluster.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use mtr_im::data_model::{
    AttributeChange, AttributeValue, DataModel, EventRecord, InvokeOutcome, SubjectDescriptor,
    WriteItem, WriteOp,
};
use mtr_im::path::{
    AttributePath, CommandPath, ConcreteAttributePath, ConcreteEventPath, EventPath,
};
use mtr_proto::Status;
use mtr_tlv::Value;
use tokio::sync::broadcast;

pub const ON_OFF_CLUSTER: u32 = 0x0006;
pub const ON_OFF_ATTRIBUTE: u32 = 0x0000;
pub const TEST_LIST_ATTRIBUTE: u32 = 0x0010;
pub const ECHO_CLUSTER: u32 = 0xfff1;
pub const ECHO_COMMAND: u32 = 0x0000;
pub const CLUSTER_REVISION: u32 = 0xfffd;

const CMD_OFF: u32 = 0x00;
const CMD_ON: u32 = 0x01;
const CMD_TOGGLE: u32 = 0x02;

pub struct TestDataModel {
    attributes: Mutex<BTreeMap<ConcreteAttributePath, (u32, Value)>>,
    changes_tx: broadcast::Sender<AttributeChange>,
    pub invoked: Mutex<Vec<CommandPath>>,
}

impl Default for TestDataModel {
    fn default() -> Self {
        Self::new()
    }
}

impl TestDataModel {
    pub fn new() -> Self {
        let mut attributes = BTreeMap::new();
        let mut put = |endpoint, cluster, attribute, value| {
            attributes.insert(
                ConcreteAttributePath {
                    endpoint,
                    cluster,
                    attribute,
                },
                (1u32, value),
            );
        };
        put(0, 0x0028, 0, Value::Utf8("mtr-node".to_owned()));
        put(0, 0x0028, CLUSTER_REVISION, Value::Unsigned(1));
        put(0, ECHO_CLUSTER, CLUSTER_REVISION, Value::Unsigned(1));
        put(1, ON_OFF_CLUSTER, ON_OFF_ATTRIBUTE, Value::Bool(false));
        put(1, ON_OFF_CLUSTER, TEST_LIST_ATTRIBUTE, Value::Array(vec![]));
        put(1, ON_OFF_CLUSTER, CLUSTER_REVISION, Value::Unsigned(4));
        put(1, ECHO_CLUSTER, CLUSTER_REVISION, Value::Unsigned(1));

        let (changes_tx, _) = broadcast::channel(256);
        TestDataModel {
            attributes: Mutex::new(attributes),
            changes_tx,
            invoked: Mutex::new(Vec::new()),
        }
    }

    pub fn attribute(&self, path: &ConcreteAttributePath) -> Option<Value> {
        self.attributes
            .lock()
            .expect("attributes lock")
            .get(path)
            .map(|(_, v)| v.clone())
    }

    /// Local mutation, as a cluster behavior would do it; notifies
    /// subscriptions.
    pub fn set_attribute(&self, path: ConcreteAttributePath, value: Value) {
        {
            let mut attributes = self.attributes.lock().expect("attributes lock");
            let entry = attributes.entry(path).or_insert((0, Value::Null));
            entry.0 += 1;
            entry.1 = value;
        }
        let _ = self.changes_tx.send(AttributeChange {
            path,
            fabric_index: None,
        });
    }

    fn status_for_missing(&self, path: &ConcreteAttributePath) -> Status {
        let attributes = self.attributes.lock().expect("attributes lock");
        let endpoints: HashSet<u16> = attributes.keys().map(|p| p.endpoint).collect();
        if !endpoints.contains(&path.endpoint) {
            return Status::UnsupportedEndpoint;
        }
        let clusters: HashSet<(u16, u32)> =
            attributes.keys().map(|p| (p.endpoint, p.cluster)).collect();
        if !clusters.contains(&(path.endpoint, path.cluster)) {
            return Status::UnsupportedCluster;
        }
        Status::UnsupportedAttribute
    }
}

#[async_trait]
impl DataModel for TestDataModel {
    fn expand_attribute_path(
        &self,
        path: &AttributePath,
    ) -> Result<Vec<ConcreteAttributePath>, Status> {
        if let Some(concrete) = path.as_concrete() {
            let known = self
                .attributes
                .lock()
                .expect("attributes lock")
                .contains_key(&concrete);
            return if known {
                Ok(vec![concrete])
            } else {
                Err(self.status_for_missing(&concrete))
            };
        }
        let attributes = self.attributes.lock().expect("attributes lock");
        Ok(attributes
            .keys()
            .filter(|concrete| path.matches(concrete))
            .copied()
            .collect())
    }

    fn expand_event_path(&self, path: &EventPath) -> Result<Vec<ConcreteEventPath>, Status> {
        // No events in the test model; concrete paths resolve, wildcards
        // expand to nothing.
        match (path.endpoint, path.cluster, path.event) {
            (Some(endpoint), Some(cluster), Some(event)) => Ok(vec![ConcreteEventPath {
                endpoint,
                cluster,
                event,
            }]),
            _ => Ok(vec![]),
        }
    }

    async fn read_attribute(
        &self,
        path: &ConcreteAttributePath,
        _fabric_filter: Option<u8>,
    ) -> Result<AttributeValue, Status> {
        let found = {
            let attributes = self.attributes.lock().expect("attributes lock");
            attributes.get(path).map(|(version, value)| AttributeValue {
                data_version: *version,
                value: value.clone(),
            })
        };
        found.ok_or_else(|| self.status_for_missing(path))
    }

    async fn read_events(
        &self,
        _path: &ConcreteEventPath,
        _min_event_number: u64,
    ) -> Vec<EventRecord> {
        Vec::new()
    }

    async fn write_attributes(
        &self,
        items: Vec<WriteItem>,
    ) -> Vec<(ConcreteAttributePath, Status)> {
        let mut results = Vec::with_capacity(items.len());
        let mut changed = Vec::new();
        {
            let mut attributes = self.attributes.lock().expect("attributes lock");
            for item in items {
                let Some(entry) = attributes.get_mut(&item.path) else {
                    results.push((item.path, self.status_for_missing_inner(&item.path)));
                    continue;
                };
                let status = match item.op {
                    WriteOp::Replace => {
                        entry.1 = item.value;
                        Status::Success
                    }
                    WriteOp::Append => match &mut entry.1 {
                        Value::Array(items) => {
                            items.push(item.value);
                            Status::Success
                        }
                        _ => Status::ConstraintError,
                    },
                    WriteOp::Update(index) => match &mut entry.1 {
                        Value::Array(items) => match items.get_mut(usize::from(index)) {
                            Some(slot) => {
                                *slot = item.value;
                                Status::Success
                            }
                            None => Status::ConstraintError,
                        },
                        _ => Status::ConstraintError,
                    },
                };
                if status.is_success() {
                    entry.0 += 1;
                    changed.push(item.path);
                }
                results.push((item.path, status));
            }
        }
        for path in changed {
            let _ = self.changes_tx.send(AttributeChange {
                path,
                fabric_index: None,
            });
        }
        results
    }

    async fn invoke(
        &self,
        path: &CommandPath,
        fields: Option<Value>,
        _subject: &SubjectDescriptor,
    ) -> InvokeOutcome {
        self.invoked.lock().expect("invoked lock").push(*path);
        match (path.cluster, path.command) {
            (ON_OFF_CLUSTER, CMD_ON) => {
                self.set_attribute(
                    ConcreteAttributePath {
                        endpoint: path.endpoint,
                        cluster: ON_OFF_CLUSTER,
                        attribute: ON_OFF_ATTRIBUTE,
                    },
                    Value::Bool(true),
                );
                InvokeOutcome::Status(Status::Success)
            }
            (ON_OFF_CLUSTER, CMD_OFF) => {
                self.set_attribute(
                    ConcreteAttributePath {
                        endpoint: path.endpoint,
                        cluster: ON_OFF_CLUSTER,
                        attribute: ON_OFF_ATTRIBUTE,
                    },
                    Value::Bool(false),
                );
                InvokeOutcome::Status(Status::Success)
            }
            (ON_OFF_CLUSTER, CMD_TOGGLE) => {
                let path = ConcreteAttributePath {
                    endpoint: path.endpoint,
                    cluster: ON_OFF_CLUSTER,
                    attribute: ON_OFF_ATTRIBUTE,
                };
                let current = matches!(self.attribute(&path), Some(Value::Bool(true)));
                self.set_attribute(path, Value::Bool(!current));
                InvokeOutcome::Status(Status::Success)
            }
            (ECHO_CLUSTER, ECHO_COMMAND) => {
                InvokeOutcome::Response(fields.unwrap_or(Value::Null))
            }
            _ => InvokeOutcome::Status(Status::UnsupportedCommand),
        }
    }

    fn changes(&self) -> broadcast::Receiver<AttributeChange> {
        self.changes_tx.subscribe()
    }
}

impl TestDataModel {
    fn status_for_missing_inner(&self, _path: &ConcreteAttributePath) -> Status {
        // Called with the attributes lock held; detailed classification
        // would deadlock, and write targets are pre-validated anyway.
        Status::UnsupportedAttribute
    }
}
