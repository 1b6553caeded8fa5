//! The node's built-in data model: Basic Information on the root endpoint
//! and an On/Off light on endpoint 1.
//!
//! Real products generate clusters from their device definitions; this
//! model is the minimal surface a controller can exercise.

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
use tracing::info;

const BASIC_INFORMATION_CLUSTER: u32 = 0x0028;
const ATTR_VENDOR_NAME: u32 = 0x0001;
const ATTR_PRODUCT_NAME: u32 = 0x0003;

const ON_OFF_CLUSTER: u32 = 0x0006;
const ATTR_ON_OFF: u32 = 0x0000;
const CMD_OFF: u32 = 0x00;
const CMD_ON: u32 = 0x01;
const CMD_TOGGLE: u32 = 0x02;

const CLUSTER_REVISION: u32 = 0xfffd;

pub struct LightDataModel {
    attributes: Mutex<BTreeMap<ConcreteAttributePath, (u32, Value)>>,
    changes_tx: broadcast::Sender<AttributeChange>,
}

impl Default for LightDataModel {
    fn default() -> Self {
        Self::new()
    }
}

impl LightDataModel {
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
        put(
            0,
            BASIC_INFORMATION_CLUSTER,
            ATTR_VENDOR_NAME,
            Value::Utf8("mtr".to_owned()),
        );
        put(
            0,
            BASIC_INFORMATION_CLUSTER,
            ATTR_PRODUCT_NAME,
            Value::Utf8("mtr demo light".to_owned()),
        );
        put(
            0,
            BASIC_INFORMATION_CLUSTER,
            CLUSTER_REVISION,
            Value::Unsigned(3),
        );
        put(1, ON_OFF_CLUSTER, ATTR_ON_OFF, Value::Bool(false));
        put(1, ON_OFF_CLUSTER, CLUSTER_REVISION, Value::Unsigned(4));

        let (changes_tx, _) = broadcast::channel(256);
        LightDataModel {
            attributes: Mutex::new(attributes),
            changes_tx,
        }
    }

    fn set(&self, path: ConcreteAttributePath, value: Value) {
        {
            let mut attributes = self.attributes.lock().expect("attributes lock");
            if let Some(entry) = attributes.get_mut(&path) {
                entry.0 += 1;
                entry.1 = value;
            }
        }
        let _ = self.changes_tx.send(AttributeChange {
            path,
            fabric_index: None,
        });
    }

    fn missing_status(&self, path: &ConcreteAttributePath) -> Status {
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

    fn on_off_path(endpoint: u16) -> ConcreteAttributePath {
        ConcreteAttributePath {
            endpoint,
            cluster: ON_OFF_CLUSTER,
            attribute: ATTR_ON_OFF,
        }
    }
}

#[async_trait]
impl DataModel for LightDataModel {
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
                Err(self.missing_status(&concrete))
            };
        }
        let attributes = self.attributes.lock().expect("attributes lock");
        Ok(attributes
            .keys()
            .filter(|concrete| path.matches(concrete))
            .copied()
            .collect())
    }

    fn expand_event_path(&self, _path: &EventPath) -> Result<Vec<ConcreteEventPath>, Status> {
        // The light records no events.
        Ok(Vec::new())
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
        found.ok_or_else(|| self.missing_status(path))
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
        for item in items {
            // Only the on/off state is writable; list forms do not apply.
            let writable = item.path.cluster == ON_OFF_CLUSTER
                && item.path.attribute == ATTR_ON_OFF
                && matches!(item.op, WriteOp::Replace);
            if !writable {
                results.push((item.path, Status::UnsupportedWrite));
                continue;
            }
            match item.value {
                Value::Bool(_) => {
                    self.set(item.path, item.value);
                    results.push((item.path, Status::Success));
                }
                _ => results.push((item.path, Status::ConstraintError)),
            }
        }
        results
    }

    async fn invoke(
        &self,
        path: &CommandPath,
        _fields: Option<Value>,
        subject: &SubjectDescriptor,
    ) -> InvokeOutcome {
        if path.cluster != ON_OFF_CLUSTER {
            return InvokeOutcome::Status(Status::UnsupportedCluster);
        }
        let target = Self::on_off_path(path.endpoint);
        let next = match path.command {
            CMD_ON => Some(true),
            CMD_OFF => Some(false),
            CMD_TOGGLE => {
                let current = {
                    let attributes = self.attributes.lock().expect("attributes lock");
                    matches!(attributes.get(&target), Some((_, Value::Bool(true))))
                };
                Some(!current)
            }
            _ => None,
        };
        match next {
            Some(on) => {
                info!(peer = %subject.peer, endpoint = path.endpoint, on, "light switched");
                self.set(target, Value::Bool(on));
                InvokeOutcome::Status(Status::Success)
            }
            None => InvokeOutcome::Status(Status::UnsupportedCommand),
        }
    }

    fn changes(&self) -> broadcast::Receiver<AttributeChange> {
        self.changes_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtr_exchange::PeerAddress;

    fn subject() -> SubjectDescriptor {
        SubjectDescriptor {
            peer: PeerAddress::new(1, 0x1),
            is_group: false,
        }
    }

    #[tokio::test]
    async fn toggle_flips_the_on_off_attribute() {
        let model = LightDataModel::new();
        let path = CommandPath::new(1, ON_OFF_CLUSTER, CMD_TOGGLE);

        let outcome = model.invoke(&path, None, &subject()).await;
        assert_eq!(outcome, InvokeOutcome::Status(Status::Success));
        let value = model
            .read_attribute(&LightDataModel::on_off_path(1), None)
            .await
            .unwrap();
        assert_eq!(value.value, Value::Bool(true));
    }

    #[tokio::test]
    async fn writes_outside_on_off_are_refused() {
        let model = LightDataModel::new();
        let results = model
            .write_attributes(vec![WriteItem {
                path: ConcreteAttributePath {
                    endpoint: 0,
                    cluster: BASIC_INFORMATION_CLUSTER,
                    attribute: ATTR_VENDOR_NAME,
                },
                op: WriteOp::Replace,
                value: Value::Utf8("nope".to_owned()),
            }])
            .await;
        assert_eq!(results[0].1, Status::UnsupportedWrite);
    }

    #[tokio::test]
    async fn writes_notify_subscribers() {
        let model = LightDataModel::new();
        let mut changes = model.changes();
        model
            .write_attributes(vec![WriteItem {
                path: LightDataModel::on_off_path(1),
                op: WriteOp::Replace,
                value: Value::Bool(true),
            }])
            .await;
        let change = changes.try_recv().unwrap();
        assert_eq!(change.path, LightDataModel::on_off_path(1));
    }
}
