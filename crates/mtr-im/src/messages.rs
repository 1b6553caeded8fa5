//! Interaction Model wire messages.
//!
//! Every message is one anonymous TLV structure. Context tag numbers are
//! frozen wire constants. Unknown elements are skipped on decode so newer
//! peers can extend messages without breaking us.

use mtr_proto::{INTERACTION_MODEL_REVISION, Status};
use mtr_tlv::{ContainerKind, ElementValue, Tag, TlvError, TlvReader, TlvWriter, Value};

use crate::path::{AttributePath, CommandPath, ConcreteEventPath, EventPath};

const TAG_IM_REVISION: u8 = 0xff;

// ---------------------------------------------------------------------------
// Shared decode helpers
// ---------------------------------------------------------------------------

fn open_struct(r: &mut TlvReader<'_>) -> Result<(), TlvError> {
    let element = r.next()?.ok_or(TlvError::UnexpectedEnd)?;
    match element.value {
        ElementValue::ContainerStart(_) => Ok(()),
        ref other => Err(TlvError::TypeMismatch {
            expected: "message structure",
            found: match other {
                ElementValue::ContainerEnd => "end of container",
                _ => "scalar",
            },
        }),
    }
}

fn decode_attribute_paths(r: &mut TlvReader<'_>) -> Result<Vec<AttributePath>, TlvError> {
    let mut paths = Vec::new();
    while let Some(element) = r.next()? {
        match element.value {
            ElementValue::ContainerEnd => return Ok(paths),
            ElementValue::ContainerStart(_) => paths.push(AttributePath::decode(r)?),
            _ => {
                return Err(TlvError::TypeMismatch {
                    expected: "attribute path",
                    found: "scalar",
                });
            }
        }
    }
    Err(TlvError::UnexpectedEnd)
}

fn decode_event_paths(r: &mut TlvReader<'_>) -> Result<Vec<EventPath>, TlvError> {
    let mut paths = Vec::new();
    while let Some(element) = r.next()? {
        match element.value {
            ElementValue::ContainerEnd => return Ok(paths),
            ElementValue::ContainerStart(_) => paths.push(EventPath::decode(r)?),
            _ => {
                return Err(TlvError::TypeMismatch {
                    expected: "event path",
                    found: "scalar",
                });
            }
        }
    }
    Err(TlvError::UnexpectedEnd)
}

// ---------------------------------------------------------------------------
// StatusResponse
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResponseMessage {
    pub status: Status,
}

impl StatusResponseMessage {
    pub fn new(status: Status) -> Self {
        StatusResponseMessage { status }
    }

    pub fn encode(&self) -> Result<Vec<u8>, TlvError> {
        let mut w = TlvWriter::new();
        w.start_structure(Tag::Anonymous)?;
        w.put_unsigned(Tag::Context(0), u64::from(self.status as u8))?;
        w.put_unsigned(
            Tag::Context(TAG_IM_REVISION),
            u64::from(INTERACTION_MODEL_REVISION),
        )?;
        w.end_container()?;
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, TlvError> {
        let mut r = TlvReader::new(buf);
        open_struct(&mut r)?;
        let mut status = Status::Failure;
        while let Some(element) = r.next()? {
            match (&element.tag, &element.value) {
                (_, ElementValue::ContainerEnd) => return Ok(StatusResponseMessage { status }),
                (Tag::Context(0), v) => status = Status::from_u8(v.as_unsigned()? as u8),
                _ => r.skip_value(&element)?,
            }
        }
        Err(TlvError::UnexpectedEnd)
    }
}

// ---------------------------------------------------------------------------
// StatusIB (nested)
// ---------------------------------------------------------------------------

fn encode_status_ib(w: &mut TlvWriter, tag: Tag, status: Status) -> Result<(), TlvError> {
    w.start_structure(tag)?;
    w.put_unsigned(Tag::Context(0), u64::from(status as u8))?;
    w.end_container()?;
    Ok(())
}

fn decode_status_ib(r: &mut TlvReader<'_>) -> Result<Status, TlvError> {
    let mut status = Status::Failure;
    while let Some(element) = r.next()? {
        match (&element.tag, &element.value) {
            (_, ElementValue::ContainerEnd) => return Ok(status),
            (Tag::Context(0), v) => status = Status::from_u8(v.as_unsigned()? as u8),
            _ => r.skip_value(&element)?,
        }
    }
    Err(TlvError::UnexpectedEnd)
}

// ---------------------------------------------------------------------------
// ReadRequest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadRequestMessage {
    pub attribute_requests: Vec<AttributePath>,
    pub event_requests: Vec<EventPath>,
    pub fabric_filtered: bool,
    pub interaction_model_revision: Option<u8>,
}

impl ReadRequestMessage {
    pub fn encode(&self) -> Result<Vec<u8>, TlvError> {
        let mut w = TlvWriter::new();
        w.start_structure(Tag::Anonymous)?;
        if !self.attribute_requests.is_empty() {
            w.start_array(Tag::Context(0))?;
            for path in &self.attribute_requests {
                path.encode(&mut w, Tag::Anonymous)?;
            }
            w.end_container()?;
        }
        if !self.event_requests.is_empty() {
            w.start_array(Tag::Context(1))?;
            for path in &self.event_requests {
                path.encode(&mut w, Tag::Anonymous)?;
            }
            w.end_container()?;
        }
        w.put_bool(Tag::Context(3), self.fabric_filtered)?;
        w.put_unsigned(
            Tag::Context(TAG_IM_REVISION),
            u64::from(INTERACTION_MODEL_REVISION),
        )?;
        w.end_container()?;
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, TlvError> {
        let mut r = TlvReader::new(buf);
        open_struct(&mut r)?;
        let mut msg = ReadRequestMessage::default();
        while let Some(element) = r.next()? {
            match (&element.tag, &element.value) {
                (_, ElementValue::ContainerEnd) => return Ok(msg),
                (Tag::Context(0), ElementValue::ContainerStart(_)) => {
                    msg.attribute_requests = decode_attribute_paths(&mut r)?;
                }
                (Tag::Context(1), ElementValue::ContainerStart(_)) => {
                    msg.event_requests = decode_event_paths(&mut r)?;
                }
                (Tag::Context(3), v) => msg.fabric_filtered = v.as_bool()?,
                (Tag::Context(TAG_IM_REVISION), v) => {
                    msg.interaction_model_revision = Some(v.as_unsigned()? as u8);
                }
                _ => r.skip_value(&element)?,
            }
        }
        Err(TlvError::UnexpectedEnd)
    }
}

// ---------------------------------------------------------------------------
// Attribute report IBs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeData {
    pub data_version: Option<u32>,
    pub path: AttributePath,
    pub data: Value,
}

impl AttributeData {
    fn encode_into(&self, w: &mut TlvWriter, tag: Tag) -> Result<(), TlvError> {
        w.start_structure(tag)?;
        if let Some(version) = self.data_version {
            w.put_unsigned(Tag::Context(0), u64::from(version))?;
        }
        self.path.encode(w, Tag::Context(1))?;
        self.data.encode(w, Tag::Context(2))?;
        w.end_container()?;
        Ok(())
    }

    fn decode_from(r: &mut TlvReader<'_>) -> Result<Self, TlvError> {
        let mut data_version = None;
        let mut path = None;
        let mut data = None;
        while let Some(element) = r.next()? {
            match (&element.tag, &element.value) {
                (_, ElementValue::ContainerEnd) => {
                    return Ok(AttributeData {
                        data_version,
                        path: path.ok_or(TlvError::MissingElement(Tag::Context(1)))?,
                        data: data.ok_or(TlvError::MissingElement(Tag::Context(2)))?,
                    });
                }
                (Tag::Context(0), v) => data_version = Some(v.as_unsigned()? as u32),
                (Tag::Context(1), ElementValue::ContainerStart(_)) => {
                    path = Some(AttributePath::decode(r)?);
                }
                (Tag::Context(2), _) => data = Some(Value::decode(&element, r)?),
                _ => r.skip_value(&element)?,
            }
        }
        Err(TlvError::UnexpectedEnd)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeStatus {
    pub path: AttributePath,
    pub status: Status,
}

impl AttributeStatus {
    fn encode_into(&self, w: &mut TlvWriter, tag: Tag) -> Result<(), TlvError> {
        w.start_structure(tag)?;
        self.path.encode(w, Tag::Context(0))?;
        encode_status_ib(w, Tag::Context(1), self.status)?;
        w.end_container()?;
        Ok(())
    }

    fn decode_from(r: &mut TlvReader<'_>) -> Result<Self, TlvError> {
        let mut path = None;
        let mut status = Status::Failure;
        while let Some(element) = r.next()? {
            match (&element.tag, &element.value) {
                (_, ElementValue::ContainerEnd) => {
                    return Ok(AttributeStatus {
                        path: path.ok_or(TlvError::MissingElement(Tag::Context(0)))?,
                        status,
                    });
                }
                (Tag::Context(0), ElementValue::ContainerStart(_)) => {
                    path = Some(AttributePath::decode(r)?);
                }
                (Tag::Context(1), ElementValue::ContainerStart(_)) => {
                    status = decode_status_ib(r)?;
                }
                _ => r.skip_value(&element)?,
            }
        }
        Err(TlvError::UnexpectedEnd)
    }
}

/// One entry of a `ReportData` attribute report list.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeReport {
    Status(AttributeStatus),
    Data(AttributeData),
}

impl AttributeReport {
    pub fn path(&self) -> &AttributePath {
        match self {
            AttributeReport::Status(s) => &s.path,
            AttributeReport::Data(d) => &d.path,
        }
    }

    fn encode_into(&self, w: &mut TlvWriter, tag: Tag) -> Result<(), TlvError> {
        w.start_structure(tag)?;
        match self {
            AttributeReport::Status(status) => status.encode_into(w, Tag::Context(0))?,
            AttributeReport::Data(data) => data.encode_into(w, Tag::Context(1))?,
        }
        w.end_container()?;
        Ok(())
    }

    /// Standalone encoding of this entry as one anonymous element; the
    /// messenger measures these to decide chunk boundaries.
    pub fn encode_fragment(&self) -> Result<Vec<u8>, TlvError> {
        let mut w = TlvWriter::new();
        self.encode_into(&mut w, Tag::Anonymous)?;
        w.finish()
    }

    fn decode_from(r: &mut TlvReader<'_>) -> Result<Self, TlvError> {
        let mut report = None;
        while let Some(element) = r.next()? {
            match (&element.tag, &element.value) {
                (_, ElementValue::ContainerEnd) => {
                    return report.ok_or(TlvError::MissingElement(Tag::Context(1)));
                }
                (Tag::Context(0), ElementValue::ContainerStart(_)) => {
                    report = Some(AttributeReport::Status(AttributeStatus::decode_from(r)?));
                }
                (Tag::Context(1), ElementValue::ContainerStart(_)) => {
                    report = Some(AttributeReport::Data(AttributeData::decode_from(r)?));
                }
                _ => r.skip_value(&element)?,
            }
        }
        Err(TlvError::UnexpectedEnd)
    }
}

// ---------------------------------------------------------------------------
// Event report IBs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct EventData {
    pub path: ConcreteEventPath,
    pub event_number: u64,
    pub priority: u8,
    pub data: Value,
}

/// Only the data form is produced by this node; status entries are decoded
/// and surfaced but never generated.
#[derive(Debug, Clone, PartialEq)]
pub enum EventReport {
    Status { path: EventPath, status: Status },
    Data(EventData),
}

impl EventReport {
    fn encode_into(&self, w: &mut TlvWriter, tag: Tag) -> Result<(), TlvError> {
        w.start_structure(tag)?;
        match self {
            EventReport::Status { path, status } => {
                w.start_structure(Tag::Context(0))?;
                path.encode(w, Tag::Context(0))?;
                encode_status_ib(w, Tag::Context(1), *status)?;
                w.end_container()?;
            }
            EventReport::Data(data) => {
                w.start_structure(Tag::Context(1))?;
                EventPath::from(data.path).encode(w, Tag::Context(0))?;
                w.put_unsigned(Tag::Context(1), data.event_number)?;
                w.put_unsigned(Tag::Context(2), u64::from(data.priority))?;
                data.data.encode(w, Tag::Context(7))?;
                w.end_container()?;
            }
        }
        w.end_container()?;
        Ok(())
    }

    pub fn encode_fragment(&self) -> Result<Vec<u8>, TlvError> {
        let mut w = TlvWriter::new();
        self.encode_into(&mut w, Tag::Anonymous)?;
        w.finish()
    }

    fn decode_from(r: &mut TlvReader<'_>) -> Result<Self, TlvError> {
        let mut report = None;
        while let Some(element) = r.next()? {
            match (&element.tag, &element.value) {
                (_, ElementValue::ContainerEnd) => {
                    return report.ok_or(TlvError::MissingElement(Tag::Context(1)));
                }
                (Tag::Context(0), ElementValue::ContainerStart(_)) => {
                    let mut path = EventPath::default();
                    let mut status = Status::Failure;
                    while let Some(inner) = r.next()? {
                        match (&inner.tag, &inner.value) {
                            (_, ElementValue::ContainerEnd) => break,
                            (Tag::Context(0), ElementValue::ContainerStart(_)) => {
                                path = EventPath::decode(r)?;
                            }
                            (Tag::Context(1), ElementValue::ContainerStart(_)) => {
                                status = decode_status_ib(r)?;
                            }
                            _ => r.skip_value(&inner)?,
                        }
                    }
                    report = Some(EventReport::Status { path, status });
                }
                (Tag::Context(1), ElementValue::ContainerStart(_)) => {
                    let mut path = None;
                    let mut event_number = 0;
                    let mut priority = 0;
                    let mut data = Value::Null;
                    while let Some(inner) = r.next()? {
                        match (&inner.tag, &inner.value) {
                            (_, ElementValue::ContainerEnd) => break,
                            (Tag::Context(0), ElementValue::ContainerStart(_)) => {
                                let p = EventPath::decode(r)?;
                                path = match (p.endpoint, p.cluster, p.event) {
                                    (Some(endpoint), Some(cluster), Some(event)) => {
                                        Some(ConcreteEventPath {
                                            endpoint,
                                            cluster,
                                            event,
                                        })
                                    }
                                    _ => None,
                                };
                            }
                            (Tag::Context(1), v) => event_number = v.as_unsigned()?,
                            (Tag::Context(2), v) => priority = v.as_unsigned()? as u8,
                            (Tag::Context(7), _) => data = Value::decode(&inner, r)?,
                            _ => r.skip_value(&inner)?,
                        }
                    }
                    report = Some(EventReport::Data(EventData {
                        path: path.ok_or(TlvError::MissingElement(Tag::Context(0)))?,
                        event_number,
                        priority,
                        data,
                    }));
                }
                _ => r.skip_value(&element)?,
            }
        }
        Err(TlvError::UnexpectedEnd)
    }
}

// ---------------------------------------------------------------------------
// ReportData
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataReportMessage {
    pub subscription_id: Option<u32>,
    pub attribute_reports: Vec<AttributeReport>,
    pub event_reports: Vec<EventReport>,
    pub more_chunked_messages: bool,
    pub suppress_response: bool,
}

impl DataReportMessage {
    pub fn encode(&self) -> Result<Vec<u8>, TlvError> {
        let mut w = TlvWriter::new();
        w.start_structure(Tag::Anonymous)?;
        if let Some(id) = self.subscription_id {
            w.put_unsigned(Tag::Context(0), u64::from(id))?;
        }
        if !self.attribute_reports.is_empty() {
            w.start_array(Tag::Context(1))?;
            for report in &self.attribute_reports {
                report.encode_into(&mut w, Tag::Anonymous)?;
            }
            w.end_container()?;
        }
        if !self.event_reports.is_empty() {
            w.start_array(Tag::Context(2))?;
            for report in &self.event_reports {
                report.encode_into(&mut w, Tag::Anonymous)?;
            }
            w.end_container()?;
        }
        if self.more_chunked_messages {
            w.put_bool(Tag::Context(3), true)?;
        }
        if self.suppress_response {
            w.put_bool(Tag::Context(4), true)?;
        }
        w.put_unsigned(
            Tag::Context(TAG_IM_REVISION),
            u64::from(INTERACTION_MODEL_REVISION),
        )?;
        w.end_container()?;
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, TlvError> {
        let mut r = TlvReader::new(buf);
        open_struct(&mut r)?;
        let mut msg = DataReportMessage::default();
        while let Some(element) = r.next()? {
            match (&element.tag, &element.value) {
                (_, ElementValue::ContainerEnd) => return Ok(msg),
                (Tag::Context(0), v) => msg.subscription_id = Some(v.as_unsigned()? as u32),
                (Tag::Context(1), ElementValue::ContainerStart(_)) => {
                    while let Some(entry) = r.next()? {
                        match entry.value {
                            ElementValue::ContainerEnd => break,
                            ElementValue::ContainerStart(ContainerKind::Structure) => {
                                msg.attribute_reports.push(AttributeReport::decode_from(&mut r)?);
                            }
                            _ => r.skip_value(&entry)?,
                        }
                    }
                }
                (Tag::Context(2), ElementValue::ContainerStart(_)) => {
                    while let Some(entry) = r.next()? {
                        match entry.value {
                            ElementValue::ContainerEnd => break,
                            ElementValue::ContainerStart(ContainerKind::Structure) => {
                                msg.event_reports.push(EventReport::decode_from(&mut r)?);
                            }
                            _ => r.skip_value(&entry)?,
                        }
                    }
                }
                (Tag::Context(3), v) => msg.more_chunked_messages = v.as_bool()?,
                (Tag::Context(4), v) => msg.suppress_response = v.as_bool()?,
                _ => r.skip_value(&element)?,
            }
        }
        Err(TlvError::UnexpectedEnd)
    }
}

// ---------------------------------------------------------------------------
// Subscribe
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscribeRequestMessage {
    pub keep_subscriptions: bool,
    pub min_interval_floor_seconds: u16,
    pub max_interval_ceiling_seconds: u16,
    pub attribute_requests: Vec<AttributePath>,
    pub event_requests: Vec<EventPath>,
    pub fabric_filtered: bool,
    pub interaction_model_revision: Option<u8>,
}

impl SubscribeRequestMessage {
    pub fn encode(&self) -> Result<Vec<u8>, TlvError> {
        let mut w = TlvWriter::new();
        w.start_structure(Tag::Anonymous)?;
        w.put_bool(Tag::Context(0), self.keep_subscriptions)?;
        w.put_unsigned(Tag::Context(1), u64::from(self.min_interval_floor_seconds))?;
        w.put_unsigned(Tag::Context(2), u64::from(self.max_interval_ceiling_seconds))?;
        if !self.attribute_requests.is_empty() {
            w.start_array(Tag::Context(3))?;
            for path in &self.attribute_requests {
                path.encode(&mut w, Tag::Anonymous)?;
            }
            w.end_container()?;
        }
        if !self.event_requests.is_empty() {
            w.start_array(Tag::Context(4))?;
            for path in &self.event_requests {
                path.encode(&mut w, Tag::Anonymous)?;
            }
            w.end_container()?;
        }
        w.put_bool(Tag::Context(7), self.fabric_filtered)?;
        w.put_unsigned(
            Tag::Context(TAG_IM_REVISION),
            u64::from(INTERACTION_MODEL_REVISION),
        )?;
        w.end_container()?;
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, TlvError> {
        let mut r = TlvReader::new(buf);
        open_struct(&mut r)?;
        let mut msg = SubscribeRequestMessage::default();
        while let Some(element) = r.next()? {
            match (&element.tag, &element.value) {
                (_, ElementValue::ContainerEnd) => return Ok(msg),
                (Tag::Context(0), v) => msg.keep_subscriptions = v.as_bool()?,
                (Tag::Context(1), v) => {
                    msg.min_interval_floor_seconds = v.as_unsigned()? as u16;
                }
                (Tag::Context(2), v) => {
                    msg.max_interval_ceiling_seconds = v.as_unsigned()? as u16;
                }
                (Tag::Context(3), ElementValue::ContainerStart(_)) => {
                    msg.attribute_requests = decode_attribute_paths(&mut r)?;
                }
                (Tag::Context(4), ElementValue::ContainerStart(_)) => {
                    msg.event_requests = decode_event_paths(&mut r)?;
                }
                (Tag::Context(7), v) => msg.fabric_filtered = v.as_bool()?,
                (Tag::Context(TAG_IM_REVISION), v) => {
                    msg.interaction_model_revision = Some(v.as_unsigned()? as u8);
                }
                _ => r.skip_value(&element)?,
            }
        }
        Err(TlvError::UnexpectedEnd)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeResponseMessage {
    pub subscription_id: u32,
    pub max_interval_seconds: u16,
}

impl SubscribeResponseMessage {
    pub fn encode(&self) -> Result<Vec<u8>, TlvError> {
        let mut w = TlvWriter::new();
        w.start_structure(Tag::Anonymous)?;
        w.put_unsigned(Tag::Context(0), u64::from(self.subscription_id))?;
        w.put_unsigned(Tag::Context(2), u64::from(self.max_interval_seconds))?;
        w.put_unsigned(
            Tag::Context(TAG_IM_REVISION),
            u64::from(INTERACTION_MODEL_REVISION),
        )?;
        w.end_container()?;
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, TlvError> {
        let mut r = TlvReader::new(buf);
        open_struct(&mut r)?;
        let mut subscription_id = None;
        let mut max_interval_seconds = 0;
        while let Some(element) = r.next()? {
            match (&element.tag, &element.value) {
                (_, ElementValue::ContainerEnd) => {
                    return Ok(SubscribeResponseMessage {
                        subscription_id: subscription_id
                            .ok_or(TlvError::MissingElement(Tag::Context(0)))?,
                        max_interval_seconds,
                    });
                }
                (Tag::Context(0), v) => subscription_id = Some(v.as_unsigned()? as u32),
                (Tag::Context(2), v) => max_interval_seconds = v.as_unsigned()? as u16,
                _ => r.skip_value(&element)?,
            }
        }
        Err(TlvError::UnexpectedEnd)
    }
}

// ---------------------------------------------------------------------------
// Write
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteRequestMessage {
    pub suppress_response: bool,
    pub timed_request: bool,
    pub write_requests: Vec<AttributeData>,
    pub more_chunked_messages: bool,
    pub interaction_model_revision: Option<u8>,
}

impl WriteRequestMessage {
    pub fn encode(&self) -> Result<Vec<u8>, TlvError> {
        let mut w = TlvWriter::new();
        w.start_structure(Tag::Anonymous)?;
        if self.suppress_response {
            w.put_bool(Tag::Context(0), true)?;
        }
        w.put_bool(Tag::Context(1), self.timed_request)?;
        w.start_array(Tag::Context(2))?;
        for data in &self.write_requests {
            data.encode_into(&mut w, Tag::Anonymous)?;
        }
        w.end_container()?;
        if self.more_chunked_messages {
            w.put_bool(Tag::Context(3), true)?;
        }
        w.put_unsigned(
            Tag::Context(TAG_IM_REVISION),
            u64::from(INTERACTION_MODEL_REVISION),
        )?;
        w.end_container()?;
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, TlvError> {
        let mut r = TlvReader::new(buf);
        open_struct(&mut r)?;
        let mut msg = WriteRequestMessage::default();
        while let Some(element) = r.next()? {
            match (&element.tag, &element.value) {
                (_, ElementValue::ContainerEnd) => return Ok(msg),
                (Tag::Context(0), v) => msg.suppress_response = v.as_bool()?,
                (Tag::Context(1), v) => msg.timed_request = v.as_bool()?,
                (Tag::Context(2), ElementValue::ContainerStart(_)) => {
                    while let Some(entry) = r.next()? {
                        match entry.value {
                            ElementValue::ContainerEnd => break,
                            ElementValue::ContainerStart(ContainerKind::Structure) => {
                                msg.write_requests.push(AttributeData::decode_from(&mut r)?);
                            }
                            _ => r.skip_value(&entry)?,
                        }
                    }
                }
                (Tag::Context(3), v) => msg.more_chunked_messages = v.as_bool()?,
                (Tag::Context(TAG_IM_REVISION), v) => {
                    msg.interaction_model_revision = Some(v.as_unsigned()? as u8);
                }
                _ => r.skip_value(&element)?,
            }
        }
        Err(TlvError::UnexpectedEnd)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteResponseMessage {
    pub write_responses: Vec<AttributeStatus>,
}

impl WriteResponseMessage {
    pub fn encode(&self) -> Result<Vec<u8>, TlvError> {
        let mut w = TlvWriter::new();
        w.start_structure(Tag::Anonymous)?;
        w.start_array(Tag::Context(0))?;
        for status in &self.write_responses {
            status.encode_into(&mut w, Tag::Anonymous)?;
        }
        w.end_container()?;
        w.put_unsigned(
            Tag::Context(TAG_IM_REVISION),
            u64::from(INTERACTION_MODEL_REVISION),
        )?;
        w.end_container()?;
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, TlvError> {
        let mut r = TlvReader::new(buf);
        open_struct(&mut r)?;
        let mut msg = WriteResponseMessage::default();
        while let Some(element) = r.next()? {
            match (&element.tag, &element.value) {
                (_, ElementValue::ContainerEnd) => return Ok(msg),
                (Tag::Context(0), ElementValue::ContainerStart(_)) => {
                    while let Some(entry) = r.next()? {
                        match entry.value {
                            ElementValue::ContainerEnd => break,
                            ElementValue::ContainerStart(ContainerKind::Structure) => {
                                msg.write_responses.push(AttributeStatus::decode_from(&mut r)?);
                            }
                            _ => r.skip_value(&entry)?,
                        }
                    }
                }
                _ => r.skip_value(&element)?,
            }
        }
        Err(TlvError::UnexpectedEnd)
    }
}

// ---------------------------------------------------------------------------
// Invoke
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct CommandData {
    pub path: CommandPath,
    pub fields: Option<Value>,
    /// Present on the wire only when the enclosing request batches more
    /// than one command; deployed peers reject a lone `commandRef`.
    pub command_ref: Option<u16>,
}

impl CommandData {
    fn encode_into(&self, w: &mut TlvWriter, tag: Tag) -> Result<(), TlvError> {
        w.start_structure(tag)?;
        self.path.encode(w, Tag::Context(0))?;
        if let Some(fields) = &self.fields {
            fields.encode(w, Tag::Context(1))?;
        }
        if let Some(command_ref) = self.command_ref {
            w.put_unsigned(Tag::Context(2), u64::from(command_ref))?;
        }
        w.end_container()?;
        Ok(())
    }

    fn decode_from(r: &mut TlvReader<'_>) -> Result<Self, TlvError> {
        let mut path = None;
        let mut fields = None;
        let mut command_ref = None;
        while let Some(element) = r.next()? {
            match (&element.tag, &element.value) {
                (_, ElementValue::ContainerEnd) => {
                    return Ok(CommandData {
                        path: path.ok_or(TlvError::MissingElement(Tag::Context(0)))?,
                        fields,
                        command_ref,
                    });
                }
                (Tag::Context(0), ElementValue::ContainerStart(_)) => {
                    path = Some(CommandPath::decode(r)?);
                }
                (Tag::Context(1), _) => fields = Some(Value::decode(&element, r)?),
                (Tag::Context(2), v) => command_ref = Some(v.as_unsigned()? as u16),
                _ => r.skip_value(&element)?,
            }
        }
        Err(TlvError::UnexpectedEnd)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStatus {
    pub path: CommandPath,
    pub status: Status,
    pub command_ref: Option<u16>,
}

impl CommandStatus {
    fn encode_into(&self, w: &mut TlvWriter, tag: Tag) -> Result<(), TlvError> {
        w.start_structure(tag)?;
        self.path.encode(w, Tag::Context(0))?;
        encode_status_ib(w, Tag::Context(1), self.status)?;
        if let Some(command_ref) = self.command_ref {
            w.put_unsigned(Tag::Context(2), u64::from(command_ref))?;
        }
        w.end_container()?;
        Ok(())
    }

    fn decode_from(r: &mut TlvReader<'_>) -> Result<Self, TlvError> {
        let mut path = None;
        let mut status = Status::Failure;
        let mut command_ref = None;
        while let Some(element) = r.next()? {
            match (&element.tag, &element.value) {
                (_, ElementValue::ContainerEnd) => {
                    return Ok(CommandStatus {
                        path: path.ok_or(TlvError::MissingElement(Tag::Context(0)))?,
                        status,
                        command_ref,
                    });
                }
                (Tag::Context(0), ElementValue::ContainerStart(_)) => {
                    path = Some(CommandPath::decode(r)?);
                }
                (Tag::Context(1), ElementValue::ContainerStart(_)) => {
                    status = decode_status_ib(r)?;
                }
                (Tag::Context(2), v) => command_ref = Some(v.as_unsigned()? as u16),
                _ => r.skip_value(&element)?,
            }
        }
        Err(TlvError::UnexpectedEnd)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InvokeResponseEntry {
    Command(CommandData),
    Status(CommandStatus),
}

impl InvokeResponseEntry {
    pub fn path(&self) -> &CommandPath {
        match self {
            InvokeResponseEntry::Command(c) => &c.path,
            InvokeResponseEntry::Status(s) => &s.path,
        }
    }

    pub fn command_ref(&self) -> Option<u16> {
        match self {
            InvokeResponseEntry::Command(c) => c.command_ref,
            InvokeResponseEntry::Status(s) => s.command_ref,
        }
    }

    fn encode_into(&self, w: &mut TlvWriter, tag: Tag) -> Result<(), TlvError> {
        w.start_structure(tag)?;
        match self {
            InvokeResponseEntry::Command(data) => data.encode_into(w, Tag::Context(0))?,
            InvokeResponseEntry::Status(status) => status.encode_into(w, Tag::Context(1))?,
        }
        w.end_container()?;
        Ok(())
    }

    pub fn encode_fragment(&self) -> Result<Vec<u8>, TlvError> {
        let mut w = TlvWriter::new();
        self.encode_into(&mut w, Tag::Anonymous)?;
        w.finish()
    }

    fn decode_from(r: &mut TlvReader<'_>) -> Result<Self, TlvError> {
        let mut entry = None;
        while let Some(element) = r.next()? {
            match (&element.tag, &element.value) {
                (_, ElementValue::ContainerEnd) => {
                    return entry.ok_or(TlvError::MissingElement(Tag::Context(0)));
                }
                (Tag::Context(0), ElementValue::ContainerStart(_)) => {
                    entry = Some(InvokeResponseEntry::Command(CommandData::decode_from(r)?));
                }
                (Tag::Context(1), ElementValue::ContainerStart(_)) => {
                    entry = Some(InvokeResponseEntry::Status(CommandStatus::decode_from(r)?));
                }
                _ => r.skip_value(&element)?,
            }
        }
        Err(TlvError::UnexpectedEnd)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvokeRequestMessage {
    pub suppress_response: bool,
    pub timed_request: bool,
    pub invoke_requests: Vec<CommandData>,
    pub interaction_model_revision: Option<u8>,
}

impl InvokeRequestMessage {
    pub fn encode(&self) -> Result<Vec<u8>, TlvError> {
        let mut w = TlvWriter::new();
        w.start_structure(Tag::Anonymous)?;
        w.put_bool(Tag::Context(0), self.suppress_response)?;
        w.put_bool(Tag::Context(1), self.timed_request)?;
        w.start_array(Tag::Context(2))?;
        for command in &self.invoke_requests {
            command.encode_into(&mut w, Tag::Anonymous)?;
        }
        w.end_container()?;
        w.put_unsigned(
            Tag::Context(TAG_IM_REVISION),
            u64::from(INTERACTION_MODEL_REVISION),
        )?;
        w.end_container()?;
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, TlvError> {
        let mut r = TlvReader::new(buf);
        open_struct(&mut r)?;
        let mut msg = InvokeRequestMessage::default();
        while let Some(element) = r.next()? {
            match (&element.tag, &element.value) {
                (_, ElementValue::ContainerEnd) => return Ok(msg),
                (Tag::Context(0), v) => msg.suppress_response = v.as_bool()?,
                (Tag::Context(1), v) => msg.timed_request = v.as_bool()?,
                (Tag::Context(2), ElementValue::ContainerStart(_)) => {
                    while let Some(entry) = r.next()? {
                        match entry.value {
                            ElementValue::ContainerEnd => break,
                            ElementValue::ContainerStart(ContainerKind::Structure) => {
                                msg.invoke_requests.push(CommandData::decode_from(&mut r)?);
                            }
                            _ => r.skip_value(&entry)?,
                        }
                    }
                }
                (Tag::Context(TAG_IM_REVISION), v) => {
                    msg.interaction_model_revision = Some(v.as_unsigned()? as u8);
                }
                _ => r.skip_value(&element)?,
            }
        }
        Err(TlvError::UnexpectedEnd)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvokeResponseMessage {
    pub suppress_response: bool,
    pub invoke_responses: Vec<InvokeResponseEntry>,
    pub more_chunked_messages: bool,
}

impl InvokeResponseMessage {
    pub fn encode(&self) -> Result<Vec<u8>, TlvError> {
        let mut w = TlvWriter::new();
        w.start_structure(Tag::Anonymous)?;
        w.put_bool(Tag::Context(0), self.suppress_response)?;
        w.start_array(Tag::Context(1))?;
        for entry in &self.invoke_responses {
            entry.encode_into(&mut w, Tag::Anonymous)?;
        }
        w.end_container()?;
        if self.more_chunked_messages {
            w.put_bool(Tag::Context(2), true)?;
        }
        w.put_unsigned(
            Tag::Context(TAG_IM_REVISION),
            u64::from(INTERACTION_MODEL_REVISION),
        )?;
        w.end_container()?;
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, TlvError> {
        let mut r = TlvReader::new(buf);
        open_struct(&mut r)?;
        let mut msg = InvokeResponseMessage::default();
        while let Some(element) = r.next()? {
            match (&element.tag, &element.value) {
                (_, ElementValue::ContainerEnd) => return Ok(msg),
                (Tag::Context(0), v) => msg.suppress_response = v.as_bool()?,
                (Tag::Context(1), ElementValue::ContainerStart(_)) => {
                    while let Some(entry) = r.next()? {
                        match entry.value {
                            ElementValue::ContainerEnd => break,
                            ElementValue::ContainerStart(ContainerKind::Structure) => {
                                msg.invoke_responses
                                    .push(InvokeResponseEntry::decode_from(&mut r)?);
                            }
                            _ => r.skip_value(&entry)?,
                        }
                    }
                }
                (Tag::Context(2), v) => msg.more_chunked_messages = v.as_bool()?,
                _ => r.skip_value(&element)?,
            }
        }
        Err(TlvError::UnexpectedEnd)
    }
}

// ---------------------------------------------------------------------------
// TimedRequest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimedRequestMessage {
    pub timeout_ms: u16,
}

impl TimedRequestMessage {
    pub fn encode(&self) -> Result<Vec<u8>, TlvError> {
        let mut w = TlvWriter::new();
        w.start_structure(Tag::Anonymous)?;
        w.put_unsigned(Tag::Context(0), u64::from(self.timeout_ms))?;
        w.put_unsigned(
            Tag::Context(TAG_IM_REVISION),
            u64::from(INTERACTION_MODEL_REVISION),
        )?;
        w.end_container()?;
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, TlvError> {
        let mut r = TlvReader::new(buf);
        open_struct(&mut r)?;
        let mut msg = TimedRequestMessage::default();
        while let Some(element) = r.next()? {
            match (&element.tag, &element.value) {
                (_, ElementValue::ContainerEnd) => return Ok(msg),
                (Tag::Context(0), v) => msg.timeout_ms = v.as_unsigned()? as u16,
                _ => r.skip_value(&element)?,
            }
        }
        Err(TlvError::UnexpectedEnd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_request_round_trips() {
        let msg = ReadRequestMessage {
            attribute_requests: vec![
                AttributePath::concrete(1, 6, 0),
                AttributePath {
                    endpoint: None,
                    cluster: None,
                    attribute: Some(0xfffd),
                    list_index: None,
                },
            ],
            event_requests: vec![EventPath::concrete(1, 6, 0)],
            fabric_filtered: true,
            interaction_model_revision: None,
        };
        let buf = msg.encode().unwrap();
        let decoded = ReadRequestMessage::decode(&buf).unwrap();
        assert_eq!(decoded.attribute_requests, msg.attribute_requests);
        assert_eq!(decoded.event_requests, msg.event_requests);
        assert!(decoded.fabric_filtered);
        assert_eq!(
            decoded.interaction_model_revision,
            Some(INTERACTION_MODEL_REVISION)
        );
    }

    #[test]
    fn report_data_round_trips_mixed_entries() {
        let msg = DataReportMessage {
            subscription_id: Some(0xdead_0001),
            attribute_reports: vec![
                AttributeReport::Data(AttributeData {
                    data_version: Some(3),
                    path: AttributePath::concrete(1, 6, 0),
                    data: Value::Bool(true),
                }),
                AttributeReport::Status(AttributeStatus {
                    path: AttributePath::concrete(1, 6, 9),
                    status: Status::UnsupportedAttribute,
                }),
            ],
            event_reports: vec![EventReport::Data(EventData {
                path: ConcreteEventPath {
                    endpoint: 1,
                    cluster: 6,
                    event: 0,
                },
                event_number: 41,
                priority: 1,
                data: Value::Structure(vec![(Tag::Context(0), Value::Unsigned(2))]),
            })],
            more_chunked_messages: true,
            suppress_response: false,
        };
        let buf = msg.encode().unwrap();
        assert_eq!(DataReportMessage::decode(&buf).unwrap(), msg);
    }

    #[test]
    fn write_request_round_trips_list_forms() {
        let msg = WriteRequestMessage {
            suppress_response: false,
            timed_request: true,
            write_requests: vec![
                AttributeData {
                    data_version: None,
                    path: AttributePath {
                        endpoint: Some(1),
                        cluster: Some(6),
                        attribute: Some(0x10),
                        list_index: Some(None),
                    },
                    data: Value::Unsigned(4),
                },
            ],
            more_chunked_messages: false,
            interaction_model_revision: None,
        };
        let buf = msg.encode().unwrap();
        let decoded = WriteRequestMessage::decode(&buf).unwrap();
        assert!(decoded.timed_request);
        assert_eq!(decoded.write_requests[0].path.list_index, Some(None));
        assert_eq!(decoded.write_requests[0].data, Value::Unsigned(4));
    }

    #[test]
    fn invoke_round_trips_with_and_without_command_ref() {
        for command_ref in [None, Some(7u16)] {
            let msg = InvokeRequestMessage {
                suppress_response: false,
                timed_request: false,
                invoke_requests: vec![CommandData {
                    path: CommandPath::new(1, 6, 1),
                    fields: Some(Value::Structure(vec![])),
                    command_ref,
                }],
                interaction_model_revision: None,
            };
            let buf = msg.encode().unwrap();
            let decoded = InvokeRequestMessage::decode(&buf).unwrap();
            assert_eq!(decoded.invoke_requests[0].command_ref, command_ref);
        }
    }

    #[test]
    fn invoke_response_entries_round_trip() {
        let msg = InvokeResponseMessage {
            suppress_response: false,
            invoke_responses: vec![
                InvokeResponseEntry::Command(CommandData {
                    path: CommandPath::new(1, 6, 1),
                    fields: Some(Value::Unsigned(1)),
                    command_ref: Some(2),
                }),
                InvokeResponseEntry::Status(CommandStatus {
                    path: CommandPath::new(1, 6, 2),
                    status: Status::UnsupportedCommand,
                    command_ref: Some(3),
                }),
            ],
            more_chunked_messages: false,
        };
        let buf = msg.encode().unwrap();
        assert_eq!(InvokeResponseMessage::decode(&buf).unwrap(), msg);
    }

    #[test]
    fn status_response_round_trips() {
        let buf = StatusResponseMessage::new(Status::Busy).encode().unwrap();
        assert_eq!(
            StatusResponseMessage::decode(&buf).unwrap().status,
            Status::Busy
        );
    }

    #[test]
    fn subscribe_request_round_trips() {
        let msg = SubscribeRequestMessage {
            keep_subscriptions: true,
            min_interval_floor_seconds: 0,
            max_interval_ceiling_seconds: 60,
            attribute_requests: vec![AttributePath::concrete(1, 6, 0)],
            event_requests: vec![],
            fabric_filtered: false,
            interaction_model_revision: None,
        };
        let buf = msg.encode().unwrap();
        let decoded = SubscribeRequestMessage::decode(&buf).unwrap();
        assert!(decoded.keep_subscriptions);
        assert_eq!(decoded.max_interval_ceiling_seconds, 60);
        assert_eq!(decoded.attribute_requests, msg.attribute_requests);
    }
}
