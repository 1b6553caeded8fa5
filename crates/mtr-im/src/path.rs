//! Interaction Model paths.
//!
//! Request paths may be wildcarded (`None` endpoint/cluster/attribute);
//! concrete paths identify exactly one data-model location. `list_index`
//! distinguishes three write forms: absent (plain write / whole-list
//! replace), present-and-null (list append), present-with-value (indexed
//! write).

use mtr_tlv::{ElementValue, Tag, TlvError, TlvReader, TlvWriter};
use serde::{Deserialize, Serialize};

/// Attribute ids defined globally on every cluster. A wildcard-cluster read
/// is only valid for these.
pub const GLOBAL_ATTRIBUTE_IDS: [u32; 5] = [0xfff8, 0xfff9, 0xfffb, 0xfffc, 0xfffd];

pub fn is_global_attribute(id: u32) -> bool {
    GLOBAL_ATTRIBUTE_IDS.contains(&id)
}

// ---------------------------------------------------------------------------
// Attribute paths
// ---------------------------------------------------------------------------

/// A possibly-wildcarded attribute path, as carried in requests and echoed
/// in reports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AttributePath {
    pub endpoint: Option<u16>,
    pub cluster: Option<u32>,
    pub attribute: Option<u32>,
    /// `None` = field absent, `Some(None)` = null (append),
    /// `Some(Some(i))` = indexed element write.
    pub list_index: Option<Option<u16>>,
}

impl AttributePath {
    pub fn concrete(endpoint: u16, cluster: u32, attribute: u32) -> Self {
        AttributePath {
            endpoint: Some(endpoint),
            cluster: Some(cluster),
            attribute: Some(attribute),
            list_index: None,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.endpoint.is_none() || self.cluster.is_none() || self.attribute.is_none()
    }

    pub fn as_concrete(&self) -> Option<ConcreteAttributePath> {
        Some(ConcreteAttributePath {
            endpoint: self.endpoint?,
            cluster: self.cluster?,
            attribute: self.attribute?,
        })
    }

    pub fn matches(&self, concrete: &ConcreteAttributePath) -> bool {
        self.endpoint.is_none_or(|e| e == concrete.endpoint)
            && self.cluster.is_none_or(|c| c == concrete.cluster)
            && self.attribute.is_none_or(|a| a == concrete.attribute)
    }

    // AttributePathIB is a TLV list: 0 tag-compression, 1 node, 2 endpoint,
    // 3 cluster, 4 attribute, 5 list index.
    pub(crate) fn encode(&self, w: &mut TlvWriter, tag: Tag) -> Result<(), TlvError> {
        w.start_list(tag)?;
        if let Some(endpoint) = self.endpoint {
            w.put_unsigned(Tag::Context(2), u64::from(endpoint))?;
        }
        if let Some(cluster) = self.cluster {
            w.put_unsigned(Tag::Context(3), u64::from(cluster))?;
        }
        if let Some(attribute) = self.attribute {
            w.put_unsigned(Tag::Context(4), u64::from(attribute))?;
        }
        match self.list_index {
            None => {}
            Some(None) => {
                w.put_null(Tag::Context(5))?;
            }
            Some(Some(index)) => {
                w.put_unsigned(Tag::Context(5), u64::from(index))?;
            }
        }
        w.end_container()?;
        Ok(())
    }

    /// Decode the list contents; the opening element has been consumed.
    pub(crate) fn decode(r: &mut TlvReader<'_>) -> Result<Self, TlvError> {
        let mut path = AttributePath::default();
        while let Some(element) = r.next()? {
            match (&element.tag, &element.value) {
                (_, ElementValue::ContainerEnd) => return Ok(path),
                (Tag::Context(2), v) => path.endpoint = Some(v.as_unsigned()? as u16),
                (Tag::Context(3), v) => path.cluster = Some(v.as_unsigned()? as u32),
                (Tag::Context(4), v) => path.attribute = Some(v.as_unsigned()? as u32),
                (Tag::Context(5), ElementValue::Null) => path.list_index = Some(None),
                (Tag::Context(5), v) => path.list_index = Some(Some(v.as_unsigned()? as u16)),
                _ => r.skip_value(&element)?,
            }
        }
        Err(TlvError::UnexpectedEnd)
    }
}

impl std::fmt::Display for AttributePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn part<T: std::fmt::Display>(v: Option<T>) -> String {
            v.map_or_else(|| "*".to_owned(), |x| x.to_string())
        }
        write!(
            f,
            "{}/{}/{}",
            part(self.endpoint),
            part(self.cluster),
            part(self.attribute)
        )
    }
}

/// A fully resolved attribute location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConcreteAttributePath {
    pub endpoint: u16,
    pub cluster: u32,
    pub attribute: u32,
}

impl From<ConcreteAttributePath> for AttributePath {
    fn from(c: ConcreteAttributePath) -> Self {
        AttributePath::concrete(c.endpoint, c.cluster, c.attribute)
    }
}

impl std::fmt::Display for ConcreteAttributePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.endpoint, self.cluster, self.attribute)
    }
}

// ---------------------------------------------------------------------------
// Event paths
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EventPath {
    pub endpoint: Option<u16>,
    pub cluster: Option<u32>,
    pub event: Option<u32>,
}

impl EventPath {
    pub fn concrete(endpoint: u16, cluster: u32, event: u32) -> Self {
        EventPath {
            endpoint: Some(endpoint),
            cluster: Some(cluster),
            event: Some(event),
        }
    }

    // EventPathIB list: 0 node, 1 endpoint, 2 cluster, 3 event, 4 urgent.
    pub(crate) fn encode(&self, w: &mut TlvWriter, tag: Tag) -> Result<(), TlvError> {
        w.start_list(tag)?;
        if let Some(endpoint) = self.endpoint {
            w.put_unsigned(Tag::Context(1), u64::from(endpoint))?;
        }
        if let Some(cluster) = self.cluster {
            w.put_unsigned(Tag::Context(2), u64::from(cluster))?;
        }
        if let Some(event) = self.event {
            w.put_unsigned(Tag::Context(3), u64::from(event))?;
        }
        w.end_container()?;
        Ok(())
    }

    pub(crate) fn decode(r: &mut TlvReader<'_>) -> Result<Self, TlvError> {
        let mut path = EventPath::default();
        while let Some(element) = r.next()? {
            match (&element.tag, &element.value) {
                (_, ElementValue::ContainerEnd) => return Ok(path),
                (Tag::Context(1), v) => path.endpoint = Some(v.as_unsigned()? as u16),
                (Tag::Context(2), v) => path.cluster = Some(v.as_unsigned()? as u32),
                (Tag::Context(3), v) => path.event = Some(v.as_unsigned()? as u32),
                _ => r.skip_value(&element)?,
            }
        }
        Err(TlvError::UnexpectedEnd)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConcreteEventPath {
    pub endpoint: u16,
    pub cluster: u32,
    pub event: u32,
}

impl From<ConcreteEventPath> for EventPath {
    fn from(c: ConcreteEventPath) -> Self {
        EventPath::concrete(c.endpoint, c.cluster, c.event)
    }
}

// ---------------------------------------------------------------------------
// Command paths
// ---------------------------------------------------------------------------

/// Command paths are always concrete in invokes this node handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandPath {
    pub endpoint: u16,
    pub cluster: u32,
    pub command: u32,
}

impl CommandPath {
    pub fn new(endpoint: u16, cluster: u32, command: u32) -> Self {
        CommandPath {
            endpoint,
            cluster,
            command,
        }
    }

    // CommandPathIB list: 0 endpoint, 1 cluster, 2 command.
    pub(crate) fn encode(&self, w: &mut TlvWriter, tag: Tag) -> Result<(), TlvError> {
        w.start_list(tag)?;
        w.put_unsigned(Tag::Context(0), u64::from(self.endpoint))?;
        w.put_unsigned(Tag::Context(1), u64::from(self.cluster))?;
        w.put_unsigned(Tag::Context(2), u64::from(self.command))?;
        w.end_container()?;
        Ok(())
    }

    pub(crate) fn decode(r: &mut TlvReader<'_>) -> Result<Self, TlvError> {
        let mut endpoint = None;
        let mut cluster = None;
        let mut command = None;
        while let Some(element) = r.next()? {
            match (&element.tag, &element.value) {
                (_, ElementValue::ContainerEnd) => {
                    return Ok(CommandPath {
                        endpoint: endpoint.ok_or(TlvError::MissingElement(Tag::Context(0)))?,
                        cluster: cluster.ok_or(TlvError::MissingElement(Tag::Context(1)))?,
                        command: command.ok_or(TlvError::MissingElement(Tag::Context(2)))?,
                    });
                }
                (Tag::Context(0), v) => endpoint = Some(v.as_unsigned()? as u16),
                (Tag::Context(1), v) => cluster = Some(v.as_unsigned()? as u32),
                (Tag::Context(2), v) => command = Some(v.as_unsigned()? as u32),
                _ => r.skip_value(&element)?,
            }
        }
        Err(TlvError::UnexpectedEnd)
    }
}

impl std::fmt::Display for CommandPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.endpoint, self.cluster, self.command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip_attr(path: &AttributePath) -> AttributePath {
        let mut w = TlvWriter::new();
        path.encode(&mut w, Tag::Anonymous).unwrap();
        let buf = w.finish().unwrap();
        let mut r = TlvReader::new(&buf);
        let open = r.next().unwrap().unwrap();
        assert!(matches!(open.value, ElementValue::ContainerStart(_)));
        AttributePath::decode(&mut r).unwrap()
    }

    #[test]
    fn attribute_path_round_trips_all_list_index_forms() {
        for list_index in [None, Some(None), Some(Some(3))] {
            let path = AttributePath {
                endpoint: Some(1),
                cluster: Some(6),
                attribute: Some(0),
                list_index,
            };
            assert_eq!(round_trip_attr(&path), path);
        }
    }

    #[test]
    fn wildcard_fields_are_omitted_on_the_wire() {
        let path = AttributePath {
            endpoint: None,
            cluster: Some(6),
            attribute: Some(0xfffd),
            list_index: None,
        };
        assert_eq!(round_trip_attr(&path), path);
        assert!(path.is_wildcard());
        assert!(path.as_concrete().is_none());
    }

    #[test]
    fn wildcard_matching() {
        let concrete = ConcreteAttributePath {
            endpoint: 1,
            cluster: 6,
            attribute: 0,
        };
        let all = AttributePath::default();
        assert!(all.matches(&concrete));
        let other_cluster = AttributePath {
            cluster: Some(8),
            ..AttributePath::default()
        };
        assert!(!other_cluster.matches(&concrete));
    }

    #[test]
    fn global_attribute_ids() {
        assert!(is_global_attribute(0xfffd));
        assert!(!is_global_attribute(0));
    }

    #[test]
    fn command_path_requires_all_fields() {
        let mut w = TlvWriter::new();
        w.start_list(Tag::Anonymous).unwrap();
        w.put_unsigned(Tag::Context(0), 1).unwrap();
        w.end_container().unwrap();
        let buf = w.finish().unwrap();
        let mut r = TlvReader::new(&buf);
        r.next().unwrap().unwrap();
        assert!(CommandPath::decode(&mut r).is_err());
    }
}
