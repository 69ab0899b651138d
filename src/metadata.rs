//! Buffer metadata records.
//!
//! The media framework attaches a string-keyed record to every buffer it
//! hands a stage. [`Metadata`] is that record; [`FrameMeta`] is the typed
//! view of the keys edgeflow reads and writes.

use crate::dispatch::RequestId;
use crate::error::{Error, Result};
use rkyv::{Archive, Deserialize, Serialize};

/// Key of the buffer id (physical address of the parent segment).
pub const BUFFER_ID: &str = "buffer-id";
/// Key of the producing segment or stage name.
pub const BUFFER_NAME: &str = "buffer-name";
/// Key of the byte offset of valid data within the buffer.
pub const BUFFER_OFFSET: &str = "buffer-offset";
/// Key of the frame number.
pub const FRAME_ID: &str = "frame-id";
/// Key of the stream identifier.
pub const STREAM_ID: &str = "stream-id";
/// Key of the capture timestamp.
pub const TIMESTAMP: &str = "timestamp";
/// Key of the id of a PCIe host-side copy, when one exists.
pub const PCIE_BUFFER_ID: &str = "pcie-buffer-id";

/// A key-value pair for extra metadata.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct ExtraField {
    /// Field name.
    pub key: String,
    /// Field value.
    pub value: MetadataValue,
}

/// Possible values for metadata fields.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum MetadataValue {
    /// String value.
    String(String),
    /// Signed integer value.
    Int(i64),
    /// Unsigned integer value.
    UInt(u64),
    /// Boolean value.
    Bool(bool),
}

impl MetadataValue {
    fn type_name(&self) -> &'static str {
        match self {
            MetadataValue::String(_) => "string",
            MetadataValue::Int(_) => "int64",
            MetadataValue::UInt(_) => "uint64",
            MetadataValue::Bool(_) => "bool",
        }
    }
}

/// String-keyed metadata attached to a buffer.
#[derive(Debug, Clone, Default, PartialEq, Archive, Serialize, Deserialize)]
pub struct Metadata {
    /// Record fields, in insertion order.
    pub fields: Vec<ExtraField>,
}

impl Metadata {
    /// Create an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a field.
    pub fn with_field(mut self, key: impl Into<String>, value: MetadataValue) -> Self {
        self.set(key, value);
        self
    }

    /// Add or replace a field.
    pub fn set(&mut self, key: impl Into<String>, value: MetadataValue) {
        let key = key.into();
        match self.fields.iter_mut().find(|f| f.key == key) {
            Some(field) => field.value = value,
            None => self.fields.push(ExtraField { key, value }),
        }
    }

    /// Get a field by key.
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.fields.iter().find(|f| f.key == key).map(|f| &f.value)
    }

    /// Remove a field, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<MetadataValue> {
        let index = self.fields.iter().position(|f| f.key == key)?;
        Some(self.fields.remove(index).value)
    }

    fn require(&self, key: &str) -> Result<&MetadataValue> {
        self.get(key)
            .ok_or_else(|| Error::ConfigMismatch(format!("metadata has no '{key}' field")))
    }

    fn require_int(&self, key: &str) -> Result<i64> {
        match self.require(key)? {
            MetadataValue::Int(v) => Ok(*v),
            other => Err(mistyped(key, "int64", other)),
        }
    }
}

fn mistyped(key: &str, expected: &str, found: &MetadataValue) -> Error {
    Error::ConfigMismatch(format!(
        "metadata field '{key}' is {}, expected {expected}",
        found.type_name()
    ))
}

/// Typed view of the per-frame record exchanged between stages.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FrameMeta {
    /// Id of the buffer holding the frame.
    pub buffer_id: i64,
    /// Name of the segment or stage that produced it.
    pub buffer_name: String,
    /// Offset of valid data within the buffer.
    pub buffer_offset: i64,
    /// Frame number within the stream.
    pub frame_id: i64,
    /// Stream identifier.
    pub stream_id: String,
    /// Capture timestamp.
    pub timestamp: u64,
    /// Id of a PCIe host-side copy.
    pub pcie_buffer_id: Option<i64>,
}

impl FrameMeta {
    /// Write every field into a metadata record.
    pub fn apply_to(&self, meta: &mut Metadata) {
        meta.set(BUFFER_ID, MetadataValue::Int(self.buffer_id));
        meta.set(BUFFER_NAME, MetadataValue::String(self.buffer_name.clone()));
        meta.set(BUFFER_OFFSET, MetadataValue::Int(self.buffer_offset));
        meta.set(FRAME_ID, MetadataValue::Int(self.frame_id));
        meta.set(STREAM_ID, MetadataValue::String(self.stream_id.clone()));
        meta.set(TIMESTAMP, MetadataValue::UInt(self.timestamp));
        match self.pcie_buffer_id {
            Some(id) => meta.set(PCIE_BUFFER_ID, MetadataValue::Int(id)),
            None => {
                meta.remove(PCIE_BUFFER_ID);
            }
        }
    }

    /// Read the typed fields back out of a record.
    pub fn from_metadata(meta: &Metadata) -> Result<Self> {
        let string = |key: &str| match meta.require(key)? {
            MetadataValue::String(s) => Ok(s.clone()),
            other => Err(mistyped(key, "string", other)),
        };
        let timestamp = match meta.require(TIMESTAMP)? {
            MetadataValue::UInt(v) => *v,
            other => return Err(mistyped(TIMESTAMP, "uint64", other)),
        };
        let pcie_buffer_id = match meta.get(PCIE_BUFFER_ID) {
            None => None,
            Some(MetadataValue::Int(v)) => Some(*v),
            Some(other) => return Err(mistyped(PCIE_BUFFER_ID, "int64", other)),
        };

        Ok(Self {
            buffer_id: meta.require_int(BUFFER_ID)?,
            buffer_name: string(BUFFER_NAME)?,
            buffer_offset: meta.require_int(BUFFER_OFFSET)?,
            frame_id: meta.require_int(FRAME_ID)?,
            stream_id: string(STREAM_ID)?,
            timestamp,
            pcie_buffer_id,
        })
    }

    /// Buffer id as the unsigned value caches and devices use.
    pub fn buffer_id(&self) -> u64 {
        self.buffer_id as u64
    }

    /// Request id of the job a stage named `node` runs on this frame.
    pub fn request_id(&self, node: &str) -> RequestId {
        RequestId::derive(node, &self.stream_id, self.frame_id as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FrameMeta {
        FrameMeta {
            buffer_id: 0x1_0000_2000,
            buffer_name: "ofm0".into(),
            buffer_offset: 0,
            frame_id: 17,
            stream_id: "cam0".into(),
            timestamp: 1_700_000_000,
            pcie_buffer_id: None,
        }
    }

    #[test]
    fn test_frame_meta_through_record() {
        let mut meta = Metadata::new().with_field("app/other", MetadataValue::Bool(true));
        let frame = sample();
        frame.apply_to(&mut meta);

        assert_eq!(FrameMeta::from_metadata(&meta).unwrap(), frame);
        assert_eq!(meta.get("app/other"), Some(&MetadataValue::Bool(true)));
        assert!(meta.get(PCIE_BUFFER_ID).is_none());
    }

    #[test]
    fn test_optional_pcie_id() {
        let mut meta = Metadata::new();
        let mut frame = sample();
        frame.pcie_buffer_id = Some(99);
        frame.apply_to(&mut meta);
        assert_eq!(FrameMeta::from_metadata(&meta).unwrap().pcie_buffer_id, Some(99));

        frame.pcie_buffer_id = None;
        frame.apply_to(&mut meta);
        assert_eq!(FrameMeta::from_metadata(&meta).unwrap().pcie_buffer_id, None);
    }

    #[test]
    fn test_missing_and_mistyped_fields() {
        let mut meta = Metadata::new();
        sample().apply_to(&mut meta);

        meta.remove(STREAM_ID);
        let err = FrameMeta::from_metadata(&meta).unwrap_err();
        assert!(err.to_string().contains("stream-id"));

        meta.set(STREAM_ID, MetadataValue::Int(3));
        let err = FrameMeta::from_metadata(&meta).unwrap_err();
        assert!(matches!(err, Error::ConfigMismatch(ref m) if m.contains("expected string")));
    }

    #[test]
    fn test_set_replaces() {
        let mut meta = Metadata::new();
        meta.set(FRAME_ID, MetadataValue::Int(1));
        meta.set(FRAME_ID, MetadataValue::Int(2));
        assert_eq!(meta.fields.len(), 1);
        assert_eq!(meta.get(FRAME_ID), Some(&MetadataValue::Int(2)));
    }

    #[test]
    fn test_request_id_uses_stream_and_frame() {
        let frame = sample();
        let id = frame.request_id("detess");
        assert_eq!(id, RequestId::derive("detess", "cam0", 17));
        assert_eq!(id.frame(), 17);
    }

    #[test]
    fn test_record_archives() {
        let mut meta = Metadata::new();
        sample().apply_to(&mut meta);

        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&meta).unwrap();
        let back = rkyv::from_bytes::<Metadata, rkyv::rancor::Error>(&bytes).unwrap();
        assert_eq!(back, meta);
    }
}
