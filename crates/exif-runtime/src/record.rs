use crate::script::BINARY_PLACEHOLDER;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tags extracted from one file, keyed by tag name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataRecord(Map<String, Value>);

impl MetadataRecord {
    /// Decode the JSON object printed by the read program.
    pub(crate) fn from_guest_output(output: &str) -> Result<Self> {
        serde_json::from_str(output).map_err(|e| Error::ResultDecode {
            operation: "read metadata",
            reason: e.to_string(),
            output: output.to_string(),
        })
    }

    /// Value of `tag`, if present.
    pub fn get(&self, tag: &str) -> Option<&Value> {
        self.0.get(tag)
    }

    /// Value of `tag` when it is a JSON string.
    pub fn get_str(&self, tag: &str) -> Option<&str> {
        self.0.get(tag).and_then(Value::as_str)
    }

    /// Value of `tag` when it is a JSON number representable as `i64`.
    pub fn get_i64(&self, tag: &str) -> Option<i64> {
        self.0.get(tag).and_then(Value::as_i64)
    }

    /// Whether `tag` holds binary data that was replaced by the placeholder.
    pub fn is_binary(&self, tag: &str) -> bool {
        self.get_str(tag) == Some(BINARY_PLACEHOLDER)
    }

    /// Insert or replace a tag.
    pub fn insert(&mut self, tag: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(tag.into(), value.into())
    }

    /// Number of tags.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the record has no tags.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over `(tag, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// The underlying JSON map.
    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for MetadataRecord {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Successful outcome of a metadata write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// The file was rewritten.
    Written,
    /// The file was rewritten but ExifTool reported warnings.
    WrittenWithWarnings,
}

impl WriteStatus {
    /// Interpret the value printed by the write program.
    pub(crate) fn from_guest_output(output: &str, stderr: &str) -> Result<Self> {
        match output.trim() {
            "1" => Ok(WriteStatus::Written),
            "2" => Ok(WriteStatus::WrittenWithWarnings),
            "0" => Err(Error::WriteRejected {
                stderr: stderr.to_string(),
            }),
            _ => Err(Error::ResultDecode {
                operation: "write metadata",
                reason: "expected 0, 1 or 2".to_string(),
                output: output.to_string(),
            }),
        }
    }
}
