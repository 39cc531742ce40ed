//! Record translation between the document store's native representation
//! and the CRDT document's keyed-entry representation.
//!
//! Entries are stored as JSON strings under the record id, so the CRDT
//! layer never needs to understand record internals: a whole record is one
//! opaque last-writer-wins value.

use easel_store::{Record, SchemaDescriptor};

#[derive(Clone, Debug)]
pub enum TranslateError {
    Encode(String),
    Decode(String),
}

impl std::fmt::Display for TranslateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(detail) => write!(f, "record encode failed: {detail}"),
            Self::Decode(detail) => write!(f, "record decode failed: {detail}"),
        }
    }
}

impl std::error::Error for TranslateError {}

/// Encode a record into its keyed-entry value.
pub fn encode_record(record: &Record) -> Result<String, TranslateError> {
    serde_json::to_string(record).map_err(|e| TranslateError::Encode(e.to_string()))
}

/// Decode a keyed-entry value back into a record.
pub fn decode_record(entry: &str) -> Result<Record, TranslateError> {
    serde_json::from_str(entry).map_err(|e| TranslateError::Decode(e.to_string()))
}

/// Decode a keyed-entry value into its raw JSON form, for schema
/// migration passes that run before the record shape is trusted.
pub fn decode_raw(entry: &str) -> Result<serde_json::Value, TranslateError> {
    serde_json::from_str(entry).map_err(|e| TranslateError::Decode(e.to_string()))
}

/// Decode a migrated raw value into a record.
pub fn record_from_raw(value: serde_json::Value) -> Result<Record, TranslateError> {
    serde_json::from_value(value).map_err(|e| TranslateError::Decode(e.to_string()))
}

/// Encode a schema descriptor into the meta record's value.
pub fn encode_descriptor(descriptor: &SchemaDescriptor) -> Result<String, TranslateError> {
    serde_json::to_string(descriptor).map_err(|e| TranslateError::Encode(e.to_string()))
}

/// Decode the meta record's value back into a schema descriptor.
pub fn decode_descriptor(entry: &str) -> Result<SchemaDescriptor, TranslateError> {
    serde_json::from_str(entry).map_err(|e| TranslateError::Decode(e.to_string()))
}
