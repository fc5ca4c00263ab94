//! Event normalization
//!
//! Maps raw change records onto the schema-stable [`NormalizedEvent`]. The
//! mapping is pure apart from the capture timestamp: identifier-like and
//! temporal values are rendered as canonical strings at any nesting depth so
//! that no source-specific wire type leaks downstream.

use crate::error::{CdcError, Result};
use crate::message::{
    ChangeKind, ChangePayload, DocValue, Document, Identifier, NormalizedEvent, RawChangeRecord,
    Temporal,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Number, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Render a document value as a string-safe JSON value
///
/// Scalars and plain strings pass through unchanged; mappings and lists are
/// walked recursively.
pub fn canonicalize(value: &DocValue) -> Value {
    match value {
        DocValue::Null => Value::Null,
        DocValue::Bool(b) => Value::Bool(*b),
        DocValue::Int(i) => Value::Number((*i).into()),
        DocValue::Float(f) => match Number::from_f64(*f) {
            Some(n) => Value::Number(n),
            None => Value::String(f.to_string()),
        },
        DocValue::String(s) => Value::String(s.clone()),
        DocValue::Document(doc) => Value::Object(canonicalize_document(doc)),
        DocValue::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        DocValue::Identifier(id) => Value::String(identifier_string(id)),
        DocValue::Temporal(t) => Value::String(temporal_string(t)),
    }
}

/// Canonicalize every field of a document
pub fn canonicalize_document(doc: &Document) -> Map<String, Value> {
    doc.iter()
        .map(|(key, value)| (key.clone(), canonicalize(value)))
        .collect()
}

/// Canonical string form of any value, used for document keys
///
/// Strings are returned verbatim; mappings and lists become compact JSON of
/// their canonicalized form.
pub fn canonical_string(value: &DocValue) -> String {
    match value {
        DocValue::String(s) => s.clone(),
        DocValue::Identifier(id) => identifier_string(id),
        DocValue::Temporal(t) => temporal_string(t),
        other => match canonicalize(other) {
            Value::String(s) => s,
            rendered => rendered.to_string(),
        },
    }
}

fn identifier_string(id: &Identifier) -> String {
    match id {
        Identifier::ObjectId(bytes) => hex::encode(bytes),
        Identifier::Uuid(uuid) => uuid.hyphenated().to_string(),
        Identifier::Binary { bytes, .. } => hex::encode(bytes),
        Identifier::Decimal(text) | Identifier::Symbol(text) => text.clone(),
    }
}

fn temporal_string(t: &Temporal) -> String {
    match t {
        Temporal::DateTime(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        Temporal::Timestamp { seconds, increment } => format!("{}:{}", seconds, increment),
    }
}

/// Capture clock used to stamp events
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Raw record → normalized event mapper
///
/// Holds no state that influences the mapping. The sequence counter only
/// numbers normalized records for tracing.
pub struct Normalizer {
    clock: Clock,
    sequence: AtomicU64,
}

impl Normalizer {
    /// Create normalizer stamping events with the wall clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(Utc::now))
    }

    /// Create normalizer with an explicit capture clock
    pub fn with_clock(clock: Clock) -> Self {
        Self {
            clock,
            sequence: AtomicU64::new(0),
        }
    }

    /// Number of records normalized so far
    pub fn normalized_count(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }

    /// Map one raw change record
    ///
    /// Fails with [`CdcError::MalformedRecord`] when a field required by the
    /// record's operation is missing.
    pub fn normalize(&self, record: &RawChangeRecord) -> Result<NormalizedEvent> {
        let namespace = record
            .namespace
            .clone()
            .ok_or_else(|| CdcError::malformed("record has no namespace"))?;

        let document_key = record
            .document_key
            .as_ref()
            .and_then(|key| key.get("_id"))
            .map(canonical_string)
            .ok_or_else(|| {
                CdcError::malformed(format!(
                    "{} record in {} has no document key",
                    record.operation, namespace
                ))
            })?;

        let change = match &record.operation {
            ChangeKind::Insert => {
                let document = record.full_document.as_ref().ok_or_else(|| {
                    CdcError::malformed(format!(
                        "insert of {} carries no full document",
                        document_key
                    ))
                })?;
                ChangePayload::Insert(canonicalize_document(document))
            }
            ChangeKind::Update => {
                let delta = record.update.as_ref().ok_or_else(|| {
                    CdcError::malformed(format!(
                        "update of {} carries no update description",
                        document_key
                    ))
                })?;
                ChangePayload::Update {
                    updated_fields: canonicalize_document(&delta.updated_fields),
                    removed_fields: delta.removed_fields.clone(),
                }
            }
            ChangeKind::Delete => ChangePayload::Delete,
            ChangeKind::Other(kind) => {
                return Err(CdcError::malformed(format!(
                    "unsupported operation '{}' for {}",
                    kind, document_key
                )))
            }
        };

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(
            sequence,
            %namespace,
            document_key = %document_key,
            operation = %record.operation,
            "Normalized record"
        );

        Ok(NormalizedEvent {
            timestamp: (self.clock)(),
            namespace,
            document_key,
            change,
        })
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}
