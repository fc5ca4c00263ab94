//! Message types for the CDC relay
//!
//! Defines the raw change record produced by a change feed, the self-describing
//! document value model it carries, and the normalized event envelope that is
//! published downstream.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Operations and namespaces
// ============================================================================

/// Operation kind as reported by the change feed
///
/// Feeds also emit structural events (drops, renames, invalidations) that the
/// subscriber discards before they reach the normalizer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    Other(String),
}

impl ChangeKind {
    /// Parse a feed operation name
    pub fn parse(name: &str) -> Self {
        match name {
            "insert" => Self::Insert,
            "update" => Self::Update,
            "delete" => Self::Delete,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether this record describes a data mutation that should be relayed
    pub fn is_data_change(&self) -> bool {
        self.operation().is_some()
    }

    /// The normalized operation, if this is a data change
    pub fn operation(&self) -> Option<OperationKind> {
        match self {
            Self::Insert => Some(OperationKind::Insert),
            Self::Update => Some(OperationKind::Update),
            Self::Delete => Some(OperationKind::Delete),
            Self::Other(_) => None,
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => f.write_str("insert"),
            Self::Update => f.write_str("update"),
            Self::Delete => f.write_str("delete"),
            Self::Other(name) => f.write_str(name),
        }
    }
}

/// Normalized operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical database + collection identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

// ============================================================================
// Resume positions
// ============================================================================

/// Opaque, totally ordered marker for one record in the change feed
///
/// The relay never interprets the contents; it only hands tokens back to the
/// feed that issued them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(String);

impl ResumeToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Token of the most recently acknowledged-published record
///
/// `None` means "no position": the feed starts from its own default point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePosition(Option<ResumeToken>);

impl ResumePosition {
    /// No position; subscribe from the feed's default starting point
    pub fn start() -> Self {
        Self(None)
    }

    /// Resume strictly after the given token
    pub fn after(token: ResumeToken) -> Self {
        Self(Some(token))
    }

    /// Move the position forward to the given token
    pub fn advance(&mut self, token: ResumeToken) {
        self.0 = Some(token);
    }

    pub fn token(&self) -> Option<&ResumeToken> {
        self.0.as_ref()
    }

    pub fn is_start(&self) -> bool {
        self.0.is_none()
    }
}

impl fmt::Display for ResumePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(token) => write!(f, "{}", token),
            None => f.write_str("<start>"),
        }
    }
}

// ============================================================================
// Document values
// ============================================================================

/// Self-describing document value as delivered by the source database
///
/// The variant set is closed: every native source type is mapped onto one of
/// scalar, string, mapping, list, identifier-like or temporal.
#[derive(Debug, Clone, PartialEq)]
pub enum DocValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Document(Document),
    Array(Vec<DocValue>),
    Identifier(Identifier),
    Temporal(Temporal),
}

/// Identifier-like values that have no portable wire representation
#[derive(Debug, Clone, PartialEq)]
pub enum Identifier {
    /// 12-byte database object identifier
    ObjectId([u8; 12]),
    Uuid(Uuid),
    Binary { subtype: u8, bytes: Vec<u8> },
    /// High-precision decimal, already in its textual form
    Decimal(String),
    /// Regex, code and symbol values, already in textual form
    Symbol(String),
}

/// Temporal values
#[derive(Debug, Clone, PartialEq)]
pub enum Temporal {
    DateTime(DateTime<Utc>),
    /// Internal logical clock: seconds since epoch + ordinal within the second
    Timestamp { seconds: u32, increment: u32 },
}

impl DocValue {
    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Self::Document(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn object_id(bytes: [u8; 12]) -> Self {
        Self::Identifier(Identifier::ObjectId(bytes))
    }

    pub fn datetime(value: DateTime<Utc>) -> Self {
        Self::Temporal(Temporal::DateTime(value))
    }
}

impl From<&str> for DocValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for DocValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for DocValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for DocValue {
    fn from(value: i32) -> Self {
        Self::Int(value as i64)
    }
}

impl From<f64> for DocValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for DocValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Document> for DocValue {
    fn from(value: Document) -> Self {
        Self::Document(value)
    }
}

impl From<Vec<DocValue>> for DocValue {
    fn from(value: Vec<DocValue>) -> Self {
        Self::Array(value)
    }
}

/// Ordered field mapping
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    fields: Vec<(String, DocValue)>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: append a field
    pub fn with(mut self, key: impl Into<String>, value: impl Into<DocValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert or replace a field, keeping original order
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<DocValue>) {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = value,
            None => self.fields.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&DocValue> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &DocValue)> {
        self.fields.iter().map(|(k, v)| (k, v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl FromIterator<(String, DocValue)> for Document {
    fn from_iter<T: IntoIterator<Item = (String, DocValue)>>(iter: T) -> Self {
        let mut doc = Self::new();
        for (key, value) in iter {
            doc.insert(key, value);
        }
        doc
    }
}

// ============================================================================
// Raw change records
// ============================================================================

/// Changed fields and removed field names of an update
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateDelta {
    pub updated_fields: Document,
    pub removed_fields: Vec<String>,
}

/// One mutation as delivered by the change feed
///
/// Fields other than the operation and resume token are optional because the
/// feed is not trusted to be well-formed; the normalizer enforces which ones
/// each operation requires.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChangeRecord {
    pub operation: ChangeKind,
    pub namespace: Option<Namespace>,
    /// Key document identifying the changed document (carries `_id`)
    pub document_key: Option<Document>,
    pub full_document: Option<Document>,
    pub update: Option<UpdateDelta>,
    pub resume_token: ResumeToken,
}

impl RawChangeRecord {
    fn base(operation: ChangeKind, namespace: Namespace, id: DocValue, token: ResumeToken) -> Self {
        Self {
            operation,
            namespace: Some(namespace),
            document_key: Some(Document::new().with("_id", id)),
            full_document: None,
            update: None,
            resume_token: token,
        }
    }

    /// Create an insert record
    pub fn insert(
        namespace: Namespace,
        id: impl Into<DocValue>,
        document: Document,
        token: ResumeToken,
    ) -> Self {
        let mut record = Self::base(ChangeKind::Insert, namespace, id.into(), token);
        record.full_document = Some(document);
        record
    }

    /// Create an update record
    pub fn update(
        namespace: Namespace,
        id: impl Into<DocValue>,
        delta: UpdateDelta,
        token: ResumeToken,
    ) -> Self {
        let mut record = Self::base(ChangeKind::Update, namespace, id.into(), token);
        record.update = Some(delta);
        record
    }

    /// Create a delete record
    pub fn delete(namespace: Namespace, id: impl Into<DocValue>, token: ResumeToken) -> Self {
        Self::base(ChangeKind::Delete, namespace, id.into(), token)
    }

    /// Create a structural (non-data) record
    pub fn structural(
        kind: impl Into<String>,
        namespace: Option<Namespace>,
        token: ResumeToken,
    ) -> Self {
        Self {
            operation: ChangeKind::Other(kind.into()),
            namespace,
            document_key: None,
            full_document: None,
            update: None,
            resume_token: token,
        }
    }
}

// ============================================================================
// Normalized events
// ============================================================================

/// Operation-dependent payload
///
/// Serialized adjacently tagged so the wire carries `operation` next to
/// `payload`, and a payload can never disagree with its operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "payload", rename_all = "snake_case")]
pub enum ChangePayload {
    /// Full document snapshot
    Insert(serde_json::Map<String, serde_json::Value>),
    Update {
        updated_fields: serde_json::Map<String, serde_json::Value>,
        removed_fields: Vec<String>,
    },
    Delete,
}

impl ChangePayload {
    pub fn operation(&self) -> OperationKind {
        match self {
            Self::Insert(_) => OperationKind::Insert,
            Self::Update { .. } => OperationKind::Update,
            Self::Delete => OperationKind::Delete,
        }
    }
}

/// Schema-stable event envelope published downstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// Capture time, not source commit time
    pub timestamp: DateTime<Utc>,
    pub namespace: Namespace,
    pub document_key: String,
    #[serde(flatten)]
    pub change: ChangePayload,
}

impl NormalizedEvent {
    pub fn operation(&self) -> OperationKind {
        self.change.operation()
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    /// Size of the serialized event in bytes
    pub fn size_bytes(&self) -> Result<usize, serde_json::Error> {
        serde_json::to_vec(self).map(|bytes| bytes.len())
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Broker acknowledgment of a durable write
///
/// Carries no correctness obligation; it is logged and exported as metrics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMetadata {
    /// Destination log (topic or stream)
    pub destination: String,
    /// Partition within the destination (0 for single-log transports)
    pub partition: i32,
    /// Position of the write within the partition
    pub offset: u64,
    /// Serialized payload size in bytes
    pub size_bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_event(change: ChangePayload) -> NormalizedEvent {
        NormalizedEvent {
            timestamp: DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            namespace: Namespace::new("etl_db", "orders"),
            document_key: "65e1f0a2b3c4d5e6f7a8b9c0".to_string(),
            change,
        }
    }

    #[test]
    fn test_wire_shape_update() {
        let mut updated = serde_json::Map::new();
        updated.insert("amount".into(), json!(25.0));
        let event = sample_event(ChangePayload::Update {
            updated_fields: updated,
            removed_fields: vec!["promo_code".into()],
        });

        let wire: serde_json::Value = serde_json::from_slice(&event.to_bytes().unwrap()).unwrap();
        assert_eq!(wire["operation"], "update");
        assert_eq!(wire["namespace"]["database"], "etl_db");
        assert_eq!(wire["namespace"]["collection"], "orders");
        assert_eq!(wire["document_key"], "65e1f0a2b3c4d5e6f7a8b9c0");
        assert_eq!(wire["payload"]["updated_fields"]["amount"], json!(25.0));
        assert_eq!(wire["payload"]["removed_fields"], json!(["promo_code"]));
    }

    #[test]
    fn test_delete_has_no_payload() {
        let event = sample_event(ChangePayload::Delete);
        let wire: serde_json::Value = serde_json::from_slice(&event.to_bytes().unwrap()).unwrap();

        assert_eq!(wire["operation"], "delete");
        assert!(wire.get("payload").is_none());

        let restored = NormalizedEvent::from_bytes(&event.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.operation(), OperationKind::Delete);
        assert_eq!(restored, event);
    }

    #[test]
    fn test_change_kind_filtering() {
        assert!(ChangeKind::parse("insert").is_data_change());
        assert!(ChangeKind::parse("delete").is_data_change());
        assert!(!ChangeKind::parse("drop").is_data_change());
        assert!(!ChangeKind::parse("invalidate").is_data_change());
        assert_eq!(ChangeKind::parse("rename").to_string(), "rename");
        assert_eq!(ChangeKind::Update.to_string(), "update");
    }

    #[test]
    fn test_resume_position_advance() {
        let mut position = ResumePosition::start();
        assert!(position.is_start());
        assert_eq!(position.to_string(), "<start>");

        position.advance(ResumeToken::new("8265E1"));
        assert_eq!(position.token().map(ResumeToken::as_str), Some("8265E1"));
    }

    #[test]
    fn test_document_insert_replaces_in_place() {
        let mut doc = Document::new().with("a", 1).with("b", "x");
        doc.insert("a", 2);
        assert_eq!(doc.len(), 2);
        assert_eq!(doc.get("a"), Some(&DocValue::Int(2)));
        assert_eq!(doc.iter().next().map(|(k, _)| k.as_str()), Some("a"));
    }
}
