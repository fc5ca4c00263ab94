//! Change feed strategies
//!
//! Implements the ChangeFeed strategy trait with two backends:
//! - MongoChangeFeed: MongoDB change streams
//! - MockFeed: in-memory history with a retention window, for testing

use async_trait::async_trait;
use cdc_core::prelude::*;
use cdc_core::{FeedConfig, Identifier, Temporal, UpdateDelta};
use futures::{stream, StreamExt};
use mongodb::bson::{self, doc, spec::BinarySubtype, Bson};
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType};
use mongodb::error::ErrorKind;
use mongodb::options::{ClientOptions, Credential};
use mongodb::Client;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

const COMPONENT: &str = "feed";

/// Server error codes meaning the resume point has left the oplog
const CHANGE_STREAM_FATAL_ERROR: i32 = 280;
const CHANGE_STREAM_HISTORY_LOST: i32 = 286;

// ============================================================================
// MongoDB Change Stream
// ============================================================================

/// MongoDB change stream feed
///
/// One client is shared by every subscription opened through this feed. The
/// client is rebuilt on the next `connect` after a failed liveness ping.
pub struct MongoChangeFeed {
    config: FeedConfig,
    client: RwLock<Option<Client>>,
}

impl MongoChangeFeed {
    pub fn new(config: FeedConfig) -> Self {
        Self {
            config,
            client: RwLock::new(None),
        }
    }

    async fn build_client(&self) -> Result<Client> {
        let uri = self.config.connection_uri();
        let mut options = ClientOptions::parse(&uri)
            .await
            .map_err(|e| CdcError::config(format!("invalid feed URI: {}", e)))?;

        options.server_selection_timeout = Some(self.config.server_selection_timeout);
        options.connect_timeout = Some(self.config.connect_timeout);
        options.app_name = Some(self.config.app_name.clone());

        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            options.credential = Some(
                Credential::builder()
                    .username(username.clone())
                    .password(password.clone())
                    .build(),
            );
        }

        Client::with_options(options)
            .map_err(|e| CdcError::transient_with_source(COMPONENT, "failed to build client", e))
    }

    async fn ping(client: &Client) -> Result<()> {
        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map(|_| ())
            .map_err(|e| CdcError::transient_with_source(COMPONENT, "ping failed", e))
    }

    async fn current_client(&self) -> Result<Client> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| CdcError::transient(COMPONENT, "client not connected"))
    }
}

#[async_trait]
impl HealthCheck for MongoChangeFeed {
    async fn health_check(&self) -> Result<()> {
        let client = self.current_client().await?;
        Self::ping(&client).await
    }

    fn component_name(&self) -> &'static str {
        "mongo_change_feed"
    }
}

#[async_trait]
impl ChangeFeed for MongoChangeFeed {
    async fn connect(&self) -> Result<()> {
        let mut guard = self.client.write().await;
        let client = match guard.as_ref() {
            Some(client) => client.clone(),
            None => self.build_client().await?,
        };

        if let Err(e) = Self::ping(&client).await {
            *guard = None;
            return Err(e);
        }

        info!(
            host = %self.config.host,
            database = %self.config.database,
            "Connected to change feed"
        );
        *guard = Some(client);
        Ok(())
    }

    async fn subscribe(
        &self,
        namespace: &Namespace,
        resume_after: Option<&ResumeToken>,
    ) -> Result<RecordStream> {
        let client = self.current_client().await?;
        let collection = client
            .database(&namespace.database)
            .collection::<bson::Document>(&namespace.collection);

        let pipeline = vec![doc! {
            "$match": { "operationType": { "$in": ["insert", "update", "delete"] } }
        }];

        let mut watch = collection.watch().pipeline(pipeline);
        if let Some(token) = resume_after {
            watch = watch.resume_after(decode_token(token)?);
        }

        let gap_token = resume_after.map(|t| t.to_string());
        let changes = watch
            .await
            .map_err(|e| classify_error(e, gap_token.clone()))?;

        info!(
            namespace = %namespace,
            resume_after = ?resume_after.map(ResumeToken::as_str),
            "Opened change stream"
        );

        let records = changes.map(move |event| match event {
            Ok(event) => convert_event(event),
            Err(e) => Err(classify_error(e, gap_token.clone())),
        });
        Ok(Box::pin(records))
    }

    async fn close(&self) -> Result<()> {
        if let Some(client) = self.client.write().await.take() {
            client.shutdown().await;
            debug!("Change feed client shut down");
        }
        Ok(())
    }
}

/// Map a driver error onto the relay taxonomy
fn classify_error(err: mongodb::error::Error, token: Option<String>) -> CdcError {
    if let ErrorKind::Command(ref command) = *err.kind {
        if matches!(command.code, CHANGE_STREAM_HISTORY_LOST | CHANGE_STREAM_FATAL_ERROR) {
            return CdcError::resume_gap(
                format!(
                    "resume point no longer in history ({}): {}",
                    command.code_name, command.message
                ),
                token,
            );
        }
    }
    CdcError::transient_with_source(COMPONENT, "change stream error", err)
}

/// Render a driver resume token as relaxed extended JSON
pub fn encode_token(token: &mongodb::change_stream::event::ResumeToken) -> Result<ResumeToken> {
    let value = bson::to_bson(token)
        .map_err(|e| CdcError::serialization("failed to encode resume token", e))?;
    Ok(ResumeToken::new(value.into_relaxed_extjson().to_string()))
}

/// Parse a token produced by [`encode_token`]
pub fn decode_token(token: &ResumeToken) -> Result<mongodb::change_stream::event::ResumeToken> {
    let json: serde_json::Value = serde_json::from_str(token.as_str())
        .map_err(|e| CdcError::config(format!("resume token is not JSON: {}", e)))?;
    let value = Bson::try_from(json)
        .map_err(|e| CdcError::config(format!("resume token is not extended JSON: {}", e)))?;
    bson::from_bson(value).map_err(|e| CdcError::config(format!("invalid resume token: {}", e)))
}

fn convert_event(event: ChangeStreamEvent<bson::Document>) -> Result<RawChangeRecord> {
    let operation = match event.operation_type {
        OperationType::Insert => ChangeKind::Insert,
        OperationType::Update => ChangeKind::Update,
        OperationType::Delete => ChangeKind::Delete,
        OperationType::Replace => ChangeKind::parse("replace"),
        OperationType::Drop => ChangeKind::parse("drop"),
        OperationType::Rename => ChangeKind::parse("rename"),
        OperationType::DropDatabase => ChangeKind::parse("dropDatabase"),
        OperationType::Invalidate => ChangeKind::parse("invalidate"),
        other => ChangeKind::Other(format!("{:?}", other)),
    };

    let namespace = event
        .ns
        .and_then(|ns| ns.coll.map(|coll| Namespace::new(ns.db, coll)));

    Ok(RawChangeRecord {
        operation,
        namespace,
        document_key: event.document_key.as_ref().map(convert_document),
        full_document: event.full_document.as_ref().map(convert_document),
        update: event.update_description.map(|delta| UpdateDelta {
            updated_fields: convert_document(&delta.updated_fields),
            removed_fields: delta.removed_fields,
        }),
        resume_token: encode_token(&event.id)?,
    })
}

// ============================================================================
// BSON conversion
// ============================================================================

/// Convert a BSON document into the feed-independent value model
pub fn convert_document(document: &bson::Document) -> Document {
    document
        .iter()
        .map(|(key, value)| (key.clone(), convert_value(value)))
        .collect()
}

/// Convert one BSON value
pub fn convert_value(value: &Bson) -> DocValue {
    match value {
        Bson::Null | Bson::Undefined => DocValue::Null,
        Bson::Boolean(b) => DocValue::Bool(*b),
        Bson::Int32(i) => DocValue::Int(i64::from(*i)),
        Bson::Int64(i) => DocValue::Int(*i),
        Bson::Double(f) => DocValue::Float(*f),
        Bson::String(s) => DocValue::String(s.clone()),
        Bson::Document(d) => DocValue::Document(convert_document(d)),
        Bson::Array(items) => DocValue::Array(items.iter().map(convert_value).collect()),
        Bson::ObjectId(oid) => DocValue::object_id(oid.bytes()),
        Bson::DateTime(dt) => {
            match chrono::DateTime::<chrono::Utc>::from_timestamp_millis(dt.timestamp_millis()) {
                Some(at) => DocValue::datetime(at),
                None => DocValue::String(dt.to_string()),
            }
        }
        Bson::Timestamp(ts) => DocValue::Temporal(Temporal::Timestamp {
            seconds: ts.time,
            increment: ts.increment,
        }),
        Bson::Binary(binary) => match binary.subtype {
            BinarySubtype::Uuid => match uuid::Uuid::from_slice(&binary.bytes) {
                Ok(id) => DocValue::Identifier(Identifier::Uuid(id)),
                Err(_) => binary_value(u8::from(binary.subtype), &binary.bytes),
            },
            subtype => binary_value(u8::from(subtype), &binary.bytes),
        },
        Bson::Decimal128(_) => {
            let text = value
                .clone()
                .into_relaxed_extjson()
                .get("$numberDecimal")
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| value.to_string());
            DocValue::Identifier(Identifier::Decimal(text))
        }
        Bson::Symbol(s) => DocValue::Identifier(Identifier::Symbol(s.clone())),
        other => DocValue::Identifier(Identifier::Symbol(other.to_string())),
    }
}

fn binary_value(subtype: u8, bytes: &[u8]) -> DocValue {
    DocValue::Identifier(Identifier::Binary {
        subtype,
        bytes: bytes.to_vec(),
    })
}

// ============================================================================
// Mock Feed (for testing)
// ============================================================================

#[derive(Default)]
struct MockFeedState {
    history: Vec<RawChangeRecord>,
    /// Records below this index have been compacted away
    retention_floor: usize,
    fail_connects: u32,
    fault: Option<(usize, StreamFault)>,
    /// Streams that end immediately, before any record
    empty_streams: u32,
    subscriptions: Vec<Option<ResumeToken>>,
}

/// Fault a mock stream raises when it reaches a history index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFault {
    /// Transient error, then the stream ends and the feed disconnects
    Disconnect,
    /// The stream ends cleanly; the connection stays up
    End,
    /// The resume position is lost upstream
    ResumeGap,
}

struct MockFeedInner {
    state: Mutex<MockFeedState>,
    len_tx: watch::Sender<usize>,
    connected: AtomicBool,
    connect_attempts: AtomicU32,
}

impl MockFeedInner {
    fn lock(&self) -> MutexGuard<'_, MockFeedState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// In-memory change feed
///
/// Holds an append-only history shared by every subscription. A subscription
/// without a token starts at the oldest retained record; with a token it
/// starts strictly after that record, or fails with a resume gap when the
/// record's successor has been compacted. Streams wait for pushed records
/// once the history is exhausted.
#[derive(Clone)]
pub struct MockFeed {
    inner: Arc<MockFeedInner>,
}

impl MockFeed {
    pub fn new() -> Self {
        let (len_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(MockFeedInner {
                state: Mutex::new(MockFeedState::default()),
                len_tx,
                connected: AtomicBool::new(false),
                connect_attempts: AtomicU32::new(0),
            }),
        }
    }

    /// Create with preloaded history
    pub fn with_records(records: impl IntoIterator<Item = RawChangeRecord>) -> Self {
        let feed = Self::new();
        for record in records {
            feed.push(record);
        }
        feed
    }

    /// Append a record, waking live subscriptions
    pub fn push(&self, record: RawChangeRecord) {
        let len = {
            let mut state = self.inner.lock();
            state.history.push(record);
            state.history.len()
        };
        self.inner.len_tx.send_replace(len);
    }

    /// Drop the first `count` records from the retention window
    pub fn compact(&self, count: usize) {
        let mut state = self.inner.lock();
        state.retention_floor = count.min(state.history.len());
    }

    /// Fail the next `count` connection attempts
    pub fn fail_connects(&self, count: u32) {
        self.inner.lock().fail_connects = count;
    }

    /// Break the connection when a stream reaches history index `index`
    pub fn disconnect_at(&self, index: usize) {
        self.fault_at(index, StreamFault::Disconnect);
    }

    /// Raise `fault` when a stream reaches history index `index`
    ///
    /// One-shot: only the first stream to get there is affected.
    pub fn fault_at(&self, index: usize, fault: StreamFault) {
        self.inner.lock().fault = Some((index, fault));
    }

    /// Make the next `count` subscriptions end before yielding anything
    pub fn end_streams(&self, count: u32) {
        self.inner.lock().empty_streams = count;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Resume tokens of every subscription opened so far
    pub fn subscriptions(&self) -> Vec<Option<ResumeToken>> {
        self.inner.lock().subscriptions.clone()
    }
}

impl Default for MockFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthCheck for MockFeed {
    async fn health_check(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(CdcError::transient(COMPONENT, "mock feed disconnected"))
        }
    }

    fn component_name(&self) -> &'static str {
        "mock_feed"
    }
}

#[async_trait]
impl ChangeFeed for MockFeed {
    async fn connect(&self) -> Result<()> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.lock();
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(CdcError::transient(COMPONENT, "connection refused"));
        }
        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(
        &self,
        namespace: &Namespace,
        resume_after: Option<&ResumeToken>,
    ) -> Result<RecordStream> {
        if !self.is_connected() {
            return Err(CdcError::transient(COMPONENT, "mock feed disconnected"));
        }

        let (start, empty) = {
            let mut state = self.inner.lock();
            state.subscriptions.push(resume_after.cloned());
            let empty = state.empty_streams > 0;
            state.empty_streams = state.empty_streams.saturating_sub(1);
            let start = match resume_after {
                None => state.retention_floor,
                Some(token) => {
                    let index = state
                        .history
                        .iter()
                        .position(|r| &r.resume_token == token)
                        .ok_or_else(|| {
                            CdcError::resume_gap("unknown resume token", Some(token.to_string()))
                        })?;
                    if index + 1 < state.retention_floor {
                        return Err(CdcError::resume_gap(
                            "resume point has been compacted",
                            Some(token.to_string()),
                        ));
                    }
                    index + 1
                }
            };
            (start, empty)
        };
        if empty {
            return Ok(Box::pin(stream::empty()));
        }

        let cursor = MockCursor {
            inner: Arc::clone(&self.inner),
            len_rx: self.inner.len_tx.subscribe(),
            namespace: namespace.clone(),
            index: start,
            finished: false,
        };

        Ok(Box::pin(stream::unfold(cursor, |mut cursor| async move {
            let item = cursor.next_item().await?;
            Some((item, cursor))
        })))
    }

    async fn close(&self) -> Result<()> {
        self.inner.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct MockCursor {
    inner: Arc<MockFeedInner>,
    len_rx: watch::Receiver<usize>,
    namespace: Namespace,
    index: usize,
    finished: bool,
}

impl MockCursor {
    fn raise(&self, fault: StreamFault) -> Option<Result<RawChangeRecord>> {
        match fault {
            StreamFault::Disconnect => {
                self.inner.connected.store(false, Ordering::SeqCst);
                Some(Err(CdcError::transient(COMPONENT, "connection reset by peer")))
            }
            StreamFault::End => None,
            StreamFault::ResumeGap => {
                Some(Err(CdcError::resume_gap("change stream history lost", None)))
            }
        }
    }

    async fn next_item(&mut self) -> Option<Result<RawChangeRecord>> {
        if self.finished {
            return None;
        }
        loop {
            {
                let mut state = self.inner.lock();
                if let Some((index, fault)) = state.fault {
                    if index == self.index {
                        state.fault = None;
                        self.finished = true;
                        warn!(index, ?fault, "Mock feed raising stream fault");
                        return self.raise(fault);
                    }
                }
                if self.index < state.history.len() {
                    let record = state.history[self.index].clone();
                    self.index += 1;
                    let matches = record
                        .namespace
                        .as_ref()
                        .map_or(true, |ns| *ns == self.namespace);
                    if matches {
                        return Some(Ok(record));
                    }
                    continue;
                }
            }

            let target = self.index;
            if self.len_rx.wait_for(|len| *len > target).await.is_err() {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::oid::ObjectId;
    use std::time::Duration;

    fn ns() -> Namespace {
        Namespace::new("etl_db", "orders")
    }

    fn insert(i: i64) -> RawChangeRecord {
        RawChangeRecord::insert(
            ns(),
            i,
            Document::new().with("order_id", i),
            ResumeToken::new(format!("t{}", i)),
        )
    }

    #[test]
    fn test_convert_value_identifiers_and_temporals() {
        let oid = ObjectId::parse_str("65f1a2b3c4d5e6f708192a3b").unwrap();
        let id = uuid::Uuid::parse_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
        let source = doc! {
            "_id": oid,
            "created": bson::DateTime::from_millis(1_700_000_000_123),
            "ref": bson::Binary { subtype: BinarySubtype::Uuid, bytes: id.as_bytes().to_vec() },
            "ts": bson::Timestamp { time: 1_700_000_000, increment: 3 },
            "qty": 2_i32,
            "nested": { "ids": [oid] },
        };

        let converted = convert_document(&source);
        assert_eq!(converted.get("_id"), Some(&DocValue::object_id(oid.bytes())));
        assert_eq!(converted.get("ref"), Some(&DocValue::Identifier(Identifier::Uuid(id))));
        assert_eq!(converted.get("qty"), Some(&DocValue::Int(2)));
        assert!(matches!(
            converted.get("created"),
            Some(DocValue::Temporal(Temporal::DateTime(_)))
        ));
        assert!(matches!(
            converted.get("ts"),
            Some(DocValue::Temporal(Temporal::Timestamp { seconds: 1_700_000_000, increment: 3 }))
        ));

        let nested = converted.get("nested").and_then(DocValue::as_document).unwrap();
        assert_eq!(
            nested.get("ids"),
            Some(&DocValue::Array(vec![DocValue::object_id(oid.bytes())]))
        );
    }

    #[test]
    fn test_decimal_keeps_exact_text() {
        let value = Bson::try_from(serde_json::json!({ "$numberDecimal": "19.99" })).unwrap();
        assert_eq!(
            convert_value(&value),
            DocValue::Identifier(Identifier::Decimal("19.99".into()))
        );
    }

    #[test]
    fn test_token_round_trips_through_extended_json() {
        let raw = ResumeToken::new(r#"{"_data":"8265F1A2B3000000012B0229296E04"}"#);
        let driver_token = decode_token(&raw).unwrap();
        let encoded = encode_token(&driver_token).unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(encoded.as_str()).unwrap(),
            serde_json::from_str::<serde_json::Value>(raw.as_str()).unwrap()
        );

        assert!(matches!(
            decode_token(&ResumeToken::new("not-json")),
            Err(CdcError::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn test_mock_feed_resumes_strictly_after_token() {
        let feed = MockFeed::with_records((1..=5).map(insert));
        feed.connect().await.unwrap();

        let mut records = feed
            .subscribe(&ns(), Some(&ResumeToken::new("t2")))
            .await
            .unwrap();
        let next = records.next().await.unwrap().unwrap();
        assert_eq!(next.resume_token.as_str(), "t3");
    }

    #[tokio::test]
    async fn test_mock_feed_reports_resume_gap_after_compaction() {
        let feed = MockFeed::with_records((1..=5).map(insert));
        feed.compact(3);
        feed.connect().await.unwrap();

        let err = feed
            .subscribe(&ns(), Some(&ResumeToken::new("t1")))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CdcError::ResumeGap { .. }));

        // t3 was compacted but its successor t4 is still retained
        assert!(feed.subscribe(&ns(), Some(&ResumeToken::new("t3"))).await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_feed_waits_for_pushed_records() {
        let feed = MockFeed::new();
        feed.connect().await.unwrap();
        let mut records = feed.subscribe(&ns(), None).await.unwrap();

        let pusher = feed.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            pusher.push(insert(1));
        });

        let record = tokio::time::timeout(Duration::from_secs(2), records.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(record.resume_token.as_str(), "t1");
    }

    #[tokio::test]
    async fn test_mock_feed_disconnect_is_one_shot() {
        let feed = MockFeed::with_records((1..=3).map(insert));
        feed.disconnect_at(1);
        feed.connect().await.unwrap();

        let mut records = feed.subscribe(&ns(), None).await.unwrap();
        assert!(records.next().await.unwrap().is_ok());
        assert!(records.next().await.unwrap().unwrap_err().is_retryable());
        assert!(records.next().await.is_none());
        assert!(!feed.is_connected());

        feed.connect().await.unwrap();
        let mut records = feed.subscribe(&ns(), Some(&ResumeToken::new("t1"))).await.unwrap();
        assert_eq!(records.next().await.unwrap().unwrap().resume_token.as_str(), "t2");
    }

    #[tokio::test]
    async fn test_mock_feed_ended_stream_keeps_connection() {
        let feed = MockFeed::with_records((1..=3).map(insert));
        feed.fault_at(1, StreamFault::End);
        feed.connect().await.unwrap();

        let mut records = feed.subscribe(&ns(), None).await.unwrap();
        assert!(records.next().await.unwrap().is_ok());
        assert!(records.next().await.is_none());
        assert!(feed.is_connected());
    }

    #[tokio::test]
    async fn test_mock_feed_empty_streams() {
        let feed = MockFeed::with_records((1..=2).map(insert));
        feed.end_streams(1);
        feed.connect().await.unwrap();

        assert!(feed.subscribe(&ns(), None).await.unwrap().next().await.is_none());
        let mut records = feed.subscribe(&ns(), None).await.unwrap();
        assert_eq!(records.next().await.unwrap().unwrap().resume_token.as_str(), "t1");
    }
}
