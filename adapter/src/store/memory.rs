//! In-process document store.
//!
//! Behaves like a small CouchDB: revisioned documents, a monotonically
//! increasing update sequence, map-only views and a live change feed. Used by
//! the demo binary and the test suite; any other store plugs in through the
//! same traits.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use docsync_engine::record::{ID_FIELD, REV_FIELD};
use docsync_engine::{
    Change, ChangesRequest, DocId, Error, OptionGroup, Result, Revision, Sequence,
};
use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;

use super::{ChangeStream, DocumentStore, StoreHandle, StoreOpener};

/// Map function of a view: emits `(key, value)` for documents it indexes.
pub type ViewFn = Arc<dyn Fn(&Value) -> Option<(Value, Value)> + Send + Sync>;

const FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum FeedEvent {
    Change(Change),
    Fail(String),
}

#[derive(Debug, Clone)]
struct StoredDoc {
    rev: Revision,
    generation: u64,
    fields: Map<String, Value>,
    deleted: bool,
}

impl StoredDoc {
    fn body(&self, id: &str) -> Value {
        let mut body = Map::with_capacity(self.fields.len() + 2);
        body.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
        body.insert(REV_FIELD.to_string(), Value::String(self.rev.clone()));
        body.extend(self.fields.clone());
        Value::Object(body)
    }
}

#[derive(Default)]
struct Inner {
    docs: BTreeMap<DocId, StoredDoc>,
    log: Vec<Change>,
    seq: Sequence,
    views: HashMap<String, ViewFn>,
}

/// A named, in-memory document store.
pub struct MemoryStore {
    name: String,
    inner: Mutex<Inner>,
    feed: broadcast::Sender<FeedEvent>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new(name: impl Into<String>) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            name: name.into(),
            inner: Mutex::new(Inner::default()),
            feed,
        }
    }

    /// Create an empty store wrapped in Arc for sharing.
    pub fn new_shared(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(name))
    }

    /// Store name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a view under `name`.
    pub fn register_view(
        &self,
        name: impl Into<String>,
        map: impl Fn(&Value) -> Option<(Value, Value)> + Send + Sync + 'static,
    ) {
        self.inner.lock().views.insert(name.into(), Arc::new(map));
    }

    /// Number of live (non-deleted) documents.
    pub fn document_count(&self) -> usize {
        self.inner.lock().docs.values().filter(|d| !d.deleted).count()
    }

    /// Terminate every open live feed with an error.
    pub fn fail_feeds(&self, reason: impl Into<String>) {
        let _ = self.feed.send(FeedEvent::Fail(reason.into()));
    }

    /// Number of live feeds currently attached.
    pub fn subscriber_count(&self) -> usize {
        self.feed.receiver_count()
    }

    fn write(&self, id: DocId, doc: Map<String, Value>) -> Result<Value> {
        let mut inner = self.inner.lock();
        let given_rev = doc.get(REV_FIELD).and_then(Value::as_str).map(str::to_owned);

        let generation = match inner.docs.get(&id) {
            Some(existing) if !existing.deleted => {
                if given_rev.as_deref() != Some(existing.rev.as_str()) {
                    return Err(Error::RevisionConflict { id });
                }
                existing.generation + 1
            }
            Some(tombstone) => tombstone.generation + 1,
            None => {
                if given_rev.is_some() {
                    return Err(Error::RevisionConflict { id });
                }
                1
            }
        };

        let fields: Map<String, Value> = doc
            .into_iter()
            .filter(|(k, _)| !k.starts_with('_'))
            .collect();
        let stored = StoredDoc {
            rev: new_revision(generation),
            generation,
            fields,
            deleted: false,
        };
        let rev = stored.rev.clone();
        let body = stored.body(&id);
        inner.docs.insert(id.clone(), stored);
        self.record_change(&mut inner, Change::updated(Sequence::ZERO, id.clone(), body));

        tracing::debug!(store = %self.name, id = %id, rev = %rev, "document written");
        Ok(json!({"ok": true, "id": id, "rev": rev}))
    }

    fn delete(&self, doc: Map<String, Value>) -> Result<Value> {
        let id = doc_id(&doc)?;
        let given_rev = doc.get(REV_FIELD).and_then(Value::as_str);
        let mut inner = self.inner.lock();

        let stored = match inner.docs.get_mut(&id) {
            Some(stored) if !stored.deleted => stored,
            _ => return Err(Error::NotFound(id)),
        };
        if given_rev != Some(stored.rev.as_str()) {
            return Err(Error::RevisionConflict { id });
        }

        stored.generation += 1;
        stored.rev = new_revision(stored.generation);
        stored.deleted = true;
        stored.fields.clear();
        let rev = stored.rev.clone();
        self.record_change(&mut inner, Change::deleted(Sequence::ZERO, id.clone()));

        tracing::debug!(store = %self.name, id = %id, "document removed");
        Ok(json!({"ok": true, "id": id, "rev": rev}))
    }

    /// Assign the next sequence, log the change and publish it while the lock
    /// is held, so feeds see changes in sequence order.
    fn record_change(&self, inner: &mut Inner, mut change: Change) {
        inner.seq = inner.seq.next();
        change.seq = inner.seq;
        inner.log.push(change.clone());
        let _ = self.feed.send(FeedEvent::Change(change));
    }

    fn rows(&self, view: Option<&str>, options: &OptionGroup) -> Result<Value> {
        let inner = self.inner.lock();
        let include_docs = flag(options, "include_docs");

        let map = match view {
            Some(name) => Some(
                inner
                    .views
                    .get(name)
                    .cloned()
                    .ok_or_else(|| Error::Store(format!("unknown view '{name}'")))?,
            ),
            None => None,
        };

        let mut rows: Vec<(Value, DocId, Value, Value)> = Vec::new();
        for (id, stored) in inner.docs.iter().filter(|(_, d)| !d.deleted) {
            let body = stored.body(id);
            let (key, value) = match &map {
                Some(map) => match map(&body) {
                    Some(emitted) => emitted,
                    None => continue,
                },
                None => (Value::String(id.clone()), json!({"rev": stored.rev})),
            };
            rows.push((key, id.clone(), value, body));
        }
        drop(inner);

        rows.sort_by(|a, b| collate(&a.0, &b.0).then_with(|| a.1.cmp(&b.1)));
        if flag(options, "descending") {
            rows.reverse();
        }
        let total_rows = rows.len();
        if let Some(limit) = options.get("limit").and_then(Value::as_u64) {
            rows.truncate(limit as usize);
        }

        let rows: Vec<Value> = rows
            .into_iter()
            .map(|(key, id, value, body)| {
                let mut row = json!({"id": id, "key": key, "value": value});
                if include_docs {
                    row["doc"] = body;
                }
                row
            })
            .collect();

        Ok(json!({"total_rows": total_rows, "offset": 0, "rows": rows}))
    }
}

impl DocumentStore for MemoryStore {
    fn get<'a>(&'a self, id: &'a str, _options: &'a OptionGroup) -> BoxFuture<'a, Result<Value>> {
        let inner = self.inner.lock();
        let result = match inner.docs.get(id) {
            Some(stored) if !stored.deleted => Ok(stored.body(id)),
            _ => Err(Error::NotFound(id.to_string())),
        };
        future::ready(result).boxed()
    }

    fn put<'a>(&'a self, doc: Value, _options: &'a OptionGroup) -> BoxFuture<'a, Result<Value>> {
        let result = as_object(doc).and_then(|doc| {
            let id = doc_id(&doc)?;
            self.write(id, doc)
        });
        future::ready(result).boxed()
    }

    fn post<'a>(&'a self, doc: Value, _options: &'a OptionGroup) -> BoxFuture<'a, Result<Value>> {
        let result = as_object(doc).and_then(|doc| {
            let id = doc_id(&doc).unwrap_or_else(|_| uuid::Uuid::new_v4().simple().to_string());
            self.write(id, doc)
        });
        future::ready(result).boxed()
    }

    fn remove<'a>(
        &'a self,
        doc: Value,
        _options: &'a OptionGroup,
    ) -> BoxFuture<'a, Result<Value>> {
        let result = as_object(doc).and_then(|doc| self.delete(doc));
        future::ready(result).boxed()
    }

    fn query<'a>(
        &'a self,
        view: &'a str,
        options: &'a OptionGroup,
    ) -> BoxFuture<'a, Result<Value>> {
        future::ready(self.rows(Some(view), options)).boxed()
    }

    fn all_docs<'a>(&'a self, options: &'a OptionGroup) -> BoxFuture<'a, Result<Value>> {
        future::ready(self.rows(None, options)).boxed()
    }

    fn current_sequence(&self) -> BoxFuture<'_, Result<Sequence>> {
        future::ready(Ok(self.inner.lock().seq)).boxed()
    }

    fn changes(&self, request: ChangesRequest) -> BoxFuture<'_, Result<ChangeStream>> {
        // Subscribe under the lock: every change after the backlog is then
        // guaranteed to reach the receiver, and none twice.
        let (backlog, receiver) = {
            let inner = self.inner.lock();
            let receiver = request.live.then(|| self.feed.subscribe());
            let backlog: VecDeque<Change> = inner
                .log
                .iter()
                .filter(|c| c.seq > request.since && request.admits(c))
                .map(|c| shape(c.clone(), request.include_docs))
                .collect();
            (backlog, receiver)
        };

        tracing::debug!(
            store = %self.name,
            since = request.since.0,
            backlog = backlog.len(),
            live = request.live,
            "change feed opened"
        );

        let state = FeedState {
            last: request.since,
            backlog,
            receiver,
            request,
            done: false,
        };
        future::ready(Ok(feed_stream(state))).boxed()
    }
}

struct FeedState {
    last: Sequence,
    backlog: VecDeque<Change>,
    receiver: Option<broadcast::Receiver<FeedEvent>>,
    request: ChangesRequest,
    done: bool,
}

fn feed_stream(state: FeedState) -> ChangeStream {
    stream::unfold(state, |mut state| async move {
        loop {
            if state.done {
                return None;
            }
            if let Some(change) = state.backlog.pop_front() {
                state.last = change.seq;
                return Some((Ok(change), state));
            }

            let receiver = state.receiver.as_mut()?;
            let event = receiver.recv().await;
            match event {
                Ok(FeedEvent::Change(change)) => {
                    if change.seq <= state.last || !state.request.admits(&change) {
                        continue;
                    }
                    state.last = change.seq;
                    let change = shape(change, state.request.include_docs);
                    return Some((Ok(change), state));
                }
                Ok(FeedEvent::Fail(reason)) => {
                    state.done = true;
                    return Some((Err(Error::Subscription(reason)), state));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    state.done = true;
                    let reason = format!("feed fell behind by {skipped} changes");
                    return Some((Err(Error::Subscription(reason)), state));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

fn shape(mut change: Change, include_docs: bool) -> Change {
    if !include_docs {
        change.doc = None;
    }
    change
}

/// Opens [`MemoryStore`]s by name, one per name.
#[derive(Default)]
pub struct MemoryOpener {
    stores: DashMap<String, Arc<MemoryStore>>,
    failing: DashMap<String, String>,
    attempts: AtomicUsize,
    delay: Option<Duration>,
}

impl MemoryOpener {
    /// Create an opener with no latency and no failures.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate open latency.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make every open of `name` fail with `reason`.
    pub fn fail(&self, name: impl Into<String>, reason: impl Into<String>) {
        self.failing.insert(name.into(), reason.into());
    }

    /// The store behind `name`, created on first use.
    pub fn store(&self, name: &str) -> Arc<MemoryStore> {
        self.stores
            .entry(name.to_string())
            .or_insert_with(|| MemoryStore::new_shared(name))
            .clone()
    }

    /// Number of open attempts made so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(AtomicOrdering::SeqCst)
    }
}

impl StoreOpener for MemoryOpener {
    fn open<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<StoreHandle>> {
        async move {
            self.attempts.fetch_add(1, AtomicOrdering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            if let Some(reason) = self.failing.get(name) {
                return Err(Error::ConnectionFailure {
                    store: name.to_string(),
                    reason: reason.clone(),
                });
            }

            let store: StoreHandle = self.store(name);
            Ok(store)
        }
        .boxed()
    }
}

fn new_revision(generation: u64) -> Revision {
    format!("{}-{}", generation, uuid::Uuid::new_v4().simple())
}

fn as_object(doc: Value) -> Result<Map<String, Value>> {
    match doc {
        Value::Object(map) => Ok(map),
        _ => Err(Error::InvalidDocument("document body must be an object".into())),
    }
}

fn doc_id(doc: &Map<String, Value>) -> Result<DocId> {
    doc.get(ID_FIELD)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| Error::InvalidDocument(format!("document has no {ID_FIELD}")))
}

fn flag(options: &OptionGroup, key: &str) -> bool {
    options.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn kind_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// View key collation: null < bools < numbers < strings < arrays < objects.
fn collate(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y.iter())
            .map(|(a, b)| collate(a, b))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Value::Object(x), Value::Object(y)) => x.len().cmp(&y.len()),
        _ => kind_rank(a).cmp(&kind_rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_engine::{EffectiveConfig, StoreCall};

    fn no_options() -> OptionGroup {
        Map::new()
    }

    fn docs_options() -> OptionGroup {
        EffectiveConfig::default().group(StoreCall::AllDocs).clone()
    }

    #[tokio::test]
    async fn post_assigns_identity_and_get_reads_back() {
        let store = MemoryStore::new("todos");
        let response = store
            .post(json!({"title": "milk"}), &no_options())
            .await
            .unwrap();

        let id = response["id"].as_str().unwrap();
        let rev = response["rev"].as_str().unwrap();
        assert!(rev.starts_with("1-"));

        let doc = store.get(id, &no_options()).await.unwrap();
        assert_eq!(doc["title"], "milk");
        assert_eq!(doc["_rev"], rev);
    }

    #[tokio::test]
    async fn stale_revision_conflicts() {
        let store = MemoryStore::new("todos");
        let first = store
            .put(json!({"_id": "t1", "n": 1}), &no_options())
            .await
            .unwrap();
        let rev1 = first["rev"].as_str().unwrap().to_string();

        store
            .put(json!({"_id": "t1", "_rev": rev1, "n": 2}), &no_options())
            .await
            .unwrap();

        let stale = store
            .put(json!({"_id": "t1", "_rev": rev1, "n": 3}), &no_options())
            .await;
        assert_eq!(stale, Err(Error::RevisionConflict { id: "t1".into() }));

        let stale_remove = store
            .remove(json!({"_id": "t1", "_rev": rev1}), &no_options())
            .await;
        assert_eq!(stale_remove, Err(Error::RevisionConflict { id: "t1".into() }));
    }

    #[tokio::test]
    async fn removed_documents_are_not_found() {
        let store = MemoryStore::new("todos");
        let created = store
            .put(json!({"_id": "t1"}), &no_options())
            .await
            .unwrap();
        store
            .remove(json!({"_id": "t1", "_rev": created["rev"]}), &no_options())
            .await
            .unwrap();

        assert_eq!(
            store.get("t1", &no_options()).await,
            Err(Error::NotFound("t1".into()))
        );
        assert_eq!(store.document_count(), 0);
    }

    #[tokio::test]
    async fn all_docs_lists_by_id() {
        let store = MemoryStore::new("todos");
        for id in ["b", "a"] {
            store.put(json!({"_id": id}), &no_options()).await.unwrap();
        }

        let listing = store.all_docs(&docs_options()).await.unwrap();
        let rows = listing["rows"].as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], "a");
        assert_eq!(rows[0]["doc"]["_id"], "a");

        let bare = store.all_docs(&no_options()).await.unwrap();
        assert!(bare["rows"][0].get("doc").is_none());
    }

    #[tokio::test]
    async fn view_rows_sorted_by_key() {
        let store = MemoryStore::new("todos");
        store.register_view("by_order", |doc| {
            (doc["type"] == "todo").then(|| (doc["order"].clone(), json!({"done": doc["done"]})))
        });
        store
            .put(json!({"_id": "x", "type": "todo", "order": 2, "done": true}), &no_options())
            .await
            .unwrap();
        store
            .put(json!({"_id": "y", "type": "todo", "order": 1, "done": false}), &no_options())
            .await
            .unwrap();
        store
            .put(json!({"_id": "z", "type": "note"}), &no_options())
            .await
            .unwrap();

        let result = store.query("by_order", &no_options()).await.unwrap();
        let ids: Vec<&str> = result["rows"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["y", "x"]);
        assert_eq!(result["rows"][0]["value"], json!({"done": false}));

        let missing = store.query("nope", &no_options()).await;
        assert!(matches!(missing, Err(Error::Store(_))));
    }

    #[tokio::test]
    async fn feed_replays_backlog_then_goes_live() {
        let store = MemoryStore::new("todos");
        store.put(json!({"_id": "a"}), &no_options()).await.unwrap();
        store.put(json!({"_id": "b"}), &no_options()).await.unwrap();

        let request = ChangesRequest {
            since: Sequence(1),
            live: true,
            include_docs: true,
            filter: None,
        };
        let mut feed = store.changes(request).await.unwrap();

        let first = feed.next().await.unwrap().unwrap();
        assert_eq!(first.seq, Sequence(2));
        assert_eq!(first.id, "b");

        store.put(json!({"_id": "c"}), &no_options()).await.unwrap();
        let live = feed.next().await.unwrap().unwrap();
        assert_eq!(live.seq, Sequence(3));
        assert_eq!(live.doc.unwrap()["_id"], "c");

        store.fail_feeds("replication stopped");
        let failed = feed.next().await.unwrap();
        assert_eq!(failed, Err(Error::Subscription("replication stopped".into())));
        assert!(feed.next().await.is_none());
    }

    #[tokio::test]
    async fn non_live_feed_ends_after_backlog() {
        let store = MemoryStore::new("todos");
        store.put(json!({"_id": "a"}), &no_options()).await.unwrap();

        let request = ChangesRequest {
            since: Sequence::ZERO,
            live: false,
            include_docs: false,
            filter: None,
        };
        let changes: Vec<_> = store.changes(request).await.unwrap().collect().await;

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].as_ref().unwrap().doc, None);
    }

    #[tokio::test]
    async fn opener_reuses_store_and_reports_failures() {
        let opener = MemoryOpener::new();
        opener.fail("broken", "permission denied");

        let handle = opener.open("todos").await.unwrap();
        handle.put(json!({"_id": "a"}), &no_options()).await.unwrap();
        assert_eq!(opener.store("todos").document_count(), 1);

        let failure = opener.open("broken").await.err().unwrap();
        assert_eq!(
            failure,
            Error::ConnectionFailure {
                store: "broken".into(),
                reason: "permission denied".into()
            }
        );
        assert_eq!(opener.attempts(), 2);
    }

    #[test]
    fn collation_order() {
        assert_eq!(collate(&json!(null), &json!(false)), Ordering::Less);
        assert_eq!(collate(&json!(2), &json!("a")), Ordering::Less);
        assert_eq!(collate(&json!([1, "b"]), &json!([1, "a"])), Ordering::Greater);
        assert_eq!(collate(&json!([1]), &json!([1, 0])), Ordering::Less);
    }
}
