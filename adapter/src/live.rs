//! Live collections.
//!
//! A [`LiveCollection`] owns a comparator-ordered [`Collection`], one
//! [`ChangeReconciler`] and the background task feeding it.
//!
//! # Fetch
//!
//! 1. Tear down any running subscription
//! 2. Bulk or view read through the dispatcher
//! 3. Reset the collection and emit `Reset`
//! 4. If listening: capture the store's current sequence, then subscribe to
//!    changes strictly after it
//!
//! A fetch that resolves after `close()` or after a newer fetch started has
//! its result discarded, as does a member write that resolves after `close()`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use docsync_engine::{
    Applied, Canonical, Change, ChangeReconciler, ChangesRequest, Collection, CollectionEvent,
    Comparator, DocId, EffectiveConfig, Error, Intent, ReconcilerState, Record, Result, Sequence,
    SyncConfig, Target,
};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::broker::Connection;
use crate::dispatch::Dispatcher;
use crate::store::ChangeStream;

/// Capacity of the collection event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Caller hook run after each change the reconciler accepted.
pub type ChangeHook = Arc<dyn Fn(&Change, &Applied) + Send + Sync>;

/// State shared with the subscription task.
struct Shared {
    /// Lock order: `collection` before `reconciler`
    collection: Mutex<Collection>,
    reconciler: Mutex<ChangeReconciler>,
    events: broadcast::Sender<CollectionEvent>,
    generation: AtomicU64,
    closed: AtomicBool,
    on_change: Mutex<Option<ChangeHook>>,
}

impl Shared {
    fn emit(&self, event: CollectionEvent) {
        let _ = self.events.send(event);
    }

    fn is_current(&self, generation: u64) -> bool {
        !self.closed.load(AtomicOrdering::SeqCst)
            && self.generation.load(AtomicOrdering::SeqCst) == generation
    }
}

/// A collection kept in step with its store.
pub struct LiveCollection {
    shared: Arc<Shared>,
    connection: Connection,
    defaults: SyncConfig,
    dispatcher: Arc<Dispatcher>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LiveCollection {
    pub(crate) fn new(
        connection: Connection,
        comparator: Comparator,
        defaults: SyncConfig,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                collection: Mutex::new(Collection::new(comparator)),
                reconciler: Mutex::new(ChangeReconciler::default()),
                events,
                generation: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                on_change: Mutex::new(None),
            }),
            connection,
            defaults,
            dispatcher,
            task: Mutex::new(None),
        }
    }

    /// Store connection backing this collection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Subscribe to collection events.
    pub fn events(&self) -> broadcast::Receiver<CollectionEvent> {
        self.shared.events.subscribe()
    }

    /// Run `hook` after every change the reconciler accepts.
    pub fn on_change(&self, hook: impl Fn(&Change, &Applied) + Send + Sync + 'static) {
        *self.shared.on_change.lock() = Some(Arc::new(hook));
    }

    /// Read the collection from the store and, if listening, follow its changes.
    ///
    /// Returns the number of members loaded.
    pub async fn fetch(&self, call: &SyncConfig) -> Result<usize> {
        if self.shared.closed.load(AtomicOrdering::SeqCst) {
            return Err(Error::Discarded("collection is closed".into()));
        }

        let generation = self.shared.generation.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        self.teardown();

        let config = EffectiveConfig::resolve(&self.defaults, self.connection.options(), call);
        let loaded = self
            .dispatcher
            .execute(Intent::Read, Target::Collection, &self.connection, &config)
            .await;
        self.ensure_current(generation)?;

        let records = match loaded {
            Ok(canonical) => canonical.into_records(),
            Err(e) => {
                tracing::warn!(store = %self.connection.name(), error = %e, "collection read failed");
                self.shared.reconciler.lock().stop();
                return Err(e);
            }
        };

        let event = {
            let mut collection = self.shared.collection.lock();
            let mut reconciler = self.shared.reconciler.lock();
            let event = collection.reset(records);
            if event.is_err() {
                reconciler.stop();
            }
            event?
        };
        let count = match &event {
            CollectionEvent::Reset { count } => *count,
            _ => self.len(),
        };
        self.shared.emit(event);
        tracing::info!(store = %self.connection.name(), count, "collection loaded");

        if !config.listen() {
            self.shared.reconciler.lock().stop();
            return Ok(count);
        }

        self.subscribe(generation, &config).await?;
        Ok(count)
    }

    /// Capture the cursor and start the subscription task.
    ///
    /// Failing to capture the cursor or to open the feed is a subscription
    /// failure: the load stays applied and the reconciler moves to `Failed`.
    async fn subscribe(&self, generation: u64, config: &EffectiveConfig) -> Result<()> {
        let store = match self.connection.open().await {
            Ok(store) => store,
            Err(e) => return Err(self.subscription_failed(generation, e)),
        };
        let cursor = match store.current_sequence().await {
            Ok(cursor) => cursor,
            Err(e) => return Err(self.subscription_failed(generation, e)),
        };
        self.ensure_current(generation)?;

        {
            let mut reconciler = self.shared.reconciler.lock();
            reconciler.set_filter(config.filter().cloned());
            reconciler.subscribed(cursor);
        }

        let request = ChangesRequest::from_config(cursor, config);
        let stream = match store.changes(request).await {
            Ok(stream) => stream,
            Err(e) => return Err(self.subscription_failed(generation, e)),
        };
        self.ensure_current(generation)?;

        tracing::info!(store = %self.connection.name(), since = %cursor, "following changes");
        let task = tokio::spawn(follow(
            self.shared.clone(),
            stream,
            generation,
            self.connection.name().to_string(),
        ));
        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    /// Create a member in the store and add it locally.
    pub async fn create(&self, fields: Map<String, Value>) -> Result<DocId> {
        let mut record = Record::new(fields);
        let canonical = self
            .execute(Intent::Create, Target::Record(&record))
            .await?;
        let Canonical::Identity { id, rev } = canonical else {
            return Err(unexpected(Intent::Create));
        };

        record.assign_identity(id.clone(), rev);
        self.apply_write(record, None)?;
        Ok(id)
    }

    /// Merge `fields` into a member and write it with its current revision.
    ///
    /// On failure the member is left as it was.
    pub async fn save(&self, id: &str, fields: Map<String, Value>) -> Result<()> {
        let mut record = self.member(id)?;
        let based_on = record.rev().map(str::to_owned);
        record.set_fields(fields);

        let canonical = self
            .execute(Intent::Update, Target::Record(&record))
            .await?;
        let Canonical::Identity { id, rev } = canonical else {
            return Err(unexpected(Intent::Update));
        };

        record.assign_identity(id, rev);
        self.apply_write(record, based_on.as_deref())
    }

    /// Delete a member from the store and drop it locally.
    pub async fn destroy(&self, id: &str) -> Result<()> {
        let record = self.member(id)?;
        self.execute(Intent::Delete, Target::Record(&record))
            .await?;
        if self.shared.closed.load(AtomicOrdering::SeqCst) {
            return Ok(());
        }

        let removed = self.shared.collection.lock().remove(id);
        if let Some((_, event)) = removed {
            self.shared.emit(event);
        }
        Ok(())
    }

    /// Stop following changes. Results of in-flight fetches are discarded.
    pub fn close(&self) {
        self.shared.closed.store(true, AtomicOrdering::SeqCst);
        self.shared.generation.fetch_add(1, AtomicOrdering::SeqCst);
        self.teardown();
        self.shared.reconciler.lock().stop();
        tracing::debug!(store = %self.connection.name(), "collection closed");
    }

    /// Members in comparator order.
    pub fn snapshot(&self) -> Vec<Record> {
        self.shared.collection.lock().iter().cloned().collect()
    }

    /// Member identifiers in comparator order.
    pub fn ids(&self) -> Vec<DocId> {
        self.shared.collection.lock().ids()
    }

    pub fn get(&self, id: &str) -> Option<Record> {
        self.shared.collection.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.shared.collection.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.collection.lock().is_empty()
    }

    pub fn reconciler_state(&self) -> ReconcilerState {
        self.shared.reconciler.lock().state().clone()
    }

    /// Last store sequence reflected in memory.
    pub fn cursor(&self) -> Option<Sequence> {
        self.shared.reconciler.lock().cursor()
    }

    async fn execute(&self, intent: Intent, target: Target<'_>) -> Result<Canonical> {
        let config =
            EffectiveConfig::resolve(&self.defaults, self.connection.options(), &SyncConfig::new());
        self.dispatcher
            .execute(intent, target, &self.connection, &config)
            .await
    }

    /// Apply a write result to the local member.
    ///
    /// Skipped when the member no longer carries `based_on` (the revision the
    /// write started from, `None` for a create): the change feed has already
    /// delivered this write or something newer.
    fn apply_write(&self, record: Record, based_on: Option<&str>) -> Result<()> {
        if self.shared.closed.load(AtomicOrdering::SeqCst) {
            return Ok(());
        }

        let event = {
            let mut collection = self.shared.collection.lock();
            let id = record.id().unwrap_or_default();
            let current = collection.get(id).and_then(Record::rev);
            if current != based_on {
                tracing::debug!(
                    store = %self.connection.name(),
                    id,
                    current = ?current,
                    "write result superseded by change feed"
                );
                return Ok(());
            }
            collection.upsert(record)?
        };
        self.shared.emit(event);
        Ok(())
    }

    fn subscription_failed(&self, generation: u64, error: Error) -> Error {
        let error = match error {
            Error::Subscription(_) => error,
            other => Error::Subscription(other.to_string()),
        };
        if let Err(discarded) = self.ensure_current(generation) {
            return discarded;
        }

        tracing::warn!(store = %self.connection.name(), error = %error, "could not follow changes");
        let event = self.shared.reconciler.lock().fail(error.to_string());
        self.shared.emit(event);
        error
    }

    fn member(&self, id: &str) -> Result<Record> {
        self.get(id).ok_or_else(|| Error::NotFound(id.to_string()))
    }

    fn ensure_current(&self, generation: u64) -> Result<()> {
        if self.shared.is_current(generation) {
            Ok(())
        } else {
            tracing::debug!(store = %self.connection.name(), generation, "discarding stale fetch");
            Err(Error::Discarded("superseded by a newer fetch or close".into()))
        }
    }

    fn teardown(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            tracing::debug!(store = %self.connection.name(), "subscription torn down");
        }
        self.shared.reconciler.lock().begin_load();
    }
}

impl Drop for LiveCollection {
    fn drop(&mut self) {
        self.shared.closed.store(true, AtomicOrdering::SeqCst);
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for LiveCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveCollection")
            .field("store", &self.connection.name())
            .field("len", &self.len())
            .field("state", &self.reconciler_state())
            .finish()
    }
}

fn unexpected(intent: Intent) -> Error {
    Error::Normalization(format!("{intent} did not return an identity"))
}

/// Subscription task: apply changes one at a time, in delivery order.
async fn follow(shared: Arc<Shared>, mut stream: ChangeStream, generation: u64, store: String) {
    while let Some(item) = stream.next().await {
        if !shared.is_current(generation) {
            break;
        }

        let change = match item {
            Ok(change) => change,
            Err(e) => {
                tracing::error!(store = %store, error = %e, "change feed died");
                let event = shared.reconciler.lock().fail(e.to_string());
                shared.emit(event);
                return;
            }
        };

        let applied = {
            let mut collection = shared.collection.lock();
            let mut reconciler = shared.reconciler.lock();
            reconciler.apply(&mut collection, &change)
        };

        match applied {
            Ok(Applied::Skipped) => {
                tracing::trace!(store = %store, seq = change.seq.0, "change skipped");
            }
            Ok(applied) => {
                tracing::debug!(store = %store, seq = change.seq.0, id = %change.id, "change applied");
                if let Applied::Event(event) = &applied {
                    shared.emit(event.clone());
                }
                let hook = shared.on_change.lock().clone();
                if let Some(hook) = hook {
                    hook(&change, &applied);
                }
            }
            Err(e) => {
                tracing::warn!(store = %store, seq = change.seq.0, error = %e, "change not applied");
            }
        }
    }
    tracing::debug!(store = %store, "change feed ended");
}
