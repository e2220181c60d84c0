//! Adapter entry point.
//!
//! [`SyncAdapter`] ties a broker, a dispatcher and the adapter-wide defaults
//! together. Records are written through explicit helpers that wrap the
//! store calls; collections are handed out as [`LiveCollection`]s.

use std::sync::Arc;

use docsync_engine::{
    Canonical, Comparator, EffectiveConfig, Intent, Record, Result, StoreName, SyncConfig, Target,
};

use crate::broker::{Connection, ConnectionBroker};
use crate::dispatch::{Dispatcher, RequestReceiver};
use crate::live::LiveCollection;

/// The sync adapter.
#[derive(Debug, Clone)]
pub struct SyncAdapter {
    broker: Arc<ConnectionBroker>,
    dispatcher: Arc<Dispatcher>,
    defaults: SyncConfig,
}

impl SyncAdapter {
    /// Create an adapter using the library defaults.
    pub fn new(broker: Arc<ConnectionBroker>) -> Self {
        Self {
            broker,
            dispatcher: Arc::new(Dispatcher::new()),
            defaults: SyncConfig::library_defaults(),
        }
    }

    /// Layer adapter-wide defaults over the library defaults.
    pub fn with_defaults(mut self, defaults: SyncConfig) -> Self {
        self.defaults = SyncConfig::library_defaults().overlay(&defaults);
        self
    }

    /// The defaults layer in force.
    pub fn defaults(&self) -> &SyncConfig {
        &self.defaults
    }

    pub fn broker(&self) -> &Arc<ConnectionBroker> {
        &self.broker
    }

    /// A lazy opener for the store called `name`.
    pub fn connection(&self, name: impl Into<StoreName>, options: SyncConfig) -> Connection {
        self.broker.connection(name, options)
    }

    /// Subscribe to request-issued announcements.
    pub fn requests(&self) -> RequestReceiver {
        self.dispatcher.subscribe()
    }

    /// Resolve the configuration for one call on `connection`.
    pub fn resolve(&self, connection: &Connection, call: &SyncConfig) -> EffectiveConfig {
        EffectiveConfig::resolve(&self.defaults, connection.options(), call)
    }

    /// Run one intent and return the canonical response.
    pub async fn perform_operation(
        &self,
        intent: Intent,
        target: Target<'_>,
        connection: &Connection,
        call: &SyncConfig,
    ) -> Result<Canonical> {
        let config = self.resolve(connection, call);
        self.dispatcher
            .execute(intent, target, connection, &config)
            .await
    }

    /// Write `record`: create when it has no identifier, update otherwise.
    ///
    /// The new identity is assigned only on success.
    pub async fn save(
        &self,
        connection: &Connection,
        record: &mut Record,
        call: &SyncConfig,
    ) -> Result<()> {
        let intent = if record.is_new() {
            Intent::Create
        } else {
            Intent::Update
        };

        let response = self
            .perform_operation(intent, Target::Record(record), connection, call)
            .await?;
        match response {
            Canonical::Identity { id, rev } => {
                record.assign_identity(id, rev);
                Ok(())
            }
            other => Err(unexpected(intent, &other)),
        }
    }

    /// Delete `record` from the store and clear its identity.
    pub async fn destroy(
        &self,
        connection: &Connection,
        record: &mut Record,
        call: &SyncConfig,
    ) -> Result<()> {
        self.perform_operation(Intent::Delete, Target::Record(record), connection, call)
            .await?;
        record.clear_identity();
        Ok(())
    }

    /// Refresh `record` from the store.
    pub async fn fetch(
        &self,
        connection: &Connection,
        record: &mut Record,
        call: &SyncConfig,
    ) -> Result<()> {
        let response = self
            .perform_operation(Intent::Read, Target::Record(record), connection, call)
            .await?;
        match response {
            Canonical::Document(fetched) => {
                if let serde_json::Value::Object(body) = fetched.to_body() {
                    record.set_fields(body);
                }
                Ok(())
            }
            other => Err(unexpected(Intent::Read, &other)),
        }
    }

    /// A live collection over `connection`, ordered by `comparator`.
    ///
    /// Nothing is read until [`LiveCollection::fetch`] is called.
    pub fn collection(&self, connection: Connection, comparator: Comparator) -> LiveCollection {
        LiveCollection::new(
            connection,
            comparator,
            self.defaults.clone(),
            self.dispatcher.clone(),
        )
    }
}

fn unexpected(intent: Intent, response: &Canonical) -> docsync_engine::Error {
    docsync_engine::Error::Normalization(format!(
        "unexpected response to {intent}: {response:?}"
    ))
}
