//! Operation dispatcher.
//!
//! Executes a planned intent against an opened store and normalizes the
//! answer. Every store call is announced on a broadcast channel first, so
//! observers can react to in-flight requests without polling.

use chrono::{DateTime, Utc};
use docsync_engine::{
    normalize, plan, Canonical, EffectiveConfig, Error, Intent, Result, StoreCall, StoreName,
    StoreRequest, Target,
};
use tokio::sync::broadcast;

use crate::broker::Connection;

/// Capacity of the request-issued channel.
const REQUEST_CHANNEL_CAPACITY: usize = 256;

/// Announcement sent right before a store call is made.
#[derive(Debug, Clone)]
pub struct RequestIssued {
    /// What the caller asked for
    pub intent: Intent,
    /// Store the request goes to
    pub store: StoreName,
    /// Store call about to be made
    pub call: StoreCall,
    /// Configuration in force for the request
    pub config: EffectiveConfig,
    /// When the request was issued
    pub issued_at: DateTime<Utc>,
}

/// Receiver of request-issued announcements.
pub type RequestReceiver = broadcast::Receiver<RequestIssued>;

/// Runs intents against stores.
#[derive(Debug)]
pub struct Dispatcher {
    requests: broadcast::Sender<RequestIssued>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (requests, _) = broadcast::channel(REQUEST_CHANNEL_CAPACITY);
        Self { requests }
    }

    /// Subscribe to request-issued announcements.
    pub fn subscribe(&self) -> RequestReceiver {
        self.requests.subscribe()
    }

    /// Execute `intent` on `target` through `connection`.
    ///
    /// # Algorithm
    ///
    /// 1. Wait for the connection's store handle
    /// 2. Plan the store call
    /// 3. Announce the request
    /// 4. Make the call with the call's option group
    /// 5. Normalize the raw response
    pub async fn execute(
        &self,
        intent: Intent,
        target: Target<'_>,
        connection: &Connection,
        config: &EffectiveConfig,
    ) -> Result<Canonical> {
        let store = connection.open().await?;
        let plan = plan(intent, target, config)?;

        let announcement = RequestIssued {
            intent,
            store: connection.name().to_string(),
            call: plan.call,
            config: config.clone(),
            issued_at: Utc::now(),
        };
        // No subscribers is fine
        let _ = self.requests.send(announcement);

        tracing::debug!(
            store = %connection.name(),
            intent = %intent,
            call = %plan.call,
            "issuing store request"
        );

        let options = config.group(plan.call);
        let raw = match (plan.call, plan.request) {
            (StoreCall::Post, StoreRequest::Document(doc)) => store.post(doc, options).await,
            (StoreCall::Put, StoreRequest::Document(doc)) => store.put(doc, options).await,
            (StoreCall::Remove, StoreRequest::Document(doc)) => store.remove(doc, options).await,
            (StoreCall::Get, StoreRequest::Id(id)) => store.get(&id, options).await,
            (StoreCall::Query, StoreRequest::View(view)) => store.query(&view, options).await,
            (StoreCall::AllDocs, StoreRequest::All) => store.all_docs(options).await,
            (call, request) => {
                return Err(Error::Store(format!(
                    "cannot issue {call} with {request:?}"
                )))
            }
        };

        let raw = raw.map_err(|e| {
            tracing::warn!(store = %connection.name(), intent = %intent, error = %e, "store request failed");
            e
        })?;

        normalize(plan.response, raw)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
