//! Adapter configuration and its three-layer resolution.
//!
//! Options come from library defaults, from the named connection and from the
//! individual call. Later layers win; per-call option groups are merged key by
//! key so a partial override keeps its sibling keys.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Options passed through to one document-store call.
pub type OptionGroup = Map<String, Value>;

/// The document-store calls that carry their own option group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StoreCall {
    /// Point read by identifier
    Get,
    /// Insert with a server-assigned identifier
    Post,
    /// Upsert with explicit identifier and revision
    Put,
    /// Delete with the current revision
    Remove,
    /// Bulk listing of every document
    AllDocs,
    /// Indexed view query
    Query,
    /// Change subscription
    Changes,
}

impl StoreCall {
    /// Every call type, in declaration order.
    pub const ALL: [StoreCall; 7] = [
        StoreCall::Get,
        StoreCall::Post,
        StoreCall::Put,
        StoreCall::Remove,
        StoreCall::AllDocs,
        StoreCall::Query,
        StoreCall::Changes,
    ];

    /// Name of the call as the store client spells it.
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreCall::Get => "get",
            StoreCall::Post => "post",
            StoreCall::Put => "put",
            StoreCall::Remove => "remove",
            StoreCall::AllDocs => "allDocs",
            StoreCall::Query => "query",
            StoreCall::Changes => "changes",
        }
    }
}

impl fmt::Display for StoreCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Predicate selecting the documents a collection cares about.
#[derive(Clone)]
pub struct DocFilter(Arc<dyn Fn(&Value) -> bool + Send + Sync>);

impl DocFilter {
    /// Wrap a predicate over document bodies.
    pub fn new(predicate: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    /// Match documents whose `field` equals `value`.
    pub fn field_equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        let field = field.into();
        let value = value.into();
        Self::new(move |doc| doc.get(&field) == Some(&value))
    }

    /// Test a document body.
    pub fn matches(&self, doc: &Value) -> bool {
        (self.0)(doc)
    }
}

impl fmt::Debug for DocFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DocFilter(..)")
    }
}

/// One configuration layer. Unset values fall through to the layer below.
#[derive(Debug, Clone, Default)]
pub struct SyncConfig {
    /// Start a change subscription after collection reads
    pub listen: Option<bool>,
    /// View used for collection reads instead of the bulk listing
    pub view: Option<String>,
    /// Domain filter for the change subscription and remote inserts
    pub filter: Option<DocFilter>,
    /// Per-call option groups
    pub options: BTreeMap<StoreCall, OptionGroup>,
}

impl SyncConfig {
    /// An empty layer.
    pub fn new() -> Self {
        Self::default()
    }

    /// The defaults shipped with the library.
    pub fn library_defaults() -> Self {
        let mut config = Self::new().with_listen(true);
        for call in StoreCall::ALL {
            config.options.insert(call, Map::new());
        }
        config
            .with_option(StoreCall::AllDocs, "include_docs", true)
            .with_option(StoreCall::Query, "include_docs", true)
            .with_option(StoreCall::Changes, "live", true)
            .with_option(StoreCall::Changes, "include_docs", true)
    }

    pub fn with_listen(mut self, listen: bool) -> Self {
        self.listen = Some(listen);
        self
    }

    pub fn with_view(mut self, view: impl Into<String>) -> Self {
        self.view = Some(view.into());
        self
    }

    pub fn with_filter(mut self, filter: DocFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Set one key inside a call's option group.
    pub fn with_option(mut self, call: StoreCall, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options
            .entry(call)
            .or_default()
            .insert(key.into(), value.into());
        self
    }

    /// Layer `other` over `self`: set values and option keys in `other` win.
    pub fn overlay(mut self, other: &SyncConfig) -> Self {
        if other.listen.is_some() {
            self.listen = other.listen;
        }
        if other.view.is_some() {
            self.view = other.view.clone();
        }
        if other.filter.is_some() {
            self.filter = other.filter.clone();
        }
        for (call, group) in &other.options {
            let merged = self.options.entry(*call).or_default();
            for (key, value) in group {
                merged.insert(key.clone(), value.clone());
            }
        }
        self
    }
}

/// The configuration in force for one operation.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    listen: bool,
    view: Option<String>,
    filter: Option<DocFilter>,
    options: BTreeMap<StoreCall, OptionGroup>,
}

impl EffectiveConfig {
    /// Merge the three layers: `call` over `connection` over `defaults`.
    pub fn resolve(defaults: &SyncConfig, connection: &SyncConfig, call: &SyncConfig) -> Self {
        let merged = defaults.clone().overlay(connection).overlay(call);

        let mut options: BTreeMap<StoreCall, OptionGroup> =
            StoreCall::ALL.iter().map(|c| (*c, Map::new())).collect();
        options.extend(merged.options);

        Self {
            listen: merged.listen.unwrap_or(true),
            view: merged.view,
            filter: merged.filter,
            options,
        }
    }

    /// Whether collection reads start a change subscription.
    pub fn listen(&self) -> bool {
        self.listen
    }

    /// View used for collection reads, if any.
    pub fn view(&self) -> Option<&str> {
        self.view.as_deref()
    }

    /// Domain filter for remote changes, if any.
    pub fn filter(&self) -> Option<&DocFilter> {
        self.filter.as_ref()
    }

    /// Option group for a store call.
    pub fn group(&self, call: StoreCall) -> &OptionGroup {
        static EMPTY: OnceLock<OptionGroup> = OnceLock::new();
        self.options
            .get(&call)
            .unwrap_or_else(|| EMPTY.get_or_init(Map::new))
    }

    /// Boolean option inside a group; absent or non-boolean reads as false.
    pub fn flag(&self, call: StoreCall, key: &str) -> bool {
        self.group(call)
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        Self::resolve(&SyncConfig::library_defaults(), &SyncConfig::new(), &SyncConfig::new())
    }
}
