//! Docsync demo - a todo list kept in step with an in-memory document store.
//!
//! Loads the list through a view, follows the change feed, and plays the part
//! of a second client writing to the same store.

use std::sync::Arc;
use std::time::Duration;

use docsync_adapter::{ConnectionBroker, DocumentStore, MemoryOpener, Settings, SyncAdapter};
use docsync_engine::{Comparator, DocFilter, OptionGroup, SyncConfig};
use serde_json::{json, Map, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const TODOS_VIEW: &str = "todos/by_order";

fn todo(title: &str, order: f64) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("type".into(), json!("todo"));
    fields.insert("title".into(), json!(title));
    fields.insert("order".into(), json!(order));
    fields.insert("done".into(), json!(false));
    fields
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docsync_adapter=debug,docsync_demo=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let settings = Settings::from_env()?;

    tracing::info!(store = %settings.store, listen = settings.listen, "Starting docsync demo");

    let mut opener = MemoryOpener::new();
    if let Some(delay) = settings.open_delay {
        opener = opener.with_delay(delay);
    }
    let opener = Arc::new(opener);

    // Seed the store the way another client would have left it
    let store = opener.store(&settings.store);
    store.register_view(TODOS_VIEW, |doc| {
        (doc.get("type") == Some(&json!("todo")))
            .then(|| (doc.get("order").cloned().unwrap_or(Value::Null), Value::Null))
    });
    let seed = OptionGroup::new();
    store.post(json!({"type": "todo", "title": "buy milk", "order": 1}), &seed).await?;
    store.post(json!({"type": "todo", "title": "walk dog", "order": 2}), &seed).await?;
    store.post(json!({"type": "note", "text": "not a todo"}), &seed).await?;

    let adapter = SyncAdapter::new(ConnectionBroker::new_shared(opener.clone()))
        .with_defaults(SyncConfig::new().with_listen(settings.listen));
    let mut requests = adapter.requests();
    tokio::spawn(async move {
        while let Ok(issued) = requests.recv().await {
            tracing::info!(intent = %issued.intent, call = %issued.call, "request issued");
        }
    });

    let connection = adapter.connection(
        settings.store.clone(),
        SyncConfig::new()
            .with_view(TODOS_VIEW)
            .with_filter(DocFilter::field_equals("type", "todo")),
    );
    let todos = adapter.collection(connection, Comparator::by_field("order"));
    todos.on_change(|change, _| {
        tracing::info!(seq = change.seq.0, id = %change.id, "remote change");
    });

    let mut events = todos.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => tracing::info!(event = %json, "collection event"),
                Err(e) => tracing::error!("Failed to serialize collection event: {}", e),
            }
        }
    });

    let count = todos.fetch(&SyncConfig::new()).await?;
    tracing::info!(count, ids = ?todos.ids(), "loaded todos");

    let id = todos.create(todo("water plants", 3.0)).await?;

    // Another client slots a todo between the first two
    store.post(json!({"type": "todo", "title": "call mum", "order": 1.5}), &seed).await?;

    let mut done = Map::new();
    done.insert("done".into(), json!(true));
    todos.save(&id, done).await?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    for record in todos.snapshot() {
        let title = record.get("title").cloned().unwrap_or(Value::Null);
        let done = record.get("done").cloned().unwrap_or(Value::Null);
        tracing::info!(id = record.id().unwrap_or_default(), %title, %done, "todo");
    }

    todos.destroy(&id).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    tracing::info!(ids = ?todos.ids(), state = ?todos.reconciler_state(), "final state");

    todos.close();
    Ok(())
}
