//! Event emission for run observability.
//!
//! Sinks receive dotted event types (`pipeline.started`, `stage.retrying`,
//! `fanout.task_failed`, `tool.replayed`, ...). [`RunEvents`] stamps every
//! payload with the run id and a timestamp before handing it to the sink.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use parking_lot::RwLock;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

static GLOBAL_EVENT_SINK: RwLock<Option<Arc<dyn EventSink>>> = RwLock::new(None);

/// Sets the process-wide default event sink.
pub fn set_event_sink(sink: Arc<dyn EventSink>) {
    *GLOBAL_EVENT_SINK.write() = Some(sink);
}

/// Clears the process-wide default event sink.
pub fn clear_event_sink() {
    *GLOBAL_EVENT_SINK.write() = None;
}

/// Returns the process-wide default event sink.
///
/// Returns a `NoOpEventSink` if no sink is set.
pub fn get_event_sink() -> Arc<dyn EventSink> {
    GLOBAL_EVENT_SINK
        .read()
        .clone()
        .unwrap_or_else(|| Arc::new(NoOpEventSink))
}

/// Emits events for one run.
#[derive(Clone)]
pub struct RunEvents {
    sink: Arc<dyn EventSink>,
    run_id: Uuid,
}

impl RunEvents {
    /// Creates an emitter for `run_id`.
    #[must_use]
    pub fn new(sink: Arc<dyn EventSink>, run_id: Uuid) -> Self {
        Self { sink, run_id }
    }

    /// Returns the run id stamped on every event.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Emits `event_type` with the given fields.
    ///
    /// Non-object payloads are wrapped under `data`.
    pub fn emit(&self, event_type: &str, fields: Value) {
        let mut payload = match fields {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        payload.insert("run_id".to_string(), json!(self.run_id.to_string()));
        payload.insert(
            "timestamp".to_string(),
            json!(chrono::Utc::now().to_rfc3339()),
        );
        self.sink.try_emit(event_type, Some(Value::Object(payload)));
    }
}

impl std::fmt::Debug for RunEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunEvents")
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}
