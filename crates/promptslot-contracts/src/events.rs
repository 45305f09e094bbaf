use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

pub type EventPayload = Map<String, Value>;

#[derive(Debug)]
enum Sink {
    File(PathBuf),
    Memory(Vec<Value>),
    Discard,
}

/// Append-only structured event log.
///
/// - default fields are `type`, `session_id`, `ts`
/// - caller payload is merged last and can override defaults
/// - file sinks get one compact JSON object per line
///
/// Clones share the same sink.
#[derive(Debug, Clone)]
pub struct EventLog {
    inner: Arc<EventLogInner>,
}

#[derive(Debug)]
struct EventLogInner {
    session_id: String,
    sink: Mutex<Sink>,
}

impl EventLog {
    pub fn to_file(path: impl Into<PathBuf>) -> Self {
        Self::with_sink(Sink::File(path.into()))
    }

    pub fn in_memory() -> Self {
        Self::with_sink(Sink::Memory(Vec::new()))
    }

    pub fn discard() -> Self {
        Self::with_sink(Sink::Discard)
    }

    fn with_sink(sink: Sink) -> Self {
        Self {
            inner: Arc::new(EventLogInner {
                session_id: Uuid::new_v4().to_string(),
                sink: Mutex::new(sink),
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }
        let event = Value::Object(event);

        let mut sink = self
            .inner
            .sink
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        match &mut *sink {
            Sink::File(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let line = serde_json::to_string(&event)?;
                let mut file = OpenOptions::new().create(true).append(true).open(path)?;
                file.write_all(line.as_bytes())?;
                file.write_all(b"\n")?;
            }
            Sink::Memory(rows) => rows.push(event.clone()),
            Sink::Discard => {}
        }
        Ok(event)
    }

    /// Emits and swallows sink failures; engine work never stops because logging broke.
    pub fn record(&self, event_type: &str, payload: EventPayload) {
        let _ = self.emit(event_type, payload);
    }

    /// Events captured by an in-memory sink, oldest first. Empty for other sinks.
    pub fn captured(&self) -> Vec<Value> {
        match self.inner.sink.lock() {
            Ok(sink) => match &*sink {
                Sink::Memory(rows) => rows.clone(),
                _ => Vec::new(),
            },
            Err(_) => Vec::new(),
        }
    }

    pub fn captured_types(&self) -> Vec<String> {
        self.captured()
            .iter()
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect()
    }
}

pub fn payload(value: Value) -> EventPayload {
    value.as_object().cloned().unwrap_or_default()
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;
    use serde_json::json;

    use super::*;

    #[test]
    fn file_sink_writes_compact_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("logs").join("events.jsonl");
        let log = EventLog::to_file(&path);

        let emitted = log.emit("scan_started", payload(json!({"root": 4})))?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;

        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], json!("scan_started"));
        assert_eq!(parsed["session_id"], json!(log.session_id()));
        assert_eq!(parsed["root"], json!(4));

        let ts = parsed["ts"].as_str().unwrap_or("");
        DateTime::parse_from_rfc3339(ts)?;
        Ok(())
    }

    #[test]
    fn payload_can_override_default_keys() -> anyhow::Result<()> {
        let log = EventLog::in_memory();
        let emitted = log.emit("scan_started", payload(json!({"type": "override"})))?;
        assert_eq!(emitted["type"], json!("override"));
        Ok(())
    }

    #[test]
    fn clones_share_memory_sink() {
        let log = EventLog::in_memory();
        let other = log.clone();
        log.record("one", EventPayload::new());
        other.record("two", EventPayload::new());
        assert_eq!(log.captured_types(), vec!["one", "two"]);
    }

    #[test]
    fn record_ignores_unwritable_file_sink() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let blocker = temp.path().join("blocker");
        fs::write(&blocker, b"file")?;
        let log = EventLog::to_file(blocker.join("events.jsonl"));
        log.record("scan_started", EventPayload::new());
        assert!(log.emit("scan_started", EventPayload::new()).is_err());
        Ok(())
    }
}
