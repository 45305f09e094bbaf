use std::path::Path;

use chrono::{SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::content_key::{short_hash, ContentKey};

pub const SAVED_TAGS_SCHEMA_VERSION: u64 = 1;

/// A placeholder remembered by the text around it instead of by its delimiters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedTagRecord {
    pub fingerprint: String,
    /// Normalized placeholder content; the content key derives from this.
    pub content: String,
    /// The placeholder exactly as it appeared in the message, delimiters included.
    pub raw: String,
    /// Byte offset into the logical text the fingerprint was taken from.
    pub insert_position: usize,
    #[serde(default)]
    pub saved_at: Option<String>,
}

impl SavedTagRecord {
    pub fn new(
        fingerprint: impl Into<String>,
        content: impl Into<String>,
        raw: impl Into<String>,
        insert_position: usize,
    ) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            content: content.into(),
            raw: raw.into(),
            insert_position,
            saved_at: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        }
    }

    pub fn content_key(&self) -> ContentKey {
        ContentKey::derive(&self.content)
    }
}

/// Hashes the `width`-byte window centred in `text` (the whole text when shorter).
/// Window edges snap down to character boundaries.
pub fn fingerprint_text(text: &str, width: usize) -> String {
    short_hash(middle_slice(text, width))
}

fn middle_slice(text: &str, width: usize) -> &str {
    if width == 0 || text.len() <= width {
        return text;
    }
    let mut start = (text.len() - width) / 2;
    let mut end = start + width;
    while !text.is_char_boundary(start) {
        start -= 1;
    }
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[start..end]
}

/// Fingerprint-keyed store of saved tags.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SavedTagRegistry {
    records: IndexMap<String, Vec<SavedTagRecord>>,
}

impl SavedTagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lenient load: a missing or unreadable file gives an empty registry and rows
    /// that do not parse are dropped.
    pub fn load(path: &Path) -> Self {
        let mut registry = Self::new();
        let payload = read_json(path).unwrap_or(Value::Object(Map::new()));
        let Some(rows) = payload.get("records").and_then(Value::as_array) else {
            return registry;
        };
        for row in rows {
            if let Ok(record) = serde_json::from_value::<SavedTagRecord>(row.clone()) {
                registry.insert(record);
            }
        }
        registry
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let rows: Vec<&SavedTagRecord> = self.records.values().flatten().collect();
        let mut root = Map::new();
        root.insert(
            "schema_version".to_string(),
            Value::Number(SAVED_TAGS_SCHEMA_VERSION.into()),
        );
        root.insert("records".to_string(), serde_json::to_value(rows)?);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&Value::Object(root))?)?;
        Ok(())
    }

    /// Returns false when an equivalent record (same key, same position) already exists.
    pub fn insert(&mut self, record: SavedTagRecord) -> bool {
        let bucket = self.records.entry(record.fingerprint.clone()).or_default();
        let key = record.content_key();
        if bucket.iter().any(|existing| {
            existing.insert_position == record.insert_position && existing.content_key() == key
        }) {
            return false;
        }
        bucket.push(record);
        true
    }

    pub fn candidates(&self, fingerprint: &str) -> &[SavedTagRecord] {
        self.records
            .get(fingerprint)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn forget(&mut self, fingerprint: &str, key: &ContentKey) -> usize {
        let Some(bucket) = self.records.get_mut(fingerprint) else {
            return 0;
        };
        let before = bucket.len();
        bucket.retain(|record| &record.content_key() != key);
        let removed = before - bucket.len();
        if bucket.is_empty() {
            self.records.shift_remove(fingerprint);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn read_json(path: &Path) -> Option<Value> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}
