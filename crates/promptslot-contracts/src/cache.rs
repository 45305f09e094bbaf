use std::path::{Path, PathBuf};

use anyhow::Context;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::content_key::ContentKey;

/// A previously generated result for a content key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResult {
    pub url: String,
    #[serde(default)]
    pub annotation: Option<String>,
    #[serde(default)]
    pub is_video: bool,
}

/// Lookup side of the result store. `variant` picks one of several results kept for
/// the same key; `None` means the most recent one.
pub trait ResultCache {
    fn lookup(
        &mut self,
        key: &ContentKey,
        variant: Option<usize>,
    ) -> anyhow::Result<Option<CachedResult>>;

    fn store(&mut self, key: &ContentKey, result: CachedResult) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryResultCache {
    entries: IndexMap<ContentKey, Vec<CachedResult>>,
}

impl MemoryResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ResultCache for MemoryResultCache {
    fn lookup(
        &mut self,
        key: &ContentKey,
        variant: Option<usize>,
    ) -> anyhow::Result<Option<CachedResult>> {
        Ok(self
            .entries
            .get(key)
            .and_then(|variants| pick_variant(variants, variant))
            .cloned())
    }

    fn store(&mut self, key: &ContentKey, result: CachedResult) -> anyhow::Result<()> {
        let variants = self.entries.entry(key.clone()).or_default();
        if variants.last() != Some(&result) {
            variants.push(result);
        }
        Ok(())
    }
}

/// File-backed cache: `{ "<key>": { "variants": [ {url, annotation, is_video}, ... ] } }`.
///
/// Every lookup re-reads the file so separate instances see each other's writes, and
/// flushes merge only the keys this instance touched into whatever is on disk.
#[derive(Debug, Clone)]
pub struct JsonResultCache {
    path: PathBuf,
    payload: Option<Map<String, Value>>,
    dirty_keys: Vec<String>,
}

impl JsonResultCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            payload: None,
            dirty_keys: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        if self.dirty_keys.is_empty() {
            return Ok(());
        }
        let Some(payload) = &self.payload else {
            return Ok(());
        };

        let mut on_disk = read_json_object(&self.path)?;
        for key in &self.dirty_keys {
            if let Some(value) = payload.get(key) {
                on_disk.insert(key.clone(), value.clone());
            }
        }
        write_json_object(&self.path, &on_disk)?;
        self.payload = Some(on_disk);
        self.dirty_keys.clear();
        Ok(())
    }

    fn reload(&mut self) -> anyhow::Result<&mut Map<String, Value>> {
        let fresh = read_json_object(&self.path)?;
        Ok(self.payload.insert(fresh))
    }
}

impl ResultCache for JsonResultCache {
    fn lookup(
        &mut self,
        key: &ContentKey,
        variant: Option<usize>,
    ) -> anyhow::Result<Option<CachedResult>> {
        let payload = self.reload()?;
        let variants = decode_variants(payload.get(key.as_str()));
        Ok(pick_variant(&variants, variant).cloned())
    }

    fn store(&mut self, key: &ContentKey, result: CachedResult) -> anyhow::Result<()> {
        let payload = self.reload()?;
        let mut variants = decode_variants(payload.get(key.as_str()));
        if variants.last() == Some(&result) {
            return Ok(());
        }
        variants.push(result);

        let mut entry = Map::new();
        entry.insert("variants".to_string(), serde_json::to_value(&variants)?);
        payload.insert(key.as_str().to_string(), Value::Object(entry));
        if !self.dirty_keys.iter().any(|dirty| dirty == key.as_str()) {
            self.dirty_keys.push(key.as_str().to_string());
        }
        self.flush()
    }
}

fn pick_variant(variants: &[CachedResult], variant: Option<usize>) -> Option<&CachedResult> {
    match variant {
        Some(index) => variants.get(index),
        None => variants.last(),
    }
}

fn decode_variants(entry: Option<&Value>) -> Vec<CachedResult> {
    entry
        .and_then(|value| value.get("variants"))
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(|row| serde_json::from_value(row.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

fn read_json_object(path: &Path) -> anyhow::Result<Map<String, Value>> {
    if !path.exists() {
        return Ok(Map::new());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading result cache {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    let parsed: Value = serde_json::from_str(&raw)
        .with_context(|| format!("parsing result cache {}", path.display()))?;
    match parsed {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("result cache {} is not a JSON object", path.display()),
    }
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )?;
    Ok(())
}
