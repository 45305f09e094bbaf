//! Generation concurrency: at most one outstanding request per content key, with the
//! response fanned out to every copy of the widget in every known document.
//!
//! Per key the state is `Idle -> Requested -> Idle`; the transient success/failure
//! step happens inside [`DispatchCoordinator::handle_response`]. The job table is the
//! correlation listener: a response whose id has no job is dropped, and a job is
//! torn down by the first response that matches it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use promptslot_contracts::events::payload;
use promptslot_contracts::{
    CachedResult, ContentKey, EngineConfig, EventLog, GenerationPayload, GenerationRequest,
    GenerationResponse, Modification, ResultCache,
};
use serde_json::json;

use crate::documents::DocumentStore;
use crate::transport::GenerationTransport;
use crate::widget;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightJob {
    pub content_key: ContentKey,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Requested,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchStatus {
    Emitted,
    /// A job for the key was already outstanding; nothing new went out.
    Coalesced,
    TransportFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    Filled { key: ContentKey, slots: usize },
    Failed { key: ContentKey, error: String },
    /// No outstanding job carries this id (late duplicate or never requested).
    Unmatched { key: ContentKey },
}

#[derive(Debug, Default)]
pub struct DispatchCoordinator {
    jobs: IndexMap<ContentKey, InFlightJob>,
    annotations: HashMap<ContentKey, Modification>,
}

impl DispatchCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, key: &ContentKey) -> JobState {
        if self.jobs.contains_key(key) {
            JobState::Requested
        } else {
            JobState::Idle
        }
    }

    pub fn in_flight(&self, key: &ContentKey) -> bool {
        self.jobs.contains_key(key)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &InFlightJob> {
        self.jobs.values()
    }

    /// Parks a one-time modification for the next request of `key`.
    pub fn annotate(
        &mut self,
        docs: &mut DocumentStore,
        key: &ContentKey,
        modification: Modification,
    ) {
        for (_, doc) in docs.iter_mut() {
            let root = doc.root();
            for trigger in widget::triggers_for(doc, root, key) {
                doc.set_attr(trigger, widget::NOTE_ATTR, &modification.note);
            }
        }
        self.annotations.insert(key.clone(), modification);
    }

    pub fn request(
        &mut self,
        docs: &mut DocumentStore,
        transport: &mut dyn GenerationTransport,
        config: &EngineConfig,
        events: &EventLog,
        key: &ContentKey,
        mut generation: GenerationPayload,
    ) -> DispatchStatus {
        for_each_trigger(docs, key, |doc, trigger| widget::mark_busy(doc, trigger, config));
        if self.jobs.contains_key(key) {
            events.record("request_coalesced", payload(json!({"key": key})));
            return DispatchStatus::Coalesced;
        }

        if generation.modification.is_none() {
            generation.modification = self.annotations.get(key).cloned();
        }
        self.jobs.insert(
            key.clone(),
            InFlightJob {
                content_key: key.clone(),
                started_at: Utc::now(),
            },
        );
        let request = GenerationRequest {
            id: key.clone(),
            payload: generation,
        };
        if let Err(err) = transport.emit(&request) {
            let error = format!("{err:#}");
            self.jobs.shift_remove(key);
            for_each_trigger(docs, key, |doc, trigger| {
                widget::mark_failed(doc, trigger, &error, config)
            });
            events.record(
                "generation_failed",
                payload(json!({"key": key, "stage": "emit", "error": error})),
            );
            return DispatchStatus::TransportFailed(error);
        }

        // The note was for this request only; later plain regenerations go without it.
        self.annotations.remove(key);
        for_each_trigger(docs, key, |doc, trigger| {
            doc.remove_attr(trigger, widget::NOTE_ATTR);
        });
        events.record(
            "request_emitted",
            payload(json!({
                "key": key,
                "prompt": request.payload.prompt,
                "modified": request.payload.modification.is_some(),
            })),
        );
        DispatchStatus::Emitted
    }

    pub fn handle_response(
        &mut self,
        docs: &mut DocumentStore,
        cache: &mut dyn ResultCache,
        config: &EngineConfig,
        events: &EventLog,
        response: GenerationResponse,
    ) -> ResponseOutcome {
        let key = response.id.clone();
        let Some(job) = self.jobs.shift_remove(&key) else {
            events.record("response_unmatched", payload(json!({"key": key})));
            return ResponseOutcome::Unmatched { key };
        };
        let elapsed_ms = (Utc::now() - job.started_at).num_milliseconds();

        let result = match (response.success, response.result_data) {
            (true, Some(url)) if !url.is_empty() => CachedResult {
                url,
                annotation: response.annotation,
                is_video: response.is_video,
            },
            (success, _) => {
                let error = response.error.unwrap_or_else(|| {
                    if success {
                        "generation returned no result".to_string()
                    } else {
                        "generation failed".to_string()
                    }
                });
                for_each_trigger(docs, &key, |doc, trigger| {
                    widget::mark_failed(doc, trigger, &error, config)
                });
                events.record(
                    "generation_failed",
                    payload(json!({"key": key, "stage": "response", "error": error, "elapsed_ms": elapsed_ms})),
                );
                return ResponseOutcome::Failed { key, error };
            }
        };

        if let Err(err) = cache.store(&key, result.clone()) {
            events.record(
                "cache_error",
                payload(json!({"key": key, "error": format!("{err:#}")})),
            );
        }
        let mut slots = 0;
        for_each_trigger(docs, &key, |doc, trigger| {
            if let Some(slot) = widget::slot_for(doc, trigger) {
                if widget::fill_slot(doc, slot, &result).is_ok() {
                    slots += 1;
                }
            }
            widget::mark_done(doc, trigger, config);
        });
        events.record(
            "response_correlated",
            payload(json!({"key": key, "slots": slots, "elapsed_ms": elapsed_ms})),
        );
        ResponseOutcome::Filled { key, slots }
    }
}

/// Visits every trigger for `key` in the primary document and every frame.
fn for_each_trigger(
    docs: &mut DocumentStore,
    key: &ContentKey,
    mut visit: impl FnMut(&mut crate::dom::Document, crate::dom::Id),
) {
    for (_, doc) in docs.iter_mut() {
        let root = doc.root();
        for trigger in widget::triggers_for(doc, root, key) {
            visit(doc, trigger);
        }
    }
}

#[cfg(test)]
mod tests {
    use promptslot_contracts::MemoryResultCache;

    use super::*;
    use crate::dom::Document;
    use crate::transport::QueuedTransport;
    use crate::widget::TriggerState;

    fn store_with_widgets(key: &ContentKey) -> DocumentStore {
        let mut primary = Document::new();
        let pair = widget::build(&mut primary, key, "cat", "Generate");
        let root = primary.root();
        let _ = widget::place(&mut primary, pair, root, None);
        let mut store = DocumentStore::new(primary);

        let mut frame = Document::new();
        let pair = widget::build(&mut frame, key, "cat", "Generate");
        let root = frame.root();
        let _ = widget::place(&mut frame, pair, root, None);
        store.attach_frame(frame);
        store
    }

    #[test]
    fn second_request_for_same_key_is_coalesced() {
        let key = ContentKey::derive("cat");
        let mut docs = store_with_widgets(&key);
        let mut transport = QueuedTransport::new();
        let config = EngineConfig::default();
        let events = EventLog::in_memory();
        let mut coordinator = DispatchCoordinator::new();

        let first = coordinator.request(
            &mut docs,
            &mut transport,
            &config,
            &events,
            &key,
            GenerationPayload::prompt("cat"),
        );
        let second = coordinator.request(
            &mut docs,
            &mut transport,
            &config,
            &events,
            &key,
            GenerationPayload::prompt("cat"),
        );
        assert_eq!(first, DispatchStatus::Emitted);
        assert_eq!(second, DispatchStatus::Coalesced);
        assert_eq!(transport.emitted(), 1);
        assert_eq!(coordinator.state(&key), JobState::Requested);
        let keys: Vec<&ContentKey> = coordinator.jobs().map(|job| &job.content_key).collect();
        assert_eq!(keys, vec![&key]);
    }

    #[test]
    fn success_fills_every_document() {
        let key = ContentKey::derive("cat");
        let mut docs = store_with_widgets(&key);
        let mut transport = QueuedTransport::new();
        let mut cache = MemoryResultCache::new();
        let config = EngineConfig::default();
        let events = EventLog::in_memory();
        let mut coordinator = DispatchCoordinator::new();

        coordinator.request(
            &mut docs,
            &mut transport,
            &config,
            &events,
            &key,
            GenerationPayload::prompt("cat"),
        );
        let outcome = coordinator.handle_response(
            &mut docs,
            &mut cache,
            &config,
            &events,
            GenerationResponse::succeeded(key.clone(), "cat.png"),
        );
        assert_eq!(
            outcome,
            ResponseOutcome::Filled {
                key: key.clone(),
                slots: 2
            }
        );
        assert_eq!(coordinator.state(&key), JobState::Idle);
        assert_eq!(cache.len(), 1);
        for handle in docs.handles() {
            let Some(doc) = docs.get(handle) else {
                continue;
            };
            let trigger = widget::triggers_for(doc, doc.root(), &key)[0];
            assert_eq!(widget::trigger_state(doc, trigger), Some(TriggerState::Done));
        }

        let late = coordinator.handle_response(
            &mut docs,
            &mut cache,
            &config,
            &events,
            GenerationResponse::succeeded(key.clone(), "dup.png"),
        );
        assert_eq!(late, ResponseOutcome::Unmatched { key });
    }

    #[test]
    fn failure_resets_triggers_without_retry() {
        let key = ContentKey::derive("cat");
        let mut docs = store_with_widgets(&key);
        let mut transport = QueuedTransport::new();
        let mut cache = MemoryResultCache::new();
        let config = EngineConfig::default();
        let events = EventLog::in_memory();
        let mut coordinator = DispatchCoordinator::new();

        coordinator.request(
            &mut docs,
            &mut transport,
            &config,
            &events,
            &key,
            GenerationPayload::prompt("cat"),
        );
        let outcome = coordinator.handle_response(
            &mut docs,
            &mut cache,
            &config,
            &events,
            GenerationResponse::failed(key.clone(), "quota exceeded"),
        );
        assert_eq!(
            outcome,
            ResponseOutcome::Failed {
                key: key.clone(),
                error: "quota exceeded".to_string()
            }
        );
        assert_eq!(transport.emitted(), 1);
        assert!(cache.is_empty());
        let doc = docs.primary();
        let trigger = widget::triggers_for(doc, doc.root(), &key)[0];
        assert_eq!(widget::trigger_state(doc, trigger), Some(TriggerState::Failed));
        assert_eq!(doc.attr(trigger, widget::ERROR_ATTR), Some("quota exceeded"));
    }

    #[test]
    fn annotation_rides_one_request_only() {
        let key = ContentKey::derive("cat");
        let mut docs = store_with_widgets(&key);
        let mut transport = QueuedTransport::new();
        let mut cache = MemoryResultCache::new();
        let config = EngineConfig::default();
        let events = EventLog::in_memory();
        let mut coordinator = DispatchCoordinator::new();

        coordinator.annotate(
            &mut docs,
            &key,
            Modification {
                note: "at night".to_string(),
                reference: Some("ref.png".to_string()),
            },
        );
        coordinator.request(
            &mut docs,
            &mut transport,
            &config,
            &events,
            &key,
            GenerationPayload::prompt("cat"),
        );
        coordinator.handle_response(
            &mut docs,
            &mut cache,
            &config,
            &events,
            GenerationResponse::succeeded(key.clone(), "night.png"),
        );
        coordinator.request(
            &mut docs,
            &mut transport,
            &config,
            &events,
            &key,
            GenerationPayload::prompt("cat"),
        );

        let sent = transport.drain();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[0].payload.modification.as_ref().map(|m| m.note.as_str()),
            Some("at night")
        );
        assert_eq!(sent[1].payload.modification, None);
        let doc = docs.primary();
        let trigger = widget::triggers_for(doc, doc.root(), &key)[0];
        assert_eq!(doc.attr(trigger, widget::NOTE_ATTR), None);
    }
}
