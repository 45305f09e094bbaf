pub mod batch;
pub mod dispatch;
pub mod documents;
pub mod dom;
pub mod matcher;
pub mod mutator;
pub mod position_index;
pub mod range;
pub mod transport;
pub mod widget;

use std::time::Duration;

use promptslot_contracts::events::payload;
use promptslot_contracts::{
    ContentKey, EngineConfig, EventLog, GenerationPayload, GenerationResponse, Modification,
    ResultCache, SavedTagRegistry,
};
use serde_json::json;

use crate::batch::{AutoModeWindow, BatchSequencer, Clock, HostSignal, SystemClock};
use crate::dispatch::{DispatchCoordinator, DispatchStatus, ResponseOutcome};
use crate::documents::{DocHandle, DocumentStore};
use crate::dom::{Document, Id};
use crate::mutator::{Candidate, MarkerTable, Mutator, ScanOutcome, ScanReport};
use crate::transport::GenerationTransport;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanOptions {
    /// Hand cache misses to the batch sequencer (only honoured while autonomous mode
    /// is armed).
    pub auto_trigger: bool,
}

/// Scans documents for placeholders, swaps them for widgets, and runs generation
/// requests for them through `T`, with results remembered in `C`.
pub struct PlaceholderEngine<C: ResultCache, T: GenerationTransport> {
    config: EngineConfig,
    documents: DocumentStore,
    markers: MarkerTable,
    saved_tags: SavedTagRegistry,
    cache: C,
    transport: T,
    coordinator: DispatchCoordinator,
    sequencer: BatchSequencer,
    auto_mode: AutoModeWindow,
    clock: Box<dyn Clock>,
    events: EventLog,
}

impl<C: ResultCache, T: GenerationTransport> PlaceholderEngine<C, T> {
    pub fn new(config: EngineConfig, primary: Document, cache: C, transport: T) -> Self {
        Self {
            config,
            documents: DocumentStore::new(primary),
            markers: MarkerTable::default(),
            saved_tags: SavedTagRegistry::new(),
            cache,
            transport,
            coordinator: DispatchCoordinator::new(),
            sequencer: BatchSequencer::new(),
            auto_mode: AutoModeWindow::default(),
            clock: Box::new(SystemClock),
            events: EventLog::discard(),
        }
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_saved_tags(mut self, saved_tags: SavedTagRegistry) -> Self {
        self.saved_tags = saved_tags;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn documents(&self) -> &DocumentStore {
        &self.documents
    }

    pub fn documents_mut(&mut self) -> &mut DocumentStore {
        &mut self.documents
    }

    pub fn document(&self, handle: DocHandle) -> Option<&Document> {
        self.documents.get(handle)
    }

    pub fn document_mut(&mut self, handle: DocHandle) -> Option<&mut Document> {
        self.documents.get_mut(handle)
    }

    pub fn attach_frame(&mut self, frame: Document) -> DocHandle {
        self.documents.attach_frame(frame)
    }

    pub fn detach_frame(&mut self, handle: DocHandle) -> Option<Document> {
        let frame = self.documents.detach_frame(handle)?;
        self.markers.forget_document(handle);
        Some(frame)
    }

    pub fn saved_tags(&self) -> &SavedTagRegistry {
        &self.saved_tags
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut C {
        &mut self.cache
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn in_flight(&self, key: &ContentKey) -> bool {
        self.coordinator.in_flight(key)
    }

    pub fn batch(&self) -> &BatchSequencer {
        &self.sequencer
    }

    pub fn auto_mode_active(&self) -> bool {
        self.auto_mode.is_active(self.clock.now())
    }

    pub fn host_signal(&mut self, signal: HostSignal) {
        let armed = self.auto_mode.on_signal(
            signal,
            self.clock.now(),
            Duration::from_millis(self.config.auto_mode_window_ms),
        );
        self.events.record(
            "auto_mode_armed",
            payload(json!({"signal": format!("{signal:?}"), "armed": armed})),
        );
    }

    /// Replaces placeholders under `root` with widgets. Safe to call repeatedly; never
    /// fails, problems end up in the report and the event log.
    pub fn scan(&mut self, handle: DocHandle, root: Id, options: ScanOptions) -> ScanReport {
        let Some(doc) = self.documents.get_mut(handle) else {
            return ScanReport::new(ScanOutcome::MissingRoot);
        };
        let mut report = Mutator {
            doc,
            handle,
            root,
            config: &self.config,
            markers: &mut self.markers,
            registry: &mut self.saved_tags,
            cache: &mut self.cache,
            events: &self.events,
        }
        .run(options.auto_trigger);

        // Widgets for keys with a job already running join it in the busy state.
        if let Some(doc) = self.documents.get_mut(handle) {
            for placed in &report.placed {
                if self.coordinator.in_flight(&placed.key) {
                    widget::mark_busy(doc, placed.pair.trigger, &self.config);
                }
            }
        }
        let coordinator = &self.coordinator;
        report
            .candidates
            .retain(|candidate| !coordinator.in_flight(&candidate.key));

        if options.auto_trigger && !report.candidates.is_empty() {
            if self.auto_mode_active() {
                let ordered = self.document_order(report.candidates.clone());
                let added = self.sequencer.enqueue(ordered);
                self.events.record(
                    "batch_enqueued",
                    payload(json!({"doc": handle.0, "added": added, "queued": self.sequencer.queued()})),
                );
                self.pump();
            } else {
                self.events.record(
                    "batch_enqueued",
                    payload(json!({"doc": handle.0, "added": 0, "reason": "auto mode inactive"})),
                );
            }
        }
        report
    }

    /// Manual trigger or regeneration for `key`.
    pub fn dispatch(&mut self, key: &ContentKey, generation: GenerationPayload) -> DispatchStatus {
        self.coordinator.request(
            &mut self.documents,
            &mut self.transport,
            &self.config,
            &self.events,
            key,
            generation,
        )
    }

    /// Dispatches whatever the given trigger control stands for.
    pub fn dispatch_trigger(&mut self, handle: DocHandle, trigger: Id) -> Option<DispatchStatus> {
        let doc = self.documents.get(handle)?;
        if !widget::is_trigger(doc, trigger) {
            return None;
        }
        let key = widget::trigger_key(doc, trigger)?;
        let prompt = doc.attr(trigger, widget::CONTENT_ATTR).unwrap_or_default();
        let generation = GenerationPayload::prompt(prompt);
        Some(self.dispatch(&key, generation))
    }

    /// One-time modification for the next request of `key`.
    pub fn annotate(&mut self, key: &ContentKey, modification: Modification) {
        self.coordinator
            .annotate(&mut self.documents, key, modification);
    }

    pub fn handle_response(&mut self, response: GenerationResponse) -> ResponseOutcome {
        let outcome = self.coordinator.handle_response(
            &mut self.documents,
            &mut self.cache,
            &self.config,
            &self.events,
            response,
        );
        let key = match &outcome {
            ResponseOutcome::Filled { key, .. } | ResponseOutcome::Failed { key, .. } => key,
            ResponseOutcome::Unmatched { .. } => return outcome,
        };
        let interval = Duration::from_millis(self.config.batch_interval_ms);
        if self
            .sequencer
            .on_correlated(key, self.clock.now(), interval)
        {
            self.pump();
        }
        outcome
    }

    /// Fires the next batch candidate if one is due. Hosts with a non-zero batch
    /// interval call this periodically.
    pub fn tick(&mut self) {
        self.pump();
    }

    fn pump(&mut self) {
        while let Some(candidate) = self.sequencer.next_due(self.clock.now()) {
            if !self.still_waiting(&candidate) {
                continue;
            }
            let status = self.dispatch(&candidate.key, GenerationPayload::prompt(&candidate.content));
            self.events.record(
                "batch_fired",
                payload(json!({"key": candidate.key, "status": format!("{status:?}"), "remaining": self.sequencer.queued()})),
            );
            match status {
                DispatchStatus::Emitted | DispatchStatus::Coalesced => {
                    self.sequencer.mark_outstanding(candidate.key);
                    return;
                }
                DispatchStatus::TransportFailed(_) => continue,
            }
        }
    }

    /// A queued candidate is stale once its trigger is gone or its slot got filled.
    fn still_waiting(&self, candidate: &Candidate) -> bool {
        let Some(doc) = self.documents.get(candidate.handle) else {
            return false;
        };
        if !doc.contains(candidate.trigger) || !widget::is_trigger(doc, candidate.trigger) {
            return false;
        }
        !widget::slot_for(doc, candidate.trigger).is_some_and(|slot| widget::slot_is_filled(doc, slot))
    }

    fn document_order(&self, mut candidates: Vec<Candidate>) -> Vec<Candidate> {
        let handles = self.documents.handles();
        candidates.sort_by_key(|candidate| {
            let doc_rank = handles.iter().position(|handle| *handle == candidate.handle);
            let node_rank = self
                .documents
                .get(candidate.handle)
                .and_then(|doc| doc.document_position(candidate.trigger));
            (doc_rank, node_rank)
        });
        candidates
    }
}
