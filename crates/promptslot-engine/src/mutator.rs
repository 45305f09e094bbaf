//! Applies directives to one scanned root, exactly once per content key.
//!
//! Claim markers live in a side table keyed by (document, root) instead of in
//! markup. A claim is taken before the cache lookup for its widget, so a second
//! scan of the same root sees it immediately. When a claim and the live markup
//! disagree, the markup wins and the claim is healed.

use std::collections::{HashMap, HashSet};

use promptslot_contracts::events::payload;
use promptslot_contracts::{
    fingerprint_text, ContentKey, EngineConfig, EventLog, ResultCache, SavedTagRecord,
    SavedTagRegistry,
};
use serde_json::json;

use crate::documents::DocHandle;
use crate::dom::{Document, Id};
use crate::matcher::{find_saved_matches, Delimiters, PatternMatch, SavedMatch, ScanConfigError};
use crate::position_index::PositionIndex;
use crate::range::{insertion_point, replace_range, RangeError};
use crate::widget::{self, WidgetPair};

#[derive(Debug, Clone, Default)]
struct RootMarkers {
    claimed: HashSet<ContentKey>,
    /// Fingerprint of the logical text the last completed scan left behind.
    processed: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MarkerTable {
    roots: HashMap<(DocHandle, Id), RootMarkers>,
}

impl MarkerTable {
    pub fn is_claimed(&self, handle: DocHandle, root: Id, key: &ContentKey) -> bool {
        self.roots
            .get(&(handle, root))
            .is_some_and(|markers| markers.claimed.contains(key))
    }

    pub fn is_processed(&self, handle: DocHandle, root: Id) -> bool {
        self.roots
            .get(&(handle, root))
            .is_some_and(|markers| markers.processed.is_some())
    }

    /// Drops everything recorded for a document, e.g. when its frame goes away.
    pub fn forget_document(&mut self, handle: DocHandle) {
        self.roots.retain(|(owner, _), _| *owner != handle);
    }

    fn root(&mut self, handle: DocHandle, root: Id) -> &mut RootMarkers {
        self.roots.entry((handle, root)).or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Completed,
    /// Root already processed and unchanged since.
    Unchanged,
    Aborted(ScanConfigError),
    MissingRoot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedWidget {
    pub pair: WidgetPair,
    pub key: ContentKey,
    pub content: String,
}

/// A freshly placed widget with no cached result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub handle: DocHandle,
    pub trigger: Id,
    pub key: ContentKey,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub outcome: ScanOutcome,
    pub placed: Vec<PlacedWidget>,
    pub already_present: usize,
    pub skipped: usize,
    pub filled_from_cache: usize,
    pub candidates: Vec<Candidate>,
}

impl ScanReport {
    pub(crate) fn new(outcome: ScanOutcome) -> Self {
        Self {
            outcome,
            placed: Vec::new(),
            already_present: 0,
            skipped: 0,
            filled_from_cache: 0,
            candidates: Vec::new(),
        }
    }
}

enum Claim {
    Place,
    Present,
}

pub struct Mutator<'a> {
    pub doc: &'a mut Document,
    pub handle: DocHandle,
    pub root: Id,
    pub config: &'a EngineConfig,
    pub markers: &'a mut MarkerTable,
    pub registry: &'a mut SavedTagRegistry,
    pub cache: &'a mut dyn ResultCache,
    pub events: &'a EventLog,
}

impl Mutator<'_> {
    pub fn run(self, collect_candidates: bool) -> ScanReport {
        let Mutator {
            doc,
            handle,
            root,
            config,
            markers,
            registry,
            cache,
            events,
        } = self;

        if !doc.contains(root) {
            return ScanReport::new(ScanOutcome::MissingRoot);
        }
        let delimiters = match Delimiters::new(&config.start_delimiter, &config.end_delimiter) {
            Ok(delimiters) => delimiters,
            Err(err) => {
                events.record(
                    "scan_aborted",
                    payload(json!({"doc": handle.0, "root": root.0, "error": err.to_string()})),
                );
                return ScanReport::new(ScanOutcome::Aborted(err));
            }
        };

        let mut report = ScanReport::new(ScanOutcome::Completed);
        let mut index = PositionIndex::build(doc, root);
        let live = widget::triggers(doc, root).len();
        let view: &Document = doc;
        let entry = markers.root(handle, root);
        if let Some(processed) = entry.processed.clone() {
            // Widgets are opaque to the logical text, so a removed one only shows up
            // as a claim without a live trigger.
            let intact = entry
                .claimed
                .iter()
                .all(|key| widget::has_trigger_for(view, root, key));
            if live == 0 || !intact {
                entry.processed = None;
                events.record(
                    "marker_healed",
                    payload(json!({"doc": handle.0, "root": root.0, "marker": "processed"})),
                );
            } else if processed == fingerprint_text(index.text(), 0) {
                events.record(
                    "scan_skipped",
                    payload(json!({"doc": handle.0, "root": root.0, "widgets": live})),
                );
                report.outcome = ScanOutcome::Unchanged;
                report.already_present = live;
                return report;
            }
        }
        events.record(
            "scan_started",
            payload(json!({"doc": handle.0, "root": root.0, "length": index.len()})),
        );

        let mut context = Context {
            doc,
            handle,
            root,
            config,
            markers,
            events,
        };

        // Deletions first, highest offset first, so pending offsets stay valid.
        let patterns = delimiters.find_all(index.text());
        let mut first_seen: HashMap<ContentKey, usize> = HashMap::new();
        for (position, found) in patterns.iter().enumerate() {
            first_seen
                .entry(ContentKey::derive(&found.inner_content))
                .or_insert(position);
        }
        let mut recorded: Vec<(PlacedWidget, String)> = Vec::new();
        for (position, found) in patterns.iter().enumerate().rev() {
            let key = ContentKey::derive(&found.inner_content);
            let owner = first_seen.get(&key) == Some(&position);
            match context.apply_pattern(&index, found, &key, owner) {
                Ok(Some(placed)) => recorded.push((placed, found.full_match_text.clone())),
                Ok(None) => report.already_present += usize::from(owner),
                Err(err) => {
                    report.skipped += 1;
                    context.skip(&key, "pattern", found.start_index, &err);
                }
            }
        }
        if !patterns.is_empty() {
            index = PositionIndex::build(context.doc, root);
        }

        // Saved tags resolve against the post-deletion text.
        let saved = {
            let doc: &Document = context.doc;
            let mut found = find_saved_matches(
                index.text(),
                registry,
                config.fingerprint_width,
                |key| widget::has_trigger_for(doc, root, key),
            );
            found.sort_by(|a, b| b.insert_position.cmp(&a.insert_position));
            found
        };
        let mut restored: Vec<PlacedWidget> = Vec::new();
        for found in &saved {
            let key = ContentKey::derive(&found.content);
            match context.apply_saved(&index, found, &key) {
                Ok(Some(placed)) => restored.push(placed),
                Ok(None) => report.already_present += 1,
                Err(err) => {
                    report.skipped += 1;
                    context.skip(&key, "saved", found.insert_position, &err);
                }
            }
        }

        let final_text = PositionIndex::build(context.doc, root).text().to_string();
        if config.record_saved_tags && !recorded.is_empty() {
            let fingerprint = fingerprint_text(&final_text, config.fingerprint_width);
            for (placed, raw) in &recorded {
                let Some(offset) = PositionIndex::offset_of(context.doc, root, placed.pair.trigger)
                else {
                    continue;
                };
                registry.insert(SavedTagRecord::new(
                    fingerprint.clone(),
                    placed.content.clone(),
                    raw.clone(),
                    offset,
                ));
            }
        }
        let settled: &Document = context.doc;
        let entry = context.markers.root(handle, root);
        entry
            .claimed
            .retain(|key| widget::has_trigger_for(settled, root, key));
        entry.processed = Some(fingerprint_text(&final_text, 0));

        report.placed = recorded
            .into_iter()
            .rev()
            .map(|(placed, _)| placed)
            .chain(restored)
            .collect();

        // Lookups run only after every claim above is in place.
        for placed in &report.placed {
            if !context.doc.contains(placed.pair.trigger) {
                continue;
            }
            match cache.lookup(&placed.key, None) {
                Ok(Some(result)) => {
                    match widget::fill_slot(context.doc, placed.pair.slot, &result) {
                        Ok(()) => {
                            widget::mark_done(context.doc, placed.pair.trigger, config);
                            report.filled_from_cache += 1;
                            events.record("cache_hit", payload(json!({"key": placed.key})));
                        }
                        Err(err) => events.record(
                            "directive_skipped",
                            payload(json!({"key": placed.key, "phase": "fill", "error": err.to_string()})),
                        ),
                    }
                }
                Ok(None) => {
                    if collect_candidates {
                        report.candidates.push(Candidate {
                            handle,
                            trigger: placed.pair.trigger,
                            key: placed.key.clone(),
                            content: placed.content.clone(),
                        });
                    }
                }
                Err(err) => {
                    events.record(
                        "cache_error",
                        payload(json!({"key": placed.key, "error": format!("{err:#}")})),
                    );
                    if collect_candidates {
                        report.candidates.push(Candidate {
                            handle,
                            trigger: placed.pair.trigger,
                            key: placed.key.clone(),
                            content: placed.content.clone(),
                        });
                    }
                }
            }
        }
        report
    }
}

struct Context<'a> {
    doc: &'a mut Document,
    handle: DocHandle,
    root: Id,
    config: &'a EngineConfig,
    markers: &'a mut MarkerTable,
    events: &'a EventLog,
}

impl Context<'_> {
    /// Takes the claim for `key` under this root, healing a claim whose widget is gone.
    fn claim(&mut self, key: &ContentKey) -> Claim {
        let present = widget::has_trigger_for(self.doc, self.root, key);
        let markers = self.markers.root(self.handle, self.root);
        let was_claimed = !markers.claimed.insert(key.clone());
        if present {
            self.events
                .record("widget_exists", payload(json!({"doc": self.handle.0, "key": key})));
            return Claim::Present;
        }
        if was_claimed {
            self.events.record(
                "marker_healed",
                payload(json!({"doc": self.handle.0, "root": self.root.0, "key": key})),
            );
        }
        Claim::Place
    }

    fn release(&mut self, key: &ContentKey) {
        self.markers.root(self.handle, self.root).claimed.remove(key);
    }

    /// Replaces one delimiter match. Only the first occurrence of a key (`owner`)
    /// gets a widget; later duplicates just lose their text.
    fn apply_pattern(
        &mut self,
        index: &PositionIndex,
        found: &PatternMatch,
        key: &ContentKey,
        owner: bool,
    ) -> Result<Option<PlacedWidget>, RangeError> {
        let place = owner && matches!(self.claim(key), Claim::Place);
        if !place {
            replace_range(self.doc, index, self.root, found.start_index, found.end_index, &[])?;
            return Ok(None);
        }
        let pair = widget::build(self.doc, key, &found.inner_content, &self.config.trigger_label);
        let placed = replace_range(
            self.doc,
            index,
            self.root,
            found.start_index,
            found.end_index,
            &[pair.trigger, pair.slot],
        );
        self.settle(placed, pair, key, &found.inner_content, found.start_index)
    }

    fn apply_saved(
        &mut self,
        index: &PositionIndex,
        found: &SavedMatch,
        key: &ContentKey,
    ) -> Result<Option<PlacedWidget>, RangeError> {
        if matches!(self.claim(key), Claim::Present) {
            return Ok(None);
        }
        let pair = widget::build(self.doc, key, &found.content, &self.config.trigger_label);
        let placed = insertion_point(self.doc, index, self.root, found.insert_position)
            .and_then(|at| {
                widget::place(self.doc, pair, at.parent, at.before).map_err(RangeError::from)
            });
        self.settle(placed, pair, key, &found.content, found.insert_position)
    }

    fn settle(
        &mut self,
        placed: Result<(), RangeError>,
        pair: WidgetPair,
        key: &ContentKey,
        content: &str,
        offset: usize,
    ) -> Result<Option<PlacedWidget>, RangeError> {
        if let Err(err) = placed {
            // Nothing was inserted; drop the half-built widget and the claim with it.
            let _ = self.doc.remove(pair.trigger);
            let _ = self.doc.remove(pair.slot);
            self.release(key);
            return Err(err);
        }
        self.events.record(
            "widget_inserted",
            payload(json!({"doc": self.handle.0, "root": self.root.0, "key": key, "offset": offset})),
        );
        Ok(Some(PlacedWidget {
            pair,
            key: key.clone(),
            content: content.to_string(),
        }))
    }

    fn skip(&self, key: &ContentKey, kind: &str, offset: usize, err: &RangeError) {
        self.events.record(
            "directive_skipped",
            payload(json!({
                "doc": self.handle.0,
                "root": self.root.0,
                "key": key,
                "kind": kind,
                "offset": offset,
                "error": err.to_string(),
            })),
        );
    }
}

#[cfg(test)]
mod tests {
    use promptslot_contracts::MemoryResultCache;

    use super::*;

    struct Harness {
        doc: Document,
        message: Id,
        config: EngineConfig,
        markers: MarkerTable,
        registry: SavedTagRegistry,
        cache: MemoryResultCache,
        events: EventLog,
    }

    impl Harness {
        fn new(text: &str) -> Self {
            let (doc, message) = Document::from_message_text(text);
            Self {
                doc,
                message,
                config: EngineConfig::default(),
                markers: MarkerTable::default(),
                registry: SavedTagRegistry::new(),
                cache: MemoryResultCache::new(),
                events: EventLog::in_memory(),
            }
        }

        fn scan(&mut self) -> ScanReport {
            Mutator {
                doc: &mut self.doc,
                handle: DocHandle::PRIMARY,
                root: self.message,
                config: &self.config,
                markers: &mut self.markers,
                registry: &mut self.registry,
                cache: &mut self.cache,
                events: &self.events,
            }
            .run(true)
        }
    }

    #[test]
    fn completed_scan_leaves_claims_and_processed_marker() {
        let mut harness = Harness::new("a <<cat>> b");
        let cat = ContentKey::derive("cat");
        assert!(!harness.markers.is_processed(DocHandle::PRIMARY, harness.message));

        let report = harness.scan();
        assert_eq!(report.outcome, ScanOutcome::Completed);
        assert_eq!(report.candidates.len(), 1);
        assert!(harness.markers.is_claimed(DocHandle::PRIMARY, harness.message, &cat));
        assert!(harness.markers.is_processed(DocHandle::PRIMARY, harness.message));

        harness.markers.forget_document(DocHandle::PRIMARY);
        assert!(!harness.markers.is_claimed(DocHandle::PRIMARY, harness.message, &cat));
        assert!(!harness.markers.is_processed(DocHandle::PRIMARY, harness.message));
    }

    #[test]
    fn partially_removed_widgets_defeat_the_unchanged_shortcut() -> anyhow::Result<()> {
        let mut harness = Harness::new("a <<cat>> b <<dog>> c");
        let first = harness.scan();
        let dog = ContentKey::derive("dog");
        let pair = first
            .placed
            .iter()
            .find(|placed| placed.key == dog)
            .map(|placed| placed.pair)
            .ok_or_else(|| anyhow::anyhow!("dog widget missing"))?;
        harness.doc.remove(pair.trigger)?;
        harness.doc.remove(pair.slot)?;

        let second = harness.scan();
        assert_eq!(second.outcome, ScanOutcome::Completed);
        assert_eq!(second.placed.len(), 1);
        assert_eq!(second.placed[0].key, dog);
        assert_eq!(widget::triggers_for(&harness.doc, harness.message, &dog).len(), 1);
        assert_eq!(widget::triggers(&harness.doc, harness.message).len(), 2);
        Ok(())
    }

    #[test]
    fn claims_without_a_widget_are_dropped_after_the_scan() -> anyhow::Result<()> {
        let mut harness = Harness::new("a <<cat>> b");
        harness.config.record_saved_tags = false;
        let cat = ContentKey::derive("cat");
        let pair = harness.scan().placed[0].pair;
        harness.doc.remove(pair.trigger)?;
        harness.doc.remove(pair.slot)?;

        // Nothing left to restore it from: the claim goes and the next scan is a no-op.
        let report = harness.scan();
        assert!(report.placed.is_empty());
        assert!(!harness.markers.is_claimed(DocHandle::PRIMARY, harness.message, &cat));
        assert!(harness.markers.is_processed(DocHandle::PRIMARY, harness.message));
        Ok(())
    }
}
