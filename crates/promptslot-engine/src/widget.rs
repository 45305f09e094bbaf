//! Trigger/slot widget markup and the queries the engine runs against it.

use promptslot_contracts::{CachedResult, ContentKey, EngineConfig};

use crate::dom::{Document, DomError, Id};

pub const ROLE_ATTR: &str = "data-ps-role";
pub const KEY_ATTR: &str = "data-ps-key";
pub const CONTENT_ATTR: &str = "data-ps-content";
pub const STATE_ATTR: &str = "data-ps-state";
pub const ERROR_ATTR: &str = "data-ps-error";
pub const NOTE_ATTR: &str = "data-ps-note";
pub const HIDDEN_ATTR: &str = "hidden";

const TRIGGER_ROLE: &str = "trigger";
const SLOT_ROLE: &str = "slot";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    Idle,
    Busy,
    Done,
    Failed,
}

impl TriggerState {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerState::Idle => "idle",
            TriggerState::Busy => "busy",
            TriggerState::Done => "done",
            TriggerState::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "idle" => Some(TriggerState::Idle),
            "busy" => Some(TriggerState::Busy),
            "done" => Some(TriggerState::Done),
            "failed" => Some(TriggerState::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WidgetPair {
    pub trigger: Id,
    pub slot: Id,
}

/// Creates a detached `<button>` + `<span>` pair tagged with `key`.
pub fn build(doc: &mut Document, key: &ContentKey, content: &str, label: &str) -> WidgetPair {
    let trigger = doc.create_element("button");
    doc.set_attr(trigger, ROLE_ATTR, TRIGGER_ROLE);
    doc.set_attr(trigger, KEY_ATTR, key.as_str());
    doc.set_attr(trigger, CONTENT_ATTR, content);
    doc.set_attr(trigger, STATE_ATTR, TriggerState::Idle.as_str());
    let caption = doc.create_text(label);
    // Fresh nodes: neither side is attached yet, so this cannot fail.
    let _ = doc.append_child(trigger, caption);

    let slot = doc.create_element("span");
    doc.set_attr(slot, ROLE_ATTR, SLOT_ROLE);
    doc.set_attr(slot, KEY_ATTR, key.as_str());
    WidgetPair { trigger, slot }
}

pub fn place(
    doc: &mut Document,
    pair: WidgetPair,
    parent: Id,
    reference: Option<Id>,
) -> Result<(), DomError> {
    doc.insert_before(parent, pair.trigger, reference)?;
    doc.insert_before(parent, pair.slot, reference)
}

/// Script/style content and materialized widgets are never indexed as source text.
pub fn is_opaque(doc: &Document, id: Id) -> bool {
    doc.is_element(id, "script")
        || doc.is_element(id, "style")
        || doc.attr(id, ROLE_ATTR).is_some()
}

pub fn is_trigger(doc: &Document, id: Id) -> bool {
    doc.attr(id, ROLE_ATTR) == Some(TRIGGER_ROLE)
}

pub fn triggers(doc: &Document, scope: Id) -> Vec<Id> {
    doc.find_descendants_by_attr(scope, ROLE_ATTR, TRIGGER_ROLE)
}

pub fn triggers_for(doc: &Document, scope: Id, key: &ContentKey) -> Vec<Id> {
    doc.find_descendants_by_attr(scope, KEY_ATTR, key.as_str())
        .into_iter()
        .filter(|node| is_trigger(doc, *node))
        .collect()
}

pub fn has_trigger_for(doc: &Document, scope: Id, key: &ContentKey) -> bool {
    !triggers_for(doc, scope, key).is_empty()
}

pub fn trigger_key(doc: &Document, trigger: Id) -> Option<ContentKey> {
    doc.attr(trigger, KEY_ATTR).and_then(ContentKey::parse)
}

pub fn trigger_state(doc: &Document, trigger: Id) -> Option<TriggerState> {
    doc.attr(trigger, STATE_ATTR).and_then(TriggerState::parse)
}

/// The slot paired with `trigger`: its next element sibling, if that is a slot for the
/// same key.
pub fn slot_for(doc: &Document, trigger: Id) -> Option<Id> {
    let slot = doc.next_element_sibling(trigger)?;
    let same_key = doc.attr(slot, KEY_ATTR) == doc.attr(trigger, KEY_ATTR);
    (doc.attr(slot, ROLE_ATTR) == Some(SLOT_ROLE) && same_key).then_some(slot)
}

pub fn slot_is_filled(doc: &Document, slot: Id) -> bool {
    !doc.children(slot).is_empty()
}

pub fn mark_busy(doc: &mut Document, trigger: Id, config: &EngineConfig) {
    doc.set_attr(trigger, STATE_ATTR, TriggerState::Busy.as_str());
    doc.remove_attr(trigger, ERROR_ATTR);
    doc.remove_attr(trigger, HIDDEN_ATTR);
    set_label(doc, trigger, &config.busy_label);
}

pub fn mark_failed(doc: &mut Document, trigger: Id, error: &str, config: &EngineConfig) {
    doc.set_attr(trigger, STATE_ATTR, TriggerState::Failed.as_str());
    doc.set_attr(trigger, ERROR_ATTR, error);
    set_label(doc, trigger, &config.trigger_label);
}

/// Applies the display policy to a trigger whose slot now holds a result.
pub fn mark_done(doc: &mut Document, trigger: Id, config: &EngineConfig) {
    doc.set_attr(trigger, STATE_ATTR, TriggerState::Done.as_str());
    doc.remove_attr(trigger, ERROR_ATTR);
    set_label(doc, trigger, &config.trigger_label);
    if config.hide_trigger_on_success {
        doc.set_attr(trigger, HIDDEN_ATTR, "");
    } else {
        doc.remove_attr(trigger, HIDDEN_ATTR);
    }
}

/// Replaces whatever the slot shows with an `<img>` or `<video>` for `result`.
pub fn fill_slot(doc: &mut Document, slot: Id, result: &CachedResult) -> Result<(), DomError> {
    doc.remove_children(slot)?;
    let media = doc.create_element(if result.is_video { "video" } else { "img" });
    doc.set_attr(media, "src", &result.url);
    if let Some(annotation) = result.annotation.as_deref().filter(|value| !value.is_empty()) {
        doc.set_attr(media, "title", annotation);
    }
    doc.append_child(slot, media)
}

fn set_label(doc: &mut Document, trigger: Id, label: &str) {
    let _ = doc.remove_children(trigger);
    let caption = doc.create_text(label);
    let _ = doc.append_child(trigger, caption);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_pair_is_found_by_key_and_opaque() -> Result<(), DomError> {
        let mut doc = Document::new();
        let key = ContentKey::derive("cat");
        let pair = build(&mut doc, &key, "cat", "Generate");
        let root = doc.root();
        place(&mut doc, pair, root, None)?;

        assert_eq!(triggers_for(&doc, doc.root(), &key), vec![pair.trigger]);
        assert_eq!(slot_for(&doc, pair.trigger), Some(pair.slot));
        assert_eq!(trigger_key(&doc, pair.trigger), Some(key));
        assert_eq!(trigger_state(&doc, pair.trigger), Some(TriggerState::Idle));
        assert!(is_opaque(&doc, pair.trigger));
        assert!(is_opaque(&doc, pair.slot));
        assert!(!slot_is_filled(&doc, pair.slot));
        Ok(())
    }

    #[test]
    fn display_policy_hides_or_resets_trigger() -> Result<(), DomError> {
        let mut doc = Document::new();
        let key = ContentKey::derive("cat");
        let pair = build(&mut doc, &key, "cat", "Generate");
        let root = doc.root();
        place(&mut doc, pair, root, None)?;

        let mut config = EngineConfig::default();
        mark_busy(&mut doc, pair.trigger, &config);
        assert_eq!(doc.text_content(pair.trigger), "Generating...");

        mark_done(&mut doc, pair.trigger, &config);
        assert_eq!(doc.attr(pair.trigger, HIDDEN_ATTR), Some(""));

        config.hide_trigger_on_success = false;
        mark_done(&mut doc, pair.trigger, &config);
        assert_eq!(doc.attr(pair.trigger, HIDDEN_ATTR), None);
        assert_eq!(doc.text_content(pair.trigger), "Generate");
        Ok(())
    }

    #[test]
    fn fill_slot_replaces_previous_result() -> Result<(), DomError> {
        let mut doc = Document::new();
        let pair = build(&mut doc, &ContentKey::derive("cat"), "cat", "Generate");
        let root = doc.root();
        place(&mut doc, pair, root, None)?;
        let first = CachedResult {
            url: "a.png".to_string(),
            annotation: None,
            is_video: false,
        };
        let second = CachedResult {
            url: "b.mp4".to_string(),
            annotation: Some("second take".to_string()),
            is_video: true,
        };
        fill_slot(&mut doc, pair.slot, &first)?;
        fill_slot(&mut doc, pair.slot, &second)?;
        assert_eq!(
            doc.to_markup(pair.slot),
            format!(
                "<span data-ps-role=\"slot\" data-ps-key=\"{}\"><video src=\"b.mp4\" title=\"second take\"></video></span>",
                ContentKey::derive("cat")
            )
        );
        Ok(())
    }
}
