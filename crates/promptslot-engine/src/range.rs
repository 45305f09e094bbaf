//! Translating logical-text offsets into live edits.

use std::fmt;

use crate::dom::{Document, DomError, Id};
use crate::position_index::{PositionIndex, SpanKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    OutOfBounds { offset: usize, len: usize },
    EmptyRange { start: usize, end: usize },
    NotCharBoundary { offset: usize },
    /// The index no longer describes the document (a node vanished or changed kind).
    StaleNode(Id),
    NothingIndexed,
    Dom(DomError),
}

impl fmt::Display for RangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeError::OutOfBounds { offset, len } => {
                write!(f, "offset {offset} outside logical text of length {len}")
            }
            RangeError::EmptyRange { start, end } => write!(f, "empty range {start}..{end}"),
            RangeError::NotCharBoundary { offset } => {
                write!(f, "offset {offset} is not on a character boundary")
            }
            RangeError::StaleNode(id) => write!(f, "node {} changed since indexing", id.0),
            RangeError::NothingIndexed => f.write_str("subtree has no indexed content"),
            RangeError::Dom(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for RangeError {}

impl From<DomError> for RangeError {
    fn from(err: DomError) -> Self {
        RangeError::Dom(err)
    }
}

/// Where to insert: under `parent`, before `before` (or last when `None`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertionPoint {
    pub parent: Id,
    pub before: Option<Id>,
}

/// Resolves a zero-width position to an insertion point, splitting a text node when
/// the position falls inside one. An empty subtree accepts position 0 at its end.
pub fn insertion_point(
    doc: &mut Document,
    index: &PositionIndex,
    root: Id,
    position: usize,
) -> Result<InsertionPoint, RangeError> {
    if position > index.len() {
        return Err(RangeError::OutOfBounds {
            offset: position,
            len: index.len(),
        });
    }
    if !index.text().is_char_boundary(position) {
        return Err(RangeError::NotCharBoundary { offset: position });
    }
    let Some((_, span)) = index.find_span(position) else {
        if index.spans().is_empty() && doc.contains(root) {
            return Ok(InsertionPoint {
                parent: root,
                before: None,
            });
        }
        return Err(RangeError::NothingIndexed);
    };
    let span = *span;
    check_live(doc, span.node, span.kind)?;
    let parent = doc.parent(span.node).ok_or(RangeError::StaleNode(span.node))?;
    let local = position - span.start;
    let current_len = match span.kind {
        SpanKind::Text => doc.text(span.node).map_or(0, str::len),
        SpanKind::LineBreak => span.len(),
    };

    let before = if local == 0 {
        Some(span.node)
    } else if local >= current_len {
        doc.next_sibling(span.node)
    } else {
        Some(doc.split_text(span.node, local)?)
    };
    Ok(InsertionPoint { parent, before })
}

/// Deletes logical text `[start, end)` and puts `nodes` where it began.
///
/// Text nodes at either edge are split so only the covered part goes; line breaks
/// go whole. Elements emptied by the deletion are pruned up to (not including)
/// `root`. Everything is validated before the first edit.
pub fn replace_range(
    doc: &mut Document,
    index: &PositionIndex,
    root: Id,
    start: usize,
    end: usize,
    nodes: &[Id],
) -> Result<(), RangeError> {
    if start >= end {
        return Err(RangeError::EmptyRange { start, end });
    }
    if end > index.len() {
        return Err(RangeError::OutOfBounds {
            offset: end,
            len: index.len(),
        });
    }
    let text = index.text();
    if !text.is_char_boundary(start) {
        return Err(RangeError::NotCharBoundary { offset: start });
    }
    if !text.is_char_boundary(end) {
        return Err(RangeError::NotCharBoundary { offset: end });
    }

    let (first_idx, first) = index
        .span_at_or_after(start)
        .map(|(idx, span)| (idx, *span))
        .ok_or(RangeError::OutOfBounds {
            offset: start,
            len: index.len(),
        })?;
    let (last_idx, last) = index
        .find_span(end)
        .map(|(idx, span)| (idx, *span))
        .ok_or(RangeError::OutOfBounds {
            offset: end,
            len: index.len(),
        })?;
    for span in &index.spans()[first_idx..=last_idx] {
        check_live(doc, span.node, span.kind)?;
    }

    // Split the tail edge first; splitting the head afterwards cannot move it. The
    // node may already be shorter than its span if a later range split it.
    let tail_len = doc.text(last.node).map_or(0, str::len);
    if last.kind == SpanKind::Text && end - last.start < tail_len {
        doc.split_text(last.node, end - last.start)?;
    }
    let mut doomed: Vec<Id> = Vec::new();
    let head = if first.kind == SpanKind::Text && start > first.start {
        doc.split_text(first.node, start - first.start)?
    } else {
        first.node
    };
    doomed.push(head);
    for span in &index.spans()[first_idx + 1..=last_idx] {
        if !span.is_empty() {
            doomed.push(span.node);
        }
    }

    let parent = doc.parent(head).ok_or(RangeError::StaleNode(head))?;
    for node in nodes {
        doc.insert_before(parent, *node, Some(head))?;
    }

    let mut emptied: Vec<Id> = Vec::new();
    for node in doomed {
        if let Some(owner) = doc.parent(node) {
            emptied.push(owner);
        }
        doc.remove(node)?;
    }
    for mut owner in emptied {
        while owner != root
            && doc.contains(owner)
            && doc.children(owner).is_empty()
            && doc.is_ancestor(root, owner)
        {
            let Some(next) = doc.parent(owner) else {
                break;
            };
            doc.remove(owner)?;
            owner = next;
        }
    }
    Ok(())
}

fn check_live(doc: &Document, node: Id, kind: SpanKind) -> Result<(), RangeError> {
    let matches_kind = match kind {
        SpanKind::Text => doc.text(node).is_some(),
        SpanKind::LineBreak => doc.is_element(node, "br"),
    };
    if matches_kind && doc.parent(node).is_some() {
        Ok(())
    } else {
        Err(RangeError::StaleNode(node))
    }
}
