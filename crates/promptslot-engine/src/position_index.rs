//! Flat logical-text view of a document subtree.
//!
//! Every text node contributes its text, every `<br>` contributes one `\n`, and all
//! other elements are transparent. Opaque elements (see [`widget::is_opaque`]) are
//! skipped with their whole subtree. Offsets are UTF-8 byte offsets into the
//! logical text. An index is only valid for the scan that built it.

use crate::dom::{Document, Id};
use crate::widget;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    Text,
    LineBreak,
}

/// Node `node` contributes logical text `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogicalTextSpan {
    pub node: Id,
    pub kind: SpanKind,
    pub start: usize,
    pub end: usize,
}

impl LogicalTextSpan {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Debug, Clone, Default)]
pub struct PositionIndex {
    text: String,
    spans: Vec<LogicalTextSpan>,
}

impl PositionIndex {
    pub fn build(doc: &Document, root: Id) -> Self {
        let mut index = Self::default();
        let mut stack: Vec<Id> = doc.children(root).iter().rev().copied().collect();
        while let Some(node) = stack.pop() {
            if let Some(text) = doc.text(node) {
                index.push(node, SpanKind::Text, text);
                continue;
            }
            if widget::is_opaque(doc, node) {
                continue;
            }
            if doc.is_element(node, "br") {
                index.push(node, SpanKind::LineBreak, "\n");
                continue;
            }
            stack.extend(doc.children(node).iter().rev().copied());
        }
        index
    }

    /// Logical offset at which `target` sits: the length of all logical text before it.
    /// `target` may be opaque (a widget); `None` when it is not under `root`.
    pub fn offset_of(doc: &Document, root: Id, target: Id) -> Option<usize> {
        let mut offset = 0;
        let mut stack: Vec<Id> = doc.children(root).iter().rev().copied().collect();
        while let Some(node) = stack.pop() {
            if node == target {
                return Some(offset);
            }
            if let Some(text) = doc.text(node) {
                offset += text.len();
                continue;
            }
            if widget::is_opaque(doc, node) {
                continue;
            }
            if doc.is_element(node, "br") {
                offset += 1;
                continue;
            }
            stack.extend(doc.children(node).iter().rev().copied());
        }
        None
    }

    fn push(&mut self, node: Id, kind: SpanKind, contribution: &str) {
        let start = self.text.len();
        self.text.push_str(contribution);
        self.spans.push(LogicalTextSpan {
            node,
            kind,
            start,
            end: self.text.len(),
        });
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn spans(&self) -> &[LogicalTextSpan] {
        &self.spans
    }

    /// The span owning offset `p`: the first span whose end is at or past `p`. A `p`
    /// that sits exactly on a boundary resolves to the span ending there, so an
    /// insertion lands after its trailing edge. `None` when `p` is past the end or
    /// nothing was indexed.
    pub fn find_span(&self, p: usize) -> Option<(usize, &LogicalTextSpan)> {
        if p > self.len() {
            return None;
        }
        let idx = self.spans.partition_point(|span| span.end < p);
        self.spans.get(idx).map(|span| (idx, span))
    }

    /// First span holding a character at or after `p`; where a range starting at
    /// `p` begins.
    pub fn span_at_or_after(&self, p: usize) -> Option<(usize, &LogicalTextSpan)> {
        if p >= self.len() {
            return None;
        }
        let idx = self.spans.partition_point(|span| span.end <= p);
        self.spans.get(idx).map(|span| (idx, span))
    }
}

#[cfg(test)]
mod tests {
    use promptslot_contracts::ContentKey;

    use super::*;
    use crate::dom::DomError;

    fn mixed_document() -> Result<(Document, Id), DomError> {
        // <div>ab<b>cd</b><br>e<script>zz</script>f</div>
        let mut doc = Document::new();
        let div = doc.create_element("div");
        doc.append_child(doc.root(), div)?;
        let ab = doc.create_text("ab");
        let b = doc.create_element("b");
        let cd = doc.create_text("cd");
        let br = doc.create_element("br");
        let e = doc.create_text("e");
        let script = doc.create_element("script");
        let zz = doc.create_text("zz");
        let f = doc.create_text("f");
        doc.append_child(div, ab)?;
        doc.append_child(div, b)?;
        doc.append_child(b, cd)?;
        doc.append_child(div, br)?;
        doc.append_child(div, e)?;
        doc.append_child(div, script)?;
        doc.append_child(script, zz)?;
        doc.append_child(div, f)?;
        Ok((doc, div))
    }

    #[test]
    fn spans_cover_logical_text_exactly_once() -> Result<(), DomError> {
        let (doc, div) = mixed_document()?;
        let index = PositionIndex::build(&doc, div);
        assert_eq!(index.text(), "abcd\nef");

        let mut cursor = 0;
        for span in index.spans() {
            assert_eq!(span.start, cursor);
            assert_eq!(
                &index.text()[span.start..span.end],
                match span.kind {
                    SpanKind::Text => doc.text(span.node).unwrap_or_default(),
                    SpanKind::LineBreak => "\n",
                }
            );
            cursor = span.end;
        }
        assert_eq!(cursor, index.len());
        Ok(())
    }

    #[test]
    fn find_span_resolves_every_offset() -> Result<(), DomError> {
        let (doc, div) = mixed_document()?;
        let index = PositionIndex::build(&doc, div);
        for p in 0..=index.len() {
            let (_, span) = index.find_span(p).ok_or(DomError::UnknownNode(div))?;
            assert!(span.start <= p && p <= span.end, "offset {p} -> {span:?}");
        }
        assert!(index.find_span(index.len() + 1).is_none());

        // "ab" ends at 2; the boundary belongs to it rather than to "cd".
        let (_, boundary) = index.find_span(2).ok_or(DomError::UnknownNode(div))?;
        assert_eq!(boundary.start, 0);
        let (_, starting) = index.span_at_or_after(2).ok_or(DomError::UnknownNode(div))?;
        assert_eq!(starting.start, 2);
        Ok(())
    }

    #[test]
    fn widgets_are_not_indexed() -> Result<(), DomError> {
        let (mut doc, message) = Document::from_message_text("hello world");
        let key = ContentKey::derive("cat");
        let pair = widget::build(&mut doc, &key, "cat", "Generate");
        widget::place(&mut doc, pair, message, None)?;
        let index = PositionIndex::build(&doc, message);
        assert_eq!(index.text(), "hello world");
        assert_eq!(PositionIndex::offset_of(&doc, message, pair.trigger), Some(11));
        assert_eq!(PositionIndex::offset_of(&doc, message, doc.root()), None);
        Ok(())
    }

    #[test]
    fn empty_root_has_no_spans() {
        let doc = Document::new();
        let index = PositionIndex::build(&doc, doc.root());
        assert!(index.is_empty());
        assert!(index.find_span(0).is_none());
    }
}
