//! Arena-backed document tree.
//!
//! The engine only ever sees the host document through this model: read queries to
//! build the logical text, range-style edits to replace placeholders. Node ids are
//! slot indices that are never reused, so a stale id from an earlier scan resolves
//! to "unknown node" rather than to some unrelated node.

use std::fmt;

pub type NodeId = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(pub NodeId);

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Element {
        name: String,
        attributes: Vec<(String, String)>,
    },
    Text {
        text: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomError {
    UnknownNode(Id),
    WrongNodeKind(Id),
    NotAChild { parent: Id, child: Id },
    CycleDetected { parent: Id, child: Id },
    DetachedRoot(Id),
    OffsetOutOfBounds { node: Id, offset: usize },
    NotCharBoundary { node: Id, offset: usize },
}

impl fmt::Display for DomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomError::UnknownNode(id) => write!(f, "unknown node {}", id.0),
            DomError::WrongNodeKind(id) => write!(f, "node {} has the wrong kind", id.0),
            DomError::NotAChild { parent, child } => {
                write!(f, "node {} is not a child of {}", child.0, parent.0)
            }
            DomError::CycleDetected { parent, child } => {
                write!(f, "inserting {} under {} would create a cycle", child.0, parent.0)
            }
            DomError::DetachedRoot(id) => write!(f, "the document root {} cannot move", id.0),
            DomError::OffsetOutOfBounds { node, offset } => {
                write!(f, "offset {offset} is outside node {}", node.0)
            }
            DomError::NotCharBoundary { node, offset } => {
                write!(f, "offset {offset} splits a character in node {}", node.0)
            }
        }
    }
}

impl std::error::Error for DomError {}

#[derive(Debug, Clone)]
struct Slot {
    kind: NodeKind,
    parent: Option<Id>,
    children: Vec<Id>,
}

#[derive(Debug, Clone)]
pub struct Document {
    slots: Vec<Option<Slot>>,
    root: Id,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        let mut doc = Self {
            slots: Vec::new(),
            root: Id(0),
        };
        doc.root = doc.create_element("body");
        doc
    }

    /// Builds `<body><div class="mes_text">line<br>line...</div></body>` and returns the
    /// document plus the message element.
    pub fn from_message_text(text: &str) -> (Self, Id) {
        let mut doc = Self::new();
        let message = doc.create_element("div");
        doc.set_attr(message, "class", "mes_text");
        let root = doc.root();
        doc.attach(root, message, None);
        for (idx, line) in text.split('\n').enumerate() {
            if idx > 0 {
                let br = doc.create_element("br");
                doc.attach(message, br, None);
            }
            if !line.is_empty() {
                let node = doc.create_text(line.trim_end_matches('\r'));
                doc.attach(message, node, None);
            }
        }
        (doc, message)
    }

    pub fn root(&self) -> Id {
        self.root
    }

    pub fn contains(&self, id: Id) -> bool {
        self.slot(id).is_some()
    }

    pub fn create_element(&mut self, name: &str) -> Id {
        self.alloc(NodeKind::Element {
            name: name.to_ascii_lowercase(),
            attributes: Vec::new(),
        })
    }

    pub fn create_text(&mut self, text: &str) -> Id {
        self.alloc(NodeKind::Text {
            text: text.to_string(),
        })
    }

    pub fn kind(&self, id: Id) -> Option<&NodeKind> {
        self.slot(id).map(|slot| &slot.kind)
    }

    pub fn parent(&self, id: Id) -> Option<Id> {
        self.slot(id).and_then(|slot| slot.parent)
    }

    pub fn children(&self, id: Id) -> &[Id] {
        self.slot(id)
            .map(|slot| slot.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn name(&self, id: Id) -> Option<&str> {
        match self.kind(id)? {
            NodeKind::Element { name, .. } => Some(name),
            NodeKind::Text { .. } => None,
        }
    }

    pub fn is_element(&self, id: Id, tag: &str) -> bool {
        self.name(id).is_some_and(|name| name.eq_ignore_ascii_case(tag))
    }

    pub fn text(&self, id: Id) -> Option<&str> {
        match self.kind(id)? {
            NodeKind::Text { text } => Some(text),
            NodeKind::Element { .. } => None,
        }
    }

    pub fn set_text(&mut self, id: Id, value: &str) -> Result<(), DomError> {
        match self.slot_mut(id).map(|slot| &mut slot.kind) {
            Some(NodeKind::Text { text }) => {
                *text = value.to_string();
                Ok(())
            }
            Some(NodeKind::Element { .. }) => Err(DomError::WrongNodeKind(id)),
            None => Err(DomError::UnknownNode(id)),
        }
    }

    pub fn attr(&self, id: Id, key: &str) -> Option<&str> {
        match self.kind(id)? {
            NodeKind::Element { attributes, .. } => attributes
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value.as_str()),
            NodeKind::Text { .. } => None,
        }
    }

    pub fn set_attr(&mut self, id: Id, key: &str, value: &str) {
        if let Some(NodeKind::Element { attributes, .. }) =
            self.slot_mut(id).map(|slot| &mut slot.kind)
        {
            match attributes.iter_mut().find(|(name, _)| name == key) {
                Some((_, existing)) => *existing = value.to_string(),
                None => attributes.push((key.to_string(), value.to_string())),
            }
        }
    }

    pub fn remove_attr(&mut self, id: Id, key: &str) -> Option<String> {
        if let Some(NodeKind::Element { attributes, .. }) =
            self.slot_mut(id).map(|slot| &mut slot.kind)
        {
            let idx = attributes.iter().position(|(name, _)| name == key)?;
            return Some(attributes.remove(idx).1);
        }
        None
    }

    pub fn append_child(&mut self, parent: Id, child: Id) -> Result<(), DomError> {
        self.insert_before(parent, child, None)
    }

    /// Moves `child` under `parent`, before `reference` (or last when `None`).
    pub fn insert_before(
        &mut self,
        parent: Id,
        child: Id,
        reference: Option<Id>,
    ) -> Result<(), DomError> {
        if !self.contains(parent) {
            return Err(DomError::UnknownNode(parent));
        }
        if !self.contains(child) {
            return Err(DomError::UnknownNode(child));
        }
        if child == self.root {
            return Err(DomError::DetachedRoot(child));
        }
        if matches!(self.kind(parent), Some(NodeKind::Text { .. })) {
            return Err(DomError::WrongNodeKind(parent));
        }
        if child == parent || self.is_ancestor(child, parent) {
            return Err(DomError::CycleDetected { parent, child });
        }
        if let Some(reference) = reference {
            if self.parent(reference) != Some(parent) {
                return Err(DomError::NotAChild {
                    parent,
                    child: reference,
                });
            }
        }
        self.unlink(child);
        let index = match reference {
            Some(reference) => self
                .children(parent)
                .iter()
                .position(|id| *id == reference)
                .ok_or(DomError::NotAChild {
                    parent,
                    child: reference,
                })?,
            None => self.children(parent).len(),
        };
        if let Some(slot) = self.slot_mut(parent) {
            slot.children.insert(index, child);
        }
        if let Some(slot) = self.slot_mut(child) {
            slot.parent = Some(parent);
        }
        Ok(())
    }

    /// Detaches `id` and frees its whole subtree.
    pub fn remove(&mut self, id: Id) -> Result<(), DomError> {
        if !self.contains(id) {
            return Err(DomError::UnknownNode(id));
        }
        if id == self.root {
            return Err(DomError::DetachedRoot(id));
        }
        self.unlink(id);
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if let Some(slot) = self.slots.get_mut(next.0 as usize).and_then(Option::take) {
                stack.extend(slot.children);
            }
        }
        Ok(())
    }

    pub fn remove_children(&mut self, id: Id) -> Result<(), DomError> {
        for child in self.children(id).to_vec() {
            self.remove(child)?;
        }
        Ok(())
    }

    /// Splits a text node at byte `offset`. The tail moves into a new text node right
    /// after the original, which is returned.
    pub fn split_text(&mut self, id: Id, offset: usize) -> Result<Id, DomError> {
        let text = self.text(id).ok_or_else(|| {
            if self.contains(id) {
                DomError::WrongNodeKind(id)
            } else {
                DomError::UnknownNode(id)
            }
        })?;
        if offset > text.len() {
            return Err(DomError::OffsetOutOfBounds { node: id, offset });
        }
        if !text.is_char_boundary(offset) {
            return Err(DomError::NotCharBoundary { node: id, offset });
        }
        let head = text[..offset].to_string();
        let tail = text[offset..].to_string();
        let parent = self.parent(id).ok_or(DomError::UnknownNode(id))?;
        let reference = self.next_sibling(id);

        self.set_text(id, &head)?;
        let tail_node = self.create_text(&tail);
        self.insert_before(parent, tail_node, reference)?;
        Ok(tail_node)
    }

    pub fn next_sibling(&self, id: Id) -> Option<Id> {
        let parent = self.parent(id)?;
        let siblings = self.children(parent);
        let idx = siblings.iter().position(|sibling| *sibling == id)?;
        siblings.get(idx + 1).copied()
    }

    pub fn next_element_sibling(&self, id: Id) -> Option<Id> {
        let mut cursor = self.next_sibling(id);
        while let Some(node) = cursor {
            if self.name(node).is_some() {
                return Some(node);
            }
            cursor = self.next_sibling(node);
        }
        None
    }

    pub fn is_ancestor(&self, ancestor: Id, node: Id) -> bool {
        let mut cursor = self.parent(node);
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self.parent(current);
        }
        false
    }

    /// Pre-order walk of everything below `id`, `id` excluded.
    pub fn descendants(&self, id: Id) -> Vec<Id> {
        let mut out = Vec::new();
        let mut stack: Vec<Id> = self.children(id).iter().rev().copied().collect();
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.children(next).iter().rev().copied());
        }
        out
    }

    pub fn find_descendants_by_attr(&self, id: Id, key: &str, value: &str) -> Vec<Id> {
        self.descendants(id)
            .into_iter()
            .filter(|node| self.attr(*node, key) == Some(value))
            .collect()
    }

    /// Position of `id` in a pre-order walk of the whole document.
    pub fn document_position(&self, id: Id) -> Option<usize> {
        if id == self.root {
            return Some(0);
        }
        self.descendants(self.root)
            .iter()
            .position(|node| *node == id)
            .map(|idx| idx + 1)
    }

    pub fn text_content(&self, id: Id) -> String {
        let mut out = String::new();
        if let Some(text) = self.text(id) {
            out.push_str(text);
        }
        for node in self.descendants(id) {
            if let Some(text) = self.text(node) {
                out.push_str(text);
            }
        }
        out
    }

    /// Serializes the subtree rooted at `id` as HTML-like markup.
    pub fn to_markup(&self, id: Id) -> String {
        let mut out = String::new();
        self.write_markup(id, &mut out);
        out
    }

    fn write_markup(&self, id: Id, out: &mut String) {
        match self.kind(id) {
            Some(NodeKind::Text { text }) => out.push_str(&escape_text(text)),
            Some(NodeKind::Element { name, attributes }) => {
                out.push('<');
                out.push_str(name);
                for (key, value) in attributes {
                    out.push(' ');
                    out.push_str(key);
                    out.push_str("=\"");
                    out.push_str(&escape_attr(value));
                    out.push('"');
                }
                out.push('>');
                if is_void(name) {
                    return;
                }
                for child in self.children(id) {
                    self.write_markup(*child, out);
                }
                out.push_str("</");
                out.push_str(name);
                out.push('>');
            }
            None => {}
        }
    }

    fn alloc(&mut self, kind: NodeKind) -> Id {
        let id = Id(self.slots.len() as NodeId);
        self.slots.push(Some(Slot {
            kind,
            parent: None,
            children: Vec::new(),
        }));
        id
    }

    fn attach(&mut self, parent: Id, child: Id, reference: Option<Id>) {
        // Only used while building fresh nodes, where none of the checks can fail.
        let _ = self.insert_before(parent, child, reference);
    }

    fn unlink(&mut self, id: Id) {
        let Some(parent) = self.parent(id) else {
            return;
        };
        if let Some(slot) = self.slot_mut(parent) {
            slot.children.retain(|child| *child != id);
        }
        if let Some(slot) = self.slot_mut(id) {
            slot.parent = None;
        }
    }

    fn slot(&self, id: Id) -> Option<&Slot> {
        self.slots.get(id.0 as usize).and_then(Option::as_ref)
    }

    fn slot_mut(&mut self, id: Id) -> Option<&mut Slot> {
        self.slots.get_mut(id.0 as usize).and_then(Option::as_mut)
    }
}

fn is_void(name: &str) -> bool {
    matches!(name, "br" | "img" | "hr" | "input" | "source")
}

fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_attr(value: &str) -> String {
    escape_text(value).replace('"', "&quot;")
}
