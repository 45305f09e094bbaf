use indexmap::IndexMap;

use crate::dom::Document;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocHandle(pub u32);

impl DocHandle {
    pub const PRIMARY: DocHandle = DocHandle(0);
}

/// The primary document plus every embedded frame document currently reachable.
/// Iteration is primary first, then frames in attach order.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    docs: IndexMap<DocHandle, Document>,
    next_handle: u32,
}

impl DocumentStore {
    pub fn new(primary: Document) -> Self {
        let mut docs = IndexMap::new();
        docs.insert(DocHandle::PRIMARY, primary);
        Self {
            docs,
            next_handle: 1,
        }
    }

    pub fn primary(&self) -> &Document {
        &self.docs[0]
    }

    pub fn primary_mut(&mut self) -> &mut Document {
        &mut self.docs[0]
    }

    pub fn attach_frame(&mut self, frame: Document) -> DocHandle {
        let handle = DocHandle(self.next_handle);
        self.next_handle += 1;
        self.docs.insert(handle, frame);
        handle
    }

    /// The primary document cannot be detached.
    pub fn detach_frame(&mut self, handle: DocHandle) -> Option<Document> {
        if handle == DocHandle::PRIMARY {
            return None;
        }
        self.docs.shift_remove(&handle)
    }

    pub fn get(&self, handle: DocHandle) -> Option<&Document> {
        self.docs.get(&handle)
    }

    pub fn get_mut(&mut self, handle: DocHandle) -> Option<&mut Document> {
        self.docs.get_mut(&handle)
    }

    pub fn handles(&self) -> Vec<DocHandle> {
        self.docs.keys().copied().collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (DocHandle, &mut Document)> {
        self.docs.iter_mut().map(|(handle, doc)| (*handle, doc))
    }
}

impl Default for DocumentStore {
    fn default() -> Self {
        Self::new(Document::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_enumerate_primary_first() {
        let mut store = DocumentStore::default();
        let a = store.attach_frame(Document::new());
        let b = store.attach_frame(Document::new());
        assert_eq!(store.handles(), vec![DocHandle::PRIMARY, a, b]);

        assert!(store.detach_frame(a).is_some());
        assert!(store.detach_frame(DocHandle::PRIMARY).is_none());
        assert_eq!(store.handles(), vec![DocHandle::PRIMARY, b]);
        assert!(store.get(a).is_none());
    }

    #[test]
    fn primary_edits_are_visible_through_the_store() -> Result<(), crate::dom::DomError> {
        let mut store = DocumentStore::new(Document::new());
        let primary = store.primary_mut();
        let root = primary.root();
        let note = primary.create_text("edited");
        primary.append_child(root, note)?;
        assert_eq!(store.primary().text_content(root), "edited");
        Ok(())
    }
}
