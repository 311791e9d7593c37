use crate::types::*;
use log::trace;
use std::collections::HashMap;

pub const DEFAULT_WEIGHT: u16 = 16;

/// The stream dependency tree, rooted at the id-0 sentinel.
///
/// Streams reference each other by id only, so closing a stream cannot leak
/// a reference cycle; membership in a parent's child list is dropped
/// explicitly on removal.
///
/// https://httpwg.org/specs/rfc7540.html#StreamPriority
#[derive(Debug, Default)]
pub struct PriorityTree {
    parent: HashMap<StreamId, StreamId>,
    children: HashMap<StreamId, Vec<StreamId>>,
    weight: HashMap<StreamId, u16>,
}

impl PriorityTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contains(&self, id: StreamId) -> bool {
        self.parent.contains_key(&id)
    }

    /// Adds `id` as a child of the sentinel with default weight. Known ids
    /// and the sentinel itself are left untouched.
    pub fn insert(&mut self, id: StreamId) {
        if id == 0 || self.contains(id) {
            return;
        }
        self.attach(0, id);
        self.weight.insert(id, DEFAULT_WEIGHT);
    }

    #[must_use]
    pub fn parent(&self, id: StreamId) -> Option<StreamId> {
        self.parent.get(&id).copied()
    }

    #[must_use]
    pub fn children(&self, id: StreamId) -> &[StreamId] {
        self.children.get(&id).map_or(&[], Vec::as_slice)
    }

    /// Dependency weight in [1, 256].
    #[must_use]
    pub fn weight(&self, id: StreamId) -> u16 {
        self.weight.get(&id).copied().unwrap_or(DEFAULT_WEIGHT)
    }

    pub fn set_weight(&mut self, id: StreamId, weight: u16) {
        debug_assert!((1..=256).contains(&weight));
        self.insert(id);
        self.weight.insert(id, weight);
    }

    /// Whether `ancestor` lies on the parent chain of `id`.
    fn is_ancestor(&self, ancestor: StreamId, id: StreamId) -> bool {
        let mut cursor = id;
        while let Some(parent) = self.parent(cursor) {
            if parent == ancestor {
                return true;
            }
            cursor = parent;
        }
        false
    }

    fn detach(&mut self, id: StreamId) {
        if let Some(old_parent) = self.parent.remove(&id) {
            if let Some(siblings) = self.children.get_mut(&old_parent) {
                siblings.retain(|&sibling| sibling != id);
            }
        }
    }

    fn attach(&mut self, parent: StreamId, id: StreamId) {
        self.parent.insert(id, parent);
        self.children.entry(parent).or_default().push(id);
    }

    /// Makes `child` depend on `new_parent`, preserving acyclicity per RFC
    /// 7540 Section 5.3.3: if `child` is currently an ancestor of
    /// `new_parent`, `new_parent` is first moved to take `child`'s position.
    /// With `exclusive`, `new_parent`'s remaining children are relocated
    /// under `child` before it is inserted.
    pub fn reprioritise(
        &mut self,
        child: StreamId,
        new_parent: StreamId,
        exclusive: bool,
    ) -> Result<(), ProtocolError> {
        if child == 0 {
            return Err(ProtocolError::connection(
                ErrorType::ProtocolError,
                "stream 0 cannot be made a dependency child",
            ));
        }
        if child == new_parent {
            return Err(ProtocolError::stream(
                ErrorType::ProtocolError,
                "stream depends on itself",
            ));
        }

        self.insert(child);
        self.insert(new_parent);

        if new_parent != 0 && self.is_ancestor(child, new_parent) {
            let hoist_to = self.parent(child).unwrap_or(0);
            trace!("priority: hoisting {new_parent} under {hoist_to}");
            self.detach(new_parent);
            self.attach(hoist_to, new_parent);
        }

        self.detach(child);
        if exclusive {
            let moved = self
                .children
                .insert(new_parent, Vec::new())
                .unwrap_or_default();
            for grandchild in moved {
                self.parent.insert(grandchild, child);
                self.children.entry(child).or_default().push(grandchild);
            }
        }
        self.attach(new_parent, child);
        Ok(())
    }

    /// Drops a closed stream, re-parenting its children to its parent.
    pub fn remove(&mut self, id: StreamId) {
        if id == 0 || !self.contains(id) {
            return;
        }
        let new_parent = self.parent(id).unwrap_or(0);
        self.detach(id);
        self.weight.remove(&id);
        for orphan in self.children.remove(&id).unwrap_or_default() {
            self.parent.insert(orphan, new_parent);
            self.children.entry(new_parent).or_default().push(orphan);
        }
    }
}
