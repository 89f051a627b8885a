use flowcore::{ExecutionNode, NodeId};
use std::collections::{HashMap, HashSet};

/// Where `ExecutionTree::insert` placed a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachment {
    /// Linked under a parent that was already in the tree.
    Attached { parent: NodeId },
    /// First root candidate.
    Root,
    /// The current root had recorded this node as its parent and now hangs below it.
    ReplacedRoot { previous: NodeId },
    /// Parent not seen yet; parked in the orphan registry.
    Orphaned { waiting_for: NodeId },
    /// A second, unrelated root candidate. Kept in the node map but not in the tree.
    Detached { root: NodeId },
    /// The id was already present; nothing changed.
    Duplicate,
}

struct Slot {
    node: ExecutionNode,
    children: Vec<NodeId>,
}

/// Live execution tree assembled from out-of-order arrivals.
///
/// Nodes live in a flat map keyed by id; parent/child links are ids, so a
/// node is owned by exactly one slot no matter how late its parent shows up.
#[derive(Default)]
pub struct ExecutionTree {
    slots: HashMap<NodeId, Slot>,
    root: Option<NodeId>,
    orphans: HashMap<NodeId, Vec<NodeId>>,
}

impl ExecutionTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node under `parent_id`, or as a root candidate when `None`.
    ///
    /// Any orphans that were waiting for this node are adopted afterwards.
    pub fn insert(&mut self, mut node: ExecutionNode, parent_id: Option<&str>) -> Attachment {
        let id = node.id.clone();
        if self.slots.contains_key(&id) {
            return Attachment::Duplicate;
        }

        let parent_id = match parent_id {
            Some(parent) if parent == id => {
                tracing::warn!(node_id = %id, "Node declares itself as parent; treating it as a root candidate");
                None
            }
            other => other,
        };
        if let Some(parent) = parent_id {
            node.parent_id = Some(parent.to_string());
        }
        node.children.clear();
        self.slots.insert(
            id.clone(),
            Slot {
                node,
                children: Vec::new(),
            },
        );

        let attachment = match parent_id {
            Some(parent) if self.slots.contains_key(parent) => {
                self.link(parent, &id);
                Attachment::Attached {
                    parent: parent.to_string(),
                }
            }
            Some(parent) => {
                let waiting = self.orphans.entry(parent.to_string()).or_default();
                if !waiting.contains(&id) {
                    waiting.push(id.clone());
                }
                Attachment::Orphaned {
                    waiting_for: parent.to_string(),
                }
            }
            None => self.place_root_candidate(&id),
        };

        self.adopt_orphans(&id);
        attachment
    }

    fn place_root_candidate(&mut self, id: &str) -> Attachment {
        let Some(current) = self.root.clone() else {
            self.root = Some(id.to_string());
            return Attachment::Root;
        };

        let current_parent = self
            .slots
            .get(&current)
            .and_then(|slot| slot.node.parent_id.as_deref());
        if current_parent == Some(id) {
            self.link(id, &current);
            self.root = Some(id.to_string());
            Attachment::ReplacedRoot { previous: current }
        } else {
            tracing::warn!(
                node_id = %id,
                root_id = %current,
                "Multiple root candidates; keeping the existing root"
            );
            Attachment::Detached { root: current }
        }
    }

    fn adopt_orphans(&mut self, parent: &str) {
        let Some(waiting) = self.orphans.remove(parent) else {
            return;
        };

        let mut still_waiting = Vec::new();
        for child in waiting {
            if self.is_ancestor(&child, parent) {
                tracing::warn!(
                    node_id = %child,
                    parent_id = %parent,
                    "Attaching node would create a cycle; leaving it orphaned"
                );
                still_waiting.push(child);
            } else {
                self.link(parent, &child);
            }
        }
        if !still_waiting.is_empty() {
            self.orphans.insert(parent.to_string(), still_waiting);
        }
    }

    fn link(&mut self, parent: &str, child: &str) {
        if let Some(slot) = self.slots.get_mut(child) {
            slot.node.parent_id = Some(parent.to_string());
        }
        if let Some(slot) = self.slots.get_mut(parent) {
            if !slot.children.iter().any(|c| c == child) {
                slot.children.push(child.to_string());
            }
        }
    }

    /// Whether `candidate` appears on the recorded parent chain of `node`.
    fn is_ancestor(&self, candidate: &str, node: &str) -> bool {
        let mut seen = HashSet::new();
        let mut current = Some(node);
        while let Some(id) = current {
            if id == candidate {
                return true;
            }
            if !seen.insert(id) {
                return false;
            }
            current = self
                .slots
                .get(id)
                .and_then(|slot| slot.node.parent_id.as_deref());
        }
        false
    }

    /// Root exists, nothing is orphaned, and every attached child records
    /// its actual parent.
    pub fn is_complete(&self) -> bool {
        let Some(root) = &self.root else {
            return false;
        };
        if !self.orphans.is_empty() {
            return false;
        }

        let mut stack = vec![root.as_str()];
        while let Some(id) = stack.pop() {
            let Some(slot) = self.slots.get(id) else {
                return false;
            };
            for child in &slot.children {
                let recorded = self
                    .slots
                    .get(child)
                    .and_then(|c| c.node.parent_id.as_deref());
                if recorded != Some(id) {
                    return false;
                }
                stack.push(child);
            }
        }
        true
    }

    pub fn root_id(&self) -> Option<&str> {
        self.root.as_deref()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&ExecutionNode> {
        self.slots.get(id).map(|slot| &slot.node)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ExecutionNode> {
        self.slots.get_mut(id).map(|slot| &mut slot.node)
    }

    pub fn children_of(&self, id: &str) -> &[NodeId] {
        self.slots
            .get(id)
            .map(|slot| slot.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.values().map(Vec::len).sum()
    }

    /// True while `child` is still parked waiting for `parent`.
    pub fn is_waiting(&self, child: &str, parent: &str) -> bool {
        self.orphans
            .get(parent)
            .is_some_and(|waiting| waiting.iter().any(|c| c == child))
    }

    /// The recorded parent chain of `id`, outermost first, ending with `id`.
    pub fn lineage(&self, id: &str) -> Vec<NodeId> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = self.slots.get(id).map(|slot| &slot.node);
        while let Some(node) = current {
            if !seen.insert(node.id.as_str()) {
                break;
            }
            chain.push(node.id.clone());
            current = node
                .parent_id
                .as_deref()
                .and_then(|parent| self.slots.get(parent))
                .map(|slot| &slot.node);
        }
        chain.reverse();
        chain
    }

    /// Nested copy of the tree hanging from the root.
    pub fn snapshot(&self) -> Option<ExecutionNode> {
        self.root.as_deref().and_then(|root| self.materialize(root))
    }

    /// Nested copy of the subtree rooted at `id`.
    pub fn materialize(&self, id: &str) -> Option<ExecutionNode> {
        let slot = self.slots.get(id)?;
        let mut node = slot.node.clone();
        node.children = slot
            .children
            .iter()
            .filter_map(|child| self.materialize(child))
            .collect();
        Some(node)
    }
}
