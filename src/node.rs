// 🔗 Lineage Node - one traversal-scoped view over a persisted record
//
// Children are owned (Rc), the parent is a weak back-link, so a family tree is
// dropped as a unit once its Resolution and every outside handle are gone.
// Nodes have no state of their own beyond the record copy and the staged edit.

use crate::error::LineageError;
use crate::propagation::{PropagationEngine, PropagationReport};
use crate::record::{is_known_field, FieldValues, Record, RecordKind, RecordRef};
use crate::store::RecordStore;
use anyhow::Result;
use std::cell::{Ref, RefCell};
use std::collections::HashSet;
use std::fmt;
use std::rc::{Rc, Weak};

struct NodeData {
    record: Record,
    parent: Weak<RefCell<NodeData>>,
    children: Vec<Node>,
    staged: FieldValues,
}

#[derive(Clone)]
pub struct Node(Rc<RefCell<NodeData>>);

impl Node {
    /// Wrap an already-loaded record; relatives are not loaded
    pub fn wrap<R: Into<Record>>(record: R) -> Node {
        Node(Rc::new(RefCell::new(NodeData {
            record: record.into(),
            parent: Weak::new(),
            children: Vec::new(),
            staged: FieldValues::new(),
        })))
    }

    pub fn kind(&self) -> RecordKind {
        self.0.borrow().record.kind()
    }

    pub fn id(&self) -> i64 {
        self.0.borrow().record.id()
    }

    pub fn record_ref(&self) -> RecordRef {
        self.0.borrow().record.record_ref()
    }

    /// In-memory copy of the record, including staged and propagated values
    pub fn record(&self) -> Ref<'_, Record> {
        Ref::map(self.0.borrow(), |data| &data.record)
    }

    pub fn parent(&self) -> Option<Node> {
        self.0.borrow().parent.upgrade().map(Node)
    }

    pub fn children(&self) -> Vec<Node> {
        self.0.borrow().children.clone()
    }

    pub fn is_root(&self) -> bool {
        self.parent().is_none()
    }

    /// Same underlying node (not merely the same record)
    pub fn ptr_eq(&self, other: &Node) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Number of parent edges up to the root; a root has depth 0
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self.parent();
        while let Some(node) = current {
            depth += 1;
            current = node.parent();
        }
        depth
    }

    pub fn root(&self) -> Node {
        let mut current = self.clone();
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    /// First direct child of the given kind, e.g. a batch's first inventory
    pub fn first_child_of_kind(&self, kind: RecordKind) -> Option<Node> {
        self.0
            .borrow()
            .children
            .iter()
            .find(|child| child.kind() == kind)
            .cloned()
    }

    /// Every node below this one, depth-first pre-order
    pub fn descendants(&self) -> Vec<Node> {
        let mut seen: HashSet<RecordRef> = HashSet::new();
        let mut out = Vec::new();
        let mut stack: Vec<Node> = self.children().into_iter().rev().collect();

        while let Some(node) = stack.pop() {
            if !seen.insert(node.record_ref()) {
                continue;
            }
            stack.extend(node.children().into_iter().rev());
            out.push(node);
        }
        out
    }

    /// Stage field edits on this node's in-memory record. Nothing is persisted.
    ///
    /// Names must be known to some record kind and must not be structural
    /// (ids, parent references, tombstones). Fields this kind lacks are staged
    /// anyway so they can still flow to descendants that do have them.
    /// Later calls merge over earlier ones.
    pub fn update(&self, values: FieldValues) -> Result<(), LineageError> {
        for name in values.keys() {
            if let Some(kind) = RecordKind::ALL.into_iter().find(|kind| kind.is_structural(name)) {
                return Err(LineageError::StructuralField { kind, field: name.clone() });
            }
            if !is_known_field(name) {
                return Err(LineageError::UnknownField(name.clone()));
            }
        }

        let mut data = self.0.borrow_mut();
        data.record.apply(&values)?;
        data.staged.extend(values);
        Ok(())
    }

    /// Everything staged through `update` so far
    pub fn staged(&self) -> FieldValues {
        self.0.borrow().staged.clone()
    }

    /// Persist this node's own record
    pub fn save(&self, store: &dyn RecordStore) -> Result<()> {
        store.save_record(&self.record())
    }

    /// Save this node's staged edit, then cascade it to every descendant with the
    /// standard field mapping, saving each touched descendant as it is visited
    pub fn propagate(&self, store: &dyn RecordStore) -> PropagationReport {
        PropagationEngine::default().propagate(self, store)
    }

    /// Write already-mapped values onto this record without staging them
    pub(crate) fn apply_carried(&self, values: &FieldValues) -> Result<Vec<String>, LineageError> {
        self.0.borrow_mut().record.apply(values)
    }

    /// Put back a copy taken before a failed save
    pub(crate) fn replace_record(&self, record: Record) {
        self.0.borrow_mut().record = record;
    }

    /// Link `child` under `parent`. Refuses links that would close a cycle.
    pub(crate) fn attach(parent: &Node, child: &Node) -> bool {
        let mut ancestor = Some(parent.clone());
        while let Some(node) = ancestor {
            if node.ptr_eq(child) {
                return false;
            }
            ancestor = node.parent();
        }

        if let Some(old_parent) = child.parent() {
            old_parent.0.borrow_mut().children.retain(|c| !c.ptr_eq(child));
        }

        child.0.borrow_mut().parent = Rc::downgrade(&parent.0);
        let mut parent_data = parent.0.borrow_mut();
        if !parent_data.children.iter().any(|c| c.ptr_eq(child)) {
            parent_data.children.push(child.clone());
        }
        true
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.0.borrow();
        f.debug_struct("Node")
            .field("record", &data.record.record_ref())
            .field("parent", &data.parent.upgrade().map(|p| p.borrow().record.record_ref()))
            .field("children", &data.children.len())
            .field("staged", &data.staged)
            .finish()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.record_ref())
    }
}
