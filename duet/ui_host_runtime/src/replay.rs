//! Main/render side of the operation log: replays batches in order against a
//! handle-keyed replica and forwards each applied operation to the renderer.

use crate::error::ProtocolError;
use crate::handle_table::Handle;
use crate::operation::{ElementOperation, OperationBatch};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub const ROOT_HANDLE: Handle = 0;

/// The renderer-specific collaborator that mutates the real native tree.
pub trait RendererSink {
    fn apply(&mut self, op: &ElementOperation) -> Result<(), String>;
}

/// Sink for hosts without a native tree.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl RendererSink for NullSink {
    fn apply(&mut self, _op: &ElementOperation) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    pub applied: Vec<ElementOperation>,
}

impl RendererSink for RecordingSink {
    fn apply(&mut self, op: &ElementOperation) -> Result<(), String> {
        self.applied.push(op.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StyleValue {
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
}

/// Structural dump of an attached tree, comparable across implementations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeSnapshot {
    pub uid: Handle,
    pub tag: String,
    pub attributes: BTreeMap<String, String>,
    pub style: BTreeMap<String, StyleValue>,
    pub events: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inner_html: Option<String>,
    pub children: Vec<TreeSnapshot>,
}

#[derive(Debug, Clone, Default)]
struct ReplicaNode {
    tag: String,
    parent: Option<Handle>,
    children: Vec<Handle>,
    attributes: BTreeMap<String, String>,
    style: BTreeMap<String, StyleValue>,
    events: BTreeSet<String>,
    inner_html: Option<String>,
}

impl ReplicaNode {
    fn with_tag(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ElementTree {
    nodes: HashMap<Handle, ReplicaNode>,
    root_events: BTreeSet<String>,
}

impl Default for ElementTree {
    fn default() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_HANDLE, ReplicaNode::with_tag("#root"));
        Self {
            nodes,
            root_events: BTreeSet::new(),
        }
    }
}

impl ElementTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, uid: Handle) -> bool {
        self.nodes.contains_key(&uid)
    }

    pub fn tag(&self, uid: Handle) -> Option<&str> {
        self.nodes.get(&uid).map(|node| node.tag.as_str())
    }

    pub fn parent(&self, uid: Handle) -> Option<Handle> {
        self.nodes.get(&uid).and_then(|node| node.parent)
    }

    pub fn children(&self, uid: Handle) -> &[Handle] {
        self.nodes
            .get(&uid)
            .map(|node| node.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn attribute(&self, uid: Handle, key: &str) -> Option<&str> {
        self.nodes
            .get(&uid)
            .and_then(|node| node.attributes.get(key))
            .map(String::as_str)
    }

    /// Event types that have at least one observing node.
    pub fn root_events(&self) -> &BTreeSet<String> {
        &self.root_events
    }

    pub fn snapshot(&self) -> TreeSnapshot {
        self.snapshot_from(ROOT_HANDLE)
    }

    fn snapshot_from(&self, uid: Handle) -> TreeSnapshot {
        let node = &self.nodes[&uid];
        TreeSnapshot {
            uid,
            tag: node.tag.clone(),
            attributes: node.attributes.clone(),
            style: node.style.clone(),
            events: node.events.clone(),
            inner_html: node.inner_html.clone(),
            children: node
                .children
                .iter()
                .map(|child| self.snapshot_from(*child))
                .collect(),
        }
    }

    /// Replays `batch` in order. On failure, operations before the failing
    /// index stay applied and the tree keeps accepting later batches.
    pub fn apply_batch<S: RendererSink>(
        &mut self,
        batch: &OperationBatch,
        sink: &mut S,
    ) -> Result<(), ProtocolError> {
        self.apply_all(Some(batch.rev), &batch.ops, sink)
    }

    pub fn apply_all<S: RendererSink>(
        &mut self,
        rev: Option<u64>,
        ops: &[ElementOperation],
        sink: &mut S,
    ) -> Result<(), ProtocolError> {
        for (index, op) in ops.iter().enumerate() {
            self.apply(op)
                .and_then(|()| sink.apply(op))
                .map_err(|reason| ProtocolError::new(rev, index, reason))?;
        }
        Ok(())
    }

    pub fn apply(&mut self, op: &ElementOperation) -> Result<(), String> {
        match op {
            ElementOperation::Create { uid, tag } => self.create(*uid, tag),
            ElementOperation::SetAttribute { uid, key, value } => {
                self.node_mut(*uid)?
                    .attributes
                    .insert(key.clone(), value.clone());
                Ok(())
            }
            ElementOperation::RemoveAttribute { uid, key } => {
                self.node_mut(*uid)?.attributes.remove(key);
                Ok(())
            }
            ElementOperation::Append { uid, cid } => self.append(*uid, cid),
            ElementOperation::Remove { uid } => {
                self.node(*uid)?;
                self.detach(*uid);
                Ok(())
            }
            ElementOperation::ReplaceWith { uid, nid } => self.replace_with(*uid, nid),
            ElementOperation::InsertBefore {
                uid,
                cid,
                reference,
            } => self.insert_before(*uid, *cid, *reference),
            ElementOperation::EnableEvent { uid, event_type } => {
                self.node_mut(*uid)?.events.insert(event_type.clone());
                self.root_events.insert(event_type.clone());
                Ok(())
            }
            ElementOperation::RemoveChild { uid, cid } => {
                self.node(*uid)?;
                if self.node(*cid)?.parent != Some(*uid) {
                    return Err(format!("node {cid} is not a child of node {uid}"));
                }
                self.detach(*cid);
                Ok(())
            }
            ElementOperation::StyleDeclarationSetProperty {
                uid,
                property,
                value,
                priority,
            } => {
                self.node_mut(*uid)?.style.insert(
                    property.clone(),
                    StyleValue {
                        value: value.clone(),
                        priority: priority.clone().filter(|p| !p.is_empty()),
                    },
                );
                Ok(())
            }
            ElementOperation::StyleDeclarationRemoveProperty { uid, property } => {
                self.node_mut(*uid)?.style.remove(property);
                Ok(())
            }
            ElementOperation::SetInnerHtml { uid, text } => {
                let children = std::mem::take(&mut self.node_mut(*uid)?.children);
                for child in children {
                    if let Some(node) = self.nodes.get_mut(&child) {
                        node.parent = None;
                    }
                }
                self.node_mut(*uid)?.inner_html = Some(text.clone());
                Ok(())
            }
        }
    }

    fn create(&mut self, uid: Handle, tag: &str) -> Result<(), String> {
        if uid == ROOT_HANDLE {
            return Err("cannot create a node with the root handle".to_string());
        }

        // The sender recycles handles only after disposing a detached node.
        if let Some(existing) = self.nodes.get(&uid) {
            if existing.parent.is_some() {
                return Err(format!("handle {uid} is already bound to an attached node"));
            }
            let orphans = existing.children.clone();
            for orphan in orphans {
                if let Some(node) = self.nodes.get_mut(&orphan) {
                    node.parent = None;
                }
            }
        }

        self.nodes.insert(uid, ReplicaNode::with_tag(tag));
        Ok(())
    }

    fn append(&mut self, uid: Handle, cid: &[Handle]) -> Result<(), String> {
        self.node(uid)?;
        for child in cid {
            self.check_insertable(uid, *child)?;
        }

        for child in cid {
            self.detach(*child);
            self.attach(uid, *child, None);
        }
        Ok(())
    }

    fn insert_before(
        &mut self,
        uid: Handle,
        cid: Handle,
        reference: Option<Handle>,
    ) -> Result<(), String> {
        self.node(uid)?;
        self.check_insertable(uid, cid)?;

        let Some(reference) = reference else {
            self.detach(cid);
            self.attach(uid, cid, None);
            return Ok(());
        };

        if reference == cid {
            return Ok(());
        }
        if self.node(reference)?.parent != Some(uid) {
            return Err(format!(
                "reference node {reference} is not a child of node {uid}"
            ));
        }

        self.detach(cid);
        let index = self.position(uid, reference).unwrap_or(0);
        self.attach(uid, cid, Some(index));
        Ok(())
    }

    fn replace_with(&mut self, uid: Handle, nid: &[Handle]) -> Result<(), String> {
        let Some(parent) = self.node(uid)?.parent else {
            return Ok(());
        };
        for new_node in nid {
            if *new_node != uid {
                self.check_insertable(parent, *new_node)?;
            }
        }

        for new_node in nid {
            if *new_node != uid {
                self.detach(*new_node);
            }
        }

        let index = self.position(parent, uid).unwrap_or(0);
        self.node_mut(parent)?
            .children
            .splice(index..=index, nid.iter().copied());
        self.node_mut(uid)?.parent = None;
        for new_node in nid {
            self.node_mut(*new_node)?.parent = Some(parent);
        }
        Ok(())
    }

    fn check_insertable(&self, parent: Handle, child: Handle) -> Result<(), String> {
        if child == ROOT_HANDLE {
            return Err("the root node cannot be inserted".to_string());
        }
        self.node(child)?;

        let mut cursor = Some(parent);
        while let Some(ancestor) = cursor {
            if ancestor == child {
                return Err(format!(
                    "inserting node {child} under node {parent} would create a cycle"
                ));
            }
            cursor = self.nodes.get(&ancestor).and_then(|node| node.parent);
        }
        Ok(())
    }

    fn attach(&mut self, parent: Handle, child: Handle, index: Option<usize>) {
        if let Some(node) = self.nodes.get_mut(&parent) {
            match index {
                Some(index) => node.children.insert(index, child),
                None => node.children.push(child),
            }
        }
        if let Some(node) = self.nodes.get_mut(&child) {
            node.parent = Some(parent);
        }
    }

    fn detach(&mut self, uid: Handle) {
        let Some(parent) = self.nodes.get_mut(&uid).and_then(|node| node.parent.take()) else {
            return;
        };
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.children.retain(|child| *child != uid);
        }
    }

    fn position(&self, parent: Handle, child: Handle) -> Option<usize> {
        self.nodes
            .get(&parent)?
            .children
            .iter()
            .position(|candidate| *candidate == child)
    }

    fn node(&self, uid: Handle) -> Result<&ReplicaNode, String> {
        self.nodes
            .get(&uid)
            .ok_or_else(|| format!("cannot find element with handle {uid}"))
    }

    fn node_mut(&mut self, uid: Handle) -> Result<&mut ReplicaNode, String> {
        self.nodes
            .get_mut(&uid)
            .ok_or_else(|| format!("cannot find element with handle {uid}"))
    }
}
