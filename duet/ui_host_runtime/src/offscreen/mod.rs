//! Structural replica that records every mutation as an [`ElementOperation`].
//!
//! Mutations never touch the renderer. They append to a buffer that
//! [`OffscreenTree::commit`] swaps out and hands to the `on_commit` callback,
//! so any number of synchronous mutations coalesce into one message.

mod event;

pub use event::{EventPhase, Listener, OffscreenEvent};

use crate::error::TreeError;
use crate::handle_table::{Handle, HandleTable};
use crate::operation::ElementOperation;
use crate::replay::{ROOT_HANDLE, StyleValue, TreeSnapshot};
use event::Registration;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;
use tracing::debug;

pub type CommitCallback = Box<dyn FnMut(&[ElementOperation])>;

#[derive(Debug, Clone, Default)]
pub struct OffscreenNode {
    pub tag: String,
    pub parent: Option<Handle>,
    pub children: Vec<Handle>,
    pub attributes: BTreeMap<String, String>,
    pub style: BTreeMap<String, StyleValue>,
    pub enabled_events: BTreeSet<String>,
    pub inner_html: Option<String>,
}

impl OffscreenNode {
    fn with_tag(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            ..Self::default()
        }
    }
}

/// Per-tree "will flush" flag: at most one pending flush at a time.
#[derive(Debug, Default, Clone, Copy)]
pub struct Batcher {
    will_flush: bool,
}

impl Batcher {
    /// Returns `true` only for the request that actually scheduled a flush.
    pub fn request(&mut self) -> bool {
        !std::mem::replace(&mut self.will_flush, true)
    }

    pub fn is_scheduled(&self) -> bool {
        self.will_flush
    }

    fn reset(&mut self) {
        self.will_flush = false;
    }
}

pub struct OffscreenTree {
    root: OffscreenNode,
    nodes: HandleTable<OffscreenNode>,
    operations: Vec<ElementOperation>,
    batcher: Batcher,
    on_commit: Option<CommitCallback>,
    listeners: HashMap<Handle, Vec<Registration>>,
}

impl Default for OffscreenTree {
    fn default() -> Self {
        Self {
            root: OffscreenNode::with_tag("#root"),
            nodes: HandleTable::new(),
            operations: Vec::new(),
            batcher: Batcher::default(),
            on_commit: None,
            listeners: HashMap::new(),
        }
    }
}

impl OffscreenTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_on_commit<F>(on_commit: F) -> Self
    where
        F: FnMut(&[ElementOperation]) + 'static,
    {
        let mut tree = Self::new();
        tree.set_on_commit(on_commit);
        tree
    }

    pub fn set_on_commit<F>(&mut self, on_commit: F)
    where
        F: FnMut(&[ElementOperation]) + 'static,
    {
        self.on_commit = Some(Box::new(on_commit));
    }

    pub fn create_node(&mut self, tag: &str) -> Handle {
        let uid = self.nodes.add(OffscreenNode::with_tag(tag));
        self.record(ElementOperation::Create {
            uid,
            tag: tag.to_string(),
        });
        uid
    }

    pub fn append(&mut self, parent: Handle, children: &[Handle]) -> Result<(), TreeError> {
        self.node(parent)?;
        for child in children {
            self.check_insertable(parent, *child)?;
        }

        self.record(ElementOperation::Append {
            uid: parent,
            cid: children.to_vec(),
        });
        for child in children {
            self.detach(*child);
            self.attach(parent, *child, None);
        }
        Ok(())
    }

    pub fn insert_before(
        &mut self,
        parent: Handle,
        child: Handle,
        reference: Option<Handle>,
    ) -> Result<(), TreeError> {
        self.node(parent)?;
        self.check_insertable(parent, child)?;
        if let Some(reference) = reference {
            if self.node(reference)?.parent != Some(parent) {
                return Err(TreeError::NotAChild {
                    parent,
                    child: reference,
                });
            }
        }

        self.record(ElementOperation::InsertBefore {
            uid: parent,
            cid: child,
            reference,
        });

        match reference {
            Some(reference) if reference == child => {}
            Some(reference) => {
                self.detach(child);
                let index = self.position(parent, reference).unwrap_or(0);
                self.attach(parent, child, Some(index));
            }
            None => {
                self.detach(child);
                self.attach(parent, child, None);
            }
        }
        Ok(())
    }

    /// Detaches `uid` from its parent. Detached nodes record nothing.
    pub fn remove(&mut self, uid: Handle) -> Result<(), TreeError> {
        if self.node(uid)?.parent.is_some() {
            self.record(ElementOperation::Remove { uid });
            self.detach(uid);
        }
        Ok(())
    }

    pub fn remove_child(&mut self, parent: Handle, child: Handle) -> Result<(), TreeError> {
        self.node(parent)?;
        if self.node(child)?.parent != Some(parent) {
            return Err(TreeError::NotAChild { parent, child });
        }
        self.record(ElementOperation::RemoveChild {
            uid: parent,
            cid: child,
        });
        self.detach(child);
        Ok(())
    }

    pub fn replace_with(&mut self, old: Handle, new_nodes: &[Handle]) -> Result<(), TreeError> {
        let parent = self.node(old)?.parent;
        for new_node in new_nodes {
            match parent {
                Some(parent) if *new_node != old => self.check_insertable(parent, *new_node)?,
                _ => {
                    self.node(*new_node)?;
                }
            }
        }

        self.record(ElementOperation::ReplaceWith {
            uid: old,
            nid: new_nodes.to_vec(),
        });

        let Some(parent) = parent else {
            return Ok(());
        };
        for new_node in new_nodes {
            if *new_node != old {
                self.detach(*new_node);
            }
        }
        let index = self.position(parent, old).unwrap_or(0);
        self.node_mut(parent)?
            .children
            .splice(index..=index, new_nodes.iter().copied());
        self.node_mut(old)?.parent = None;
        for new_node in new_nodes {
            self.node_mut(*new_node)?.parent = Some(parent);
        }
        Ok(())
    }

    pub fn set_attribute(&mut self, uid: Handle, key: &str, value: &str) -> Result<(), TreeError> {
        self.node_mut(uid)?
            .attributes
            .insert(key.to_string(), value.to_string());
        self.record(ElementOperation::SetAttribute {
            uid,
            key: key.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    pub fn remove_attribute(&mut self, uid: Handle, key: &str) -> Result<(), TreeError> {
        self.node_mut(uid)?.attributes.remove(key);
        self.record(ElementOperation::RemoveAttribute {
            uid,
            key: key.to_string(),
        });
        Ok(())
    }

    pub fn set_style_property(
        &mut self,
        uid: Handle,
        property: &str,
        value: &str,
        priority: Option<&str>,
    ) -> Result<(), TreeError> {
        let priority = priority.filter(|p| !p.is_empty()).map(str::to_string);
        self.node_mut(uid)?.style.insert(
            property.to_string(),
            StyleValue {
                value: value.to_string(),
                priority: priority.clone(),
            },
        );
        self.record(ElementOperation::StyleDeclarationSetProperty {
            uid,
            property: property.to_string(),
            value: value.to_string(),
            priority,
        });
        Ok(())
    }

    pub fn remove_style_property(&mut self, uid: Handle, property: &str) -> Result<(), TreeError> {
        self.node_mut(uid)?.style.remove(property);
        self.record(ElementOperation::StyleDeclarationRemoveProperty {
            uid,
            property: property.to_string(),
        });
        Ok(())
    }

    /// Marks `event_type` as observed on `uid`. Only the first call per
    /// node and type is recorded.
    pub fn enable_event(&mut self, uid: Handle, event_type: &str) -> Result<(), TreeError> {
        if self.node_mut(uid)?.enabled_events.insert(event_type.to_string()) {
            self.record(ElementOperation::EnableEvent {
                uid,
                event_type: event_type.to_string(),
            });
        }
        Ok(())
    }

    pub fn set_inner_html(&mut self, uid: Handle, text: &str) -> Result<(), TreeError> {
        let children = std::mem::take(&mut self.node_mut(uid)?.children);
        for child in children {
            if let Some(node) = self.nodes.get_mut(child) {
                node.parent = None;
            }
        }
        self.node_mut(uid)?.inner_html = Some(text.to_string());
        self.record(ElementOperation::SetInnerHtml {
            uid,
            text: text.to_string(),
        });
        Ok(())
    }

    pub fn add_event_listener<F>(
        &mut self,
        uid: Handle,
        event_type: &str,
        capture: bool,
        listener: F,
    ) -> Result<(), TreeError>
    where
        F: Fn(&mut OffscreenEvent) + 'static,
    {
        self.enable_event(uid, event_type)?;
        self.listeners.entry(uid).or_default().push(Registration {
            event_type: event_type.to_string(),
            capture,
            listener: Rc::new(listener),
        });
        Ok(())
    }

    /// Detaches `uid` and releases its handle for reuse. Its children stay
    /// alive, each detached with its own `Remove` so replicas never keep
    /// them under a released handle.
    pub fn dispose(&mut self, uid: Handle) -> Result<(), TreeError> {
        if uid == ROOT_HANDLE {
            return Err(TreeError::HandleNotFound(uid));
        }
        self.remove(uid)?;
        for child in self.children(uid).to_vec() {
            self.remove(child)?;
        }
        self.listeners.remove(&uid);
        self.nodes.remove(uid);
        Ok(())
    }

    /// Swaps out the buffered operations, hands them to `on_commit` and
    /// returns them.
    pub fn commit(&mut self) -> Vec<ElementOperation> {
        self.batcher.reset();
        let operations = std::mem::take(&mut self.operations);
        if let Some(on_commit) = self.on_commit.as_mut() {
            on_commit(&operations);
        }
        operations
    }

    /// Commits only if a mutation scheduled a flush since the last commit.
    /// Call at the end of every turn of the owning thread's loop.
    pub fn flush_scheduled(&mut self) -> Option<Vec<ElementOperation>> {
        if self.batcher.is_scheduled() {
            Some(self.commit())
        } else {
            None
        }
    }

    pub fn pending_operations(&self) -> &[ElementOperation] {
        &self.operations
    }

    pub fn batcher(&self) -> &Batcher {
        &self.batcher
    }

    /// Three-phase dispatch: capture from the root down to the target's
    /// parent, the target itself, then bubbling back up when `bubbles`.
    ///
    /// An unknown target is ignored; the node may already be disposed.
    pub fn dispatch_event(
        &self,
        target: Handle,
        event_type: &str,
        bubbles: bool,
        detail: Value,
    ) -> Option<OffscreenEvent> {
        if self.node(target).is_err() {
            debug!(target, event_type, "dropping event for unknown handle");
            return None;
        }

        let mut ancestors = Vec::new();
        let mut cursor = self.parent(target);
        while let Some(ancestor) = cursor {
            ancestors.push(ancestor);
            cursor = self.parent(ancestor);
        }

        let mut event = OffscreenEvent::new(event_type, target, bubbles, detail);

        event.phase = EventPhase::Capturing;
        for ancestor in ancestors.iter().rev() {
            if self.invoke_listeners(*ancestor, &mut event) {
                return Some(event);
            }
        }

        event.phase = EventPhase::AtTarget;
        if self.invoke_listeners(target, &mut event) {
            return Some(event);
        }

        if bubbles {
            event.phase = EventPhase::Bubbling;
            for ancestor in &ancestors {
                if self.invoke_listeners(*ancestor, &mut event) {
                    return Some(event);
                }
            }
        }

        Some(event)
    }

    /// Returns `true` once a listener stopped propagation.
    fn invoke_listeners(&self, uid: Handle, event: &mut OffscreenEvent) -> bool {
        let Some(registrations) = self.listeners.get(&uid) else {
            return false;
        };
        let listeners: Vec<Listener> = registrations
            .iter()
            .filter(|registration| registration.fires_in(&event.event_type, event.phase))
            .map(|registration| registration.listener.clone())
            .collect();

        event.current_target = uid;
        for listener in listeners {
            listener(event);
            if event.propagation_stopped() {
                return true;
            }
        }
        false
    }

    pub fn contains(&self, uid: Handle) -> bool {
        self.node(uid).is_ok()
    }

    pub fn get(&self, uid: Handle) -> Option<&OffscreenNode> {
        self.node(uid).ok()
    }

    pub fn parent(&self, uid: Handle) -> Option<Handle> {
        self.node(uid).ok().and_then(|node| node.parent)
    }

    pub fn children(&self, uid: Handle) -> &[Handle] {
        self.node(uid)
            .map(|node| node.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn attribute(&self, uid: Handle, key: &str) -> Option<&str> {
        self.node(uid)
            .ok()
            .and_then(|node| node.attributes.get(key))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn snapshot(&self) -> TreeSnapshot {
        self.snapshot_from(ROOT_HANDLE)
    }

    fn snapshot_from(&self, uid: Handle) -> TreeSnapshot {
        let node = self.node(uid).unwrap_or(&self.root);
        TreeSnapshot {
            uid,
            tag: node.tag.clone(),
            attributes: node.attributes.clone(),
            style: node.style.clone(),
            events: node.enabled_events.clone(),
            inner_html: node.inner_html.clone(),
            children: node
                .children
                .iter()
                .map(|child| self.snapshot_from(*child))
                .collect(),
        }
    }

    fn record(&mut self, op: ElementOperation) {
        self.operations.push(op);
        self.batcher.request();
    }

    fn check_insertable(&self, parent: Handle, child: Handle) -> Result<(), TreeError> {
        if child == ROOT_HANDLE {
            return Err(TreeError::Cycle { parent, child });
        }
        self.node(child)?;

        let mut cursor = Some(parent);
        while let Some(ancestor) = cursor {
            if ancestor == child {
                return Err(TreeError::Cycle { parent, child });
            }
            cursor = self.parent(ancestor);
        }
        Ok(())
    }

    fn attach(&mut self, parent: Handle, child: Handle, index: Option<usize>) {
        if let Ok(node) = self.node_mut(parent) {
            match index {
                Some(index) => node.children.insert(index, child),
                None => node.children.push(child),
            }
        }
        if let Some(node) = self.nodes.get_mut(child) {
            node.parent = Some(parent);
        }
    }

    fn detach(&mut self, uid: Handle) {
        let Some(parent) = self.nodes.get_mut(uid).and_then(|node| node.parent.take()) else {
            return;
        };
        if let Ok(node) = self.node_mut(parent) {
            node.children.retain(|child| *child != uid);
        }
    }

    fn position(&self, parent: Handle, child: Handle) -> Option<usize> {
        self.node(parent)
            .ok()?
            .children
            .iter()
            .position(|candidate| *candidate == child)
    }

    fn node(&self, uid: Handle) -> Result<&OffscreenNode, TreeError> {
        if uid == ROOT_HANDLE {
            return Ok(&self.root);
        }
        self.nodes.get(uid).ok_or(TreeError::HandleNotFound(uid))
    }

    fn node_mut(&mut self, uid: Handle) -> Result<&mut OffscreenNode, TreeError> {
        if uid == ROOT_HANDLE {
            return Ok(&mut self.root);
        }
        self.nodes.get_mut(uid).ok_or(TreeError::HandleNotFound(uid))
    }
}
