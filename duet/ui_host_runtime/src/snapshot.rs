//! Background-side model of the rendered tree.
//!
//! A snapshot instance is one node of a registered [`SnapshotKind`]: a small
//! element template whose dynamic parts are addressed by value index. Once an
//! instance is mounted its elements exist in the [`OffscreenTree`], and
//! changing a value re-emits operations for that index only.

use crate::attributes::AttributeHandlers;
use crate::error::SnapshotError;
use crate::handle_table::Handle;
use crate::hydration::{SnapshotId, ref_attribute};
use crate::offscreen::OffscreenTree;
use crate::operation::ElementOperation;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct ElementTemplate {
    pub tag: String,
    /// Index of the parent template element; `None` only for the root.
    pub parent: Option<usize>,
    pub static_attributes: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    /// Value drives attribute `name` of template element `element`.
    Attribute { element: usize, name: String },
    /// Value is a ref: the element gets a `react-ref-*` marker attribute.
    Ref { element: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotKind {
    pub name: String,
    pub elements: Vec<ElementTemplate>,
    pub bindings: Vec<Binding>,
    /// Template element that receives child instances.
    pub children_slot: Option<usize>,
}

impl SnapshotKind {
    pub fn new(name: impl Into<String>, root_tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            elements: vec![ElementTemplate {
                tag: root_tag.into(),
                parent: None,
                static_attributes: Vec::new(),
            }],
            bindings: Vec::new(),
            children_slot: None,
        }
    }

    /// Adds a template element under `parent` and returns its index.
    pub fn element(mut self, tag: impl Into<String>, parent: usize) -> Self {
        self.elements.push(ElementTemplate {
            tag: tag.into(),
            parent: Some(parent),
            static_attributes: Vec::new(),
        });
        self
    }

    pub fn static_attribute(
        mut self,
        element: usize,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        if let Some(template) = self.elements.get_mut(element) {
            template.static_attributes.push((name.into(), value.into()));
        }
        self
    }

    pub fn attribute(mut self, element: usize, name: impl Into<String>) -> Self {
        self.bindings.push(Binding::Attribute {
            element,
            name: name.into(),
        });
        self
    }

    pub fn reference(mut self, element: usize) -> Self {
        self.bindings.push(Binding::Ref { element });
        self
    }

    pub fn children_at(mut self, element: usize) -> Self {
        self.children_slot = Some(element);
        self
    }
}

#[derive(Debug, Default)]
pub struct SnapshotRegistry {
    kinds: HashMap<String, Rc<SnapshotKind>>,
}

impl SnapshotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering a name again replaces the kind for future instances.
    pub fn register(&mut self, kind: SnapshotKind) {
        self.kinds.insert(kind.name.clone(), Rc::new(kind));
    }

    pub fn get(&self, name: &str) -> Option<Rc<SnapshotKind>> {
        self.kinds.get(name).cloned()
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotInstance {
    pub id: SnapshotId,
    pub kind: Rc<SnapshotKind>,
    pub values: Vec<Value>,
    pub parent: Option<SnapshotId>,
    pub children: Vec<SnapshotId>,
    elements: Option<Vec<Handle>>,
}

impl SnapshotInstance {
    pub fn elements(&self) -> Option<&[Handle]> {
        self.elements.as_deref()
    }

    pub fn root_element(&self) -> Option<Handle> {
        self.elements.as_ref().and_then(|elements| elements.first().copied())
    }

    fn slot_element(&self) -> Option<Handle> {
        let slot = self.kind.children_slot?;
        self.elements.as_ref()?.get(slot).copied()
    }
}

/// Wire form of an instance subtree, as prerendered on the main thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedSnapshot {
    pub id: SnapshotId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<SerializedSnapshot>,
}

pub struct SnapshotTree {
    registry: SnapshotRegistry,
    handlers: AttributeHandlers,
    instances: HashMap<SnapshotId, SnapshotInstance>,
    next_id: SnapshotId,
    offscreen: OffscreenTree,
}

impl SnapshotTree {
    pub fn new(registry: SnapshotRegistry) -> Self {
        Self::with_handlers(registry, AttributeHandlers::default())
    }

    pub fn with_handlers(registry: SnapshotRegistry, handlers: AttributeHandlers) -> Self {
        Self {
            registry,
            handlers,
            instances: HashMap::new(),
            next_id: 0,
            offscreen: OffscreenTree::new(),
        }
    }

    pub fn registry_mut(&mut self) -> &mut SnapshotRegistry {
        &mut self.registry
    }

    pub fn offscreen(&self) -> &OffscreenTree {
        &self.offscreen
    }

    pub fn offscreen_mut(&mut self) -> &mut OffscreenTree {
        &mut self.offscreen
    }

    /// Operations recorded since the last commit.
    pub fn commit(&mut self) -> Vec<ElementOperation> {
        self.offscreen.commit()
    }

    pub fn get(&self, id: SnapshotId) -> Option<&SnapshotInstance> {
        self.instances.get(&id)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn create(&mut self, kind: &str) -> Result<SnapshotId, SnapshotError> {
        let kind = self
            .registry
            .get(kind)
            .ok_or_else(|| SnapshotError::UnknownKind(kind.to_string()))?;
        self.next_id += 1;
        let id = self.next_id;
        self.instances.insert(
            id,
            SnapshotInstance {
                id,
                kind,
                values: Vec::new(),
                parent: None,
                children: Vec::new(),
                elements: None,
            },
        );
        Ok(id)
    }

    /// Replaces the value array. Returns the indices whose value changed;
    /// for a mounted instance only those are re-emitted.
    pub fn set_values(
        &mut self,
        id: SnapshotId,
        values: Vec<Value>,
    ) -> Result<Vec<usize>, SnapshotError> {
        let instance = self.instance_mut(id)?;
        let old = std::mem::replace(&mut instance.values, values);
        let len = old.len().max(instance.values.len());
        let changed: Vec<usize> = (0..len)
            .filter(|index| old.get(*index) != instance.values.get(*index))
            .collect();

        if instance.elements.is_some() {
            for index in &changed {
                self.apply_binding(id, *index, old.get(*index))?;
            }
        }
        Ok(changed)
    }

    pub fn set_value(
        &mut self,
        id: SnapshotId,
        index: usize,
        value: Value,
    ) -> Result<bool, SnapshotError> {
        let mut values = self.instance(id)?.values.clone();
        if values.len() <= index {
            values.resize(index + 1, Value::Null);
        }
        values[index] = value;
        Ok(!self.set_values(id, values)?.is_empty())
    }

    /// Moves `child` under `parent`, before `before` or at the end.
    ///
    /// Nothing changes when the move is rejected.
    pub fn insert_before(
        &mut self,
        parent: SnapshotId,
        child: SnapshotId,
        before: Option<SnapshotId>,
    ) -> Result<(), SnapshotError> {
        let parent_node = self.instance(parent)?;
        let slot = parent_node.slot_element();
        if slot.is_none() && parent_node.elements.is_some() {
            return Err(SnapshotError::NoChildrenSlot(parent));
        }
        self.instance(child)?;
        if self.is_ancestor_or_self(child, parent) {
            return Err(SnapshotError::Cycle { parent, child });
        }
        if let Some(before) = before {
            if self.instance(before)?.parent != Some(parent) {
                return Err(SnapshotError::NotAChild {
                    parent,
                    child: before,
                });
            }
            if before == child {
                return Ok(());
            }
        }

        let roots = match slot {
            Some(slot) => {
                self.ensure_elements(child)?;
                let before_root = match before {
                    Some(before) => Some(self.root_of(before)?),
                    None => None,
                };
                Some((slot, self.root_of(child)?, before_root))
            }
            None => None,
        };

        if let Some(old_parent) = self.instance(child)?.parent {
            self.detach(old_parent, child)?;
        }

        let parent_node = self.instance_mut(parent)?;
        let position = before
            .and_then(|before| parent_node.children.iter().position(|id| *id == before))
            .unwrap_or(parent_node.children.len());
        parent_node.children.insert(position, child);
        self.instance_mut(child)?.parent = Some(parent);

        if let Some((slot, child_root, before_root)) = roots {
            self.offscreen.insert_before(slot, child_root, before_root)?;
        }
        Ok(())
    }

    /// Detaches `child` and unmounts its subtree: every instance in it is
    /// dropped and its element handles are released. Returns the dropped ids.
    pub fn remove_child(
        &mut self,
        parent: SnapshotId,
        child: SnapshotId,
    ) -> Result<Vec<SnapshotId>, SnapshotError> {
        if self.instance(child)?.parent != Some(parent) {
            return Err(SnapshotError::NotAChild { parent, child });
        }
        self.detach(parent, child)?;

        let mut removed = Vec::new();
        let mut stack = vec![child];
        while let Some(id) = stack.pop() {
            let Some(instance) = self.instances.remove(&id) else {
                continue;
            };
            stack.extend(instance.children.iter().rev().copied());
            for element in instance.elements.into_iter().flatten() {
                self.offscreen.dispose(element)?;
            }
            removed.push(id);
        }
        debug!(root = child, count = removed.len(), "unmounted snapshot subtree");
        Ok(removed)
    }

    /// Creates the elements of `id` and its subtree and appends its root to
    /// `parent_element`.
    pub fn mount(&mut self, id: SnapshotId, parent_element: Handle) -> Result<(), SnapshotError> {
        self.ensure_elements(id)?;
        let root = self.root_of(id)?;
        self.offscreen.append(parent_element, &[root])?;
        Ok(())
    }

    /// Pairs this subtree with the prerendered one, node by node, while
    /// kinds agree. The result maps local ids to prerendered ids.
    pub fn hydrate(
        &self,
        id: SnapshotId,
        prerendered: &SerializedSnapshot,
    ) -> Result<HashMap<SnapshotId, SnapshotId>, SnapshotError> {
        let mut map = HashMap::new();
        let mut stack = vec![(id, prerendered)];
        while let Some((id, prerendered)) = stack.pop() {
            let instance = self.instance(id)?;
            if instance.kind.name != prerendered.kind {
                debug!(id, expected = %prerendered.kind, "hydration kind mismatch");
                continue;
            }
            map.insert(id, prerendered.id);
            stack.extend(instance.children.iter().copied().zip(&prerendered.children));
        }
        Ok(map)
    }

    pub fn serialize(&self, id: SnapshotId) -> Result<SerializedSnapshot, SnapshotError> {
        let instance = self.instance(id)?;
        Ok(SerializedSnapshot {
            id,
            kind: instance.kind.name.clone(),
            values: instance.values.clone(),
            children: instance
                .children
                .iter()
                .map(|child| self.serialize(*child))
                .collect::<Result<_, _>>()?,
        })
    }

    fn ensure_elements(&mut self, id: SnapshotId) -> Result<(), SnapshotError> {
        if self.instance(id)?.elements.is_some() {
            return Ok(());
        }

        let kind = self.instance(id)?.kind.clone();
        let mut elements: Vec<Handle> = Vec::with_capacity(kind.elements.len());
        for template in &kind.elements {
            let element = self.offscreen.create_node(&template.tag);
            for (name, value) in &template.static_attributes {
                self.offscreen.set_attribute(element, name, value)?;
            }
            if let Some(parent) = template.parent.and_then(|parent| elements.get(parent)) {
                self.offscreen.append(*parent, &[element])?;
            }
            elements.push(element);
        }
        self.instance_mut(id)?.elements = Some(elements);

        for index in 0..kind.bindings.len() {
            self.apply_binding(id, index, None)?;
        }

        let children = self.instance(id)?.children.clone();
        if children.is_empty() {
            return Ok(());
        }
        let slot = self
            .instance(id)?
            .slot_element()
            .ok_or(SnapshotError::NoChildrenSlot(id))?;
        for child in children {
            self.ensure_elements(child)?;
            let root = self.root_of(child)?;
            self.offscreen.append(slot, &[root])?;
        }
        Ok(())
    }

    fn apply_binding(
        &mut self,
        id: SnapshotId,
        index: usize,
        old: Option<&Value>,
    ) -> Result<(), SnapshotError> {
        let instance = self.instance(id)?;
        let Some(binding) = instance.kind.bindings.get(index).cloned() else {
            return Ok(());
        };
        let new = instance.values.get(index).cloned();
        let Some(elements) = instance.elements.as_ref() else {
            return Ok(());
        };

        match binding {
            Binding::Attribute { element, name } => {
                let Some(element) = elements.get(element).copied() else {
                    return Ok(());
                };
                self.handlers
                    .apply(&mut self.offscreen, element, &name, old, new.as_ref())?;
            }
            Binding::Ref { element } => {
                let Some(element) = elements.get(element).copied() else {
                    return Ok(());
                };
                let marker = |value: Option<&Value>| match value {
                    None | Some(Value::Null) => None,
                    Some(Value::String(name)) => Some(name.clone()),
                    Some(_) => Some(ref_attribute(id, index)),
                };
                let (old_marker, new_marker) = (marker(old), marker(new.as_ref()));
                if old_marker == new_marker {
                    return Ok(());
                }
                if let Some(old_marker) = old_marker {
                    self.offscreen.remove_attribute(element, &old_marker)?;
                }
                if let Some(new_marker) = new_marker {
                    self.offscreen.set_attribute(element, &new_marker, "1")?;
                }
            }
        }
        Ok(())
    }

    fn detach(&mut self, parent: SnapshotId, child: SnapshotId) -> Result<(), SnapshotError> {
        self.instance_mut(parent)?.children.retain(|id| *id != child);
        self.instance_mut(child)?.parent = None;

        let parent_slot = self.instance(parent)?.slot_element();
        let child_root = self.instance(child)?.root_element();
        if let (Some(slot), Some(root)) = (parent_slot, child_root) {
            self.offscreen.remove_child(slot, root)?;
        }
        Ok(())
    }

    /// Whether `ancestor` is `id` or lies on its parent chain.
    fn is_ancestor_or_self(&self, ancestor: SnapshotId, id: SnapshotId) -> bool {
        let mut current = Some(id);
        while let Some(node) = current {
            if node == ancestor {
                return true;
            }
            current = self.instances.get(&node).and_then(|instance| instance.parent);
        }
        false
    }

    fn root_of(&self, id: SnapshotId) -> Result<Handle, SnapshotError> {
        self.instance(id)?
            .root_element()
            .ok_or(SnapshotError::NotFound(id))
    }

    fn instance(&self, id: SnapshotId) -> Result<&SnapshotInstance, SnapshotError> {
        self.instances.get(&id).ok_or(SnapshotError::NotFound(id))
    }

    fn instance_mut(&mut self, id: SnapshotId) -> Result<&mut SnapshotInstance, SnapshotError> {
        self.instances.get_mut(&id).ok_or(SnapshotError::NotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::ROOT_HANDLE;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn registry() -> SnapshotRegistry {
        let mut registry = SnapshotRegistry::new();
        registry.register(
            SnapshotKind::new("card", "view")
                .element("text", 0)
                .static_attribute(1, "class", "title")
                .attribute(1, "text")
                .attribute(0, "style")
                .reference(0)
                .children_at(0),
        );
        registry.register(SnapshotKind::new("leaf", "image").attribute(0, "src"));
        registry
    }

    #[test]
    fn mount_emits_template_then_values() {
        let mut tree = SnapshotTree::new(registry());
        let card = tree.create("card").expect("create");
        tree.set_values(card, vec![json!("hello"), json!({"color": "red"}), json!(true)])
            .expect("values");
        tree.mount(card, ROOT_HANDLE).expect("mount");

        let ops = tree.commit();
        let names: Vec<&str> = ops.iter().map(ElementOperation::name).collect();
        assert_eq!(
            names,
            vec![
                "Create",
                "Create",
                "SetAttribute",
                "Append",
                "SetAttribute",
                "StyleDeclarationSetProperty",
                "SetAttribute",
                "Append",
            ]
        );
        let root = tree.get(card).and_then(SnapshotInstance::root_element).expect("root");
        assert_eq!(tree.offscreen().attribute(root, "react-ref-1-2"), Some("1"));
    }

    #[test]
    fn only_changed_indices_are_re_emitted() {
        let mut tree = SnapshotTree::new(registry());
        let card = tree.create("card").expect("create");
        tree.set_values(card, vec![json!("a"), json!(null), json!(null)])
            .expect("values");
        tree.mount(card, ROOT_HANDLE).expect("mount");
        tree.commit();

        let changed = tree
            .set_values(card, vec![json!("b"), json!(null), json!(null)])
            .expect("update");
        assert_eq!(changed, vec![0]);

        let text = tree.get(card).and_then(|i| i.elements()).expect("elements")[1];
        assert_eq!(
            tree.commit(),
            vec![ElementOperation::SetAttribute {
                uid: text,
                key: "text".into(),
                value: "b".into()
            }]
        );
    }

    #[test]
    fn unmounted_instances_emit_nothing_until_mounted() {
        let mut tree = SnapshotTree::new(registry());
        let card = tree.create("card").expect("create");
        let leaf = tree.create("leaf").expect("create");
        tree.insert_before(card, leaf, None).expect("insert");
        tree.set_value(leaf, 0, json!("a.png")).expect("value");
        assert!(tree.commit().is_empty());

        tree.mount(card, ROOT_HANDLE).expect("mount");
        let leaf_root = tree.get(leaf).and_then(SnapshotInstance::root_element).expect("leaf root");
        assert_eq!(tree.offscreen().attribute(leaf_root, "src"), Some("a.png"));
    }

    #[test]
    fn insert_before_orders_children_and_elements() {
        let mut tree = SnapshotTree::new(registry());
        let card = tree.create("card").expect("create");
        tree.mount(card, ROOT_HANDLE).expect("mount");
        let first = tree.create("leaf").expect("create");
        let second = tree.create("leaf").expect("create");
        tree.insert_before(card, first, None).expect("append");
        tree.insert_before(card, second, Some(first)).expect("insert");

        assert_eq!(tree.get(card).map(|i| i.children.clone()), Some(vec![second, first]));
        let card_root = tree.get(card).and_then(SnapshotInstance::root_element).expect("root");
        let roots: Vec<Handle> = [second, first]
            .iter()
            .filter_map(|id| tree.get(*id).and_then(SnapshotInstance::root_element))
            .collect();
        assert_eq!(&tree.offscreen().children(card_root)[1..], roots.as_slice());
    }

    fn links(tree: &SnapshotTree, id: SnapshotId) -> (Option<SnapshotId>, Vec<SnapshotId>) {
        let instance = tree.get(id).expect("instance");
        (instance.parent, instance.children.clone())
    }

    #[test]
    fn insert_before_rejects_cycles_between_unmounted_instances() {
        let mut tree = SnapshotTree::new(registry());
        let outer = tree.create("card").expect("create");
        let inner = tree.create("card").expect("create");
        tree.insert_before(outer, inner, None).expect("insert");

        assert_eq!(
            tree.insert_before(inner, outer, None),
            Err(SnapshotError::Cycle {
                parent: inner,
                child: outer
            })
        );
        assert_eq!(
            tree.insert_before(inner, inner, None),
            Err(SnapshotError::Cycle {
                parent: inner,
                child: inner
            })
        );
        assert_eq!(links(&tree, outer), (None, vec![inner]));
        assert_eq!(links(&tree, inner), (Some(outer), Vec::new()));
        assert!(tree.serialize(outer).is_ok());
    }

    #[test]
    fn rejected_cycle_leaves_mounted_tree_untouched() {
        let mut tree = SnapshotTree::new(registry());
        let outer = tree.create("card").expect("create");
        let inner = tree.create("card").expect("create");
        tree.insert_before(outer, inner, None).expect("insert");
        tree.mount(outer, ROOT_HANDLE).expect("mount");
        tree.commit();

        assert!(matches!(
            tree.insert_before(inner, outer, None),
            Err(SnapshotError::Cycle { .. })
        ));
        assert_eq!(links(&tree, outer), (None, vec![inner]));
        assert_eq!(links(&tree, inner), (Some(outer), Vec::new()));
        assert!(tree.commit().is_empty());
    }

    #[test]
    fn inserting_a_child_before_itself_is_a_no_op() {
        let mut tree = SnapshotTree::new(registry());
        let card = tree.create("card").expect("create");
        tree.mount(card, ROOT_HANDLE).expect("mount");
        let first = tree.create("leaf").expect("create");
        let second = tree.create("leaf").expect("create");
        tree.insert_before(card, first, None).expect("append");
        tree.insert_before(card, second, None).expect("append");
        tree.commit();

        tree.insert_before(card, first, Some(first)).expect("no-op");
        assert_eq!(links(&tree, card).1, vec![first, second]);
        assert_eq!(links(&tree, first).0, Some(card));
        assert!(tree.commit().is_empty());
    }

    #[test]
    fn remove_child_unmounts_and_releases_handles() {
        let mut tree = SnapshotTree::new(registry());
        let card = tree.create("card").expect("create");
        let inner = tree.create("card").expect("create");
        let leaf = tree.create("leaf").expect("create");
        tree.insert_before(inner, leaf, None).expect("insert");
        tree.insert_before(card, inner, None).expect("insert");
        tree.mount(card, ROOT_HANDLE).expect("mount");
        let live_before = tree.offscreen().len();

        let removed = tree.remove_child(card, inner).expect("remove");
        assert_eq!(removed, vec![inner, leaf]);
        assert!(tree.get(leaf).is_none());
        assert_eq!(tree.offscreen().len(), live_before - 3);

        assert_eq!(
            tree.remove_child(card, inner),
            Err(SnapshotError::NotFound(inner))
        );
    }

    #[test]
    fn hydrate_maps_matching_nodes_only() {
        let mut tree = SnapshotTree::new(registry());
        let card = tree.create("card").expect("create");
        let leaf = tree.create("leaf").expect("create");
        let other = tree.create("card").expect("create");
        tree.insert_before(card, leaf, None).expect("insert");
        tree.insert_before(card, other, None).expect("insert");

        let prerendered: SerializedSnapshot = serde_json::from_value(json!({
            "id": -1,
            "type": "card",
            "children": [
                {"id": -2, "type": "leaf"},
                {"id": -3, "type": "leaf"}
            ]
        }))
        .expect("decode");

        let map = tree.hydrate(card, &prerendered).expect("hydrate");
        assert_eq!(map, HashMap::from([(card, -1), (leaf, -2)]));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut tree = SnapshotTree::new(registry());
        assert_eq!(
            tree.create("missing"),
            Err(SnapshotError::UnknownKind("missing".into()))
        );
    }

    #[test]
    fn serialize_round_trips_structure() {
        let mut tree = SnapshotTree::new(registry());
        let card = tree.create("card").expect("create");
        let leaf = tree.create("leaf").expect("create");
        tree.insert_before(card, leaf, None).expect("insert");
        tree.set_value(leaf, 0, json!("x.png")).expect("value");

        let encoded = serde_json::to_value(tree.serialize(card).expect("serialize")).expect("json");
        assert_eq!(
            encoded,
            json!({"id": 1, "type": "card", "children": [{"id": 2, "type": "leaf", "values": ["x.png"]}]})
        );
    }
}
