use super::WorkletRefId;
use crate::handle_table::Handle;
use serde_json::{Value, json};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct WorkletRef {
    pub id: WorkletRefId,
    pub current: Value,
    pub init: Value,
}

/// Main-thread storage of mutable refs shared with worklets.
#[derive(Debug, Default)]
pub struct WorkletRefMap {
    refs: BTreeMap<WorkletRefId, WorkletRef>,
}

impl WorkletRefMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates refs announced by a batch. Ids that already exist keep their
    /// current value.
    pub fn update_init_value_changes(&mut self, patch: &[(WorkletRefId, Value)]) {
        for (id, init) in patch {
            self.refs.entry(*id).or_insert_with(|| WorkletRef {
                id: *id,
                current: init.clone(),
                init: init.clone(),
            });
        }
    }

    pub fn get(&self, id: WorkletRefId) -> Option<&WorkletRef> {
        self.refs.get(&id)
    }

    pub fn set_current(&mut self, id: WorkletRefId, value: Value) -> bool {
        match self.refs.get_mut(&id) {
            Some(slot) => {
                slot.current = value;
                true
            }
            None => false,
        }
    }

    /// Points the ref at `element`, or clears it.
    pub fn update_element(&mut self, id: WorkletRefId, element: Option<Handle>) -> bool {
        let value = match element {
            Some(handle) => json!({ "elementRefptr": handle }),
            None => Value::Null,
        };
        self.set_current(id, value)
    }

    pub fn remove(&mut self, id: WorkletRefId) -> Option<WorkletRef> {
        self.refs.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

/// Background-side allocator of ref ids.
///
/// Initial values of refs created since the last commit are shipped with the
/// next operation batch.
#[derive(Debug, Default)]
pub struct WorkletRefPool {
    last_id: WorkletRefId,
    init_patch: Vec<(WorkletRefId, Value)>,
}

impl WorkletRefPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, init: Value) -> WorkletRefId {
        self.last_id += 1;
        let id = self.last_id;
        self.init_patch.push((id, init));
        id
    }

    pub fn take_init_patch(&mut self) -> Vec<(WorkletRefId, Value)> {
        std::mem::take(&mut self.init_patch)
    }
}
