use crate::handle_table::Handle;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One mutation of the remote element tree.
///
/// A log of these is only meaningful when replayed in emission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ElementOperation {
    Create {
        uid: Handle,
        tag: String,
    },
    SetAttribute {
        uid: Handle,
        key: String,
        value: String,
    },
    RemoveAttribute {
        uid: Handle,
        key: String,
    },
    Append {
        uid: Handle,
        cid: Vec<Handle>,
    },
    Remove {
        uid: Handle,
    },
    ReplaceWith {
        uid: Handle,
        nid: Vec<Handle>,
    },
    InsertBefore {
        uid: Handle,
        cid: Handle,
        #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
        reference: Option<Handle>,
    },
    EnableEvent {
        uid: Handle,
        #[serde(rename = "eventType")]
        event_type: String,
    },
    RemoveChild {
        uid: Handle,
        cid: Handle,
    },
    StyleDeclarationSetProperty {
        uid: Handle,
        property: String,
        value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority: Option<String>,
    },
    StyleDeclarationRemoveProperty {
        uid: Handle,
        property: String,
    },
    #[serde(rename = "SetInnerHTML")]
    SetInnerHtml {
        uid: Handle,
        text: String,
    },
}

impl ElementOperation {
    /// The handle the operation mutates.
    pub fn uid(&self) -> Handle {
        match self {
            ElementOperation::Create { uid, .. }
            | ElementOperation::SetAttribute { uid, .. }
            | ElementOperation::RemoveAttribute { uid, .. }
            | ElementOperation::Append { uid, .. }
            | ElementOperation::Remove { uid }
            | ElementOperation::ReplaceWith { uid, .. }
            | ElementOperation::InsertBefore { uid, .. }
            | ElementOperation::EnableEvent { uid, .. }
            | ElementOperation::RemoveChild { uid, .. }
            | ElementOperation::StyleDeclarationSetProperty { uid, .. }
            | ElementOperation::StyleDeclarationRemoveProperty { uid, .. }
            | ElementOperation::SetInnerHtml { uid, .. } => *uid,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ElementOperation::Create { .. } => "Create",
            ElementOperation::SetAttribute { .. } => "SetAttribute",
            ElementOperation::RemoveAttribute { .. } => "RemoveAttribute",
            ElementOperation::Append { .. } => "Append",
            ElementOperation::Remove { .. } => "Remove",
            ElementOperation::ReplaceWith { .. } => "ReplaceWith",
            ElementOperation::InsertBefore { .. } => "InsertBefore",
            ElementOperation::EnableEvent { .. } => "EnableEvent",
            ElementOperation::RemoveChild { .. } => "RemoveChild",
            ElementOperation::StyleDeclarationSetProperty { .. } => "StyleDeclarationSetProperty",
            ElementOperation::StyleDeclarationRemoveProperty { .. } => {
                "StyleDeclarationRemoveProperty"
            }
            ElementOperation::SetInnerHtml { .. } => "SetInnerHTML",
        }
    }
}

/// Everything one commit produced, shipped as a single message.
///
/// `rev` is the pipeline id: the receiver only accepts `last_rev + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationBatch {
    pub rev: u64,
    pub ops: Vec<ElementOperation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub worklet_ref_init: Vec<(u32, Value)>,
}

impl OperationBatch {
    pub fn new(rev: u64, ops: Vec<ElementOperation>) -> Self {
        Self {
            rev,
            ops,
            worklet_ref_init: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.worklet_ref_init.is_empty()
    }
}
