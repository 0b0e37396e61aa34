//! Closures that cross the thread boundary by handle.
//!
//! A [`Worklet`] names a function body registered on the main thread plus the
//! values it captured. Captured values are classified once into a
//! [`ClosureValue`] when they are decoded, so nothing downstream has to probe
//! JSON shapes again.

mod background;
mod delay;
mod exec_map;
mod lifecycle;
mod main_thread;
mod worklet_ref;

pub use background::{BackgroundWorklets, FnCandidate, MainThreadCall, run_on_main_thread};
pub use delay::DelayedWorkletEvents;
pub use exec_map::WorkletExecIdMap;
pub use lifecycle::JsFunctionLifecycle;
pub use main_thread::{BackgroundCall, MainWorklets, WorkletFn, run_on_background};
pub use worklet_ref::{WorkletRef, WorkletRefMap, WorkletRefPool};

use crate::error::RuntimeError;
use crate::handle_table::Handle;
use serde_json::{Map, Value};
use indexmap::IndexMap;
use std::fmt;
use std::rc::Rc;

pub use crate::channel::FUNCTION_CALL_RET;

pub const RUN_WORKLET_CTX: &str = "runWorkletCtx";
pub const RUN_ON_BACKGROUND: &str = "runOnBackground";
pub const RELEASE_BACKGROUND_WORKLET_CTX: &str = "releaseBackgroundWorkletCtx";

/// Maximum nesting of captured values accepted from the wire.
pub const DEPTH_LIMIT: usize = 1000;

pub type ExecId = Handle;
pub type FnId = u32;
pub type WorkletRefId = u32;

/// A background-thread function reachable from the main thread.
pub type JsFn = Rc<dyn Fn(&[Value]) -> Result<Value, String>>;

pub fn js_fn<F>(f: F) -> JsFn
where
    F: Fn(&[Value]) -> Result<Value, String> + 'static,
{
    Rc::new(f)
}

const KEY_WORKLET_ID: &str = "_wkltId";
const KEY_WORKLET_HASH: &str = "_lepusWorkletHash";
const KEY_EXEC_ID: &str = "_execId";
const KEY_CAPTURES: &str = "_c";
const KEY_JS_FN_ID: &str = "_jsFnId";
const KEY_JS_FN_ERROR: &str = "_error";
const KEY_WORKLET_REF: &str = "_wvid";
const KEY_ELEMENT: &str = "elementRefptr";

/// Address of a background function: the worklet's exec id plus the
/// function id inside it. On the background side the handle also owns the
/// function itself, or the error to raise when it is called.
#[derive(Clone, Default)]
pub struct JsFnHandle {
    pub fn_id: FnId,
    pub exec_id: Option<ExecId>,
    pub error: Option<String>,
    callable: Option<JsFn>,
}

impl JsFnHandle {
    pub fn new(fn_id: FnId, callable: JsFn) -> Self {
        Self {
            fn_id,
            exec_id: None,
            error: None,
            callable: Some(callable),
        }
    }

    pub fn poisoned(fn_id: FnId, error: impl Into<String>) -> Self {
        Self {
            fn_id,
            exec_id: None,
            error: Some(error.into()),
            callable: None,
        }
    }

    /// Wire form only: no function attached.
    pub fn remote(fn_id: FnId, exec_id: Option<ExecId>) -> Self {
        Self {
            fn_id,
            exec_id,
            ..Self::default()
        }
    }

    pub fn callable(&self) -> Option<&JsFn> {
        self.callable.as_ref()
    }
}

impl fmt::Debug for JsFnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsFnHandle")
            .field("fn_id", &self.fn_id)
            .field("exec_id", &self.exec_id)
            .field("error", &self.error)
            .field("callable", &self.callable.is_some())
            .finish()
    }
}

impl PartialEq for JsFnHandle {
    fn eq(&self, other: &Self) -> bool {
        self.fn_id == other.fn_id && self.exec_id == other.exec_id && self.error == other.error
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClosureValue {
    Plain(Value),
    Element(Handle),
    WorkletRef(WorkletRefId),
    Worklet(Worklet),
    JsFn(JsFnHandle),
    /// Keys keep insertion order; searches visit them in that order.
    Map(IndexMap<String, ClosureValue>),
    List(Vec<ClosureValue>),
}

impl ClosureValue {
    pub fn from_json(value: &Value) -> Result<Self, RuntimeError> {
        Self::decode(value, 0)
    }

    pub fn to_json(&self) -> Value {
        match self {
            ClosureValue::Plain(value) => value.clone(),
            ClosureValue::Element(handle) => serde_json::json!({ KEY_ELEMENT: handle }),
            ClosureValue::WorkletRef(id) => serde_json::json!({ KEY_WORKLET_REF: id }),
            ClosureValue::Worklet(worklet) => worklet.to_json(),
            ClosureValue::JsFn(handle) => {
                let mut object = Map::new();
                object.insert(KEY_JS_FN_ID.into(), handle.fn_id.into());
                if let Some(exec_id) = handle.exec_id {
                    object.insert(KEY_EXEC_ID.into(), exec_id.into());
                }
                if let Some(error) = &handle.error {
                    object.insert(KEY_JS_FN_ERROR.into(), error.clone().into());
                }
                Value::Object(object)
            }
            ClosureValue::Map(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
            ClosureValue::List(items) => {
                Value::Array(items.iter().map(ClosureValue::to_json).collect())
            }
        }
    }

    /// Depth-first search for the first js-function handle with `fn_id`.
    pub fn find_js_fn(&self, fn_id: FnId) -> Option<&JsFnHandle> {
        match self {
            ClosureValue::JsFn(handle) if handle.fn_id == fn_id => Some(handle),
            ClosureValue::Worklet(worklet) => worklet.find_js_fn(fn_id),
            ClosureValue::Map(entries) => entries.values().find_map(|value| value.find_js_fn(fn_id)),
            ClosureValue::List(items) => items.iter().find_map(|value| value.find_js_fn(fn_id)),
            _ => None,
        }
    }

    pub fn for_each_js_fn_mut(&mut self, visit: &mut dyn FnMut(&mut JsFnHandle)) {
        match self {
            ClosureValue::JsFn(handle) => visit(handle),
            ClosureValue::Worklet(worklet) => worklet.for_each_js_fn_mut(visit),
            ClosureValue::Map(entries) => {
                for value in entries.values_mut() {
                    value.for_each_js_fn_mut(visit);
                }
            }
            ClosureValue::List(items) => {
                for value in items {
                    value.for_each_js_fn_mut(visit);
                }
            }
            _ => {}
        }
    }

    pub fn element(&self) -> Option<Handle> {
        match self {
            ClosureValue::Element(handle) => Some(*handle),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&ClosureValue> {
        match self {
            ClosureValue::Map(entries) => entries.get(key),
            _ => None,
        }
    }

    fn decode(value: &Value, depth: usize) -> Result<Self, RuntimeError> {
        let depth = depth + 1;
        if depth >= DEPTH_LIMIT {
            return Err(RuntimeError::DepthLimit { limit: DEPTH_LIMIT });
        }

        match value {
            Value::Object(object) => {
                if let Some(handle) = object.get(KEY_ELEMENT) {
                    return Ok(ClosureValue::Element(as_id(handle, KEY_ELEMENT)?));
                }
                if let Some(id) = object.get(KEY_WORKLET_REF) {
                    return Ok(ClosureValue::WorkletRef(as_id(id, KEY_WORKLET_REF)?));
                }
                if object.contains_key(KEY_WORKLET_ID) || object.contains_key(KEY_WORKLET_HASH) {
                    return Ok(ClosureValue::Worklet(Worklet::decode(object, depth)?));
                }
                if let Some(fn_id) = object.get(KEY_JS_FN_ID) {
                    return Ok(ClosureValue::JsFn(JsFnHandle {
                        fn_id: as_id(fn_id, KEY_JS_FN_ID)?,
                        exec_id: object.get(KEY_EXEC_ID).map(|v| as_id(v, KEY_EXEC_ID)).transpose()?,
                        error: object
                            .get(KEY_JS_FN_ERROR)
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        callable: None,
                    }));
                }
                let entries = object
                    .iter()
                    .map(|(key, value)| Ok((key.clone(), Self::decode(value, depth)?)))
                    .collect::<Result<_, RuntimeError>>()?;
                Ok(ClosureValue::Map(entries))
            }
            Value::Array(items) => Ok(ClosureValue::List(
                items
                    .iter()
                    .map(|item| Self::decode(item, depth))
                    .collect::<Result<_, _>>()?,
            )),
            other => Ok(ClosureValue::Plain(other.clone())),
        }
    }
}

impl From<Value> for ClosureValue {
    fn from(value: Value) -> Self {
        ClosureValue::Plain(value)
    }
}

impl From<JsFnHandle> for ClosureValue {
    fn from(handle: JsFnHandle) -> Self {
        ClosureValue::JsFn(handle)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Worklet {
    /// Registered body id, or the pre-hydration hash when `prerendered`.
    pub id: String,
    pub prerendered: bool,
    pub exec_id: Option<ExecId>,
    /// In capture order.
    pub captures: IndexMap<String, ClosureValue>,
}

impl Worklet {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// A worklet only known by its hash until the background thread is up.
    pub fn prerendered(hash: impl Into<String>) -> Self {
        Self {
            id: hash.into(),
            prerendered: true,
            ..Self::default()
        }
    }

    pub fn capture(mut self, name: impl Into<String>, value: impl Into<ClosureValue>) -> Self {
        self.captures.insert(name.into(), value.into());
        self
    }

    pub fn find_js_fn(&self, fn_id: FnId) -> Option<&JsFnHandle> {
        self.captures
            .values()
            .find_map(|value| value.find_js_fn(fn_id))
    }

    pub fn for_each_js_fn_mut(&mut self, visit: &mut dyn FnMut(&mut JsFnHandle)) {
        for value in self.captures.values_mut() {
            value.for_each_js_fn_mut(visit);
        }
    }

    pub fn from_json(value: &Value) -> Result<Self, RuntimeError> {
        match ClosureValue::from_json(value)? {
            ClosureValue::Worklet(worklet) => Ok(worklet),
            _ => Err(RuntimeError::Malformed {
                what: "worklet",
                reason: format!("missing {KEY_WORKLET_ID}"),
            }),
        }
    }

    pub fn to_json(&self) -> Value {
        let mut object = Map::new();
        let id_key = if self.prerendered {
            KEY_WORKLET_HASH
        } else {
            KEY_WORKLET_ID
        };
        object.insert(id_key.into(), self.id.clone().into());
        if let Some(exec_id) = self.exec_id {
            object.insert(KEY_EXEC_ID.into(), exec_id.into());
        }
        if !self.captures.is_empty() {
            object.insert(
                KEY_CAPTURES.into(),
                Value::Object(
                    self.captures
                        .iter()
                        .map(|(key, value)| (key.clone(), value.to_json()))
                        .collect(),
                ),
            );
        }
        Value::Object(object)
    }

    fn decode(object: &Map<String, Value>, depth: usize) -> Result<Self, RuntimeError> {
        let (id, prerendered) = match (object.get(KEY_WORKLET_ID), object.get(KEY_WORKLET_HASH)) {
            (Some(id), _) => (id, false),
            (None, Some(hash)) => (hash, true),
            (None, None) => {
                return Err(RuntimeError::Malformed {
                    what: "worklet",
                    reason: format!("missing {KEY_WORKLET_ID}"),
                });
            }
        };
        let id = id.as_str().ok_or_else(|| RuntimeError::Malformed {
            what: "worklet",
            reason: "worklet id must be a string".into(),
        })?;

        let captures = match object.get(KEY_CAPTURES) {
            Some(Value::Object(captures)) => captures
                .iter()
                .map(|(key, value)| Ok((key.clone(), ClosureValue::decode(value, depth)?)))
                .collect::<Result<_, RuntimeError>>()?,
            _ => IndexMap::new(),
        };

        Ok(Self {
            id: id.to_string(),
            prerendered,
            exec_id: object.get(KEY_EXEC_ID).map(|v| as_id(v, KEY_EXEC_ID)).transpose()?,
            captures,
        })
    }
}

fn as_id(value: &Value, key: &'static str) -> Result<u32, RuntimeError> {
    value
        .as_u64()
        .and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| RuntimeError::Malformed {
            what: "closure value",
            reason: format!("{key} must be a non-negative integer, got {value}"),
        })
}
