use super::{
    ClosureValue, ExecId, FnId, JsFn, JsFnHandle, RELEASE_BACKGROUND_WORKLET_CTX,
    RUN_ON_BACKGROUND, RUN_WORKLET_CTX, Worklet, WorkletExecIdMap, WorkletRefId, WorkletRefPool,
};
use crate::capability::{Capability, CapabilityGate, ThreadRole};
use crate::channel::{Endpoint, PendingReply};
use crate::error::{CapabilityError, RuntimeError};
use serde_json::{Value, json};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

/// Input to [`BackgroundWorklets::transform_to_worklet`].
pub enum FnCandidate {
    Function(JsFn),
    /// Anything that is not callable. Turning it into a handle succeeds; the
    /// error surfaces when the main thread tries to call it.
    Value(Value),
}

impl From<JsFn> for FnCandidate {
    fn from(f: JsFn) -> Self {
        FnCandidate::Function(f)
    }
}

impl From<Value> for FnCandidate {
    fn from(value: Value) -> Self {
        FnCandidate::Value(value)
    }
}

#[derive(Default)]
struct BackgroundState {
    exec_map: WorkletExecIdMap,
    last_fn_id: FnId,
    refs: WorkletRefPool,
}

/// Background-thread half of the worklet runtime.
#[derive(Clone)]
pub struct BackgroundWorklets {
    state: Rc<RefCell<BackgroundState>>,
    endpoint: Endpoint,
    gate: Rc<dyn CapabilityGate>,
}

impl BackgroundWorklets {
    pub fn new(endpoint: Endpoint, gate: Rc<dyn CapabilityGate>) -> Self {
        Self {
            state: Rc::new(RefCell::new(BackgroundState::default())),
            endpoint,
            gate,
        }
    }

    /// Starts serving `runOnBackground` and release messages.
    pub fn install(&self) {
        let state = self.state.clone();
        self.endpoint
            .register_handler(RUN_ON_BACKGROUND, move |data| run_js_function(&state, &data));

        let state = self.state.clone();
        self.endpoint
            .register_handler(RELEASE_BACKGROUND_WORKLET_CTX, move |data| {
                remove_js_worklets(&state, &data);
                Ok(Value::Null)
            });
    }

    pub fn uninstall(&self) {
        self.endpoint.remove_handler(RUN_ON_BACKGROUND);
        self.endpoint.remove_handler(RELEASE_BACKGROUND_WORKLET_CTX);
    }

    pub fn transform_to_worklet(&self, candidate: impl Into<FnCandidate>) -> JsFnHandle {
        let fn_id = {
            let mut state = self.state.borrow_mut();
            state.last_fn_id += 1;
            state.last_fn_id
        };

        match candidate.into() {
            FnCandidate::Function(f) => JsFnHandle::new(fn_id, f),
            FnCandidate::Value(value) => JsFnHandle::poisoned(
                fn_id,
                format!(
                    "Argument of runOnBackground should be a function, but got [{}] instead",
                    json_type_name(&value)
                ),
            ),
        }
    }

    /// Registers `worklet` before it crosses to the main thread. Every post
    /// gets a fresh exec id: the main thread releases each copy it receives
    /// on its own, so an earlier id may already be gone.
    pub fn post_worklet_ctx(&self, worklet: &mut Worklet) -> ExecId {
        let exec_id = self.state.borrow_mut().exec_map.add(worklet.clone());
        worklet.exec_id = Some(exec_id);
        exec_id
    }

    pub fn run_on_main_thread(&self, worklet: Worklet) -> Result<MainThreadCall, CapabilityError> {
        run_on_main_thread(self.gate.as_ref(), ThreadRole::Background, self, worklet)
    }

    pub fn find_js_fn_handle(&self, exec_id: ExecId, fn_id: FnId) -> Option<JsFnHandle> {
        self.state
            .borrow()
            .exec_map
            .find_js_fn_handle(exec_id, fn_id)
            .cloned()
    }

    pub fn live_exec_ids(&self) -> usize {
        self.state.borrow().exec_map.len()
    }

    pub fn alloc_worklet_ref(&self, init: Value) -> WorkletRefId {
        self.state.borrow_mut().refs.alloc(init)
    }

    /// Initial values of refs allocated since the last call, for the next
    /// operation batch.
    pub fn take_worklet_ref_init_patch(&self) -> Vec<(WorkletRefId, Value)> {
        self.state.borrow_mut().refs.take_init_patch()
    }
}

/// Caller for a main-thread worklet, produced on the background thread.
pub struct MainThreadCall {
    worklets: BackgroundWorklets,
    worklet: RefCell<Worklet>,
}

impl MainThreadCall {
    /// Posts the worklet with `params` and returns the future of its result.
    pub fn call(&self, params: Vec<Value>) -> Result<PendingReply, RuntimeError> {
        let data = {
            let mut worklet = self.worklet.borrow_mut();
            self.worklets.post_worklet_ctx(&mut worklet);
            json!({ "worklet": worklet.to_json(), "params": params })
        };
        Ok(self.worklets.endpoint.invoke(RUN_WORKLET_CTX, data)?)
    }

    pub fn exec_id(&self) -> Option<ExecId> {
        self.worklet.borrow().exec_id
    }
}

/// Builds a [`MainThreadCall`] after consulting `gate` for the calling
/// `thread`.
pub fn run_on_main_thread(
    gate: &dyn CapabilityGate,
    thread: ThreadRole,
    worklets: &BackgroundWorklets,
    worklet: Worklet,
) -> Result<MainThreadCall, CapabilityError> {
    gate.check(Capability::RunOnMainThread, thread)?;
    Ok(MainThreadCall {
        worklets: worklets.clone(),
        worklet: RefCell::new(worklet),
    })
}

fn run_js_function(state: &RefCell<BackgroundState>, data: &Value) -> Result<Value, String> {
    let target = match ClosureValue::from_json(&data["obj"]) {
        Ok(ClosureValue::JsFn(target)) => target,
        _ => return Err(format!("runOnBackground: malformed target: {}", data["obj"])),
    };

    let f = {
        let state = state.borrow();
        let handle = target
            .exec_id
            .and_then(|exec_id| state.exec_map.find_js_fn_handle(exec_id, target.fn_id));
        match handle {
            Some(handle) => match (handle.callable(), &handle.error) {
                (Some(f), _) => f.clone(),
                (None, Some(error)) => return Err(error.clone()),
                (None, None) => return Err(not_found(data)),
            },
            None => return Err(not_found(data)),
        }
    };

    let params = match &data["params"] {
        Value::Array(params) => params.as_slice(),
        _ => &[],
    };
    f(params)
}

fn remove_js_worklets(state: &RefCell<BackgroundState>, data: &Value) {
    let mut state = state.borrow_mut();
    for exec_id in data.as_array().into_iter().flatten().filter_map(Value::as_u64) {
        let Ok(exec_id) = ExecId::try_from(exec_id) else {
            continue;
        };
        if state.exec_map.remove(exec_id).is_none() {
            debug!(exec_id, "release for unknown exec id");
        }
    }
}

fn not_found(data: &Value) -> String {
    format!("runOnBackground: JS function not found: {}", data["obj"])
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "undefined",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) | Value::Object(_) => "object",
    }
}
