use super::{
    ClosureValue, DelayedWorkletEvents, ExecId, JsFnHandle, JsFunctionLifecycle,
    RELEASE_BACKGROUND_WORKLET_CTX, RUN_ON_BACKGROUND, RUN_WORKLET_CTX, Worklet, WorkletRef,
    WorkletRefId, WorkletRefMap,
};
use crate::capability::{Capability, CapabilityGate, ThreadRole};
use crate::channel::{Endpoint, PendingReply};
use crate::error::{CapabilityError, ChannelError, RuntimeError};
use crate::handle_table::Handle;
use serde_json::{Value, json};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, warn};

/// Body of a main-thread worklet. Receives the worklet (for its captures)
/// and the call parameters.
pub type WorkletFn = Rc<dyn Fn(&Worklet, &[ClosureValue]) -> Result<Value, String>>;

#[derive(Default)]
struct MainState {
    bodies: HashMap<String, WorkletFn>,
    lifecycle: JsFunctionLifecycle,
    delayed: DelayedWorkletEvents,
    refs: WorkletRefMap,
}

/// Main-thread half of the worklet runtime.
#[derive(Clone)]
pub struct MainWorklets {
    state: Rc<RefCell<MainState>>,
    endpoint: Endpoint,
    gate: Rc<dyn CapabilityGate>,
}

impl MainWorklets {
    pub fn new(endpoint: Endpoint, gate: Rc<dyn CapabilityGate>) -> Self {
        Self {
            state: Rc::new(RefCell::new(MainState::default())),
            endpoint,
            gate,
        }
    }

    /// Starts serving `runWorkletCtx`. The handler's return value travels
    /// back as the call reply.
    pub fn install(&self) {
        let state = self.state.clone();
        self.endpoint.register_handler(RUN_WORKLET_CTX, move |data| {
            let mut worklet = Worklet::from_json(&data["worklet"]).map_err(|err| err.to_string())?;
            let params = decode_params(&data["params"]).map_err(|err| err.to_string())?;

            retain_in(&state, &mut worklet);
            let result = run_worklet_in(&state, &worklet, params);
            release_in(&state, &worklet);
            result.map(Option::unwrap_or_default)
        });
    }

    pub fn register_worklet<F>(&self, id: &str, body: F)
    where
        F: Fn(&Worklet, &[ClosureValue]) -> Result<Value, String> + 'static,
    {
        self.state
            .borrow_mut()
            .bodies
            .insert(id.to_string(), Rc::new(body));
    }

    /// Entry point of every worklet call. A prerendered worklet is only known
    /// by its hash, so the call is parked and `Ok(None)` returned.
    pub fn run_worklet(
        &self,
        ctx: &Worklet,
        params: Vec<ClosureValue>,
    ) -> Result<Option<Value>, String> {
        run_worklet_in(&self.state, ctx, params)
    }

    /// Starts holding `worklet`: its js-function handles get the worklet's
    /// exec id and the exec id gains one reference.
    pub fn retain(&self, worklet: &mut Worklet) -> Option<ExecId> {
        retain_in(&self.state, worklet)
    }

    pub fn release(&self, worklet: &Worklet) {
        release_in(&self.state, worklet);
    }

    pub fn ref_count(&self, exec_id: ExecId) -> usize {
        self.state.borrow().lifecycle.ref_count(exec_id)
    }

    /// `worklet` was attached to `element`: retain it and replay calls that
    /// were parked under its hash for that element.
    pub fn on_worklet_ctx_update(
        &self,
        worklet: &mut Worklet,
        element: Handle,
    ) -> Vec<Result<Option<Value>, String>> {
        self.retain(worklet);
        let parked = self.state.borrow_mut().delayed.take_for(&worklet.id, element);
        parked
            .into_iter()
            .map(|params| self.run_worklet(worklet, params))
            .collect()
    }

    pub fn hydration_finished(&self) {
        self.state.borrow_mut().delayed.clear();
    }

    pub fn delayed_calls(&self) -> usize {
        self.state.borrow().delayed.len()
    }

    /// Sends one release message for every exec id that lost its last
    /// reference since the previous flush.
    pub fn flush_releases(&self) -> Result<Option<Vec<ExecId>>, ChannelError> {
        let released = self.state.borrow_mut().lifecycle.take_released();
        if let Some(exec_ids) = &released {
            self.endpoint
                .dispatch(RELEASE_BACKGROUND_WORKLET_CTX, json!(exec_ids))?;
        }
        Ok(released)
    }

    pub fn run_on_background(&self, handle: &JsFnHandle) -> Result<BackgroundCall, CapabilityError> {
        run_on_background(self.gate.as_ref(), ThreadRole::Main, &self.endpoint, handle)
    }

    pub fn update_worklet_ref_init_value_changes(&self, patch: &[(WorkletRefId, Value)]) {
        if !patch.is_empty() {
            self.state.borrow_mut().refs.update_init_value_changes(patch);
        }
    }

    pub fn worklet_ref(&self, id: WorkletRefId) -> Option<WorkletRef> {
        self.state.borrow().refs.get(id).cloned()
    }

    pub fn set_worklet_ref(&self, id: WorkletRefId, value: Value) -> bool {
        self.state.borrow_mut().refs.set_current(id, value)
    }

    pub fn update_worklet_ref(&self, id: WorkletRefId, element: Option<Handle>) -> bool {
        self.state.borrow_mut().refs.update_element(id, element)
    }

    pub fn remove_worklet_ref(&self, id: WorkletRefId) {
        self.state.borrow_mut().refs.remove(id);
    }
}

/// Main-thread caller for a background function.
pub struct BackgroundCall {
    endpoint: Endpoint,
    target: JsFnHandle,
}

impl BackgroundCall {
    pub fn call(&self, params: Vec<Value>) -> Result<(), RuntimeError> {
        let data = self.payload(params)?;
        Ok(self.endpoint.dispatch(RUN_ON_BACKGROUND, data)?)
    }

    /// Like [`call`](Self::call), but resolves with the function's result.
    pub fn call_with_reply(&self, params: Vec<Value>) -> Result<PendingReply, RuntimeError> {
        let data = self.payload(params)?;
        Ok(self.endpoint.invoke(RUN_ON_BACKGROUND, data)?)
    }

    fn payload(&self, params: Vec<Value>) -> Result<Value, RuntimeError> {
        if let Some(error) = &self.target.error {
            return Err(RuntimeError::InvalidFunction(error.clone()));
        }
        let obj = ClosureValue::JsFn(JsFnHandle::remote(self.target.fn_id, self.target.exec_id));
        Ok(json!({ "obj": obj.to_json(), "params": params }))
    }
}

/// Builds a [`BackgroundCall`] after consulting `gate` for the calling
/// `thread`. A poisoned handle still yields a caller; its error is raised on
/// the first call.
pub fn run_on_background(
    gate: &dyn CapabilityGate,
    thread: ThreadRole,
    endpoint: &Endpoint,
    handle: &JsFnHandle,
) -> Result<BackgroundCall, CapabilityError> {
    gate.check(Capability::RunOnBackground, thread)?;
    Ok(BackgroundCall {
        endpoint: endpoint.clone(),
        target: handle.clone(),
    })
}

fn run_worklet_in(
    state: &RefCell<MainState>,
    ctx: &Worklet,
    params: Vec<ClosureValue>,
) -> Result<Option<Value>, String> {
    if ctx.prerendered {
        debug!(hash = %ctx.id, "delaying worklet call until hydration");
        state.borrow_mut().delayed.push(&ctx.id, params);
        return Ok(None);
    }

    let body = state.borrow().bodies.get(&ctx.id).cloned();
    let Some(body) = body else {
        warn!(worklet = %ctx.id, "invalid worklet object");
        return Err(format!("Worklet: {} is not registered", ctx.id));
    };
    body(ctx, &params).map(Some)
}

fn retain_in(state: &RefCell<MainState>, worklet: &mut Worklet) -> Option<ExecId> {
    let exec_id = worklet.exec_id?;
    worklet.for_each_js_fn_mut(&mut |handle| {
        handle.exec_id.get_or_insert(exec_id);
    });
    state.borrow_mut().lifecycle.add_ref(exec_id);
    Some(exec_id)
}

fn release_in(state: &RefCell<MainState>, worklet: &Worklet) {
    if let Some(exec_id) = worklet.exec_id {
        state.borrow_mut().lifecycle.remove_ref(exec_id);
    }
}

fn decode_params(params: &Value) -> Result<Vec<ClosureValue>, RuntimeError> {
    match params {
        Value::Array(items) => items.iter().map(ClosureValue::from_json).collect(),
        Value::Null => Ok(Vec::new()),
        other => Ok(vec![ClosureValue::from_json(other)?]),
    }
}
