//! Deferred UI reads issued before the first render has been hydrated.
//!
//! A [`RefProxy`] names an element by the snapshot id and value index of its
//! `ref` binding. Picking a method yields a [`RefQuery`]; nothing reaches the
//! renderer until [`RefQuery::exec`], and even then only once the gate has
//! seen [`HydrationGate::hydration_complete`].

use serde_json::Value;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use tracing::{debug, warn};

pub type SnapshotId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Buffering,
    Draining,
    Live,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefMethod {
    Invoke { method: String, params: Value },
    Path,
    Fields(Value),
    SetNativeProps(Value),
}

/// Renderer-side executor of selector queries.
pub trait SelectorBackend {
    fn run(&mut self, selector: &str, method: &RefMethod);
}

/// Attribute that marks the element bound to value `exp_index` of snapshot
/// `id`. The snapshot tree sets it; selectors look for it.
pub fn ref_attribute(id: SnapshotId, exp_index: usize) -> String {
    format!("react-ref-{id}-{exp_index}")
}

#[derive(Debug, Clone, PartialEq)]
struct PendingQuery {
    ref_attr: (SnapshotId, usize),
    method: RefMethod,
}

struct GateInner {
    state: GateState,
    queue: VecDeque<PendingQuery>,
    hydration_map: HashMap<SnapshotId, SnapshotId>,
    draining: bool,
}

#[derive(Clone)]
pub struct HydrationGate {
    inner: Rc<RefCell<GateInner>>,
    backend: Rc<RefCell<dyn SelectorBackend>>,
}

impl HydrationGate {
    pub fn new<B: SelectorBackend + 'static>(backend: B) -> Self {
        Self {
            inner: Rc::new(RefCell::new(GateInner {
                state: GateState::Buffering,
                queue: VecDeque::new(),
                hydration_map: HashMap::new(),
                draining: false,
            })),
            backend: Rc::new(RefCell::new(backend)),
        }
    }

    pub fn state(&self) -> GateState {
        self.inner.borrow().state
    }

    pub fn pending(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    pub fn ref_proxy(&self, snapshot_id: SnapshotId, exp_index: usize) -> RefProxy {
        RefProxy {
            gate: self.clone(),
            ref_attr: (snapshot_id, exp_index),
        }
    }

    /// Installs the id renumbering produced by hydration, then runs every
    /// buffered query in construction order before going live.
    pub fn hydration_complete(&self, hydration_map: HashMap<SnapshotId, SnapshotId>) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state == GateState::Live {
                warn!("hydration completed twice");
            }
            inner.hydration_map.extend(hydration_map);
            inner.state = GateState::Draining;
        }
        self.drain();
        self.inner.borrow_mut().state = GateState::Live;
    }

    /// Id a pre-hydration snapshot id maps to, or the id itself.
    pub fn resolve(&self, snapshot_id: SnapshotId) -> SnapshotId {
        self.inner
            .borrow()
            .hydration_map
            .get(&snapshot_id)
            .copied()
            .unwrap_or(snapshot_id)
    }

    fn submit(&self, query: PendingQuery) {
        let live = {
            let mut inner = self.inner.borrow_mut();
            inner.queue.push_back(query);
            inner.state != GateState::Buffering
        };
        if live {
            self.drain();
        } else {
            debug!(pending = self.pending(), "buffering ref query until hydration");
        }
    }

    // Queries submitted while draining (from inside the backend) join the
    // back of the queue, so they never overtake earlier ones.
    fn drain(&self) {
        if std::mem::replace(&mut self.inner.borrow_mut().draining, true) {
            return;
        }
        loop {
            let Some(query) = self.inner.borrow_mut().queue.pop_front() else {
                break;
            };
            let (id, exp_index) = query.ref_attr;
            let selector = format!("[{}]", ref_attribute(self.resolve(id), exp_index));
            self.backend.borrow_mut().run(&selector, &query.method);
        }
        self.inner.borrow_mut().draining = false;
    }
}

/// Handle on the element bound to one `ref` value.
#[derive(Clone)]
pub struct RefProxy {
    gate: HydrationGate,
    ref_attr: (SnapshotId, usize),
}

impl RefProxy {
    pub fn invoke(&self, method: impl Into<String>, params: Value) -> RefQuery {
        self.query(RefMethod::Invoke {
            method: method.into(),
            params,
        })
    }

    pub fn path(&self) -> RefQuery {
        self.query(RefMethod::Path)
    }

    pub fn fields(&self, fields: Value) -> RefQuery {
        self.query(RefMethod::Fields(fields))
    }

    pub fn set_native_props(&self, props: Value) -> RefQuery {
        self.query(RefMethod::SetNativeProps(props))
    }

    pub fn ref_attr(&self) -> (SnapshotId, usize) {
        self.ref_attr
    }

    fn query(&self, method: RefMethod) -> RefQuery {
        RefQuery {
            gate: self.gate.clone(),
            pending: PendingQuery {
                ref_attr: self.ref_attr,
                method,
            },
        }
    }
}

/// A selected method, captured but not yet run.
#[must_use = "a ref query does nothing until exec() is called"]
pub struct RefQuery {
    gate: HydrationGate,
    pending: PendingQuery,
}

impl RefQuery {
    /// Runs now when the gate is live, otherwise buffers until hydration.
    /// The hydration map is consulted when the query actually runs.
    pub fn exec(self) {
        self.gate.submit(self.pending);
    }
}
