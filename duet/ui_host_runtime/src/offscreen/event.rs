use crate::handle_table::Handle;
use serde_json::Value;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPhase {
    None,
    Capturing,
    AtTarget,
    Bubbling,
}

#[derive(Debug, Clone)]
pub struct OffscreenEvent {
    pub event_type: String,
    pub target: Handle,
    pub current_target: Handle,
    pub phase: EventPhase,
    pub bubbles: bool,
    /// Extra properties forwarded by the renderer (touches, detail, ...).
    pub detail: Value,
    propagation_stopped: bool,
}

impl OffscreenEvent {
    pub fn new(event_type: impl Into<String>, target: Handle, bubbles: bool, detail: Value) -> Self {
        Self {
            event_type: event_type.into(),
            target,
            current_target: target,
            phase: EventPhase::None,
            bubbles,
            detail,
            propagation_stopped: false,
        }
    }

    pub fn stop_propagation(&mut self) {
        self.propagation_stopped = true;
    }

    pub fn propagation_stopped(&self) -> bool {
        self.propagation_stopped
    }
}

pub type Listener = Rc<dyn Fn(&mut OffscreenEvent)>;

#[derive(Clone)]
pub(crate) struct Registration {
    pub event_type: String,
    pub capture: bool,
    pub listener: Listener,
}

impl Registration {
    pub(crate) fn fires_in(&self, event_type: &str, phase: EventPhase) -> bool {
        if self.event_type != event_type {
            return false;
        }
        match phase {
            EventPhase::Capturing => self.capture,
            EventPhase::Bubbling => !self.capture,
            EventPhase::AtTarget => true,
            EventPhase::None => false,
        }
    }
}
