use super::ClosureValue;
use crate::handle_table::Handle;
use std::collections::HashMap;

/// Worklet calls that arrived before the worklet body was known.
///
/// Prerendered elements only carry a worklet hash. Events fired on them are
/// parked here per hash and replayed once the element receives the real
/// worklet; hydration finishing drops whatever is left.
#[derive(Debug, Default)]
pub struct DelayedWorkletEvents {
    params_by_hash: HashMap<String, Vec<Vec<ClosureValue>>>,
}

impl DelayedWorkletEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, hash: &str, params: Vec<ClosureValue>) {
        self.params_by_hash
            .entry(hash.to_string())
            .or_default()
            .push(params);
    }

    /// Removes and returns the parked calls for `hash` whose event targeted
    /// `element`. Calls for other elements stay parked.
    pub fn take_for(&mut self, hash: &str, element: Handle) -> Vec<Vec<ClosureValue>> {
        let Some(parked) = self.params_by_hash.get_mut(hash) else {
            return Vec::new();
        };
        let (matched, left): (Vec<_>, Vec<_>) = std::mem::take(parked)
            .into_iter()
            .partition(|params| event_target(params) == Some(element));
        *parked = left;
        matched
    }

    pub fn clear(&mut self) {
        self.params_by_hash.clear();
    }

    pub fn len(&self) -> usize {
        self.params_by_hash.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn event_target(params: &[ClosureValue]) -> Option<Handle> {
    params.first()?.get("currentTarget")?.element()
}
