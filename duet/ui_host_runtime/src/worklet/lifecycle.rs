use super::ExecId;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Main-side reference counts on background exec ids.
///
/// Holders call [`add_ref`](Self::add_ref) when they start referencing a
/// worklet's functions and [`remove_ref`](Self::remove_ref) when they let go.
/// Ids whose count reaches zero are collected until
/// [`take_released`](Self::take_released) drains them into one release
/// message.
#[derive(Debug, Default)]
pub struct JsFunctionLifecycle {
    ref_counts: HashMap<ExecId, usize>,
    to_fire: BTreeSet<ExecId>,
    will_fire: bool,
}

impl JsFunctionLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_ref(&mut self, exec_id: ExecId) {
        *self.ref_counts.entry(exec_id).or_insert(0) += 1;
        self.to_fire.remove(&exec_id);
    }

    /// Returns `true` if this call scheduled a release flush.
    pub fn remove_ref(&mut self, exec_id: ExecId) -> bool {
        let Some(count) = self.ref_counts.get_mut(&exec_id) else {
            debug!(exec_id, "remove_ref on untracked exec id");
            return false;
        };
        if *count > 1 {
            *count -= 1;
            return false;
        }

        self.ref_counts.remove(&exec_id);
        self.to_fire.insert(exec_id);
        !std::mem::replace(&mut self.will_fire, true)
    }

    pub fn ref_count(&self, exec_id: ExecId) -> usize {
        self.ref_counts.get(&exec_id).copied().unwrap_or(0)
    }

    pub fn is_scheduled(&self) -> bool {
        self.will_fire
    }

    /// Every exec id released since the last drain, in ascending order.
    pub fn take_released(&mut self) -> Option<Vec<ExecId>> {
        if !std::mem::replace(&mut self.will_fire, false) || self.to_fire.is_empty() {
            self.to_fire.clear();
            return None;
        }
        Some(std::mem::take(&mut self.to_fire).into_iter().collect())
    }
}
