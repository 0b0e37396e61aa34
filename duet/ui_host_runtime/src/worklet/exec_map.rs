use super::{ExecId, FnId, JsFnHandle, Worklet};
use crate::handle_table::HandleTable;

/// Keeps background-side worklets alive while the main thread may still call
/// into them.
///
/// Every worklet gets an exec id before it crosses to the main thread; the
/// entry is dropped when the main thread reports the id released.
#[derive(Debug, Default)]
pub struct WorkletExecIdMap {
    table: HandleTable<Worklet>,
}

impl WorkletExecIdMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `worklet` and stamps the allocated id into its `exec_id`.
    pub fn add(&mut self, worklet: Worklet) -> ExecId {
        let exec_id = self.table.add(worklet);
        if let Some(worklet) = self.table.get_mut(exec_id) {
            worklet.exec_id = Some(exec_id);
        }
        exec_id
    }

    pub fn get(&self, exec_id: ExecId) -> Option<&Worklet> {
        self.table.get(exec_id)
    }

    pub fn remove(&mut self, exec_id: ExecId) -> Option<Worklet> {
        self.table.remove(exec_id)
    }

    /// First js-function handle with `fn_id` anywhere in the capture graph of
    /// the worklet registered as `exec_id`.
    pub fn find_js_fn_handle(&self, exec_id: ExecId, fn_id: FnId) -> Option<&JsFnHandle> {
        self.table.get(exec_id)?.find_js_fn(fn_id)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
