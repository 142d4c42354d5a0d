use std::sync::atomic::{AtomicU64, Ordering};

use crate::plugins::{Plugin, PluginResult};
use crate::prelude::*;
use crate::server::add::AddOperation;
use crate::server::modifydn::ModifyDnOperation;

/// Counts the writes that reached the post-operation extension point with a
/// successful result.
#[derive(Debug, Default)]
pub struct WriteOperationCounter {
    adds: AtomicU64,
    renames: AtomicU64,
}

impl WriteOperationCounter {
    fn succeeded(op: &Operation) -> bool {
        op.result_code() == Some(ResultCode::Success)
    }

    pub fn adds(&self) -> u64 {
        self.adds.load(Ordering::Relaxed)
    }

    pub fn renames(&self) -> u64 {
        self.renames.load(Ordering::Relaxed)
    }
}

impl Plugin for WriteOperationCounter {
    fn id(&self) -> &'static str {
        "plugin_write_operation_counter"
    }

    fn post_operation_add(&self, op: &mut AddOperation) -> PluginResult {
        if Self::succeeded(&op.base) {
            self.adds.fetch_add(1, Ordering::Relaxed);
        }
        PluginResult::Continue
    }

    fn post_operation_modify_dn(&self, op: &mut ModifyDnOperation) -> PluginResult {
        if Self::succeeded(&op.base) {
            self.renames.fetch_add(1, Ordering::Relaxed);
        }
        PluginResult::Continue
    }
}
