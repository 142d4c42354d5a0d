//! Synchronization providers see every add and rename at three points: conflict
//! resolution once the target is locked, a pre-operation hook just before the
//! backend is written, and a post-operation hook that runs on every exit path
//! once locks are released.
//!
//! The first two may stop the operation. Post-operation failures are logged and
//! otherwise ignored.

use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;

use crate::prelude::*;
use crate::server::add::AddOperation;
use crate::server::modifydn::ModifyDnOperation;
use crate::server::operation::Halt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncResult {
    Continue,
    Stop { code: ResultCode, message: String },
}

pub trait SynchronizationProvider: Send + Sync {
    fn name(&self) -> &str;

    fn handle_conflict_resolution_add(
        &self,
        _op: &mut AddOperation,
    ) -> Result<SyncResult, DirectoryError> {
        Ok(SyncResult::Continue)
    }

    fn do_pre_operation_add(&self, _op: &mut AddOperation) -> Result<SyncResult, DirectoryError> {
        Ok(SyncResult::Continue)
    }

    fn do_post_operation_add(&self, _op: &AddOperation) -> Result<(), DirectoryError> {
        Ok(())
    }

    fn handle_conflict_resolution_modify_dn(
        &self,
        _op: &mut ModifyDnOperation,
    ) -> Result<SyncResult, DirectoryError> {
        Ok(SyncResult::Continue)
    }

    fn do_pre_operation_modify_dn(
        &self,
        _op: &mut ModifyDnOperation,
    ) -> Result<SyncResult, DirectoryError> {
        Ok(SyncResult::Continue)
    }

    fn do_post_operation_modify_dn(&self, _op: &ModifyDnOperation) -> Result<(), DirectoryError> {
        Ok(())
    }
}

/// Assigns increasing change numbers to the operations it sees before they
/// are committed and remembers which operations reached the post-operation
/// hook. It is the smallest provider that does something observable.
#[derive(Debug)]
pub struct ChangeNumberProvider {
    next: AtomicI64,
    completed: Mutex<Vec<(i64, ResultCode)>>,
}

impl ChangeNumberProvider {
    pub fn new() -> Self {
        ChangeNumberProvider {
            next: AtomicI64::new(1),
            completed: Mutex::new(Vec::new()),
        }
    }

    fn assign(&self, base: &mut Operation) -> SyncResult {
        if base.change_number < 0 {
            base.change_number = self.next.fetch_add(1, Ordering::Relaxed);
        }
        SyncResult::Continue
    }

    fn record(&self, base: &Operation) {
        self.completed.lock().push((
            base.change_number,
            base.result_code().unwrap_or(ResultCode::Other),
        ));
    }

    /// `(change number, result)` of every operation that finished, in order.
    pub fn completed(&self) -> Vec<(i64, ResultCode)> {
        self.completed.lock().clone()
    }
}

impl Default for ChangeNumberProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SynchronizationProvider for ChangeNumberProvider {
    fn name(&self) -> &str {
        "change-number"
    }

    fn do_pre_operation_add(&self, op: &mut AddOperation) -> Result<SyncResult, DirectoryError> {
        Ok(self.assign(&mut op.base))
    }

    fn do_post_operation_add(&self, op: &AddOperation) -> Result<(), DirectoryError> {
        self.record(&op.base);
        Ok(())
    }

    fn do_pre_operation_modify_dn(
        &self,
        op: &mut ModifyDnOperation,
    ) -> Result<SyncResult, DirectoryError> {
        Ok(self.assign(&mut op.base))
    }

    fn do_post_operation_modify_dn(&self, op: &ModifyDnOperation) -> Result<(), DirectoryError> {
        self.record(&op.base);
        Ok(())
    }
}

/// Apply a provider verdict to the operation.
pub(crate) fn sync_outcome(
    op: &mut Operation,
    provider: &str,
    stage: &str,
    r: Result<SyncResult, DirectoryError>,
) -> Result<(), Halt> {
    match r {
        Ok(SyncResult::Continue) => Ok(()),
        Ok(SyncResult::Stop { code, message }) => {
            request_info!(op = %op.op_id, %provider, %stage, %code, "synchronization provider stopped the operation");
            Err(op.abort(code, message))
        }
        Err(e) => {
            admin_error!(op = %op.op_id, %provider, %stage, ?e, "synchronization provider failed");
            Err(op.fail(e))
        }
    }
}
