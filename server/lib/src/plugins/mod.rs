//! Plugins allow an add or rename to be inspected and transformed at fixed
//! extension points of the write paths. This allows richer expression of some
//! concepts and helps to ensure that data is always in specific known states
//! before it reaches a backend.
//!
//! Each extension point returns a [`PluginResult`]. Anything other than
//! `Continue` stops the remaining plugins of that point and changes the flow of
//! the operation:
//!
//! * `TerminateConnection` cancels the operation without post-operation work.
//! * `SendResponseImmediately` skips the core processing and the
//!   post-operation plugins.
//! * `SkipCoreProcessing` skips the core processing, but the post-operation
//!   plugins still run.
//!
//! Plugins run in the order they were registered.

use crate::prelude::*;
use crate::server::add::AddOperation;
use crate::server::modifydn::ModifyDnOperation;

mod lastmod;
mod write_ops_counter;

pub use self::lastmod::LastModPlugin;
pub use self::write_ops_counter::WriteOperationCounter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginResult {
    Continue,
    TerminateConnection,
    SendResponseImmediately,
    SkipCoreProcessing,
}

pub trait Plugin: Send + Sync {
    fn id(&self) -> &'static str;

    fn pre_parse_add(&self, _op: &mut AddOperation) -> PluginResult {
        PluginResult::Continue
    }

    fn pre_operation_add(&self, _op: &mut AddOperation) -> PluginResult {
        PluginResult::Continue
    }

    fn post_operation_add(&self, _op: &mut AddOperation) -> PluginResult {
        PluginResult::Continue
    }

    fn post_response_add(&self, _op: &AddOperation) {}

    fn pre_parse_modify_dn(&self, _op: &mut ModifyDnOperation) -> PluginResult {
        PluginResult::Continue
    }

    fn pre_operation_modify_dn(&self, _op: &mut ModifyDnOperation) -> PluginResult {
        PluginResult::Continue
    }

    fn post_operation_modify_dn(&self, _op: &mut ModifyDnOperation) -> PluginResult {
        PluginResult::Continue
    }

    fn post_response_modify_dn(&self, _op: &ModifyDnOperation) {}
}

#[derive(Default, Clone)]
pub struct PluginPipeline {
    plugins: Vec<Arc<dyn Plugin>>,
}

/// Run one extension point over every plugin, stopping at the first verdict
/// other than `Continue`.
macro_rules! run_plugins {
    (
        $self:ident,
        $op:ident,
        $point:ident
    ) => {{
        for p in $self.plugins.iter() {
            let r = p.$point($op);
            if r != PluginResult::Continue {
                admin_debug!(plugin = p.id(), point = stringify!($point), ?r, "plugin changed the operation flow");
                return r;
            }
        }
        PluginResult::Continue
    }};
}

impl PluginPipeline {
    pub fn new() -> Self {
        PluginPipeline::default()
    }

    pub fn with(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|p| p.id()).collect()
    }

    #[instrument(level = "debug", name = "plugins::run_pre_parse_add", skip_all)]
    pub fn run_pre_parse_add(&self, op: &mut AddOperation) -> PluginResult {
        run_plugins!(self, op, pre_parse_add)
    }

    #[instrument(level = "debug", name = "plugins::run_pre_operation_add", skip_all)]
    pub fn run_pre_operation_add(&self, op: &mut AddOperation) -> PluginResult {
        run_plugins!(self, op, pre_operation_add)
    }

    #[instrument(level = "debug", name = "plugins::run_post_operation_add", skip_all)]
    pub fn run_post_operation_add(&self, op: &mut AddOperation) -> PluginResult {
        run_plugins!(self, op, post_operation_add)
    }

    #[instrument(level = "debug", name = "plugins::run_post_response_add", skip_all)]
    pub fn run_post_response_add(&self, op: &AddOperation) {
        for p in self.plugins.iter() {
            p.post_response_add(op);
        }
    }

    #[instrument(level = "debug", name = "plugins::run_pre_parse_modify_dn", skip_all)]
    pub fn run_pre_parse_modify_dn(&self, op: &mut ModifyDnOperation) -> PluginResult {
        run_plugins!(self, op, pre_parse_modify_dn)
    }

    #[instrument(level = "debug", name = "plugins::run_pre_operation_modify_dn", skip_all)]
    pub fn run_pre_operation_modify_dn(&self, op: &mut ModifyDnOperation) -> PluginResult {
        run_plugins!(self, op, pre_operation_modify_dn)
    }

    #[instrument(level = "debug", name = "plugins::run_post_operation_modify_dn", skip_all)]
    pub fn run_post_operation_modify_dn(&self, op: &mut ModifyDnOperation) -> PluginResult {
        run_plugins!(self, op, post_operation_modify_dn)
    }

    #[instrument(level = "debug", name = "plugins::run_post_response_modify_dn", skip_all)]
    pub fn run_post_response_modify_dn(&self, op: &ModifyDnOperation) {
        for p in self.plugins.iter() {
            p.post_response_modify_dn(op);
        }
    }
}
