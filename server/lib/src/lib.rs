//! The directory server write path. This implements the add and rename (modify
//! DN) operation pipelines, the per DN lock manager they rely on, and the
//! password policy engine that decides password validity, expiration, lockout
//! and history for user entries.

#![deny(warnings)]
#![recursion_limit = "512"]
#![warn(unused_extern_crates)]
// Enable some groups of clippy lints.
#![deny(clippy::suspicious)]
#![deny(clippy::perf)]
// Specific lints to enforce.
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::trivially_copy_pass_by_ref)]
#![deny(clippy::manual_let_else)]
#![allow(clippy::unreachable)]

#[macro_use]
extern crate tracing;
#[macro_use]
extern crate lazy_static;

// This has to be before the other modules so the test macros are visible to them.
#[macro_use]
pub mod macros;

pub mod be;
pub mod dn;
pub mod entry;
pub mod filter;
pub mod modify;
pub mod plugins;
pub mod pwpolicy;
pub mod schema;
pub mod server;
pub mod time;

#[cfg(any(test, feature = "test"))]
pub mod testkit;

/// A prelude of imports that should be imported by all other modules to
/// help make imports cleaner.
pub mod prelude {
    pub use dirsrv_proto::constants::*;
    pub use dirsrv_proto::internal::{ConfigError, DirectoryError, SchemaError};
    pub use dirsrv_proto::result::ResultCode;
    pub use sketching::{
        admin_debug, admin_error, admin_info, admin_warn, filter_trace, lock_trace, perf_trace,
        policy_info, policy_warn, request_error, request_info, request_trace, request_warn,
        security_access, security_critical, security_debug, security_error, security_info,
        tagged_event, EventTag,
    };
    pub use std::sync::Arc;
    pub use std::time::Duration;

    pub use crate::be::{Backend, WritabilityMode};
    pub use crate::dn::{Ava, Dn, Rdn};
    pub use crate::entry::{Attribute, Entry};
    pub use crate::filter::Filter;
    pub use crate::modify::{Modification, ModificationType};
    pub use crate::schema::{Schema, SchemaReadTransaction, SchemaTransaction};
    pub use crate::server::control::Control;
    pub use crate::server::operation::{AuthIdentity, Operation, OperationRef, Privilege};
    pub use crate::server::ServerContext;
    pub use crate::time::{duration_from_epoch_now, GeneralizedTime};
}
