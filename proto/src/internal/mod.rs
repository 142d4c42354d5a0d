//! Internal error types. These are shared by the server library and its
//! collaborators, and *may* change between releases without notice.

mod error;

pub use self::error::*;
