//! Password policy.
//!
//! A [`PasswordPolicy`] is an immutable snapshot built once from configuration
//! and the components the [`ComponentRegistry`] knows about. The server holds
//! the set of configured policies in a [`PolicySet`] and replaces it wholesale
//! when configuration changes.
//!
//! Decisions about one user are made through a [`PasswordPolicyState`], built
//! for a single entry at a fixed time. It derives expiration, lockout, grace
//! login and history state lazily from the entry attributes and records the
//! changes it makes so they can be written back in one update.

pub mod bind;
pub mod generator;
pub mod notify;
pub mod policy;
pub mod registry;
pub mod scheme;
pub mod state;
pub mod validator;

pub use self::bind::{BindResult, PasswordAuthenticator};
pub use self::notify::{
    AccountStatusNotification, AccountStatusNotificationHandler, AccountStatusNotificationType,
};
pub use self::policy::{
    ConfigDuration, PasswordPolicy, PasswordPolicyConfig, PolicySet, StateUpdateFailurePolicy,
};
pub use self::registry::{ComponentConfig, ComponentRegistry, ComponentSet, ComponentSetConfig};
pub use self::scheme::{PasswordStorageScheme, PasswordSyntax};
pub use self::state::{ExpirationState, FailureLockout, PasswordPolicyState, StateMode};
