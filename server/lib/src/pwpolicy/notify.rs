//! Account status notifications report changes in the state of an account
//! (lockouts, expirations, password changes) to the handlers of its policy.

use std::collections::BTreeMap;
use std::fmt;

use crate::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountStatusNotificationType {
    AccountTemporarilyLocked,
    AccountPermanentlyLocked,
    AccountUnlocked,
    AccountIdleLocked,
    AccountResetLocked,
    AccountDisabled,
    AccountEnabled,
    AccountExpired,
    PasswordExpired,
    PasswordExpiring,
    PasswordReset,
    PasswordChanged,
}

impl AccountStatusNotificationType {
    pub fn name(self) -> &'static str {
        match self {
            AccountStatusNotificationType::AccountTemporarilyLocked => "account-temporarily-locked",
            AccountStatusNotificationType::AccountPermanentlyLocked => "account-permanently-locked",
            AccountStatusNotificationType::AccountUnlocked => "account-unlocked",
            AccountStatusNotificationType::AccountIdleLocked => "account-idle-locked",
            AccountStatusNotificationType::AccountResetLocked => "account-reset-locked",
            AccountStatusNotificationType::AccountDisabled => "account-disabled",
            AccountStatusNotificationType::AccountEnabled => "account-enabled",
            AccountStatusNotificationType::AccountExpired => "account-expired",
            AccountStatusNotificationType::PasswordExpired => "password-expired",
            AccountStatusNotificationType::PasswordExpiring => "password-expiring",
            AccountStatusNotificationType::PasswordReset => "password-reset",
            AccountStatusNotificationType::PasswordChanged => "password-changed",
        }
    }
}

impl fmt::Display for AccountStatusNotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// Property names.
pub const PROPERTY_POLICY_DN: &str = "password-policy-dn";
pub const PROPERTY_SECONDS_UNTIL_UNLOCK: &str = "seconds-until-unlock";
pub const PROPERTY_SECONDS_UNTIL_EXPIRATION: &str = "seconds-until-expiration";
pub const PROPERTY_ACCOUNT_UNLOCK_TIME: &str = "account-unlock-time";
pub const PROPERTY_PASSWORD_EXPIRATION_TIME: &str = "password-expiration-time";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountStatusNotification {
    pub notification_type: AccountStatusNotificationType,
    pub user_dn: Dn,
    pub message: String,
    pub properties: BTreeMap<String, Vec<String>>,
}

impl AccountStatusNotification {
    pub fn new(
        notification_type: AccountStatusNotificationType,
        user_dn: Dn,
        message: impl Into<String>,
    ) -> Self {
        AccountStatusNotification {
            notification_type,
            user_dn,
            message: message.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, name: &str, value: impl Into<String>) -> Self {
        self.properties
            .entry(name.to_string())
            .or_default()
            .push(value.into());
        self
    }
}

pub trait AccountStatusNotificationHandler: Send + Sync {
    fn id(&self) -> &str;

    fn handle_status_notification(&self, notification: &AccountStatusNotification);
}

/// Writes every notification to the security event log.
#[derive(Debug, Clone)]
pub struct LogNotificationHandler {
    id: String,
}

impl LogNotificationHandler {
    pub fn new(id: &str) -> Self {
        LogNotificationHandler { id: id.to_string() }
    }
}

impl AccountStatusNotificationHandler for LogNotificationHandler {
    fn id(&self) -> &str {
        &self.id
    }

    fn handle_status_notification(&self, notification: &AccountStatusNotification) {
        security_info!(
            handler = %self.id,
            kind = %notification.notification_type,
            user = %notification.user_dn,
            properties = ?notification.properties,
            "{}",
            notification.message
        );
    }
}
