//! Because consistency is great!
//!
//! Attribute type names, control and syntax OIDs and the privilege names that
//! the write path and the password policy engine agree on.

// Core attribute types.
pub const ATTR_OBJECTCLASS: &str = "objectClass";
pub const ATTR_CREATE_TIMESTAMP: &str = "createTimestamp";
pub const ATTR_USER_PASSWORD: &str = "userPassword";
pub const ATTR_AUTH_PASSWORD: &str = "authPassword";
pub const ATTR_PRIVILEGE_NAME: &str = "ds-privilege-name";
pub const ATTR_UID: &str = "uid";

// Password policy state, kept as operational attributes on the user entry.
pub const ATTR_PWD_CHANGED_TIME: &str = "pwdChangedTime";
pub const ATTR_PWD_FAILURE_TIME: &str = "pwdFailureTime";
pub const ATTR_PWD_ACCOUNT_LOCKED_TIME: &str = "pwdAccountLockedTime";
pub const ATTR_PWD_GRACE_USE_TIME: &str = "pwdGraceUseTime";
pub const ATTR_PWD_RESET: &str = "pwdReset";
pub const ATTR_PWD_HISTORY: &str = "pwdHistory";
pub const ATTR_PWP_ACCOUNT_DISABLED: &str = "ds-pwp-account-disabled";
pub const ATTR_PWP_ACCOUNT_EXPIRATION_TIME: &str = "ds-pwp-account-expiration-time";
pub const ATTR_PWP_LAST_LOGIN_TIME: &str = "ds-pwp-last-login-time";
pub const ATTR_PWP_CHANGED_BY_REQUIRED_TIME: &str = "ds-pwp-password-changed-by-required-time";
pub const ATTR_PWP_WARNED_TIME: &str = "ds-pwp-warned-time";
pub const ATTR_PWP_POLICY_DN: &str = "ds-pwp-password-policy-dn";

// Object classes with special handling.
pub const OC_TOP: &str = "top";
pub const OC_EXTENSIBLE_OBJECT: &str = "extensibleObject";

// Request and response controls.
pub const OID_ASSERTION_CONTROL: &str = "1.3.6.1.1.12";
pub const OID_NOOP_CONTROL: &str = "1.3.6.1.4.1.4203.1.10.2";
pub const OID_LDAP_READENTRY_PREREAD: &str = "1.3.6.1.1.13.1";
pub const OID_LDAP_READENTRY_POSTREAD: &str = "1.3.6.1.1.13.2";
pub const OID_PROXIED_AUTH_V1: &str = "2.16.840.1.113730.3.4.12";
pub const OID_PROXIED_AUTH_V2: &str = "2.16.840.1.113730.3.4.18";

// Attribute syntaxes that carry passwords.
pub const OID_SYNTAX_USER_PASSWORD: &str = "1.3.6.1.4.1.26027.1.3.1";
pub const OID_SYNTAX_AUTH_PASSWORD: &str = "1.3.6.1.4.1.4203.1.1.2";

// Privilege names as they appear in ds-privilege-name.
pub const PRIVILEGE_BYPASS_ACL: &str = "bypass-acl";
pub const PRIVILEGE_PRIVILEGE_CHANGE: &str = "privilege-change";
pub const PRIVILEGE_PASSWORD_RESET: &str = "password-reset";
pub const PRIVILEGE_PROXIED_AUTH: &str = "proxied-auth";

// Password policy defaults.
pub const DEFAULT_PASSWORD_STORAGE_SCHEME: &str = "SSHA";
/// One week.
pub const DEFAULT_PASSWORD_WARNING_INTERVAL: u64 = 604800;
/// Attempts made by the lock manager before reporting contention.
pub const LOCK_ATTEMPTS: u32 = 3;
/// How long `cancel` waits for the worker to acknowledge.
pub const CANCEL_TIMEOUT_SECS: u64 = 5;
