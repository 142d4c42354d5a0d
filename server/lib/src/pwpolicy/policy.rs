//! A [`PasswordPolicy`] is an immutable snapshot of the password rules that
//! apply to a set of users. It is derived once from a [`PasswordPolicyConfig`]
//! and replaced wholesale when configuration changes. Users select a policy
//! through `ds-pwp-password-policy-dn`, and fall back to the default policy of
//! the [`PolicySet`] otherwise.

use std::fmt;

use hashbrown::HashMap;
use serde::Deserialize;

use crate::prelude::*;
use crate::pwpolicy::generator::PasswordGenerator;
use crate::pwpolicy::notify::AccountStatusNotificationHandler;
use crate::pwpolicy::registry::ComponentSet;
use crate::pwpolicy::scheme::{
    decode_auth_password, decode_user_password, PasswordStorageScheme, PasswordSyntax,
};
use crate::pwpolicy::validator::PasswordValidator;
use crate::time::{parse_duration_secs, validate_time_format};

/// A configured length of time, either a number of seconds or a string such
/// as `"30 days"`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ConfigDuration {
    Seconds(i64),
    Text(String),
}

impl Default for ConfigDuration {
    fn default() -> Self {
        ConfigDuration::Seconds(0)
    }
}

impl ConfigDuration {
    /// Negative values disable the feature and become zero.
    pub fn as_secs(&self) -> Result<u64, ConfigError> {
        match self {
            ConfigDuration::Seconds(s) => Ok(u64::try_from(*s).unwrap_or(0)),
            ConfigDuration::Text(t) => parse_duration_secs(t),
        }
    }
}

/// What happens when the state of an account cannot be written back after a
/// bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateUpdateFailurePolicy {
    /// Fail the bind that could not record its state.
    #[default]
    Reactive,
    /// As reactive. Accounts whose state is known to be unwritable are also
    /// refused before the password is checked.
    Proactive,
    /// Log and carry on.
    Ignore,
}

fn default_password_attribute() -> String {
    ATTR_USER_PASSWORD.to_string()
}

fn default_storage_schemes() -> Vec<String> {
    vec![DEFAULT_PASSWORD_STORAGE_SCHEME.to_string()]
}

fn default_true() -> bool {
    true
}

fn default_warning_interval() -> ConfigDuration {
    ConfigDuration::Seconds(DEFAULT_PASSWORD_WARNING_INTERVAL as i64)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct PasswordPolicyConfig {
    /// The DN users name in `ds-pwp-password-policy-dn` to select this policy.
    #[serde(default)]
    pub dn: Option<String>,
    /// Whether this is the policy of users that select none.
    #[serde(default)]
    pub default: bool,
    #[serde(default = "default_password_attribute")]
    pub password_attribute: String,
    #[serde(default = "default_storage_schemes")]
    pub default_storage_schemes: Vec<String>,
    #[serde(default)]
    pub deprecated_storage_schemes: Vec<String>,
    #[serde(default)]
    pub password_validators: Vec<String>,
    #[serde(default)]
    pub account_status_notification_handlers: Vec<String>,
    #[serde(default)]
    pub password_generator: Option<String>,
    #[serde(default)]
    pub allow_expired_password_changes: bool,
    #[serde(default)]
    pub allow_multiple_password_values: bool,
    #[serde(default)]
    pub allow_pre_encoded_passwords: bool,
    #[serde(default = "default_true")]
    pub allow_user_password_changes: bool,
    #[serde(default)]
    pub expire_passwords_without_warning: bool,
    #[serde(default)]
    pub force_change_on_add: bool,
    #[serde(default)]
    pub force_change_on_reset: bool,
    #[serde(default)]
    pub grace_login_count: u32,
    #[serde(default)]
    pub idle_lockout_interval: ConfigDuration,
    #[serde(default)]
    pub last_login_time_attribute: Option<String>,
    #[serde(default)]
    pub last_login_time_format: Option<String>,
    #[serde(default)]
    pub previous_last_login_time_formats: Vec<String>,
    #[serde(default)]
    pub lockout_duration: ConfigDuration,
    #[serde(default)]
    pub lockout_failure_count: u32,
    #[serde(default)]
    pub lockout_failure_expiration_interval: ConfigDuration,
    #[serde(default)]
    pub max_password_age: ConfigDuration,
    #[serde(default)]
    pub max_password_reset_age: ConfigDuration,
    #[serde(default)]
    pub min_password_age: ConfigDuration,
    #[serde(default)]
    pub password_change_requires_current_password: bool,
    #[serde(default = "default_warning_interval")]
    pub password_expiration_warning_interval: ConfigDuration,
    #[serde(default)]
    pub password_history_count: u32,
    #[serde(default)]
    pub password_history_duration: ConfigDuration,
    /// A generalized time by which every user must have changed their password.
    #[serde(default)]
    pub require_change_by_time: Option<String>,
    #[serde(default)]
    pub require_secure_authentication: bool,
    #[serde(default)]
    pub require_secure_password_changes: bool,
    #[serde(default)]
    pub skip_validation_for_administrators: bool,
    #[serde(default)]
    pub state_update_failure_policy: StateUpdateFailurePolicy,
}

impl Default for PasswordPolicyConfig {
    fn default() -> Self {
        PasswordPolicyConfig {
            dn: None,
            default: false,
            password_attribute: default_password_attribute(),
            default_storage_schemes: default_storage_schemes(),
            deprecated_storage_schemes: Vec::new(),
            password_validators: Vec::new(),
            account_status_notification_handlers: Vec::new(),
            password_generator: None,
            allow_expired_password_changes: false,
            allow_multiple_password_values: false,
            allow_pre_encoded_passwords: false,
            allow_user_password_changes: true,
            expire_passwords_without_warning: false,
            force_change_on_add: false,
            force_change_on_reset: false,
            grace_login_count: 0,
            idle_lockout_interval: ConfigDuration::default(),
            last_login_time_attribute: None,
            last_login_time_format: None,
            previous_last_login_time_formats: Vec::new(),
            lockout_duration: ConfigDuration::default(),
            lockout_failure_count: 0,
            lockout_failure_expiration_interval: ConfigDuration::default(),
            max_password_age: ConfigDuration::default(),
            max_password_reset_age: ConfigDuration::default(),
            min_password_age: ConfigDuration::default(),
            password_change_requires_current_password: false,
            password_expiration_warning_interval: default_warning_interval(),
            password_history_count: 0,
            password_history_duration: ConfigDuration::default(),
            require_change_by_time: None,
            require_secure_authentication: false,
            require_secure_password_changes: false,
            skip_validation_for_administrators: false,
            state_update_failure_policy: StateUpdateFailurePolicy::default(),
        }
    }
}

pub struct PasswordPolicy {
    pub dn: Option<Dn>,
    pub password_attribute: String,
    pub syntax: PasswordSyntax,
    pub default_schemes: Vec<Arc<dyn PasswordStorageScheme>>,
    /// Uppercase names of deprecated schemes.
    pub deprecated_schemes: Vec<String>,
    pub validators: Vec<Arc<dyn PasswordValidator>>,
    pub notification_handlers: Vec<Arc<dyn AccountStatusNotificationHandler>>,
    pub generator: Option<Arc<dyn PasswordGenerator>>,
    /// Every scheme known to the server, used to read existing values.
    components: ComponentSet,

    pub allow_expired_password_changes: bool,
    pub allow_multiple_password_values: bool,
    pub allow_pre_encoded_passwords: bool,
    pub allow_user_password_changes: bool,
    pub expire_passwords_without_warning: bool,
    pub force_change_on_add: bool,
    pub force_change_on_reset: bool,
    pub password_change_requires_current_password: bool,
    pub require_secure_authentication: bool,
    pub require_secure_password_changes: bool,
    pub skip_validation_for_administrators: bool,
    pub state_update_failure_policy: StateUpdateFailurePolicy,

    pub grace_login_count: u32,
    pub lockout_failure_count: u32,
    pub password_history_count: u32,

    // Seconds. Zero disables the feature.
    pub idle_lockout_interval: u64,
    pub lockout_duration: u64,
    pub lockout_failure_expiration_interval: u64,
    pub max_password_age: u64,
    pub max_password_reset_age: u64,
    pub min_password_age: u64,
    pub warning_interval: u64,
    pub password_history_duration: u64,

    pub last_login_time_attribute: Option<String>,
    pub last_login_time_format: Option<String>,
    pub previous_last_login_time_formats: Vec<String>,
    pub require_change_by_time: Option<Duration>,
}

impl fmt::Debug for PasswordPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordPolicy")
            .field("dn", &self.dn.as_ref().map(|d| d.to_string()))
            .field("password_attribute", &self.password_attribute)
            .field(
                "default_schemes",
                &self.default_schemes.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("deprecated_schemes", &self.deprecated_schemes)
            .field(
                "validators",
                &self.validators.iter().map(|v| v.id()).collect::<Vec<_>>(),
            )
            .field("lockout_failure_count", &self.lockout_failure_count)
            .field("max_password_age", &self.max_password_age)
            .finish_non_exhaustive()
    }
}

impl PasswordPolicy {
    /// Check a configuration against the schema and the available components
    /// and derive the policy from it.
    pub fn new(
        config: &PasswordPolicyConfig,
        schema: &dyn SchemaTransaction,
        components: &ComponentSet,
    ) -> Result<Self, ConfigError> {
        let dn = config
            .dn
            .as_deref()
            .map(|d| Dn::parse(d).map_err(|_| ConfigError::InvalidDn(d.to_string())))
            .transpose()?;

        let attr = schema
            .get_attribute(&config.password_attribute)
            .ok_or_else(|| ConfigError::UndefinedPasswordAttribute(config.password_attribute.clone()))?;
        let syntax = PasswordSyntax::from_syntax(attr.syntax)
            .ok_or_else(|| ConfigError::InvalidPasswordSyntax(config.password_attribute.clone()))?;

        if config.default_storage_schemes.is_empty() {
            return Err(ConfigError::NoDefaultStorageScheme);
        }
        let default_schemes = config
            .default_storage_schemes
            .iter()
            .map(|name| {
                let scheme = components
                    .scheme(name)
                    .ok_or_else(|| ConfigError::UnknownStorageScheme(name.clone()))?;
                if !scheme.supports(syntax) {
                    return Err(ConfigError::SchemeSyntaxMismatch {
                        scheme: name.clone(),
                        syntax: syntax.to_string(),
                    });
                }
                Ok(scheme)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let deprecated_schemes = config
            .deprecated_storage_schemes
            .iter()
            .map(|name| {
                components
                    .scheme(name)
                    .map(|s| s.name().to_uppercase())
                    .ok_or_else(|| ConfigError::UnknownStorageScheme(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let validators = config
            .password_validators
            .iter()
            .map(|id| {
                components
                    .validator(id)
                    .ok_or_else(|| ConfigError::UnknownValidator(id.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let notification_handlers = config
            .account_status_notification_handlers
            .iter()
            .map(|id| {
                components
                    .handler(id)
                    .ok_or_else(|| ConfigError::UnknownNotificationHandler(id.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let generator = config
            .password_generator
            .as_deref()
            .map(|id| {
                components
                    .generator(id)
                    .ok_or_else(|| ConfigError::UnknownGenerator(id.to_string()))
            })
            .transpose()?;

        let warning_interval = config.password_expiration_warning_interval.as_secs()?;
        if !config.expire_passwords_without_warning && warning_interval == 0 {
            return Err(ConfigError::WarningIntervalRequired);
        }

        if let Some(f) = &config.last_login_time_format {
            validate_time_format(f)?;
        }
        for f in &config.previous_last_login_time_formats {
            validate_time_format(f)?;
        }

        let require_change_by_time = config
            .require_change_by_time
            .as_deref()
            .map(|t| {
                GeneralizedTime::parse(t).map_err(|_| ConfigError::InvalidGeneralizedTime(t.to_string()))
            })
            .transpose()?;

        Ok(PasswordPolicy {
            dn,
            password_attribute: attr.name.clone(),
            syntax,
            default_schemes,
            deprecated_schemes,
            validators,
            notification_handlers,
            generator,
            components: components.clone(),
            allow_expired_password_changes: config.allow_expired_password_changes,
            allow_multiple_password_values: config.allow_multiple_password_values,
            allow_pre_encoded_passwords: config.allow_pre_encoded_passwords,
            allow_user_password_changes: config.allow_user_password_changes,
            expire_passwords_without_warning: config.expire_passwords_without_warning,
            force_change_on_add: config.force_change_on_add,
            force_change_on_reset: config.force_change_on_reset,
            password_change_requires_current_password: config
                .password_change_requires_current_password,
            require_secure_authentication: config.require_secure_authentication,
            require_secure_password_changes: config.require_secure_password_changes,
            skip_validation_for_administrators: config.skip_validation_for_administrators,
            state_update_failure_policy: config.state_update_failure_policy,
            grace_login_count: config.grace_login_count,
            lockout_failure_count: config.lockout_failure_count,
            password_history_count: config.password_history_count,
            idle_lockout_interval: config.idle_lockout_interval.as_secs()?,
            lockout_duration: config.lockout_duration.as_secs()?,
            lockout_failure_expiration_interval: config
                .lockout_failure_expiration_interval
                .as_secs()?,
            max_password_age: config.max_password_age.as_secs()?,
            max_password_reset_age: config.max_password_reset_age.as_secs()?,
            min_password_age: config.min_password_age.as_secs()?,
            warning_interval,
            password_history_duration: config.password_history_duration.as_secs()?,
            last_login_time_attribute: config.last_login_time_attribute.clone(),
            last_login_time_format: config.last_login_time_format.clone(),
            previous_last_login_time_formats: config.previous_last_login_time_formats.clone(),
            require_change_by_time,
        })
    }

    pub fn is_auth_password_syntax(&self) -> bool {
        self.syntax == PasswordSyntax::AuthPassword
    }

    pub fn is_default_scheme(&self, name: &str) -> bool {
        self.default_schemes
            .iter()
            .any(|s| s.name().eq_ignore_ascii_case(name) || auth_name_is(s.as_ref(), name))
    }

    pub fn is_deprecated_scheme(&self, name: &str) -> bool {
        self.deprecated_schemes
            .iter()
            .any(|d| d.eq_ignore_ascii_case(name))
            || self.deprecated_schemes.iter().any(|d| {
                self.components
                    .scheme(d)
                    .map(|s| auth_name_is(s.as_ref(), name))
                    .unwrap_or(false)
            })
    }

    pub fn maintains_history(&self) -> bool {
        self.password_history_count > 0 || self.password_history_duration > 0
    }

    /// Find the scheme of a stored value in the given syntax and return it
    /// with the parts of the value it needs to check a password.
    pub(crate) fn scheme_for_value<'a>(
        &self,
        value: &'a str,
        syntax: PasswordSyntax,
    ) -> Option<(Arc<dyn PasswordStorageScheme>, StoredValue<'a>)> {
        match syntax {
            PasswordSyntax::UserPassword => {
                let (name, encoded) = decode_user_password(value)?;
                let scheme = self.components.scheme(name)?;
                Some((scheme, StoredValue::User(encoded)))
            }
            PasswordSyntax::AuthPassword => {
                let (name, info, auth_value) = decode_auth_password(value)?;
                let scheme = self.components.auth_scheme(name)?;
                Some((scheme, StoredValue::Auth(info, auth_value)))
            }
        }
    }

    /// Whether `plaintext` matches a stored value of the given syntax.
    pub fn value_matches(&self, plaintext: &str, value: &str, syntax: PasswordSyntax) -> bool {
        match self.scheme_for_value(value, syntax) {
            Some((scheme, StoredValue::User(encoded))) => scheme.matches(plaintext, encoded),
            Some((scheme, StoredValue::Auth(info, v))) => {
                scheme.auth_password_matches(plaintext, info, v)
            }
            None => {
                policy_warn!(?syntax, "stored password value uses an unknown storage scheme");
                false
            }
        }
    }
}

fn auth_name_is(scheme: &dyn PasswordStorageScheme, name: &str) -> bool {
    scheme
        .auth_password_name()
        .map(|n| n.eq_ignore_ascii_case(name))
        .unwrap_or(false)
}

pub(crate) enum StoredValue<'a> {
    User(&'a str),
    Auth(&'a str, &'a str),
}

/// The policies of a server, the default one and those selectable by DN.
#[derive(Debug, Clone)]
pub struct PolicySet {
    default: Arc<PasswordPolicy>,
    by_dn: HashMap<Dn, Arc<PasswordPolicy>>,
}

impl PolicySet {
    pub fn new(default: Arc<PasswordPolicy>) -> Self {
        let mut by_dn = HashMap::new();
        if let Some(dn) = &default.dn {
            by_dn.insert(dn.clone(), default.clone());
        }
        PolicySet { default, by_dn }
    }

    /// The built in policy, every parameter at its default.
    pub fn builtin(schema: &dyn SchemaTransaction, components: &ComponentSet) -> Result<Self, ConfigError> {
        PasswordPolicy::new(&PasswordPolicyConfig::default(), schema, components)
            .map(|p| PolicySet::new(Arc::new(p)))
    }

    /// Build every configured policy. Exactly one must be the default and
    /// policy DNs must be unique.
    pub fn from_configs(
        configs: &[PasswordPolicyConfig],
        schema: &dyn SchemaTransaction,
        components: &ComponentSet,
    ) -> Result<Self, ConfigError> {
        let mut default = None;
        let mut others = Vec::with_capacity(configs.len());
        for c in configs {
            let p = Arc::new(PasswordPolicy::new(c, schema, components)?);
            if c.default {
                if default.is_some() {
                    return Err(ConfigError::Duplicate("default password policy".to_string()));
                }
                default = Some(p);
            } else {
                others.push(p);
            }
        }
        let mut set = PolicySet::new(default.ok_or(ConfigError::NoDefaultPolicy)?);
        for p in others {
            set = set.with_policy(p)?;
        }
        Ok(set)
    }

    /// Add a policy selectable by its DN.
    pub fn with_policy(mut self, policy: Arc<PasswordPolicy>) -> Result<Self, ConfigError> {
        let dn = policy
            .dn
            .clone()
            .ok_or_else(|| ConfigError::InvalidDn("a non default policy needs a dn".to_string()))?;
        if self.by_dn.insert(dn.clone(), policy).is_some() {
            return Err(ConfigError::Duplicate(format!("password policy {dn}")));
        }
        Ok(self)
    }

    pub fn default_policy(&self) -> &Arc<PasswordPolicy> {
        &self.default
    }

    pub fn get(&self, dn: &Dn) -> Option<&Arc<PasswordPolicy>> {
        self.by_dn.get(dn)
    }

    pub fn len(&self) -> usize {
        self.by_dn.len() + usize::from(self.default.dn.is_none())
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// The policy that governs a user. A user naming a policy that does not
    /// exist is a constraint violation rather than silently falling back.
    pub fn policy_for(&self, entry: &Entry) -> Result<Arc<PasswordPolicy>, DirectoryError> {
        let Some(v) = entry.first_value(ATTR_PWP_POLICY_DN) else {
            return Ok(self.default.clone());
        };
        let dn = Dn::parse(v).map_err(|_| {
            DirectoryError::constraint_violation(format!(
                "{ATTR_PWP_POLICY_DN} of {} is not a valid dn: {v:?}",
                entry.dn()
            ))
        })?;
        self.by_dn.get(&dn).cloned().ok_or_else(|| {
            policy_warn!(user = %entry.dn(), policy = %dn, "user names an unknown password policy");
            DirectoryError::constraint_violation(format!(
                "password policy {dn} named by {} does not exist",
                entry.dn()
            ))
        })
    }
}
