//! Simple password binds against stored entries.
//!
//! The account state is evaluated in deferred mode so everything the bind
//! changes (failure times, lockout, last login, grace logins, warnings,
//! re-encoded passwords) reaches the backend in one internal update, whether
//! the bind succeeds or not.

use crate::prelude::*;
use crate::pwpolicy::notify::{
    AccountStatusNotificationType, PROPERTY_ACCOUNT_UNLOCK_TIME, PROPERTY_PASSWORD_EXPIRATION_TIME,
    PROPERTY_SECONDS_UNTIL_EXPIRATION, PROPERTY_SECONDS_UNTIL_UNLOCK,
};
use crate::pwpolicy::policy::StateUpdateFailurePolicy;
use crate::pwpolicy::state::{FailureLockout, PasswordPolicyState, StateMode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindResult {
    pub code: ResultCode,
    pub diagnostic: Option<String>,
    /// Set when the password expires in the future and the user should be
    /// warned.
    pub seconds_until_expiration: Option<u64>,
    /// Set when this bind consumed a grace login.
    pub grace_logins_remaining: Option<u32>,
    /// The user must change their password before doing anything else.
    pub must_change: bool,
}

impl BindResult {
    fn success() -> Self {
        BindResult {
            code: ResultCode::Success,
            diagnostic: None,
            seconds_until_expiration: None,
            grace_logins_remaining: None,
            must_change: false,
        }
    }

    fn invalid(diagnostic: impl Into<String>) -> Self {
        BindResult {
            code: ResultCode::InvalidCredentials,
            diagnostic: Some(diagnostic.into()),
            ..BindResult::success()
        }
    }

    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }
}

pub struct PasswordAuthenticator<'a> {
    ctx: &'a ServerContext,
    secure_connection: bool,
}

impl<'a> PasswordAuthenticator<'a> {
    pub fn new(ctx: &'a ServerContext) -> Self {
        PasswordAuthenticator {
            ctx,
            secure_connection: false,
        }
    }

    pub fn with_secure_connection(mut self, secure: bool) -> Self {
        self.secure_connection = secure;
        self
    }

    /// Check `password` for the entry at `dn` at time `now`.
    ///
    /// Errors are failures to read or write the entry. Every authentication
    /// failure is an `InvalidCredentials` result; the reason is logged and
    /// returned as the diagnostic.
    #[instrument(level = "debug", name = "pwpolicy::authenticate", skip_all, fields(dn = %dn))]
    pub fn authenticate(
        &self,
        dn: &Dn,
        password: &str,
        now: Duration,
    ) -> Result<BindResult, DirectoryError> {
        let Some(backend) = self.ctx.backend_for(dn) else {
            security_info!(%dn, "bind to an entry outside every naming context");
            return Ok(BindResult::invalid("invalid credentials"));
        };
        let Some(entry) = backend.get_entry(dn)? else {
            security_info!(%dn, "bind to an entry that does not exist");
            return Ok(BindResult::invalid("invalid credentials"));
        };

        let mut state = {
            let policies = self.ctx.policies();
            PasswordPolicyState::for_entry(&policies, entry, StateMode::Deferred, now)?
        };
        let policy = state.policy().clone();

        if policy.require_secure_authentication && !self.secure_connection {
            security_info!(%dn, "password bind over an insecure connection refused");
            return Ok(BindResult::invalid(
                "the password policy requires a secure connection for authentication",
            ));
        }

        if policy.state_update_failure_policy == StateUpdateFailurePolicy::Proactive
            && !backend.is_private()
            && !backend.writability_mode().permits(true)
        {
            security_error!(%dn, "account state cannot be recorded, refusing bind");
            return Ok(BindResult::invalid(
                "the account state cannot be updated so the bind is refused",
            ));
        }

        if state.get_password_values().is_empty() {
            security_info!(%dn, "bind to an entry without a password");
            return Ok(BindResult::invalid("invalid credentials"));
        }

        if state.is_disabled() {
            security_info!(%dn, "bind to a disabled account");
            return Ok(BindResult::invalid("the account is disabled"));
        }

        if state.is_account_expired() {
            security_info!(%dn, "bind to an expired account");
            state.generate_account_status_notification(
                AccountStatusNotificationType::AccountExpired,
                "the account has expired",
                Vec::new(),
            );
            return Ok(BindResult::invalid("the account has expired"));
        }

        match state.lockout() {
            FailureLockout::NotLocked => {}
            FailureLockout::Permanent => {
                security_info!(%dn, "bind to an account locked by authentication failures");
                state.finalize_state_after_bind(backend.as_ref())?;
                return Ok(BindResult::invalid("the account is locked"));
            }
            FailureLockout::Temporary {
                seconds_until_unlock,
            } => {
                security_info!(%dn, seconds_until_unlock, "bind to a temporarily locked account");
                state.finalize_state_after_bind(backend.as_ref())?;
                return Ok(BindResult::invalid(format!(
                    "the account is locked for another {seconds_until_unlock} seconds"
                )));
            }
        }
        // An expired lockout may have been cleared above; persist that with
        // the rest of the bind.

        if state.is_idle_locked() {
            security_info!(%dn, "bind to an idle locked account");
            state.generate_account_status_notification(
                AccountStatusNotificationType::AccountIdleLocked,
                "the account has been idle for too long",
                Vec::new(),
            );
            state.finalize_state_after_bind(backend.as_ref())?;
            return Ok(BindResult::invalid("the account is locked due to inactivity"));
        }

        if state.is_locked_due_to_maximum_reset_age() {
            security_info!(%dn, "bind to an account whose reset password was never changed");
            state.generate_account_status_notification(
                AccountStatusNotificationType::AccountResetLocked,
                "the reset password was not changed in time",
                Vec::new(),
            );
            state.finalize_state_after_bind(backend.as_ref())?;
            return Ok(BindResult::invalid(
                "the account is locked because the reset password was not changed in time",
            ));
        }

        if !state.password_matches(password) {
            security_info!(%dn, "bind with an incorrect password");
            if policy.lockout_failure_count > 0 {
                state.update_auth_failure_times();
                match state.lockout() {
                    FailureLockout::NotLocked => {}
                    FailureLockout::Permanent => state.generate_account_status_notification(
                        AccountStatusNotificationType::AccountPermanentlyLocked,
                        "the account was locked after too many authentication failures",
                        Vec::new(),
                    ),
                    FailureLockout::Temporary {
                        seconds_until_unlock,
                    } => state.generate_account_status_notification(
                        AccountStatusNotificationType::AccountTemporarilyLocked,
                        "the account was locked after too many authentication failures",
                        vec![
                            (PROPERTY_SECONDS_UNTIL_UNLOCK, seconds_until_unlock.to_string()),
                            (
                                PROPERTY_ACCOUNT_UNLOCK_TIME,
                                GeneralizedTime::format(now + Duration::from_secs(seconds_until_unlock)),
                            ),
                        ],
                    ),
                }
            }
            state.finalize_state_after_bind(backend.as_ref())?;
            return Ok(BindResult::invalid("invalid credentials"));
        }

        let mut result = BindResult::success();

        if policy.lockout_failure_count > 0 {
            state.clear_failure_lockout();
        }
        state.set_last_login_time();

        let expiration = state.expiration();
        if expiration.is_expired {
            let grace_usable = policy.grace_login_count > 0 && expiration.may_use_grace_login;
            let remaining = state.get_grace_logins_remaining();
            if grace_usable && remaining > 0 {
                state.update_grace_login_times();
                result.grace_logins_remaining = Some(remaining - 1);
                security_info!(%dn, remaining = remaining - 1, "bind with an expired password used a grace login");
            } else {
                security_info!(%dn, "bind with an expired password");
                state.generate_account_status_notification(
                    AccountStatusNotificationType::PasswordExpired,
                    "the password has expired",
                    Vec::new(),
                );
                state.finalize_state_after_bind(backend.as_ref())?;
                return Ok(BindResult::invalid("the password has expired"));
            }
        } else if expiration.should_warn {
            let seconds = state.seconds_until_expiration().unwrap_or(0);
            result.seconds_until_expiration = Some(seconds);
            if expiration.is_first_warning {
                let mut properties = vec![(PROPERTY_SECONDS_UNTIL_EXPIRATION, seconds.to_string())];
                if let Some(t) = expiration.expiration_time {
                    properties.push((PROPERTY_PASSWORD_EXPIRATION_TIME, GeneralizedTime::format(t)));
                }
                state.generate_account_status_notification(
                    AccountStatusNotificationType::PasswordExpiring,
                    format!("the password expires in {seconds} seconds"),
                    properties,
                );
            }
        }

        result.must_change = state.must_change_password();
        state.handle_deprecated_storage_schemes(password);
        state.finalize_state_after_bind(backend.as_ref())?;

        security_info!(%dn, must_change = result.must_change, "password bind succeeded");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pwpolicy::notify::{AccountStatusNotification, AccountStatusNotificationHandler};
    use crate::pwpolicy::policy::{ConfigDuration, PasswordPolicyConfig, PolicySet};
    use crate::testkit::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<AccountStatusNotificationType>>);

    impl AccountStatusNotificationHandler for Recorder {
        fn id(&self) -> &str {
            "recorder"
        }

        fn handle_status_notification(&self, n: &AccountStatusNotification) {
            self.0.lock().push(n.notification_type);
        }
    }

    fn install(env: &TestEnv, cfg: PasswordPolicyConfig) -> Arc<Recorder> {
        let recorder = Arc::new(Recorder::default());
        let mut p = test_policy(&env.ctx, cfg);
        p.notification_handlers.push(recorder.clone());
        env.ctx.replace_policies(PolicySet::new(Arc::new(p)));
        recorder
    }

    fn stored(env: &TestEnv) -> Entry {
        env.backend
            .get_entry(&dn(BOB_DN))
            .ok()
            .flatten()
            .unwrap_or_else(|| entry_init!("cn=missing"))
    }

    #[test]
    fn test_bind_success_and_wrong_password() {
        sketching::test_init();
        let env = setup_test_env();
        let auth = PasswordAuthenticator::new(&env.ctx);
        let now = duration_from_epoch_now();

        let r = auth.authenticate(&dn(BOB_DN), BOB_PASSWORD, now);
        assert_eq!(r.map(|r| r.code), Ok(ResultCode::Success));

        let r = auth.authenticate(&dn(BOB_DN), "wrong", now);
        assert_eq!(r.map(|r| r.code), Ok(ResultCode::InvalidCredentials));

        let r = auth.authenticate(&dn("uid=nobody,ou=People,dc=example,dc=com"), "x", now);
        assert_eq!(r.map(|r| r.code), Ok(ResultCode::InvalidCredentials));
    }

    #[test]
    fn test_bind_failures_lock_then_unlock() {
        sketching::test_init();
        let env = setup_test_env();
        let recorder = install(
            &env,
            PasswordPolicyConfig {
                lockout_failure_count: 3,
                lockout_duration: ConfigDuration::Seconds(300),
                ..Default::default()
            },
        );
        let auth = PasswordAuthenticator::new(&env.ctx);
        let now = duration_from_epoch_now();

        for _ in 0..3 {
            let r = auth.authenticate(&dn(BOB_DN), "wrong", now);
            assert_eq!(r.map(|r| r.code), Ok(ResultCode::InvalidCredentials));
        }
        let e = stored(&env);
        assert_eq!(e.get_values(ATTR_PWD_FAILURE_TIME).len(), 3);
        assert!(e.has_attribute(ATTR_PWD_ACCOUNT_LOCKED_TIME));
        assert_eq!(
            recorder.0.lock().clone(),
            vec![AccountStatusNotificationType::AccountTemporarilyLocked]
        );

        // The right password does not help while locked.
        let r = auth.authenticate(&dn(BOB_DN), BOB_PASSWORD, now + Duration::from_secs(10));
        assert_eq!(r.map(|r| r.code), Ok(ResultCode::InvalidCredentials));

        // Once the lockout has passed the account unlocks and failures clear.
        let r = auth.authenticate(&dn(BOB_DN), BOB_PASSWORD, now + Duration::from_secs(301));
        assert_eq!(r.map(|r| r.code), Ok(ResultCode::Success));
        let e = stored(&env);
        assert!(!e.has_attribute(ATTR_PWD_FAILURE_TIME));
        assert!(!e.has_attribute(ATTR_PWD_ACCOUNT_LOCKED_TIME));
    }

    #[test]
    fn test_bind_expired_password_uses_grace_logins() {
        sketching::test_init();
        let env = setup_test_env();
        let recorder = install(
            &env,
            PasswordPolicyConfig {
                max_password_age: ConfigDuration::Text("30 days".to_string()),
                expire_passwords_without_warning: true,
                grace_login_count: 1,
                ..Default::default()
            },
        );
        let auth = PasswordAuthenticator::new(&env.ctx);
        let later = duration_from_epoch_now() + Duration::from_secs(40 * 86400);

        let r = auth.authenticate(&dn(BOB_DN), BOB_PASSWORD, later);
        assert_eq!(r.as_ref().map(|r| r.code), Ok(ResultCode::Success));
        assert_eq!(r.ok().and_then(|r| r.grace_logins_remaining), Some(0));

        let r = auth.authenticate(&dn(BOB_DN), BOB_PASSWORD, later);
        assert_eq!(r.map(|r| r.code), Ok(ResultCode::InvalidCredentials));
        assert_eq!(
            recorder.0.lock().last().copied(),
            Some(AccountStatusNotificationType::PasswordExpired)
        );
    }

    #[test]
    fn test_bind_warns_before_expiry() {
        sketching::test_init();
        let env = setup_test_env();
        let recorder = install(
            &env,
            PasswordPolicyConfig {
                max_password_age: ConfigDuration::Text("30 days".to_string()),
                ..Default::default()
            },
        );
        let auth = PasswordAuthenticator::new(&env.ctx);
        let later = duration_from_epoch_now() + Duration::from_secs(25 * 86400);

        let r = auth.authenticate(&dn(BOB_DN), BOB_PASSWORD, later);
        assert_eq!(r.as_ref().map(|r| r.code), Ok(ResultCode::Success));
        assert_eq!(
            r.ok().and_then(|r| r.seconds_until_expiration),
            Some(7 * 86400)
        );
        assert_eq!(
            recorder.0.lock().clone(),
            vec![AccountStatusNotificationType::PasswordExpiring]
        );
        assert!(stored(&env).has_attribute(ATTR_PWP_WARNED_TIME));
    }

    #[test]
    fn test_bind_refuses_disabled_and_insecure() {
        sketching::test_init();
        let env = setup_test_env();
        let now = duration_from_epoch_now();

        let mut bob = stored(&env);
        bob.add_values(ATTR_PWP_ACCOUNT_DISABLED, true, ["TRUE"]);
        env.backend.load(bob);
        let r = PasswordAuthenticator::new(&env.ctx).authenticate(&dn(BOB_DN), BOB_PASSWORD, now);
        assert_eq!(r.map(|r| r.code), Ok(ResultCode::InvalidCredentials));

        let env = setup_test_env();
        install(
            &env,
            PasswordPolicyConfig {
                require_secure_authentication: true,
                ..Default::default()
            },
        );
        let r = PasswordAuthenticator::new(&env.ctx).authenticate(&dn(BOB_DN), BOB_PASSWORD, now);
        assert_eq!(r.map(|r| r.code), Ok(ResultCode::InvalidCredentials));
        let r = PasswordAuthenticator::new(&env.ctx)
            .with_secure_connection(true)
            .authenticate(&dn(BOB_DN), BOB_PASSWORD, now);
        assert_eq!(r.map(|r| r.code), Ok(ResultCode::Success));
    }

    #[test]
    fn test_bind_reencodes_deprecated_scheme() {
        sketching::test_init();
        let env = setup_test_env();
        install(
            &env,
            PasswordPolicyConfig {
                deprecated_storage_schemes: vec!["BASE64".to_string()],
                ..Default::default()
            },
        );
        let mut bob = stored(&env);
        let _ = bob.remove_attribute(ATTR_USER_PASSWORD);
        bob.add_values(ATTR_USER_PASSWORD, false, ["{BASE64}c2VjcmV0"]);
        env.backend.load(bob);

        let r = PasswordAuthenticator::new(&env.ctx).authenticate(
            &dn(BOB_DN),
            "secret",
            duration_from_epoch_now(),
        );
        assert_eq!(r.map(|r| r.code), Ok(ResultCode::Success));
        let values = stored(&env)
            .get_values(ATTR_USER_PASSWORD)
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        assert_eq!(values.len(), 1);
        assert!(values[0].starts_with("{SSHA}"));
    }
}
