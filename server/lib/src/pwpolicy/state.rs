//! The password policy state of one user entry, evaluated at one fixed time.
//!
//! Every derived value is computed at most once and cached. Mutations update
//! the cache and the working copy of the entry. In [`StateMode::Deferred`]
//! each mutation is also recorded as a [`Modification`] so the caller can
//! persist the whole state change in a single internal update.

use std::collections::BTreeMap;

use crate::modify::{m_add, m_delete, m_replace};
use crate::prelude::*;
use crate::pwpolicy::notify::{
    AccountStatusNotification, AccountStatusNotificationType, PROPERTY_POLICY_DN,
};
use crate::pwpolicy::policy::{PasswordPolicy, PolicySet, StateUpdateFailurePolicy};
use crate::pwpolicy::scheme::PasswordSyntax;
use crate::time::{format_with, parse_with};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateMode {
    /// Mutate the entry being built, as for a new entry.
    Direct,
    /// Mutate a working copy and collect modifications, as for a stored entry.
    Deferred,
}

/// Everything decided about password expiration in one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirationState {
    /// `None` when the password never expires.
    pub expiration_time: Option<Duration>,
    pub should_warn: bool,
    pub is_first_warning: bool,
    pub is_expired: bool,
    pub may_use_grace_login: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureLockout {
    NotLocked,
    /// Locked until an administrator unlocks the account.
    Permanent,
    Temporary { seconds_until_unlock: u64 },
}

impl FailureLockout {
    pub fn is_locked(self) -> bool {
        self != FailureLockout::NotLocked
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    if v.eq_ignore_ascii_case("true") {
        Some(true)
    } else if v.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

/// The next timestamp for a multi valued time attribute: now, unless that
/// would not sort after the latest existing value.
fn next_unique_time(existing: &[Duration], now: Duration) -> Duration {
    match existing.iter().max() {
        Some(max) if *max + Duration::from_millis(1) >= now => *max + Duration::from_millis(1),
        _ => now,
    }
}

pub struct PasswordPolicyState {
    policy: Arc<PasswordPolicy>,
    entry: Entry,
    mode: StateMode,
    current_time: Duration,
    modifications: Vec<Modification>,

    password_changed_time: Option<Duration>,
    expiration: Option<ExpirationState>,
    failure_times: Option<Vec<Duration>>,
    failure_locked_time: Option<Option<Duration>>,
    grace_times: Option<Vec<Duration>>,
    last_login_time: Option<Option<Duration>>,
    warned_time: Option<Option<Duration>>,
    required_change_time: Option<Option<Duration>>,
    must_change: Option<bool>,
    disabled: Option<bool>,
    account_expired: Option<bool>,
    idle_locked: Option<bool>,
}

impl PasswordPolicyState {
    pub fn new(
        policy: Arc<PasswordPolicy>,
        entry: Entry,
        mode: StateMode,
        current_time: Duration,
    ) -> Self {
        PasswordPolicyState {
            policy,
            entry,
            mode,
            current_time,
            modifications: Vec::new(),
            password_changed_time: None,
            expiration: None,
            failure_times: None,
            failure_locked_time: None,
            grace_times: None,
            last_login_time: None,
            warned_time: None,
            required_change_time: None,
            must_change: None,
            disabled: None,
            account_expired: None,
            idle_locked: None,
        }
    }

    /// Resolve the policy of `entry` from `policies` and build its state.
    pub fn for_entry(
        policies: &PolicySet,
        entry: Entry,
        mode: StateMode,
        current_time: Duration,
    ) -> Result<Self, DirectoryError> {
        let policy = policies.policy_for(&entry)?;
        Ok(PasswordPolicyState::new(policy, entry, mode, current_time))
    }

    pub fn policy(&self) -> &Arc<PasswordPolicy> {
        &self.policy
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn current_time(&self) -> Duration {
        self.current_time
    }

    /// The modifications recorded so far, in order. Always empty in direct mode.
    pub fn modifications(&self) -> &[Modification] {
        &self.modifications
    }

    pub fn into_entry(self) -> Entry {
        self.entry
    }

    fn record(&mut self, m: Modification) {
        if let Err(e) = self.entry.apply_modification(&m, true) {
            admin_error!(dn = %self.entry.dn(), modification = %m, ?e, "unable to update password policy state");
            return;
        }
        if self.mode == StateMode::Deferred {
            self.modifications.push(m);
        }
    }

    fn time_values(&self, attr: &str) -> Vec<Duration> {
        self.entry
            .get_values(attr)
            .into_iter()
            .filter_map(|v| match GeneralizedTime::parse(v) {
                Ok(t) => Some(t),
                Err(_) => {
                    policy_warn!(dn = %self.entry.dn(), %attr, value = %v, "ignoring invalid time value");
                    None
                }
            })
            .collect()
    }

    /// The single time value of `attr`. A value that does not parse is an
    /// error so callers can pick the safe interpretation.
    fn time_value(&self, attr: &str) -> Result<Option<Duration>, ()> {
        match self.entry.first_value(attr) {
            None => Ok(None),
            Some(v) => GeneralizedTime::parse(v).map(Some).map_err(|_| {
                policy_warn!(dn = %self.entry.dn(), %attr, value = %v, "invalid time value");
            }),
        }
    }

    fn set_time(&mut self, attr: &str, t: Option<Duration>) {
        match t {
            Some(t) => self.record(m_replace(attr, [GeneralizedTime::format(t)])),
            None => self.record(m_replace::<String>(attr, [])),
        }
    }

    /* ===== password changed time ===== */

    /// `pwdChangedTime`, else the creation time of the entry, else the epoch.
    pub fn get_password_changed_time(&mut self) -> Duration {
        if let Some(t) = self.password_changed_time {
            return t;
        }
        let t = self
            .time_value(ATTR_PWD_CHANGED_TIME)
            .ok()
            .flatten()
            .or_else(|| self.time_value(ATTR_CREATE_TIMESTAMP).ok().flatten())
            .unwrap_or_default();
        self.password_changed_time = Some(t);
        t
    }

    pub fn set_password_changed_time(&mut self, t: Duration) {
        if self.entry.has_attribute(ATTR_PWD_CHANGED_TIME) && self.password_changed_time == Some(t)
        {
            return;
        }
        self.password_changed_time = Some(t);
        self.expiration = None;
        self.set_time(ATTR_PWD_CHANGED_TIME, Some(t));
    }

    pub fn clear_password_changed_time(&mut self) {
        if !self.entry.has_attribute(ATTR_PWD_CHANGED_TIME) {
            return;
        }
        self.set_time(ATTR_PWD_CHANGED_TIME, None);
        self.password_changed_time = None;
        self.expiration = None;
    }

    /* ===== disabled and expired accounts ===== */

    /// An unreadable flag counts as disabled.
    pub fn is_disabled(&mut self) -> bool {
        if let Some(d) = self.disabled {
            return d;
        }
        let d = match self.entry.first_value(ATTR_PWP_ACCOUNT_DISABLED) {
            None => false,
            Some(v) => parse_bool(v).unwrap_or_else(|| {
                policy_warn!(dn = %self.entry.dn(), value = %v, "invalid account disabled flag, treating as disabled");
                true
            }),
        };
        self.disabled = Some(d);
        d
    }

    pub fn set_disabled(&mut self, disabled: bool) {
        if self.is_disabled() == disabled {
            return;
        }
        self.disabled = Some(disabled);
        if disabled {
            self.record(m_replace(ATTR_PWP_ACCOUNT_DISABLED, ["TRUE"]));
        } else {
            self.record(m_replace::<String>(ATTR_PWP_ACCOUNT_DISABLED, []));
        }
    }

    pub fn get_account_expiration_time(&self) -> Option<Duration> {
        self.time_value(ATTR_PWP_ACCOUNT_EXPIRATION_TIME).ok().flatten()
    }

    /// An unreadable expiration time counts as expired.
    pub fn is_account_expired(&mut self) -> bool {
        if let Some(e) = self.account_expired {
            return e;
        }
        let e = match self.time_value(ATTR_PWP_ACCOUNT_EXPIRATION_TIME) {
            Ok(None) => false,
            Ok(Some(t)) => t <= self.current_time,
            Err(()) => true,
        };
        self.account_expired = Some(e);
        e
    }

    pub fn set_account_expiration_time(&mut self, t: Duration) {
        self.account_expired = Some(t <= self.current_time);
        self.set_time(ATTR_PWP_ACCOUNT_EXPIRATION_TIME, Some(t));
    }

    pub fn clear_account_expiration_time(&mut self) {
        if !self.entry.has_attribute(ATTR_PWP_ACCOUNT_EXPIRATION_TIME) {
            return;
        }
        self.account_expired = Some(false);
        self.set_time(ATTR_PWP_ACCOUNT_EXPIRATION_TIME, None);
    }

    /* ===== authentication failures and lockout ===== */

    /// The failure times still inside the failure expiration interval. Expired
    /// values are removed from the entry the first time this is read.
    pub fn get_auth_failure_times(&mut self) -> Vec<Duration> {
        if let Some(times) = &self.failure_times {
            return times.clone();
        }
        let mut times = self.time_values(ATTR_PWD_FAILURE_TIME);
        let interval = self.policy.lockout_failure_expiration_interval;
        if interval > 0 && !times.is_empty() {
            let cutoff = self.current_time.saturating_sub(secs(interval));
            let (expired, live): (Vec<_>, Vec<_>) = times.into_iter().partition(|t| *t < cutoff);
            if !expired.is_empty() {
                policy_info!(dn = %self.entry.dn(), expired = expired.len(), "removing expired authentication failures");
                let values: Vec<String> = self
                    .entry
                    .get_values(ATTR_PWD_FAILURE_TIME)
                    .into_iter()
                    .filter(|v| {
                        GeneralizedTime::parse(v)
                            .map(|t| t < cutoff)
                            .unwrap_or(false)
                    })
                    .map(str::to_string)
                    .collect();
                self.record(m_delete(ATTR_PWD_FAILURE_TIME, values));
            }
            times = live;
        }
        times.sort();
        self.failure_times = Some(times.clone());
        times
    }

    /// Record a failed authentication now. Reaching the configured number of
    /// failures locks the account.
    pub fn update_auth_failure_times(&mut self) {
        let mut times = self.get_auth_failure_times();
        let t = next_unique_time(&times, self.current_time);
        times.push(t);
        self.record(m_add(ATTR_PWD_FAILURE_TIME, [GeneralizedTime::format(t)]));
        let count = times.len();
        self.failure_times = Some(times);

        let limit = self.policy.lockout_failure_count as usize;
        if limit > 0 && count >= limit {
            self.set_failure_locked_time();
        }
    }

    pub fn clear_auth_failure_times(&mut self) {
        if self.failure_times.as_ref().map(|t| t.is_empty()).unwrap_or(false)
            && !self.entry.has_attribute(ATTR_PWD_FAILURE_TIME)
        {
            return;
        }
        self.failure_times = Some(Vec::new());
        if self.entry.has_attribute(ATTR_PWD_FAILURE_TIME) {
            self.record(m_replace::<String>(ATTR_PWD_FAILURE_TIME, []));
        }
    }

    pub fn get_failure_locked_time(&mut self) -> Option<Duration> {
        self.read_failure_locked_time().ok().flatten()
    }

    fn read_failure_locked_time(&mut self) -> Result<Option<Duration>, ()> {
        if let Some(t) = self.failure_locked_time {
            return Ok(t);
        }
        let t = self.time_value(ATTR_PWD_ACCOUNT_LOCKED_TIME)?;
        self.failure_locked_time = Some(t);
        Ok(t)
    }

    pub fn set_failure_locked_time(&mut self) {
        let now = self.current_time;
        if self.failure_locked_time == Some(Some(now)) {
            return;
        }
        security_info!(dn = %self.entry.dn(), "account locked after repeated authentication failures");
        self.failure_locked_time = Some(Some(now));
        self.set_time(ATTR_PWD_ACCOUNT_LOCKED_TIME, Some(now));
    }

    pub fn clear_failure_locked_time(&mut self) {
        if !self.entry.has_attribute(ATTR_PWD_ACCOUNT_LOCKED_TIME) {
            self.failure_locked_time = Some(None);
            return;
        }
        self.failure_locked_time = Some(None);
        self.set_time(ATTR_PWD_ACCOUNT_LOCKED_TIME, None);
    }

    /// Unlock the account and forget its failures.
    pub fn clear_failure_lockout(&mut self) {
        self.clear_auth_failure_times();
        self.clear_failure_locked_time();
    }

    /// Whether repeated failures have locked the account. An account with
    /// enough failures but no locked time is locked now. An expired lockout is
    /// cleared.
    pub fn lockout(&mut self) -> FailureLockout {
        let limit = self.policy.lockout_failure_count as usize;
        if limit == 0 {
            return FailureLockout::NotLocked;
        }
        let locked_time = match self.read_failure_locked_time() {
            Ok(t) => t,
            Err(()) => return FailureLockout::Permanent,
        };
        let Some(locked_time) = locked_time else {
            if self.get_auth_failure_times().len() >= limit {
                self.set_failure_locked_time();
                return self.lockout_after(self.current_time);
            }
            return FailureLockout::NotLocked;
        };
        match self.lockout_after(locked_time) {
            FailureLockout::NotLocked => {
                policy_info!(dn = %self.entry.dn(), "failure lockout expired");
                self.clear_failure_lockout();
                FailureLockout::NotLocked
            }
            locked => locked,
        }
    }

    fn lockout_after(&self, locked_time: Duration) -> FailureLockout {
        let duration = self.policy.lockout_duration;
        if duration == 0 {
            return FailureLockout::Permanent;
        }
        let unlock = locked_time + secs(duration);
        if unlock > self.current_time {
            FailureLockout::Temporary {
                seconds_until_unlock: (unlock - self.current_time).as_secs().max(1),
            }
        } else {
            FailureLockout::NotLocked
        }
    }

    pub fn is_locked_due_to_failures(&mut self) -> bool {
        self.lockout().is_locked()
    }

    /* ===== last login and idle lockout ===== */

    pub fn get_last_login_time(&mut self) -> Option<Duration> {
        if let Some(t) = self.last_login_time {
            return t;
        }
        let t = self.read_last_login_time();
        self.last_login_time = Some(t);
        t
    }

    fn read_last_login_time(&self) -> Option<Duration> {
        let attr = self.policy.last_login_time_attribute.as_deref()?;
        let format = self.policy.last_login_time_format.as_deref()?;
        let value = self.entry.first_value(attr)?;
        let parsed = std::iter::once(format)
            .chain(self.policy.previous_last_login_time_formats.iter().map(String::as_str))
            .find_map(|f| parse_with(f, value));
        if parsed.is_none() {
            policy_warn!(dn = %self.entry.dn(), %attr, %value, "last login time matches no configured format");
        }
        parsed
    }

    /// Stamp the current time with the configured format. Does nothing when the
    /// policy does not track logins.
    pub fn set_last_login_time(&mut self) {
        let (Some(attr), Some(format)) = (
            self.policy.last_login_time_attribute.clone(),
            self.policy.last_login_time_format.clone(),
        ) else {
            return;
        };
        let Some(value) = format_with(&format, self.current_time) else {
            admin_error!(%format, "unable to format the last login time");
            return;
        };
        if self.entry.first_value(&attr) == Some(value.as_str()) {
            return;
        }
        self.record(m_replace(&attr, [value]));
        // Reading back through the format may lose precision.
        self.last_login_time = Some(self.read_last_login_time());
        self.idle_locked = Some(false);
    }

    pub fn clear_last_login_time(&mut self) {
        let Some(attr) = self.policy.last_login_time_attribute.clone() else {
            return;
        };
        if !self.entry.has_attribute(&attr) {
            return;
        }
        self.record(m_replace::<String>(&attr, []));
        self.last_login_time = Some(None);
        self.idle_locked = None;
    }

    /// Locked when neither a login nor a password change happened within the
    /// idle lockout interval.
    pub fn is_idle_locked(&mut self) -> bool {
        if let Some(l) = self.idle_locked {
            return l;
        }
        let interval = self.policy.idle_lockout_interval;
        let locked = if interval == 0 {
            false
        } else {
            let cutoff = self.current_time.saturating_sub(secs(interval));
            let last_login_recent = self
                .get_last_login_time()
                .map(|t| t > cutoff)
                .unwrap_or(false);
            !(last_login_recent || self.get_password_changed_time() > cutoff)
        };
        self.idle_locked = Some(locked);
        locked
    }

    /* ===== forced changes ===== */

    /// Whether the user must change their password before doing anything
    /// else. Only meaningful when the policy forces changes at all.
    pub fn must_change_password(&mut self) -> bool {
        if let Some(m) = self.must_change {
            return m;
        }
        let p = &self.policy;
        let m = if !p.allow_user_password_changes
            || !(p.force_change_on_add || p.force_change_on_reset)
        {
            false
        } else {
            match self.entry.first_value(ATTR_PWD_RESET) {
                None => false,
                Some(v) => parse_bool(v).unwrap_or_else(|| {
                    policy_warn!(dn = %self.entry.dn(), value = %v, "invalid password reset flag, treating as set");
                    true
                }),
            }
        };
        self.must_change = Some(m);
        m
    }

    pub fn set_must_change_password(&mut self, must_change: bool) {
        if self.must_change == Some(must_change)
            && self.entry.has_attribute(ATTR_PWD_RESET) == must_change
        {
            return;
        }
        self.must_change = Some(must_change);
        self.expiration = None;
        if must_change {
            self.record(m_replace(ATTR_PWD_RESET, ["TRUE"]));
        } else if self.entry.has_attribute(ATTR_PWD_RESET) {
            self.record(m_replace::<String>(ATTR_PWD_RESET, []));
        }
    }

    /// Locked when a forced change was not made within the reset age.
    pub fn is_locked_due_to_maximum_reset_age(&mut self) -> bool {
        let max_reset_age = self.policy.max_password_reset_age;
        if max_reset_age == 0 || !self.must_change_password() {
            return false;
        }
        self.get_password_changed_time() + secs(max_reset_age) < self.current_time
    }

    /* ===== expiration ===== */

    pub fn get_required_change_time(&mut self) -> Option<Duration> {
        if let Some(t) = self.required_change_time {
            return t;
        }
        let t = self.time_value(ATTR_PWP_CHANGED_BY_REQUIRED_TIME).ok().flatten();
        self.required_change_time = Some(t);
        t
    }

    /// Note that the user has complied with the policy's required change time.
    pub fn set_required_change_time(&mut self) {
        let Some(t) = self.policy.require_change_by_time else {
            return;
        };
        if self.get_required_change_time() == Some(t) {
            return;
        }
        self.required_change_time = Some(Some(t));
        self.expiration = None;
        self.set_time(ATTR_PWP_CHANGED_BY_REQUIRED_TIME, Some(t));
    }

    pub fn clear_required_change_time(&mut self) {
        if self.get_required_change_time().is_none() {
            return;
        }
        self.required_change_time = Some(None);
        self.expiration = None;
        self.set_time(ATTR_PWP_CHANGED_BY_REQUIRED_TIME, None);
    }

    pub fn get_warned_time(&mut self) -> Option<Duration> {
        if let Some(t) = self.warned_time {
            return t;
        }
        let t = self.time_value(ATTR_PWP_WARNED_TIME).ok().flatten();
        self.warned_time = Some(t);
        t
    }

    pub fn set_warned_time(&mut self, t: Duration) {
        if self.get_warned_time() == Some(t) {
            return;
        }
        self.warned_time = Some(Some(t));
        self.set_time(ATTR_PWP_WARNED_TIME, Some(t));
    }

    pub fn clear_warned_time(&mut self) {
        if self.get_warned_time().is_none() {
            return;
        }
        self.warned_time = Some(None);
        self.set_time(ATTR_PWP_WARNED_TIME, None);
    }

    /// Decide expiration, warning and grace login eligibility together. The
    /// first call that issues a warning records the warned time. A password
    /// is expired only once the current time is strictly past its expiration
    /// time.
    pub fn expiration(&mut self) -> ExpirationState {
        if let Some(e) = self.expiration {
            return e;
        }
        let now = self.current_time;
        let changed = self.get_password_changed_time();
        let p = self.policy.clone();

        let mut expiration: Option<Duration> = None;
        let mut check_warning = false;
        if p.max_password_age > 0 {
            expiration = Some(changed + secs(p.max_password_age));
            check_warning = true;
        }
        if p.max_password_reset_age > 0 && self.must_change_password() {
            let t = changed + secs(p.max_password_reset_age);
            if expiration.map(|e| t < e).unwrap_or(true) {
                expiration = Some(t);
                check_warning = false;
            }
        }
        if let Some(required) = p.require_change_by_time {
            if self.get_required_change_time() != Some(required)
                && expiration.map(|e| required < e).unwrap_or(true)
            {
                expiration = Some(required);
                check_warning = true;
            }
        }

        let state = match expiration {
            None => ExpirationState {
                expiration_time: None,
                should_warn: false,
                is_first_warning: false,
                is_expired: false,
                may_use_grace_login: true,
            },
            Some(exp) if check_warning && p.warning_interval > 0 => {
                let interval = secs(p.warning_interval);
                let quiet = |exp: Duration, is_expired: bool| ExpirationState {
                    expiration_time: Some(exp),
                    should_warn: false,
                    is_first_warning: false,
                    is_expired,
                    may_use_grace_login: true,
                };
                let warn = |exp: Duration, is_first_warning: bool| ExpirationState {
                    expiration_time: Some(exp),
                    should_warn: true,
                    is_first_warning,
                    is_expired: false,
                    may_use_grace_login: true,
                };
                let warned = self.get_warned_time();

                if exp.saturating_sub(interval) > now {
                    quiet(exp, false)
                } else if exp > now {
                    match warned {
                        None => {
                            self.set_warned_time(now);
                            let exp = if p.expire_passwords_without_warning {
                                exp
                            } else {
                                now + interval
                            };
                            warn(exp, true)
                        }
                        Some(warned) => {
                            let exp = if p.expire_passwords_without_warning {
                                exp
                            } else {
                                warned + interval
                            };
                            warn(exp, false)
                        }
                    }
                } else if p.expire_passwords_without_warning {
                    quiet(exp, true)
                } else {
                    // Past the expiration time, but the user is owed a full
                    // warning interval from the first warning.
                    match warned {
                        Some(warned) if warned + interval > now => warn(warned + interval, false),
                        Some(warned) => quiet(warned + interval, true),
                        None => {
                            self.set_warned_time(now);
                            warn(now + interval, true)
                        }
                    }
                }
            }
            Some(exp) => ExpirationState {
                expiration_time: Some(exp),
                should_warn: false,
                is_first_warning: false,
                is_expired: exp < now,
                may_use_grace_login: check_warning,
            },
        };
        policy_info!(dn = %self.entry.dn(), ?state, "password expiration evaluated");
        self.expiration = Some(state);
        state
    }

    pub fn get_password_expiration_time(&mut self) -> Option<Duration> {
        self.expiration().expiration_time
    }

    pub fn is_password_expired(&mut self) -> bool {
        self.expiration().is_expired
    }

    pub fn should_warn(&mut self) -> bool {
        self.expiration().should_warn
    }

    pub fn is_first_warning(&mut self) -> bool {
        self.expiration().is_first_warning
    }

    pub fn may_use_grace_login(&mut self) -> bool {
        self.expiration().may_use_grace_login
    }

    pub fn seconds_until_expiration(&mut self) -> Option<u64> {
        let now = self.current_time;
        self.get_password_expiration_time()
            .map(|e| e.saturating_sub(now).as_secs())
    }

    /// Too soon after the last change to change the password again.
    pub fn is_within_minimum_age(&mut self) -> bool {
        let min_age = self.policy.min_password_age;
        min_age > 0 && self.get_password_changed_time() + secs(min_age) > self.current_time
    }

    /* ===== grace logins ===== */

    pub fn get_grace_login_times(&mut self) -> Vec<Duration> {
        if let Some(t) = &self.grace_times {
            return t.clone();
        }
        let mut t = self.time_values(ATTR_PWD_GRACE_USE_TIME);
        t.sort();
        self.grace_times = Some(t.clone());
        t
    }

    pub fn get_grace_logins_remaining(&mut self) -> u32 {
        let used = self.get_grace_login_times().len();
        (self.policy.grace_login_count as usize).saturating_sub(used) as u32
    }

    pub fn update_grace_login_times(&mut self) {
        let mut times = self.get_grace_login_times();
        let t = next_unique_time(&times, self.current_time);
        times.push(t);
        self.record(m_add(ATTR_PWD_GRACE_USE_TIME, [GeneralizedTime::format(t)]));
        self.grace_times = Some(times);
    }

    pub fn clear_grace_login_times(&mut self) {
        if !self.entry.has_attribute(ATTR_PWD_GRACE_USE_TIME) {
            self.grace_times = Some(Vec::new());
            return;
        }
        self.grace_times = Some(Vec::new());
        self.record(m_replace::<String>(ATTR_PWD_GRACE_USE_TIME, []));
    }

    /* ===== password values ===== */

    pub fn get_password_values(&self) -> Vec<String> {
        self.entry
            .get_values(&self.policy.password_attribute)
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    pub fn password_matches(&self, plaintext: &str) -> bool {
        let syntax = self.policy.syntax;
        self.entry
            .get_values(&self.policy.password_attribute)
            .into_iter()
            .any(|v| self.policy.value_matches(plaintext, v, syntax))
    }

    pub fn is_pre_encoded(&self, value: &str) -> bool {
        self.policy.syntax.is_encoded(value)
    }

    /// Encode with every default scheme, in order.
    pub fn encode_password(&self, plaintext: &str) -> Result<Vec<String>, DirectoryError> {
        self.policy
            .default_schemes
            .iter()
            .map(|s| s.encode_with_syntax(plaintext, self.policy.syntax))
            .collect()
    }

    /// Run every validator of the policy. The first rejection wins.
    pub fn password_is_acceptable(&self, new_password: &str) -> Result<(), String> {
        for v in self.policy.validators.iter() {
            if let Err(reason) = v.validate(new_password, &self.entry) {
                policy_info!(dn = %self.entry.dn(), validator = v.id(), %reason, "password rejected");
                return Err(reason);
            }
        }
        Ok(())
    }

    /// Replace values stored with a deprecated scheme that match `plaintext`
    /// with encodings in the default schemes. Nothing changes if the result
    /// would leave no password at all.
    pub fn handle_deprecated_storage_schemes(&mut self, plaintext: &str) {
        if self.policy.deprecated_schemes.is_empty() {
            return;
        }
        let syntax = self.policy.syntax;
        let values = self.get_password_values();
        let mut removed = Vec::new();
        let mut present_defaults = Vec::new();
        for v in values.iter() {
            let Some((scheme, _)) = self.policy.scheme_for_value(v, syntax) else {
                continue;
            };
            let name = scheme.name();
            if self.policy.is_deprecated_scheme(name) {
                if self.policy.value_matches(plaintext, v, syntax) {
                    removed.push(v.clone());
                }
            } else if self.policy.is_default_scheme(name) {
                present_defaults.push(name);
            }
        }
        if removed.is_empty() {
            return;
        }

        let mut added = Vec::new();
        for s in self.policy.default_schemes.clone().iter() {
            if present_defaults.contains(&s.name()) {
                continue;
            }
            match s.encode_with_syntax(plaintext, syntax) {
                Ok(v) => added.push(v),
                Err(e) => {
                    admin_error!(scheme = s.name(), ?e, "unable to re-encode a password");
                }
            }
        }

        if values.len() - removed.len() + added.len() == 0 {
            policy_warn!(dn = %self.entry.dn(), "not removing deprecated password values, no value would remain");
            return;
        }
        policy_info!(dn = %self.entry.dn(), removed = removed.len(), added = added.len(), "re-encoding passwords stored with deprecated schemes");
        let attr = self.policy.password_attribute.clone();
        self.record(m_delete(&attr, removed));
        if !added.is_empty() {
            self.record(m_add(&attr, added));
        }
    }

    /* ===== history ===== */

    /// The retained history values by timestamp. Values that do not parse are
    /// skipped.
    fn history(&self) -> BTreeMap<Duration, String> {
        let mut out = BTreeMap::new();
        for v in self.entry.get_values(ATTR_PWD_HISTORY) {
            match v.split('#').next().map(GeneralizedTime::parse) {
                Some(Ok(t)) => {
                    out.insert(t, v.to_string());
                }
                _ => {
                    policy_warn!(dn = %self.entry.dn(), value = %v, "ignoring malformed password history value");
                }
            }
        }
        out
    }

    /// Drop history values beyond the count (making room for `reserve` more)
    /// and older than the duration. Returns the dropped values.
    fn prune_history(&self, history: &mut BTreeMap<Duration, String>, reserve: usize) -> Vec<String> {
        let mut dropped = Vec::new();
        let count = self.policy.password_history_count as usize;
        if count > 0 {
            while history.len() + reserve > count {
                match history.pop_first() {
                    Some((_, v)) => dropped.push(v),
                    None => break,
                }
            }
        }
        let duration = self.policy.password_history_duration;
        if duration > 0 {
            let cutoff = self.current_time.saturating_sub(secs(duration));
            let old: Vec<Duration> = history.range(..cutoff).map(|(t, _)| *t).collect();
            for t in old {
                if let Some(v) = history.remove(&t) {
                    dropped.push(v);
                }
            }
        }
        dropped
    }

    fn history_value_matches(&self, plaintext: &str, value: &str) -> bool {
        let mut parts = value.splitn(3, '#');
        let (Some(_), Some(oid), Some(encoded)) = (parts.next(), parts.next(), parts.next()) else {
            return false;
        };
        let Some(syntax) = PasswordSyntax::from_oid(oid) else {
            policy_warn!(%oid, "password history value uses an unknown syntax");
            return false;
        };
        self.policy.value_matches(plaintext, encoded, syntax)
    }

    /// Whether `plaintext` is a current password or one retained in history.
    pub fn is_password_in_history(&self, plaintext: &str) -> bool {
        if !self.policy.maintains_history() {
            return false;
        }
        if self.password_matches(plaintext) {
            return true;
        }
        let mut history = self.history();
        // The current password takes one of the counted places.
        self.prune_history(&mut history, 1);
        history
            .values()
            .any(|v| self.history_value_matches(plaintext, v))
    }

    /// Add an encoded password to the history, pruning what falls out.
    pub fn add_password_to_history(&mut self, encoded: &str) {
        if !self.policy.maintains_history() {
            return;
        }
        let mut history = self.history();
        let dropped = self.prune_history(&mut history, 1);
        let existing: Vec<Duration> = history.keys().copied().collect();
        let t = next_unique_time(&existing, self.current_time);
        let value = format!(
            "{}#{}#{}",
            GeneralizedTime::format(t),
            self.policy.syntax.oid(),
            encoded
        );
        if !dropped.is_empty() {
            self.record(m_delete(ATTR_PWD_HISTORY, dropped));
        }
        self.record(m_add(ATTR_PWD_HISTORY, [value]));
    }

    /// Move the current password into the history before it is replaced. A
    /// value in a secure scheme is preferred.
    pub fn update_password_history(&mut self) {
        if !self.policy.maintains_history() {
            return;
        }
        let syntax = self.policy.syntax;
        let values = self.get_password_values();
        let chosen = values
            .iter()
            .find(|v| {
                self.policy
                    .scheme_for_value(v, syntax)
                    .map(|(s, _)| s.is_secure())
                    .unwrap_or(false)
            })
            .or_else(|| values.first())
            .cloned();
        if let Some(v) = chosen {
            self.add_password_to_history(&v);
        }
    }

    pub fn clear_password_history(&mut self) {
        if self.entry.has_attribute(ATTR_PWD_HISTORY) {
            self.record(m_replace::<String>(ATTR_PWD_HISTORY, []));
        }
    }

    /* ===== generation and notification ===== */

    /// A new password from the policy's generator, if it has one.
    pub fn generate_password(&self) -> Result<Option<String>, DirectoryError> {
        self.policy
            .generator
            .as_ref()
            .map(|g| g.generate_password(&self.entry))
            .transpose()
    }

    /// Send a notification about this account to every handler of the policy.
    pub fn generate_account_status_notification(
        &self,
        notification_type: AccountStatusNotificationType,
        message: impl Into<String>,
        properties: Vec<(&str, String)>,
    ) {
        if self.policy.notification_handlers.is_empty() {
            return;
        }
        let mut n =
            AccountStatusNotification::new(notification_type, self.entry.dn().clone(), message);
        if let Some(dn) = &self.policy.dn {
            n = n.with_property(PROPERTY_POLICY_DN, dn.to_string());
        }
        for (name, value) in properties {
            n = n.with_property(name, value);
        }
        for h in self.policy.notification_handlers.iter() {
            h.handle_status_notification(&n);
        }
    }

    /* ===== persistence ===== */

    /// Write the recorded modifications to `backend` in one internal update.
    pub fn finalize_state_after_bind(&mut self, backend: &dyn Backend) -> Result<(), DirectoryError> {
        if self.modifications.is_empty() {
            return Ok(());
        }
        let mods = std::mem::take(&mut self.modifications);
        match backend.apply_modifications(&self.entry, &mods) {
            Ok(()) => {
                policy_info!(dn = %self.entry.dn(), count = mods.len(), "password policy state updated");
                Ok(())
            }
            Err(e) if self.policy.state_update_failure_policy == StateUpdateFailurePolicy::Ignore => {
                admin_warn!(dn = %self.entry.dn(), ?e, "unable to update password policy state, ignoring");
                Ok(())
            }
            Err(e) => {
                admin_error!(dn = %self.entry.dn(), ?e, "unable to update password policy state");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::be::MemoryBackend;
    use crate::modify::ModificationType;
    use crate::pwpolicy::policy::{ConfigDuration, PasswordPolicyConfig};
    use crate::pwpolicy::registry::{ComponentConfig, ComponentRegistry, ComponentSetConfig};
    use crate::pwpolicy::scheme::{PasswordStorageScheme, ShaScheme};

    const NOW: u64 = 1_700_000_000;
    const DAY: u64 = 86400;

    fn now() -> Duration {
        secs(NOW)
    }

    fn policy(cfg: PasswordPolicyConfig) -> Arc<PasswordPolicy> {
        let schema = Schema::new();
        let components = ComponentRegistry::new()
            .build(&ComponentSetConfig {
                validators: vec![ComponentConfig::new("length", "length")
                    .with_option("min-length", "8")],
                ..Default::default()
            })
            .expect("components");
        Arc::new(PasswordPolicy::new(&cfg, &schema.read(), &components).expect("policy"))
    }

    fn user() -> Entry {
        entry_init!(
            "uid=bob,ou=People,dc=example,dc=com",
            (ATTR_OBJECTCLASS, "inetOrgPerson"),
            ("uid", "bob"),
            ("cn", "Bob"),
            ("sn", "Smith")
        )
    }

    fn user_with(attrs: &[(&str, String)]) -> Entry {
        let mut e = user();
        for (a, v) in attrs {
            e.add_values(a, true, [v.clone()]);
        }
        e
    }

    fn gt(t: u64) -> String {
        GeneralizedTime::format(secs(t))
    }

    #[test]
    fn test_changed_time_fallbacks() {
        sketching::test_init();
        let p = policy(PasswordPolicyConfig::default());
        let mut s = PasswordPolicyState::new(p.clone(), user(), StateMode::Deferred, now());
        assert_eq!(s.get_password_changed_time(), Duration::ZERO);

        let e = user_with(&[(ATTR_CREATE_TIMESTAMP, gt(NOW - DAY))]);
        let mut s = PasswordPolicyState::new(p.clone(), e, StateMode::Deferred, now());
        assert_eq!(s.get_password_changed_time(), secs(NOW - DAY));

        let e = user_with(&[
            (ATTR_CREATE_TIMESTAMP, gt(NOW - DAY)),
            (ATTR_PWD_CHANGED_TIME, gt(NOW - 60)),
        ]);
        let mut s = PasswordPolicyState::new(p, e, StateMode::Deferred, now());
        assert_eq!(s.get_password_changed_time(), secs(NOW - 60));
    }

    // With no maximum age the password never expires and grace logins stay usable.
    #[test]
    fn test_never_expires() {
        sketching::test_init();
        let p = policy(PasswordPolicyConfig::default());
        let mut s = PasswordPolicyState::new(p, user(), StateMode::Deferred, now());
        let e = s.expiration();
        assert_eq!(e.expiration_time, None);
        assert!(!e.is_expired);
        assert!(!e.should_warn);
        assert!(e.may_use_grace_login);
        assert!(s.modifications().is_empty());
    }

    #[test]
    fn test_expiration_before_warning_window() {
        sketching::test_init();
        let p = policy(PasswordPolicyConfig {
            max_password_age: ConfigDuration::Seconds((30 * DAY) as i64),
            ..Default::default()
        });
        let e = user_with(&[(ATTR_PWD_CHANGED_TIME, gt(NOW - DAY))]);
        let mut s = PasswordPolicyState::new(p, e, StateMode::Deferred, now());
        let state = s.expiration();
        assert_eq!(state.expiration_time, Some(secs(NOW + 29 * DAY)));
        assert!(!state.should_warn);
        assert!(!state.is_expired);
        assert_eq!(s.seconds_until_expiration(), Some(29 * DAY));
    }

    #[test]
    fn test_expiration_first_warning_is_recorded_once() {
        sketching::test_init();
        let p = policy(PasswordPolicyConfig {
            max_password_age: ConfigDuration::Seconds((30 * DAY) as i64),
            ..Default::default()
        });
        // Two days before expiry, inside the one week warning window.
        let e = user_with(&[(ATTR_PWD_CHANGED_TIME, gt(NOW - 28 * DAY))]);
        let mut s = PasswordPolicyState::new(p, e, StateMode::Deferred, now());
        let first = s.expiration();
        assert!(first.should_warn);
        assert!(first.is_first_warning);
        assert!(!first.is_expired);
        // The user gets the full warning interval from the first warning.
        assert_eq!(first.expiration_time, Some(secs(NOW + 7 * DAY)));
        assert_eq!(s.get_warned_time(), Some(now()));

        // Memoized: asking again changes nothing.
        assert_eq!(s.expiration(), first);
        let warned: Vec<_> = s
            .modifications()
            .iter()
            .filter(|m| m.attribute.name() == ATTR_PWP_WARNED_TIME)
            .collect();
        assert_eq!(warned.len(), 1);
    }

    fn warned_mods(s: &PasswordPolicyState) -> usize {
        s.modifications()
            .iter()
            .filter(|m| m.attribute.name() == ATTR_PWP_WARNED_TIME)
            .count()
    }

    fn thirty_day_policy(without_warning: bool) -> Arc<PasswordPolicy> {
        policy(PasswordPolicyConfig {
            max_password_age: ConfigDuration::Seconds((30 * DAY) as i64),
            expire_passwords_without_warning: without_warning,
            ..Default::default()
        })
    }

    #[test]
    fn test_expiration_second_warning_in_window() {
        sketching::test_init();
        let e = user_with(&[
            (ATTR_PWD_CHANGED_TIME, gt(NOW - 28 * DAY)),
            (ATTR_PWP_WARNED_TIME, gt(NOW - DAY)),
        ]);
        let mut s = PasswordPolicyState::new(thirty_day_policy(false), e, StateMode::Deferred, now());
        let state = s.expiration();
        assert!(state.should_warn);
        assert!(!state.is_first_warning);
        assert!(!state.is_expired);
        assert_eq!(state.expiration_time, Some(secs(NOW + 6 * DAY)));
        assert_eq!(warned_mods(&s), 0);
    }

    // Past the maximum age but never warned: the user is warned now and gets a
    // full interval before the password expires.
    #[test]
    fn test_expired_age_first_warning() {
        sketching::test_init();
        let e = user_with(&[(ATTR_PWD_CHANGED_TIME, gt(NOW - 40 * DAY))]);
        let mut s = PasswordPolicyState::new(thirty_day_policy(false), e, StateMode::Deferred, now());
        let state = s.expiration();
        assert!(state.should_warn);
        assert!(state.is_first_warning);
        assert!(!state.is_expired);
        assert_eq!(state.expiration_time, Some(secs(NOW + 7 * DAY)));
        assert_eq!(s.get_warned_time(), Some(now()));
        assert_eq!(warned_mods(&s), 1);
    }

    #[test]
    fn test_expired_age_still_in_warning_interval() {
        sketching::test_init();
        let e = user_with(&[
            (ATTR_PWD_CHANGED_TIME, gt(NOW - 40 * DAY)),
            (ATTR_PWP_WARNED_TIME, gt(NOW - 2 * DAY)),
        ]);
        let mut s = PasswordPolicyState::new(thirty_day_policy(false), e, StateMode::Deferred, now());
        let state = s.expiration();
        assert!(state.should_warn);
        assert!(!state.is_first_warning);
        assert!(!state.is_expired);
        assert_eq!(state.expiration_time, Some(secs(NOW + 5 * DAY)));
        assert_eq!(warned_mods(&s), 0);
    }

    #[test]
    fn test_expired_after_warning() {
        sketching::test_init();
        let e = user_with(&[
            (ATTR_PWD_CHANGED_TIME, gt(NOW - 40 * DAY)),
            (ATTR_PWP_WARNED_TIME, gt(NOW - 14 * DAY)),
        ]);
        let mut s = PasswordPolicyState::new(thirty_day_policy(false), e, StateMode::Deferred, now());
        let state = s.expiration();
        assert!(!state.should_warn);
        assert!(!state.is_first_warning);
        assert!(state.is_expired);
        assert!(state.may_use_grace_login);
        assert_eq!(state.expiration_time, Some(secs(NOW - 7 * DAY)));
        assert_eq!(s.seconds_until_expiration(), Some(0));
        assert_eq!(warned_mods(&s), 0);
    }

    #[test]
    fn test_expired_without_warning() {
        sketching::test_init();
        let e = user_with(&[(ATTR_PWD_CHANGED_TIME, gt(NOW - 31 * DAY))]);
        let mut s = PasswordPolicyState::new(thirty_day_policy(true), e, StateMode::Deferred, now());
        let state = s.expiration();
        assert!(!state.should_warn);
        assert!(!state.is_first_warning);
        assert!(state.is_expired);
        assert!(state.may_use_grace_login);
        assert_eq!(state.expiration_time, Some(secs(NOW - DAY)));
        assert_eq!(s.get_warned_time(), None);
        assert!(s.modifications().is_empty());
    }

    // At the exact expiration instant the password is still valid.
    #[test]
    fn test_expiration_instant_is_not_expired() {
        sketching::test_init();
        let p = policy(PasswordPolicyConfig {
            max_password_age: ConfigDuration::Seconds((30 * DAY) as i64),
            expire_passwords_without_warning: true,
            password_expiration_warning_interval: ConfigDuration::Seconds(0),
            ..Default::default()
        });
        let e = user_with(&[(ATTR_PWD_CHANGED_TIME, gt(NOW - 30 * DAY))]);
        let mut s = PasswordPolicyState::new(p.clone(), e.clone(), StateMode::Deferred, now());
        assert!(!s.is_password_expired());

        let mut s = PasswordPolicyState::new(p, e, StateMode::Deferred, now() + secs(1));
        assert!(s.is_password_expired());
    }

    #[test]
    fn test_expiration_without_warning_interval() {
        sketching::test_init();
        let p = policy(PasswordPolicyConfig {
            max_password_age: ConfigDuration::Seconds((30 * DAY) as i64),
            expire_passwords_without_warning: true,
            password_expiration_warning_interval: ConfigDuration::Seconds(0),
            ..Default::default()
        });
        let e = user_with(&[(ATTR_PWD_CHANGED_TIME, gt(NOW - 31 * DAY))]);
        let mut s = PasswordPolicyState::new(p, e, StateMode::Deferred, now());
        let state = s.expiration();
        assert!(!state.should_warn);
        assert!(state.is_expired);
        assert!(state.may_use_grace_login);
        assert_eq!(s.get_warned_time(), None);
    }

    #[test]
    fn test_reset_age_expiration_has_no_grace() {
        sketching::test_init();
        let p = policy(PasswordPolicyConfig {
            force_change_on_reset: true,
            max_password_reset_age: ConfigDuration::Seconds(DAY as i64),
            ..Default::default()
        });
        let e = user_with(&[
            (ATTR_PWD_CHANGED_TIME, gt(NOW - 2 * DAY)),
            (ATTR_PWD_RESET, "TRUE".to_string()),
        ]);
        let mut s = PasswordPolicyState::new(p, e, StateMode::Deferred, now());
        assert!(s.must_change_password());
        let state = s.expiration();
        assert!(state.is_expired);
        assert!(!state.may_use_grace_login);
        assert!(s.is_locked_due_to_maximum_reset_age());
    }

    #[test]
    fn test_required_change_time() {
        sketching::test_init();
        let p = policy(PasswordPolicyConfig {
            require_change_by_time: Some(gt(NOW - DAY)),
            expire_passwords_without_warning: true,
            ..Default::default()
        });
        let mut s = PasswordPolicyState::new(p.clone(), user(), StateMode::Deferred, now());
        assert!(s.is_password_expired());

        let e = user_with(&[(ATTR_PWP_CHANGED_BY_REQUIRED_TIME, gt(NOW - DAY))]);
        let mut s = PasswordPolicyState::new(p, e, StateMode::Deferred, now());
        assert!(!s.is_password_expired());
        s.clear_required_change_time();
        assert!(s.is_password_expired());
        s.set_required_change_time();
        assert!(!s.is_password_expired());
    }

    // Three failures with a threshold of three lock the account and stamp the
    // locked time.
    #[test]
    fn test_failures_lock_account() {
        sketching::test_init();
        let p = policy(PasswordPolicyConfig {
            lockout_failure_count: 3,
            lockout_duration: ConfigDuration::Seconds(300),
            ..Default::default()
        });
        let mut s = PasswordPolicyState::new(p, user(), StateMode::Deferred, now());
        for _ in 0..3 {
            assert!(!s.is_locked_due_to_failures());
            s.update_auth_failure_times();
        }
        assert_eq!(s.get_auth_failure_times().len(), 3);
        assert_eq!(s.get_failure_locked_time(), Some(now()));
        assert_eq!(
            s.lockout(),
            FailureLockout::Temporary {
                seconds_until_unlock: 300
            }
        );
        assert_eq!(
            s.entry().first_value(ATTR_PWD_ACCOUNT_LOCKED_TIME),
            Some(GeneralizedTime::format(now()).as_str())
        );
        // Failure stamps are unique even within one instant.
        let failures = s.entry().get_values(ATTR_PWD_FAILURE_TIME);
        assert_eq!(failures.len(), 3);
        assert_ne!(failures[0], failures[1]);
    }

    #[test]
    fn test_lockout_expires_and_clears() {
        sketching::test_init();
        let p = policy(PasswordPolicyConfig {
            lockout_failure_count: 2,
            lockout_duration: ConfigDuration::Seconds(300),
            ..Default::default()
        });
        let e = user_with(&[
            (ATTR_PWD_FAILURE_TIME, gt(NOW - 1000)),
            (ATTR_PWD_FAILURE_TIME, gt(NOW - 999)),
            (ATTR_PWD_ACCOUNT_LOCKED_TIME, gt(NOW - 999)),
        ]);
        let mut s = PasswordPolicyState::new(p, e, StateMode::Deferred, now());
        assert_eq!(s.lockout(), FailureLockout::NotLocked);
        assert!(!s.entry().has_attribute(ATTR_PWD_ACCOUNT_LOCKED_TIME));
        assert!(!s.entry().has_attribute(ATTR_PWD_FAILURE_TIME));
        assert_eq!(s.modifications().len(), 2);
    }

    #[test]
    fn test_permanent_and_unreadable_lockout() {
        sketching::test_init();
        let p = policy(PasswordPolicyConfig {
            lockout_failure_count: 2,
            ..Default::default()
        });
        let e = user_with(&[(ATTR_PWD_ACCOUNT_LOCKED_TIME, gt(NOW - 100 * DAY))]);
        let mut s = PasswordPolicyState::new(p.clone(), e, StateMode::Deferred, now());
        assert_eq!(s.lockout(), FailureLockout::Permanent);

        let e = user_with(&[(ATTR_PWD_ACCOUNT_LOCKED_TIME, "garbage".to_string())]);
        let mut s = PasswordPolicyState::new(p, e, StateMode::Deferred, now());
        assert!(s.is_locked_due_to_failures());
    }

    #[test]
    fn test_expired_failures_are_pruned() {
        sketching::test_init();
        let p = policy(PasswordPolicyConfig {
            lockout_failure_count: 3,
            lockout_failure_expiration_interval: ConfigDuration::Seconds(600),
            ..Default::default()
        });
        let e = user_with(&[
            (ATTR_PWD_FAILURE_TIME, gt(NOW - 1200)),
            (ATTR_PWD_FAILURE_TIME, gt(NOW - 60)),
        ]);
        let mut s = PasswordPolicyState::new(p, e, StateMode::Deferred, now());
        assert_eq!(s.get_auth_failure_times(), vec![secs(NOW - 60)]);
        let m = &s.modifications()[0];
        assert_eq!(m.mod_type, ModificationType::Delete);
        assert_eq!(m.attribute.values(), [gt(NOW - 1200)]);
    }

    #[test]
    fn test_idle_lockout() {
        sketching::test_init();
        let p = policy(PasswordPolicyConfig {
            idle_lockout_interval: ConfigDuration::Seconds((30 * DAY) as i64),
            last_login_time_attribute: Some(ATTR_PWP_LAST_LOGIN_TIME.to_string()),
            last_login_time_format: Some("[year][month][day][hour][minute][second]Z".to_string()),
            previous_last_login_time_formats: vec!["[year]-[month]-[day]".to_string()],
            ..Default::default()
        });
        let e = user_with(&[(ATTR_PWD_CHANGED_TIME, gt(NOW - 60 * DAY))]);
        let mut s = PasswordPolicyState::new(p.clone(), e.clone(), StateMode::Deferred, now());
        assert!(s.is_idle_locked());

        let mut recent = e.clone();
        recent.add_values(ATTR_PWP_LAST_LOGIN_TIME, true, ["2023-11-10"]);
        let mut s = PasswordPolicyState::new(p.clone(), recent, StateMode::Deferred, now());
        assert!(s.get_last_login_time().is_some());
        assert!(!s.is_idle_locked());

        let mut s = PasswordPolicyState::new(p, e, StateMode::Deferred, now());
        s.set_last_login_time();
        assert_eq!(s.get_last_login_time(), Some(now()));
        assert!(!s.is_idle_locked());
    }

    #[test]
    fn test_must_change_requires_forcing_policy() {
        sketching::test_init();
        let e = user_with(&[(ATTR_PWD_RESET, "TRUE".to_string())]);
        let lax = policy(PasswordPolicyConfig::default());
        let mut s = PasswordPolicyState::new(lax, e.clone(), StateMode::Deferred, now());
        assert!(!s.must_change_password());

        let strict = policy(PasswordPolicyConfig {
            force_change_on_add: true,
            ..Default::default()
        });
        let mut s = PasswordPolicyState::new(strict.clone(), e, StateMode::Deferred, now());
        assert!(s.must_change_password());
        s.set_must_change_password(false);
        assert!(!s.entry().has_attribute(ATTR_PWD_RESET));

        let odd = user_with(&[(ATTR_PWD_RESET, "maybe".to_string())]);
        let mut s = PasswordPolicyState::new(strict, odd, StateMode::Deferred, now());
        assert!(s.must_change_password());
    }

    #[test]
    fn test_disabled_and_expired_accounts() {
        sketching::test_init();
        let p = policy(PasswordPolicyConfig::default());
        let e = user_with(&[
            (ATTR_PWP_ACCOUNT_DISABLED, "true".to_string()),
            (ATTR_PWP_ACCOUNT_EXPIRATION_TIME, gt(NOW - 1)),
        ]);
        let mut s = PasswordPolicyState::new(p.clone(), e, StateMode::Deferred, now());
        assert!(s.is_disabled());
        assert!(s.is_account_expired());
        s.set_disabled(false);
        s.clear_account_expiration_time();
        assert!(!s.is_disabled());
        assert!(!s.is_account_expired());
        assert_eq!(s.modifications().len(), 2);

        let mut s = PasswordPolicyState::new(p, user(), StateMode::Deferred, now());
        assert!(!s.is_disabled());
        assert!(!s.is_account_expired());
    }

    #[test]
    fn test_grace_logins_and_minimum_age() {
        sketching::test_init();
        let p = policy(PasswordPolicyConfig {
            grace_login_count: 2,
            min_password_age: ConfigDuration::Seconds(DAY as i64),
            ..Default::default()
        });
        let e = user_with(&[(ATTR_PWD_CHANGED_TIME, gt(NOW - 60))]);
        let mut s = PasswordPolicyState::new(p, e, StateMode::Deferred, now());
        assert!(s.is_within_minimum_age());
        assert_eq!(s.get_grace_logins_remaining(), 2);
        s.update_grace_login_times();
        s.update_grace_login_times();
        assert_eq!(s.get_grace_logins_remaining(), 0);
        s.clear_grace_login_times();
        assert_eq!(s.get_grace_logins_remaining(), 2);
    }

    #[test]
    fn test_setters_are_noops_when_unchanged() {
        sketching::test_init();
        let p = policy(PasswordPolicyConfig::default());
        let mut s = PasswordPolicyState::new(p, user(), StateMode::Deferred, now());
        s.set_warned_time(now());
        s.set_warned_time(now());
        s.clear_failure_lockout();
        s.clear_grace_login_times();
        s.set_disabled(false);
        assert_eq!(s.modifications().len(), 1);
    }

    #[test]
    fn test_direct_mode_records_nothing() {
        sketching::test_init();
        let p = policy(PasswordPolicyConfig::default());
        let mut s = PasswordPolicyState::new(p, user(), StateMode::Direct, now());
        s.set_password_changed_time(now());
        s.set_must_change_password(true);
        assert!(s.modifications().is_empty());
        let e = s.into_entry();
        assert!(e.has_attribute(ATTR_PWD_CHANGED_TIME));
        assert!(e.has_attribute(ATTR_PWD_RESET));
    }

    #[test]
    fn test_encode_match_and_validate() {
        sketching::test_init();
        let p = policy(PasswordPolicyConfig {
            password_validators: vec!["length".to_string()],
            ..Default::default()
        });
        let s = PasswordPolicyState::new(p.clone(), user(), StateMode::Direct, now());
        assert!(s.password_is_acceptable("short").is_err());
        assert!(s.password_is_acceptable("long enough").is_ok());

        let encoded = s.encode_password("long enough").expect("encode");
        assert_eq!(encoded.len(), 1);
        assert!(encoded[0].starts_with("{SSHA}"));
        assert!(s.is_pre_encoded(&encoded[0]));
        assert!(!s.is_pre_encoded("long enough"));

        let mut e = user();
        e.add_values(ATTR_USER_PASSWORD, false, encoded);
        let s = PasswordPolicyState::new(p, e, StateMode::Direct, now());
        assert!(s.password_matches("long enough"));
        assert!(!s.password_matches("wrong"));
    }

    #[test]
    fn test_history_round_trip() {
        sketching::test_init();
        let p = policy(PasswordPolicyConfig {
            password_history_count: 3,
            ..Default::default()
        });
        let mut e = user();
        e.add_values(ATTR_USER_PASSWORD, false, ["{CLEAR}first"]);
        let mut s = PasswordPolicyState::new(p, e, StateMode::Deferred, now());
        assert!(s.is_password_in_history("first"));
        assert!(!s.is_password_in_history("second"));

        s.update_password_history();
        s.record(m_replace(ATTR_USER_PASSWORD, ["{CLEAR}second"]));
        assert!(s.is_password_in_history("first"));
        assert!(s.is_password_in_history("second"));

        let history = s.entry().get_values(ATTR_PWD_HISTORY);
        assert_eq!(history.len(), 1);
        assert!(history[0].ends_with(&format!("#{OID_SYNTAX_USER_PASSWORD}#{{CLEAR}}first")));

        s.clear_password_history();
        assert!(!s.is_password_in_history("first"));
    }

    #[test]
    fn test_history_pruned_by_count_and_duration() {
        sketching::test_init();
        let p = policy(PasswordPolicyConfig {
            password_history_count: 2,
            password_history_duration: ConfigDuration::Seconds((10 * DAY) as i64),
            ..Default::default()
        });
        let h = |t: u64, pw: &str| format!("{}#{OID_SYNTAX_USER_PASSWORD}#{{CLEAR}}{pw}", gt(t));
        let e = user_with(&[
            (ATTR_PWD_HISTORY, h(NOW - 20 * DAY, "ancient")),
            (ATTR_PWD_HISTORY, h(NOW - 3 * DAY, "older")),
            (ATTR_PWD_HISTORY, h(NOW - DAY, "recent")),
        ]);
        let mut s = PasswordPolicyState::new(p, e, StateMode::Deferred, now());
        // The current password holds one place, leaving one for history.
        assert!(s.is_password_in_history("recent"));
        assert!(!s.is_password_in_history("older"));
        assert!(!s.is_password_in_history("ancient"));

        s.add_password_to_history("{CLEAR}newest");
        let history = s.entry().get_values(ATTR_PWD_HISTORY);
        assert_eq!(history.len(), 2);
        assert!(history.iter().any(|v| v.ends_with("recent")));
        assert!(history.iter().any(|v| v.ends_with("newest")));
    }

    #[test]
    fn test_deprecated_schemes_are_replaced() {
        sketching::test_init();
        let p = policy(PasswordPolicyConfig {
            deprecated_storage_schemes: vec!["BASE64".to_string()],
            ..Default::default()
        });
        let mut e = user();
        e.add_values(ATTR_USER_PASSWORD, false, ["{BASE64}c2VjcmV0"]);
        let mut s = PasswordPolicyState::new(p.clone(), e, StateMode::Deferred, now());
        s.handle_deprecated_storage_schemes("secret");
        let values = s.get_password_values();
        assert_eq!(values.len(), 1);
        assert!(values[0].starts_with("{SSHA}"));
        assert!(s.password_matches("secret"));
        assert_eq!(s.modifications().len(), 2);

        // A wrong password leaves everything alone.
        let mut e = user();
        e.add_values(ATTR_USER_PASSWORD, false, ["{BASE64}c2VjcmV0"]);
        let mut s = PasswordPolicyState::new(p, e, StateMode::Deferred, now());
        s.handle_deprecated_storage_schemes("guess");
        assert!(s.modifications().is_empty());
    }

    #[test]
    fn test_deprecated_handling_keeps_a_password() {
        sketching::test_init();
        let p = policy(PasswordPolicyConfig {
            default_storage_schemes: vec!["SSHA".to_string(), "SSHA512".to_string()],
            deprecated_storage_schemes: vec!["SSHA".to_string()],
            ..Default::default()
        });
        let encoded = ShaScheme::ssha()
            .encode_with_syntax("secret", PasswordSyntax::UserPassword)
            .expect("encode");
        let mut e = user();
        e.add_values(ATTR_USER_PASSWORD, false, [encoded]);
        let mut s = PasswordPolicyState::new(p, e, StateMode::Deferred, now());
        s.handle_deprecated_storage_schemes("secret");
        let values = s.get_password_values();
        assert!(!values.is_empty());
        assert!(values.iter().any(|v| v.starts_with("{SSHA512}")));
        assert!(s.password_matches("secret"));
    }

    #[test]
    fn test_finalize_writes_pending_modifications() {
        sketching::test_init();
        let base = Dn::parse("dc=example,dc=com").expect("dn");
        let be = MemoryBackend::new("userRoot", vec![base]);
        be.load(user());

        let p = policy(PasswordPolicyConfig {
            lockout_failure_count: 5,
            ..Default::default()
        });
        let mut s = PasswordPolicyState::new(p, user(), StateMode::Deferred, now());
        s.update_auth_failure_times();
        assert_eq!(s.finalize_state_after_bind(&be), Ok(()));
        assert!(s.modifications().is_empty());

        let stored = be.get_entry(s.entry().dn()).ok().flatten();
        assert_eq!(
            stored.map(|e| e.get_values(ATTR_PWD_FAILURE_TIME).len()),
            Some(1)
        );
    }
}
