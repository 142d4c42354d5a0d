//! State shared by every write operation: who is asking, the controls they
//! sent, the result being assembled and the cancellation slot.
//!
//! An [`Operation`] is owned by the worker running it. The only part that is
//! shared is the cancellation slot, which another thread reaches through a
//! [`CancelHandle`].

use std::collections::BTreeSet;
use std::fmt;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use crate::prelude::*;
use crate::server::add::AddOperation;
use crate::server::modifydn::ModifyDnOperation;
use crate::plugins::PluginResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Privilege {
    BypassAcl,
    PrivilegeChange,
    PasswordReset,
    ProxiedAuth,
}

impl Privilege {
    pub fn as_str(self) -> &'static str {
        match self {
            Privilege::BypassAcl => PRIVILEGE_BYPASS_ACL,
            Privilege::PrivilegeChange => PRIVILEGE_PRIVILEGE_CHANGE,
            Privilege::PasswordReset => PRIVILEGE_PASSWORD_RESET,
            Privilege::ProxiedAuth => PRIVILEGE_PROXIED_AUTH,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        [
            Privilege::BypassAcl,
            Privilege::PrivilegeChange,
            Privilege::PasswordReset,
            Privilege::ProxiedAuth,
        ]
        .into_iter()
        .find(|p| p.as_str().eq_ignore_ascii_case(name.trim()))
    }
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An authorization identity. No DN is the anonymous identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthIdentity {
    pub dn: Option<Dn>,
    pub privileges: BTreeSet<Privilege>,
}

impl AuthIdentity {
    pub fn anonymous() -> Self {
        AuthIdentity::default()
    }

    pub fn new(dn: Dn, privileges: impl IntoIterator<Item = Privilege>) -> Self {
        AuthIdentity {
            dn: Some(dn),
            privileges: privileges.into_iter().collect(),
        }
    }

    /// The identity of a user entry, with the privileges named by its
    /// `ds-privilege-name` values. Unknown names are ignored.
    pub fn from_entry(e: &Entry) -> Self {
        let privileges = e
            .get_values(ATTR_PRIVILEGE_NAME)
            .into_iter()
            .filter_map(Privilege::from_name)
            .collect();
        AuthIdentity {
            dn: Some(e.dn().clone()),
            privileges,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.dn.is_none()
    }

    pub fn has_privilege(&self, p: Privilege) -> bool {
        self.privileges.contains(&p)
    }
}

impl fmt::Display for AuthIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.dn {
            Some(dn) => write!(f, "{dn}"),
            None => f.write_str("anonymous"),
        }
    }
}

/// Why a phase stopped the normal flow of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    /// The result code is set; go straight to finalization.
    Abort(ResultCode),
    /// A plugin asked for the response to be sent now. Post-operation plugins
    /// are skipped.
    SendImmediately,
    /// A plugin did the work itself. Post-operation plugins still run.
    SkipCore,
    /// A plugin terminated the client connection.
    Terminated,
    /// A cancel request was observed at a checkpoint.
    Canceled,
}

pub type PhaseResult = Result<(), Halt>;

/// What the client is told.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationResult {
    pub code: ResultCode,
    pub diagnostic: Option<String>,
    pub matched_dn: Option<Dn>,
    pub referrals: Vec<String>,
    pub controls: Vec<Control>,
}

impl OperationResult {
    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }

    pub fn control(&self, oid: &str) -> Option<&Control> {
        self.controls.iter().find(|c| c.is(oid))
    }
}

#[derive(Debug, Default)]
struct CancelSlot {
    requested: Option<String>,
    window_closed: bool,
    outcome: Option<ResultCode>,
}

#[derive(Debug, Default)]
pub struct CancelState {
    slot: Mutex<CancelSlot>,
    answered: Condvar,
}

/// Lets another thread ask a running operation to stop.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<CancelState>);

impl CancelHandle {
    /// Request cancellation and wait for the worker to answer. Returns
    /// `Canceled` if the worker stopped, `TooLate` if it was already past the
    /// point of no return and `CannotCancel` if it did not answer in time.
    pub fn cancel(&self, reason: &str) -> ResultCode {
        self.cancel_with_timeout(reason, Duration::from_secs(CANCEL_TIMEOUT_SECS))
    }

    pub fn cancel_with_timeout(&self, reason: &str, timeout: Duration) -> ResultCode {
        let deadline = Instant::now() + timeout;
        let mut slot = self.0.slot.lock();
        if slot.window_closed {
            return ResultCode::TooLate;
        }
        if let Some(outcome) = slot.outcome {
            return outcome;
        }
        slot.requested = Some(reason.to_string());
        while slot.outcome.is_none() {
            if self.0.answered.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.outcome.unwrap_or(ResultCode::CannotCancel)
    }
}

pub struct Operation {
    pub op_id: Uuid,
    pub conn_id: u64,
    pub internal: bool,
    pub sync_replay: bool,
    /// The identity the client bound as.
    pub auth: AuthIdentity,
    /// Set by proxied authorization; used for access decisions in place of
    /// `auth`.
    proxied: Option<AuthIdentity>,
    pub request_controls: Vec<Control>,
    response_controls: Vec<Control>,
    result_code: Option<ResultCode>,
    diagnostic: String,
    matched_dn: Option<Dn>,
    referrals: Vec<String>,
    /// Assigned by a synchronization provider, -1 until then.
    pub change_number: i64,
    current_time: Duration,
    started: Option<Instant>,
    processing_time: Option<Duration>,
    pub(crate) skip_post_operation: bool,
    response_sent: bool,
    cancel: Arc<CancelState>,
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("op_id", &self.op_id)
            .field("conn_id", &self.conn_id)
            .field("internal", &self.internal)
            .field("sync_replay", &self.sync_replay)
            .field("auth", &self.auth.to_string())
            .field("result_code", &self.result_code)
            .finish()
    }
}

impl Operation {
    pub fn new(conn_id: u64, auth: AuthIdentity) -> Self {
        Operation {
            op_id: Uuid::new_v4(),
            conn_id,
            internal: false,
            sync_replay: false,
            auth,
            proxied: None,
            request_controls: Vec::new(),
            response_controls: Vec::new(),
            result_code: None,
            diagnostic: String::new(),
            matched_dn: None,
            referrals: Vec::new(),
            change_number: -1,
            current_time: duration_from_epoch_now(),
            started: None,
            processing_time: None,
            skip_post_operation: false,
            response_sent: false,
            cancel: Arc::new(CancelState::default()),
        }
    }

    /// An operation issued by the server itself. It holds every privilege.
    pub fn internal() -> Self {
        let mut op = Operation::new(0, AuthIdentity::anonymous());
        op.internal = true;
        op
    }

    pub fn with_controls(mut self, controls: Vec<Control>) -> Self {
        self.request_controls = controls;
        self
    }

    pub fn with_sync_replay(mut self) -> Self {
        self.sync_replay = true;
        self
    }

    /// Fix the time the operation treats as now.
    pub fn with_current_time(mut self, now: Duration) -> Self {
        self.current_time = now;
        self
    }

    pub fn current_time(&self) -> Duration {
        self.current_time
    }

    pub fn is_internal_or_sync(&self) -> bool {
        self.internal || self.sync_replay
    }

    /// Privileges of the bound identity. A proxied identity never grants
    /// privileges to the requester.
    pub fn has_privilege(&self, p: Privilege) -> bool {
        self.internal || self.auth.has_privilege(p)
    }

    pub fn effective_identity(&self) -> &AuthIdentity {
        self.proxied.as_ref().unwrap_or(&self.auth)
    }

    pub fn proxied_identity(&self) -> Option<&AuthIdentity> {
        self.proxied.as_ref()
    }

    pub(crate) fn set_proxied_identity(&mut self, identity: AuthIdentity) {
        self.proxied = Some(identity);
    }

    /* ===== result ===== */

    pub fn result_code(&self) -> Option<ResultCode> {
        self.result_code
    }

    pub fn set_result_code(&mut self, code: ResultCode) {
        self.result_code = Some(code);
    }

    pub fn diagnostic(&self) -> &str {
        &self.diagnostic
    }

    pub fn append_diagnostic(&mut self, msg: &str) {
        if msg.is_empty() {
            return;
        }
        if !self.diagnostic.is_empty() {
            self.diagnostic.push_str("; ");
        }
        self.diagnostic.push_str(msg);
    }

    pub fn matched_dn(&self) -> Option<&Dn> {
        self.matched_dn.as_ref()
    }

    pub fn set_matched_dn(&mut self, dn: Option<Dn>) {
        self.matched_dn = dn;
    }

    pub fn referrals(&self) -> &[String] {
        &self.referrals
    }

    pub fn add_response_control(&mut self, c: Control) {
        self.response_controls.push(c);
    }

    pub fn response_controls(&self) -> &[Control] {
        &self.response_controls
    }

    pub fn response_sent(&self) -> bool {
        self.response_sent
    }

    /// Set the result and return the matching [`Halt`].
    pub fn abort(&mut self, code: ResultCode, msg: impl Into<String>) -> Halt {
        let msg = msg.into();
        request_info!(op = %self.op_id, %code, diagnostic = %msg, "operation aborted");
        self.set_result_code(code);
        self.append_diagnostic(&msg);
        Halt::Abort(code)
    }

    /// Adopt a collaborator failure as the result of this operation.
    pub fn fail(&mut self, e: DirectoryError) -> Halt {
        if let Some(matched) = e.matched_dn.as_deref().and_then(|m| Dn::parse(m).ok()) {
            self.matched_dn = Some(matched);
        }
        self.abort(e.code, e.message)
    }

    /// Translate a plugin verdict. `phase` names the extension point for the
    /// diagnostic.
    pub(crate) fn plugin_outcome(&mut self, r: PluginResult, phase: &str) -> PhaseResult {
        match r {
            PluginResult::Continue => Ok(()),
            PluginResult::TerminateConnection => {
                self.set_result_code(ResultCode::Canceled);
                self.append_diagnostic(&format!(
                    "the operation was canceled because a {phase} plugin terminated the connection"
                ));
                self.skip_post_operation = true;
                Err(Halt::Terminated)
            }
            PluginResult::SendResponseImmediately => {
                self.skip_post_operation = true;
                Err(Halt::SendImmediately)
            }
            PluginResult::SkipCoreProcessing => {
                self.skip_post_operation = false;
                Err(Halt::SkipCore)
            }
        }
    }

    /* ===== cancellation ===== */

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel.clone())
    }

    /// A cancellation checkpoint.
    pub(crate) fn check_cancel(&mut self) -> PhaseResult {
        let mut slot = self.cancel.slot.lock();
        let Some(reason) = slot.requested.clone() else {
            return Ok(());
        };
        if slot.outcome.is_some() {
            return Ok(());
        }
        slot.outcome = Some(ResultCode::Canceled);
        drop(slot);
        self.cancel.answered.notify_all();

        request_info!(op = %self.op_id, %reason, "operation canceled");
        self.set_result_code(ResultCode::Canceled);
        self.append_diagnostic(&format!("the operation was canceled: {reason}"));
        self.skip_post_operation = true;
        Err(Halt::Canceled)
    }

    /// After this, cancel requests are answered with `TooLate`.
    pub(crate) fn close_cancel_window(&mut self) {
        let mut slot = self.cancel.slot.lock();
        slot.window_closed = true;
        if slot.requested.is_some() && slot.outcome.is_none() {
            slot.outcome = Some(ResultCode::TooLate);
        }
        drop(slot);
        self.cancel.answered.notify_all();
    }

    /* ===== timing ===== */

    pub(crate) fn mark_started(&mut self) {
        self.started = Some(Instant::now());
    }

    pub(crate) fn mark_finished(&mut self) {
        self.processing_time = self.started.map(|s| s.elapsed());
    }

    pub fn processing_time(&self) -> Option<Duration> {
        self.processing_time
    }

    pub(crate) fn mark_response_sent(&mut self) {
        self.response_sent = true;
    }

    /// The response as it stands. An operation that never set a result code
    /// reports `Other`.
    pub fn to_result(&self) -> OperationResult {
        OperationResult {
            code: self.result_code.unwrap_or(ResultCode::Other),
            diagnostic: if self.diagnostic.is_empty() {
                None
            } else {
                Some(self.diagnostic.clone())
            },
            matched_dn: self.matched_dn.clone(),
            referrals: self.referrals.clone(),
            controls: self.response_controls.clone(),
        }
    }
}

/// A borrowed view of a running operation, handed to collaborators that need
/// to see the whole request.
#[derive(Debug, Clone, Copy)]
pub enum OperationRef<'a> {
    Add(&'a AddOperation),
    ModifyDn(&'a ModifyDnOperation),
}

impl<'a> OperationRef<'a> {
    pub fn base(&self) -> &'a Operation {
        match self {
            OperationRef::Add(op) => &op.base,
            OperationRef::ModifyDn(op) => &op.base,
        }
    }

    /// The DN being written: the new entry for an add, the current entry for
    /// a rename.
    pub fn target_dn(&self) -> Option<&'a Dn> {
        match self {
            OperationRef::Add(op) => op.entry_dn(),
            OperationRef::ModifyDn(op) => op.entry_dn(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OperationRef::Add(_) => "add",
            OperationRef::ModifyDn(_) => "modify-dn",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::dn;

    #[test]
    fn test_operation_privileges_and_identity() {
        sketching::test_init();
        let admin = AuthIdentity::new(dn("cn=admin,dc=example"), [Privilege::ProxiedAuth]);
        let mut op = Operation::new(1, admin);
        assert!(op.has_privilege(Privilege::ProxiedAuth));
        assert!(!op.has_privilege(Privilege::BypassAcl));

        op.set_proxied_identity(AuthIdentity::new(
            dn("cn=Bob,dc=example"),
            [Privilege::BypassAcl],
        ));
        assert_eq!(op.effective_identity().to_string(), "cn=Bob,dc=example");
        // The proxied identity's privileges are not the requester's.
        assert!(!op.has_privilege(Privilege::BypassAcl));
        assert!(Operation::internal().has_privilege(Privilege::PrivilegeChange));

        let mut e = entry_init!("cn=Bob,dc=example", ("cn", "Bob"));
        e.add_values(ATTR_PRIVILEGE_NAME, true, ["password-reset", "no-such-thing"]);
        let id = AuthIdentity::from_entry(&e);
        assert_eq!(id.privileges.len(), 1);
        assert!(id.has_privilege(Privilege::PasswordReset));
    }

    #[test]
    fn test_operation_result_assembly() {
        sketching::test_init();
        let mut op = Operation::internal();
        assert_eq!(op.to_result().code, ResultCode::Other);

        let e = DirectoryError::no_such_object("missing")
            .with_matched_dn(Some("dc=example".to_string()));
        assert_eq!(op.fail(e), Halt::Abort(ResultCode::NoSuchObject));
        op.append_diagnostic("second");
        let r = op.to_result();
        assert_eq!(r.code, ResultCode::NoSuchObject);
        assert_eq!(r.diagnostic.as_deref(), Some("missing; second"));
        assert_eq!(r.matched_dn, Some(dn("dc=example")));
    }

    #[test]
    fn test_operation_plugin_outcomes() {
        sketching::test_init();
        let mut op = Operation::internal();
        assert_eq!(op.plugin_outcome(PluginResult::Continue, "pre-parse"), Ok(()));
        assert_eq!(
            op.plugin_outcome(PluginResult::SendResponseImmediately, "pre-parse"),
            Err(Halt::SendImmediately)
        );
        assert!(op.skip_post_operation);
        assert_eq!(
            op.plugin_outcome(PluginResult::SkipCoreProcessing, "pre-operation"),
            Err(Halt::SkipCore)
        );
        assert!(!op.skip_post_operation);
        assert_eq!(
            op.plugin_outcome(PluginResult::TerminateConnection, "pre-operation"),
            Err(Halt::Terminated)
        );
        assert_eq!(op.result_code(), Some(ResultCode::Canceled));
    }

    #[test]
    fn test_operation_cancellation() {
        sketching::test_init();
        let mut op = Operation::internal();
        assert_eq!(op.check_cancel(), Ok(()));

        let handle = op.cancel_handle();
        let requester = std::thread::spawn(move || handle.cancel("admin request"));
        // Poll the checkpoint until the request lands.
        let mut observed = Ok(());
        for _ in 0..200 {
            observed = op.check_cancel();
            if observed.is_err() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(observed, Err(Halt::Canceled));
        assert_eq!(requester.join().ok(), Some(ResultCode::Canceled));
        assert_eq!(op.result_code(), Some(ResultCode::Canceled));

        op.close_cancel_window();
        assert_eq!(op.cancel_handle().cancel("again"), ResultCode::TooLate);
    }

    #[test]
    fn test_operation_cancel_timeout() {
        sketching::test_init();
        let op = Operation::internal();
        let handle = op.cancel_handle();
        assert_eq!(
            handle.cancel_with_timeout("nobody listens", Duration::from_millis(20)),
            ResultCode::CannotCancel
        );
    }
}
