//! The access control gate. The write pipelines only ever ask two yes/no
//! questions of it: may this operation proceed, and may the requester act as
//! the identity named by a proxied authorization control.

use crate::prelude::*;

pub trait AccessControlGate: Send + Sync {
    fn is_allowed(&self, op: OperationRef<'_>) -> bool;

    /// `authz_entry` is `None` when the requested identity is anonymous.
    fn is_proxied_auth_allowed(&self, op: OperationRef<'_>, authz_entry: Option<&Entry>) -> bool;
}

/// Allows internal and synchronization operations and any authenticated
/// identity, with anonymous writes refused. Proxying to an entry whose account
/// is administratively disabled is refused.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultAccessGate;

impl AccessControlGate for DefaultAccessGate {
    fn is_allowed(&self, op: OperationRef<'_>) -> bool {
        let base = op.base();
        if base.is_internal_or_sync() {
            return true;
        }
        let ident = base.effective_identity();
        let allowed = ident.has_privilege(Privilege::BypassAcl) || !ident.is_anonymous();
        if allowed {
            security_access!(op = %base.op_id, kind = op.kind(), %ident, "write allowed");
        } else {
            security_info!(op = %base.op_id, kind = op.kind(), %ident, "anonymous write denied");
        }
        allowed
    }

    fn is_proxied_auth_allowed(&self, op: OperationRef<'_>, authz_entry: Option<&Entry>) -> bool {
        let disabled = authz_entry
            .and_then(|e| e.first_value(ATTR_PWP_ACCOUNT_DISABLED))
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if disabled {
            security_info!(
                op = %op.base().op_id,
                authz = ?authz_entry.map(|e| e.dn().to_string()),
                "proxied authorization to a disabled account denied"
            );
        }
        !disabled
    }
}

/// Gives the same answers to every request.
#[derive(Debug, Clone, Copy)]
pub struct FixedAccessGate {
    pub allow: bool,
    pub allow_proxied: bool,
}

impl FixedAccessGate {
    pub fn allow_all() -> Self {
        FixedAccessGate {
            allow: true,
            allow_proxied: true,
        }
    }

    pub fn deny_all() -> Self {
        FixedAccessGate {
            allow: false,
            allow_proxied: false,
        }
    }
}

impl AccessControlGate for FixedAccessGate {
    fn is_allowed(&self, _op: OperationRef<'_>) -> bool {
        self.allow
    }

    fn is_proxied_auth_allowed(&self, _op: OperationRef<'_>, _authz_entry: Option<&Entry>) -> bool {
        self.allow_proxied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::add::AddOperation;
    use crate::testkit::dn;

    #[test]
    fn test_default_gate_decisions() {
        sketching::test_init();
        let gate = DefaultAccessGate;
        let e = entry_init!("cn=Bob,dc=example", ("cn", "Bob"));

        let internal = AddOperation::internal(e.clone());
        assert!(gate.is_allowed(OperationRef::Add(&internal)));

        let anon = AddOperation::new(Operation::new(1, AuthIdentity::anonymous()), e.clone());
        assert!(!gate.is_allowed(OperationRef::Add(&anon)));

        let user = AddOperation::new(
            Operation::new(1, AuthIdentity::new(dn("cn=admin,dc=example"), [])),
            e,
        );
        assert!(gate.is_allowed(OperationRef::Add(&user)));

        let mut disabled = entry_init!("cn=Eve,dc=example", ("cn", "Eve"));
        disabled.add_values(ATTR_PWP_ACCOUNT_DISABLED, true, ["TRUE"]);
        assert!(!gate.is_proxied_auth_allowed(OperationRef::Add(&user), Some(&disabled)));
        assert!(gate.is_proxied_auth_allowed(OperationRef::Add(&user), None));
    }
}
