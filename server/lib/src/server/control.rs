//! Request and response controls.
//!
//! Controls reach the core already split into an OID, a criticality flag and a
//! value. A value is either already typed (as built by internal callers and
//! tests) or `Raw` text as it would arrive from a client, in which case it is
//! decoded when the pipeline first looks at it. A raw value that does not
//! decode is a protocol error.

use std::fmt;

use crate::prelude::*;
use crate::server::operation::Halt;

#[derive(Debug, Clone, PartialEq)]
pub enum ControlValue {
    Empty,
    Filter(Filter),
    /// The attributes requested by a read entry control.
    AttributeList(Vec<String>),
    /// An authorization identity: a DN for proxied authorization v1, or
    /// `dn:<dn>`, `u:<name>` or the empty string for v2.
    AuthzId(String),
    /// The entry returned in a read entry response.
    Entry(Box<Entry>),
    Raw(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Control {
    pub oid: String,
    pub critical: bool,
    pub value: ControlValue,
}

fn malformed(oid: &str, reason: &str) -> DirectoryError {
    DirectoryError::new(
        ResultCode::ProtocolError,
        format!("unable to decode the value of control {oid}: {reason}"),
    )
}

impl Control {
    pub fn new(oid: &str, critical: bool, value: ControlValue) -> Self {
        Control {
            oid: oid.to_string(),
            critical,
            value,
        }
    }

    pub fn assertion(filter: Filter) -> Self {
        Control::new(OID_ASSERTION_CONTROL, true, ControlValue::Filter(filter))
    }

    pub fn no_op() -> Self {
        Control::new(OID_NOOP_CONTROL, true, ControlValue::Empty)
    }

    pub fn pre_read<S: Into<String>>(attrs: impl IntoIterator<Item = S>) -> Self {
        Control::new(
            OID_LDAP_READENTRY_PREREAD,
            false,
            ControlValue::AttributeList(attrs.into_iter().map(Into::into).collect()),
        )
    }

    pub fn post_read<S: Into<String>>(attrs: impl IntoIterator<Item = S>) -> Self {
        Control::new(
            OID_LDAP_READENTRY_POSTREAD,
            false,
            ControlValue::AttributeList(attrs.into_iter().map(Into::into).collect()),
        )
    }

    pub fn proxied_v1(dn: &str) -> Self {
        Control::new(OID_PROXIED_AUTH_V1, true, ControlValue::AuthzId(dn.to_string()))
    }

    pub fn proxied_v2(authz_id: &str) -> Self {
        Control::new(
            OID_PROXIED_AUTH_V2,
            true,
            ControlValue::AuthzId(authz_id.to_string()),
        )
    }

    /// The response to a pre-read or post-read request, carrying the entry.
    pub fn read_entry_response(request: &Control, entry: Entry) -> Self {
        Control::new(
            &request.oid,
            request.critical,
            ControlValue::Entry(Box::new(entry)),
        )
    }

    pub fn is(&self, oid: &str) -> bool {
        self.oid == oid
    }

    pub fn assertion_filter(&self) -> Result<Filter, DirectoryError> {
        match &self.value {
            ControlValue::Filter(f) => Ok(f.clone()),
            ControlValue::Raw(s) => Filter::parse(s),
            _ => Err(malformed(&self.oid, "expected a filter")),
        }
    }

    /// The attribute selection of a read entry request. Raw values are a
    /// comma or space separated list.
    pub fn requested_attributes(&self) -> Result<Vec<String>, DirectoryError> {
        match &self.value {
            ControlValue::Empty => Ok(Vec::new()),
            ControlValue::AttributeList(attrs) => Ok(attrs.clone()),
            ControlValue::Raw(s) => Ok(s
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .collect()),
            _ => Err(malformed(&self.oid, "expected an attribute list")),
        }
    }

    pub fn authz_id(&self) -> Result<&str, DirectoryError> {
        match &self.value {
            ControlValue::AuthzId(s) | ControlValue::Raw(s) => Ok(s.as_str()),
            _ => Err(malformed(&self.oid, "expected an authorization identity")),
        }
    }

    pub fn entry(&self) -> Option<&Entry> {
        match &self.value {
            ControlValue::Entry(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.oid)?;
        if self.critical {
            f.write_str(" (critical)")?;
        }
        Ok(())
    }
}

/// The outcome of walking the request controls of a write operation.
#[derive(Debug, Default)]
pub(crate) struct RequestedControls {
    pub no_op: bool,
    pub pre_read: Option<Control>,
    pub post_read: Option<Control>,
    /// Set when a proxied authorization control named a usable identity. The
    /// inner `None` is the anonymous identity.
    pub proxied: Option<Option<Entry>>,
}

impl RequestedControls {
    /// Build the read entry response for `request` from `entry`.
    pub fn read_response(request: &Control, entry: &Entry) -> Result<Control, DirectoryError> {
        let attrs = request.requested_attributes()?;
        Ok(Control::read_entry_response(request, entry.project(&attrs)))
    }
}

/// Walk the request controls in order. The assertion is evaluated against
/// `target`. The access gate check of a proxied identity is left to the
/// caller, which owns the whole operation.
pub(crate) fn decode_request_controls(
    ctx: &ServerContext,
    op: &mut Operation,
    target: &Entry,
    backend: &dyn Backend,
    allow_pre_read: bool,
) -> Result<RequestedControls, Halt> {
    let mut requested = RequestedControls::default();
    let controls = op.request_controls.clone();

    for c in controls.iter() {
        match c.oid.as_str() {
            OID_ASSERTION_CONTROL => {
                let filter = c.assertion_filter().map_err(|e| {
                    op.abort(
                        ResultCode::ProtocolError,
                        format!("cannot process the assertion filter for {}: {}", target.dn(), e.message),
                    )
                })?;
                if !filter.matches(target) {
                    return Err(op.abort(
                        ResultCode::AssertionFailed,
                        format!("entry {} does not match the assertion {filter}", target.dn()),
                    ));
                }
            }
            OID_NOOP_CONTROL => requested.no_op = true,
            OID_LDAP_READENTRY_PREREAD if allow_pre_read => {
                c.requested_attributes().map_err(|e| op.fail(e))?;
                requested.pre_read = Some(c.clone());
            }
            OID_LDAP_READENTRY_POSTREAD => {
                c.requested_attributes().map_err(|e| op.fail(e))?;
                requested.post_read = Some(c.clone());
            }
            OID_PROXIED_AUTH_V1 | OID_PROXIED_AUTH_V2 => {
                if !op.has_privilege(Privilege::ProxiedAuth) {
                    return Err(op.abort(
                        ResultCode::AuthorizationDenied,
                        "the requester lacks the proxied-auth privilege",
                    ));
                }
                let authz_id = c.authz_id().map_err(|e| op.fail(e))?;
                let resolved = if c.is(OID_PROXIED_AUTH_V1) {
                    ctx.resolve_proxied_v1(authz_id)
                } else {
                    ctx.resolve_proxied_v2(authz_id)
                };
                requested.proxied = Some(resolved.map_err(|e| op.fail(e))?);
            }
            oid if c.critical && !backend.supports_control(oid) => {
                return Err(op.abort(
                    ResultCode::UnavailableCriticalExtension,
                    format!(
                        "cannot process the request for {} because critical control {oid} is not supported",
                        target.dn()
                    ),
                ));
            }
            _ => {
                request_trace!(control = %c, "ignoring non critical control");
            }
        }
    }
    Ok(requested)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::f_eq;

    #[test]
    fn test_control_value_decoding() {
        sketching::test_init();
        let c = Control::new(OID_ASSERTION_CONTROL, true, ControlValue::Raw("(cn=bob)".to_string()));
        assert_eq!(c.assertion_filter().ok(), Some(f_eq("cn", "bob")));

        let c = Control::new(OID_ASSERTION_CONTROL, true, ControlValue::Raw("cn=bob".to_string()));
        assert_eq!(
            c.assertion_filter().map_err(|e| e.code),
            Err(ResultCode::ProtocolError)
        );

        let c = Control::new(OID_LDAP_READENTRY_POSTREAD, false, ControlValue::Raw("cn, sn +".to_string()));
        assert_eq!(
            c.requested_attributes().ok(),
            Some(vec!["cn".to_string(), "sn".to_string(), "+".to_string()])
        );

        assert!(Control::no_op().authz_id().is_err());
        assert_eq!(Control::proxied_v2("u:bob").authz_id().ok(), Some("u:bob"));
    }

    #[test]
    fn test_control_read_response_projection() {
        sketching::test_init();
        let mut e = entry_init!(
            "cn=Bob,dc=example",
            (ATTR_OBJECTCLASS, "person"),
            ("cn", "Bob"),
            ("sn", "Smith")
        );
        e.add_values("createTimestamp", true, ["20240101000000Z"]);

        let request = Control::post_read(["sn"]);
        let response = RequestedControls::read_response(&request, &e);
        let returned = response.ok().and_then(|c| c.entry().cloned());
        assert_eq!(
            returned.as_ref().map(|e| e.get_values("sn")),
            Some(vec!["Smith"])
        );
        assert_eq!(returned.map(|e| e.has_attribute("cn")), Some(false));
    }
}
