//! The add pipeline.
//!
//! An add runs strictly in order: pre-parse plugins, parsing, locating and
//! read locking the parent, write locking the new entry, conflict resolution,
//! the existence checks, completing the RDN values and object class chain,
//! password policy, schema, controls, access control, pre-operation plugins,
//! writability and finally the backend write. Any phase may stop the add; the
//! locks are released and the synchronization providers told about the outcome
//! whatever happened once the target was reached.

use crate::prelude::*;
use crate::pwpolicy::{PasswordPolicyState, StateMode};
use crate::server::control::{decode_request_controls, RequestedControls};
use crate::server::operation::{Halt, OperationResult, PhaseResult};
use crate::server::sync::sync_outcome;

/// An attribute as it arrives from a client: `type;option1;option2` and its
/// values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAttribute {
    pub description: String,
    pub values: Vec<String>,
}

impl RawAttribute {
    pub fn new<V: Into<String>>(description: &str, values: impl IntoIterator<Item = V>) -> Self {
        RawAttribute {
            description: description.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug)]
enum AddRequest {
    Raw {
        dn: String,
        attributes: Vec<RawAttribute>,
    },
    Parsed,
}

#[derive(Debug)]
pub struct AddOperation {
    pub base: Operation,
    request: AddRequest,
    entry: Option<Entry>,
    proxied_dn: Option<Dn>,
}

impl AddOperation {
    /// An add of an already built entry.
    pub fn new(base: Operation, entry: Entry) -> Self {
        AddOperation {
            base,
            request: AddRequest::Parsed,
            entry: Some(entry),
            proxied_dn: None,
        }
    }

    /// An add as received from a client. Nothing is decoded until the
    /// operation runs.
    pub fn from_raw(base: Operation, dn: &str, attributes: Vec<RawAttribute>) -> Self {
        AddOperation {
            base,
            request: AddRequest::Raw {
                dn: dn.to_string(),
                attributes,
            },
            entry: None,
            proxied_dn: None,
        }
    }

    pub fn internal(entry: Entry) -> Self {
        AddOperation::new(Operation::internal(), entry)
    }

    /// The DN of the entry being added, once known.
    pub fn entry_dn(&self) -> Option<&Dn> {
        self.entry.as_ref().map(|e| e.dn())
    }

    pub fn entry(&self) -> Option<&Entry> {
        self.entry.as_ref()
    }

    pub fn entry_mut(&mut self) -> Option<&mut Entry> {
        self.entry.as_mut()
    }

    /// The identity named by a proxied authorization control, if one was
    /// accepted.
    pub fn proxied_dn(&self) -> Option<&Dn> {
        self.proxied_dn.as_ref()
    }

    #[instrument(level = "debug", name = "add::run", skip_all, fields(op = %self.base.op_id))]
    pub fn run(&mut self, ctx: &ServerContext) -> OperationResult {
        self.base.mark_started();
        let outcome = self.process(ctx);
        self.finish(ctx, outcome)
    }

    fn process(&mut self, ctx: &ServerContext) -> PhaseResult {
        self.base.check_cancel()?;
        let r = ctx.plugins().run_pre_parse_add(self);
        self.base.plugin_outcome(r, "pre-parse")?;
        self.base.check_cancel()?;

        self.parse(ctx)?;
        let dn = self
            .entry_dn()
            .cloned()
            .ok_or_else(|| self.base.abort(ResultCode::OperationsError, "the add has no entry"))?;

        let (backend, parent_dn) = self.locate_parent(ctx, &dn)?;

        let outcome = self.locked(ctx, backend.as_ref(), &dn, parent_dn.as_ref());
        for p in ctx.sync_providers() {
            if let Err(e) = p.do_post_operation_add(self) {
                admin_error!(provider = p.name(), ?e, "synchronization post-operation failed");
            }
        }
        outcome
    }

    /// Decode the raw request into an entry and refuse attributes the
    /// requester may not set.
    fn parse(&mut self, ctx: &ServerContext) -> PhaseResult {
        let schema = ctx.schema().read();
        if let AddRequest::Raw { dn, attributes } = &self.request {
            let dn = Dn::parse(dn).map_err(|e| self.base.fail(e))?;
            let mut entry = Entry::new(dn);
            for raw in attributes {
                let attr = Attribute::from_description(&raw.description, raw.values.iter().cloned());
                let operational = schema.is_operational(attr.name());
                entry.add_attribute(attr, operational);
            }
            self.entry = Some(entry);
            self.request = AddRequest::Parsed;
        }

        if self.base.is_internal_or_sync() {
            return Ok(());
        }
        let forbidden = self.entry.as_ref().and_then(|e| {
            e.user_attributes()
                .values()
                .chain(e.operational_attributes().values())
                .flat_map(|variants| variants.first())
                .map(|a| a.name().to_string())
                .find(|name| schema.is_no_user_modification(name))
        });
        match forbidden {
            Some(name) => Err(self.base.abort(
                ResultCode::UnwillingToPerform,
                format!("attribute {name} cannot be set by a client"),
            )),
            None => Ok(()),
        }
    }

    /// Find the backend for `dn`, and the parent that must be read locked
    /// unless `dn` is itself a naming context.
    fn locate_parent(
        &mut self,
        ctx: &ServerContext,
        dn: &Dn,
    ) -> Result<(Arc<dyn Backend>, Option<Dn>), Halt> {
        if dn.is_root() {
            return Err(self.base.abort(
                ResultCode::UnwillingToPerform,
                "the root entry cannot be added",
            ));
        }
        let Some(backend) = ctx.backend_for(dn) else {
            return Err(self.base.abort(
                ResultCode::NoSuchObject,
                format!("entry {dn} does not belong to any naming context"),
            ));
        };
        if backend.is_base_dn(dn) {
            return Ok((backend, None));
        }
        Ok((backend, dn.parent()))
    }

    fn lock_failed(&mut self, ctx: &ServerContext, dn: &Dn) -> Halt {
        self.base.skip_post_operation = true;
        let code = ctx.settings().server_error_result_code;
        self.base
            .abort(code, format!("unable to lock entry {dn}, the server is busy"))
    }

    /// Everything done while the parent and target are locked. The guards are
    /// dropped on every return.
    fn locked(
        &mut self,
        ctx: &ServerContext,
        backend: &dyn Backend,
        dn: &Dn,
        parent_dn: Option<&Dn>,
    ) -> PhaseResult {
        let _parent_lock = match parent_dn {
            Some(p) => match ctx.locks().lock_read(p) {
                Some(g) => Some(g),
                None => return Err(self.lock_failed(ctx, p)),
            },
            None => None,
        };
        self.base.check_cancel()?;
        let Some(_entry_lock) = ctx.locks().lock_write(dn) else {
            return Err(self.lock_failed(ctx, dn));
        };
        self.base.check_cancel()?;

        self.core(ctx, backend, dn, parent_dn)
    }

    fn core(
        &mut self,
        ctx: &ServerContext,
        backend: &dyn Backend,
        dn: &Dn,
        parent_dn: Option<&Dn>,
    ) -> PhaseResult {
        for p in ctx.sync_providers() {
            let r = p.handle_conflict_resolution_add(self);
            sync_outcome(&mut self.base, p.name(), "conflict resolution", r)?;
        }

        if backend.entry_exists(dn).map_err(|e| self.base.fail(e))? {
            return Err(self.base.abort(
                ResultCode::EntryAlreadyExists,
                format!("entry {dn} already exists"),
            ));
        }
        if let Some(p) = parent_dn {
            if backend.get_entry(p).map_err(|e| self.base.fail(e))?.is_none() {
                self.base.set_matched_dn(ctx.matched_dn(p));
                return Err(self.base.abort(
                    ResultCode::NoSuchObject,
                    format!("entry {dn} cannot be added because its parent {p} does not exist"),
                ));
            }
        }

        let settings = ctx.settings();
        self.complete_rdn(ctx, settings.add_missing_rdn_attributes)?;
        self.complete_object_classes(ctx);
        self.check_privileges()?;

        if !self.base.sync_replay {
            self.apply_password_policy(ctx)?;
        }

        if settings.check_schema {
            let schema = ctx.schema().read();
            if let Some(e) = self.entry.as_ref() {
                let checked = schema
                    .validate_entry(e)
                    .and_then(|_| schema.check_syntax(e, settings.syntax_enforcement));
                if let Err(err) = checked {
                    let msg = format!("entry {dn} violates the schema: {err}");
                    let mut de: DirectoryError = err.into();
                    de.message = msg;
                    return Err(self.base.fail(de));
                }
            }
        }

        let requested = self.process_controls(ctx, backend)?;

        if !ctx.access().is_allowed(OperationRef::Add(self)) {
            self.base.skip_post_operation = true;
            return Err(self.base.abort(
                ResultCode::InsufficientAccessRights,
                format!("insufficient access rights to add entry {dn}"),
            ));
        }

        if !self.base.sync_replay {
            let r = ctx.plugins().run_pre_operation_add(self);
            self.base.plugin_outcome(r, "pre-operation")?;
        }

        if !backend.is_private() {
            let internal = self.base.is_internal_or_sync();
            if !settings.writability.permits(internal) {
                return Err(self.base.abort(
                    ResultCode::UnwillingToPerform,
                    format!("entry {dn} cannot be added because the server is not accepting writes"),
                ));
            }
            if !backend.writability_mode().permits(internal) {
                return Err(self.base.abort(
                    ResultCode::UnwillingToPerform,
                    format!(
                        "entry {dn} cannot be added because backend {} is not accepting writes",
                        backend.backend_id()
                    ),
                ));
            }
        }

        self.base.check_cancel()?;

        if requested.no_op {
            self.base.set_result_code(ResultCode::NoOperation);
            self.base
                .append_diagnostic("the add would have succeeded but the no-op control was present");
            return Ok(());
        }

        for p in ctx.sync_providers() {
            let r = p.do_pre_operation_add(self);
            sync_outcome(&mut self.base, p.name(), "pre-operation", r)?;
        }

        let Some(entry) = self.entry.as_ref() else {
            return Err(self.base.abort(ResultCode::OperationsError, "the add has no entry"));
        };
        if let Err(e) = backend.add_entry(entry, OperationRef::Add(self)) {
            return Err(self.base.fail(e));
        }

        if let Some(c) = requested.post_read.as_ref() {
            let response = self
                .entry
                .as_ref()
                .map(|e| RequestedControls::read_response(c, e))
                .transpose()
                .map_err(|e| self.base.fail(e))?;
            if let Some(response) = response {
                self.base.add_response_control(response);
            }
        }

        self.base.set_result_code(ResultCode::Success);
        Ok(())
    }

    /// Make every RDN value a real attribute value.
    fn complete_rdn(&mut self, ctx: &ServerContext, add_missing: bool) -> PhaseResult {
        let schema = ctx.schema().read();
        let missing = self
            .entry
            .as_ref()
            .map(|e| e.missing_rdn_values())
            .unwrap_or_default();
        for ava in missing {
            if schema.is_no_user_modification(ava.attr()) && !self.base.is_internal_or_sync() {
                return Err(self.base.abort(
                    ResultCode::UnwillingToPerform,
                    format!("RDN attribute {} cannot be set by a client", ava.attr()),
                ));
            }
            if !(add_missing || self.base.sync_replay) {
                return Err(self.base.abort(
                    ResultCode::ConstraintViolation,
                    format!(
                        "the entry is missing the value {:?} of its RDN attribute {}",
                        ava.value(),
                        ava.attr()
                    ),
                ));
            }
            let operational = schema.is_operational(ava.attr());
            if let Some(e) = self.entry.as_mut() {
                e.add_values(ava.attr(), operational, [ava.value()]);
            }
        }
        Ok(())
    }

    /// Add the superiors of every object class the entry names.
    fn complete_object_classes(&mut self, ctx: &ServerContext) {
        let schema = ctx.schema().read();
        let Some(e) = self.entry.as_mut() else {
            return;
        };
        let named: Vec<String> = e.object_classes().map(str::to_string).collect();
        for oc in named {
            for sup in schema.superiors_of(&oc) {
                if e.add_object_class(&sup) {
                    request_trace!(class = %sup, "added superior object class");
                }
            }
        }
    }

    fn check_privileges(&mut self) -> PhaseResult {
        let sets_privileges = self
            .entry
            .as_ref()
            .map(|e| e.has_attribute(ATTR_PRIVILEGE_NAME))
            .unwrap_or(false);
        if sets_privileges && !self.base.has_privilege(Privilege::PrivilegeChange) {
            security_info!(op = %self.base.op_id, "add of an entry with privileges refused");
            return Err(self.base.abort(
                ResultCode::InsufficientAccessRights,
                "the requester lacks the privilege-change privilege needed to add privileges",
            ));
        }
        Ok(())
    }

    /// Validate and encode the password of the new entry and seed its
    /// password policy state.
    fn apply_password_policy(&mut self, ctx: &ServerContext) -> PhaseResult {
        let Some(entry) = self.entry.clone() else {
            return Ok(());
        };
        let now = self.base.current_time();
        let state = {
            let policies = ctx.policies();
            PasswordPolicyState::for_entry(&policies, entry, StateMode::Direct, now)
                .map_err(|e| self.base.fail(e))?
        };
        let policy = state.policy().clone();
        let attr_name = policy.password_attribute.clone();

        let Some(variants) = state.entry().get_attribute(&attr_name) else {
            return Ok(());
        };
        if variants.iter().any(|a| a.has_options()) {
            return Err(self.base.abort(
                ResultCode::ConstraintViolation,
                format!("attribute options are not allowed on the password attribute {attr_name}"),
            ));
        }
        let values: Vec<String> = variants
            .iter()
            .flat_map(|a| a.values().iter().cloned())
            .collect();
        if values.len() > 1 && !policy.allow_multiple_password_values {
            return Err(self.base.abort(
                ResultCode::ConstraintViolation,
                format!("the password policy does not allow several values of {attr_name}"),
            ));
        }

        let skip_validation = policy.skip_validation_for_administrators
            && self.base.has_privilege(Privilege::PasswordReset);
        let mut encoded = Vec::with_capacity(values.len());
        for v in values.iter() {
            if state.is_pre_encoded(v) {
                if !policy.allow_pre_encoded_passwords {
                    return Err(self.base.abort(
                        ResultCode::ConstraintViolation,
                        "the password policy does not allow pre-encoded passwords",
                    ));
                }
                encoded.push(v.clone());
                continue;
            }
            if !skip_validation {
                if let Err(reason) = state.password_is_acceptable(v) {
                    return Err(self.base.abort(
                        ResultCode::ConstraintViolation,
                        format!("the provided password is not acceptable: {reason}"),
                    ));
                }
            }
            encoded.extend(state.encode_password(v).map_err(|e| self.base.fail(e))?);
        }

        let operational = ctx.schema().read().is_operational(&attr_name);
        let mut entry = state.into_entry();
        entry
            .replace_attribute(Attribute::new(&attr_name, encoded.iter().cloned()), operational)
            .map_err(|e| self.base.fail(e))?;

        let mut state = PasswordPolicyState::new(policy.clone(), entry, StateMode::Direct, now);
        state.set_password_changed_time(now);
        if policy.force_change_on_add {
            state.set_must_change_password(true);
        }
        for v in encoded.iter() {
            state.add_password_to_history(v);
        }
        policy_info!(dn = ?self.entry_dn().map(|d| d.to_string()), values = encoded.len(), "password encoded for new entry");
        self.entry = Some(state.into_entry());
        Ok(())
    }

    fn process_controls(
        &mut self,
        ctx: &ServerContext,
        backend: &dyn Backend,
    ) -> Result<RequestedControls, Halt> {
        let Some(entry) = self.entry.as_ref() else {
            return Ok(RequestedControls::default());
        };
        let mut requested = decode_request_controls(ctx, &mut self.base, entry, backend, false)?;

        if let Some(authz) = requested.proxied.take() {
            if !ctx
                .access()
                .is_proxied_auth_allowed(OperationRef::Add(self), authz.as_ref())
            {
                return Err(self.base.abort(
                    ResultCode::InsufficientAccessRights,
                    "the requester may not use the proxied authorization identity",
                ));
            }
            let identity = authz.as_ref().map(AuthIdentity::from_entry).unwrap_or_default();
            security_info!(op = %self.base.op_id, proxied = %identity, "proxied authorization accepted");
            self.proxied_dn = authz.map(|e| e.dn().clone());
            self.base.set_proxied_identity(identity);
        }
        Ok(requested)
    }

    fn finish(&mut self, ctx: &ServerContext, outcome: PhaseResult) -> OperationResult {
        if let Err(halt) = outcome {
            request_trace!(?halt, "add stopped early");
        }
        self.base.close_cancel_window();
        let terminated = matches!(outcome, Err(Halt::Terminated));

        if !self.base.skip_post_operation {
            let r = ctx.plugins().run_post_operation_add(self);
            let _ = self.base.plugin_outcome(r, "post-operation");
        }

        if self.base.result_code() == Some(ResultCode::Success) {
            if let Some(entry) = self.entry.clone() {
                ctx.notify_add(self, &entry);
            }
        }

        self.base.mark_finished();
        self.base.mark_response_sent();
        let result = self.base.to_result();
        request_info!(
            op = %self.base.op_id,
            dn = ?self.entry_dn().map(|d| d.to_string()),
            code = %result.code,
            elapsed = ?self.base.processing_time(),
            "add complete"
        );

        if !terminated {
            ctx.plugins().run_post_response_add(self);
        }
        result
    }
}
