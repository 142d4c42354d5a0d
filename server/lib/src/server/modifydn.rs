//! The rename (modify DN) pipeline.
//!
//! A rename follows the same phase shape as an add. Both the current and the
//! new DN are write locked, the current entry is copied under its new name and
//! the RDN changes are recorded as a modification list, which pre-operation
//! plugins may extend. The backend stores the renamed entry, together with its
//! subordinates, in a single call.

use crate::modify::{m_add, m_delete};
use crate::prelude::*;
use crate::server::control::{decode_request_controls, RequestedControls};
use crate::server::operation::{Halt, OperationResult, PhaseResult};
use crate::server::sync::sync_outcome;

#[derive(Debug)]
enum ModifyDnRequest {
    Raw {
        entry_dn: String,
        new_rdn: String,
        new_superior: Option<String>,
    },
    Parsed,
}

#[derive(Debug)]
pub struct ModifyDnOperation {
    pub base: Operation,
    request: ModifyDnRequest,
    entry_dn: Option<Dn>,
    new_rdn: Option<Rdn>,
    new_superior: Option<Dn>,
    delete_old_rdn: bool,
    new_dn: Option<Dn>,
    current_entry: Option<Entry>,
    new_entry: Option<Entry>,
    modifications: Vec<Modification>,
    proxied_dn: Option<Dn>,
}

impl ModifyDnOperation {
    pub fn new(
        base: Operation,
        entry_dn: Dn,
        new_rdn: Rdn,
        delete_old_rdn: bool,
        new_superior: Option<Dn>,
    ) -> Self {
        ModifyDnOperation {
            base,
            request: ModifyDnRequest::Parsed,
            entry_dn: Some(entry_dn),
            new_rdn: Some(new_rdn),
            new_superior,
            delete_old_rdn,
            new_dn: None,
            current_entry: None,
            new_entry: None,
            modifications: Vec::new(),
            proxied_dn: None,
        }
    }

    /// A rename as received from a client, decoded when the operation runs.
    pub fn from_raw(
        base: Operation,
        entry_dn: &str,
        new_rdn: &str,
        delete_old_rdn: bool,
        new_superior: Option<&str>,
    ) -> Self {
        ModifyDnOperation {
            base,
            request: ModifyDnRequest::Raw {
                entry_dn: entry_dn.to_string(),
                new_rdn: new_rdn.to_string(),
                new_superior: new_superior.map(str::to_string),
            },
            entry_dn: None,
            new_rdn: None,
            new_superior: None,
            delete_old_rdn,
            new_dn: None,
            current_entry: None,
            new_entry: None,
            modifications: Vec::new(),
            proxied_dn: None,
        }
    }

    pub fn entry_dn(&self) -> Option<&Dn> {
        self.entry_dn.as_ref()
    }

    pub fn new_rdn(&self) -> Option<&Rdn> {
        self.new_rdn.as_ref()
    }

    pub fn new_superior(&self) -> Option<&Dn> {
        self.new_superior.as_ref()
    }

    pub fn delete_old_rdn(&self) -> bool {
        self.delete_old_rdn
    }

    /// Known once the request has been decoded.
    pub fn new_dn(&self) -> Option<&Dn> {
        self.new_dn.as_ref()
    }

    pub fn current_entry(&self) -> Option<&Entry> {
        self.current_entry.as_ref()
    }

    pub fn new_entry(&self) -> Option<&Entry> {
        self.new_entry.as_ref()
    }

    pub fn new_entry_mut(&mut self) -> Option<&mut Entry> {
        self.new_entry.as_mut()
    }

    pub fn proxied_dn(&self) -> Option<&Dn> {
        self.proxied_dn.as_ref()
    }

    /// The changes made to the entry by the rename, in order.
    pub fn modifications(&self) -> &[Modification] {
        &self.modifications
    }

    /// Append a change. Pre-operation plugins use this; anything they add is
    /// applied to the new entry before it is stored.
    pub fn add_modification(&mut self, m: Modification) {
        self.modifications.push(m);
    }

    #[instrument(level = "debug", name = "modify_dn::run", skip_all, fields(op = %self.base.op_id))]
    pub fn run(&mut self, ctx: &ServerContext) -> OperationResult {
        self.base.mark_started();
        let outcome = self.process(ctx);
        self.finish(ctx, outcome)
    }

    fn process(&mut self, ctx: &ServerContext) -> PhaseResult {
        self.base.check_cancel()?;
        let r = ctx.plugins().run_pre_parse_modify_dn(self);
        self.base.plugin_outcome(r, "pre-parse")?;
        self.base.check_cancel()?;

        self.parse()?;
        let (entry_dn, new_dn) = self.compute_new_dn()?;
        let backend = self.locate_backend(ctx, &entry_dn, &new_dn)?;

        let outcome = self.locked(ctx, backend.as_ref(), &entry_dn, &new_dn);
        for p in ctx.sync_providers() {
            if let Err(e) = p.do_post_operation_modify_dn(self) {
                admin_error!(provider = p.name(), ?e, "synchronization post-operation failed");
            }
        }
        outcome
    }

    fn parse(&mut self) -> PhaseResult {
        let ModifyDnRequest::Raw {
            entry_dn,
            new_rdn,
            new_superior,
        } = std::mem::replace(&mut self.request, ModifyDnRequest::Parsed)
        else {
            return Ok(());
        };
        self.entry_dn = Some(Dn::parse(&entry_dn).map_err(|e| self.base.fail(e))?);
        self.new_rdn = Some(Rdn::parse(&new_rdn).map_err(|e| self.base.fail(e))?);
        self.new_superior = match new_superior {
            Some(s) => Some(Dn::parse(&s).map_err(|e| self.base.fail(e))?),
            None => None,
        };
        Ok(())
    }

    fn compute_new_dn(&mut self) -> Result<(Dn, Dn), Halt> {
        let (Some(entry_dn), Some(new_rdn)) = (self.entry_dn.clone(), self.new_rdn.clone()) else {
            return Err(self
                .base
                .abort(ResultCode::OperationsError, "the rename has no target"));
        };
        let parent = match self.new_superior.clone() {
            Some(sup) => Some(sup),
            None => entry_dn.parent(),
        };
        let parent = match parent {
            Some(p) if !p.is_root() => p,
            _ => {
                return Err(self.base.abort(
                    ResultCode::UnwillingToPerform,
                    format!("entry {entry_dn} cannot be renamed because the new parent is the root"),
                ))
            }
        };
        if parent.is_within(&entry_dn) {
            return Err(self.base.abort(
                ResultCode::UnwillingToPerform,
                format!("entry {entry_dn} cannot be moved below itself"),
            ));
        }
        let new_dn = parent.child(new_rdn);
        self.new_dn = Some(new_dn.clone());
        Ok((entry_dn, new_dn))
    }

    fn locate_backend(
        &mut self,
        ctx: &ServerContext,
        entry_dn: &Dn,
        new_dn: &Dn,
    ) -> Result<Arc<dyn Backend>, Halt> {
        let Some(current) = ctx.backend_for(entry_dn) else {
            return Err(self.base.abort(
                ResultCode::NoSuchObject,
                format!("entry {entry_dn} does not belong to any naming context"),
            ));
        };
        let same = ctx
            .backend_for(new_dn)
            .map(|b| b.backend_id() == current.backend_id())
            .unwrap_or(false);
        if !same {
            return Err(self.base.abort(
                ResultCode::UnwillingToPerform,
                format!(
                    "entry {entry_dn} cannot be renamed to {new_dn} because the new name is not held by backend {}",
                    current.backend_id()
                ),
            ));
        }
        Ok(current)
    }

    fn lock_failed(&mut self, ctx: &ServerContext, dn: &Dn) -> Halt {
        self.base.skip_post_operation = true;
        let code = ctx.settings().server_error_result_code;
        self.base
            .abort(code, format!("unable to lock entry {dn}, the server is busy"))
    }

    fn locked(
        &mut self,
        ctx: &ServerContext,
        backend: &dyn Backend,
        entry_dn: &Dn,
        new_dn: &Dn,
    ) -> PhaseResult {
        let Some(_current_lock) = ctx.locks().lock_write(entry_dn) else {
            return Err(self.lock_failed(ctx, entry_dn));
        };
        self.base.check_cancel()?;
        let _new_lock = if new_dn != entry_dn {
            match ctx.locks().lock_write(new_dn) {
                Some(g) => Some(g),
                None => return Err(self.lock_failed(ctx, new_dn)),
            }
        } else {
            None
        };
        self.base.check_cancel()?;

        self.core(ctx, backend, entry_dn, new_dn)
    }

    fn core(
        &mut self,
        ctx: &ServerContext,
        backend: &dyn Backend,
        entry_dn: &Dn,
        new_dn: &Dn,
    ) -> PhaseResult {
        for p in ctx.sync_providers() {
            let r = p.handle_conflict_resolution_modify_dn(self);
            sync_outcome(&mut self.base, p.name(), "conflict resolution", r)?;
        }

        let Some(current) = backend.get_entry(entry_dn).map_err(|e| self.base.fail(e))? else {
            self.base.set_matched_dn(ctx.matched_dn(entry_dn));
            return Err(self.base.abort(
                ResultCode::NoSuchObject,
                format!("entry {entry_dn} cannot be renamed because it does not exist"),
            ));
        };
        if new_dn != entry_dn && backend.entry_exists(new_dn).map_err(|e| self.base.fail(e))? {
            return Err(self.base.abort(
                ResultCode::EntryAlreadyExists,
                format!("entry {entry_dn} cannot be renamed to {new_dn} because that entry exists"),
            ));
        }
        if let Some(sup) = self.new_superior.clone() {
            if !backend.entry_exists(&sup).map_err(|e| self.base.fail(e))? {
                self.base.set_matched_dn(ctx.matched_dn(&sup));
                return Err(self.base.abort(
                    ResultCode::NoSuchObject,
                    format!("entry {entry_dn} cannot be moved because the new parent {sup} does not exist"),
                ));
            }
        }

        self.new_entry = Some(current.duplicate_with_dn(new_dn.clone()));
        self.current_entry = Some(current);

        self.apply_rdn_changes(ctx, entry_dn)?;

        let settings = ctx.settings();
        if settings.check_schema {
            self.check_schema(ctx, settings.syntax_enforcement)?;
        }

        let requested = self.process_controls(ctx, backend)?;

        if !ctx.access().is_allowed(OperationRef::ModifyDn(self)) {
            self.base.skip_post_operation = true;
            return Err(self.base.abort(
                ResultCode::InsufficientAccessRights,
                format!("insufficient access rights to rename entry {entry_dn}"),
            ));
        }

        if !self.base.sync_replay {
            let recorded = self.modifications.len();
            let r = ctx.plugins().run_pre_operation_modify_dn(self);
            self.base.plugin_outcome(r, "pre-operation")?;
            if self.modifications.len() > recorded {
                self.apply_plugin_modifications(ctx, recorded)?;
                if settings.check_schema {
                    self.check_schema(ctx, settings.syntax_enforcement)?;
                }
            }
        }

        if !backend.is_private() {
            let internal = self.base.is_internal_or_sync();
            if !settings.writability.permits(internal) {
                return Err(self.base.abort(
                    ResultCode::UnwillingToPerform,
                    format!("entry {entry_dn} cannot be renamed because the server is not accepting writes"),
                ));
            }
            if !backend.writability_mode().permits(internal) {
                return Err(self.base.abort(
                    ResultCode::UnwillingToPerform,
                    format!(
                        "entry {entry_dn} cannot be renamed because backend {} is not accepting writes",
                        backend.backend_id()
                    ),
                ));
            }
        }

        self.base.check_cancel()?;

        if requested.no_op {
            self.base.set_result_code(ResultCode::NoOperation);
            self.base
                .append_diagnostic("the rename would have succeeded but the no-op control was present");
            return Ok(());
        }

        for p in ctx.sync_providers() {
            let r = p.do_pre_operation_modify_dn(self);
            sync_outcome(&mut self.base, p.name(), "pre-operation", r)?;
        }

        let Some(new_entry) = self.new_entry.as_ref() else {
            return Err(self.base.abort(ResultCode::OperationsError, "the rename has no new entry"));
        };
        if let Err(e) = backend.rename_entry(entry_dn, new_entry, OperationRef::ModifyDn(self)) {
            return Err(self.base.fail(e));
        }

        self.read_responses(&requested)?;
        self.base.set_result_code(ResultCode::Success);
        Ok(())
    }

    /// Remove the old RDN values if asked to, then make sure every new RDN
    /// value is present. Each change is recorded.
    fn apply_rdn_changes(&mut self, ctx: &ServerContext, entry_dn: &Dn) -> PhaseResult {
        let schema = ctx.schema().read();
        let privileged = self.base.is_internal_or_sync();

        if self.delete_old_rdn {
            let old_avas: Vec<Ava> = entry_dn.rdn().map(|r| r.avas().to_vec()).unwrap_or_default();
            for ava in old_avas {
                if schema.is_no_user_modification(ava.attr()) && !privileged {
                    return Err(self.base.abort(
                        ResultCode::UnwillingToPerform,
                        format!("the old RDN attribute {} cannot be removed by a client", ava.attr()),
                    ));
                }
                let m = m_delete(ava.attr(), [ava.value()]);
                if let Some(e) = self.new_entry.as_mut() {
                    e.remove_attribute_values_unprotected(&m.attribute);
                }
                self.modifications.push(m);
            }
        }

        let new_avas: Vec<Ava> = self
            .new_rdn
            .as_ref()
            .map(|r| r.avas().to_vec())
            .unwrap_or_default();
        for ava in new_avas {
            if schema.is_obsolete_attribute(ava.attr()) {
                return Err(self.base.abort(
                    ResultCode::ConstraintViolation,
                    format!("the new RDN attribute {} is obsolete", ava.attr()),
                ));
            }
            let present = self
                .new_entry
                .as_ref()
                .map(|e| e.has_value_normalised(ava.attr(), ava.value()))
                .unwrap_or(false);
            if present {
                continue;
            }
            if schema.is_no_user_modification(ava.attr()) && !privileged {
                return Err(self.base.abort(
                    ResultCode::UnwillingToPerform,
                    format!("the new RDN attribute {} cannot be set by a client", ava.attr()),
                ));
            }
            let m = m_add(ava.attr(), [ava.value()]);
            let operational = schema.is_operational(ava.attr());
            if let Some(e) = self.new_entry.as_mut() {
                e.add_attribute(m.attribute.clone(), operational);
            }
            self.modifications.push(m);
        }
        Ok(())
    }

    fn apply_plugin_modifications(&mut self, ctx: &ServerContext, from: usize) -> PhaseResult {
        let schema = ctx.schema().read();
        let added: Vec<Modification> = self.modifications[from..].to_vec();
        for m in added.iter() {
            let operational = schema.is_operational(m.attribute.name());
            let applied = match self.new_entry.as_mut() {
                Some(e) => e.apply_modification(m, operational),
                None => Ok(()),
            };
            if let Err(e) = applied {
                request_error!(modification = %m, ?e, "plugin modification could not be applied");
                return Err(self.base.fail(e));
            }
        }
        Ok(())
    }

    fn check_schema(
        &mut self,
        ctx: &ServerContext,
        enforcement: crate::schema::SyntaxEnforcement,
    ) -> PhaseResult {
        let schema = ctx.schema().read();
        let Some(e) = self.new_entry.as_ref() else {
            return Ok(());
        };
        let checked = schema
            .validate_entry(e)
            .and_then(|_| schema.check_syntax(e, enforcement));
        match checked {
            Ok(()) => Ok(()),
            Err(err) => {
                let msg = format!("the renamed entry {} violates the schema: {err}", e.dn());
                let mut de: DirectoryError = err.into();
                de.message = msg;
                Err(self.base.fail(de))
            }
        }
    }

    fn process_controls(
        &mut self,
        ctx: &ServerContext,
        backend: &dyn Backend,
    ) -> Result<RequestedControls, Halt> {
        let Some(current) = self.current_entry.as_ref() else {
            return Ok(RequestedControls::default());
        };
        let mut requested = decode_request_controls(ctx, &mut self.base, current, backend, true)?;

        if let Some(authz) = requested.proxied.take() {
            if !ctx
                .access()
                .is_proxied_auth_allowed(OperationRef::ModifyDn(self), authz.as_ref())
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

    fn read_responses(&mut self, requested: &RequestedControls) -> PhaseResult {
        let reads = [
            (requested.pre_read.as_ref(), self.current_entry.as_ref()),
            (requested.post_read.as_ref(), self.new_entry.as_ref()),
        ];
        let mut responses = Vec::with_capacity(2);
        for (request, entry) in reads {
            if let (Some(c), Some(e)) = (request, entry) {
                responses.push(RequestedControls::read_response(c, e));
            }
        }
        for r in responses {
            let c = r.map_err(|e| self.base.fail(e))?;
            self.base.add_response_control(c);
        }
        Ok(())
    }

    fn finish(&mut self, ctx: &ServerContext, outcome: PhaseResult) -> OperationResult {
        if let Err(halt) = outcome {
            request_trace!(?halt, "rename stopped early");
        }
        self.base.close_cancel_window();
        let terminated = matches!(outcome, Err(Halt::Terminated));

        if !self.base.skip_post_operation {
            let r = ctx.plugins().run_post_operation_modify_dn(self);
            let _ = self.base.plugin_outcome(r, "post-operation");
        }

        if self.base.result_code() == Some(ResultCode::Success) {
            if let (Some(old), Some(new)) = (self.current_entry.clone(), self.new_entry.clone()) {
                ctx.notify_modify_dn(self, &old, &new);
            }
        }

        self.base.mark_finished();
        self.base.mark_response_sent();
        let result = self.base.to_result();
        request_info!(
            op = %self.base.op_id,
            from = ?self.entry_dn().map(|d| d.to_string()),
            to = ?self.new_dn().map(|d| d.to_string()),
            code = %result.code,
            elapsed = ?self.base.processing_time(),
            "rename complete"
        );

        if !terminated {
            ctx.plugins().run_post_response_modify_dn(self);
        }
        result
    }
}
