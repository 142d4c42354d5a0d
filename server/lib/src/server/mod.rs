//! `server` contains the [`ServerContext`], the shared state every write
//! operation runs against, and the add and rename pipelines themselves.
//!
//! The context is assembled once and then only read. The parts that can change
//! while the server runs (the server settings and the password policies) are
//! held in `CowCell`s: a change is a committed write transaction and
//! operations that already took a snapshot keep seeing the old value.

use concread::cowcell::*;
use parking_lot::Mutex;

use crate::plugins::PluginPipeline;
use crate::prelude::*;
use crate::pwpolicy::{ComponentRegistry, ComponentSetConfig, PolicySet};
use crate::schema::SyntaxEnforcement;

use self::access::{AccessControlGate, DefaultAccessGate};
use self::add::AddOperation;
use self::lock::LockManager;
use self::modifydn::ModifyDnOperation;
use self::notify::{
    ChangeNotificationListener, ExactMatchIdentityMapper, IdentityMapper, PersistentSearch,
};
use self::sync::SynchronizationProvider;

pub mod access;
pub mod add;
pub mod control;
pub mod lock;
pub mod modifydn;
pub mod notify;
pub mod operation;
pub mod sync;

/// Server wide behaviour of the write pipelines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub check_schema: bool,
    pub syntax_enforcement: SyntaxEnforcement,
    /// Add RDN values missing from an added entry instead of refusing it.
    pub add_missing_rdn_attributes: bool,
    pub writability: WritabilityMode,
    /// Reported when the server itself fails, for example on lock contention.
    pub server_error_result_code: ResultCode,
    pub lock_attempts: u32,
    pub lock_backoff: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            check_schema: true,
            syntax_enforcement: SyntaxEnforcement::Reject,
            add_missing_rdn_attributes: false,
            writability: WritabilityMode::Enabled,
            server_error_result_code: ResultCode::Other,
            lock_attempts: LOCK_ATTEMPTS,
            lock_backoff: Duration::from_millis(10),
        }
    }
}

pub struct ServerContext {
    settings: CowCell<ServerSettings>,
    schema: Schema,
    policies: CowCell<PolicySet>,
    backends: Vec<Arc<dyn Backend>>,
    locks: LockManager,
    access: Arc<dyn AccessControlGate>,
    sync_providers: Vec<Arc<dyn SynchronizationProvider>>,
    plugins: PluginPipeline,
    change_listeners: Vec<Arc<dyn ChangeNotificationListener>>,
    persistent_searches: Mutex<Vec<Arc<dyn PersistentSearch>>>,
    identity_mapper: Arc<dyn IdentityMapper>,
}

impl ServerContext {
    pub fn builder() -> ServerContextBuilder {
        ServerContextBuilder::default()
    }

    /// A snapshot of the server settings.
    pub fn settings(&self) -> CowCellReadTxn<ServerSettings> {
        self.settings.read()
    }

    pub fn update_settings<F>(&self, f: F)
    where
        F: FnOnce(&mut ServerSettings),
    {
        let mut txn = self.settings.write();
        f(txn.get_mut());
        txn.commit();
        admin_info!("server settings updated");
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// A snapshot of the password policies.
    pub fn policies(&self) -> CowCellReadTxn<PolicySet> {
        self.policies.read()
    }

    /// Swap in a new set of password policies. Operations that already hold
    /// a snapshot finish with the old set.
    pub fn replace_policies(&self, policies: PolicySet) {
        let mut txn = self.policies.write();
        *txn.get_mut() = policies;
        txn.commit();
        admin_info!("password policies replaced");
    }

    pub fn backends(&self) -> &[Arc<dyn Backend>] {
        &self.backends
    }

    /// The backend holding `dn`: the one with the longest base DN that `dn`
    /// falls within.
    pub fn backend_for(&self, dn: &Dn) -> Option<Arc<dyn Backend>> {
        self.backends
            .iter()
            .filter_map(|be| {
                be.base_dns()
                    .iter()
                    .filter(|b| dn.is_within(b))
                    .map(|b| b.num_components())
                    .max()
                    .map(|depth| (depth, be))
            })
            .max_by_key(|(depth, _)| *depth)
            .map(|(_, be)| be.clone())
    }

    pub fn get_entry(&self, dn: &Dn) -> Result<Option<Entry>, DirectoryError> {
        match self.backend_for(dn) {
            Some(be) => be.get_entry(dn),
            None => Ok(None),
        }
    }

    /// The closest existing ancestor of `dn`, reported with `NO_SUCH_OBJECT`.
    pub fn matched_dn(&self, dn: &Dn) -> Option<Dn> {
        let mut cursor = dn.parent();
        while let Some(candidate) = cursor {
            if candidate.is_root() {
                return None;
            }
            let be = self.backend_for(&candidate)?;
            match be.entry_exists(&candidate) {
                Ok(true) => return Some(candidate),
                Ok(false) => cursor = candidate.parent(),
                Err(e) => {
                    admin_warn!(dn = %candidate, ?e, "unable to check ancestor while finding the matched dn");
                    return None;
                }
            }
        }
        None
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn access(&self) -> &dyn AccessControlGate {
        self.access.as_ref()
    }

    pub fn sync_providers(&self) -> &[Arc<dyn SynchronizationProvider>] {
        &self.sync_providers
    }

    pub fn plugins(&self) -> &PluginPipeline {
        &self.plugins
    }

    pub fn register_persistent_search(&self, search: Arc<dyn PersistentSearch>) {
        admin_debug!(id = search.id(), "persistent search registered");
        self.persistent_searches.lock().push(search);
    }

    pub fn persistent_search_count(&self) -> usize {
        self.persistent_searches.lock().len()
    }

    /* ===== proxied authorization ===== */

    /// Resolve the DN of a proxied authorization v1 control. The empty DN is
    /// the anonymous identity.
    pub fn resolve_proxied_v1(&self, authz_dn: &str) -> Result<Option<Entry>, DirectoryError> {
        let dn = Dn::parse(authz_dn).map_err(|e| {
            DirectoryError::new(
                ResultCode::ProtocolError,
                format!("the proxied authorization dn is malformed: {}", e.message),
            )
        })?;
        self.resolve_authz_dn(&dn)
    }

    /// Resolve a proxied authorization v2 identity: empty for anonymous,
    /// `dn:<dn>`, or `u:<name>` through the identity mapper.
    pub fn resolve_proxied_v2(&self, authz_id: &str) -> Result<Option<Entry>, DirectoryError> {
        if authz_id.is_empty() {
            return Ok(None);
        }
        let lower = authz_id.to_ascii_lowercase();
        if lower.starts_with("dn:") {
            let dn = Dn::parse(&authz_id[3..]).map_err(|e| {
                DirectoryError::new(
                    ResultCode::ProtocolError,
                    format!("the proxied authorization dn is malformed: {}", e.message),
                )
            })?;
            self.resolve_authz_dn(&dn)
        } else if lower.starts_with("u:") {
            let name = &authz_id[2..];
            match self.identity_mapper.map_identity(self, name)? {
                Some(e) => Ok(Some(e)),
                None => Err(DirectoryError::new(
                    ResultCode::AuthorizationDenied,
                    format!("the authorization identity {name:?} does not map to an entry"),
                )),
            }
        } else {
            Err(DirectoryError::new(
                ResultCode::ProtocolError,
                format!("the authorization identity {authz_id:?} is neither dn: nor u: form"),
            ))
        }
    }

    fn resolve_authz_dn(&self, dn: &Dn) -> Result<Option<Entry>, DirectoryError> {
        if dn.is_root() {
            return Ok(None);
        }
        match self.get_entry(dn)? {
            Some(e) => Ok(Some(e)),
            None => {
                security_info!(authz = %dn, "proxied authorization to a missing entry");
                Err(DirectoryError::new(
                    ResultCode::AuthorizationDenied,
                    format!("the proxied authorization entry {dn} does not exist"),
                ))
            }
        }
    }

    /* ===== change notification ===== */

    pub(crate) fn notify_add(&self, op: &AddOperation, entry: &Entry) {
        for l in self.change_listeners.iter() {
            if let Err(e) = l.handle_add(op, entry) {
                admin_error!(dn = %entry.dn(), ?e, "change notification listener failed");
            }
        }
        self.persistent_searches.lock().retain(|ps| match ps.process_add(op, entry) {
            Ok(()) => true,
            Err(e) => {
                admin_warn!(id = ps.id(), ?e, "persistent search failed, deregistering");
                false
            }
        });
    }

    pub(crate) fn notify_modify_dn(&self, op: &ModifyDnOperation, old: &Entry, new: &Entry) {
        for l in self.change_listeners.iter() {
            if let Err(e) = l.handle_modify_dn(op, old, new) {
                admin_error!(dn = %new.dn(), ?e, "change notification listener failed");
            }
        }
        self.persistent_searches
            .lock()
            .retain(|ps| match ps.process_modify_dn(op, old, new) {
                Ok(()) => true,
                Err(e) => {
                    admin_warn!(id = ps.id(), ?e, "persistent search failed, deregistering");
                    false
                }
            });
    }
}

/// Collects the collaborators of a [`ServerContext`].
#[derive(Default)]
pub struct ServerContextBuilder {
    settings: ServerSettings,
    schema: Option<Schema>,
    policies: Option<PolicySet>,
    backends: Vec<Arc<dyn Backend>>,
    access: Option<Arc<dyn AccessControlGate>>,
    sync_providers: Vec<Arc<dyn SynchronizationProvider>>,
    plugins: PluginPipeline,
    change_listeners: Vec<Arc<dyn ChangeNotificationListener>>,
    persistent_searches: Vec<Arc<dyn PersistentSearch>>,
    identity_mapper: Option<Arc<dyn IdentityMapper>>,
}

impl ServerContextBuilder {
    pub fn settings(mut self, settings: ServerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn policies(mut self, policies: PolicySet) -> Self {
        self.policies = Some(policies);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn access(mut self, gate: Arc<dyn AccessControlGate>) -> Self {
        self.access = Some(gate);
        self
    }

    pub fn sync_provider(mut self, provider: Arc<dyn SynchronizationProvider>) -> Self {
        self.sync_providers.push(provider);
        self
    }

    pub fn plugins(mut self, plugins: PluginPipeline) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn change_listener(mut self, listener: Arc<dyn ChangeNotificationListener>) -> Self {
        self.change_listeners.push(listener);
        self
    }

    pub fn persistent_search(mut self, search: Arc<dyn PersistentSearch>) -> Self {
        self.persistent_searches.push(search);
        self
    }

    pub fn identity_mapper(mut self, mapper: Arc<dyn IdentityMapper>) -> Self {
        self.identity_mapper = Some(mapper);
        self
    }

    /// Assemble the context. Without explicit policies the built in default
    /// policy is used. Two backends serving the same base DN are refused.
    pub fn build(self) -> Result<ServerContext, ConfigError> {
        let mut seen: Vec<&Dn> = Vec::new();
        for be in self.backends.iter() {
            for base in be.base_dns() {
                if seen.contains(&base) {
                    return Err(ConfigError::Duplicate(format!("base dn {base}")));
                }
                seen.push(base);
            }
        }

        let schema = self.schema.unwrap_or_default();
        let policies = match self.policies {
            Some(p) => p,
            None => {
                let components = ComponentRegistry::new().build(&ComponentSetConfig::default())?;
                PolicySet::builtin(&schema.read(), &components)?
            }
        };

        admin_info!(
            backends = self.backends.len(),
            policies = policies.len(),
            plugins = ?self.plugins.ids(),
            sync_providers = self.sync_providers.len(),
            "server context assembled"
        );

        Ok(ServerContext {
            locks: LockManager::new(self.settings.lock_attempts, self.settings.lock_backoff),
            settings: CowCell::new(self.settings),
            schema,
            policies: CowCell::new(policies),
            backends: self.backends,
            access: self
                .access
                .unwrap_or_else(|| Arc::new(DefaultAccessGate)),
            sync_providers: self.sync_providers,
            plugins: self.plugins,
            change_listeners: self.change_listeners,
            persistent_searches: Mutex::new(self.persistent_searches),
            identity_mapper: self
                .identity_mapper
                .unwrap_or_else(|| Arc::new(ExactMatchIdentityMapper::default())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::be::MemoryBackend;
    use crate::pwpolicy::PasswordPolicyConfig;
    use crate::testkit::*;

    #[test]
    fn test_backend_routing_prefers_longest_base() {
        sketching::test_init();
        let outer = Arc::new(MemoryBackend::new("outer", vec![dn("dc=example,dc=com")]));
        let inner = Arc::new(MemoryBackend::new(
            "inner",
            vec![dn("ou=Archive,dc=example,dc=com")],
        ));
        let ctx = ServerContext::builder()
            .backend(outer)
            .backend(inner)
            .build()
            .expect("context did not build");

        let id = |s: &str| ctx.backend_for(&dn(s)).map(|b| b.backend_id().to_string());
        assert_eq!(id("cn=x,ou=Archive,dc=example,dc=com").as_deref(), Some("inner"));
        assert_eq!(id("cn=x,ou=People,dc=example,dc=com").as_deref(), Some("outer"));
        assert_eq!(id("dc=example,dc=com").as_deref(), Some("outer"));
        assert_eq!(id("dc=other"), None);
    }

    #[test]
    fn test_duplicate_base_dn_refused() {
        sketching::test_init();
        let r = ServerContext::builder()
            .backend(Arc::new(MemoryBackend::new("a", vec![dn("dc=example")])))
            .backend(Arc::new(MemoryBackend::new("b", vec![dn("DC=Example")])))
            .build();
        assert!(matches!(r, Err(ConfigError::Duplicate(_))));
    }

    #[test]
    fn test_matched_dn_finds_nearest_ancestor() {
        sketching::test_init();
        let env = setup_test_env();
        assert_eq!(
            env.ctx.matched_dn(&dn("cn=x,ou=Nowhere,ou=People,dc=example,dc=com")),
            Some(dn("ou=People,dc=example,dc=com"))
        );
        assert_eq!(
            env.ctx.matched_dn(&dn("ou=Nowhere,dc=example,dc=com")),
            Some(dn("dc=example,dc=com"))
        );
        assert_eq!(env.ctx.matched_dn(&dn("cn=x,dc=other")), None);
    }

    #[test]
    fn test_proxied_identity_resolution() {
        sketching::test_init();
        let env = setup_test_env();
        let ctx = &env.ctx;

        let bob = ctx.resolve_proxied_v1(BOB_DN).ok().flatten();
        assert_eq!(bob.map(|e| e.dn().clone()), Some(dn(BOB_DN)));
        assert_eq!(ctx.resolve_proxied_v1("").ok(), Some(None));
        assert_eq!(
            ctx.resolve_proxied_v1("not a dn").map_err(|e| e.code),
            Err(ResultCode::ProtocolError)
        );
        assert_eq!(
            ctx.resolve_proxied_v1("uid=ghost,ou=People,dc=example,dc=com")
                .map_err(|e| e.code),
            Err(ResultCode::AuthorizationDenied)
        );

        assert_eq!(ctx.resolve_proxied_v2("").ok(), Some(None));
        let by_dn = ctx.resolve_proxied_v2(&format!("dn:{BOB_DN}")).ok().flatten();
        assert_eq!(by_dn.map(|e| e.dn().clone()), Some(dn(BOB_DN)));
        let by_name = ctx.resolve_proxied_v2("u:bob").ok().flatten();
        assert_eq!(by_name.map(|e| e.dn().clone()), Some(dn(BOB_DN)));
        assert_eq!(
            ctx.resolve_proxied_v2("u:ghost").map_err(|e| e.code),
            Err(ResultCode::AuthorizationDenied)
        );
        assert_eq!(
            ctx.resolve_proxied_v2("bob").map_err(|e| e.code),
            Err(ResultCode::ProtocolError)
        );
    }

    #[test]
    fn test_policy_snapshots_survive_replacement() {
        sketching::test_init();
        let env = setup_test_env();
        let before = env.ctx.policies();
        assert_eq!(before.default_policy().grace_login_count, 0);

        let p = test_policy(
            &env.ctx,
            PasswordPolicyConfig {
                grace_login_count: 2,
                ..Default::default()
            },
        );
        env.ctx.replace_policies(PolicySet::new(Arc::new(p)));

        assert_eq!(before.default_policy().grace_login_count, 0);
        assert_eq!(env.ctx.policies().default_policy().grace_login_count, 2);
    }

    #[test]
    fn test_settings_update_is_atomic() {
        sketching::test_init();
        let env = setup_test_env();
        let before = env.ctx.settings();
        env.ctx.update_settings(|s| s.writability = WritabilityMode::Disabled);
        assert_eq!(before.writability, WritabilityMode::Enabled);
        assert_eq!(env.ctx.settings().writability, WritabilityMode::Disabled);
    }
}
