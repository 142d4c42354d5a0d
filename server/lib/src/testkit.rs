//! Shared fixtures for the test suites: a small directory tree in a memory
//! backend and a server context around it.

use parking_lot::Mutex;

use crate::be::MemoryBackend;
use crate::prelude::*;
use crate::pwpolicy::scheme::ShaScheme;
use crate::pwpolicy::{
    ComponentConfig, ComponentRegistry, ComponentSetConfig, PasswordPolicy, PasswordPolicyConfig,
    PasswordStorageScheme, PasswordSyntax,
};
use crate::server::add::AddOperation;
use crate::server::modifydn::ModifyDnOperation;
use crate::server::notify::ChangeNotificationListener;
use crate::server::sync::ChangeNumberProvider;
use crate::server::{ServerContextBuilder, ServerSettings};

pub const BASE_DN: &str = "dc=example,dc=com";
pub const PEOPLE_DN: &str = "ou=People,dc=example,dc=com";
pub const ADMIN_DN: &str = "cn=admin,dc=example,dc=com";
pub const BOB_DN: &str = "cn=Bob,ou=People,dc=example,dc=com";
pub const BOB_PASSWORD: &str = "correct horse battery staple";
pub const CAROL_DN: &str = "cn=Carol,ou=People,dc=example,dc=com";
pub const CAROL_PASSWORD: &str = "Tr0ub4dor&3-carol";

#[allow(clippy::expect_used)]
pub fn dn(s: &str) -> Dn {
    Dn::parse(s).expect("invalid test dn")
}

#[allow(clippy::expect_used)]
pub fn rdn(s: &str) -> Rdn {
    Rdn::parse(s).expect("invalid test rdn")
}

/// A client operation bound as the directory administrator, holding every
/// privilege.
pub fn admin_operation() -> Operation {
    Operation::new(
        1,
        AuthIdentity::new(
            dn(ADMIN_DN),
            [
                Privilege::BypassAcl,
                Privilege::PasswordReset,
                Privilege::PrivilegeChange,
                Privilege::ProxiedAuth,
            ],
        ),
    )
}

/// Not stored by [`setup_test_env`]; tests add it.
pub fn carol_entry() -> Entry {
    let mut e = Entry::new(dn(CAROL_DN));
    e.add_object_class("inetOrgPerson");
    e.add_values("cn", false, ["Carol"]);
    e.add_values("sn", false, ["Jones"]);
    e.add_values(ATTR_UID, false, ["carol"]);
    e.add_values(ATTR_USER_PASSWORD, false, [CAROL_PASSWORD]);
    e
}

#[allow(clippy::expect_used)]
fn bob_entry(now: Duration) -> Entry {
    let mut e = Entry::new(dn(BOB_DN));
    e.add_object_class("inetOrgPerson");
    e.add_object_class("organizationalPerson");
    e.add_object_class("person");
    e.add_object_class(OC_TOP);
    e.add_values("cn", false, ["Bob"]);
    e.add_values("sn", false, ["Smith"]);
    e.add_values(ATTR_UID, false, ["bob"]);
    let encoded = ShaScheme::ssha()
        .encode_with_syntax(BOB_PASSWORD, PasswordSyntax::UserPassword)
        .expect("unable to encode test password");
    e.add_values(ATTR_USER_PASSWORD, false, [encoded]);
    e.add_values(ATTR_PWD_CHANGED_TIME, true, [GeneralizedTime::format(now)]);
    e
}

/// Records every change notification as a line of text.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<String>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl ChangeNotificationListener for RecordingListener {
    fn handle_add(&self, _op: &AddOperation, entry: &Entry) -> Result<(), DirectoryError> {
        self.events.lock().push(format!("add {}", entry.dn()));
        Ok(())
    }

    fn handle_modify_dn(
        &self,
        _op: &ModifyDnOperation,
        old_entry: &Entry,
        new_entry: &Entry,
    ) -> Result<(), DirectoryError> {
        self.events
            .lock()
            .push(format!("modify-dn {} -> {}", old_entry.dn(), new_entry.dn()));
        Ok(())
    }
}

pub struct TestEnv {
    pub ctx: ServerContext,
    pub backend: Arc<MemoryBackend>,
    pub listener: Arc<RecordingListener>,
    pub sync: Arc<ChangeNumberProvider>,
}

pub fn test_settings() -> ServerSettings {
    ServerSettings {
        lock_backoff: Duration::from_millis(1),
        ..Default::default()
    }
}

/// Build a test environment, letting the caller adjust the context before it
/// is built. Settings passed by the caller replace the test defaults.
#[allow(clippy::expect_used)]
pub fn test_env_with(f: impl FnOnce(ServerContextBuilder) -> ServerContextBuilder) -> TestEnv {
    sketching::test_init();

    let backend = Arc::new(MemoryBackend::new("userRoot", vec![dn(BASE_DN)]));
    let mut base = Entry::new(dn(BASE_DN));
    base.add_object_class("domain");
    base.add_object_class(OC_TOP);
    base.add_values("dc", false, ["example"]);
    backend.load(base);
    let mut people = Entry::new(dn(PEOPLE_DN));
    people.add_object_class("organizationalUnit");
    people.add_object_class(OC_TOP);
    people.add_values("ou", false, ["People"]);
    backend.load(people);
    backend.load(bob_entry(duration_from_epoch_now()));

    let listener = Arc::new(RecordingListener::default());
    let sync = Arc::new(ChangeNumberProvider::new());

    let builder = ServerContext::builder()
        .settings(test_settings())
        .backend(backend.clone())
        .change_listener(listener.clone())
        .sync_provider(sync.clone());
    let ctx = f(builder).build().expect("test context did not build");

    TestEnv {
        ctx,
        backend,
        listener,
        sync,
    }
}

pub fn setup_test_env() -> TestEnv {
    test_env_with(|b| b)
}

/// A policy built from `cfg` with a `length` validator (eight characters), a
/// `log` notification handler and a `random` generator available to it.
#[allow(clippy::expect_used)]
pub fn test_policy(ctx: &ServerContext, cfg: PasswordPolicyConfig) -> PasswordPolicy {
    let components = ComponentRegistry::new()
        .build(&ComponentSetConfig {
            validators: vec![ComponentConfig::new("length", "length").with_option("min-length", "8")],
            notification_handlers: vec![ComponentConfig::new("log", "log")],
            generators: vec![ComponentConfig::new("random", "random")],
        })
        .expect("test components did not build");
    let schema = ctx.schema().read();
    PasswordPolicy::new(&cfg, &schema, &components).expect("test policy did not build")
}
