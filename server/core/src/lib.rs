//! This is where the server is assembled from its configuration. A
//! [`ServerConfig`](config::ServerConfig) names the backends, the password
//! policies and the components they use, and [`setup_context`] checks all of
//! it and builds the [`ServerContext`] that the add and rename pipelines run
//! against.

#![deny(warnings)]
#![warn(unused_extern_crates)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unreachable)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::trivially_copy_pass_by_ref)]

#[macro_use]
extern crate tracing;

pub mod config;

use std::sync::Arc;
use std::time::Duration;

use dirsrv_proto::internal::ConfigError;
use dirsrv_proto::result::ResultCode;
use dirsrvd_lib::be::MemoryBackend;
use dirsrvd_lib::dn::Dn;
use dirsrvd_lib::plugins::{LastModPlugin, PluginPipeline, WriteOperationCounter};
use dirsrvd_lib::pwpolicy::{ComponentRegistry, ComponentSetConfig, PolicySet};
use dirsrvd_lib::schema::Schema;
use dirsrvd_lib::server::{ServerContext, ServerSettings};
use sketching::{admin_error, admin_info, EventTag};

use crate::config::{BackendConfig, ServerConfig};

/// Start logging at the level named in the configuration.
pub fn setup_logging(config: &ServerConfig) {
    sketching::server_init(config.log_level);
}

fn setup_settings(config: &ServerConfig) -> Result<ServerSettings, ConfigError> {
    let server_error_result_code = ResultCode::try_from(config.server_error_result_code)
        .map_err(|_| {
            admin_error!(
                code = config.server_error_result_code,
                "server_error_result_code is not a result code"
            );
            ConfigError::InvalidResultCode(config.server_error_result_code)
        })?;

    Ok(ServerSettings {
        check_schema: config.check_schema,
        syntax_enforcement: config.syntax_enforcement,
        add_missing_rdn_attributes: config.add_missing_rdn_attributes,
        writability: config.writability,
        server_error_result_code,
        lock_attempts: config.lock_attempts,
        lock_backoff: Duration::from_millis(config.lock_backoff_ms),
    })
}

fn setup_backend(config: &BackendConfig) -> Result<MemoryBackend, ConfigError> {
    let base_dns = config
        .base_dns
        .iter()
        .map(|s| {
            Dn::parse(s).map_err(|e| {
                admin_error!(backend = %config.id, base_dn = %s, ?e, "invalid base dn");
                ConfigError::InvalidDn(s.clone())
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(MemoryBackend::new(&config.id, base_dns)
        .with_writability(config.writability)
        .with_private(config.private)
        .with_supported_controls(config.supported_controls.iter().cloned()))
}

fn setup_plugins(names: &[String]) -> Result<PluginPipeline, ConfigError> {
    names.iter().try_fold(PluginPipeline::new(), |pipeline, name| {
        match name.as_str() {
            "lastmod" => Ok(pipeline.with(Arc::new(LastModPlugin))),
            "write-operation-counter" => {
                Ok(pipeline.with(Arc::new(WriteOperationCounter::default())))
            }
            _ => {
                admin_error!(plugin = %name, "unknown plugin");
                Err(ConfigError::UnknownComponentKind(name.clone()))
            }
        }
    })
}

/// Check the configuration and assemble a server context from it. Nothing is
/// started; an error names the first problem found.
#[instrument(level = "debug", name = "setup_context", skip_all)]
pub fn setup_context(config: &ServerConfig) -> Result<ServerContext, ConfigError> {
    let settings = setup_settings(config)?;

    let schema = Schema::new();
    let components = ComponentRegistry::new().build(&ComponentSetConfig {
        validators: config.validator.clone(),
        notification_handlers: config.notification_handler.clone(),
        generators: config.generator.clone(),
    })?;

    let policies = {
        let schema_txn = schema.read();
        if config.password_policy.is_empty() {
            PolicySet::builtin(&schema_txn, &components)?
        } else {
            PolicySet::from_configs(&config.password_policy, &schema_txn, &components)?
        }
    };

    let plugins = setup_plugins(&config.plugins)?;

    let mut builder = ServerContext::builder()
        .settings(settings)
        .schema(schema)
        .policies(policies)
        .plugins(plugins);

    for be_cfg in config.backends.iter() {
        builder = builder.backend(Arc::new(setup_backend(be_cfg)?));
    }

    let ctx = builder.build()?;
    admin_info!(
        backends = config.backends.len(),
        log_level = %config.log_level,
        "server configuration loaded"
    );
    Ok(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirsrvd_lib::entry::Entry;
    use dirsrvd_lib::server::add::AddOperation;
    use dirsrvd_lib::server::operation::Operation;

    const SAMPLE: &str = r#"
        log_level = "debug"
        plugins = ["lastmod", "write-operation-counter"]

        [[backend]]
        id = "userRoot"
        base_dns = ["dc=example,dc=com"]

        [[validator]]
        id = "length"
        kind = "length"
        options = { min-length = "8" }

        [[notification_handler]]
        id = "log"
        kind = "log"

        [[generator]]
        id = "random"
        kind = "random"

        [[password_policy]]
        default = true
        password-validators = ["length"]
        account-status-notification-handlers = ["log"]
        password-generator = "random"

        [[password_policy]]
        dn = "cn=Strict,cn=Password Policies,cn=config"
        password-validators = ["length"]
        lockout-failure-count = 3
    "#;

    fn parse(s: &str) -> ServerConfig {
        s.parse().expect("config did not parse")
    }

    #[test]
    fn test_setup_context_from_sample() {
        sketching::test_init();
        let ctx = setup_context(&parse(SAMPLE)).expect("context did not build");
        assert_eq!(ctx.backends().len(), 1);
        assert_eq!(ctx.policies().len(), 2);
        assert_eq!(
            ctx.plugins().ids(),
            vec!["plugin_lastmod", "plugin_write_operation_counter"]
        );
        assert!(ctx.settings().check_schema);
    }

    #[test]
    fn test_setup_context_builtin_policy() {
        sketching::test_init();
        let ctx = setup_context(&parse("")).expect("context did not build");
        assert!(ctx.backends().is_empty());
        assert_eq!(ctx.policies().len(), 1);
        assert_eq!(ctx.settings().server_error_result_code, ResultCode::Other);
    }

    #[test]
    fn test_setup_context_rejects_bad_config() {
        sketching::test_init();

        let two_defaults = "[[password_policy]]\ndefault = true\n[[password_policy]]\ndefault = true\n";
        assert!(matches!(
            setup_context(&parse(two_defaults)),
            Err(ConfigError::Duplicate(_))
        ));

        assert!(matches!(
            setup_context(&parse("[[password_policy]]\ndn = \"cn=p\"\n")),
            Err(ConfigError::NoDefaultPolicy)
        ));

        let missing_validator = "[[password_policy]]\ndefault = true\npassword-validators = [\"nope\"]\n";
        assert!(matches!(
            setup_context(&parse(missing_validator)),
            Err(ConfigError::UnknownValidator(v)) if v == "nope"
        ));

        assert!(matches!(
            setup_context(&parse("[[backend]]\nid = \"x\"\nbase_dns = [\"not a dn\"]\n")),
            Err(ConfigError::InvalidDn(_))
        ));

        let twice = "[[backend]]\nid = \"a\"\nbase_dns = [\"dc=example\"]\n\
                     [[backend]]\nid = \"b\"\nbase_dns = [\"dc=example\"]\n";
        assert!(matches!(
            setup_context(&parse(twice)),
            Err(ConfigError::Duplicate(_))
        ));

        assert!(matches!(
            setup_context(&parse("server_error_result_code = 9999\n")),
            Err(ConfigError::InvalidResultCode(9999))
        ));

        assert!(matches!(
            setup_context(&parse("plugins = [\"referential-integrity\"]\n")),
            Err(ConfigError::UnknownComponentKind(_))
        ));
    }

    #[test]
    fn test_configured_server_adds_entries() {
        sketching::test_init();
        let ctx = setup_context(&parse(SAMPLE)).expect("context did not build");

        let mut base = Entry::new(Dn::parse("dc=example,dc=com").expect("dn"));
        base.add_object_class("domain");
        base.add_object_class("top");
        base.add_values("dc", false, ["example"]);
        let mut op = AddOperation::new(Operation::internal(), base);
        let res = op.run(&ctx);
        assert_eq!(res.code, ResultCode::Success);

        let stored = ctx
            .get_entry(&Dn::parse("dc=example,dc=com").expect("dn"))
            .expect("backend read failed")
            .expect("entry was not stored");
        assert!(stored.has_attribute("createTimestamp"));
        assert!(stored.has_attribute("creatorsName"));

        // Outside every configured naming context.
        let mut stray = Entry::new(Dn::parse("dc=other,dc=org").expect("dn"));
        stray.add_object_class("domain");
        stray.add_values("dc", false, ["other"]);
        let mut op = AddOperation::new(Operation::internal(), stray);
        assert_eq!(op.run(&ctx).code, ResultCode::NoSuchObject);
    }
}
