//! The server configuration as read from `server.toml`.
//!
//! Everything here is plain data. [`crate::setup_context`] turns it into a
//! running [`ServerContext`](dirsrvd_lib::server::ServerContext), and that is
//! where names, DNs and component references are checked.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use dirsrv_proto::constants::LOCK_ATTEMPTS;
use dirsrv_proto::internal::ConfigError;
use dirsrvd_lib::be::WritabilityMode;
use dirsrvd_lib::pwpolicy::{ComponentConfig, PasswordPolicyConfig};
use dirsrvd_lib::schema::SyntaxEnforcement;
use serde::Deserialize;
use sketching::{admin_error, EventTag, LogLevel};

fn default_true() -> bool {
    true
}

fn default_server_error_result_code() -> u32 {
    80
}

fn default_lock_attempts() -> u32 {
    LOCK_ATTEMPTS
}

fn default_lock_backoff_ms() -> u64 {
    10
}

/// One `[[backend]]` table. Backends are held in memory.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    pub id: String,
    /// The naming contexts of this backend.
    pub base_dns: Vec<String>,
    #[serde(default)]
    pub writability: WritabilityMode,
    #[serde(default)]
    pub private: bool,
    /// OIDs of critical controls the backend accepts.
    #[serde(default)]
    pub supported_controls: Vec<String>,
}

/// This is the Server Configuration as read from `server.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// The log level, one of info, debug, trace. Defaults to "info" if not set.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Validate added and renamed entries against the schema.
    #[serde(default = "default_true")]
    pub check_schema: bool,
    /// One of reject, warn, accept.
    #[serde(default)]
    pub syntax_enforcement: SyntaxEnforcement,
    #[serde(default)]
    pub add_missing_rdn_attributes: bool,
    /// One of enabled, disabled, internal-only.
    #[serde(default)]
    pub writability: WritabilityMode,
    /// The numeric result code returned when the server itself fails.
    #[serde(default = "default_server_error_result_code")]
    pub server_error_result_code: u32,
    #[serde(default = "default_lock_attempts")]
    pub lock_attempts: u32,
    #[serde(default = "default_lock_backoff_ms")]
    pub lock_backoff_ms: u64,

    /// Plugins to run, in order: `lastmod`, `write-operation-counter`.
    #[serde(default)]
    pub plugins: Vec<String>,

    #[serde(default, rename = "backend")]
    pub backends: Vec<BackendConfig>,

    /// With none configured a built in default policy applies.
    #[serde(default)]
    pub password_policy: Vec<PasswordPolicyConfig>,
    #[serde(default)]
    pub validator: Vec<ComponentConfig>,
    #[serde(default)]
    pub notification_handler: Vec<ComponentConfig>,
    #[serde(default)]
    pub generator: Vec<ComponentConfig>,
}

impl ServerConfig {
    pub fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        let path = config_path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            admin_error!(path = %path.display(), ?e, "unable to read config file");
            ConfigError::Io(format!("{}: {e}", path.display()))
        })?;
        contents.parse()
    }
}

impl FromStr for ServerConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).map_err(|e| {
            admin_error!(?e, "unable to parse config");
            ConfigError::Parse(e.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        sketching::test_init();
        let cfg: ServerConfig = "".parse().expect("empty config");
        assert_eq!(cfg.log_level, LogLevel::Info);
        assert!(cfg.check_schema);
        assert_eq!(cfg.syntax_enforcement, SyntaxEnforcement::Reject);
        assert_eq!(cfg.writability, WritabilityMode::Enabled);
        assert_eq!(cfg.server_error_result_code, 80);
        assert_eq!(cfg.lock_attempts, LOCK_ATTEMPTS);
        assert!(cfg.backends.is_empty());
        assert!(cfg.password_policy.is_empty());
    }

    #[test]
    fn test_config_tables() {
        sketching::test_init();
        let cfg: ServerConfig = r#"
            log_level = "debug"
            syntax_enforcement = "warn"
            writability = "internal-only"
            plugins = ["lastmod"]

            [[backend]]
            id = "userRoot"
            base_dns = ["dc=example,dc=com"]

            [[backend]]
            id = "config"
            base_dns = ["cn=config"]
            private = true

            [[validator]]
            id = "length"
            kind = "length"
            options = { min-length = "10" }

            [[password_policy]]
            default = true
            password-validators = ["length"]
            lockout-failure-count = 3
            max-password-age = "30 days"
        "#
        .parse()
        .expect("config did not parse");

        assert_eq!(cfg.log_level, LogLevel::Debug);
        assert_eq!(cfg.syntax_enforcement, SyntaxEnforcement::Warn);
        assert_eq!(cfg.writability, WritabilityMode::InternalOnly);
        assert_eq!(cfg.backends.len(), 2);
        assert!(cfg.backends[1].private);
        assert_eq!(
            cfg.validator[0].options.get("min-length").map(String::as_str),
            Some("10")
        );
        assert_eq!(cfg.password_policy[0].lockout_failure_count, 3);
    }

    #[test]
    fn test_config_rejects_unknown_fields() {
        sketching::test_init();
        assert!(matches!(
            "colour = \"blue\"".parse::<ServerConfig>(),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            "[[backend]]\nid = \"x\"\nbase_dns = []\nsize = 3".parse::<ServerConfig>(),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            ServerConfig::new("/nonexistent/server.toml"),
            Err(ConfigError::Io(_))
        ));
    }
}
