//! The component registry maps the identifiers used in configuration to the
//! storage schemes, validators, notification handlers and generators that
//! implement them. Configuration only ever names a component by identifier,
//! the registry builds it.

use std::collections::BTreeMap;

use hashbrown::HashMap;
use serde::Deserialize;

use crate::prelude::*;
use crate::pwpolicy::generator::{PasswordGenerator, RandomPasswordGenerator};
use crate::pwpolicy::notify::{AccountStatusNotificationHandler, LogNotificationHandler};
use crate::pwpolicy::scheme::{
    Base64Scheme, ClearScheme, PasswordStorageScheme, PasswordSyntax, ShaScheme,
};
use crate::pwpolicy::validator::{
    CharacterSetValidator, LengthValidator, PasswordValidator, StrengthValidator,
};

/// One configured component: an identifier the policies refer to, the kind
/// of component to build and its options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentConfig {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl ComponentConfig {
    pub fn new(id: &str, kind: &str) -> Self {
        ComponentConfig {
            id: id.to_string(),
            kind: kind.to_string(),
            options: BTreeMap::new(),
        }
    }

    pub fn with_option(mut self, name: &str, value: &str) -> Self {
        self.options.insert(name.to_string(), value.to_string());
        self
    }

    fn invalid(&self, reason: impl Into<String>) -> ConfigError {
        ConfigError::InvalidComponent {
            id: self.id.clone(),
            reason: reason.into(),
        }
    }

    fn parse_option<T: std::str::FromStr>(&self, name: &str, default: T) -> Result<T, ConfigError> {
        match self.options.get(name) {
            Some(v) => v
                .trim()
                .parse()
                .map_err(|_| self.invalid(format!("option {name} has an invalid value {v:?}"))),
            None => Ok(default),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentSetConfig {
    #[serde(default)]
    pub validators: Vec<ComponentConfig>,
    #[serde(default)]
    pub notification_handlers: Vec<ComponentConfig>,
    #[serde(default)]
    pub generators: Vec<ComponentConfig>,
}

type ValidatorFactory = fn(&ComponentConfig) -> Result<Arc<dyn PasswordValidator>, ConfigError>;
type HandlerFactory =
    fn(&ComponentConfig) -> Result<Arc<dyn AccountStatusNotificationHandler>, ConfigError>;
type GeneratorFactory = fn(&ComponentConfig) -> Result<Arc<dyn PasswordGenerator>, ConfigError>;

fn length_validator(c: &ComponentConfig) -> Result<Arc<dyn PasswordValidator>, ConfigError> {
    let min = c.parse_option("min-length", 6usize)?;
    let max = c.parse_option("max-length", 0usize)?;
    if max > 0 && max < min {
        return Err(c.invalid("max-length is below min-length"));
    }
    Ok(Arc::new(LengthValidator::new(&c.id, min, max)))
}

/// `character-sets` holds whitespace separated `count:characters` pairs.
fn character_set_validator(c: &ComponentConfig) -> Result<Arc<dyn PasswordValidator>, ConfigError> {
    let allow_unclassified = c.parse_option("allow-unclassified-characters", true)?;
    let Some(spec) = c.options.get("character-sets") else {
        return Ok(Arc::new(CharacterSetValidator::standard(&c.id)));
    };
    let mut sets = Vec::new();
    for item in spec.split_whitespace() {
        let (count, chars) = item
            .split_once(':')
            .ok_or_else(|| c.invalid(format!("character set {item:?} is not count:characters")))?;
        let count: usize = count
            .parse()
            .map_err(|_| c.invalid(format!("character set {item:?} has an invalid count")))?;
        if chars.is_empty() {
            return Err(c.invalid(format!("character set {item:?} is empty")));
        }
        sets.push((chars.to_string(), count));
    }
    Ok(Arc::new(CharacterSetValidator::new(&c.id, sets, allow_unclassified)))
}

fn strength_validator(c: &ComponentConfig) -> Result<Arc<dyn PasswordValidator>, ConfigError> {
    let min_score = c.parse_option("min-score", 3u8)?;
    if min_score > 4 {
        return Err(c.invalid("min-score must be between 0 and 4"));
    }
    let related = c
        .options
        .get("related-attributes")
        .map(String::as_str)
        .unwrap_or("uid,cn,sn,givenName,mail")
        .split(',')
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .collect();
    Ok(Arc::new(StrengthValidator::new(&c.id, min_score, related)))
}

fn log_handler(c: &ComponentConfig) -> Result<Arc<dyn AccountStatusNotificationHandler>, ConfigError> {
    Ok(Arc::new(LogNotificationHandler::new(&c.id)))
}

fn random_generator(c: &ComponentConfig) -> Result<Arc<dyn PasswordGenerator>, ConfigError> {
    let groups = c.parse_option("groups", 4usize)?;
    let group_len = c.parse_option("group-length", 5usize)?;
    Ok(Arc::new(RandomPasswordGenerator::new(&c.id, groups, group_len)))
}

pub struct ComponentRegistry {
    schemes: HashMap<String, Arc<dyn PasswordStorageScheme>>,
    validators: HashMap<String, ValidatorFactory>,
    handlers: HashMap<String, HandlerFactory>,
    generators: HashMap<String, GeneratorFactory>,
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentRegistry {
    /// A registry holding every built in component kind.
    pub fn new() -> Self {
        let mut r = ComponentRegistry {
            schemes: HashMap::new(),
            validators: HashMap::new(),
            handlers: HashMap::new(),
            generators: HashMap::new(),
        };
        r.register_scheme(Arc::new(ClearScheme));
        r.register_scheme(Arc::new(Base64Scheme));
        r.register_scheme(Arc::new(ShaScheme::sha()));
        r.register_scheme(Arc::new(ShaScheme::ssha()));
        r.register_scheme(Arc::new(ShaScheme::ssha256()));
        r.register_scheme(Arc::new(ShaScheme::ssha512()));
        r.register_validator_kind("length", length_validator);
        r.register_validator_kind("character-set", character_set_validator);
        r.register_validator_kind("strength", strength_validator);
        r.register_handler_kind("log", log_handler);
        r.register_generator_kind("random", random_generator);
        r
    }

    pub fn register_scheme(&mut self, scheme: Arc<dyn PasswordStorageScheme>) {
        self.schemes.insert(scheme.name().to_uppercase(), scheme);
    }

    pub fn register_validator_kind(&mut self, kind: &str, factory: ValidatorFactory) {
        self.validators.insert(kind.to_string(), factory);
    }

    pub fn register_handler_kind(&mut self, kind: &str, factory: HandlerFactory) {
        self.handlers.insert(kind.to_string(), factory);
    }

    pub fn register_generator_kind(&mut self, kind: &str, factory: GeneratorFactory) {
        self.generators.insert(kind.to_string(), factory);
    }

    /// Build every configured component. Identifiers must be unique within
    /// each family.
    pub fn build(&self, config: &ComponentSetConfig) -> Result<ComponentSet, ConfigError> {
        let mut set = ComponentSet {
            schemes: self.schemes.clone(),
            ..Default::default()
        };

        for c in &config.validators {
            let factory = self
                .validators
                .get(&c.kind)
                .ok_or_else(|| ConfigError::UnknownComponentKind(c.kind.clone()))?;
            if set.validators.insert(c.id.clone(), factory(c)?).is_some() {
                return Err(ConfigError::Duplicate(format!("validator {}", c.id)));
            }
        }
        for c in &config.notification_handlers {
            let factory = self
                .handlers
                .get(&c.kind)
                .ok_or_else(|| ConfigError::UnknownComponentKind(c.kind.clone()))?;
            if set.handlers.insert(c.id.clone(), factory(c)?).is_some() {
                return Err(ConfigError::Duplicate(format!("notification handler {}", c.id)));
            }
        }
        for c in &config.generators {
            let factory = self
                .generators
                .get(&c.kind)
                .ok_or_else(|| ConfigError::UnknownComponentKind(c.kind.clone()))?;
            if set.generators.insert(c.id.clone(), factory(c)?).is_some() {
                return Err(ConfigError::Duplicate(format!("generator {}", c.id)));
            }
        }

        admin_debug!(
            schemes = set.schemes.len(),
            validators = set.validators.len(),
            handlers = set.handlers.len(),
            generators = set.generators.len(),
            "password policy components built"
        );
        Ok(set)
    }
}

/// The components available to password policies, by identifier.
#[derive(Clone, Default)]
pub struct ComponentSet {
    schemes: HashMap<String, Arc<dyn PasswordStorageScheme>>,
    validators: HashMap<String, Arc<dyn PasswordValidator>>,
    handlers: HashMap<String, Arc<dyn AccountStatusNotificationHandler>>,
    generators: HashMap<String, Arc<dyn PasswordGenerator>>,
}

impl ComponentSet {
    /// Scheme names are case insensitive.
    pub fn scheme(&self, name: &str) -> Option<Arc<dyn PasswordStorageScheme>> {
        self.schemes.get(&name.to_uppercase()).cloned()
    }

    /// Look up a scheme by the name it uses in auth password values.
    pub fn auth_scheme(&self, name: &str) -> Option<Arc<dyn PasswordStorageScheme>> {
        self.schemes
            .values()
            .find(|s| {
                s.supports(PasswordSyntax::AuthPassword)
                    && s.auth_password_name()
                        .map(|n| n.eq_ignore_ascii_case(name))
                        .unwrap_or(false)
            })
            .cloned()
    }

    pub fn validator(&self, id: &str) -> Option<Arc<dyn PasswordValidator>> {
        self.validators.get(id).cloned()
    }

    pub fn handler(&self, id: &str) -> Option<Arc<dyn AccountStatusNotificationHandler>> {
        self.handlers.get(id).cloned()
    }

    pub fn generator(&self, id: &str) -> Option<Arc<dyn PasswordGenerator>> {
        self.generators.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_builds_components() {
        sketching::test_init();
        let registry = ComponentRegistry::new();
        let config = ComponentSetConfig {
            validators: vec![
                ComponentConfig::new("len", "length").with_option("min-length", "8"),
                ComponentConfig::new("chars", "character-set")
                    .with_option("character-sets", "1:abc 2:0123456789"),
                ComponentConfig::new("strong", "strength"),
            ],
            notification_handlers: vec![ComponentConfig::new("log", "log")],
            generators: vec![ComponentConfig::new("random", "random")],
        };
        let set = registry.build(&config).expect("build");
        assert!(set.validator("len").is_some());
        assert!(set.validator("chars").is_some());
        assert!(set.handler("log").is_some());
        assert!(set.generator("random").is_some());
        assert!(set.scheme("ssha512").is_some());
        assert_eq!(set.auth_scheme("sha256").map(|s| s.name()), Some("SSHA256"));
        assert!(set.scheme("MD5").is_none());

        let e = entry_init!("cn=Bob,dc=example", ("cn", "Bob"));
        let chars = set.validator("chars").expect("validator");
        assert!(chars.validate("a12", &e).is_ok());
        assert!(chars.validate("a1", &e).is_err());
    }

    #[test]
    fn test_registry_rejects_bad_components() {
        sketching::test_init();
        let registry = ComponentRegistry::new();

        let unknown = ComponentSetConfig {
            validators: vec![ComponentConfig::new("x", "dictionary")],
            ..Default::default()
        };
        assert_eq!(
            registry.build(&unknown).err(),
            Some(ConfigError::UnknownComponentKind("dictionary".to_string()))
        );

        let duplicate = ComponentSetConfig {
            notification_handlers: vec![
                ComponentConfig::new("log", "log"),
                ComponentConfig::new("log", "log"),
            ],
            ..Default::default()
        };
        assert!(matches!(
            registry.build(&duplicate),
            Err(ConfigError::Duplicate(_))
        ));

        let bad = ComponentSetConfig {
            validators: vec![ComponentConfig::new("len", "length").with_option("min-length", "eight")],
            ..Default::default()
        };
        assert!(matches!(
            registry.build(&bad),
            Err(ConfigError::InvalidComponent { .. })
        ));
    }
}
