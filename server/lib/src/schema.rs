//! [`Schema`] holds the attribute types and object classes that entries are
//! checked against before they reach a backend. The write pipelines consult it
//! for three things: whether an attribute type is operational or
//! NO-USER-MODIFICATION, the superior chain of an object class, and whether a
//! finished entry conforms.
//!
//! Conformance covers the class rules (every class defined, at least one
//! structural class, every MUST attribute present, every attribute allowed by
//! some class unless the entry is an `extensibleObject`, single valued types
//! holding one value) and, separately, per value syntax. Syntax failures are
//! handled according to [`SyntaxEnforcement`] so a deployment can choose to
//! only warn about them.
//!
//! The schema is a small built in set covering the standard person,
//! organizational and group classes together with the operational attributes
//! of the password policy. It can be amended through a write transaction, which
//! readers observe atomically once committed.

use concread::cowcell::*;
use hashbrown::{HashMap, HashSet};
use serde::Deserialize;

use crate::prelude::*;

/// The value syntaxes the server can check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Syntax {
    DirectoryString,
    Integer,
    Boolean,
    GeneralizedTime,
    Dn,
    OctetString,
    UserPassword,
    AuthPassword,
    Oid,
}

impl Syntax {
    pub fn oid(self) -> &'static str {
        match self {
            Syntax::DirectoryString => "1.3.6.1.4.1.1466.115.121.1.15",
            Syntax::Integer => "1.3.6.1.4.1.1466.115.121.1.27",
            Syntax::Boolean => "1.3.6.1.4.1.1466.115.121.1.7",
            Syntax::GeneralizedTime => "1.3.6.1.4.1.1466.115.121.1.24",
            Syntax::Dn => "1.3.6.1.4.1.1466.115.121.1.12",
            Syntax::OctetString => "1.3.6.1.4.1.1466.115.121.1.40",
            Syntax::UserPassword => OID_SYNTAX_USER_PASSWORD,
            Syntax::AuthPassword => OID_SYNTAX_AUTH_PASSWORD,
            Syntax::Oid => "1.3.6.1.4.1.1466.115.121.1.38",
        }
    }

    pub fn is_password(self) -> bool {
        matches!(self, Syntax::UserPassword | Syntax::AuthPassword)
    }

    pub fn is_valid(self, value: &str) -> bool {
        match self {
            Syntax::DirectoryString => !value.is_empty(),
            Syntax::Integer => value.trim().parse::<i64>().is_ok(),
            Syntax::Boolean => {
                value.eq_ignore_ascii_case("TRUE") || value.eq_ignore_ascii_case("FALSE")
            }
            Syntax::GeneralizedTime => GeneralizedTime::parse(value).is_ok(),
            Syntax::Dn => Dn::parse(value).is_ok(),
            Syntax::OctetString | Syntax::UserPassword => true,
            // scheme$authInfo$authValue
            Syntax::AuthPassword => {
                let parts: Vec<&str> = value.split('$').collect();
                parts.len() == 3 && parts.iter().all(|p| !p.trim().is_empty())
            }
            Syntax::Oid => {
                let numeric = value
                    .split('.')
                    .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
                let descr = value
                    .chars()
                    .next()
                    .map(|c| c.is_ascii_alphabetic())
                    .unwrap_or(false)
                    && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
                numeric || descr
            }
        }
    }
}

/// What to do with a value that violates its attribute syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyntaxEnforcement {
    #[default]
    Reject,
    Warn,
    Accept,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Abstract,
    Structural,
    Auxiliary,
}

/// The rules for one attribute type.
#[derive(Debug, Clone)]
pub struct SchemaAttribute {
    pub name: String,
    pub syntax: Syntax,
    pub single_value: bool,
    pub no_user_modification: bool,
    pub operational: bool,
    pub obsolete: bool,
}

impl SchemaAttribute {
    fn user(name: &str, syntax: Syntax, single_value: bool) -> Self {
        SchemaAttribute {
            name: name.to_string(),
            syntax,
            single_value,
            no_user_modification: false,
            operational: false,
            obsolete: false,
        }
    }

    fn operational(name: &str, syntax: Syntax, single_value: bool, no_user_modification: bool) -> Self {
        SchemaAttribute {
            name: name.to_string(),
            syntax,
            single_value,
            no_user_modification,
            operational: true,
            obsolete: false,
        }
    }
}

/// An object class: its kind, superiors and the attributes it requires and
/// permits.
#[derive(Debug, Clone)]
pub struct SchemaClass {
    pub name: String,
    pub kind: ClassKind,
    pub superiors: Vec<String>,
    pub must: Vec<String>,
    pub may: Vec<String>,
    pub obsolete: bool,
}

impl SchemaClass {
    fn new(name: &str, kind: ClassKind, superiors: &[&str], must: &[&str], may: &[&str]) -> Self {
        let owned = |v: &[&str]| -> Vec<String> { v.iter().map(|s| s.to_string()).collect() };
        SchemaClass {
            name: name.to_string(),
            kind,
            superiors: owned(superiors),
            must: owned(must),
            may: owned(may),
            obsolete: false,
        }
    }
}

pub struct Schema {
    classes: CowCell<HashMap<String, SchemaClass>>,
    attributes: CowCell<HashMap<String, SchemaAttribute>>,
}

/// A writable transaction of the schema. Changes become visible to new readers
/// on commit.
pub struct SchemaWriteTransaction<'a> {
    classes: CowCellWriteTxn<'a, HashMap<String, SchemaClass>>,
    attributes: CowCellWriteTxn<'a, HashMap<String, SchemaAttribute>>,
}

/// A readonly snapshot of the schema.
pub struct SchemaReadTransaction {
    classes: CowCellReadTxn<HashMap<String, SchemaClass>>,
    attributes: CowCellReadTxn<HashMap<String, SchemaAttribute>>,
}

pub trait SchemaTransaction {
    fn get_classes(&self) -> &HashMap<String, SchemaClass>;
    fn get_attributes(&self) -> &HashMap<String, SchemaAttribute>;

    fn get_class(&self, name: &str) -> Option<&SchemaClass> {
        self.get_classes().get(&name.to_lowercase())
    }

    fn get_attribute(&self, name: &str) -> Option<&SchemaAttribute> {
        self.get_attributes().get(&name.to_lowercase())
    }

    fn is_operational(&self, name: &str) -> bool {
        self.get_attribute(name)
            .map(|a| a.operational)
            .unwrap_or(false)
    }

    fn is_no_user_modification(&self, name: &str) -> bool {
        self.get_attribute(name)
            .map(|a| a.no_user_modification)
            .unwrap_or(false)
    }

    fn is_obsolete_attribute(&self, name: &str) -> bool {
        self.get_attribute(name).map(|a| a.obsolete).unwrap_or(false)
    }

    /// Every superior of a class, transitively, by canonical name. Unknown
    /// classes have none.
    fn superiors_of(&self, name: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut work: Vec<String> = self
            .get_class(name)
            .map(|c| c.superiors.clone())
            .unwrap_or_default();
        while let Some(sup) = work.pop() {
            let Some(class) = self.get_class(&sup) else {
                admin_warn!(class = %name, superior = %sup, "superior class is not defined");
                continue;
            };
            if seen.insert(class.name.to_lowercase()) {
                out.push(class.name.clone());
                work.extend(class.superiors.iter().cloned());
            }
        }
        out
    }

    /// Check the class rules for an entry.
    fn validate_entry(&self, e: &Entry) -> Result<(), SchemaError> {
        let oc_map = e.object_class_map();
        if oc_map.is_empty() {
            return Err(SchemaError::NoClassFound);
        }

        let mut classes = Vec::with_capacity(oc_map.len());
        let mut invalid = Vec::new();
        for name in oc_map.values() {
            match self.get_class(name) {
                Some(c) => classes.push(c),
                None => invalid.push(name.clone()),
            }
        }
        if !invalid.is_empty() {
            return Err(SchemaError::InvalidClass(invalid));
        }
        if let Some(c) = classes.iter().find(|c| c.obsolete) {
            return Err(SchemaError::Obsolete(c.name.clone()));
        }
        if !classes.iter().any(|c| c.kind == ClassKind::Structural) {
            return Err(SchemaError::NoStructuralClass);
        }

        // The rules of every superior apply as well.
        let mut all = classes.clone();
        for c in &classes {
            for sup in self.superiors_of(&c.name) {
                if let Some(s) = self.get_class(&sup) {
                    all.push(s);
                }
            }
        }

        let missing: Vec<String> = all
            .iter()
            .flat_map(|c| c.must.iter())
            .filter(|a| !e.has_attribute(a))
            .cloned()
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        if !missing.is_empty() {
            return Err(SchemaError::MissingMustAttribute(missing));
        }

        let extensible = e.has_object_class(OC_EXTENSIBLE_OBJECT);
        let allowed: HashSet<String> = all
            .iter()
            .flat_map(|c| c.must.iter().chain(c.may.iter()))
            .map(|a| a.to_lowercase())
            .collect();

        for (key, variants) in e
            .user_attributes()
            .iter()
            .chain(e.operational_attributes().iter())
        {
            let schema_attr = self.get_attributes().get(key);
            if let Some(sa) = schema_attr {
                if sa.obsolete {
                    return Err(SchemaError::Obsolete(sa.name.clone()));
                }
                if sa.single_value && variants.iter().any(|a| a.len() > 1) {
                    return Err(SchemaError::SingleValueViolation(sa.name.clone()));
                }
            }
            let operational = schema_attr.map(|sa| sa.operational).unwrap_or(false);
            if !operational && !extensible && !allowed.contains(key) {
                return Err(SchemaError::AttributeNotValidForClass(
                    variants
                        .first()
                        .map(|a| a.name().to_string())
                        .unwrap_or_else(|| key.clone()),
                ));
            }
        }
        Ok(())
    }

    /// Check every value against its attribute syntax. Attribute types the
    /// schema does not define are not checked.
    fn check_syntax(&self, e: &Entry, enforcement: SyntaxEnforcement) -> Result<(), SchemaError> {
        if enforcement == SyntaxEnforcement::Accept {
            return Ok(());
        }
        for (key, variants) in e
            .user_attributes()
            .iter()
            .chain(e.operational_attributes().iter())
        {
            let Some(sa) = self.get_attributes().get(key) else {
                continue;
            };
            for value in variants.iter().flat_map(|a| a.values().iter()) {
                if sa.syntax.is_valid(value) {
                    continue;
                }
                match enforcement {
                    SyntaxEnforcement::Reject => {
                        request_error!(attr = %sa.name, dn = %e.dn(), "value violates attribute syntax");
                        return Err(SchemaError::InvalidAttributeSyntax(sa.name.clone()));
                    }
                    SyntaxEnforcement::Warn => {
                        admin_warn!(attr = %sa.name, dn = %e.dn(), "value violates attribute syntax, accepting");
                    }
                    SyntaxEnforcement::Accept => {}
                }
            }
        }
        Ok(())
    }
}

impl<'a> SchemaWriteTransaction<'a> {
    pub fn commit(self) {
        let SchemaWriteTransaction {
            classes,
            attributes,
        } = self;
        classes.commit();
        attributes.commit();
    }

    pub fn update_attribute(&mut self, attr: SchemaAttribute) {
        self.attributes.get_mut().insert(attr.name.to_lowercase(), attr);
    }

    pub fn update_class(&mut self, class: SchemaClass) {
        self.classes.get_mut().insert(class.name.to_lowercase(), class);
    }

    /// Flag an existing attribute type or class as obsolete. Returns false if
    /// neither exists.
    pub fn set_obsolete(&mut self, name: &str) -> bool {
        let key = name.to_lowercase();
        let mut found = false;
        if let Some(a) = self.attributes.get_mut().get_mut(&key) {
            a.obsolete = true;
            found = true;
        }
        if let Some(c) = self.classes.get_mut().get_mut(&key) {
            c.obsolete = true;
            found = true;
        }
        found
    }

    fn generate_in_memory(&mut self) {
        use ClassKind::*;
        use Syntax::{AuthPassword, Boolean, DirectoryString, Integer, OctetString, Oid, UserPassword};

        let attributes = [
            SchemaAttribute::user(ATTR_OBJECTCLASS, Oid, false),
            SchemaAttribute::user("cn", DirectoryString, false),
            SchemaAttribute::user("sn", DirectoryString, false),
            SchemaAttribute::user("givenName", DirectoryString, false),
            SchemaAttribute::user("displayName", DirectoryString, true),
            SchemaAttribute::user("initials", DirectoryString, false),
            SchemaAttribute::user("description", DirectoryString, false),
            SchemaAttribute::user("title", DirectoryString, false),
            SchemaAttribute::user("mail", DirectoryString, false),
            SchemaAttribute::user("telephoneNumber", DirectoryString, false),
            SchemaAttribute::user("street", DirectoryString, false),
            SchemaAttribute::user("l", DirectoryString, false),
            SchemaAttribute::user("st", DirectoryString, false),
            SchemaAttribute::user("postalCode", DirectoryString, false),
            SchemaAttribute::user("ou", DirectoryString, false),
            SchemaAttribute::user("o", DirectoryString, false),
            SchemaAttribute::user("dc", DirectoryString, true),
            SchemaAttribute::user(ATTR_UID, DirectoryString, false),
            SchemaAttribute::user("employeeNumber", DirectoryString, true),
            SchemaAttribute::user("uidNumber", Integer, true),
            SchemaAttribute::user("gidNumber", Integer, true),
            SchemaAttribute::user("homeDirectory", DirectoryString, true),
            SchemaAttribute::user("loginShell", DirectoryString, true),
            SchemaAttribute::user("seeAlso", Syntax::Dn, false),
            SchemaAttribute::user("member", Syntax::Dn, false),
            SchemaAttribute::user("owner", Syntax::Dn, false),
            SchemaAttribute::user("manager", Syntax::Dn, false),
            SchemaAttribute::user(ATTR_USER_PASSWORD, UserPassword, false),
            SchemaAttribute::user(ATTR_AUTH_PASSWORD, AuthPassword, false),
            // Server maintained.
            SchemaAttribute::operational(ATTR_CREATE_TIMESTAMP, Syntax::GeneralizedTime, true, true),
            SchemaAttribute::operational("creatorsName", Syntax::Dn, true, true),
            SchemaAttribute::operational("modifyTimestamp", Syntax::GeneralizedTime, true, true),
            SchemaAttribute::operational("modifiersName", Syntax::Dn, true, true),
            SchemaAttribute::operational("entryUUID", DirectoryString, true, true),
            SchemaAttribute::operational(ATTR_PRIVILEGE_NAME, DirectoryString, false, false),
            // Password policy state.
            SchemaAttribute::operational(ATTR_PWD_CHANGED_TIME, Syntax::GeneralizedTime, true, true),
            SchemaAttribute::operational(ATTR_PWD_FAILURE_TIME, Syntax::GeneralizedTime, false, true),
            SchemaAttribute::operational(ATTR_PWD_ACCOUNT_LOCKED_TIME, Syntax::GeneralizedTime, true, true),
            SchemaAttribute::operational(ATTR_PWD_GRACE_USE_TIME, Syntax::GeneralizedTime, false, true),
            SchemaAttribute::operational(ATTR_PWD_RESET, Boolean, true, false),
            SchemaAttribute::operational(ATTR_PWD_HISTORY, OctetString, false, true),
            SchemaAttribute::operational(ATTR_PWP_ACCOUNT_DISABLED, Boolean, true, false),
            SchemaAttribute::operational(ATTR_PWP_ACCOUNT_EXPIRATION_TIME, Syntax::GeneralizedTime, true, false),
            SchemaAttribute::operational(ATTR_PWP_LAST_LOGIN_TIME, DirectoryString, true, false),
            SchemaAttribute::operational(ATTR_PWP_CHANGED_BY_REQUIRED_TIME, Syntax::GeneralizedTime, true, false),
            SchemaAttribute::operational(ATTR_PWP_WARNED_TIME, Syntax::GeneralizedTime, true, true),
            SchemaAttribute::operational(ATTR_PWP_POLICY_DN, Syntax::Dn, true, false),
        ];

        let classes = [
            SchemaClass::new(OC_TOP, Abstract, &[], &[ATTR_OBJECTCLASS], &[]),
            SchemaClass::new(
                "person",
                Structural,
                &[OC_TOP],
                &["sn", "cn"],
                &[ATTR_USER_PASSWORD, "telephoneNumber", "seeAlso", "description"],
            ),
            SchemaClass::new(
                "organizationalPerson",
                Structural,
                &["person"],
                &[],
                &["title", "ou", "l", "st", "street", "postalCode"],
            ),
            SchemaClass::new(
                "inetOrgPerson",
                Structural,
                &["organizationalPerson"],
                &[],
                &[
                    ATTR_UID,
                    "mail",
                    "givenName",
                    "displayName",
                    "initials",
                    "employeeNumber",
                    "manager",
                    "o",
                ],
            ),
            SchemaClass::new(
                "posixAccount",
                Auxiliary,
                &[OC_TOP],
                &["cn", ATTR_UID, "uidNumber", "gidNumber", "homeDirectory"],
                &[ATTR_USER_PASSWORD, "loginShell", "description"],
            ),
            SchemaClass::new("authPasswordObject", Auxiliary, &[OC_TOP], &[], &[ATTR_AUTH_PASSWORD]),
            SchemaClass::new(
                "organizationalUnit",
                Structural,
                &[OC_TOP],
                &["ou"],
                &["description", "seeAlso", "l", "st", "telephoneNumber"],
            ),
            SchemaClass::new(
                "organization",
                Structural,
                &[OC_TOP],
                &["o"],
                &["description", "seeAlso", "l", "st", "telephoneNumber"],
            ),
            SchemaClass::new("domain", Structural, &[OC_TOP], &["dc"], &["description", "o", "l"]),
            SchemaClass::new("dcObject", Auxiliary, &[OC_TOP], &["dc"], &[]),
            SchemaClass::new(
                "groupOfNames",
                Structural,
                &[OC_TOP],
                &["cn", "member"],
                &["description", "owner", "ou", "o", "seeAlso"],
            ),
            SchemaClass::new(OC_EXTENSIBLE_OBJECT, Auxiliary, &[OC_TOP], &[], &[]),
        ];

        for a in attributes {
            self.update_attribute(a);
        }
        for c in classes {
            self.update_class(c);
        }
    }
}

impl<'a> SchemaTransaction for SchemaWriteTransaction<'a> {
    fn get_classes(&self) -> &HashMap<String, SchemaClass> {
        &self.classes
    }

    fn get_attributes(&self) -> &HashMap<String, SchemaAttribute> {
        &self.attributes
    }
}

impl SchemaTransaction for SchemaReadTransaction {
    fn get_classes(&self) -> &HashMap<String, SchemaClass> {
        &self.classes
    }

    fn get_attributes(&self) -> &HashMap<String, SchemaAttribute> {
        &self.attributes
    }
}

impl Schema {
    pub fn new() -> Self {
        let s = Schema {
            classes: CowCell::new(HashMap::with_capacity(32)),
            attributes: CowCell::new(HashMap::with_capacity(64)),
        };
        let mut sw = s.write();
        sw.generate_in_memory();
        sw.commit();
        s
    }

    pub fn read(&self) -> SchemaReadTransaction {
        SchemaReadTransaction {
            classes: self.classes.read(),
            attributes: self.attributes.read(),
        }
    }

    pub fn write(&self) -> SchemaWriteTransaction<'_> {
        SchemaWriteTransaction {
            classes: self.classes.write(),
            attributes: self.attributes.write(),
        }
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bob() -> Entry {
        entry_init!(
            "cn=Bob,ou=People,dc=example",
            (ATTR_OBJECTCLASS, "top"),
            (ATTR_OBJECTCLASS, "person"),
            (ATTR_OBJECTCLASS, "organizationalPerson"),
            (ATTR_OBJECTCLASS, "inetOrgPerson"),
            ("cn", "Bob"),
            ("sn", "Smith"),
            ("uid", "bob")
        )
    }

    #[test]
    fn test_schema_superiors() {
        sketching::test_init();
        let schema = Schema::new();
        let txn = schema.read();
        let mut sups = txn.superiors_of("INETORGPERSON");
        sups.sort();
        assert_eq!(sups, vec!["organizationalPerson", "person", "top"]);
        assert!(txn.superiors_of("top").is_empty());
        assert!(txn.superiors_of("nonexistent").is_empty());
    }

    #[test]
    fn test_schema_validate_entry() {
        sketching::test_init();
        let schema = Schema::new();
        let txn = schema.read();
        assert_eq!(txn.validate_entry(&bob()), Ok(()));

        let mut e = bob();
        assert!(e.remove_attribute("sn").is_ok());
        assert_eq!(
            txn.validate_entry(&e),
            Err(SchemaError::MissingMustAttribute(vec!["sn".to_string()]))
        );

        let mut e = bob();
        e.add_values("homeDirectory", false, ["/home/bob"]);
        assert_eq!(
            txn.validate_entry(&e),
            Err(SchemaError::AttributeNotValidForClass("homeDirectory".to_string()))
        );
        e.add_object_class(OC_EXTENSIBLE_OBJECT);
        assert_eq!(txn.validate_entry(&e), Ok(()));

        let mut e = bob();
        e.add_values("displayName", false, ["Bob", "Bobby"]);
        assert_eq!(
            txn.validate_entry(&e),
            Err(SchemaError::SingleValueViolation("displayName".to_string()))
        );

        let mut e = bob();
        e.add_object_class("madeUpClass");
        assert_eq!(
            txn.validate_entry(&e),
            Err(SchemaError::InvalidClass(vec!["madeUpClass".to_string()]))
        );

        let e = entry_init!("cn=x,dc=example", (ATTR_OBJECTCLASS, "top"), ("cn", "x"));
        assert_eq!(txn.validate_entry(&e), Err(SchemaError::NoStructuralClass));
    }

    #[test]
    fn test_schema_operational_attributes_always_allowed() {
        sketching::test_init();
        let schema = Schema::new();
        let txn = schema.read();
        let mut e = bob();
        e.add_values(ATTR_PWD_CHANGED_TIME, true, ["20240101000000.000Z"]);
        assert!(txn.is_operational(ATTR_PWD_CHANGED_TIME));
        assert!(txn.is_no_user_modification(ATTR_CREATE_TIMESTAMP));
        assert_eq!(txn.validate_entry(&e), Ok(()));
    }

    #[test]
    fn test_schema_syntax_enforcement() {
        sketching::test_init();
        let schema = Schema::new();
        let txn = schema.read();
        let mut e = bob();
        e.add_object_class("posixAccount");
        e.add_values("uidNumber", false, ["not a number"]);

        assert_eq!(
            txn.check_syntax(&e, SyntaxEnforcement::Reject),
            Err(SchemaError::InvalidAttributeSyntax("uidNumber".to_string()))
        );
        assert_eq!(txn.check_syntax(&e, SyntaxEnforcement::Warn), Ok(()));
        assert_eq!(txn.check_syntax(&e, SyntaxEnforcement::Accept), Ok(()));

        assert!(Syntax::Boolean.is_valid("true"));
        assert!(!Syntax::Boolean.is_valid("yes"));
        assert!(Syntax::AuthPassword.is_valid("SHA256$c2FsdA==$aGFzaA=="));
        assert!(!Syntax::AuthPassword.is_valid("{SSHA}abc"));
        assert!(Syntax::Oid.is_valid("1.3.6.1"));
        assert!(Syntax::Oid.is_valid("inetOrgPerson"));
    }

    #[test]
    fn test_schema_write_transaction() {
        sketching::test_init();
        let schema = Schema::new();
        let before = schema.read();

        let mut w = schema.write();
        assert!(w.set_obsolete("organizationalPerson"));
        assert!(!w.set_obsolete("nonexistent"));
        w.commit();

        // The older snapshot is unaffected.
        assert_eq!(before.validate_entry(&bob()), Ok(()));
        assert_eq!(
            schema.read().validate_entry(&bob()),
            Err(SchemaError::Obsolete("organizationalPerson".to_string()))
        );
    }
}
