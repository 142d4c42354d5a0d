//! Entries are the objects stored in the directory. An [`Entry`] owns its [`Dn`],
//! a set of object classes and two attribute maps, one for user attributes and
//! one for operational attributes (those the server maintains, such as the
//! password policy state).
//!
//! Each map is keyed by the lowercase attribute type. An attribute type may
//! appear several times with different option sets (`description` and
//! `description;lang-fr` are separate [`Attribute`]s under the same key).
//!
//! The mutators on [`Entry`] refuse to remove a value that forms part of the
//! entry's own relative name. Once the rename and add pipelines have placed the
//! RDN values on an entry, nothing downstream can take them away again, and
//! every such refusal carries `NOT_ALLOWED_ON_RDN`.

use std::collections::{BTreeMap, BTreeSet};

use crate::dn::normalise_value;
use crate::prelude::*;

pub type AttributeMap = BTreeMap<String, Vec<Attribute>>;

/// An attribute type, its options and an ordered list of values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    attr_type: String,
    options: BTreeSet<String>,
    values: Vec<String>,
}

impl Attribute {
    pub fn new<V: Into<String>>(attr_type: &str, values: impl IntoIterator<Item = V>) -> Self {
        let mut a = Attribute {
            attr_type: attr_type.to_string(),
            options: BTreeSet::new(),
            values: Vec::new(),
        };
        for v in values {
            a.add_value(v);
        }
        a
    }

    pub fn with_options<S: AsRef<str>>(mut self, options: impl IntoIterator<Item = S>) -> Self {
        self.options = options
            .into_iter()
            .map(|o| o.as_ref().to_lowercase())
            .filter(|o| !o.is_empty())
            .collect();
        self
    }

    /// Split an attribute description such as `description;lang-fr;binary`
    /// into its type and (lowercased) options.
    pub fn parse_description(desc: &str) -> (String, BTreeSet<String>) {
        let mut parts = desc.split(';');
        let attr_type = parts.next().unwrap_or_default().trim().to_string();
        let options = parts
            .map(|o| o.trim().to_lowercase())
            .filter(|o| !o.is_empty())
            .collect();
        (attr_type, options)
    }

    pub fn from_description<V: Into<String>>(
        desc: &str,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let (attr_type, options) = Self::parse_description(desc);
        Attribute::new(&attr_type, values).with_options(options)
    }

    pub fn name(&self) -> &str {
        &self.attr_type
    }

    /// The map key for this attribute type.
    pub fn key(&self) -> String {
        self.attr_type.to_lowercase()
    }

    pub fn options(&self) -> &BTreeSet<String> {
        &self.options
    }

    pub fn has_options(&self) -> bool {
        !self.options.is_empty()
    }

    pub fn description(&self) -> String {
        let mut d = self.attr_type.clone();
        for o in &self.options {
            d.push(';');
            d.push_str(o);
        }
        d
    }

    /// True if both share a type (ignoring case) and an identical option set.
    pub fn same_description(&self, other: &Attribute) -> bool {
        self.attr_type.eq_ignore_ascii_case(&other.attr_type) && self.options == other.options
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn first_value(&self) -> Option<&str> {
        self.values.first().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn contains(&self, value: &str) -> bool {
        self.values.iter().any(|v| v == value)
    }

    /// Containment under the directory string equality rule, ignoring case and
    /// runs of whitespace. This is how RDN values are matched.
    pub fn contains_normalised(&self, value: &str) -> bool {
        let n = normalise_value(value);
        self.values.iter().any(|v| normalise_value(v) == n)
    }

    /// Returns false if the value was already present.
    pub fn add_value(&mut self, value: impl Into<String>) -> bool {
        let value = value.into();
        if self.contains(&value) {
            false
        } else {
            self.values.push(value);
            true
        }
    }

    pub fn remove_value(&mut self, value: &str) -> bool {
        let before = self.values.len();
        self.values.retain(|v| v != value);
        before != self.values.len()
    }

    /// Value set union, keeping the order of first appearance.
    pub fn merge(&mut self, other: Attribute) {
        for v in other.values {
            self.add_value(v);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    dn: Dn,
    object_classes: BTreeMap<String, String>,
    user_attributes: AttributeMap,
    operational_attributes: AttributeMap,
}

fn is_objectclass(name: &str) -> bool {
    name.eq_ignore_ascii_case(ATTR_OBJECTCLASS)
}

impl Entry {
    pub fn new(dn: Dn) -> Self {
        Entry {
            dn,
            object_classes: BTreeMap::new(),
            user_attributes: AttributeMap::new(),
            operational_attributes: AttributeMap::new(),
        }
    }

    pub fn from_parts(
        dn: Dn,
        object_classes: BTreeMap<String, String>,
        user_attributes: AttributeMap,
        operational_attributes: AttributeMap,
    ) -> Self {
        Entry {
            dn,
            object_classes,
            user_attributes,
            operational_attributes,
        }
    }

    pub fn dn(&self) -> &Dn {
        &self.dn
    }

    pub(crate) fn set_dn(&mut self, dn: Dn) {
        self.dn = dn;
    }

    /// A copy of this entry under another name. No attribute values change, the
    /// caller is responsible for bringing the RDN values in line.
    pub fn duplicate_with_dn(&self, dn: Dn) -> Entry {
        let mut e = self.clone();
        e.set_dn(dn);
        e
    }

    /* ===== object classes ===== */

    /// Canonical names of the object classes of this entry.
    pub fn object_classes(&self) -> impl Iterator<Item = &str> {
        self.object_classes.values().map(String::as_str)
    }

    pub fn object_class_map(&self) -> &BTreeMap<String, String> {
        &self.object_classes
    }

    pub fn has_object_class(&self, name: &str) -> bool {
        self.object_classes.contains_key(&name.to_lowercase())
    }

    /// Returns false if the class was already present.
    pub fn add_object_class(&mut self, name: &str) -> bool {
        let key = name.to_lowercase();
        if self.object_classes.contains_key(&key) {
            false
        } else {
            self.object_classes.insert(key, name.to_string());
            true
        }
    }

    /* ===== reading attributes ===== */

    pub fn user_attributes(&self) -> &AttributeMap {
        &self.user_attributes
    }

    pub fn operational_attributes(&self) -> &AttributeMap {
        &self.operational_attributes
    }

    pub fn is_operational(&self, name: &str) -> bool {
        self.operational_attributes
            .contains_key(&name.to_lowercase())
    }

    /// All variants (option sets) of an attribute type.
    pub fn get_attribute(&self, name: &str) -> Option<&[Attribute]> {
        let key = name.to_lowercase();
        self.user_attributes
            .get(&key)
            .or_else(|| self.operational_attributes.get(&key))
            .map(Vec::as_slice)
    }

    pub fn get_attribute_with_options(
        &self,
        name: &str,
        options: &BTreeSet<String>,
    ) -> Option<&Attribute> {
        self.get_attribute(name)?
            .iter()
            .find(|a| a.options() == options)
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        if is_objectclass(name) {
            return !self.object_classes.is_empty();
        }
        self.get_attribute(name)
            .map(|attrs| attrs.iter().any(|a| !a.is_empty()))
            .unwrap_or(false)
    }

    /// Every value of the type across all option sets. Object classes are
    /// reported as values of `objectClass`.
    pub fn get_values(&self, name: &str) -> Vec<&str> {
        if is_objectclass(name) {
            return self.object_classes().collect();
        }
        self.get_attribute(name)
            .map(|attrs| {
                attrs
                    .iter()
                    .flat_map(|a| a.values().iter().map(String::as_str))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The first value of the option-less variant.
    pub fn first_value(&self, name: &str) -> Option<&str> {
        self.get_attribute_with_options(name, &BTreeSet::new())
            .and_then(Attribute::first_value)
    }

    pub fn has_value_normalised(&self, name: &str, value: &str) -> bool {
        if is_objectclass(name) {
            return self.has_object_class(value);
        }
        self.get_attribute(name)
            .map(|attrs| attrs.iter().any(|a| a.contains_normalised(value)))
            .unwrap_or(false)
    }

    /// The components of the relative name that are not present as attribute
    /// values.
    pub fn missing_rdn_values(&self) -> Vec<Ava> {
        self.dn
            .rdn()
            .map(|rdn| {
                rdn.avas()
                    .iter()
                    .filter(|ava| !self.has_value_normalised(ava.attr(), ava.value()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /* ===== mutating attributes ===== */

    fn map_for(&mut self, key: &str, operational: bool) -> &mut AttributeMap {
        if self.operational_attributes.contains_key(key) {
            &mut self.operational_attributes
        } else if self.user_attributes.contains_key(key) || !operational {
            &mut self.user_attributes
        } else {
            &mut self.operational_attributes
        }
    }

    /// Refuse a change to `key` that would remove a value of the relative name
    /// that is currently present.
    fn check_rdn(&self, key: &str, after: &[Attribute]) -> Result<(), DirectoryError> {
        let Some(rdn) = self.dn.rdn() else {
            return Ok(());
        };
        for ava in rdn.avas() {
            if ava.attr().to_lowercase() != key {
                continue;
            }
            let before = self.has_value_normalised(key, ava.value());
            let remains = after.iter().any(|a| a.contains_normalised(ava.value()));
            if before && !remains {
                return Err(DirectoryError::new(
                    ResultCode::NotAllowedOnRdn,
                    format!(
                        "value {:?} of {} is part of the relative name of {}",
                        ava.value(),
                        ava.attr(),
                        self.dn
                    ),
                ));
            }
        }
        Ok(())
    }

    fn current_variants(&self, key: &str) -> Vec<Attribute> {
        self.user_attributes
            .get(key)
            .or_else(|| self.operational_attributes.get(key))
            .cloned()
            .unwrap_or_default()
    }

    /// Store the variants of `key` after a change, dropping empty ones.
    fn store_variants(&mut self, key: &str, operational: bool, mut variants: Vec<Attribute>) {
        variants.retain(|a| !a.is_empty());
        let map = self.map_for(key, operational);
        if variants.is_empty() {
            map.remove(key);
        } else {
            map.insert(key.to_string(), variants);
        }
    }

    /// Add values to the option-less variant of `name`. Returns the values that
    /// were already present.
    pub fn add_values<V: Into<String>>(
        &mut self,
        name: &str,
        operational: bool,
        values: impl IntoIterator<Item = V>,
    ) -> Vec<String> {
        let mut attr = Attribute::new(name, std::iter::empty::<String>());
        let mut duplicates = Vec::new();
        for v in values {
            let v = v.into();
            if !attr.add_value(v.clone()) {
                duplicates.push(v);
            }
        }
        duplicates.extend(self.add_attribute(attr, operational));
        duplicates
    }

    /// Merge an attribute into the variant with the same option set. New
    /// attribute types go to the operational map when `operational` is set.
    /// Returns the values that were already present.
    pub fn add_attribute(&mut self, attr: Attribute, operational: bool) -> Vec<String> {
        if is_objectclass(attr.name()) {
            return attr
                .values()
                .iter()
                .filter(|oc| !self.add_object_class(oc))
                .cloned()
                .collect();
        }
        let key = attr.key();
        let mut variants = self.current_variants(&key);
        let mut duplicates = Vec::new();
        match variants.iter_mut().find(|a| a.same_description(&attr)) {
            Some(existing) => {
                for v in attr.values {
                    if !existing.add_value(v.clone()) {
                        duplicates.push(v);
                    }
                }
            }
            None => variants.push(attr),
        }
        self.store_variants(&key, operational, variants);
        duplicates
    }

    /// Remove the listed values from the variant with the same option set, or
    /// the whole variant when `attr` has no values. Returns the values that
    /// were not present.
    pub fn remove_attribute_values(&mut self, attr: &Attribute) -> Result<Vec<String>, DirectoryError> {
        self.remove_attribute_values_inner(attr, true)
    }

    /// As [`Entry::remove_attribute_values`] but without relative name
    /// protection, for the rename pipeline which removes the old RDN values from
    /// an entry that already carries its new name.
    pub(crate) fn remove_attribute_values_unprotected(
        &mut self,
        attr: &Attribute,
    ) -> Vec<String> {
        self.remove_attribute_values_inner(attr, false)
            .unwrap_or_default()
    }

    fn remove_attribute_values_inner(
        &mut self,
        attr: &Attribute,
        protect: bool,
    ) -> Result<Vec<String>, DirectoryError> {
        if is_objectclass(attr.name()) {
            if attr.is_empty() {
                self.object_classes.clear();
                return Ok(Vec::new());
            }
            return Ok(attr
                .values()
                .iter()
                .filter(|oc| self.object_classes.remove(&oc.to_lowercase()).is_none())
                .cloned()
                .collect());
        }

        let key = attr.key();
        let mut variants = self.current_variants(&key);
        let mut missing = Vec::new();
        match variants.iter_mut().find(|a| a.same_description(attr)) {
            Some(existing) if attr.is_empty() => existing.values.clear(),
            Some(existing) => {
                for v in attr.values() {
                    if !existing.remove_value(v) {
                        missing.push(v.clone());
                    }
                }
            }
            None => missing.extend(attr.values().iter().cloned()),
        }
        if protect {
            self.check_rdn(&key, &variants)?;
        }
        let operational = self.is_operational(&key);
        self.store_variants(&key, operational, variants);
        Ok(missing)
    }

    /// Replace the variant with the same option set. An attribute without
    /// values removes the variant.
    pub fn replace_attribute(&mut self, attr: Attribute, operational: bool) -> Result<(), DirectoryError> {
        if is_objectclass(attr.name()) {
            self.object_classes.clear();
            for oc in attr.values() {
                self.add_object_class(oc);
            }
            return Ok(());
        }
        let key = attr.key();
        let mut variants = self.current_variants(&key);
        variants.retain(|a| !a.same_description(&attr));
        variants.push(attr);
        self.check_rdn(&key, &variants)?;
        self.store_variants(&key, operational, variants);
        Ok(())
    }

    /// Remove every variant of an attribute type. Returns false if it was absent.
    pub fn remove_attribute(&mut self, name: &str) -> Result<bool, DirectoryError> {
        let key = name.to_lowercase();
        self.check_rdn(&key, &[])?;
        Ok(self.user_attributes.remove(&key).is_some()
            | self.operational_attributes.remove(&key).is_some())
    }

    /// Apply one modification. `operational` decides where an attribute type
    /// that is not yet on the entry is placed.
    pub fn apply_modification(
        &mut self,
        m: &Modification,
        operational: bool,
    ) -> Result<(), DirectoryError> {
        match m.mod_type {
            ModificationType::Add => {
                self.add_attribute(m.attribute.clone(), operational);
                Ok(())
            }
            ModificationType::Delete => self.remove_attribute_values(&m.attribute).map(|_| ()),
            ModificationType::Replace => self.replace_attribute(m.attribute.clone(), operational),
            ModificationType::Increment => self.apply_increment(&m.attribute, operational),
        }
    }

    fn apply_increment(&mut self, attr: &Attribute, operational: bool) -> Result<(), DirectoryError> {
        let name = attr.description();
        let current = self
            .get_attribute_with_options(attr.name(), attr.options())
            .filter(|a| !a.is_empty())
            .ok_or_else(|| {
                DirectoryError::new(
                    ResultCode::NoSuchAttribute,
                    format!("cannot increment {name} of {}, it has no value", self.dn),
                )
            })?;
        if current.len() > 1 {
            return Err(DirectoryError::constraint_violation(format!(
                "cannot increment {name} of {}, it has several values",
                self.dn
            )));
        }
        let current: i64 = current
            .first_value()
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| {
                DirectoryError::constraint_violation(format!(
                    "cannot increment {name} of {}, its value is not an integer",
                    self.dn
                ))
            })?;
        let by: i64 = match attr.values() {
            [v] => v.trim().parse().map_err(|_| {
                DirectoryError::constraint_violation(format!(
                    "increment amount {v:?} for {name} is not an integer"
                ))
            })?,
            _ => {
                return Err(DirectoryError::constraint_violation(format!(
                    "an increment of {name} needs exactly one amount"
                )))
            }
        };
        let next = current.checked_add(by).ok_or_else(|| {
            DirectoryError::constraint_violation(format!("increment of {name} overflows"))
        })?;
        let replacement = Attribute::new(attr.name(), [next.to_string()]).with_options(attr.options());
        self.replace_attribute(replacement, operational)
    }

    /// The entry as returned through a read entry control. No attributes or `*`
    /// select the user attributes, `+` selects the operational attributes, any
    /// other name selects that attribute type.
    pub fn project(&self, attrs: &[String]) -> Entry {
        let mut out = Entry::new(self.dn.clone());
        let all_user = attrs.is_empty() || attrs.iter().any(|a| a == "*");
        let all_operational = attrs.iter().any(|a| a == "+");

        if all_user || attrs.iter().any(|a| is_objectclass(a)) {
            out.object_classes = self.object_classes.clone();
        }
        if all_user {
            out.user_attributes = self.user_attributes.clone();
        }
        if all_operational {
            out.operational_attributes = self.operational_attributes.clone();
        }
        for name in attrs {
            let (attr_type, _) = Attribute::parse_description(name);
            let key = attr_type.to_lowercase();
            if let Some(v) = self.user_attributes.get(&key) {
                out.user_attributes.insert(key.clone(), v.clone());
            }
            if let Some(v) = self.operational_attributes.get(&key) {
                out.operational_attributes.insert(key, v.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use crate::modify::{m_add, m_delete, m_increment, m_replace};
    use crate::prelude::*;

    #[test]
    fn test_entry_attribute_variants() {
        sketching::test_init();
        let mut e = entry_init!(
            "cn=Bob,dc=example",
            (ATTR_OBJECTCLASS, "person"),
            ("cn", "Bob"),
            ("sn", "Smith")
        );
        e.add_attribute(
            Attribute::from_description("description;lang-FR", ["Bonjour"]),
            false,
        );
        e.add_values("description", false, ["Hello"]);

        assert!(e.has_object_class("Person"));
        assert_eq!(e.get_values("objectclass"), vec!["person"]);
        assert_eq!(e.get_attribute("Description").map(|a| a.len()), Some(2));
        assert_eq!(e.first_value("description"), Some("Hello"));
        assert_eq!(e.get_values("description").len(), 2);
        assert!(e.missing_rdn_values().is_empty());

        let dups = e.add_values("sn", false, ["Smith", "Jones"]);
        assert_eq!(dups, vec!["Smith".to_string()]);
        assert_eq!(e.get_values("sn"), vec!["Smith", "Jones"]);
    }

    #[test]
    fn test_entry_rdn_protection() {
        sketching::test_init();
        let mut e = entry_init!("cn=Bob,dc=example", ("cn", "bob"), ("cn", "Robert"));

        let err = e.remove_attribute_values(&Attribute::new("cn", ["bob"]));
        assert_eq!(err.map_err(|e| e.code), Err(ResultCode::NotAllowedOnRdn));

        let err = e.remove_attribute("CN");
        assert_eq!(err.map_err(|e| e.code), Err(ResultCode::NotAllowedOnRdn));

        let err = e.replace_attribute(Attribute::new("cn", ["Robert"]), false);
        assert_eq!(err.map_err(|e| e.code), Err(ResultCode::NotAllowedOnRdn));

        // Removing a value that is not part of the name is fine.
        assert!(e
            .remove_attribute_values(&Attribute::new("cn", ["Robert"]))
            .is_ok());
        assert_eq!(e.get_values("cn"), vec!["bob"]);

        // An entry that never had its RDN value may be changed freely.
        let mut bare = entry_init!("uid=bob,dc=example", ("cn", "Bob"));
        assert!(bare.remove_attribute("uid").is_ok());
    }

    #[test]
    fn test_entry_placement() {
        sketching::test_init();
        let mut e = entry_init!("cn=Bob,dc=example", ("cn", "Bob"));
        e.add_values(ATTR_PWD_CHANGED_TIME, true, ["20240101000000.000Z"]);
        assert!(e.is_operational(ATTR_PWD_CHANGED_TIME));
        assert!(!e.is_operational("cn"));

        // Existing types stay in their map regardless of the flag.
        e.add_values("cn", true, ["Robert"]);
        assert!(!e.is_operational("cn"));

        assert!(e.remove_attribute(ATTR_PWD_CHANGED_TIME).unwrap_or(false));
        assert!(e.operational_attributes().is_empty());
    }

    #[test]
    fn test_entry_apply_modifications() {
        sketching::test_init();
        let mut e = entry_init!(
            "cn=Bob,dc=example",
            ("cn", "Bob"),
            ("uidNumber", "1000"),
            ("mail", "a@example.com"),
            ("mail", "b@example.com")
        );

        assert!(e.apply_modification(&m_increment("uidNumber", 5), false).is_ok());
        assert_eq!(e.first_value("uidNumber"), Some("1005"));

        assert_eq!(
            e.apply_modification(&m_increment("gidNumber", 1), false)
                .map_err(|e| e.code),
            Err(ResultCode::NoSuchAttribute)
        );
        assert_eq!(
            e.apply_modification(&m_increment("mail", 1), false)
                .map_err(|e| e.code),
            Err(ResultCode::ConstraintViolation)
        );
        assert_eq!(
            e.apply_modification(&m_add("uidNumber", ["x"]), false)
                .and_then(|_| e.apply_modification(&m_increment("uidNumber", 1), false))
                .map_err(|e| e.code),
            Err(ResultCode::ConstraintViolation)
        );

        assert!(e
            .apply_modification(&m_replace("mail", ["c@example.com"]), false)
            .is_ok());
        assert_eq!(e.get_values("mail"), vec!["c@example.com"]);

        assert!(e
            .apply_modification(&m_delete::<String>("mail", []), false)
            .is_ok());
        assert!(!e.has_attribute("mail"));

        assert!(e
            .apply_modification(&m_add(ATTR_OBJECTCLASS, ["person"]), false)
            .is_ok());
        assert!(e.has_object_class("person"));
    }

    #[test]
    fn test_entry_projection() {
        sketching::test_init();
        let mut e = entry_init!(
            "cn=Bob,dc=example",
            (ATTR_OBJECTCLASS, "person"),
            ("cn", "Bob"),
            ("sn", "Smith")
        );
        e.add_values(ATTR_PWD_CHANGED_TIME, true, ["20240101000000.000Z"]);

        let p = e.project(&[]);
        assert!(p.has_attribute("sn"));
        assert!(p.has_object_class("person"));
        assert!(!p.has_attribute(ATTR_PWD_CHANGED_TIME));

        let p = e.project(&["+".to_string()]);
        assert!(p.has_attribute(ATTR_PWD_CHANGED_TIME));
        assert!(!p.has_attribute("sn"));

        let p = e.project(&["SN".to_string()]);
        assert!(p.has_attribute("sn"));
        assert!(!p.has_attribute("cn"));
        assert!(!p.has_object_class("person"));
    }
}
