//! Distinguished names. A `Dn` is an ordered list of relative names, leaf first,
//! so `cn=Bob,ou=People,dc=example` holds `cn=Bob` at index zero. The empty `Dn`
//! is the root of the tree.
//!
//! Comparison, hashing and ordering use a normalised form that ignores the case
//! of attribute names and values and collapses runs of whitespace in values.
//! This is what makes `CN=bob , ou=People` and `cn=Bob,ou=people` the same lock
//! key and the same backend key.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::prelude::*;

/// Collapse whitespace and fold case, the equality rule for values inside names.
pub(crate) fn normalise_value(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// One `attr=value` assertion within a relative name.
#[derive(Debug, Clone)]
pub struct Ava {
    attr: String,
    value: String,
}

impl Ava {
    pub fn new(attr: impl Into<String>, value: impl Into<String>) -> Self {
        Ava {
            attr: attr.into(),
            value: value.into(),
        }
    }

    pub fn attr(&self) -> &str {
        &self.attr
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    fn normalised(&self) -> String {
        format!(
            "{}={}",
            self.attr.to_lowercase(),
            escape_value(&normalise_value(&self.value))
        )
    }
}

impl fmt::Display for Ava {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.attr, escape_value(&self.value))
    }
}

#[derive(Debug, Clone)]
pub struct Rdn {
    avas: Vec<Ava>,
    norm: String,
}

impl Rdn {
    pub fn new(avas: Vec<Ava>) -> Result<Self, DirectoryError> {
        if avas.is_empty() {
            return Err(DirectoryError::new(
                ResultCode::InvalidDnSyntax,
                "a relative name needs at least one attribute value assertion",
            ));
        }
        let mut parts: Vec<String> = avas.iter().map(Ava::normalised).collect();
        parts.sort();
        Ok(Rdn {
            avas,
            norm: parts.join("+"),
        })
    }

    pub fn single(attr: impl Into<String>, value: impl Into<String>) -> Self {
        let ava = Ava::new(attr, value);
        let norm = ava.normalised();
        Rdn {
            avas: vec![ava],
            norm,
        }
    }

    pub fn parse(s: &str) -> Result<Self, DirectoryError> {
        let mut rdns = parse_components(s).map_err(|reason| {
            DirectoryError::new(
                ResultCode::InvalidDnSyntax,
                format!("unable to parse relative name {s:?}: {reason}"),
            )
        })?;
        if rdns.len() != 1 {
            return Err(DirectoryError::new(
                ResultCode::InvalidDnSyntax,
                format!("{s:?} is not a single relative name"),
            ));
        }
        rdns.pop()
            .ok_or_else(|| DirectoryError::new(ResultCode::InvalidDnSyntax, "empty relative name"))
    }

    pub fn avas(&self) -> &[Ava] {
        &self.avas
    }
}

impl PartialEq for Rdn {
    fn eq(&self, other: &Self) -> bool {
        self.norm == other.norm
    }
}

impl Eq for Rdn {}

impl Hash for Rdn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.norm.hash(state)
    }
}

impl fmt::Display for Rdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, ava) in self.avas.iter().enumerate() {
            if i > 0 {
                f.write_str("+")?;
            }
            write!(f, "{ava}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Dn {
    rdns: Vec<Rdn>,
    norm: String,
}

impl Dn {
    pub fn root() -> Self {
        Dn {
            rdns: Vec::new(),
            norm: String::new(),
        }
    }

    fn from_rdns(rdns: Vec<Rdn>) -> Self {
        let norm = rdns
            .iter()
            .map(|r| r.norm.as_str())
            .collect::<Vec<_>>()
            .join(",");
        Dn { rdns, norm }
    }

    pub fn parse(s: &str) -> Result<Self, DirectoryError> {
        parse_components(s).map(Dn::from_rdns).map_err(|reason| {
            DirectoryError::new(
                ResultCode::InvalidDnSyntax,
                format!("unable to parse distinguished name {s:?}: {reason}"),
            )
        })
    }

    pub fn is_root(&self) -> bool {
        self.rdns.is_empty()
    }

    /// The leaf relative name, absent only for the root.
    pub fn rdn(&self) -> Option<&Rdn> {
        self.rdns.first()
    }

    pub fn parent(&self) -> Option<Dn> {
        if self.rdns.is_empty() {
            None
        } else {
            Some(Dn::from_rdns(self.rdns[1..].to_vec()))
        }
    }

    pub fn child(&self, rdn: Rdn) -> Dn {
        let mut rdns = Vec::with_capacity(self.rdns.len() + 1);
        rdns.push(rdn);
        rdns.extend(self.rdns.iter().cloned());
        Dn::from_rdns(rdns)
    }

    pub fn num_components(&self) -> usize {
        self.rdns.len()
    }

    /// True if this name is `base` or sits anywhere below it.
    pub fn is_within(&self, base: &Dn) -> bool {
        if base.rdns.len() > self.rdns.len() {
            return false;
        }
        let skip = self.rdns.len() - base.rdns.len();
        self.rdns[skip..]
            .iter()
            .zip(base.rdns.iter())
            .all(|(a, b)| a == b)
    }

    /// Move a name from below `old_base` to the same position below `new_base`.
    pub fn rebase(&self, old_base: &Dn, new_base: &Dn) -> Option<Dn> {
        if !self.is_within(old_base) {
            return None;
        }
        let keep = self.rdns.len() - old_base.rdns.len();
        let mut rdns = self.rdns[..keep].to_vec();
        rdns.extend(new_base.rdns.iter().cloned());
        Some(Dn::from_rdns(rdns))
    }

    pub fn normalised(&self) -> &str {
        &self.norm
    }
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.norm == other.norm
    }
}

impl Eq for Dn {}

impl Hash for Dn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.norm.hash(state)
    }
}

impl PartialOrd for Dn {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Dn {
    fn cmp(&self, other: &Self) -> Ordering {
        self.norm.cmp(&other.norm)
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rdn) in self.rdns.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{rdn}")?;
        }
        Ok(())
    }
}

impl FromStr for Dn {
    type Err = DirectoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Dn::parse(s)
    }
}

fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let last = value.chars().count().saturating_sub(1);
    for (i, c) in value.chars().enumerate() {
        let leading = i == 0 && (c == ' ' || c == '#');
        let trailing = i == last && c == ' ';
        if leading || trailing || matches!(c, ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn valid_attr_name(attr: &str) -> bool {
    !attr.is_empty()
        && attr
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
}

fn parse_components(s: &str) -> Result<Vec<Rdn>, String> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(Vec::new());
    }
    let bytes = s.as_bytes();
    let mut rdns = Vec::new();
    let mut avas = Vec::new();
    let mut i = 0;

    loop {
        let start = i;
        while i < bytes.len() && bytes[i] != b'=' {
            if matches!(bytes[i], b',' | b'+' | b';') {
                return Err(format!("missing '=' before position {i}"));
            }
            i += 1;
        }
        if i >= bytes.len() {
            return Err("missing '=' in attribute value assertion".to_string());
        }
        let attr = s[start..i].trim();
        if !valid_attr_name(attr) {
            return Err(format!("invalid attribute type {attr:?}"));
        }
        i += 1;

        while i < bytes.len() && bytes[i] == b' ' {
            i += 1;
        }

        let mut value: Vec<u8> = Vec::new();
        // Escaped characters are never trimmed, even if they are spaces.
        let mut keep = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'\\' => {
                    let c = *bytes.get(i + 1).ok_or("dangling escape")?;
                    let next = bytes.get(i + 2).copied();
                    match next {
                        Some(n) if c.is_ascii_hexdigit() && n.is_ascii_hexdigit() => {
                            let pair = std::str::from_utf8(&bytes[i + 1..i + 3])
                                .map_err(|_| "invalid hex escape".to_string())?;
                            let b = u8::from_str_radix(pair, 16)
                                .map_err(|_| "invalid hex escape".to_string())?;
                            value.push(b);
                            i += 3;
                        }
                        _ => {
                            value.push(c);
                            i += 2;
                        }
                    }
                    keep = value.len();
                }
                b',' | b'+' | b';' => break,
                c => {
                    value.push(c);
                    i += 1;
                }
            }
        }
        while value.len() > keep && value.last() == Some(&b' ') {
            value.pop();
        }
        let value = String::from_utf8(value).map_err(|_| "value is not valid utf-8".to_string())?;
        avas.push(Ava::new(attr, value));

        match bytes.get(i) {
            None => {
                rdns.push(Rdn::new(std::mem::take(&mut avas)).map_err(|e| e.message)?);
                break;
            }
            Some(b'+') => {
                i += 1;
            }
            Some(_) => {
                rdns.push(Rdn::new(std::mem::take(&mut avas)).map_err(|e| e.message)?);
                i += 1;
            }
        }
    }

    Ok(rdns)
}

#[cfg(test)]
mod tests {
    use crate::prelude::*;

    #[test]
    fn test_dn_parse_and_parent() {
        let dn = Dn::parse("cn=Bob,ou=People,dc=example").expect("invalid dn");
        assert_eq!(dn.num_components(), 3);
        assert_eq!(dn.rdn().map(|r| r.to_string()), Some("cn=Bob".to_string()));

        let parent = dn.parent().expect("no parent");
        assert_eq!(parent, Dn::parse("ou=people, DC=Example").expect("invalid dn"));
        let grandparent = parent.parent().expect("no parent");
        let root = grandparent.parent().expect("no parent");
        assert!(root.is_root());
        assert!(root.parent().is_none());
    }

    #[test]
    fn test_dn_equality_ignores_case_and_space() {
        let a = Dn::parse("CN=Bob  Smith , ou=People,dc=example").expect("invalid dn");
        let b = Dn::parse("cn=bob smith,ou=people,dc=EXAMPLE").expect("invalid dn");
        assert_eq!(a, b);
        assert_eq!(a.normalised(), "cn=bob smith,ou=people,dc=example");
    }

    #[test]
    fn test_dn_escapes() {
        let dn = Dn::parse(r"cn=Smith\, Bob,dc=example").expect("invalid dn");
        let rdn = dn.rdn().expect("no rdn");
        assert_eq!(rdn.avas()[0].value(), "Smith, Bob");
        assert_eq!(dn.to_string(), r"cn=Smith\, Bob,dc=example");

        let hex = Dn::parse(r"cn=Smith\2C Bob,dc=example").expect("invalid dn");
        assert_eq!(hex, dn);
    }

    #[test]
    fn test_dn_multi_valued_rdn() {
        let a = Dn::parse("cn=Bob+uid=bob,dc=example").expect("invalid dn");
        let b = Dn::parse("uid=bob+cn=Bob,dc=example").expect("invalid dn");
        assert_eq!(a, b);
        assert_eq!(a.rdn().map(|r| r.avas().len()), Some(2));
    }

    #[test]
    fn test_dn_invalid() {
        assert!(Dn::parse("cn").is_err());
        assert!(Dn::parse("=bob,dc=example").is_err());
        assert!(Dn::parse(r"cn=bob\").is_err());
        assert_eq!(
            Dn::parse("nonsense,dc=example").map_err(|e| e.code),
            Err(ResultCode::InvalidDnSyntax)
        );
    }

    #[test]
    fn test_dn_within_and_child() {
        let base = Dn::parse("dc=example").expect("invalid dn");
        let people = base.child(Rdn::single("ou", "People"));
        assert_eq!(people.to_string(), "ou=People,dc=example");
        assert!(people.is_within(&base));
        assert!(base.is_within(&base));
        assert!(!base.is_within(&people));
        assert!(people.is_within(&Dn::root()));

        let bob = people.child(Rdn::single("cn", "Bob"));
        let staff = base.child(Rdn::single("ou", "Staff"));
        assert_eq!(
            bob.rebase(&people, &staff).map(|d| d.to_string()),
            Some("cn=Bob,ou=Staff,dc=example".to_string())
        );
        assert!(staff.rebase(&people, &base).is_none());
    }
}
