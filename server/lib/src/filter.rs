//! Search filters, as carried by the assertion control. A filter is parsed from
//! its string form (`(&(objectClass=person)(cn=Bob*))`) and evaluated directly
//! against a single entry; there is no index or query planning here.
//!
//! Value comparison follows the directory string rule used for names: case and
//! runs of whitespace are ignored. Ordering comparisons are numeric when both
//! sides are integers.

use std::cmp::Ordering;
use std::fmt;

use crate::dn::normalise_value;
use crate::prelude::*;

pub fn f_eq(a: &str, v: &str) -> Filter {
    Filter::Eq(a.to_string(), v.to_string())
}

pub fn f_sub(a: &str, v: &str) -> Filter {
    Filter::Sub(a.to_string(), v.to_string())
}

pub fn f_pres(a: &str) -> Filter {
    Filter::Pres(a.to_string())
}

pub fn f_and(vs: Vec<Filter>) -> Filter {
    Filter::And(vs)
}

pub fn f_or(vs: Vec<Filter>) -> Filter {
    Filter::Or(vs)
}

pub fn f_not(f: Filter) -> Filter {
    Filter::Not(Box::new(f))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Eq(String, String),
    /// A pattern where `*` matches any run of characters.
    Sub(String, String),
    Pres(String),
    Ge(String, String),
    Le(String, String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

fn invalid(s: &str, reason: &str) -> DirectoryError {
    DirectoryError::new(
        ResultCode::ProtocolError,
        format!("unable to parse filter {s:?}: {reason}"),
    )
}

fn compare(a: &str, b: &str) -> Ordering {
    match (a.trim().parse::<i64>(), b.trim().parse::<i64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => normalise_value(a).cmp(&normalise_value(b)),
    }
}

fn wildcard_match(pattern: &str, value: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    let mut rest = value;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    // A pattern without a trailing '*' must consume the whole value.
    pattern.ends_with('*') || rest.is_empty()
}

impl Filter {
    pub fn parse(s: &str) -> Result<Filter, DirectoryError> {
        let chars: Vec<char> = s.trim().chars().collect();
        let mut pos = 0;
        let f = Self::parse_inner(s, &chars, &mut pos)?;
        if pos != chars.len() {
            return Err(invalid(s, "trailing characters"));
        }
        Ok(f)
    }

    fn parse_inner(s: &str, chars: &[char], pos: &mut usize) -> Result<Filter, DirectoryError> {
        if chars.get(*pos) != Some(&'(') {
            return Err(invalid(s, "expected '('"));
        }
        *pos += 1;
        let f = match chars.get(*pos) {
            Some('&') | Some('|') => {
                let is_and = chars[*pos] == '&';
                *pos += 1;
                let mut inner = Vec::new();
                while chars.get(*pos) == Some(&'(') {
                    inner.push(Self::parse_inner(s, chars, pos)?);
                }
                if is_and {
                    Filter::And(inner)
                } else {
                    Filter::Or(inner)
                }
            }
            Some('!') => {
                *pos += 1;
                Filter::Not(Box::new(Self::parse_inner(s, chars, pos)?))
            }
            Some(_) => Self::parse_item(s, chars, pos)?,
            None => return Err(invalid(s, "unexpected end")),
        };
        if chars.get(*pos) != Some(&')') {
            return Err(invalid(s, "expected ')'"));
        }
        *pos += 1;
        Ok(f)
    }

    fn parse_item(s: &str, chars: &[char], pos: &mut usize) -> Result<Filter, DirectoryError> {
        let start = *pos;
        while *pos < chars.len() && !matches!(chars[*pos], '=' | '>' | '<' | '~' | ')' | '(') {
            *pos += 1;
        }
        let attr: String = chars[start..*pos].iter().collect::<String>().trim().to_string();
        if attr.is_empty() {
            return Err(invalid(s, "missing attribute type"));
        }
        let op = match (chars.get(*pos), chars.get(*pos + 1)) {
            (Some('='), _) => {
                *pos += 1;
                '='
            }
            (Some(c @ ('>' | '<' | '~')), Some('=')) => {
                *pos += 2;
                *c
            }
            _ => return Err(invalid(s, "missing comparison operator")),
        };

        let mut value = String::new();
        let mut has_wildcard = false;
        while let Some(&c) = chars.get(*pos) {
            match c {
                ')' => break,
                '(' => return Err(invalid(s, "unescaped '(' in value")),
                '\\' => {
                    let hex: String = chars
                        .get(*pos + 1..*pos + 3)
                        .ok_or_else(|| invalid(s, "short escape"))?
                        .iter()
                        .collect();
                    let b = u8::from_str_radix(&hex, 16).map_err(|_| invalid(s, "bad escape"))?;
                    value.push(char::from(b));
                    *pos += 3;
                }
                '*' => {
                    has_wildcard = true;
                    value.push('*');
                    *pos += 1;
                }
                c => {
                    value.push(c);
                    *pos += 1;
                }
            }
        }

        Ok(match op {
            '=' if value == "*" => Filter::Pres(attr),
            '=' if has_wildcard => Filter::Sub(attr, value),
            '=' | '~' => Filter::Eq(attr, value),
            '>' => Filter::Ge(attr, value),
            _ => Filter::Le(attr, value),
        })
    }

    /// Evaluate the filter against an entry.
    pub fn matches(&self, e: &Entry) -> bool {
        let r = match self {
            Filter::Eq(a, v) => e.has_value_normalised(a, v),
            Filter::Sub(a, p) => {
                let p = normalise_value(p);
                e.get_values(a)
                    .iter()
                    .any(|v| wildcard_match(&p, &normalise_value(v)))
            }
            Filter::Pres(a) => e.has_attribute(a),
            Filter::Ge(a, v) => e.get_values(a).iter().any(|x| compare(x, v) != Ordering::Less),
            Filter::Le(a, v) => e
                .get_values(a)
                .iter()
                .any(|x| compare(x, v) != Ordering::Greater),
            Filter::And(fs) => fs.iter().all(|f| f.matches(e)),
            Filter::Or(fs) => fs.iter().any(|f| f.matches(e)),
            Filter::Not(f) => !f.matches(e),
        };
        filter_trace!(filter = %self, dn = %e.dn(), result = r, "filter evaluated");
        r
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Eq(a, v) => write!(f, "({a}={v})"),
            Filter::Sub(a, v) => write!(f, "({a}={v})"),
            Filter::Pres(a) => write!(f, "({a}=*)"),
            Filter::Ge(a, v) => write!(f, "({a}>={v})"),
            Filter::Le(a, v) => write!(f, "({a}<={v})"),
            Filter::And(fs) | Filter::Or(fs) => {
                f.write_str(if matches!(self, Filter::And(_)) { "(&" } else { "(|" })?;
                for x in fs {
                    write!(f, "{x}")?;
                }
                f.write_str(")")
            }
            Filter::Not(x) => write!(f, "(!{x})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_parse() {
        sketching::test_init();
        assert_eq!(
            Filter::parse("(&(cn=bob)(sn=*)(!(uid=a*z)))").ok(),
            Some(f_and(vec![
                f_eq("cn", "bob"),
                f_pres("sn"),
                f_not(f_sub("uid", "a*z"))
            ]))
        );
        assert_eq!(
            Filter::parse(r"(cn=a\2ab)").ok(),
            Some(f_eq("cn", "a*b"))
        );
        assert_eq!(
            Filter::parse("(uidNumber>=10)").ok(),
            Some(Filter::Ge("uidNumber".to_string(), "10".to_string()))
        );
        assert!(Filter::parse("cn=bob").is_err());
        assert!(Filter::parse("(cn=bob").is_err());
        assert!(Filter::parse("(=bob)").is_err());
        assert_eq!(
            Filter::parse("(cn=bob))").map_err(|e| e.code),
            Err(ResultCode::ProtocolError)
        );
    }

    #[test]
    fn test_filter_matches() {
        sketching::test_init();
        let e = entry_init!(
            "cn=Bob Smith,dc=example",
            (ATTR_OBJECTCLASS, "person"),
            ("cn", "Bob Smith"),
            ("sn", "Smith"),
            ("uidNumber", "1000")
        );

        let t = |s: &str| Filter::parse(s).map(|f| f.matches(&e)).unwrap_or(false);
        assert!(t("(cn=bob  smith)"));
        assert!(t("(objectClass=PERSON)"));
        assert!(t("(cn=bob*)"));
        assert!(t("(cn=*smith)"));
        assert!(t("(cn=b*s*h)"));
        assert!(!t("(cn=*jones*)"));
        assert!(t("(uidNumber>=999)"));
        assert!(!t("(uidNumber<=999)"));
        assert!(t("(|(sn=Jones)(sn=smith))"));
        assert!(!t("(&(sn=smith)(mail=*))"));
        assert!(t("(!(mail=*))"));
    }
}
