use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::result::ResultCode;

/* ===== errors ===== */

/// A failure that terminates an operation. Collaborators (backends,
/// synchronization providers, storage schemes) return this and the operation
/// adopts its code, message and matched DN as its own response.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct DirectoryError {
    pub code: ResultCode,
    pub message: String,
    pub matched_dn: Option<String>,
}

impl DirectoryError {
    pub fn new(code: ResultCode, message: impl Into<String>) -> Self {
        DirectoryError {
            code,
            message: message.into(),
            matched_dn: None,
        }
    }

    pub fn with_matched_dn(mut self, matched_dn: Option<String>) -> Self {
        self.matched_dn = matched_dn;
        self
    }

    pub fn constraint_violation(message: impl Into<String>) -> Self {
        Self::new(ResultCode::ConstraintViolation, message)
    }

    pub fn unwilling_to_perform(message: impl Into<String>) -> Self {
        Self::new(ResultCode::UnwillingToPerform, message)
    }

    pub fn no_such_object(message: impl Into<String>) -> Self {
        Self::new(ResultCode::NoSuchObject, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ResultCode::Other, message)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SchemaError {
    NoClassFound,
    NoStructuralClass,
    InvalidClass(Vec<String>),
    MissingMustAttribute(Vec<String>),
    InvalidAttribute(String),
    InvalidAttributeSyntax(String),
    AttributeNotValidForClass(String),
    SingleValueViolation(String),
    Obsolete(String),
}

impl Display for SchemaError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaError::NoClassFound => write!(f, "entry has no object classes"),
            SchemaError::NoStructuralClass => write!(f, "entry has no structural object class"),
            SchemaError::InvalidClass(c) => write!(f, "undefined object classes {}", c.join(", ")),
            SchemaError::MissingMustAttribute(a) => {
                write!(f, "missing required attributes {}", a.join(", "))
            }
            SchemaError::InvalidAttribute(a) => write!(f, "undefined attribute type {a}"),
            SchemaError::InvalidAttributeSyntax(a) => {
                write!(f, "value of {a} violates the attribute syntax")
            }
            SchemaError::AttributeNotValidForClass(a) => {
                write!(f, "attribute {a} is not allowed by any object class of the entry")
            }
            SchemaError::SingleValueViolation(a) => {
                write!(f, "attribute {a} is single valued but has several values")
            }
            SchemaError::Obsolete(n) => write!(f, "{n} is marked obsolete"),
        }
    }
}

impl From<SchemaError> for DirectoryError {
    fn from(e: SchemaError) -> Self {
        let code = match &e {
            SchemaError::InvalidAttributeSyntax(_) => ResultCode::InvalidAttributeSyntax,
            SchemaError::Obsolete(_) => ResultCode::ConstraintViolation,
            _ => ResultCode::ObjectclassViolation,
        };
        DirectoryError::new(code, e.to_string())
    }
}

/// Raised while turning configuration into a running policy or context. Any of
/// these prevents the server from starting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("password attribute {0} is not defined in the schema")]
    UndefinedPasswordAttribute(String),
    #[error("password attribute {0} uses neither the user password nor the auth password syntax")]
    InvalidPasswordSyntax(String),
    #[error("no default password storage scheme is configured")]
    NoDefaultStorageScheme,
    #[error("password storage scheme {0} is not registered")]
    UnknownStorageScheme(String),
    #[error("password storage scheme {scheme} does not support the {syntax} syntax")]
    SchemeSyntaxMismatch { scheme: String, syntax: String },
    #[error("password validator {0} is not configured")]
    UnknownValidator(String),
    #[error("account status notification handler {0} is not configured")]
    UnknownNotificationHandler(String),
    #[error("password generator {0} is not configured")]
    UnknownGenerator(String),
    #[error("component kind {0} is not registered")]
    UnknownComponentKind(String),
    #[error("component {id} is misconfigured: {reason}")]
    InvalidComponent { id: String, reason: String },
    #[error("a password expiration warning interval is required unless passwords expire without warning")]
    WarningIntervalRequired,
    #[error("invalid time format {format}: {reason}")]
    InvalidTimeFormat { format: String, reason: String },
    #[error("invalid duration {0}")]
    InvalidDuration(String),
    #[error("invalid generalized time {0}")]
    InvalidGeneralizedTime(String),
    #[error("invalid distinguished name {0}")]
    InvalidDn(String),
    #[error("{0} is defined more than once")]
    Duplicate(String),
    #[error("no default password policy is configured")]
    NoDefaultPolicy,
    #[error("{0} is not a known result code")]
    InvalidResultCode(u32),
    #[error("unable to read configuration: {0}")]
    Io(String),
    #[error("unable to parse configuration: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_error_result_codes() {
        let e: DirectoryError = SchemaError::MissingMustAttribute(vec!["sn".to_string()]).into();
        assert_eq!(e.code, ResultCode::ObjectclassViolation);
        assert!(e.message.contains("sn"));

        let e: DirectoryError = SchemaError::Obsolete("oldClass".to_string()).into();
        assert_eq!(e.code, ResultCode::ConstraintViolation);

        let e: DirectoryError = SchemaError::InvalidAttributeSyntax("uidNumber".to_string()).into();
        assert_eq!(e.code, ResultCode::InvalidAttributeSyntax);
    }
}
