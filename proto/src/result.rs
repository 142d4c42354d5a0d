use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

/// The outcome of an operation as reported to the client. The numeric values are
/// the protocol result codes, so a code can be carried through configuration as a
/// plain integer and converted back with `ResultCode::try_from`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    IntoPrimitive,
    TryFromPrimitive,
)]
#[repr(u32)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    Success = 0,
    OperationsError = 1,
    ProtocolError = 2,
    UnavailableCriticalExtension = 12,
    NoSuchAttribute = 16,
    ConstraintViolation = 19,
    InvalidAttributeSyntax = 21,
    NoSuchObject = 32,
    InvalidDnSyntax = 34,
    InvalidCredentials = 49,
    InsufficientAccessRights = 50,
    Busy = 51,
    Unavailable = 52,
    UnwillingToPerform = 53,
    ObjectclassViolation = 65,
    NotAllowedOnRdn = 67,
    EntryAlreadyExists = 68,
    Other = 80,
    Canceled = 118,
    NoSuchOperation = 119,
    TooLate = 120,
    CannotCancel = 121,
    AssertionFailed = 122,
    AuthorizationDenied = 123,
    NoOperation = 16654,
}

impl ResultCode {
    pub fn name(self) -> &'static str {
        match self {
            ResultCode::Success => "success",
            ResultCode::OperationsError => "operations error",
            ResultCode::ProtocolError => "protocol error",
            ResultCode::UnavailableCriticalExtension => "unavailable critical extension",
            ResultCode::NoSuchAttribute => "no such attribute",
            ResultCode::ConstraintViolation => "constraint violation",
            ResultCode::InvalidAttributeSyntax => "invalid attribute syntax",
            ResultCode::NoSuchObject => "no such object",
            ResultCode::InvalidDnSyntax => "invalid DN syntax",
            ResultCode::InvalidCredentials => "invalid credentials",
            ResultCode::InsufficientAccessRights => "insufficient access rights",
            ResultCode::Busy => "busy",
            ResultCode::Unavailable => "unavailable",
            ResultCode::UnwillingToPerform => "unwilling to perform",
            ResultCode::ObjectclassViolation => "object class violation",
            ResultCode::NotAllowedOnRdn => "not allowed on RDN",
            ResultCode::EntryAlreadyExists => "entry already exists",
            ResultCode::Other => "other",
            ResultCode::Canceled => "canceled",
            ResultCode::NoSuchOperation => "no such operation",
            ResultCode::TooLate => "too late",
            ResultCode::CannotCancel => "cannot cancel",
            ResultCode::AssertionFailed => "assertion failed",
            ResultCode::AuthorizationDenied => "authorization denied",
            ResultCode::NoOperation => "no operation",
        }
    }

    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), u32::from(*self))
    }
}

#[cfg(test)]
mod tests {
    use super::ResultCode;

    #[test]
    fn test_result_code_numeric_round_trip() {
        assert_eq!(u32::from(ResultCode::NoSuchObject), 32);
        assert_eq!(ResultCode::try_from(68u32).ok(), Some(ResultCode::EntryAlreadyExists));
        assert!(ResultCode::try_from(9999u32).is_err());
        assert_eq!(
            ResultCode::NoOperation.to_string(),
            "no operation (16654)".to_string()
        );
    }
}
