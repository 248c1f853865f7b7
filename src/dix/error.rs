//! Protocol Errors
//!
//! Every request handler returns `DixResult`. Errors are synchronous: the
//! request loop turns them into an X error for the triggering request.

use thiserror::Error;
use xdix_proto::Xid;

pub const BAD_REQUEST: u8 = 1;
pub const BAD_VALUE: u8 = 2;
pub const BAD_WINDOW: u8 = 3;
pub const BAD_PIXMAP: u8 = 4;
pub const BAD_MATCH: u8 = 8;
pub const BAD_DRAWABLE: u8 = 9;
pub const BAD_ACCESS: u8 = 10;
pub const BAD_ALLOC: u8 = 11;
pub const BAD_ID_CHOICE: u8 = 14;
pub const BAD_IMPLEMENTATION: u8 = 17;

/// Error code, either core or relative to an extension's error base
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Core(u8),
    Extension { name: &'static str, offset: u8 },
}

/// Coarse classification of protocol errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidId,
    TypeMismatch,
    OutOfRange,
    StateMismatch,
    Allocation,
    Unsupported,
    NotPermitted,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DixError {
    #[error("no {what} 0x{id:08x}")]
    BadResource {
        id: Xid,
        what: &'static str,
        code: ErrorCode,
    },

    #[error("0x{id:08x} is a {found}, not a {expected}")]
    BadType {
        id: Xid,
        expected: &'static str,
        found: &'static str,
        code: ErrorCode,
    },

    #[error("id 0x{0:08x} already in use")]
    IdInUse(Xid),

    #[error("id 0x{0:08x} is outside the client's range")]
    BadIdChoice(Xid),

    #[error("value {0} out of range")]
    BadValue(u32),

    #[error("{0}")]
    BadMatch(&'static str),

    #[error("allocation failed: {0}")]
    BadAlloc(&'static str),

    #[error("not implemented: {0}")]
    BadImplementation(&'static str),

    #[error("access denied: {0}")]
    BadAccess(&'static str),

    #[error("request requires a local client")]
    NotLocal { code: ErrorCode },

    #[error("bad request")]
    BadRequest,

    #[error("out of resource type slots")]
    TypesExhausted,
}

pub type DixResult<T> = Result<T, DixError>;

impl DixError {
    pub fn bad_window(id: Xid) -> Self {
        DixError::BadResource {
            id,
            what: "window",
            code: ErrorCode::Core(BAD_WINDOW),
        }
    }

    pub fn bad_pixmap(id: Xid) -> Self {
        DixError::BadResource {
            id,
            what: "pixmap",
            code: ErrorCode::Core(BAD_PIXMAP),
        }
    }

    pub fn bad_drawable(id: Xid) -> Self {
        DixError::BadResource {
            id,
            what: "drawable",
            code: ErrorCode::Core(BAD_DRAWABLE),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DixError::BadResource { .. } | DixError::IdInUse(_) | DixError::BadIdChoice(_) => {
                ErrorKind::InvalidId
            }
            DixError::BadType { .. } => ErrorKind::TypeMismatch,
            DixError::BadValue(_) => ErrorKind::OutOfRange,
            DixError::BadMatch(_) => ErrorKind::StateMismatch,
            DixError::BadAlloc(_) => ErrorKind::Allocation,
            DixError::BadImplementation(_) | DixError::BadRequest | DixError::TypesExhausted => {
                ErrorKind::Unsupported
            }
            DixError::BadAccess(_) | DixError::NotLocal { .. } => ErrorKind::NotPermitted,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            DixError::BadResource { code, .. } | DixError::BadType { code, .. } => *code,
            DixError::IdInUse(_) | DixError::BadIdChoice(_) => ErrorCode::Core(BAD_ID_CHOICE),
            DixError::BadValue(_) => ErrorCode::Core(BAD_VALUE),
            DixError::BadMatch(_) => ErrorCode::Core(BAD_MATCH),
            DixError::BadAlloc(_) => ErrorCode::Core(BAD_ALLOC),
            DixError::BadImplementation(_) | DixError::TypesExhausted => {
                ErrorCode::Core(BAD_IMPLEMENTATION)
            }
            DixError::BadAccess(_) => ErrorCode::Core(BAD_ACCESS),
            DixError::NotLocal { code } => *code,
            DixError::BadRequest => ErrorCode::Core(BAD_REQUEST),
        }
    }

    /// Value carried in the error's `bad_value` field
    pub fn bad_value(&self) -> u32 {
        match self {
            DixError::BadResource { id, .. }
            | DixError::BadType { id, .. }
            | DixError::IdInUse(id)
            | DixError::BadIdChoice(id) => *id,
            DixError::BadValue(v) => *v,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_and_mismatched_are_distinct() {
        let missing = DixError::bad_drawable(0x200001);
        let mismatched = DixError::BadType {
            id: 0x200001,
            expected: "window",
            found: "pixmap",
            code: ErrorCode::Core(BAD_WINDOW),
        };
        assert_eq!(missing.kind(), ErrorKind::InvalidId);
        assert_eq!(mismatched.kind(), ErrorKind::TypeMismatch);
        assert_eq!(missing.code(), ErrorCode::Core(BAD_DRAWABLE));
        assert_eq!(mismatched.bad_value(), 0x200001);
    }

    #[test]
    fn test_not_local_keeps_extension_code() {
        let err = DixError::NotLocal {
            code: ErrorCode::Core(BAD_REQUEST),
        };
        assert_eq!(err.kind(), ErrorKind::NotPermitted);
        assert_eq!(err.code(), ErrorCode::Core(BAD_REQUEST));
    }
}
