//! Subflow error taxonomy
//!
//! Translates the numeric codes returned by the path-control facility into a
//! closed set of error kinds, and carries enough context (operation, kind,
//! original code) for callers to decide whether to retry.

use std::fmt;
use std::io;

/// Control operation an error originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Open,
    Close,
    List,
    Inspect,
    GetOption,
    SetOption,
    Resolve,
    Validate,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Open => "open_subflow",
            Operation::Close => "close_subflow",
            Operation::List => "list_subflows",
            Operation::Inspect => "inspect_subflow",
            Operation::GetOption => "get_subflow_option",
            Operation::SetOption => "set_subflow_option",
            Operation::Resolve => "resolve_endpoint",
            Operation::Validate => "validate_argument",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw failure code reported by a path-control facility (an errno value)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub i32);

impl Errno {
    /// Errno of the last failed libc call on this thread
    pub fn last() -> Self {
        Errno(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
    }

    /// System message for this code (`strerror`)
    pub fn message(&self) -> String {
        io::Error::from_raw_os_error(self.0).to_string()
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "errno {} ({})", self.0, self.message())
    }
}

/// Classification of a facility code. Every `i32` maps to exactly one variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacilityStatus {
    Success,
    /// The subflow id does not name an open path
    InvalidArgument,
    /// The operation is not supported
    NotSupported,
    /// The option is unknown at the given level
    UnknownOption,
    Unknown(i32),
}

impl FacilityStatus {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => FacilityStatus::Success,
            libc::EINVAL => FacilityStatus::InvalidArgument,
            libc::EOPNOTSUPP => FacilityStatus::NotSupported,
            libc::ENOPROTOOPT => FacilityStatus::UnknownOption,
            other => FacilityStatus::Unknown(other),
        }
    }
}

/// Fieldless view of [`SubflowError`] for matching
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    Resolution,
    NotSupported,
    UnknownOption,
    Unknown,
    Handle,
}

/// Errors surfaced by the subflow control layer
#[derive(Debug, thiserror::Error)]
pub enum SubflowError {
    #[error("{op}: invalid argument: {reason}")]
    InvalidArgument { op: Operation, reason: String },

    #[error("{op}: cannot resolve {host:?}: {reason}")]
    Resolution {
        op: Operation,
        host: String,
        reason: String,
    },

    #[error("{op}: operation not supported (errno {code})")]
    NotSupported { op: Operation, code: i32 },

    #[error("{op}: option unknown at the given level (errno {code})")]
    UnknownOption { op: Operation, code: i32 },

    #[error("{op}: errno {code} ({message})")]
    Unknown {
        op: Operation,
        code: i32,
        message: String,
    },

    #[error("{op}: descriptor access failed: {source}")]
    Handle {
        op: Operation,
        #[source]
        source: io::Error,
    },
}

impl SubflowError {
    pub(crate) fn invalid(op: Operation, reason: impl Into<String>) -> Self {
        SubflowError::InvalidArgument {
            op,
            reason: reason.into(),
        }
    }

    /// Translate a facility code. Returns `None` for success.
    pub fn from_code(op: Operation, code: i32) -> Option<Self> {
        match FacilityStatus::from_code(code) {
            FacilityStatus::Success => None,
            FacilityStatus::InvalidArgument => {
                Some(SubflowError::invalid(op, "invalid subflow id"))
            }
            FacilityStatus::NotSupported => Some(SubflowError::NotSupported { op, code }),
            FacilityStatus::UnknownOption => Some(SubflowError::UnknownOption { op, code }),
            FacilityStatus::Unknown(code) => Some(SubflowError::Unknown {
                op,
                code,
                message: Errno(code).message(),
            }),
        }
    }

    /// Translate a facility failure. A zero code here still means the facility
    /// reported an error, so it is surfaced as `Unknown(0)` rather than dropped.
    pub fn from_errno(op: Operation, errno: Errno) -> Self {
        SubflowError::from_code(op, errno.0).unwrap_or_else(|| SubflowError::Unknown {
            op,
            code: 0,
            message: "facility reported failure without a code".to_string(),
        })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SubflowError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            SubflowError::Resolution { .. } => ErrorKind::Resolution,
            SubflowError::NotSupported { .. } => ErrorKind::NotSupported,
            SubflowError::UnknownOption { .. } => ErrorKind::UnknownOption,
            SubflowError::Unknown { .. } => ErrorKind::Unknown,
            SubflowError::Handle { .. } => ErrorKind::Handle,
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            SubflowError::InvalidArgument { op, .. }
            | SubflowError::Resolution { op, .. }
            | SubflowError::NotSupported { op, .. }
            | SubflowError::UnknownOption { op, .. }
            | SubflowError::Unknown { op, .. }
            | SubflowError::Handle { op, .. } => *op,
        }
    }

    /// Original facility code, when the error came from the facility
    pub fn code(&self) -> Option<i32> {
        match self {
            SubflowError::NotSupported { code, .. }
            | SubflowError::UnknownOption { code, .. }
            | SubflowError::Unknown { code, .. } => Some(*code),
            SubflowError::Handle { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(
            self,
            SubflowError::Unknown { code, .. } if *code == libc::EPERM || *code == libc::EACCES
        )
    }

    /// Re-tag an error produced by a shared helper with the calling operation
    pub(crate) fn with_operation(self, op: Operation) -> Self {
        match self {
            SubflowError::InvalidArgument { reason, .. } => {
                SubflowError::InvalidArgument { op, reason }
            }
            SubflowError::Resolution { host, reason, .. } => {
                SubflowError::Resolution { op, host, reason }
            }
            SubflowError::NotSupported { code, .. } => SubflowError::NotSupported { op, code },
            SubflowError::UnknownOption { code, .. } => SubflowError::UnknownOption { op, code },
            SubflowError::Unknown { code, message, .. } => {
                SubflowError::Unknown { op, code, message }
            }
            SubflowError::Handle { source, .. } => SubflowError::Handle { op, source },
        }
    }
}

pub type Result<T> = std::result::Result<T, SubflowError>;
