//! Result codes for the bpfrt substrate
//!
//! Every fallible operation returns [`BpfResult`]. The error space is
//! closed and maps bijectively onto host errno values so results can
//! cross the user/kernel boundary and come back unchanged.

use core::fmt;

/// Result type for substrate operations.
pub type BpfResult<T = ()> = Result<T, BpfError>;

/// Errors surfaced by the substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BpfError {
    /// An argument failed validation.
    InvalidArgument,

    /// Allocation failed under memory pressure.
    NoMemory,

    /// A ring or other fixed-capacity container is full.
    OutOfSpace,

    /// The supplied buffer is too small; retry with the reported size.
    InsufficientBuffer,

    /// The key or name is already present.
    AlreadyExists,

    /// The key is not present.
    KeyNotFound,

    /// Iteration has passed the last element.
    NoMoreKeys,

    /// The operation is not supported by this object.
    OperationNotSupported,

    /// The operation has not completed yet.
    Pending,

    /// The caller is not permitted to perform the operation.
    AccessDenied,

    /// A tracked object with this identity already exists.
    ObjectAlreadyExists,
}

/// All error kinds, for exhaustive round-trip checks.
pub const ALL_ERROR_KINDS: [BpfError; 11] = [
    BpfError::InvalidArgument,
    BpfError::NoMemory,
    BpfError::OutOfSpace,
    BpfError::InsufficientBuffer,
    BpfError::AlreadyExists,
    BpfError::KeyNotFound,
    BpfError::NoMoreKeys,
    BpfError::OperationNotSupported,
    BpfError::Pending,
    BpfError::AccessDenied,
    BpfError::ObjectAlreadyExists,
];

impl fmt::Display for BpfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BpfError::InvalidArgument => write!(f, "invalid argument"),
            BpfError::NoMemory => write!(f, "out of memory"),
            BpfError::OutOfSpace => write!(f, "out of space"),
            BpfError::InsufficientBuffer => write!(f, "insufficient buffer"),
            BpfError::AlreadyExists => write!(f, "already exists"),
            BpfError::KeyNotFound => write!(f, "key not found"),
            BpfError::NoMoreKeys => write!(f, "no more keys"),
            BpfError::OperationNotSupported => write!(f, "operation not supported"),
            BpfError::Pending => write!(f, "operation pending"),
            BpfError::AccessDenied => write!(f, "access denied"),
            BpfError::ObjectAlreadyExists => write!(f, "object already exists"),
        }
    }
}

impl std::error::Error for BpfError {}

/// Convert a result to the host errno representation. Success is 0.
pub fn result_to_errno(result: &BpfResult) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => error_to_errno(*e),
    }
}

/// Convert an error kind to the host errno representation.
pub fn error_to_errno(error: BpfError) -> i32 {
    match error {
        BpfError::InvalidArgument => libc::EINVAL,
        BpfError::NoMemory => libc::ENOMEM,
        BpfError::OutOfSpace => libc::ENOSPC,
        BpfError::InsufficientBuffer => libc::ENOBUFS,
        BpfError::AlreadyExists => libc::EEXIST,
        BpfError::KeyNotFound => libc::ENOENT,
        BpfError::NoMoreKeys => libc::ENODATA,
        BpfError::OperationNotSupported => libc::EOPNOTSUPP,
        BpfError::Pending => libc::EINPROGRESS,
        BpfError::AccessDenied => libc::EACCES,
        BpfError::ObjectAlreadyExists => libc::EADDRINUSE,
    }
}

/// Convert a host errno value back to a result.
///
/// Unrecognized errno values collapse to `InvalidArgument`; every code
/// produced by [`result_to_errno`] maps back to the kind it came from.
pub fn errno_to_result(errno: i32) -> BpfResult {
    match errno {
        0 => Ok(()),
        libc::ENOMEM => Err(BpfError::NoMemory),
        libc::ENOSPC => Err(BpfError::OutOfSpace),
        libc::ENOBUFS => Err(BpfError::InsufficientBuffer),
        libc::EEXIST => Err(BpfError::AlreadyExists),
        libc::ENOENT => Err(BpfError::KeyNotFound),
        libc::ENODATA => Err(BpfError::NoMoreKeys),
        libc::EOPNOTSUPP => Err(BpfError::OperationNotSupported),
        libc::EINPROGRESS => Err(BpfError::Pending),
        libc::EACCES => Err(BpfError::AccessDenied),
        libc::EADDRINUSE => Err(BpfError::ObjectAlreadyExists),
        _ => Err(BpfError::InvalidArgument),
    }
}
