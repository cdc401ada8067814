// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-local error registry.
//!
//! Every fallible operation in the workspace reports failures twice: once as
//! the returned [`StrataError`] and once in the thread-local last-error
//! record, so callers holding only a flat status code can still recover the
//! classification and the formatted message. The registry is overwritten by
//! the next failure or by [`clear_last_error`]; success paths never touch it,
//! so it is only meaningful immediately after a failed call.

use std::cell::RefCell;
use std::fmt;

/// Stable failure classification shared by every crate in the workspace.
///
/// The discriminants are part of the external contract: [`ErrorKind::code`]
/// is the negative status reported through flat bindings and must not be
/// renumbered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    #[default]
    NoError,
    NoMemory,
    InvalidFilePointer,
    InvalidFileMode,
    InvalidGroup,
    InvalidVarname,
    InvalidVarid,
    InvalidDimension,
    InvalidData,
    DuplicateName,
    OutOfBound,
    BufferOverflow,
    CollectiveTimeout,
    TransportFailure,
}

impl ErrorKind {
    /// Status code for flat bindings: `0` for success, negative otherwise.
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::NoError => 0,
            ErrorKind::NoMemory => -1,
            ErrorKind::InvalidFilePointer => -2,
            ErrorKind::InvalidFileMode => -3,
            ErrorKind::InvalidGroup => -4,
            ErrorKind::InvalidVarname => -5,
            ErrorKind::InvalidVarid => -6,
            ErrorKind::InvalidDimension => -7,
            ErrorKind::InvalidData => -8,
            ErrorKind::DuplicateName => -9,
            ErrorKind::OutOfBound => -10,
            ErrorKind::BufferOverflow => -11,
            ErrorKind::CollectiveTimeout => -12,
            ErrorKind::TransportFailure => -13,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NoError => "err_no_error",
            ErrorKind::NoMemory => "err_no_memory",
            ErrorKind::InvalidFilePointer => "err_invalid_file_pointer",
            ErrorKind::InvalidFileMode => "err_invalid_file_mode",
            ErrorKind::InvalidGroup => "err_invalid_group",
            ErrorKind::InvalidVarname => "err_invalid_varname",
            ErrorKind::InvalidVarid => "err_invalid_varid",
            ErrorKind::InvalidDimension => "err_invalid_dimension",
            ErrorKind::InvalidData => "err_invalid_data",
            ErrorKind::DuplicateName => "err_duplicate_name",
            ErrorKind::OutOfBound => "err_out_of_bound",
            ErrorKind::BufferOverflow => "err_buffer_overflow",
            ErrorKind::CollectiveTimeout => "err_collective_timeout",
            ErrorKind::TransportFailure => "err_transport_failure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure with a formatted message.
///
/// Unlike the happy path, errors are free to allocate; nothing here is tuned
/// for speed.
#[derive(Clone, PartialEq, Eq)]
pub struct StrataError {
    kind: ErrorKind,
    message: String,
}

impl StrataError {
    /// Build an error *and* store it in the thread-local registry.
    ///
    /// This is the constructor used at every failure site in the workspace,
    /// so a caller that discards the `Result` can still inspect
    /// [`last_error`] afterwards.
    pub fn record(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        LAST_ERROR.with(|last| {
            let mut last = last.borrow_mut();
            last.0 = kind;
            last.1.clear();
            last.1.push_str(&message);
        });
        StrataError { kind, message }
    }

    /// Build an error without touching the registry. Used when wrapping an
    /// already-recorded failure with more context.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        StrataError {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Flat status code, `kind().code()`.
    pub fn code(&self) -> i32 {
        self.kind.code()
    }
}

impl fmt::Debug for StrataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl fmt::Display for StrataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for StrataError {}

impl From<std::io::Error> for StrataError {
    fn from(err: std::io::Error) -> Self {
        StrataError::record(ErrorKind::TransportFailure, err.to_string())
    }
}

thread_local! {
    static LAST_ERROR: RefCell<(ErrorKind, String)> =
        RefCell::new((ErrorKind::NoError, String::new()));
}

/// Kind of the most recent failure on this thread, or
/// [`ErrorKind::NoError`] if the registry has been cleared.
pub fn last_error() -> ErrorKind {
    LAST_ERROR.with(|last| last.borrow().0)
}

/// Formatted message of the most recent failure on this thread.
pub fn last_error_message() -> String {
    LAST_ERROR.with(|last| last.borrow().1.clone())
}

/// Reset the registry to the no-error state.
pub fn clear_last_error() {
    LAST_ERROR.with(|last| {
        let mut last = last.borrow_mut();
        last.0 = ErrorKind::NoError;
        last.1.clear();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_updates_registry() {
        clear_last_error();
        let err = StrataError::record(ErrorKind::InvalidVarname, "no variable `x`");
        assert_eq!(err.kind(), ErrorKind::InvalidVarname);
        assert_eq!(last_error(), ErrorKind::InvalidVarname);
        assert_eq!(last_error_message(), "no variable `x`");
        assert_eq!(err.code(), -5);
    }

    #[test]
    fn new_does_not_touch_registry() {
        clear_last_error();
        let _err = StrataError::new(ErrorKind::OutOfBound, "box exceeds global extent");
        assert_eq!(last_error(), ErrorKind::NoError);
    }

    #[test]
    fn clear_resets() {
        let _ = StrataError::record(ErrorKind::BufferOverflow, "1 MB arena, 4 MB payload");
        clear_last_error();
        assert_eq!(last_error(), ErrorKind::NoError);
        assert!(last_error_message().is_empty());
    }

    #[test]
    fn registry_is_thread_local() {
        let _ = StrataError::record(ErrorKind::InvalidGroup, "no group `mesh`");
        std::thread::spawn(|| {
            assert_eq!(last_error(), ErrorKind::NoError);
        })
        .join()
        .unwrap();
        assert_eq!(last_error(), ErrorKind::InvalidGroup);
    }
}
