//! The leaf error taxonomy operations in this crate can fail with (§7).
//!
//! This is plain data — no heap allocation, no `Value`. Turning a
//! `NativeError` into an actual thrown `Instance` of the matching Croc
//! exception class is `croc-runtime`'s job (see `exceptions::raise`),
//! since that requires walking the class hierarchy rooted at `Throwable`.

use std::fmt;

/// Mirrors the leaf classes of §7's `Throwable` hierarchy. `Exception` vs
/// `Error` (recoverable vs not-expected-to-be-caught) is a property of
/// which Croc class `ErrorKind` maps to, tracked by `ErrorKind::root`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TypeError,
    ValueError,
    RangeError,
    FieldError,
    BoundsError,
    ImportError,
    IoError,
    EofError,
    StateError,
    SyntaxError,
    LookupError,
    NotImplementedError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionRoot {
    /// Recoverable: normal code is expected to `catch` these.
    Exception,
    /// Not expected to be caught in normal code.
    Error,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::TypeError => "TypeError",
            ErrorKind::ValueError => "ValueError",
            ErrorKind::RangeError => "RangeError",
            ErrorKind::FieldError => "FieldError",
            ErrorKind::BoundsError => "BoundsError",
            ErrorKind::ImportError => "ImportError",
            ErrorKind::IoError => "IOError",
            ErrorKind::EofError => "EOFError",
            ErrorKind::StateError => "StateError",
            ErrorKind::SyntaxError => "SyntaxError",
            ErrorKind::LookupError => "LookupError",
            ErrorKind::NotImplementedError => "NotImplementedError",
        }
    }

    /// §7: which of the two roots (`Exception`/`Error`) this leaf hangs
    /// off of. `ImportError`/`IOError`/`EOFError` are ordinary recoverable
    /// conditions; the rest that indicate an interpreter-detected runtime
    /// fault (`TypeError`, `BoundsError`, ...) are still `Exception`s too —
    /// only `NotImplementedError` and `StateError` default to `Error`,
    /// matching "not expected to be caught in normal code".
    pub fn root(self) -> ExceptionRoot {
        match self {
            ErrorKind::NotImplementedError | ErrorKind::StateError => ExceptionRoot::Error,
            _ => ExceptionRoot::Exception,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A raw, heap-free error raised by a core operation (indexing,
/// arithmetic, a native call, ...).
#[derive(Debug, Clone)]
pub struct NativeError {
    pub kind: ErrorKind,
    pub message: Box<str>,
}

impl NativeError {
    pub fn new(kind: ErrorKind, message: impl Into<Box<str>>) -> Self {
        NativeError {
            kind,
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<Box<str>>) -> Self {
        NativeError::new(ErrorKind::TypeError, message)
    }

    pub fn bounds_error(message: impl Into<Box<str>>) -> Self {
        NativeError::new(ErrorKind::BoundsError, message)
    }

    pub fn field_error(message: impl Into<Box<str>>) -> Self {
        NativeError::new(ErrorKind::FieldError, message)
    }

    pub fn value_error(message: impl Into<Box<str>>) -> Self {
        NativeError::new(ErrorKind::ValueError, message)
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for NativeError {}
