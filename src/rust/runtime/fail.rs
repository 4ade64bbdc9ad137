// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::libc::{
    c_int,
    ECANCELED,
    EIO,
    ESHUTDOWN,
};
use ::std::{
    error,
    fmt,
    io,
};

//==============================================================================
// Structures
//==============================================================================

/// Scheduler signals carried by a failure. Only [Fail::killed] and [Fail::exit] set them, so an ordinary error never
/// passes for one whatever its error number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FailKind {
    Error,
    Killed,
    Exit,
}

/// Failure
#[derive(Clone, PartialEq, Eq)]
pub struct Fail {
    /// Error code.
    pub errno: c_int,
    /// Cause.
    pub cause: String,
    kind: FailKind,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate Functions for Failures
impl Fail {
    /// Creates a new Failure
    pub fn new(errno: i32, cause: &str) -> Self {
        Self {
            errno,
            cause: cause.to_string(),
            kind: FailKind::Error,
        }
    }

    /// Creates the cancellation signal raised inside a killed job. This does not allocate.
    pub fn killed() -> Self {
        Self {
            errno: ECANCELED,
            cause: String::new(),
            kind: FailKind::Killed,
        }
    }

    /// Creates a termination request. The dispatch loop that receives it retires its context and propagates it.
    pub fn exit(cause: &str) -> Self {
        Self {
            errno: ESHUTDOWN,
            cause: cause.to_string(),
            kind: FailKind::Exit,
        }
    }

    /// Is this the cancellation signal of a killed job?
    pub fn is_killed(&self) -> bool {
        self.kind == FailKind::Killed
    }

    /// Is this a termination request?
    pub fn is_exit(&self) -> bool {
        self.kind == FailKind::Exit
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Display Trait Implementation for Failures
impl fmt::Display for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_killed() {
            return write!(f, "Job killed");
        }
        write!(f, "Error {:?}: {:?}", self.errno, self.cause)
    }
}

/// Debug trait Implementation for Failures
impl fmt::Debug for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {:?}: {:?}", self.errno, self.cause)
    }
}

/// Error Trait Implementation for Failures
impl error::Error for Fail {}

/// Conversion Trait Implementation for Fail
impl From<io::Error> for Fail {
    fn from(e: io::Error) -> Self {
        Self {
            errno: e.raw_os_error().unwrap_or(EIO),
            cause: e.to_string(),
            kind: FailKind::Error,
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
