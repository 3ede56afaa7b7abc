use std::fmt;

/// Closed error taxonomy. Every kind maps to a stable integer code used
/// by the binding surface; new kinds must be appended, never reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Ok,
    ParseSql,
    ParseJson,
    ParseDsl,
    ParseBin,
    Params,
    Logic,
    NotValid,
    Conflict,
    StateInvalidated,
    TagsMismatch,
    NotFound,
    Timeout,
    Canceled,
    TooManyParallelQueries,
    Io,
}

impl ErrorKind {
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::Ok => 0,
            ErrorKind::ParseSql => 1,
            ErrorKind::ParseJson => 2,
            ErrorKind::ParseDsl => 3,
            ErrorKind::ParseBin => 4,
            ErrorKind::Params => 5,
            ErrorKind::Logic => 6,
            ErrorKind::NotValid => 7,
            ErrorKind::Conflict => 8,
            ErrorKind::StateInvalidated => 9,
            ErrorKind::TagsMismatch => 10,
            ErrorKind::NotFound => 11,
            ErrorKind::Timeout => 12,
            ErrorKind::Canceled => 13,
            ErrorKind::TooManyParallelQueries => 14,
            ErrorKind::Io => 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    pub kind: ErrorKind,
    pub context: String,
}

impl Error {
    pub fn new(kind: ErrorKind, context: impl Into<String>) -> Self {
        Error { kind, context: context.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> i32 {
        self.kind.code()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.context)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error {
            kind: ErrorKind::Io,
            context: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            kind: ErrorKind::ParseJson,
            context: err.to_string(),
        }
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(err: std::str::Utf8Error) -> Self {
        Error {
            kind: ErrorKind::ParseBin,
            context: format!("invalid UTF-8 in buffer: {}", err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
