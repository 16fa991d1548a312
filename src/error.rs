use std::{error::Error, fmt};

use backtrace::Backtrace;

/// Classification of engine errors.
///
/// `Integrity` failures and programmer errors are invariant violations;
/// code that detects them panics with a diagnostic instead of returning.
/// Every other kind is recoverable by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Short read, device error. A checksum mismatch is only surfaced
    /// after single-page recovery has been attempted.
    Storage,
    /// No free frame and eviction made no progress, no free page in the
    /// volume, or the store table is full.
    OutOfSpace,
    /// A conditional latch would block, or a lock timed out.
    Conflict,
    /// Fence-key violation, corrupt log record, unknown page format.
    Integrity,
    /// Key already present on insert.
    DuplicateKey,
    /// Key not found where one was required.
    KeyNotFound,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ErrorKind::Storage => "storage",
            ErrorKind::OutOfSpace => "out of space",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Integrity => "integrity",
            ErrorKind::DuplicateKey => "duplicate key",
            ErrorKind::KeyNotFound => "key not found",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{}", name)
    }
}

pub struct DbError {
    kind: ErrorKind,
    details: String,
    backtrace: Backtrace,
}

impl DbError {
    pub fn new(kind: ErrorKind, msg: &str) -> DbError {
        DbError {
            kind,
            details: msg.to_string(),
            backtrace: Backtrace::new_unresolved(),
        }
    }

    pub fn storage(msg: &str) -> DbError {
        Self::new(ErrorKind::Storage, msg)
    }

    pub fn internal(msg: &str) -> DbError {
        Self::new(ErrorKind::Internal, msg)
    }

    pub fn conflict(msg: &str) -> DbError {
        Self::new(ErrorKind::Conflict, msg)
    }

    pub fn out_of_space(msg: &str) -> DbError {
        Self::new(ErrorKind::OutOfSpace, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn show_backtrace(&self) {
        let mut bt = self.backtrace.clone();
        bt.resolve();
        log::error!("{}: {}\n{:?}", self.kind, self.details, bt);
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.details)
    }
}

impl fmt::Debug for DbError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.details)
    }
}

impl Error for DbError {}

impl From<std::io::Error> for DbError {
    fn from(e: std::io::Error) -> Self {
        DbError::storage(&e.to_string())
    }
}
