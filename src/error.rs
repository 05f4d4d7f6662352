use std::io;
use std::sync::PoisonError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    InvalidHeader,
    InvalidWalMagic,
    UnsupportedWalVersion(u32),
    InvalidData(String),
    InvalidInput(String),
    InvalidState(String),
    MutexPoisoned,
    LockError(io::Error),
    ReadOnly,
    // Encoding violations are reported before anything is written.
    ValueTooLarge {
        field: &'static str,
        len: usize,
        max: usize,
    },
    TooManyOpenSessions(usize),
    SchemaMismatch {
        expected: String,
        found: String,
    },
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::MutexPoisoned
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::InvalidHeader => write!(f, "Invalid header"),
            Error::InvalidWalMagic => write!(f, "Invalid WAL magic number"),
            Error::UnsupportedWalVersion(v) => write!(f, "Unsupported WAL version: {}", v),
            Error::InvalidData(msg) => write!(f, "Invalid data: {}", msg),
            Error::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::MutexPoisoned => write!(f, "Mutex was poisoned"),
            Error::LockError(err) => write!(f, "Lock error: {}", err),
            Error::ReadOnly => write!(f, "Store is open read-only"),
            Error::ValueTooLarge { field, len, max } => write!(
                f,
                "Encoded {} is {} bytes, exceeding the maximum of {}",
                field, len, max
            ),
            Error::TooManyOpenSessions(limit) => write!(
                f,
                "More than {} sessions open at once while reconstructing search results",
                limit
            ),
            Error::SchemaMismatch { expected, found } => write!(
                f,
                "Schema mismatch: expected {}, found {}",
                expected, found
            ),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) | Error::LockError(err) => Some(err),
            _ => None,
        }
    }
}
