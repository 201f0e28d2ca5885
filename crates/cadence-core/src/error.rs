use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CadenceError {
    /// Malformed or missing required field in a request.
    #[error("Contract invalid: {0}")]
    ContractInvalid(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The job/record store failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Internal scheduling failure (timer arrangement, runtime, executor setup).
    #[error("Server error: {0}")]
    Server(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a [`CadenceError`], stable across context wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ContractInvalid,
    NotFound,
    AlreadyExists,
    Database,
    Server,
    Config,
    Serialization,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ContractInvalid => "contract-invalid",
            Self::NotFound => "not-found",
            Self::AlreadyExists => "already-exists",
            Self::Database => "database",
            Self::Server => "server",
            Self::Config => "config",
            Self::Serialization => "serialization",
            Self::Io => "io",
        };
        write!(f, "{s}")
    }
}

impl CadenceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CadenceError::ContractInvalid(_) => ErrorKind::ContractInvalid,
            CadenceError::NotFound(_) => ErrorKind::NotFound,
            CadenceError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            CadenceError::Database(_) => ErrorKind::Database,
            CadenceError::Server(_) => ErrorKind::Server,
            CadenceError::Config(_) => ErrorKind::Config,
            CadenceError::Serialization(_) => ErrorKind::Serialization,
            CadenceError::Io(_) => ErrorKind::Io,
        }
    }

    /// Short error code string surfaced to transport layers.
    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::ContractInvalid => "CONTRACT_INVALID",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::AlreadyExists => "ALREADY_EXISTS",
            ErrorKind::Database => "DATABASE_ERROR",
            ErrorKind::Server => "SERVER_ERROR",
            ErrorKind::Config => "CONFIG_ERROR",
            ErrorKind::Serialization => "SERIALIZATION_ERROR",
            ErrorKind::Io => "IO_ERROR",
        }
    }

    /// Prefix the message with `ctx` (which job, which operation) while
    /// keeping the variant intact, so callers can still match on the kind.
    ///
    /// `Serialization` and `Io` carry foreign sources and are folded into
    /// `Server` with the source rendered into the message.
    pub fn with_context(self, ctx: impl fmt::Display) -> Self {
        match self {
            CadenceError::ContractInvalid(m) => {
                CadenceError::ContractInvalid(format!("{ctx}: {m}"))
            }
            CadenceError::NotFound(m) => CadenceError::NotFound(format!("{ctx}: {m}")),
            CadenceError::AlreadyExists(m) => CadenceError::AlreadyExists(format!("{ctx}: {m}")),
            CadenceError::Database(m) => CadenceError::Database(format!("{ctx}: {m}")),
            CadenceError::Server(m) => CadenceError::Server(format!("{ctx}: {m}")),
            CadenceError::Config(m) => CadenceError::Config(format!("{ctx}: {m}")),
            CadenceError::Serialization(e) => CadenceError::Server(format!("{ctx}: {e}")),
            CadenceError::Io(e) => CadenceError::Server(format!("{ctx}: {e}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, CadenceError>;
