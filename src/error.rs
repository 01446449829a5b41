use std::fmt::Display;

/// The error taxonomy every component speaks. Bus handlers map these onto
/// response codes; the collector's pass-level policy (skip the realm, keep
/// the pass alive) keys off the kind.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transient: {0}")]
    Transient(String),

    #[error("corrupt stored data: {0}")]
    Corrupt(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn parse(msg: impl Display) -> Self {
        Error::Parse(msg.to_string())
    }

    pub fn not_found(msg: impl Display) -> Self {
        Error::NotFound(msg.to_string())
    }

    pub fn transient(msg: impl Display) -> Self {
        Error::Transient(msg.to_string())
    }

    pub fn corrupt(msg: impl Display) -> Self {
        Error::Corrupt(msg.to_string())
    }

    pub fn invariant(msg: impl Display) -> Self {
        Error::Invariant(msg.to_string())
    }

    /// Stop signals are a normal termination condition, not a failure.
    pub fn is_stop(&self) -> bool {
        matches!(self, Error::Stopped)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(err.to_string()),
            _ => Error::Transient(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(err.to_string())
    }
}
