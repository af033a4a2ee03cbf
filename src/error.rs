use thiserror::Error;

use crate::run_lock::RunOwner;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure classes surfaced by the coordinator core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("transient network error: {0}")]
    TransientNetwork(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("{0} cycle already running")]
    LockContention(RunOwner),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("{label}: gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        label: String,
        attempts: u32,
        last: Box<Error>,
    },
}

impl Error {
    /// Only transient network failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransientNetwork(_))
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Error::RetriesExhausted { .. })
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            return Error::TransientNetwork(e.to_string());
        }
        match e.status() {
            Some(status) if status.as_u16() == 429 || status.is_server_error() => {
                Error::TransientNetwork(e.to_string())
            }
            _ => Error::Validation(e.to_string()),
        }
    }
}

impl From<clickhouse::error::Error> for Error {
    fn from(e: clickhouse::error::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(Error::TransientNetwork("timeout".into()).is_retryable());
        assert!(!Error::Validation("bad address".into()).is_retryable());
        assert!(!Error::InsufficientFunds("1 < 2".into()).is_retryable());
        assert!(!Error::Persistence("disk".into()).is_retryable());
    }

    #[test]
    fn exhausted_retries_are_final() {
        let err = Error::RetriesExhausted {
            label: "quote".into(),
            attempts: 3,
            last: Box::new(Error::TransientNetwork("502".into())),
        };
        assert!(err.is_exhausted());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("gave up after 3 attempts"));
    }
}
