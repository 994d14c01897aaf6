use std::path::PathBuf;

use thiserror::Error;

/// Stable error surface handed to callers of the core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("no saved credentials")]
    NoCredentials,
    #[error("stored credentials are no longer valid, please login again")]
    InvalidCredentials,
    #[error("transport error: {message}")]
    Transport { retryable: bool, message: String },
    #[error("manifest unavailable: {0}")]
    ManifestUnavailable(String),
    #[error("destination {} is already used by another job", .0.display())]
    PathBusy(PathBuf),
    #[error("disk error at {}: {message}", .path.display())]
    Disk { path: PathBuf, message: String },
    #[error("operation cancelled")]
    Cancelled,
    #[error("cannot {operation} while job is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },
    #[error("unexpected error: {raw_message}")]
    Unknown { raw_message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the caller may retry the failed operation later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport { retryable: true, .. })
    }

    pub(crate) fn disk(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Error::Disk {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub(crate) fn unknown(raw: impl Into<String>) -> Self {
        Error::Unknown {
            raw_message: raw.into(),
        }
    }
}

/// Failures as reported by the wrapped store client, before translation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("credentials rejected: {0}")]
    Rejected(String),
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("I/O error at {}: {message}", .path.display())]
    Io { path: PathBuf, message: String },
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Other(String),
}

impl ClientError {
    pub fn io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        ClientError::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout(err.to_string())
        } else if err.is_connect() {
            ClientError::Connection(err.to_string())
        } else if let Some(status) = err.status() {
            ClientError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else if err.is_decode() {
            ClientError::Decode(err.to_string())
        } else if err.is_request() || err.is_body() {
            ClientError::Connection(err.to_string())
        } else {
            ClientError::Other(err.to_string())
        }
    }
}

/// Map a raw client failure onto the caller-facing taxonomy.
///
/// Authentication failures are surfaced as-is so the session layer can
/// re-prompt; nothing here retries.
#[must_use]
pub fn translate(raw: ClientError) -> Error {
    match raw {
        ClientError::Rejected(_) => Error::InvalidCredentials,
        ClientError::Http { status, message } => translate_status(status, message),
        ClientError::Connection(message) | ClientError::Timeout(message) => Error::Transport {
            retryable: true,
            message,
        },
        ClientError::NotFound(message) => Error::ManifestUnavailable(message),
        ClientError::Io { path, message } => Error::Disk { path, message },
        ClientError::Cancelled => Error::Cancelled,
        ClientError::Decode(raw_message) | ClientError::Other(raw_message) => {
            Error::Unknown { raw_message }
        }
    }
}

fn translate_status(status: u16, message: String) -> Error {
    match status {
        401 | 403 => Error::InvalidCredentials,
        404 => Error::ManifestUnavailable(message),
        408 | 429 | 500..=599 => Error::Transport {
            retryable: true,
            message,
        },
        _ => Error::Transport {
            retryable: false,
            message,
        },
    }
}

impl From<ClientError> for Error {
    fn from(raw: ClientError) -> Self {
        translate(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: u16) -> ClientError {
        ClientError::Http {
            status,
            message: format!("status {status}"),
        }
    }

    #[test]
    fn auth_failures_become_invalid_credentials() {
        assert_eq!(
            translate(ClientError::Rejected("invalid_grant".into())),
            Error::InvalidCredentials
        );
        assert_eq!(translate(http(401)), Error::InvalidCredentials);
        assert_eq!(translate(http(403)), Error::InvalidCredentials);
    }

    #[test]
    fn transport_retry_hint_follows_status_class() {
        for status in [408, 429, 500, 502, 503] {
            assert!(translate(http(status)).is_retryable(), "status {status}");
        }
        for status in [400, 409, 410, 422] {
            let err = translate(http(status));
            assert!(matches!(err, Error::Transport { retryable: false, .. }));
        }
        assert!(translate(ClientError::Connection("refused".into())).is_retryable());
        assert!(translate(ClientError::Timeout("10s".into())).is_retryable());
    }

    #[test]
    fn missing_manifest_and_disk_errors_keep_context() {
        assert!(matches!(translate(http(404)), Error::ManifestUnavailable(_)));
        assert!(matches!(
            translate(ClientError::NotFound("Fortnite".into())),
            Error::ManifestUnavailable(msg) if msg == "Fortnite"
        ));
        let err = translate(ClientError::Io {
            path: PathBuf::from("/games/a.pak"),
            message: "no space left".into(),
        });
        assert!(matches!(err, Error::Disk { path, .. } if path == PathBuf::from("/games/a.pak")));
    }

    #[test]
    fn everything_else_is_unknown_with_raw_message() {
        assert_eq!(translate(ClientError::Cancelled), Error::Cancelled);
        assert_eq!(
            translate(ClientError::Decode("expected `{`".into())),
            Error::Unknown {
                raw_message: "expected `{`".into()
            }
        );
        assert!(!translate(ClientError::Other("boom".into())).is_retryable());
    }
}
