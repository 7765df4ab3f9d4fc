use std::fmt;

use thiserror::Error;

/// Whether a failed remote call is worth retrying on the next cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    Transient,
    Permanent,
}

/// Transport or API failure talking to the Sensibo cloud.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            RemoteErrorKind::Transient => "transient",
            RemoteErrorKind::Permanent => "permanent",
        };
        match self.status {
            Some(status) => write!(f, "{kind} remote error ({status}): {}", self.message),
            None => write!(f, "{kind} remote error: {}", self.message),
        }
    }
}

impl std::error::Error for RemoteError {}

impl RemoteError {
    /// Classify a non-2xx status: 5xx and 429 are transient, the rest permanent.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = if status >= 500 || status == 429 {
            RemoteErrorKind::Transient
        } else {
            RemoteErrorKind::Permanent
        };
        Self {
            kind,
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == RemoteErrorKind::Transient
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return RemoteError::from_status(status.as_u16(), e.to_string());
        }
        let kind = if e.is_timeout() || e.is_connect() || e.is_request() {
            RemoteErrorKind::Transient
        } else {
            RemoteErrorKind::Permanent
        };
        RemoteError {
            kind,
            status: None,
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("{property} {value:?} is not supported by this device")]
    UnsupportedCapability {
        property: &'static str,
        value: String,
    },

    #[error("device does not support {0}")]
    NotSupported(&'static str),

    #[error("device has been removed")]
    DeviceRemoved,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Remote(e.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
