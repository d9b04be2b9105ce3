use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Platform error: {0}")]
    Platform(String),

    /// Rejected input. The payload is a stable reason code such as
    /// `batch_too_large` or `invalid_date_range`, suitable for returning to
    /// callers without leaking internals.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Insufficient privilege")]
    InsufficientPrivilege,

    #[error("Catalog sync error: {0}")]
    Sync(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl Error {
    pub fn platform(msg: impl Into<String>) -> Self {
        Error::Platform(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn sync(msg: impl Into<String>) -> Self {
        Error::Sync(msg.into())
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Error::Unknown(msg.into())
    }

    /// Short machine-readable code recorded into `sync_runs.error_code`.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Io(_) => "io",
            Error::Http(_) => "http",
            Error::Json(_) => "json",
            Error::Database(_) => "database",
            Error::Platform(_) => "platform",
            Error::Validation(_) => "validation",
            Error::InsufficientPrivilege => "insufficient_privilege",
            Error::Sync(_) => "sync",
            Error::Unknown(_) => "unknown",
        }
    }
}
