//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// Caller-supplied parameters were malformed or violated policy.
    ///
    /// Always raised before any side effect takes place.
    Validation(String),
    /// Requested unit or container does not exist.
    NotFound(String),
    /// The container engine or multiplexer could not start a unit.
    Launch(String),
    /// A container engine primitive failed.
    Container(String),
    /// A terminal multiplexer primitive failed.
    Multiplexer(String),
    /// An operation exceeded its deadline.
    Timeout(String),
    /// An operation was abandoned because cancellation was requested.
    Cancelled(String),
    /// MCP protocol or tool dispatch failure.
    Mcp(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Unexpected fault inside the runtime itself.
    Internal(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Launch(msg) => write!(f, "launch failed: {msg}"),
            Self::Container(msg) => write!(f, "container: {msg}"),
            Self::Multiplexer(msg) => write!(f, "multiplexer: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
            Self::Mcp(msg) => write!(f, "mcp: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Internal(msg) => write!(f, "internal: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
