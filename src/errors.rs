//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Queue or snapshot persistence failure.
    Queue(String),
    /// Worker process spawn, channel, or lifecycle failure.
    Pool(String),
    /// Messaging transport failure.
    Transport(String),
    /// Repository mutation lock acquisition failure.
    Lock(String),
    /// Git subprocess failure.
    Git(String),
    /// Worker event framing or dispatch failure.
    Event(String),
    /// Restart or verification protocol failure.
    Restart(String),
    /// Task executor failure.
    Executor(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Queue(msg) => write!(f, "queue: {msg}"),
            Self::Pool(msg) => write!(f, "pool: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::Lock(msg) => write!(f, "lock: {msg}"),
            Self::Git(msg) => write!(f, "git: {msg}"),
            Self::Event(msg) => write!(f, "event: {msg}"),
            Self::Restart(msg) => write!(f, "restart: {msg}"),
            Self::Executor(msg) => write!(f, "executor: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Event(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
