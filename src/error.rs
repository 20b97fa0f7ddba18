//! Error types for the primus init system.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for init system operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the init system.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed service spec string
    #[error("invalid service spec: {0}")]
    InvalidSpec(String),

    /// Runlevel outside the accepted domain
    #[error("invalid runlevel: {0}")]
    InvalidRunlevel(String),

    /// Process spawn error
    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    /// Inotify watcher used before init or after teardown
    #[error("inotify watcher is not initialized")]
    WatcherClosed,

    /// fsck reported unrecoverable filesystem damage (exit code > 1)
    #[error("fsck of {device} failed with exit code {code}")]
    FsckFatal { device: String, code: i32 },

    /// fstab could not be read or parsed
    #[error("fstab {path}: {reason}")]
    Fstab { path: PathBuf, reason: String },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Control socket error
    #[error("control socket error: {0}")]
    Control(String),

    /// IO error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Nix error
    #[error("system error: {0}")]
    Nix(#[from] nix::Error),
}
