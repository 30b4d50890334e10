//! Error type for script session operations
//!
//! Only infrastructure failures surface here. Exceptions raised by a script
//! are captured as observation text and never become a `SessionError`.

use std::path::PathBuf;

#[derive(Debug)]
pub enum SessionError {
    /// Workspace filesystem operation failed
    Io(std::io::Error),
    /// The interpreter process could not be started
    WorkerSpawn { command: String, source: std::io::Error },
    /// The interpreter started but never reported ready
    WorkerStartup(String),
    /// The worker sent something that is not part of the protocol
    Protocol(String),
    /// The session was cleaned up and can no longer execute
    Closed(PathBuf),
    /// A run identifier would place the workspace outside the base directory
    InvalidKey { field: &'static str, value: String },
}

impl SessionError {
    /// Whether retrying the same step may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            SessionError::Closed(_) | SessionError::InvalidKey { .. }
        )
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Io(e) => write!(f, "Workspace I/O error: {}", e),
            SessionError::WorkerSpawn { command, source } => {
                write!(f, "Failed to spawn interpreter `{}`: {}", command, source)
            }
            SessionError::WorkerStartup(msg) => write!(f, "Interpreter failed to start: {}", msg),
            SessionError::Protocol(msg) => write!(f, "Worker protocol error: {}", msg),
            SessionError::Closed(path) => {
                write!(f, "Session for {} has been cleaned up", path.display())
            }
            SessionError::InvalidKey { field, value } => write!(
                f,
                "Invalid {} {:?}: must be a single directory name",
                field, value
            ),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Io(e) => Some(e),
            SessionError::WorkerSpawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Io(e)
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::Protocol(e.to_string())
    }
}
