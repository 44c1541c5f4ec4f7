// src/error.rs
use std::io;

/// Central error type for the etude core engine.
#[derive(Debug)]
pub enum EtudeError {
    /// Underlying I/O error from the OS or network.
    Io(io::Error),
    /// Connection table reached its maximum capacity.
    TableFull,
    /// The worker pool queue rejected a task.
    QueueFull,
    /// Generic or miscellaneous error.
    Other(String),
}

impl std::fmt::Display for EtudeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EtudeError::Io(e) => write!(f, "I/O error: {}", e),
            EtudeError::TableFull => write!(f, "connection table is full"),
            EtudeError::QueueFull => write!(f, "worker queue is full"),
            EtudeError::Other(msg) => write!(f, "error: {}", msg),
        }
    }
}

impl std::error::Error for EtudeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EtudeError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for EtudeError {
    fn from(e: io::Error) -> Self {
        EtudeError::Io(e)
    }
}

pub type EtudeResult<T> = Result<T, EtudeError>;
