use std::io;

/// Central error type for the mazurka engine.
#[derive(Debug)]
pub enum MazurkaError {
    /// Underlying I/O error from the OS or network.
    Io(io::Error),
    /// Configuration file could not be read or parsed.
    Config(String),
    /// Resource pool produced no entry within the acquire timeout.
    PoolTimeout,
    /// Resource pool has been closed.
    PoolClosed,
    /// An application handler returned a failure.
    Handler(String),
    /// Generic or miscellaneous error.
    Other(String),
}

impl std::fmt::Display for MazurkaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MazurkaError::Io(e) => write!(f, "I/O error: {}", e),
            MazurkaError::Config(msg) => write!(f, "Config error: {}", msg),
            MazurkaError::PoolTimeout => write!(f, "Timed out waiting for a pooled resource"),
            MazurkaError::PoolClosed => write!(f, "Resource pool is closed"),
            MazurkaError::Handler(msg) => write!(f, "Handler error: {}", msg),
            MazurkaError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for MazurkaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MazurkaError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for MazurkaError {
    fn from(e: io::Error) -> Self {
        MazurkaError::Io(e)
    }
}

impl From<serde_json::Error> for MazurkaError {
    fn from(e: serde_json::Error) -> Self {
        MazurkaError::Config(e.to_string())
    }
}

pub type MazurkaResult<T> = Result<T, MazurkaError>;
