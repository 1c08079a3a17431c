use thiserror::Error;

/// Error types surfaced by the engine and the blackboard stores
#[derive(Error, Debug)]
pub enum EngineError {
    /// A persistent store received an assert for an already-existing uuid
    #[error("duplicate fact id: {id}")]
    DuplicateId {
        /// The offending uuid
        id: String,
    },

    /// The target fact does not exist or has already been retracted
    #[error("fact not found: {id}")]
    NotFound {
        /// The missing uuid or handle
        id: String,
    },

    /// The engine or store has been closed
    #[error("store is closed")]
    Closed,

    /// Backend I/O failure or transient unavailability
    #[error("backend unavailable: {message}")]
    Unavailable {
        /// Backend error description
        message: String,
    },

    /// A rule references a variable that no earlier condition binds
    #[error("pattern mismatch in rule '{rule}': {message}")]
    PatternMismatch {
        /// Rule being compiled
        rule: String,
        /// What went wrong
        message: String,
    },

    /// A rule was rejected at compilation
    #[error("invalid rule '{rule}': {message}")]
    InvalidRule {
        /// Rule being compiled
        rule: String,
        /// Why it was rejected
        message: String,
    },

    /// A rule action raised; isolated per token, never corrupts the network
    #[error("action failed in rule '{rule}': {message}")]
    ActionFailure {
        /// Rule whose action raised
        rule: String,
        /// Action error description
        message: String,
    },

    /// Store codec failure
    #[error("serialization error: {message}")]
    Serialization {
        /// Codec error description
        message: String,
    },

    /// IO error for file-backed stores
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Unavailable {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(feature = "redis-store")]
impl From<redis::RedisError> for EngineError {
    fn from(err: redis::RedisError) -> Self {
        EngineError::Unavailable {
            message: err.to_string(),
        }
    }
}

/// Convenient Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
