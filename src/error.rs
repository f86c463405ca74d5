//! shardopt error types

/// shardopt result type
pub type Result<T> = std::result::Result<T, Error>;

/// shardopt errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid mesh, placement, strategy or run configuration.
    ///
    /// Raised eagerly at construction / wrap time, never deferred to `step()`.
    #[error("configuration error: {reason}")]
    Configuration {
        /// Description of what went wrong
        reason: String,
    },

    /// A collective operation failed, timed out, or was aborted by a peer
    #[error("communication error: {reason}")]
    Communication {
        /// Description of what went wrong
        reason: String,
    },

    /// Optimizer state could not be advanced (e.g. a gradient is missing)
    #[error("state error: {reason}")]
    State {
        /// Description of what went wrong
        reason: String,
    },

    /// Tensor shape mismatch
    #[error("shape error: {reason}")]
    Shape {
        /// Description of what went wrong
        reason: String,
    },

    /// I/O error while reading configuration
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON configuration
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ndarray::ShapeError> for Error {
    fn from(e: ndarray::ShapeError) -> Self {
        Error::Shape {
            reason: e.to_string(),
        }
    }
}

impl Error {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Error::Configuration {
            reason: reason.into(),
        }
    }

    pub(crate) fn comm(reason: impl Into<String>) -> Self {
        Error::Communication {
            reason: reason.into(),
        }
    }

    pub(crate) fn state(reason: impl Into<String>) -> Self {
        Error::State {
            reason: reason.into(),
        }
    }

    pub(crate) fn shape(reason: impl Into<String>) -> Self {
        Error::Shape {
            reason: reason.into(),
        }
    }

    /// True for errors that a peer can observe without local cause
    /// (collective failures), as opposed to locally detected ones.
    pub fn is_communication(&self) -> bool {
        matches!(self, Error::Communication { .. })
    }
}
