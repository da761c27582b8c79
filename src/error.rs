use thiserror::Error;
use tracing::error;

/// Error kinds surfaced by the domain layers.
///
/// Validation and domain errors travel back to the requesting client as the
/// error string of the response envelope; system errors are logged with their
/// real cause and surfaced as a generic string.
#[derive(Debug, Error)]
pub enum BistroError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    WrongState(String),

    #[error("{0}")]
    NoResource(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    System(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, BistroError>;

impl BistroError {
    /// True for pool/database/serialization failures that must not leak
    /// internals to the wire.
    pub fn is_system(&self) -> bool {
        matches!(self, Self::Database(_) | Self::System(_))
    }

    /// The string sent to the client. System errors log the real cause
    /// server-side and answer with a generic message.
    pub fn client_message(&self, context: &str) -> String {
        if self.is_system() {
            error!(context = context, error = %self, "Internal error");
            "Internal server error".to_string()
        } else {
            self.to_string()
        }
    }
}
