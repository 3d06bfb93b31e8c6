use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// User-facing errors (bad filter text, unknown names, missing
    /// credentials). Reported once, no further context needed.
    #[error("{0}")]
    Expected(String),

    #[error("source inconsistency: {0}")]
    SourceInconsistency(String),

    /// A service answered with a non-success status.
    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    pub fn expected(message: impl Into<String>) -> Self {
        Self::Expected(message.into())
    }

    /// Connection-level failures abort the whole run; everything else is
    /// scoped to the series or batch in progress.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Expected(_) | Self::Http(_) | Self::Internal(_))
    }
}
