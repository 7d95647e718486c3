use thiserror::Error;

/// Failure of one external call.
///
/// Callers decide what each kind means for the workspace: transient errors
/// are retried, `AlreadyExists` on create and `NotFound` on delete count as
/// success, and `Rejected` is a permanent failure of the step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("resource already exists: {handle}")]
    AlreadyExists { handle: String },

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("adapter misconfigured: {0}")]
    Config(String),
}

impl AdapterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Transient(_))
    }

    /// Classifies a non-success HTTP status code.
    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match status {
            404 => AdapterError::NotFound(detail),
            408 | 429 | 500..=599 => AdapterError::Transient(format!("HTTP {}: {}", status, detail)),
            409 => AdapterError::AlreadyExists { handle: detail },
            _ => AdapterError::Rejected(format!("HTTP {}: {}", status, detail)),
        }
    }
}
