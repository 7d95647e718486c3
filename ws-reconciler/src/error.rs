use thiserror::Error;
use ws_adapters::AdapterError;
use ws_orchestrator::OrchestratorError;

pub type Result<T> = std::result::Result<T, ReconcilerError>;

#[derive(Debug, Error)]
pub enum ReconcilerError {
    /// Startup configuration is missing or malformed; the process must not run.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] OrchestratorError),

    #[error("Step {step} failed: {source}")]
    Adapter {
        step: &'static str,
        #[source]
        source: AdapterError,
    },

    #[error("{actor} may not {action} workspace {workspace_id}")]
    Unauthorized {
        actor: String,
        workspace_id: String,
        action: String,
    },
}

impl ReconcilerError {
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, ReconcilerError::Store(e) if e.is_version_conflict())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ReconcilerError::Store(e) if e.is_not_found())
    }
}
