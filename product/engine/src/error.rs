use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    #[error("external tool is missing: {tool}")]
    ExternalToolMissing { tool: String },

    #[error("external tool failed: {tool} (code={code:?}) {stderr}")]
    ExternalToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("unknown job id: {0}")]
    JobNotFound(String),

    #[error("job {0} has a live process; cancel it first")]
    JobActive(String),

    #[error("cannot {action} job {id} while it is {status}")]
    InvalidJobState {
        id: String,
        status: String,
        action: &'static str,
    },

    #[error("{0} download(s) still running")]
    RunnersActive(usize),
}

pub type Result<T> = std::result::Result<T, EngineError>;
