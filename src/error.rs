//! Error taxonomy for the pipeline.
//!
//! Transport errors are retried forever with a fixed backoff, malformed
//! messages are dropped (and acknowledged), collaborator failures abandon the
//! current unit of work only, configuration errors are fatal at startup.

use crate::config::ConfigError;
use crate::stores::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("broker transport error: {0}")]
    Transport(String),
    #[error("malformed message on '{queue}': {source}")]
    Malformed {
        queue: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("collaborator failure: {0}")]
    Collaborator(#[from] StoreError),
    #[error("analysis failure: {0}")]
    Analysis(anyhow::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl PipelineError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    pub fn malformed(queue: &str, source: serde_json::Error) -> Self {
        Self::Malformed {
            queue: queue.to_string(),
            source,
        }
    }
}
