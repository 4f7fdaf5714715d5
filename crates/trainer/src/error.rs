use std::path::PathBuf;

use hpc_dispatch::JobError;

#[derive(Debug, thiserror::Error)]
pub enum TrainerError {
    /// No file path was supplied for a required port.
    #[error("no file given for port '{0}'")]
    MissingPort(String),

    #[error("failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid training settings: {0}")]
    Settings(#[from] validator::ValidationErrors),

    #[error(transparent)]
    Job(#[from] JobError),
}
