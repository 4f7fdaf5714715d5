//! Resource file I/O for task ports.

use std::path::Path;

use crate::error::TrainerError;

pub async fn read_blob(path: &Path) -> Result<Vec<u8>, TrainerError> {
    tokio::fs::read(path).await.map_err(|source| TrainerError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Write `bytes` to `path`, creating parent directories as needed.
pub async fn write_blob(path: &Path, bytes: &[u8]) -> Result<(), TrainerError> {
    let io_error = |source| TrainerError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
    }
    tokio::fs::write(path, bytes).await.map_err(io_error)
}
