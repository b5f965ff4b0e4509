//! Local configuration: state file and version resolution.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use maestro_deployer::backend::MemoryBackend;
use maestro_id::Version;
use tokio::process::Command;

use crate::error::CliError;

/// Open the local backend at `path`. A missing file starts empty.
pub async fn open_backend(path: &Path) -> Result<Arc<MemoryBackend>> {
    let backend = MemoryBackend::open(path)
        .await
        .with_context(|| format!("Failed to load state from {:?}", path))?;
    Ok(Arc::new(backend))
}

/// Write the local backend back to its state file.
pub async fn save_backend(backend: &MemoryBackend) -> Result<()> {
    backend
        .persist()
        .await
        .context("Failed to save backend state")
}

/// The version to deploy: the flag if given, else the current git commit.
pub async fn resolve_version(flag: Option<Version>) -> Result<Version> {
    if let Some(version) = flag {
        return Ok(version);
    }

    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .await
        .map_err(|e| CliError::NoVersion(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(CliError::NoVersion(stderr).into());
    }

    let sha = String::from_utf8_lossy(&output.stdout);
    sha.trim()
        .parse()
        .map_err(|e: maestro_id::IdError| CliError::NoVersion(e.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_flag_wins() {
        let flag: Version = "39d7327".parse().unwrap();
        assert_eq!(resolve_version(Some(flag.clone())).await.unwrap(), flag);
    }

    #[tokio::test]
    async fn test_backend_round_trips_through_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let backend = MemoryBackend::open(&path).await.unwrap();
        backend
            .put_fleet(&"sfr-0123".parse().unwrap(), 3)
            .await;
        save_backend(&backend).await.unwrap();

        let reopened = open_backend(&path).await.unwrap();
        assert_eq!(
            reopened.target_capacity(&"sfr-0123".parse().unwrap()).await,
            Some(3)
        );
    }
}
