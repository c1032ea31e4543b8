//! Member data on the persistent volume

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use super::BootstrapError;

/// Local member data
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LocalState: Send + Sync {
    /// Returns true if etcd has already initialized a member here
    async fn is_initialized(&self) -> Result<bool, BootstrapError>;

    /// Remove all member data so a later scale-up starts clean
    async fn purge(&self) -> Result<(), BootstrapError>;
}

/// The etcd volume and the data directory inside it
#[derive(Clone, Debug)]
pub struct DataDir {
    volume_dir: PathBuf,
    data_dir: PathBuf,
}

impl DataDir {
    /// `data_dir` is normally a child of `volume_dir`
    pub fn new(volume_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            volume_dir: volume_dir.into(),
            data_dir: data_dir.into(),
        }
    }
}

#[async_trait]
impl LocalState for DataDir {
    async fn is_initialized(&self) -> Result<bool, BootstrapError> {
        Ok(tokio::fs::try_exists(self.data_dir.join("member")).await?)
    }

    /// Empties the volume; the mount point itself stays
    async fn purge(&self) -> Result<(), BootstrapError> {
        let mut entries = match tokio::fs::read_dir(&self.volume_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                tokio::fs::remove_file(&path).await?;
            }
            debug!(path = %path.display(), "removed");
        }

        info!(volume = %self.volume_dir.display(), "member data purged");
        Ok(())
    }
}
