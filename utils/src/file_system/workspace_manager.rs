use std::{
    io,
    path::{Path, PathBuf},
};

use log::{debug, warn};
use thiserror::Error;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MoveSummary {
    pub files_moved: usize,
}

#[derive(Debug, Error)]
#[error("Moving {failed_path:?} failed after {} files: {source}", .moved.files_moved)]
pub struct MoveInterrupted {
    pub moved: MoveSummary,
    pub failed_path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Owns one directory tree on the host.
pub struct WorkspaceManager {
    root_dir: PathBuf,
}

impl WorkspaceManager {
    pub async fn new(path: PathBuf) -> Result<Self, io::Error> {
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self { root_dir: path })
    }

    /// Moves every file below the workspace into `destination`, merging with
    /// whatever is already there. Files present on both sides are replaced by
    /// the workspace's copy, so an interrupted move can simply be repeated.
    pub async fn move_contents_to(&self, destination: &Path) -> Result<MoveSummary, MoveInterrupted> {
        let mut summary = MoveSummary::default();
        if destination.starts_with(&self.root_dir) {
            return Err(MoveInterrupted {
                moved: summary,
                failed_path: destination.to_path_buf(),
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "destination is inside the moved directory",
                ),
            });
        }

        let mut pending = vec![(self.root_dir.clone(), destination.to_path_buf())];
        let mut visited = vec![];
        while let Some((source_dir, destination_dir)) = pending.pop() {
            let interrupted = |source: io::Error, path: &Path, summary: MoveSummary| MoveInterrupted {
                moved: summary,
                failed_path: path.to_path_buf(),
                source,
            };
            tokio::fs::create_dir_all(&destination_dir)
                .await
                .map_err(|err| interrupted(err, &destination_dir, summary))?;

            let mut read_dir = tokio::fs::read_dir(&source_dir)
                .await
                .map_err(|err| interrupted(err, &source_dir, summary))?;
            while let Some(entry) = read_dir
                .next_entry()
                .await
                .map_err(|err| interrupted(err, &source_dir, summary))?
            {
                let source_path = entry.path();
                let destination_path = destination_dir.join(entry.file_name());
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|err| interrupted(err, &source_path, summary))?;
                if file_type.is_dir() {
                    pending.push((source_path, destination_path));
                } else {
                    Self::move_file(&source_path, &destination_path)
                        .await
                        .map_err(|err| interrupted(err, &source_path, summary))?;
                    summary.files_moved += 1;
                }
            }
            visited.push(source_dir);
        }

        for directory in visited.iter().rev() {
            if let Err(err) = tokio::fs::remove_dir(directory).await {
                warn!("Can't remove emptied directory {:?}: {}", directory, err);
            }
        }
        debug!(
            "Moved {:?} to {:?}: {:?}",
            self.root_dir, destination, summary
        );
        Ok(summary)
    }

    async fn move_file(source: &Path, destination: &Path) -> Result<(), io::Error> {
        if tokio::fs::rename(source, destination).await.is_ok() {
            return Ok(());
        }
        // Different file systems: copy under a temporary name, then publish.
        let mut partial_name = destination.file_name().unwrap_or_default().to_os_string();
        partial_name.push(".partial");
        let partial = destination.with_file_name(partial_name);
        tokio::fs::copy(source, &partial).await?;
        if tokio::fs::try_exists(destination).await? {
            tokio::fs::remove_file(destination).await?;
        }
        tokio::fs::rename(&partial, destination).await?;
        tokio::fs::remove_file(source).await
    }
}
