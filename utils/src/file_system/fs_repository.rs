use std::path::{Path, PathBuf};

use log::debug;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncWriteExt},
};

#[derive(Debug, Error)]
pub enum FileRepositoryError {
    #[error("Can't create repository file: {0}")]
    CreationFail(#[source] std::io::Error),
    #[error("Failed to save file: {0}")]
    SaveFail(String),
    #[error("Failed to read file: {0}")]
    ReadFail(String),
}

/// Keeps a serializable value mirrored in a YAML file.
///
/// Saves never leave a half-written file behind: the data is written next to
/// the target, synced and then renamed over it.
pub struct FileRepository<Struct: Serialize + DeserializeOwned> {
    data: Struct,
    path: PathBuf,
}

impl<Struct: Serialize + DeserializeOwned> FileRepository<Struct> {
    pub async fn new(data: Struct, path: &Path) -> Result<Self, FileRepositoryError> {
        Self::write_atomically(path, &data).await?;
        Ok(Self {
            data,
            path: path.to_path_buf(),
        })
    }

    pub async fn from_file_path(path: &Path) -> Result<Self, FileRepositoryError> {
        FileRepository::<Struct>::try_read_file(path)
            .await
            .map(|data| Self {
                data,
                path: path.to_path_buf(),
            })
    }

    pub async fn open_or_create(
        default: impl FnOnce() -> Struct,
        path: &Path,
    ) -> Result<Self, FileRepositoryError> {
        if tokio::fs::try_exists(path)
            .await
            .map_err(|err| FileRepositoryError::ReadFail(err.to_string()))?
        {
            Self::from_file_path(path).await
        } else {
            debug!("Creating repository file: {:?}", path);
            Self::new(default(), path).await
        }
    }

    /// Persists `data` and only then makes it the in-memory value.
    pub async fn commit(&mut self, data: Struct) -> Result<(), FileRepositoryError> {
        Self::write_atomically(&self.path, &data).await?;
        self.data = data;
        Ok(())
    }

    pub fn get(&self) -> &Struct {
        &self.data
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_atomically(path: &Path, data: &Struct) -> Result<(), FileRepositoryError> {
        let yaml_data = serde_yaml::to_string(data)
            .map_err(|err| FileRepositoryError::SaveFail(err.to_string()))?;
        let temp_path = Self::temp_path(path);
        let mut file = File::create(&temp_path)
            .await
            .map_err(FileRepositoryError::CreationFail)?;
        file.write_all(yaml_data.as_bytes())
            .await
            .map_err(|err| FileRepositoryError::SaveFail(err.to_string()))?;
        file.flush()
            .await
            .map_err(|err| FileRepositoryError::SaveFail(err.to_string()))?;
        file.sync_all()
            .await
            .map_err(|err| FileRepositoryError::SaveFail(err.to_string()))?;
        drop(file);
        tokio::fs::rename(&temp_path, path)
            .await
            .map_err(|err| FileRepositoryError::SaveFail(err.to_string()))
    }

    fn temp_path(path: &Path) -> PathBuf {
        let mut file_name = path.file_name().unwrap_or_default().to_os_string();
        file_name.push(".tmp");
        path.with_file_name(file_name)
    }

    async fn try_read_file(path: &Path) -> Result<Struct, FileRepositoryError> {
        let mut file = File::open(path)
            .await
            .map_err(|err| FileRepositoryError::ReadFail(err.to_string()))?;
        let mut buf = String::new();
        let _ = file
            .read_to_string(&mut buf)
            .await
            .map_err(|err| FileRepositoryError::ReadFail(err.to_string()))?;
        serde_yaml::from_str(&buf).map_err(|err| FileRepositoryError::ReadFail(err.to_string()))
    }
}
