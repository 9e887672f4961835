//! Log storage using files on disk.
//!
//! Every namespace is a directory under the root and every entry is a file
//! named after its zero-padded index, so a directory listing sorts in index
//! order. Writes go to a temporary file first and are renamed into place.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use proven_storage::{LogStorage, LogStorageWithDelete, StorageNamespace, StorageResult};
use tokio::fs;
use tokio::io::{self, AsyncWriteExt};
use tracing::debug;

const ENTRY_EXTENSION: &str = "entry";
const TEMP_EXTENSION: &str = "tmp";

/// Log storage using files on disk.
#[derive(Clone, Debug)]
pub struct FsStorage {
    dir: PathBuf,
}

impl FsStorage {
    /// Creates a new `FsStorage` rooted at the specified directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn namespace_dir(&self, namespace: &StorageNamespace) -> Result<PathBuf, Error> {
        let name = namespace.as_str();
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains(['/', '\\'])
            || name.contains('\0')
        {
            return Err(Error::InvalidNamespace(name.to_string()));
        }

        Ok(self.dir.join(name))
    }

    fn entry_path(dir: &Path, index: u64) -> PathBuf {
        dir.join(format!("{index:020}.{ENTRY_EXTENSION}"))
    }

    fn parse_index(path: &Path) -> Result<Option<u64>, Error> {
        if path.extension().and_then(|ext| ext.to_str()) != Some(ENTRY_EXTENSION) {
            return Ok(None);
        }

        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| Error::InvalidEntryName(path.display().to_string()))?;

        stem.parse::<u64>()
            .map(Some)
            .map_err(|_| Error::InvalidEntryName(path.display().to_string()))
    }

    /// Lists entry indices in ascending order. A missing directory is an empty log.
    async fn indices(dir: &Path) -> Result<Vec<u64>, Error> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io("error reading directory", e)),
        };

        let mut indices = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Io("error reading directory entry", e))?
        {
            if let Some(index) = Self::parse_index(&entry.path())? {
                indices.push(index);
            }
        }

        indices.sort_unstable();
        Ok(indices)
    }

    async fn write_entry(dir: &Path, index: u64, data: &[u8]) -> Result<(), Error> {
        let path = Self::entry_path(dir, index);
        let temp = path.with_extension(TEMP_EXTENSION);

        let mut file = fs::File::create(&temp)
            .await
            .map_err(|e| Error::Io("error creating file", e))?;
        file.write_all(data)
            .await
            .map_err(|e| Error::Io("error writing file", e))?;
        file.sync_data()
            .await
            .map_err(|e| Error::Io("error syncing file", e))?;
        drop(file);

        fs::rename(&temp, &path)
            .await
            .map_err(|e| Error::Io("error renaming file", e))
    }

    async fn remove_entry(dir: &Path, index: u64) -> Result<bool, Error> {
        match fs::remove_file(Self::entry_path(dir, index)).await {
            Ok(()) => Ok(true),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Io("error deleting file", e)),
        }
    }
}

#[async_trait]
impl LogStorage for FsStorage {
    async fn append(
        &self,
        namespace: &StorageNamespace,
        entries: Vec<(u64, Bytes)>,
    ) -> StorageResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let dir = self.namespace_dir(namespace)?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Io("error creating directory", e))?;

        for (index, data) in entries {
            Self::write_entry(&dir, index, &data).await?;
        }

        Ok(())
    }

    async fn bounds(&self, namespace: &StorageNamespace) -> StorageResult<Option<(u64, u64)>> {
        let indices = Self::indices(&self.namespace_dir(namespace)?).await?;

        Ok(indices.first().copied().zip(indices.last().copied()))
    }

    async fn compact_before(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<()> {
        let dir = self.namespace_dir(namespace)?;

        for existing in Self::indices(&dir).await? {
            if existing > index {
                break;
            }
            Self::remove_entry(&dir, existing).await?;
        }

        Ok(())
    }

    async fn read_range(
        &self,
        namespace: &StorageNamespace,
        start: u64,
        end: u64,
    ) -> StorageResult<Vec<(u64, Bytes)>> {
        let dir = self.namespace_dir(namespace)?;
        let mut entries = Vec::new();

        for index in Self::indices(&dir).await? {
            if index < start {
                continue;
            }
            if index >= end {
                break;
            }

            match fs::read(Self::entry_path(&dir, index)).await {
                Ok(data) => entries.push((index, Bytes::from(data))),
                // Deleted between listing and reading.
                Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io("error reading file", e).into()),
            }
        }

        Ok(entries)
    }

    async fn remove_namespace(&self, namespace: &StorageNamespace) -> StorageResult<()> {
        let dir = self.namespace_dir(namespace)?;

        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!("Removed namespace directory {}", dir.display());
                Ok(())
            }
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io("error removing directory", e).into()),
        }
    }
}

#[async_trait]
impl LogStorageWithDelete for FsStorage {
    async fn delete_entry(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<bool> {
        let dir = self.namespace_dir(namespace)?;
        Ok(Self::remove_entry(&dir, index).await?)
    }
}
