use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncRead;

use crate::atomic::{AtomicFile, is_temp_name};

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub fn destination(&self, client_name: &str) -> Result<(String, PathBuf), StorageError> {
        let name = sanitize_name(client_name).ok_or(StorageError::InvalidName)?;
        let path = self.root.join(&name);
        Ok((name, path))
    }

    pub async fn resolve_file(&self, name: &str) -> Result<(PathBuf, Metadata), StorageError> {
        if !is_plain_name(name) {
            return Err(StorageError::InvalidName);
        }
        let path = self.root.join(name);
        let metadata = fs::symlink_metadata(&path).await?;
        if metadata.file_type().is_symlink() {
            return Err(StorageError::InvalidName);
        }
        if !metadata.is_file() {
            return Err(StorageError::NotAFile);
        }
        Ok((path, metadata))
    }

    pub async fn store<R>(&self, client_name: &str, source: &mut R) -> Result<String, StorageError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let (name, target) = self.destination(client_name)?;
        let mut atomic = AtomicFile::new(&target).await?;
        if let Err(err) = tokio::io::copy(source, atomic.file_mut()).await {
            atomic.cleanup().await;
            return Err(err.into());
        }
        atomic.finalize().await?;
        Ok(name)
    }

    pub async fn list(&self) -> Result<Vec<StoredFile>, StorageError> {
        let mut dir = fs::read_dir(&self.root).await?;
        let mut entries = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if is_temp_name(&name) {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            let modified_time = metadata
                .modified()
                .ok()
                .map(|ts| DateTime::<Utc>::from(ts).to_rfc3339_opts(SecondsFormat::Secs, true));

            entries.push(StoredFile {
                name,
                size: metadata.len(),
                modified_time,
                is_dir: metadata.is_dir(),
            });
        }

        entries.sort_by(|a, b| match (a.is_dir, b.is_dir) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        });

        Ok(entries)
    }

    pub async fn delete(&self, name: &str) -> Result<(), StorageError> {
        let (path, _) = self.resolve_file(name).await?;
        fs::remove_file(path).await?;
        Ok(())
    }
}

pub fn sanitize_name(raw: &str) -> Option<String> {
    let segment = raw
        .rsplit(['/', '\\'])
        .find(|segment| !segment.trim().is_empty())?;
    match segment {
        "." | ".." => None,
        name if name.contains('\0') => None,
        name => Some(name.to_string()),
    }
}

pub fn is_plain_name(name: &str) -> bool {
    sanitize_name(name).as_deref() == Some(name)
}

#[derive(Debug)]
pub enum StorageError {
    InvalidName,
    NotAFile,
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::InvalidName => f.write_str("invalid file name"),
            StorageError::NotAFile => f.write_str("not a regular file"),
            StorageError::Io(err) => write!(f, "{err}"),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    pub name: String,
    pub size: u64,
    pub modified_time: Option<String>,
    pub is_dir: bool,
}
