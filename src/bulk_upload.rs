//! 批量上传：接收多个文件分片，按数量阈值逐个落盘或整体打包为 zip。

use axum::extract::multipart::{Field, MultipartRejection};
use axum::extract::{Extension, Multipart};
use axum::response::Json as JsonResponse;
use chrono::Local;
use serde::Serialize;
use std::io;
use std::sync::Arc;
use std::time::SystemTime;
use tempfile::{NamedTempFile, TempPath};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use crate::archive::{ArchiveEntry, EntrySource, OpenedEntry, timestamped_name, write_archive};
use crate::atomic::AtomicFile;
use crate::error::ApiError;
use crate::response::ApiResponse;
use crate::storage::{Storage, StorageError, sanitize_name};

const FILES_FIELD: &str = "files";

/// 一个已接收的上传分片，内容暂存在临时文件中。
///
/// 只保留路径不保留句柄，分片再多也不会占满文件描述符；drop 时删除临时文件。
pub struct UploadedPart {
    pub name: String,
    pub size: u64,
    content: TempPath,
}

impl UploadedPart {
    /// 将 multipart 字段完整写入临时文件。
    pub async fn spool(name: String, mut field: Field<'_>) -> Result<Self, ApiError> {
        let content = NamedTempFile::new()
            .map_err(|err| spool_failed(&name, &err))?
            .into_temp_path();
        let mut file = OpenOptions::new()
            .write(true)
            .open(&content)
            .await
            .map_err(|err| spool_failed(&name, &err))?;
        let mut size = 0u64;
        while let Some(chunk) = field.chunk().await? {
            file.write_all(&chunk)
                .await
                .map_err(|err| spool_failed(&name, &err))?;
            size += chunk.len() as u64;
        }
        file.flush().await.map_err(|err| spool_failed(&name, &err))?;
        Ok(Self {
            name,
            size,
            content,
        })
    }

    #[cfg(test)]
    pub fn from_bytes(name: &str, bytes: &[u8]) -> io::Result<Self> {
        let content = NamedTempFile::new()?.into_temp_path();
        std::fs::write(&content, bytes)?;
        Ok(Self {
            name: name.to_string(),
            size: bytes.len() as u64,
            content,
        })
    }

    fn reader(&self) -> io::Result<std::fs::File> {
        std::fs::File::open(&self.content)
    }
}

fn spool_failed(name: &str, err: &io::Error) -> ApiError {
    error!(name, error = %err, "failed to spool uploaded part");
    ApiError::Internal("Failed to receive file".into())
}

impl EntrySource for UploadedPart {
    type Reader = std::fs::File;

    fn open(&self) -> io::Result<OpenedEntry<Self::Reader>> {
        let reader = self.reader()?;
        let modified = reader
            .metadata()
            .and_then(|metadata| metadata.modified())
            .unwrap_or_else(|_| SystemTime::now());
        Ok(OpenedEntry {
            reader,
            size: self.size,
            modified: Some(modified),
        })
    }
}

/// 读取 multipart 请求中所有名为 `field_name` 的文件字段。
pub async fn collect_parts(
    multipart: &mut Multipart,
    field_name: &str,
) -> Result<Vec<UploadedPart>, ApiError> {
    let mut parts = Vec::new();
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(field_name) {
            continue;
        }
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        parts.push(UploadedPart::spool(file_name, field).await?);
    }
    Ok(parts)
}

#[derive(Debug, Serialize)]
pub struct BulkResult {
    pub uploaded: usize,
    pub total: usize,
    pub failed: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveSummary {
    pub filename: String,
    pub file_count: usize,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum BulkOutcome {
    Stored(BulkResult),
    Archived(ArchiveSummary),
}

impl BulkOutcome {
    fn message(&self) -> String {
        match self {
            BulkOutcome::Stored(result) => format!(
                "Uploaded {}/{} files successfully",
                result.uploaded, result.total
            ),
            BulkOutcome::Archived(summary) => {
                format!("Files compressed into {}", summary.filename)
            }
        }
    }
}

/// 批量上传协调器，阈值在构造时固定。
#[derive(Debug)]
pub struct BulkUploader {
    storage: Arc<Storage>,
    threshold: usize,
}

impl BulkUploader {
    pub fn new(storage: Arc<Storage>, threshold: usize) -> Self {
        Self { storage, threshold }
    }

    /// 数量超过阈值时整体打包，否则逐个保存；决定只做一次。
    pub async fn handle(&self, parts: Vec<UploadedPart>) -> Result<BulkOutcome, ApiError> {
        if parts.len() > self.threshold {
            return self.archive_parts(parts).await.map(BulkOutcome::Archived);
        }
        Ok(BulkOutcome::Stored(self.store_parts(&parts).await))
    }

    async fn store_parts(&self, parts: &[UploadedPart]) -> BulkResult {
        let mut result = BulkResult {
            uploaded: 0,
            total: parts.len(),
            failed: Vec::new(),
        };
        for part in parts {
            match self.store_part(part).await {
                Ok(name) => {
                    info!(name, size = part.size, "uploaded");
                    result.uploaded += 1;
                }
                Err(err) => {
                    warn!(name = part.name, error = %err, "bulk upload item failed");
                    result.failed.push(part.name.clone());
                }
            }
        }
        result
    }

    async fn store_part(&self, part: &UploadedPart) -> Result<String, StorageError> {
        let mut source = File::from_std(part.reader()?);
        self.storage.store(&part.name, &mut source).await
    }

    async fn archive_parts(&self, parts: Vec<UploadedPart>) -> Result<ArchiveSummary, ApiError> {
        let file_count = parts.len();
        let filename = timestamped_name("bulk", Local::now());
        let (filename, target) = self.storage.destination(&filename)?;
        info!(
            file_count,
            threshold = self.threshold,
            filename,
            "file count over threshold, creating zip archive"
        );

        let create_failed = |err: &dyn std::fmt::Display| {
            error!(filename, error = %err, "bulk archive failed");
            ApiError::Internal("Failed to create zip archive".into())
        };
        let mut atomic = AtomicFile::new(&target)
            .await
            .map_err(|err| create_failed(&err))?;
        let sink = match atomic.file_mut().try_clone().await {
            Ok(file) => file.into_std().await,
            Err(err) => {
                atomic.cleanup().await;
                return Err(create_failed(&err));
            }
        };

        let entries = archive_entries(parts);
        let written = tokio::task::spawn_blocking(move || write_archive(entries, sink)).await;
        let outcome = match written {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                atomic.cleanup().await;
                return Err(create_failed(&err));
            }
            Err(err) => {
                atomic.cleanup().await;
                return Err(create_failed(&err));
            }
        };
        atomic.finalize().await.map_err(|err| create_failed(&err))?;

        info!(
            filename,
            written = outcome.written,
            skipped = outcome.skipped.len(),
            "zip archive created"
        );
        Ok(ArchiveSummary {
            filename,
            file_count,
        })
    }
}

/// 打包时成员名与落盘文件名一样取 basename。
fn archive_entries(parts: Vec<UploadedPart>) -> Vec<ArchiveEntry<UploadedPart>> {
    parts
        .into_iter()
        .filter_map(|part| match sanitize_name(&part.name) {
            Some(name) => Some(ArchiveEntry::new(name, part)),
            None => {
                warn!(name = part.name, "invalid file name, left out of archive");
                None
            }
        })
        .collect()
}

/// 批量上传处理器：字段 `files` 可重复。
pub async fn upload_multiple(
    Extension(uploader): Extension<Arc<BulkUploader>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<JsonResponse<ApiResponse<BulkOutcome>>, ApiError> {
    let mut multipart = multipart?;
    let parts = collect_parts(&mut multipart, FILES_FIELD).await?;
    if parts.is_empty() {
        return Err(ApiError::BadRequest("No files uploaded".into()));
    }

    let outcome = uploader.handle(parts).await?;
    let message = outcome.message();
    Ok(ApiResponse::ok(message, outcome))
}
