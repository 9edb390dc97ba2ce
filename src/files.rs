//! 单文件的列表、上传、下载与删除处理器。

use axum::body::Body as AxumBody;
use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, Json, Multipart, Path};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use futures_util::TryStreamExt;
use httpdate::{fmt_http_date, parse_http_date};
use serde::{Deserialize, Serialize};
use std::io::{self, SeekFrom};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::http::{content_disposition, header_value};
use crate::response::ApiResponse;
use crate::storage::{Storage, StorageError, StoredFile};

const FILE_FIELD: &str = "file";

#[derive(Serialize)]
pub(crate) struct UploadedFile {
    filename: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadZipNotice {
    #[serde(default)]
    file_count: u64,
    #[serde(default)]
    message: String,
}

/// 列出共享目录中的文件。
pub async fn list_files(
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<JsonResponse<ApiResponse<Vec<StoredFile>>>, ApiError> {
    let entries = storage.list().await.map_err(|err| {
        warn!(error = %err, "list files failed");
        ApiError::Internal("Failed to read directory".into())
    })?;
    debug!(count = entries.len(), "list files");
    Ok(ApiResponse::ok("Files retrieved successfully", entries))
}

/// 上传单个文件，字段名为 `file`，文件名只保留 basename。
pub async fn upload_file(
    Extension(storage): Extension<Arc<Storage>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<JsonResponse<ApiResponse<UploadedFile>>, ApiError> {
    let mut multipart = multipart?;
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let Some(client_name) = field.file_name().map(str::to_string) else {
            continue;
        };

        let reader = StreamReader::new(field.map_err(io::Error::other));
        tokio::pin!(reader);
        let filename = storage
            .store(&client_name, &mut reader)
            .await
            .map_err(|err| match err {
                StorageError::InvalidName => ApiError::BadRequest("Invalid file name".into()),
                err => {
                    warn!(name = client_name, error = %err, "upload failed");
                    ApiError::Internal("Failed to save file".into())
                }
            })?;
        info!(filename, "file uploaded");
        return Ok(ApiResponse::ok(
            "File uploaded successfully",
            UploadedFile { filename },
        ));
    }
    Err(ApiError::BadRequest("Failed to get file".into()))
}

/// 客户端在打包上传前发送的通知，仅记录日志。
pub async fn upload_zip_notice(
    payload: Result<Json<UploadZipNotice>, JsonRejection>,
) -> Result<JsonResponse<ApiResponse<()>>, ApiError> {
    let Json(notice) = payload?;
    info!(
        file_count = notice.file_count,
        message = notice.message,
        "zip upload announced"
    );
    Ok(ApiResponse::done("Zip upload notification received"))
}

/// 下载单个文件，支持单段 Range 请求。
pub async fn download_file(
    Path(name): Path<String>,
    request_headers: HeaderMap,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<Response, ApiError> {
    let (target, metadata) = storage.resolve_file(&name).await?;
    let file_size = metadata.len();
    let modified = metadata.modified().ok();

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    response_headers.insert(header::CONTENT_DISPOSITION, content_disposition(&name)?);
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(value) = modified.map(fmt_http_date) {
        response_headers.insert(
            header::LAST_MODIFIED,
            header_value(&value)?,
        );
    }

    let if_range_matches = match request_headers
        .get(header::IF_RANGE)
        .and_then(|value| value.to_str().ok())
    {
        Some(value) => match parse_http_date(value) {
            Ok(date) => modified.map(|ts| ts <= date).unwrap_or(false),
            Err(_) => false,
        },
        None => true,
    };

    let range = if if_range_matches {
        parse_range(request_headers.get(header::RANGE), file_size)?
    } else {
        None
    };

    let file = File::open(&target)
        .await
        .map_err(|err| ApiError::from(StorageError::from(err)))?;

    if let Some((start, end)) = range {
        let length = end - start + 1;
        debug!(name, start, end, length, "download range request accepted");
        let mut file = file;
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|err| ApiError::from(StorageError::from(err)))?;
        let stream = ReaderStream::new(file.take(length));
        response_headers.insert(
            header::CONTENT_RANGE,
            header_value(&format!("bytes {}-{}/{}", start, end, file_size))?,
        );
        response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
        return Ok((
            StatusCode::PARTIAL_CONTENT,
            response_headers,
            AxumBody::from_stream(stream),
        )
            .into_response());
    }

    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(file_size));
    info!(name, size = file_size, "file downloaded");
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// 删除单个文件；文件不存在时返回 404。
pub async fn delete_file(
    Path(name): Path<String>,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<JsonResponse<ApiResponse<()>>, ApiError> {
    storage.delete(&name).await.map_err(|err| match err {
        StorageError::Io(err) if err.kind() != io::ErrorKind::NotFound => {
            warn!(name, error = %err, "delete failed");
            ApiError::Internal("Failed to delete file".into())
        }
        err => ApiError::from(err),
    })?;
    info!(name, "file deleted");
    Ok(ApiResponse::done("File deleted successfully"))
}

/// 解析 Range 头，返回可读取的范围。
fn parse_range(
    value: Option<&HeaderValue>,
    file_size: u64,
) -> Result<Option<(u64, u64)>, ApiError> {
    let Some(value) = value else {
        return Ok(None);
    };
    if file_size == 0 {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }
    let invalid = || ApiError::BadRequest("Invalid Range header".into());
    let value = value.to_str().map_err(|_| invalid())?;
    let range = value.strip_prefix("bytes=").ok_or_else(invalid)?;
    if range.contains(',') {
        return Err(ApiError::BadRequest("Multiple ranges not supported".into()));
    }

    let (start_part, end_part) = range.split_once('-').ok_or_else(invalid)?;
    let (start, end) = if start_part.is_empty() {
        let suffix: u64 = end_part.parse().map_err(|_| invalid())?;
        if suffix == 0 {
            return Ok(None);
        }
        (file_size.saturating_sub(suffix), file_size - 1)
    } else {
        let start: u64 = start_part.parse().map_err(|_| invalid())?;
        let end: u64 = if end_part.is_empty() {
            file_size - 1
        } else {
            end_part.parse().map_err(|_| invalid())?
        };
        (start, end.min(file_size - 1))
    };

    if start > end || start >= file_size {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }
    Ok(Some((start, end)))
}
