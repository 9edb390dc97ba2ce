//! 批量下载：把请求的文件直接以 zip 流写入响应，不落临时文件。

use axum::body::Body as AxumBody;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, Json};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::Local;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::io::{ReaderStream, SyncIoBridge};
use tracing::{debug, info};

use crate::archive::{ArchiveEntry, EntrySource, stream_archive, timestamped_name};
use crate::error::ApiError;
use crate::http::content_disposition;
use crate::storage::Storage;

/// 编码线程与响应之间的管道容量，也是下载路径的内存上限。
const PIPE_CAPACITY: usize = 256 * 1024;

#[derive(Deserialize)]
pub(crate) struct DownloadRequest {
    files: Vec<String>,
}

/// 批量下载协调器。
#[derive(Debug)]
pub struct BulkDownloader {
    storage: Arc<Storage>,
}

impl BulkDownloader {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// 按请求顺序检查文件，缺失或非普通文件直接跳过。
    pub async fn collect_entries(&self, names: &[String]) -> Vec<ArchiveEntry<PathBuf>> {
        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            match self.storage.resolve_file(name).await {
                Ok((path, _)) => entries.push(ArchiveEntry::new(name.clone(), path)),
                Err(err) => debug!(name, error = %err, "requested file skipped"),
            }
        }
        entries
    }

    /// 在阻塞线程中编码 zip，经由内存管道流式写入响应体。
    pub fn stream<S>(&self, entries: Vec<ArchiveEntry<S>>) -> AxumBody
    where
        S: EntrySource + Send + 'static,
    {
        spawn_archive(entries).0
    }

    pub async fn handle(&self, names: &[String]) -> AxumBody {
        let entries = self.collect_entries(names).await;
        info!(
            requested = names.len(),
            found = entries.len(),
            "bulk download"
        );
        self.stream(entries)
    }
}

/// 客户端断开后管道写入失败，编码随之结束；源中途失败时归档停在上一个完整成员之后。
fn spawn_archive<S>(entries: Vec<ArchiveEntry<S>>) -> (AxumBody, JoinHandle<()>)
where
    S: EntrySource + Send + 'static,
{
    let (reader, writer) = tokio::io::duplex(PIPE_CAPACITY);
    let sink = SyncIoBridge::new(writer);
    let task = tokio::task::spawn_blocking(move || match stream_archive(entries, sink) {
        Ok(outcome) => debug!(
            written = outcome.written,
            skipped = outcome.skipped.len(),
            "bulk download archive finished"
        ),
        Err(err) => debug!(error = %err, "bulk download archive aborted"),
    });
    (AxumBody::from_stream(ReaderStream::new(reader)), task)
}

/// 批量下载处理器：请求体为 `{"files": [...]}`。
pub async fn download_multiple(
    Extension(downloader): Extension<Arc<BulkDownloader>>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(DownloadRequest { files }) = payload?;
    if files.is_empty() {
        return Err(ApiError::BadRequest("No files specified".into()));
    }

    let filename = timestamped_name("download", Local::now());
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/zip"),
    );
    headers.insert(header::CONTENT_DISPOSITION, content_disposition(&filename)?);

    let body = downloader.handle(&files).await;
    Ok((StatusCode::OK, headers, body).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::test_support::{
        TestSource, closed_members, has_end_record, noise, read_members as members,
    };
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tempfile::tempdir;

    fn make_storage() -> (tempfile::TempDir, Arc<Storage>) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("storage");
        std::fs::create_dir_all(&root).expect("create storage root");
        (temp, Arc::new(Storage::new(root)))
    }

    async fn read_body(body: AxumBody) -> Vec<u8> {
        body.collect().await.expect("collect body").to_bytes().to_vec()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_names_are_skipped() {
        let (_temp, storage) = make_storage();
        std::fs::write(storage.root_path().join("present.txt"), b"here").expect("seed");
        let downloader = BulkDownloader::new(storage);

        let names = vec!["missing.txt".to_string(), "present.txt".to_string()];
        let bytes = read_body(downloader.handle(&names).await).await;

        assert_eq!(
            members(bytes),
            vec![("present.txt".to_string(), b"here".to_vec())]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn members_follow_request_order() {
        let (_temp, storage) = make_storage();
        let root = storage.root_path();
        std::fs::write(root.join("b"), b"bee").expect("seed b");
        std::fs::write(root.join("a"), b"ay").expect("seed a");
        let downloader = BulkDownloader::new(storage);

        let names = vec!["b".to_string(), "a".to_string()];
        let bytes = read_body(downloader.handle(&names).await).await;

        assert_eq!(
            members(bytes),
            vec![
                ("b".to_string(), b"bee".to_vec()),
                ("a".to_string(), b"ay".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn traversal_and_directory_names_are_not_collected() {
        let (temp, storage) = make_storage();
        std::fs::write(temp.path().join("secret.txt"), b"secret").expect("seed outside");
        std::fs::create_dir(storage.root_path().join("nested")).expect("seed dir");
        let downloader = BulkDownloader::new(storage);

        let names = vec!["../secret.txt".to_string(), "nested".to_string()];
        assert!(downloader.collect_entries(&names).await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn large_member_streams_through_the_pipe() {
        let (_temp, storage) = make_storage();
        let content: Vec<u8> = (0..PIPE_CAPACITY * 3).map(|i| (i % 251) as u8).collect();
        std::fs::write(storage.root_path().join("big.bin"), &content).expect("seed big");
        let downloader = BulkDownloader::new(storage);

        let bytes = read_body(downloader.handle(&["big.bin".to_string()]).await).await;

        assert_eq!(members(bytes), vec![("big.bin".to_string(), content)]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn source_failure_keeps_closed_members_only() {
        let (_temp, storage) = make_storage();
        let downloader = BulkDownloader::new(storage);

        let body = downloader.stream(vec![
            ArchiveEntry::new("ok", TestSource::Bytes(b"hello")),
            ArchiveEntry::new("broken", TestSource::BrokenAfter(noise(300 * 1024))),
            ArchiveEntry::new("after", TestSource::Bytes(b"after")),
        ]);
        let bytes = read_body(body).await;
        assert!(!has_end_record(&bytes));

        let mut complete = Vec::new();
        stream_archive(
            vec![ArchiveEntry::new("ok", TestSource::Bytes(b"hello"))],
            &mut complete,
        )
        .expect("stream archive");
        assert_eq!(
            closed_members(&bytes, &complete),
            vec![("ok".to_string(), b"hello".to_vec())]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dropped_body_ends_the_archive_task() {
        let (_temp, storage) = make_storage();
        std::fs::write(
            storage.root_path().join("big.bin"),
            noise(PIPE_CAPACITY * 16),
        )
        .expect("seed big");
        let downloader = BulkDownloader::new(storage);
        let entries = downloader.collect_entries(&["big.bin".to_string()]).await;

        let (mut body, task) = spawn_archive(entries);
        body.frame()
            .await
            .expect("first frame")
            .expect("frame data");
        drop(body);

        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("archive task still running after disconnect")
            .expect("archive task panicked");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn handler_sets_zip_headers() {
        let (_temp, storage) = make_storage();
        std::fs::write(storage.root_path().join("a.txt"), b"a").expect("seed");
        let downloader = Arc::new(BulkDownloader::new(storage));

        let response = download_multiple(
            Extension(downloader),
            Ok(Json(DownloadRequest {
                files: vec!["a.txt".to_string()],
            })),
        )
        .await
        .expect("download response");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE),
            Some(&HeaderValue::from_static("application/zip"))
        );
        let disposition = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .expect("content disposition");
        assert!(disposition.starts_with("attachment; filename=\"download_"));
        let bytes = read_body(response.into_body()).await;
        assert_eq!(members(bytes).len(), 1);
    }

    #[tokio::test]
    async fn handler_rejects_empty_list() {
        let (_temp, storage) = make_storage();
        let downloader = Arc::new(BulkDownloader::new(storage));

        let result = download_multiple(
            Extension(downloader),
            Ok(Json(DownloadRequest { files: Vec::new() })),
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }
}
