//! 文件上传、列表、下载与删除处理器。

use axum::Error as AxumError;
use axum::body::Body as AxumBody;
use axum::extract::{Extension, Query};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use chrono::Utc;
use futures_util::stream::StreamExt;
use http_body_util::BodyExt;
use httpdate::fmt_http_date;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::info;

use crate::atomic::AtomicFile;
use crate::config::DEFAULT_LOCK_WAIT_TIMEOUT_SECS;
use crate::error::ApiError;
use crate::locking::LockManager;
use crate::storage::{Storage, StoredFileEntry, extension_allowed};

/// 上传约束配置。
#[derive(Debug)]
pub struct UploadLimits {
    pub max_size: u64,
}

#[derive(Deserialize)]
pub(crate) struct NameQuery {
    name: String,
}

/// 列出已上传文件（按上传时间倒序）。
pub async fn list_files(
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<JsonResponse<Vec<StoredFileEntry>>, ApiError> {
    let entries = storage.list().await?;
    info!(count = entries.len(), "list files");
    Ok(JsonResponse(entries))
}

/// 上传文件：请求体直写存储目录并原子替换。
pub async fn upload_file(
    Query(NameQuery { name }): Query<NameQuery>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(lock_manager): Extension<Arc<LockManager>>,
    Extension(limits): Extension<Arc<UploadLimits>>,
    body: AxumBody,
) -> Result<Response, ApiError> {
    let original_name = name.trim().to_string();
    if original_name.is_empty() {
        return Err(ApiError::BadRequest("name is required".into()));
    }
    if !extension_allowed(&original_name) {
        return Err(ApiError::UnsupportedMediaType("file type not allowed".into()));
    }

    let uploaded_at = Utc::now();
    let stored_name = Storage::stored_name_for(&original_name, uploaded_at);
    let _guard = lock_manager
        .lock_name_with_timeout(
            &stored_name,
            Duration::from_secs(DEFAULT_LOCK_WAIT_TIMEOUT_SECS),
        )
        .await
        .map_err(|_| ApiError::Conflict("file busy".into()))?;
    let target = storage.resolve_stored(&stored_name)?;

    let mut atomic = AtomicFile::new(&target)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    let write_result: Result<u64, ApiError> = async {
        let mut written: u64 = 0;
        let mut data_stream = BodyExt::into_data_stream(body);
        while let Some(chunk) = data_stream.next().await {
            let chunk = chunk.map_err(|err: AxumError| ApiError::Internal(err.to_string()))?;
            if chunk.is_empty() {
                continue;
            }
            written += chunk.len() as u64;
            if limits.max_size > 0 && written > limits.max_size {
                return Err(ApiError::PayloadTooLarge("upload size exceeds limit".into()));
            }
            atomic
                .file_mut()
                .write_all(&chunk)
                .await
                .map_err(|err| ApiError::Internal(err.to_string()))?;
        }
        Ok(written)
    }
    .await;
    let size_bytes = match write_result {
        Ok(value) => value,
        Err(err) => {
            atomic.cleanup().await;
            return Err(err);
        }
    };
    atomic
        .finalize()
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;

    storage
        .record_upload(&stored_name, &original_name, uploaded_at)
        .await?;
    info!(stored_name, original_name, size_bytes, "upload complete");

    let entry = StoredFileEntry::new(stored_name, original_name, uploaded_at, size_bytes);
    Ok((StatusCode::CREATED, JsonResponse(entry)).into_response())
}

/// 下载文件：按原始文件名作为附件流式返回。
pub async fn download_file(
    Query(NameQuery { name }): Query<NameQuery>,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<Response, ApiError> {
    let (file, metadata, original_name) = storage.open_download(&name).await?;

    let mime = mime_guess::from_path(&original_name).first_or_octet_stream();
    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("无效的 MIME 类型".into()))?,
    );
    response_headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&metadata.len().to_string())
            .map_err(|_| ApiError::Internal("响应头构建失败".into()))?,
    );
    let disposition = format!(
        "attachment; filename=\"{}\"",
        sanitize_disposition_name(&original_name)
    );
    response_headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&disposition)
            .map_err(|_| ApiError::Internal("响应头构建失败".into()))?,
    );
    if let Ok(modified) = metadata.modified() {
        let value = fmt_http_date(modified);
        response_headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_str(&value)
                .map_err(|_| ApiError::Internal("响应头构建失败".into()))?,
        );
    }

    info!(stored_name = name, size = metadata.len(), "download file");
    let stream = ReaderStream::new(file);
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(stream),
    )
        .into_response())
}

/// 删除文件。
pub async fn delete_file(
    Query(NameQuery { name }): Query<NameQuery>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(lock_manager): Extension<Arc<LockManager>>,
) -> Result<StatusCode, ApiError> {
    let _guard = lock_manager
        .lock_name_with_timeout(&name, Duration::from_secs(DEFAULT_LOCK_WAIT_TIMEOUT_SECS))
        .await
        .map_err(|_| ApiError::Conflict("file busy".into()))?;
    storage.delete(&name).await?;
    info!(stored_name = name, "delete file");
    Ok(StatusCode::NO_CONTENT)
}

/// Content-Disposition 文件名只保留可安全内嵌的字符。
fn sanitize_disposition_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c == '"' || c == '\\' || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_UPLOAD_MAX_SIZE;
    use tempfile::tempdir;

    async fn make_storage() -> (tempfile::TempDir, Arc<Storage>) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("uploads");
        let storage = Storage::open(root).await.expect("open storage");
        (temp, Arc::new(storage))
    }

    fn make_limits() -> Arc<UploadLimits> {
        Arc::new(UploadLimits {
            max_size: DEFAULT_UPLOAD_MAX_SIZE,
        })
    }

    async fn upload(
        storage: Arc<Storage>,
        lock_manager: Arc<LockManager>,
        name: &str,
        body: &'static [u8],
    ) -> Result<Response, ApiError> {
        upload_file(
            Query(NameQuery {
                name: name.to_string(),
            }),
            Extension(storage),
            Extension(lock_manager),
            Extension(make_limits()),
            AxumBody::from(body),
        )
        .await
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("parse json")
    }

    #[tokio::test]
    async fn upload_rejects_traversal_name() {
        let (_temp, storage) = make_storage().await;
        let lock_manager = Arc::new(LockManager::new());
        let result = upload(storage, lock_manager, "../secret.txt", b"data").await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn upload_rejects_disallowed_extension() {
        let (_temp, storage) = make_storage().await;
        let lock_manager = Arc::new(LockManager::new());
        let result = upload(storage, lock_manager, "payload.exe", b"MZ").await;
        assert!(matches!(result, Err(ApiError::UnsupportedMediaType(_))));
    }

    #[tokio::test]
    async fn upload_enforces_size_limit() {
        let (_temp, storage) = make_storage().await;
        let lock_manager = Arc::new(LockManager::new());
        let result = upload_file(
            Query(NameQuery {
                name: "big.txt".to_string(),
            }),
            Extension(storage.clone()),
            Extension(lock_manager),
            Extension(Arc::new(UploadLimits { max_size: 4 })),
            AxumBody::from(&b"too large"[..]),
        )
        .await;
        assert!(matches!(result, Err(ApiError::PayloadTooLarge(_))));
        assert!(
            storage.list().await.expect("list").is_empty(),
            "rejected upload must not leave a stored file"
        );
    }

    #[tokio::test]
    async fn upload_then_list_round_trip() {
        let (_temp, storage) = make_storage().await;
        let lock_manager = Arc::new(LockManager::new());
        let response = upload(storage.clone(), lock_manager, "report.pdf", b"pdf bytes")
            .await
            .expect("upload");
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = response_json(response).await;
        assert_eq!(created["originalName"], "report.pdf");
        assert_eq!(created["sizeBytes"], 9);

        let JsonResponse(entries) = list_files(Extension(storage)).await.expect("list");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].original_name, "report.pdf");
        assert_eq!(entries[0].size_bytes, 9);
        assert_eq!(entries[0].size, "9.00 B");
        assert!(entries[0].stored_name.ends_with("_report.pdf"));
    }

    #[tokio::test]
    async fn upload_then_download_round_trip() {
        let (_temp, storage) = make_storage().await;
        let lock_manager = Arc::new(LockManager::new());
        let response = upload(storage.clone(), lock_manager, "notes.txt", b"hello world")
            .await
            .expect("upload");
        let created = response_json(response).await;
        let stored_name = created["storedName"].as_str().expect("stored name");

        let response = download_file(
            Query(NameQuery {
                name: stored_name.to_string(),
            }),
            Extension(storage),
        )
        .await
        .expect("download");
        assert_eq!(response.status(), StatusCode::OK);
        let disposition = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .expect("disposition header");
        assert_eq!(disposition, "attachment; filename=\"notes.txt\"");

        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        assert_eq!(&bytes[..], b"hello world");
    }

    #[tokio::test]
    async fn delete_then_list_shows_no_entry() {
        let (_temp, storage) = make_storage().await;
        let lock_manager = Arc::new(LockManager::new());
        let response = upload(
            storage.clone(),
            lock_manager.clone(),
            "old.csv",
            b"a,b,c",
        )
        .await
        .expect("upload");
        let created = response_json(response).await;
        let stored_name = created["storedName"].as_str().expect("stored name");

        let status = delete_file(
            Query(NameQuery {
                name: stored_name.to_string(),
            }),
            Extension(storage.clone()),
            Extension(lock_manager),
        )
        .await
        .expect("delete");
        assert_eq!(status, StatusCode::NO_CONTENT);

        let JsonResponse(entries) = list_files(Extension(storage)).await.expect("list");
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn delete_missing_file_returns_not_found() {
        let (_temp, storage) = make_storage().await;
        let lock_manager = Arc::new(LockManager::new());
        let result = delete_file(
            Query(NameQuery {
                name: "20240101_120000_nope.pdf".to_string(),
            }),
            Extension(storage),
            Extension(lock_manager),
        )
        .await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }
}
