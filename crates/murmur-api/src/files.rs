use std::path::{Path, PathBuf};

use axum::{
    Extension, Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use tokio::io::AsyncWriteExt;
use tracing::{error, info};
use uuid::Uuid;

use murmur_core::Identity;
use murmur_types::api::UploadResponse;

use crate::state::AppState;

/// 50 MB upload limit for files
pub const MAX_FILE_SIZE: usize = 50 * 1024 * 1024;

/// Public prefix stored files are served under.
pub const UPLOADS_PREFIX: &str = "/uploads";

const FILE_NAME_HEADER: &str = "x-file-name";

/// Files on local disk, addressed by generated name.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store `bytes` under a fresh name that keeps the original extension.
    pub async fn save(&self, bytes: &[u8], original_name: &str, mime_type: &str) -> std::io::Result<UploadResponse> {
        tokio::fs::create_dir_all(&self.root).await?;

        let stored_name = format!("{}{}", Uuid::new_v4(), extension_of(original_name));
        let file_path = self.root.join(&stored_name);
        let mut file = tokio::fs::File::create(&file_path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;

        Ok(UploadResponse {
            url: format!("{}/{}", UPLOADS_PREFIX, stored_name),
            name: original_name.to_string(),
            size: bytes.len() as u64,
            mime_type: mime_type.to_string(),
        })
    }
}

/// `.ext` of a file name, limited to a short alphanumeric suffix.
fn extension_of(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.len() <= 10 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default()
}

/// POST /upload: raw bytes with `Content-Type` and `X-File-Name`.
/// Returns the descriptor a message attachment is built from.
pub async fn upload_file(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    headers: HeaderMap,
    bytes: Bytes,
) -> Result<impl IntoResponse, StatusCode> {
    if bytes.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    if bytes.len() > MAX_FILE_SIZE {
        return Err(StatusCode::PAYLOAD_TOO_LARGE);
    }

    let mime_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream");
    let name = headers
        .get(FILE_NAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or("file");

    let uploaded = state.uploads.save(&bytes, name, mime_type).await.map_err(|e| {
        error!("Failed to store upload in {}: {}", state.uploads.root().display(), e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    info!("{} uploaded {} ({} bytes) as {}", identity.user_id, uploaded.name, uploaded.size, uploaded.url);

    Ok((StatusCode::CREATED, Json(uploaded)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_are_kept_when_sane() {
        assert_eq!(extension_of("photo.PNG"), ".png");
        assert_eq!(extension_of("archive.tar.gz"), ".gz");
        assert_eq!(extension_of("README"), "");
        assert_eq!(extension_of("x.../../etc"), "");
    }

    #[tokio::test]
    async fn save_writes_the_bytes() {
        let root = std::env::temp_dir().join(format!("murmur-blobs-{}", Uuid::new_v4()));
        let store = BlobStore::new(&root);

        let uploaded = store.save(b"hello", "note.txt", "text/plain").await.unwrap();
        assert!(uploaded.url.starts_with("/uploads/"));
        assert!(uploaded.url.ends_with(".txt"));
        assert_eq!(uploaded.size, 5);

        let stored = root.join(uploaded.url.trim_start_matches("/uploads/"));
        assert_eq!(tokio::fs::read(&stored).await.unwrap(), b"hello");
        tokio::fs::remove_dir_all(&root).await.unwrap();
    }
}
