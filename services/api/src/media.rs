//! Multi-category upload storage and image retrieval.
//!
//! Uploads stream to a per-category directory under the configured root,
//! renamed to a fresh uuid while keeping the original extension. Images and
//! videos are gated by MIME type, 3D models by extension; each category
//! carries its own per-file size cap enforced during the stream. Retrieval
//! returns images as base64 data URLs.

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::multipart::Multipart;
use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::{engine::general_purpose, Engine as _};
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::api::AppState;

/// Image filenames accepted by the retrieval endpoints.
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];

/// Upload categories with their storage and acceptance rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadCategory {
    Image,
    Video,
    Model,
}

impl UploadCategory {
    /// Directory name under the storage root.
    pub fn dir_name(self) -> &'static str {
        match self {
            UploadCategory::Image => "images",
            UploadCategory::Video => "video",
            UploadCategory::Model => "3d-model",
        }
    }

    /// Per-file size cap in bytes.
    pub fn max_bytes(self) -> usize {
        match self {
            UploadCategory::Image => 5 * 1024 * 1024,
            UploadCategory::Video => 50 * 1024 * 1024,
            UploadCategory::Model => 100 * 1024 * 1024,
        }
    }

    fn max_label(self) -> &'static str {
        match self {
            UploadCategory::Image => "5MB",
            UploadCategory::Video => "50MB",
            UploadCategory::Model => "100MB",
        }
    }

    fn success_message(self) -> &'static str {
        match self {
            UploadCategory::Image => "Images uploaded successfully",
            UploadCategory::Video => "Videos uploaded successfully",
            UploadCategory::Model => "3D Models uploaded successfully",
        }
    }

    fn type_error(self) -> &'static str {
        match self {
            UploadCategory::Image => "Invalid file type. Only JPEG, PNG, and GIF are allowed.",
            UploadCategory::Video => "Invalid file type. Only MP4, MPEG, and WebM are allowed.",
            UploadCategory::Model => "Invalid file type. Only GLTF, GLB, OBJ, and FBX are allowed.",
        }
    }

    fn size_error(self) -> String {
        format!("File size exceeds {} limit.", self.max_label())
    }

    /// Acceptance rule: images and videos go by declared MIME type,
    /// 3D models by filename extension.
    pub fn accepts(self, filename: &str, content_type: Option<&str>) -> bool {
        match self {
            UploadCategory::Image => matches!(
                content_type,
                Some("image/jpeg") | Some("image/png") | Some("image/gif")
            ),
            UploadCategory::Video => matches!(
                content_type,
                Some("video/mp4") | Some("video/mpeg") | Some("video/webm")
            ),
            UploadCategory::Model => matches!(
                extension_of(filename).map(|e| e.to_ascii_lowercase()).as_deref(),
                Some("gltf") | Some("glb") | Some("obj") | Some("fbx")
            ),
        }
    }
}

fn extension_of(filename: &str) -> Option<&str> {
    Path::new(filename).extension().and_then(|e| e.to_str())
}

/// Strip any path components from a client-supplied name.
fn basename(name: &str) -> &str {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
}

/// True when the name looks like a retrievable image file.
pub fn is_image_name(name: &str) -> bool {
    extension_of(name)
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// MIME type for a stored image extension; `.jpg` maps to `image/jpeg`.
fn image_mime(ext: &str) -> String {
    let ext = ext.to_ascii_lowercase();
    if ext == "jpg" {
        "image/jpeg".to_string()
    } else {
        format!("image/{ext}")
    }
}

/// Failures while persisting one streamed file.
#[derive(Debug, Error)]
pub enum SaveError {
    /// The stream exceeded the category's per-file cap.
    #[error("file exceeds the per-file size cap")]
    TooLarge,
    /// The multipart stream itself broke mid-file.
    #[error("multipart stream failed: {0}")]
    Stream(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A successfully stored upload.
#[derive(Debug, Clone)]
pub struct StoredFile {
    /// Generated name on disk (uuid + original extension).
    pub stored_name: String,
    /// Full path of the stored file.
    pub path: String,
}

/// Filesystem-backed upload storage.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create the store, ensuring every category directory exists.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for category in [
            UploadCategory::Image,
            UploadCategory::Video,
            UploadCategory::Model,
        ] {
            let dir = root.join(category.dir_name());
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to create upload directory {}", dir.display()))?;
        }
        Ok(Self { root })
    }

    /// Directory holding one category's files.
    pub fn category_dir(&self, category: UploadCategory) -> PathBuf {
        self.root.join(category.dir_name())
    }

    /// Stream one file to disk under a fresh uuid name, enforcing the
    /// category cap as bytes arrive. A partial write is removed on failure.
    #[instrument(skip(self, stream), fields(category = category.dir_name(), filename = %filename))]
    pub async fn save_stream<S, E>(
        &self,
        category: UploadCategory,
        filename: &str,
        stream: S,
    ) -> Result<StoredFile, SaveError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        // models are stored with a lowercased extension, the rest keep
        // the client's casing
        let stored_name = match extension_of(filename) {
            Some(ext) if category == UploadCategory::Model => {
                format!("{}.{}", Uuid::new_v4(), ext.to_ascii_lowercase())
            }
            Some(ext) => format!("{}.{}", Uuid::new_v4(), ext),
            None => Uuid::new_v4().to_string(),
        };
        let path = self.category_dir(category).join(&stored_name);

        let mut file = tokio::fs::File::create(&path).await?;
        let mut written: usize = 0;
        let mut stream = std::pin::pin!(stream);

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    remove_partial(file, &path).await;
                    return Err(SaveError::Stream(e.to_string()));
                }
            };
            written += chunk.len();
            if written > category.max_bytes() {
                remove_partial(file, &path).await;
                return Err(SaveError::TooLarge);
            }
            if let Err(e) = file.write_all(&chunk).await {
                remove_partial(file, &path).await;
                return Err(e.into());
            }
        }
        file.flush().await?;

        debug!(bytes = written, stored = %stored_name, "File stored");
        metrics::counter!("api.files.stored").increment(1);

        Ok(StoredFile {
            stored_name,
            path: path.display().to_string(),
        })
    }

    /// Names of stored image files, sorted for stable listings.
    pub async fn list_images(&self) -> Result<Vec<String>> {
        let dir = self.category_dir(UploadCategory::Image);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("Failed to read image directory {}", dir.display()))?;

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.context("Failed to read directory entry")? {
            if let Some(name) = entry.file_name().to_str() {
                if is_image_name(name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Read one stored image as a `data:<mime>;base64,...` URL.
    /// Returns `None` when the file does not exist.
    pub async fn read_image_data_url(&self, name: &str) -> Result<Option<String>> {
        let path = self.category_dir(UploadCategory::Image).join(name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read image {}", path.display()))
            }
        };

        let ext = extension_of(name).unwrap_or_default();
        let encoded = general_purpose::STANDARD.encode(&bytes);
        Ok(Some(format!("data:{};base64,{}", image_mime(ext), encoded)))
    }
}

// ---- HTTP endpoints ----

/// One entry in an upload response: stored path or per-file failure.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum FileEntry {
    Saved { filename: String, path: String },
    Failed { filename: String, error: String },
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    message: String,
    files: Vec<FileEntry>,
}

/// Bare `{"error": ...}` envelope used by the file endpoints.
#[derive(Debug, Serialize)]
struct ErrorMessage {
    error: String,
}

impl ErrorMessage {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ImageEntry {
    filename: String,
    image: String,
}

#[derive(Debug, Serialize)]
struct ImagesResponse {
    images: Vec<ImageEntry>,
}

#[derive(Debug, Serialize)]
struct ImageResponse {
    image: String,
}

/// File routes, mounted under the service root.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/file/upload/images", post(upload_images))
        .route("/api/v1/file/upload/video", post(upload_video))
        .route("/api/v1/file/upload/3d-model", post(upload_model))
        .route("/api/v1/file/show/images/all", get(show_images))
        .route("/api/v1/file/show/image/:image_name", get(show_image_by_name))
}

async fn upload_images(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), (StatusCode, Json<ErrorMessage>)> {
    upload(UploadCategory::Image, state, multipart).await
}

async fn upload_video(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), (StatusCode, Json<ErrorMessage>)> {
    upload(UploadCategory::Video, state, multipart).await
}

async fn upload_model(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), (StatusCode, Json<ErrorMessage>)> {
    upload(UploadCategory::Model, state, multipart).await
}

#[instrument(skip(state, multipart), fields(category = category.dir_name()))]
async fn upload(
    category: UploadCategory,
    state: AppState,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), (StatusCode, Json<ErrorMessage>)> {
    let mut entries: Vec<FileEntry> = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "Multipart stream failed");
                return Err((
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorMessage::new("File upload failed.")),
                ));
            }
        };

        // non-file form fields carry no filename and are skipped
        let Some(filename) = field.file_name().map(str::to_owned) else {
            continue;
        };
        let content_type = field.content_type().map(str::to_owned);

        if !category.accepts(&filename, content_type.as_deref()) {
            warn!(filename = %filename, content_type = ?content_type, "Upload rejected by type rule");
            metrics::counter!("api.files.rejected").increment(1);
            entries.push(FileEntry::Failed {
                filename,
                error: category.type_error().to_string(),
            });
            continue;
        }

        match state.files.save_stream(category, &filename, field).await {
            Ok(stored) => entries.push(FileEntry::Saved {
                filename,
                path: stored.path,
            }),
            Err(SaveError::TooLarge) => {
                warn!(filename = %filename, "Upload rejected by size cap");
                metrics::counter!("api.files.rejected").increment(1);
                entries.push(FileEntry::Failed {
                    filename,
                    error: category.size_error(),
                });
            }
            Err(SaveError::Stream(e)) => {
                error!(error = %e, "Multipart stream failed mid-file");
                return Err((
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorMessage::new("File upload failed.")),
                ));
            }
            Err(SaveError::Io(e)) => {
                error!(error = %e, "Failed to persist upload");
                return Err((
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorMessage::new("Internal server error.")),
                ));
            }
        }
    }

    if entries.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorMessage::new("No files uploaded.")),
        ));
    }

    let any_failed = entries
        .iter()
        .any(|entry| matches!(entry, FileEntry::Failed { .. }));
    if any_failed {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(UploadResponse {
                message: "Some files failed to upload".to_string(),
                files: entries,
            }),
        ));
    }

    Ok((
        StatusCode::OK,
        Json(UploadResponse {
            message: category.success_message().to_string(),
            files: entries,
        }),
    ))
}

async fn show_images(
    State(state): State<AppState>,
) -> Result<Json<ImagesResponse>, (StatusCode, Json<ErrorMessage>)> {
    let names = state.files.list_images().await.map_err(|e| {
        error!(error = %e, "Image listing failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorMessage::new("Internal server error")),
        )
    })?;

    if names.is_empty() {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorMessage::new("No images found")),
        ));
    }

    let mut images = Vec::with_capacity(names.len());
    for name in names {
        match state.files.read_image_data_url(&name).await {
            Ok(Some(data_url)) => images.push(ImageEntry {
                filename: name,
                image: data_url,
            }),
            // listed a moment ago but gone now; skip it
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, filename = %name, "Image read failed");
                return Err((
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorMessage::new("Internal server error")),
                ));
            }
        }
    }

    Ok(Json(ImagesResponse { images }))
}

async fn show_image_by_name(
    State(state): State<AppState>,
    UrlPath(image_name): UrlPath<String>,
) -> Result<Json<ImageResponse>, (StatusCode, Json<ErrorMessage>)> {
    // basename only, so traversal segments in the parameter go nowhere
    let name = basename(&image_name);

    if !is_image_name(name) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorMessage::new("Unsupported file format")),
        ));
    }

    match state.files.read_image_data_url(name).await {
        Ok(Some(data_url)) => Ok(Json(ImageResponse { image: data_url })),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorMessage::new("Image not found")),
        )),
        Err(e) => {
            error!(error = %e, filename = %name, "Image read failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorMessage::new("Internal server error")),
            ))
        }
    }
}

async fn remove_partial(file: tokio::fs::File, path: &Path) {
    // the handle must be closed before the unlink
    drop(file);
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(error = %e, path = %path.display(), "Failed to remove partial upload");
    }
}
