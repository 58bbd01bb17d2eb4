//! JSON endpoints: health, public configuration, listing and delete.

use crate::AppState;
use crate::error::ApiError;
use axum::Json;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use shelf_storage::{Artifact, CategoryInfo};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
    pub version: &'static str,
}

pub(crate) async fn health() -> Json<HealthResponse> {
    let now = OffsetDateTime::now_utc();
    Json(HealthResponse {
        status: "ok",
        timestamp: now.format(&Rfc3339).unwrap_or_else(|_| now.unix_timestamp().to_string()),
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Serialize)]
pub struct CategoryResponse {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub max_files: usize,
    pub file_count: usize,
}
impl From<CategoryInfo> for CategoryResponse {
    fn from(info: CategoryInfo) -> Self {
        Self {
            name: info.name,
            display_name: info.display_name,
            description: info.description,
            max_files: info.max_files,
            file_count: info.file_count,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TextMessages {
    pub upload_success: String,
    pub upload_failed: String,
    pub file_too_large: String,
    pub invalid_file: String,
    pub no_files_found: String,
    pub copy_success: String,
    pub copy_failed: String,
}

#[derive(Debug, Serialize)]
pub struct ConfigResponse {
    pub app_name: String,
    pub app_title: String,
    pub app_subtitle: String,
    pub device_name: String,
    pub admin_title: String,
    pub categories: Vec<CategoryResponse>,
    pub text: TextMessages,
}

pub(crate) async fn config(State(state): State<AppState>) -> impl IntoResponse {
    let text = &state.config.text;
    let categories = state.store.category_stats().await.into_iter().map(CategoryResponse::from).collect();
    let body = ConfigResponse {
        app_name: text.app_name.clone(),
        app_title: text.app_title.clone(),
        app_subtitle: text.app_subtitle.clone(),
        device_name: text.device_name.clone(),
        admin_title: text.admin_title.clone(),
        categories,
        text: TextMessages {
            upload_success: text.upload_success.clone(),
            upload_failed: text.upload_failed.clone(),
            file_too_large: text.file_too_large.clone(),
            invalid_file: text.invalid_file.clone(),
            no_files_found: text.no_files_found.clone(),
            copy_success: text.copy_success.clone(),
            copy_failed: text.copy_failed.clone(),
        },
    };
    ([(header::CACHE_CONTROL, "public, max-age=300")], Json(body))
}

#[derive(Debug, Serialize)]
pub struct FileInfo {
    pub category: String,
    pub filename: String,
    /// Human readable, e.g. `1.5 MB`.
    pub size: String,
    pub size_bytes: u64,
    /// `YYYY-MM-DD HH:MM`, UTC.
    pub updated_at: String,
    pub downloads: u64,
}
impl From<Artifact> for FileInfo {
    fn from(artifact: Artifact) -> Self {
        Self {
            size: artifact.human_size(),
            updated_at: artifact.updated_at(),
            size_bytes: artifact.size,
            downloads: artifact.downloads,
            category: artifact.category,
            filename: artifact.filename,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub files: Vec<FileInfo>,
    pub total_count: usize,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ListQuery {
    category: Option<String>,
}

pub(crate) async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>, ApiError> {
    let artifacts = match query.category.as_deref().filter(|category| !category.is_empty()) {
        Some(category) => state
            .store
            .list_files_by_category(category)
            .await
            .map_err(|err| ApiError::from_storage(err, &state.config.text.server_error))?,
        None => state.store.list_files().await,
    };
    let files: Vec<FileInfo> = artifacts.into_iter().map(FileInfo::from).collect();
    Ok(Json(ListResponse {
        total_count: files.len(),
        files,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct DeleteQuery {
    #[serde(default)]
    category: String,
    #[serde(default)]
    filename: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}

pub(crate) async fn delete(
    State(state): State<AppState>,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<MessageResponse>, ApiError> {
    if query.category.is_empty() || query.filename.is_empty() {
        return Err(ApiError::bad_request("Category and filename required"));
    }
    state
        .store
        .delete(&query.category, &query.filename)
        .await
        .map_err(|err| ApiError::from_storage(err, &state.config.text.server_error))?;
    tracing::info!(category = %query.category, filename = %query.filename, "Deleted artifact");
    Ok(Json(MessageResponse { message: "File deleted" }))
}
