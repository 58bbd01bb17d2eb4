//! Streaming multipart uploads.
//!
//! The file part is never buffered: it is piped straight from the request
//! body into the store, which checks its signature and spools it to the
//! scratch directory.

use crate::AppState;
use crate::error::ApiError;
use axum::Json;
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::{Multipart, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use shelf_limits::Kind;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::io::StreamReader;

const FILE_FIELDS: [&str; 2] = ["zipfile", "file"];
const CATEGORY_FIELD: &str = "category";

#[derive(Debug, Default, Deserialize)]
pub(crate) struct UploadQuery {
    category: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub success: bool,
    pub message: String,
    pub filename: String,
    pub category: String,
}

fn invalid_category() -> ApiError {
    ApiError::bad_request("Invalid category (use ?category= param)")
}

/// Remembers how the request body failed, if it did, so a store error caused
/// by the client can be told apart from a server fault.
#[derive(Default)]
struct BodyFailure {
    failed: AtomicBool,
    too_large: AtomicBool,
}
impl BodyFailure {
    fn record(&self, err: MultipartError) -> io::Error {
        self.failed.store(true, Ordering::Relaxed);
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            self.too_large.store(true, Ordering::Relaxed);
        }
        io::Error::other(err.body_text())
    }
}

pub(crate) async fn upload(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, ApiError> {
    let text = &state.config.text;
    let _slot = state.gate.acquire(Kind::Upload).await.map_err(|_| ApiError::unavailable())?;

    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());
    if declared.is_some_and(|length| length > state.config.max_upload_size()) {
        return Err(ApiError::too_large(text.file_too_large.clone()));
    }

    let mut category = query.category.filter(|category| !category.is_empty());
    if let Some(category) = &category
        && state.store.settings().category(category).is_err()
    {
        return Err(invalid_category());
    }

    let mut multipart =
        multipart.map_err(|rejection| ApiError::bad_request(text.invalid_file.clone()).with_details(rejection.body_text()))?;
    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|err| ApiError::from_multipart(err, &text.invalid_file, &text.file_too_large))?;
        let Some(field) = field else {
            return Err(match category {
                Some(_) => ApiError::bad_request(text.invalid_file.clone()),
                None => invalid_category(),
            });
        };
        let name = field.name().unwrap_or_default().to_string();

        if name == CATEGORY_FIELD && category.is_none() {
            let value = field
                .text()
                .await
                .map_err(|err| ApiError::from_multipart(err, &text.invalid_file, &text.file_too_large))?;
            if state.store.settings().category(value.trim()).is_err() {
                return Err(invalid_category());
            }
            category = Some(value.trim().to_string());
            continue;
        }
        if !FILE_FIELDS.contains(&name.as_str()) {
            continue;
        }

        let Some(category) = category else {
            return Err(invalid_category());
        };
        let filename = field
            .file_name()
            .filter(|filename| !filename.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ApiError::bad_request(text.invalid_file.clone()))?;

        let failure = BodyFailure::default();
        let body = field.map_err(|err| failure.record(err));
        let reader = std::pin::pin!(StreamReader::new(body));
        let saved = state.store.save(&category, &filename, reader).await;
        let artifact = match saved {
            Ok(artifact) => artifact,
            Err(_) if failure.too_large.load(Ordering::Relaxed) => {
                return Err(ApiError::too_large(text.file_too_large.clone()));
            },
            Err(err) if failure.failed.load(Ordering::Relaxed) => {
                tracing::debug!(error = ?err, "Upload body ended early");
                return Err(ApiError::bad_request(text.invalid_file.clone()));
            },
            Err(err) => return Err(ApiError::from_storage(err, &text.upload_failed)),
        };

        tracing::info!(category = %artifact.category, filename = %artifact.filename, "Upload complete");
        return Ok(Json(UploadResponse {
            success: true,
            message: text.upload_success.clone(),
            filename: artifact.filename,
            category: artifact.category,
        }));
    }
}
