//! Embedded web pages and static assets.

use crate::error::ApiError;
use axum::extract::Path;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use rust_embed::Embed;

#[derive(Embed)]
#[folder = "../../assets/web/"]
pub(crate) struct Pages;
impl Pages {
    fn serve(name: &str) -> Result<Response, ApiError> {
        let file = Self::get(name).ok_or_else(|| ApiError::not_found("Not found"))?;
        let mime = file.metadata.mimetype().to_string();
        Ok(([(header::CONTENT_TYPE, mime)], file.data).into_response())
    }
}

pub(crate) async fn download_page() -> Result<Response, ApiError> {
    Pages::serve("download.html")
}

pub(crate) async fn admin_page() -> Result<Response, ApiError> {
    Pages::serve("index.html")
}

pub(crate) async fn favicon() -> Result<Response, ApiError> {
    Pages::serve("favicon.svg")
}

pub(crate) async fn static_file(Path(path): Path<String>) -> Result<Response, ApiError> {
    let path = path.trim_start_matches('/');
    if path.split('/').any(|segment| segment == ".." || segment.is_empty()) {
        return Err(ApiError::not_found("Not found"));
    }
    Pages::serve(path)
}
