//! Streaming downloads.
//!
//! Files are served with conditional and range request support, so clients
//! can resume large downloads. The download slot is held by the response body
//! itself, so it is released when the last byte is sent or the client goes
//! away, not when the handler returns.

use crate::AppState;
use crate::error::ApiError;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::Response;
use futures::Stream;
use http_body_util::BodyExt;
use pin_project_lite::pin_project;
use shelf_limits::{Kind, Slot};
use shelf_storage::{Format, extension};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Sleep;
use tower::ServiceExt;
use tower_http::services::ServeFile;

pin_project! {
    /// Body stream that owns an admission slot and gives up once the write
    /// timeout has passed.
    pub(crate) struct Guarded<S> {
        #[pin]
        inner: S,
        #[pin]
        deadline: Option<Sleep>,
        expired: bool,
        slot: Slot,
    }
}

impl<S> Guarded<S> {
    pub(crate) fn new(inner: S, slot: Slot, timeout: Duration) -> Self {
        let deadline = (!timeout.is_zero()).then(|| tokio::time::sleep(timeout));
        Self {
            inner,
            deadline,
            expired: false,
            slot,
        }
    }
}

impl<S> Stream for Guarded<S>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        if *this.expired {
            return Poll::Ready(None);
        }
        let timed_out = this.deadline.as_mut().as_pin_mut().is_some_and(|deadline| deadline.poll(cx).is_ready());
        if timed_out {
            *this.expired = true;
            this.deadline.set(None);
            tracing::warn!(kind = %this.slot.kind(), "Download exceeded the write timeout");
            return Poll::Ready(Some(Err(io::Error::new(io::ErrorKind::TimedOut, "write timeout"))));
        }
        this.inner.poll_next(cx)
    }
}

fn content_type(filename: &str) -> &'static str {
    extension(filename)
        .as_deref()
        .and_then(Format::from_extension)
        .map_or("application/octet-stream", |format| format.content_type())
}

fn content_disposition(filename: &str) -> HeaderValue {
    let quoted = filename.replace(['"', '\\'], "_");
    HeaderValue::from_str(&format!("attachment; filename=\"{quoted}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

/// Whether a successful response delivers the start of the file. Resumed
/// transfers are not counted again.
fn starts_download(status: StatusCode, headers: &HeaderMap) -> bool {
    match status {
        StatusCode::OK => true,
        StatusCode::PARTIAL_CONTENT => headers
            .get(header::CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|range| range.starts_with("bytes 0-")),
        _ => false,
    }
}

pub(crate) async fn download(
    State(state): State<AppState>,
    Path((category, filename)): Path<(String, String)>,
    request: Request,
) -> Result<Response, ApiError> {
    let slot = state.gate.acquire(Kind::Download).await.map_err(|_| ApiError::unavailable())?;
    let server_error = &state.config.text.server_error;

    let located = state
        .store
        .locate(&category, &filename)
        .await
        .map_err(|err| ApiError::from_storage(err, server_error))?;
    let file = ServeFile::new(&located.path).with_buf_chunk_size(state.config.download_buffer_size());
    let Ok(response) = file.oneshot(request).await;
    let (mut parts, body) = response.into_parts();

    match parts.status {
        status if status.is_success() => {},
        StatusCode::NOT_MODIFIED | StatusCode::PRECONDITION_FAILED | StatusCode::RANGE_NOT_SATISFIABLE => {},
        StatusCode::NOT_FOUND => return Err(ApiError::not_found("File not found")),
        status => {
            tracing::error!(path = %located.path.display(), %status, "Could not serve artifact");
            return Err(ApiError::internal(server_error.clone()));
        },
    }
    if starts_download(parts.status, &parts.headers) {
        state.store.record_download(&located);
    }
    tracing::debug!(
        category = %located.category,
        filename = %located.filename,
        status = %parts.status,
        "Serving download"
    );

    let headers = &mut parts.headers;
    if parts.status.is_success() {
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type(&located.filename)));
        headers.insert(header::CONTENT_DISPOSITION, content_disposition(&located.filename));
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("public, max-age=3600"));

    let body = Guarded::new(body.into_data_stream(), slot, state.config.write_timeout());
    Ok(Response::from_parts(parts, Body::from_stream(body)))
}
