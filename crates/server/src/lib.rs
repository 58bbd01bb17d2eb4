//! HTTP interface.
//!
//! A thin axum layer over the artifact store: pages, listing, uploads,
//! deletes and downloads. Everything stateful lives in [`AppState`].

mod api;
mod assets;
mod download;
pub mod error;
mod middleware;
mod upload;


use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use shelf_config::Config;
use shelf_limits::{AdmissionGate, RateLimiter};
use shelf_storage::ArtifactStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

pub use crate::error::ApiError;

/// Shared state handed to every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub store: ArtifactStore,
    pub gate: AdmissionGate,
    pub limiter: Option<RateLimiter>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Build the runtime pieces described by `config` around an existing
    /// store.
    pub fn new(config: Arc<Config>, store: ArtifactStore) -> Self {
        let gate = AdmissionGate::new(
            config.concurrency.max_concurrent_uploads,
            config.concurrency.max_concurrent_downloads,
        );
        let limiter = config.rate_limit().map(RateLimiter::new);
        Self {
            store,
            gate,
            limiter,
            config,
        }
    }
}

/// Assemble the full router, middleware included.
pub fn router(state: AppState) -> Router {
    let body_limit = usize::try_from(state.config.max_upload_size()).unwrap_or(usize::MAX);

    let protected = Router::new()
        .route("/upload", post(upload::upload).layer(DefaultBodyLimit::max(body_limit)))
        .route("/delete", post(api::delete).delete(api::delete))
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), middleware::require_api_key));

    let public = Router::new()
        .route("/", get(assets::download_page))
        .route("/admin", get(assets::admin_page))
        .route("/favicon.ico", get(assets::favicon))
        .route("/static/*path", get(assets::static_file))
        .route("/health", get(api::health))
        .route("/api/config", get(api::config))
        .route("/list", get(api::list))
        .route("/downloads/:category/:filename", get(download::download));

    let app = public.merge(protected);
    middleware::apply(app, &state).with_state(state)
}

/// Serve `state` on `listener` until `shutdown` resolves, then wait for
/// in-flight requests to finish.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await
}
