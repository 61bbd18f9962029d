// Read-only inspection API

mod http;

use axum::{Router, routing::get};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::cache::MetricCache;
use crate::store::{MetricStore, TaskJournal};

/// Package version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Package name (from Cargo.toml).
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) store: Arc<dyn MetricStore>,
    pub(crate) cache: Arc<dyn MetricCache>,
    pub(crate) journal: Option<TaskJournal>,
}

pub fn app(
    store: Arc<dyn MetricStore>,
    cache: Arc<dyn MetricCache>,
    journal: Option<TaskJournal>,
) -> Router {
    let state = AppState {
        store,
        cache,
        journal,
    };
    Router::new()
        .route("/version", get(http::version_handler)) // GET /version
        .route(
            "/api/resources/{id}/aggregates",
            get(http::aggregates_handler),
        ) // GET /api/resources/{id}/aggregates?key=&limit=
        .route("/api/resources/{id}/stats", get(http::stats_handler)) // GET /api/resources/{id}/stats
        .route("/api/tasks", get(http::tasks_handler)) // GET /api/tasks
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(state)
}
