use axum::routing::{get, post};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::SharedState;

pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(crate::routes::health::health))
        .route(
            "/jobs",
            post(crate::routes::jobs::create_job).get(crate::routes::jobs::list_jobs),
        )
        .route("/jobs/{id}", get(crate::routes::jobs::get_job))
        .route("/jobs/{id}/status", get(crate::routes::jobs::job_status))
        .route("/jobs/{id}/results", get(crate::routes::jobs::job_results))
        .route("/jobs/{id}/estimate", get(crate::routes::jobs::estimate))
        .route("/jobs/{id}/cancel", post(crate::routes::jobs::cancel_job))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
