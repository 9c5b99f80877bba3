use axum::routing::{get, post, put};
use axum::Router;
use std::sync::Arc;

use super::handlers;
use crate::App;

pub fn create_router(app: Arc<App>) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/tasks", get(handlers::tasks::list_tasks))
        .route("/api/tasks", post(handlers::tasks::create_task))
        .route("/api/tasks/{id}", get(handlers::tasks::get_task))
        .route("/api/tasks/{id}", put(handlers::tasks::update_task))
        .route("/api/tasks/{id}", axum::routing::delete(handlers::tasks::delete_task))
        .route("/api/tasks/{id}/toggle", post(handlers::tasks::toggle_task))
        .route("/api/tasks/{id}/run", post(handlers::tasks::run_task_now))
        .route("/api/tasks/{id}/run-stream", post(handlers::tasks::start_stream_run))
        .route("/api/tasks/{id}/runs", get(handlers::runs::list_runs_for_task))
        .route("/api/runs", get(handlers::runs::list_runs))
        .route("/api/runs/{id}", get(handlers::runs::get_run))
        .route("/api/runs/{id}/stream", get(handlers::stream::subscribe))
        .route("/api/settings/usage-threshold", get(handlers::settings::get_usage_threshold))
        .route("/api/settings/usage-threshold", put(handlers::settings::set_usage_threshold))
        .with_state(app)
}
