use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

use crate::error::Result;
use crate::store::Run;
use crate::App;

#[derive(Deserialize)]
pub struct ListParams {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn list_runs(
    State(app): State<Arc<App>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Run>>> {
    Ok(Json(app.store.list_runs(params.limit).await?))
}

pub async fn list_runs_for_task(
    State(app): State<Arc<App>>,
    Path(task_id): Path<i64>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Run>>> {
    Ok(Json(app.store.list_runs_for_task(task_id, params.limit).await?))
}

pub async fn get_run(State(app): State<Arc<App>>, Path(id): Path<i64>) -> Result<Json<Run>> {
    Ok(Json(app.store.get_run(id).await?))
}
