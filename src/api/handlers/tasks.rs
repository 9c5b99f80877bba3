use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use std::sync::Arc;

use crate::error::Result;
use crate::executor::ExecKind;
use crate::store::{NewRun, NewTask, Run, Task};
use crate::App;

pub async fn list_tasks(State(app): State<Arc<App>>) -> Result<Json<Vec<Task>>> {
    Ok(Json(app.store.list_tasks().await?))
}

pub async fn get_task(State(app): State<Arc<App>>, Path(id): Path<i64>) -> Result<Json<Task>> {
    Ok(Json(app.store.get_task(id).await?))
}

pub async fn create_task(
    State(app): State<Arc<App>>,
    Json(new): Json<NewTask>,
) -> Result<Json<Task>> {
    let task = app.store.create_task(new).await?;
    if let Err(e) = app.scheduler.task_added(&task).await {
        tracing::error!(task_id = task.id, error = %e, "failed to schedule newly created task");
    }
    Ok(Json(task))
}

pub async fn update_task(
    State(app): State<Arc<App>>,
    Path(id): Path<i64>,
    Json(mut task): Json<Task>,
) -> Result<Json<Task>> {
    task.id = id;
    let updated = app.store.update_task(task).await?;
    if let Err(e) = app.scheduler.task_updated(&updated).await {
        tracing::error!(task_id = updated.id, error = %e, "failed to reschedule updated task");
    }
    Ok(Json(updated))
}

pub async fn delete_task(State(app): State<Arc<App>>, Path(id): Path<i64>) -> Result<Json<serde_json::Value>> {
    app.scheduler.task_removed(id).await;
    app.store.delete_task(id).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

pub async fn toggle_task(State(app): State<Arc<App>>, Path(id): Path<i64>) -> Result<Json<Task>> {
    app.store.toggle_task(id).await?;
    let task = app.store.get_task(id).await?;
    if let Err(e) = app.scheduler.task_updated(&task).await {
        tracing::error!(task_id = task.id, error = %e, "failed to reschedule toggled task");
    }
    Ok(Json(task))
}

/// Manual run: bypasses the budget gate entirely.
pub async fn run_task_now(State(app): State<Arc<App>>, Path(id): Path<i64>) -> Result<Json<Run>> {
    let task = app.store.get_task(id).await?;
    let outcome = app.executor.execute(&task, ExecKind::Manual).await?;
    let run = match outcome {
        crate::executor::ExecOutcome::Completed(r)
        | crate::executor::ExecOutcome::Failed(r)
        | crate::executor::ExecOutcome::Skipped(r) => r,
    };
    Ok(Json(run))
}

/// Inserts the Run row and returns its id immediately; the subprocess keeps
/// running in the background and publishes to the Stream Manager as it goes.
pub async fn start_stream_run(State(app): State<Arc<App>>, Path(id): Path<i64>) -> Result<Json<Run>> {
    let task = app.store.get_task(id).await?;
    let run = app
        .store
        .create_run(NewRun {
            task_id: task.id,
            started_at: Utc::now(),
        })
        .await?;

    let run_for_response = run.clone();
    let executor = app.executor.clone();
    tokio::spawn(async move {
        if let Err(e) = executor.execute_with_run(&task, run, ExecKind::Manual).await {
            tracing::error!(task_id = task.id, error = %e, "streaming run failed");
        }
    });

    Ok(Json(run_for_response))
}
