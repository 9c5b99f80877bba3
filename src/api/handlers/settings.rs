use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;
use crate::App;

#[derive(Serialize)]
pub struct UsageThreshold {
    value: f64,
}

pub async fn get_usage_threshold(State(app): State<Arc<App>>) -> Result<Json<UsageThreshold>> {
    Ok(Json(UsageThreshold {
        value: app.store.usage_threshold().await?,
    }))
}

#[derive(Deserialize)]
pub struct SetUsageThreshold {
    value: f64,
}

pub async fn set_usage_threshold(
    State(app): State<Arc<App>>,
    Json(body): Json<SetUsageThreshold>,
) -> Result<Json<UsageThreshold>> {
    app.store
        .set_setting("usage_threshold", &body.value.to_string())
        .await?;
    Ok(Json(UsageThreshold { value: body.value }))
}
