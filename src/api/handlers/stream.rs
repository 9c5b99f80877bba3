use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::stream::{StreamEvent, StreamManager};
use crate::App;

/// Calls `StreamManager::unsubscribe` once the SSE connection's stream is
/// dropped, so a client that disconnects mid-run doesn't leave a dead
/// subscriber entry behind forever.
struct UnsubscribeGuard {
    streams: Arc<StreamManager>,
    run_id: i64,
    client_id: String,
}

impl Drop for UnsubscribeGuard {
    fn drop(&mut self) {
        let streams = self.streams.clone();
        let run_id = self.run_id;
        let client_id = std::mem::take(&mut self.client_id);
        tokio::spawn(async move {
            streams.unsubscribe(run_id, &client_id).await;
        });
    }
}

/// Replays the buffered output for this run, then forwards live chunks and a
/// terminal `complete` event. The SSE stream ends right after `complete`.
pub async fn subscribe(State(app): State<Arc<App>>, Path(run_id): Path<i64>) -> impl IntoResponse {
    let client_id = Uuid::new_v4().to_string();
    let subscription = app.streams.subscribe(run_id, client_id.clone()).await;
    let guard = UnsubscribeGuard {
        streams: app.streams.clone(),
        run_id,
        client_id,
    };

    let mut ended = false;
    let events = ReceiverStream::new(subscription.rx).map_while(move |event| {
        let _keep_alive = &guard;
        if ended {
            return None;
        }
        if matches!(event, StreamEvent::Complete(_)) {
            ended = true;
        }
        let json = serde_json::to_string(&event).unwrap_or_default();
        Some(Ok::<Event, Infallible>(Event::default().data(json)))
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}
