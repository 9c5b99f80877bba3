//! Many-to-many fan-out of live output chunks, keyed by run id, with a bounded
//! replay buffer and idempotent completion.
//!
//! The top-level registry is a `DashMap` (sharded, internally locked), so a hot
//! stream's lock traffic never blocks subscription to a cold one — each
//! `RunStream` also carries its own `tokio::sync::Mutex`.
//!
//! Delivery is strictly non-blocking: `try_send` on a bounded per-subscriber
//! channel. A full channel means that subscriber misses the chunk; it never
//! blocks the publisher. The Run's persisted `output` field remains the
//! system of record regardless of what subscribers saw live.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};

use crate::store::RunStatus;

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Debug, serde::Serialize)]
pub struct OutputChunk {
    pub run_id: i64,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub is_error: bool,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct CompletionEvent {
    pub run_id: i64,
    pub status: RunStatus,
    pub error: String,
}

/// Everything a subscriber can observe. Completion is always the last event a
/// subscriber sees; a closed channel with no `Complete` received means the
/// subscriber was explicitly unsubscribed.
#[derive(Clone, Debug, serde::Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Chunk(OutputChunk),
    Complete(CompletionEvent),
}

pub struct Subscription {
    pub client_id: String,
    pub run_id: i64,
    pub rx: mpsc::Receiver<StreamEvent>,
}

struct RunStream {
    buffer: VecDeque<OutputChunk>,
    buffer_limit: usize,
    subscribers: std::collections::HashMap<String, mpsc::Sender<StreamEvent>>,
    completed: bool,
    completion: Option<CompletionEvent>,
    last_activity: DateTime<Utc>,
}

impl RunStream {
    fn new(buffer_limit: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(buffer_limit),
            buffer_limit,
            subscribers: std::collections::HashMap::new(),
            completed: false,
            completion: None,
            last_activity: Utc::now(),
        }
    }

    fn push_chunk(&mut self, chunk: OutputChunk) {
        if self.buffer.len() >= self.buffer_limit {
            self.buffer.pop_front();
        }
        self.last_activity = chunk.timestamp;
        self.buffer.push_back(chunk);
    }

    fn is_collectible(&self) -> bool {
        self.completed && self.subscribers.is_empty()
    }
}

pub struct StreamManager {
    streams: DashMap<i64, Arc<Mutex<RunStream>>>,
    buffer_limit: usize,
}

impl StreamManager {
    pub fn new(buffer_limit: usize) -> Self {
        Self {
            streams: DashMap::new(),
            buffer_limit,
        }
    }

    fn stream_for(&self, run_id: i64) -> Arc<Mutex<RunStream>> {
        self.streams
            .entry(run_id)
            .or_insert_with(|| Arc::new(Mutex::new(RunStream::new(self.buffer_limit))))
            .clone()
    }

    /// Append to the buffer (evicting oldest if over N) and deliver to every
    /// subscriber via non-blocking send.
    pub async fn publish(&self, chunk: OutputChunk) {
        let stream = self.stream_for(chunk.run_id);
        let mut guard = stream.lock().await;
        guard.push_chunk(chunk.clone());
        for tx in guard.subscribers.values() {
            let _ = tx.try_send(StreamEvent::Chunk(chunk.clone()));
        }
    }

    /// Creates a fresh subscription, replays the current buffer (best-effort,
    /// non-blocking), and immediately delivers the cached completion if the
    /// stream is already done.
    pub async fn subscribe(&self, run_id: i64, client_id: impl Into<String>) -> Subscription {
        let client_id = client_id.into();
        let stream = self.stream_for(run_id);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);

        let mut guard = stream.lock().await;
        for chunk in guard.buffer.iter() {
            let _ = tx.try_send(StreamEvent::Chunk(chunk.clone()));
        }
        if let Some(completion) = guard.completion.clone() {
            let _ = tx.try_send(StreamEvent::Complete(completion));
        } else {
            guard.subscribers.insert(client_id.clone(), tx);
        }

        Subscription {
            client_id,
            run_id,
            rx,
        }
    }

    /// Removes the subscriber; the channel drop closes the receiver, which the
    /// subscriber observes as "done" unless it already saw `Complete`.
    pub async fn unsubscribe(&self, run_id: i64, client_id: &str) {
        let collectible = {
            let Some(stream) = self.streams.get(&run_id) else {
                return;
            };
            let stream = stream.clone();
            let mut guard = stream.lock().await;
            guard.subscribers.remove(client_id);
            guard.is_collectible()
        };
        if collectible {
            self.streams.remove(&run_id);
        }
    }

    /// Idempotent: a second call for the same run is a no-op.
    pub async fn complete(&self, run_id: i64, status: RunStatus, error: String) {
        let stream = self.stream_for(run_id);
        let mut guard = stream.lock().await;
        if guard.completed {
            return;
        }
        guard.completed = true;
        let event = CompletionEvent {
            run_id,
            status,
            error,
        };
        guard.completion = Some(event.clone());
        guard.last_activity = Utc::now();
        for tx in guard.subscribers.values() {
            let _ = tx.try_send(StreamEvent::Complete(event.clone()));
        }
    }

    /// Periodic sweep: drops completed streams whose newest chunk is older than
    /// `max_age`.
    pub async fn cleanup_old_streams(&self, max_age: chrono::Duration) {
        let now = Utc::now();
        let mut stale = Vec::new();
        for entry in self.streams.iter() {
            let guard = entry.value().lock().await;
            if guard.completed && now - guard.last_activity > max_age {
                stale.push(*entry.key());
            }
        }
        for run_id in stale {
            self.streams.remove(&run_id);
        }
    }

    #[cfg(test)]
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }
}
