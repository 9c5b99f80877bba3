pub mod api;
pub mod budget;
pub mod config;
pub mod error;
pub mod executor;
pub mod scheduler;
pub mod store;
pub mod stream;

use std::sync::Arc;

use budget::{BudgetGate, HttpUsageClient};
use config::Config;
use executor::Executor;
use scheduler::Scheduler;
use store::Store;
use stream::StreamManager;

/// Wires Store, Stream Manager, Executor, and Scheduler together in the order
/// each depends on the last, and hands back `Arc`s the API layer can share
/// freely across request handlers.
pub struct App {
    pub store: Store,
    pub streams: Arc<StreamManager>,
    pub executor: Arc<Executor>,
    pub scheduler: Arc<Scheduler>,
}

impl App {
    pub async fn new(config: &Config) -> error::Result<Self> {
        let store = Store::open(config.db_path()).await?;
        let streams = Arc::new(StreamManager::new(config.stream_buffer));

        let usage_client: Box<dyn budget::UsageClient> = match &config.usage_url {
            Some(url) => Box::new(HttpUsageClient::new(url.clone())),
            None => Box::new(NoUsageClient),
        };
        let budget = BudgetGate::new(usage_client);

        let executor = Arc::new(Executor::new(
            store.clone(),
            streams.clone(),
            budget,
            config.agent_bin.clone(),
            std::time::Duration::from_secs(config.run_timeout_secs),
        ));

        let scheduler = Arc::new(Scheduler::new(store.clone(), executor.clone(), config.reconcile_secs).await?);

        Ok(Self {
            store,
            streams,
            executor,
            scheduler,
        })
    }
}

/// Used when no usage-quota endpoint is configured; always reports zero
/// utilization so the budget gate passes every check.
struct NoUsageClient;

#[async_trait::async_trait]
impl budget::UsageClient for NoUsageClient {
    async fn snapshot(&self) -> anyhow::Result<budget::UsageSnapshot> {
        let now = chrono::Utc::now();
        Ok(budget::UsageSnapshot {
            five_hour: budget::UsageBucket { utilization: 0.0, resets_at: now },
            seven_day: budget::UsageBucket { utilization: 0.0, resets_at: now },
        })
    }
}
