use std::sync::Arc;

use agentsched::config::Config;
use agentsched::App;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();

    let app = match App::new(&config).await {
        Ok(app) => Arc::new(app),
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize application state");
            std::process::exit(1);
        }
    };

    let task_count = match app.store.list_tasks().await {
        Ok(tasks) => tasks.len(),
        Err(_) => 0,
    };
    tracing::info!(tasks = task_count, "loaded tasks from store");

    if let Err(e) = app.scheduler.start().await {
        tracing::error!(error = %e, "failed to start scheduler");
        std::process::exit(1);
    }

    let sweep_streams = app.streams.clone();
    let sweep_max_age = chrono::Duration::seconds(config.stream_max_age_secs as i64);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            tick.tick().await;
            sweep_streams.cleanup_old_streams(sweep_max_age).await;
        }
    });

    let shutdown_scheduler = app.scheduler.clone();
    let shutdown_handle = tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down scheduler");
        if let Err(e) = shutdown_scheduler.shutdown().await {
            tracing::error!(error = %e, "scheduler shutdown reported an error");
        }
    });

    if let Err(e) = agentsched::api::serve(app, &config.http_host, config.http_port).await {
        tracing::error!(error = %e, "http server exited with an error");
    }

    let _ = shutdown_handle.await;
}
