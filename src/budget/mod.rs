//! Budget gate: decides whether a scheduled execution may proceed given the
//! current two-bucket usage utilization and a configured threshold.
//!
//! Fails open: if the usage client is unavailable or errors, the gate allows
//! execution rather than blocking liveness on an external dependency. Manual
//! ("run now") invocations bypass the gate entirely and never call `check`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// A single bucket's utilization snapshot.
#[derive(Clone, Debug, Deserialize)]
pub struct UsageBucket {
    pub utilization: f64,
    pub resets_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct UsageSnapshot {
    pub five_hour: UsageBucket,
    pub seven_day: UsageBucket,
}

/// Opaque source of the two-bucket utilization snapshot.
#[async_trait]
pub trait UsageClient: Send + Sync {
    async fn snapshot(&self) -> anyhow::Result<UsageSnapshot>;
}

/// HTTP-backed usage client. The endpoint is expected to return a JSON body
/// matching `UsageSnapshot`.
pub struct HttpUsageClient {
    client: reqwest::Client,
    url: String,
}

impl HttpUsageClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl UsageClient for HttpUsageClient {
    async fn snapshot(&self) -> anyhow::Result<UsageSnapshot> {
        let snapshot = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json::<UsageSnapshot>()
            .await?;
        Ok(snapshot)
    }
}

pub struct BudgetGate {
    client: Box<dyn UsageClient>,
}

impl BudgetGate {
    pub fn new(client: Box<dyn UsageClient>) -> Self {
        Self { client }
    }

    /// `(allowed, skip_reason)`. Only called for scheduled (non-manual) runs.
    pub async fn check(&self, threshold: f64) -> (bool, Option<String>) {
        let snapshot = match self.client.snapshot().await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "usage client unavailable, failing open");
                return (true, None);
            }
        };

        let over_5h = snapshot.five_hour.utilization > threshold;
        let over_7d = snapshot.seven_day.utilization > threshold;

        if over_5h || over_7d {
            let reason = format!(
                "usage above threshold {threshold:.1}%: 5h={:.1}% (resets {}), 7d={:.1}% (resets {})",
                snapshot.five_hour.utilization,
                snapshot.five_hour.resets_at.to_rfc3339(),
                snapshot.seven_day.utilization,
                snapshot.seven_day.resets_at.to_rfc3339(),
            );
            (false, Some(reason))
        } else {
            (true, None)
        }
    }
}

/// Test double used by Executor unit tests below.
pub struct FixedUsageClient(pub anyhow::Result<UsageSnapshot>);

#[async_trait]
impl UsageClient for FixedUsageClient {
    async fn snapshot(&self) -> anyhow::Result<UsageSnapshot> {
        match &self.0 {
            Ok(s) => Ok(s.clone()),
            Err(e) => Err(anyhow::anyhow!("{e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(utilization: f64) -> UsageBucket {
        UsageBucket {
            utilization,
            resets_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn allows_when_under_threshold() {
        let gate = BudgetGate::new(Box::new(FixedUsageClient(Ok(UsageSnapshot {
            five_hour: bucket(10.0),
            seven_day: bucket(20.0),
        }))));
        let (allowed, reason) = gate.check(50.0).await;
        assert!(allowed);
        assert!(reason.is_none());
    }

    #[tokio::test]
    async fn denies_when_five_hour_bucket_exceeds_threshold() {
        let gate = BudgetGate::new(Box::new(FixedUsageClient(Ok(UsageSnapshot {
            five_hour: bucket(90.0),
            seven_day: bucket(10.0),
        }))));
        let (allowed, reason) = gate.check(50.0).await;
        assert!(!allowed);
        let reason = reason.unwrap();
        assert!(reason.contains("90"));
        assert!(reason.contains("50"));
    }

    #[tokio::test]
    async fn fails_open_when_client_errors() {
        let gate = BudgetGate::new(Box::new(FixedUsageClient(Err(anyhow::anyhow!("boom")))));
        let (allowed, reason) = gate.check(50.0).await;
        assert!(allowed);
        assert!(reason.is_none());
    }
}
