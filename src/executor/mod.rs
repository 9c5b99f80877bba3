//! Supervises a single Run from start to terminal state: budget check, child
//! process spawn, live output capture, and result sinks.
//!
//! The process-supervision shape (piped stdout/stderr each drained by its own
//! `tokio::spawn`, `tokio::time::timeout` around `child.wait()`, `child.kill()`
//! on expiry) mirrors a plain-subprocess path kept alongside a heavier
//! tmux-backed one; here it publishes each line live instead of only
//! collecting it for a final log write.

use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::budget::BudgetGate;
use crate::error::Result;
use crate::store::{NewRun, Run, RunStatus, Store};
use crate::stream::{OutputChunk, StreamManager};

/// Every chunk of accumulated output is flushed to the Store after this many
/// lines, so a reattaching observer sees progress without a write per line.
const PARTIAL_FLUSH_LINES: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecKind {
    Manual,
    Scheduled,
}

#[derive(Debug)]
pub enum ExecOutcome {
    Completed(Run),
    Failed(Run),
    Skipped(Run),
}

pub struct Executor {
    store: Store,
    streams: std::sync::Arc<StreamManager>,
    budget: BudgetGate,
    agent_bin: String,
    run_timeout: Duration,
    http: reqwest::Client,
}

struct Line {
    text: String,
    is_error: bool,
}

impl Executor {
    pub fn new(
        store: Store,
        streams: std::sync::Arc<StreamManager>,
        budget: BudgetGate,
        agent_bin: impl Into<String>,
        run_timeout: Duration,
    ) -> Self {
        Self {
            store,
            streams,
            budget,
            agent_bin: agent_bin.into(),
            run_timeout,
            http: reqwest::Client::new(),
        }
    }

    /// Full run: creates the Run row itself.
    pub async fn execute(&self, task: &crate::store::Task, kind: ExecKind) -> Result<ExecOutcome> {
        let run = self
            .store
            .create_run(NewRun {
                task_id: task.id,
                started_at: Utc::now(),
            })
            .await?;
        self.execute_with_run(task, run, kind).await
    }

    /// Variant for the streaming API: the Run row is already inserted, so the
    /// caller can hand its id back before the subprocess even starts.
    pub async fn execute_with_run(
        &self,
        task: &crate::store::Task,
        run: Run,
        kind: ExecKind,
    ) -> Result<ExecOutcome> {
        if kind == ExecKind::Scheduled {
            let threshold = self.store.usage_threshold().await?;
            let (allowed, reason) = self.budget.check(threshold).await;
            if !allowed {
                let reason = reason.unwrap_or_else(|| "usage above threshold".to_string());
                tracing::warn!(task_id = task.id, %reason, "budget gate skipped run");
                let skipped = self.finalize(run, RunStatus::Failed, reason).await?;
                self.store.update_last_run_at(task.id, Utc::now()).await?;
                return Ok(ExecOutcome::Skipped(skipped));
            }
        }

        let outcome = self.run_child(task, run).await?;
        self.store.update_last_run_at(task.id, Utc::now()).await?;
        self.notify_sinks(task, &outcome).await;
        Ok(outcome)
    }

    async fn run_child(&self, task: &crate::store::Task, run: Run) -> Result<ExecOutcome> {
        let mut cmd = Command::new(&self.agent_bin);
        cmd.arg("-p")
            .arg("--dangerously-skip-permissions")
            .arg(&task.prompt)
            .current_dir(&task.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                let run = self
                    .finalize(run, RunStatus::Failed, format!("failed to spawn agent: {e}"))
                    .await?;
                return Ok(ExecOutcome::Failed(run));
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (tx, mut rx) = mpsc::unbounded_channel::<Line>();

        if let Some(stdout) = stdout {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(text)) = lines.next_line().await {
                    let _ = tx.send(Line { text, is_error: false });
                }
            });
        }
        if let Some(stderr) = stderr {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(text)) = lines.next_line().await {
                    let _ = tx.send(Line { text, is_error: true });
                }
            });
        }
        drop(tx);

        let mut accumulated = String::new();
        let mut stderr_tail = String::new();
        let mut since_flush = 0usize;

        let wait = async {
            while let Some(line) = rx.recv().await {
                accumulated.push_str(&line.text);
                accumulated.push('\n');
                if line.is_error {
                    stderr_tail.push_str(&line.text);
                    stderr_tail.push('\n');
                }
                self.streams
                    .publish(OutputChunk {
                        run_id: run.id,
                        text: line.text,
                        timestamp: Utc::now(),
                        is_error: line.is_error,
                    })
                    .await;
                since_flush += 1;
                if since_flush >= PARTIAL_FLUSH_LINES {
                    since_flush = 0;
                    let _ = self.store.append_run_output(run.id, &accumulated).await;
                }
            }
            // Both readers closed; the subprocess has exited or is about to.
            child.wait().await
        };

        let wait_result = tokio::time::timeout(self.run_timeout, wait).await;

        let (status, error) = match wait_result {
            Ok(Ok(exit)) => {
                if exit.success() {
                    (RunStatus::Completed, String::new())
                } else {
                    let desc = match exit.code() {
                        Some(code) => format!("exited with status {code}"),
                        None => "terminated by signal".to_string(),
                    };
                    let tail_lines: Vec<&str> = stderr_tail.lines().rev().take(20).collect();
                    let tail: String = tail_lines.into_iter().rev().collect::<Vec<_>>().join("\n");
                    (RunStatus::Failed, format!("{desc}\n{tail}"))
                }
            }
            Ok(Err(e)) => (RunStatus::Failed, format!("wait failed: {e}")),
            Err(_) => {
                let _ = child.start_kill();
                (
                    RunStatus::Failed,
                    format!("timed out after {}s", self.run_timeout.as_secs()),
                )
            }
        };

        let _ = self.store.append_run_output(run.id, &accumulated).await;
        let mut finished = run;
        finished.output = accumulated;
        let finished = self.finalize(finished, status, error).await?;

        Ok(match finished.status {
            RunStatus::Completed => ExecOutcome::Completed(finished),
            _ => ExecOutcome::Failed(finished),
        })
    }

    async fn finalize(&self, mut run: Run, status: RunStatus, error: String) -> Result<Run> {
        run.ended_at = Some(Utc::now());
        run.status = status;
        run.error = error.clone();
        self.store.update_run(run.clone()).await?;
        self.streams
            .complete(run.id, run.status, error)
            .await;
        Ok(run)
    }

    /// Best-effort: failures are logged and never alter the Run already persisted.
    async fn notify_sinks(&self, task: &crate::store::Task, outcome: &ExecOutcome) {
        if task.webhook_urls.is_empty() {
            return;
        }
        let run = match outcome {
            ExecOutcome::Completed(r) | ExecOutcome::Failed(r) | ExecOutcome::Skipped(r) => r.clone(),
        };
        for url in task.webhook_urls.clone() {
            let http = self.http.clone();
            let run = run.clone();
            tokio::spawn(async move {
                if let Err(e) = http.post(&url).json(&run).send().await {
                    tracing::warn!(%url, error = %e, "webhook delivery failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{BudgetGate, FixedUsageClient, UsageBucket, UsageSnapshot};
    use crate::store::NewTask;
    use std::sync::Arc;

    async fn test_store() -> Store {
        Store::open_in_memory().await.unwrap()
    }

    fn allow_gate() -> BudgetGate {
        BudgetGate::new(Box::new(FixedUsageClient(Ok(UsageSnapshot {
            five_hour: UsageBucket { utilization: 0.0, resets_at: Utc::now() },
            seven_day: UsageBucket { utilization: 0.0, resets_at: Utc::now() },
        }))))
    }

    fn deny_gate() -> BudgetGate {
        BudgetGate::new(Box::new(FixedUsageClient(Ok(UsageSnapshot {
            five_hour: UsageBucket { utilization: 99.0, resets_at: Utc::now() },
            seven_day: UsageBucket { utilization: 0.0, resets_at: Utc::now() },
        }))))
    }

    async fn make_task(store: &Store, prompt: &str) -> crate::store::Task {
        store
            .create_task(NewTask {
                name: "t".into(),
                prompt: prompt.into(),
                working_dir: None,
                webhook_urls: vec![],
                cron_expr: "".into(),
                scheduled_at: None,
                enabled: true,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn manual_run_executes_true_and_completes() {
        let store = test_store().await;
        let streams = Arc::new(StreamManager::new(100));
        let executor = Executor::new(
            store.clone(),
            streams,
            allow_gate(),
            "true",
            Duration::from_secs(5),
        );
        let task = make_task(&store, "ignored").await;
        let outcome = executor.execute(&task, ExecKind::Manual).await.unwrap();
        match outcome {
            ExecOutcome::Completed(run) => assert_eq!(run.status, RunStatus::Completed),
            other => panic!("expected completed, got {other:?}"),
        }
        let reloaded = store.get_task(task.id).await.unwrap();
        assert!(reloaded.last_run_at.is_some());
    }

    #[tokio::test]
    async fn scheduled_run_skipped_when_budget_exceeded() {
        let store = test_store().await;
        let streams = Arc::new(StreamManager::new(100));
        let executor = Executor::new(
            store.clone(),
            streams,
            deny_gate(),
            "true",
            Duration::from_secs(5),
        );
        let task = make_task(&store, "ignored").await;
        let outcome = executor.execute(&task, ExecKind::Scheduled).await.unwrap();
        match outcome {
            ExecOutcome::Skipped(run) => {
                assert_eq!(run.status, RunStatus::Failed);
                assert!(run.error.contains("99"));
                assert!(run.output.is_empty());
            }
            other => panic!("expected skipped, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn manual_run_bypasses_budget_gate_even_when_exceeded() {
        let store = test_store().await;
        let streams = Arc::new(StreamManager::new(100));
        let executor = Executor::new(
            store.clone(),
            streams,
            deny_gate(),
            "true",
            Duration::from_secs(5),
        );
        let task = make_task(&store, "ignored").await;
        let outcome = executor.execute(&task, ExecKind::Manual).await.unwrap();
        assert!(matches!(outcome, ExecOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn nonzero_exit_is_recorded_as_failed() {
        let store = test_store().await;
        let streams = Arc::new(StreamManager::new(100));
        let executor = Executor::new(
            store.clone(),
            streams,
            allow_gate(),
            "false",
            Duration::from_secs(5),
        );
        let task = make_task(&store, "ignored").await;
        let outcome = executor.execute(&task, ExecKind::Manual).await.unwrap();
        match outcome {
            ExecOutcome::Failed(run) => assert!(run.error.contains("status")),
            other => panic!("expected failed, got {other:?}"),
        }
    }
}
