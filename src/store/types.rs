use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AgentSchedError, Result};

/// A scheduled unit of work: a prompt run either on a cron schedule or once at
/// a fixed time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub prompt: String,
    pub working_dir: String,
    pub webhook_urls: Vec<String>,
    /// Six-field cron expression. Empty ⇒ one-off task.
    pub cron_expr: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn is_one_off(&self) -> bool {
        self.cron_expr.is_empty()
    }
}

/// Fields a caller supplies to create a Task; the Store assigns id/timestamps.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,
    pub prompt: String,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub webhook_urls: Vec<String>,
    #[serde(default)]
    pub cron_expr: String,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Non-empty name/prompt, a parseable six-field cron expression when present,
/// a non-empty working directory.
pub fn validate_new_task(t: &NewTask) -> Result<()> {
    if t.name.trim().is_empty() {
        return Err(AgentSchedError::InvalidTask("name must not be empty".into()));
    }
    if t.prompt.trim().is_empty() {
        return Err(AgentSchedError::InvalidTask("prompt must not be empty".into()));
    }
    if let Some(ref dir) = t.working_dir {
        if dir.trim().is_empty() {
            return Err(AgentSchedError::InvalidTask(
                "working_dir must not be empty".into(),
            ));
        }
    }
    if !t.cron_expr.is_empty() {
        validate_cron_expr(&t.cron_expr)?;
    }
    Ok(())
}

pub fn validate_task(t: &Task) -> Result<()> {
    if t.name.trim().is_empty() {
        return Err(AgentSchedError::InvalidTask("name must not be empty".into()));
    }
    if t.prompt.trim().is_empty() {
        return Err(AgentSchedError::InvalidTask("prompt must not be empty".into()));
    }
    if t.working_dir.trim().is_empty() {
        return Err(AgentSchedError::InvalidTask(
            "working_dir must not be empty".into(),
        ));
    }
    if !t.cron_expr.is_empty() {
        validate_cron_expr(&t.cron_expr)?;
    }
    Ok(())
}

/// Strict six-field grammar: second minute hour day-of-month month day-of-week.
pub fn validate_cron_expr(expr: &str) -> Result<()> {
    if expr.split_whitespace().count() != 6 {
        return Err(AgentSchedError::InvalidTask(format!(
            "cron expression must have 6 fields (second minute hour dom month dow): {expr}"
        )));
    }
    cron::Schedule::from_str(expr)
        .map(|_| ())
        .map_err(|e| AgentSchedError::InvalidTask(format!("invalid cron expression '{expr}': {e}")))
}

use std::str::FromStr as _;

/// A single execution attempt of a Task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub task_id: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub output: String,
    pub error: String,
}

impl Run {
    /// `ended_at` is set exactly when the run has left the pending/running states.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, RunStatus::Completed | RunStatus::Failed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => RunStatus::Running,
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            _ => RunStatus::Pending,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewRun {
    pub task_id: i64,
    pub started_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_name() {
        let t = NewTask {
            name: "".into(),
            prompt: "echo hi".into(),
            working_dir: None,
            webhook_urls: vec![],
            cron_expr: "".into(),
            scheduled_at: None,
            enabled: true,
        };
        assert!(validate_new_task(&t).is_err());
    }

    #[test]
    fn rejects_malformed_cron() {
        let t = NewTask {
            name: "t".into(),
            prompt: "p".into(),
            working_dir: None,
            webhook_urls: vec![],
            cron_expr: "* * * *".into(),
            scheduled_at: None,
            enabled: true,
        };
        assert!(validate_new_task(&t).is_err());
    }

    #[test]
    fn accepts_six_field_cron() {
        let t = NewTask {
            name: "t".into(),
            prompt: "p".into(),
            working_dir: None,
            webhook_urls: vec![],
            cron_expr: "0 * * * * *".into(),
            scheduled_at: None,
            enabled: true,
        };
        assert!(validate_new_task(&t).is_ok());
    }
}
