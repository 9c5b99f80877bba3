//! Environment-driven configuration.
//!
//! Follows the `NOLAN_API_HOST`/`NOLAN_API_PORT` convention: a handful of
//! optional env vars with sane defaults, resolved once at startup.

use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct Config {
    pub data_dir: PathBuf,
    pub http_host: String,
    pub http_port: u16,
    pub agent_bin: String,
    pub stream_buffer: usize,
    pub stream_max_age_secs: u64,
    pub run_timeout_secs: u64,
    pub reconcile_secs: u64,
    /// Usage-quota endpoint. Unset means the budget gate always allows.
    pub usage_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            data_dir: data_dir_from_env(),
            http_host: std::env::var("AGENTSCHED_HTTP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            http_port: env_parse("AGENTSCHED_HTTP_PORT", 8070),
            agent_bin: std::env::var("AGENTSCHED_AGENT_BIN").unwrap_or_else(|_| "agent".to_string()),
            stream_buffer: env_parse("AGENTSCHED_STREAM_BUFFER", 100),
            stream_max_age_secs: env_parse("AGENTSCHED_STREAM_MAX_AGE_SECS", 3600),
            run_timeout_secs: env_parse("AGENTSCHED_RUN_TIMEOUT_SECS", 1800),
            reconcile_secs: env_parse("AGENTSCHED_RECONCILE_SECS", 10),
            usage_url: std::env::var("AGENTSCHED_USAGE_URL").ok(),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("tasks.db")
    }
}

fn data_dir_from_env() -> PathBuf {
    if let Ok(dir) = std::env::var("AGENTSCHED_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agentsched")
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        let cfg = Config {
            data_dir: PathBuf::from("/tmp/agentsched-test"),
            http_host: "127.0.0.1".to_string(),
            http_port: 8070,
            agent_bin: "agent".to_string(),
            stream_buffer: 100,
            stream_max_age_secs: 3600,
            run_timeout_secs: 1800,
            reconcile_secs: 10,
            usage_url: None,
        };
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/agentsched-test/tasks.db"));
    }
}
