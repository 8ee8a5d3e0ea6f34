use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for the tether recovery core.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
    pub recovery: RecoveryConfig,
    pub chunks: ChunkConfig,
    pub throttle: ThrottleConfig,
    pub subscriptions: SubscriptionConfig,
    pub telemetry: TelemetryConfig,
}

/// Session lifetime and replay journal bounds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a disconnected session survives without a successful resume.
    pub grace_period_ms: u64,
    /// Number of sequenced messages retained per session for recovery replay.
    pub journal_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 30_000,
            journal_capacity: 1_024,
        }
    }
}

impl SessionConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Recovery handshake prompting and critical-send retry policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub prompt_initial_delay_ms: u64,
    pub prompt_max_delay_ms: u64,
    /// Prompts sent before recovery is finalized from server-side state.
    pub prompt_max_attempts: u32,
    /// Jitter factor in `[0.0, 1.0)` applied as +/- around each delay.
    pub prompt_jitter: f64,
    pub send_retry_attempts: u32,
    pub send_retry_delay_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            prompt_initial_delay_ms: 250,
            prompt_max_delay_ms: 4_000,
            prompt_max_attempts: 5,
            prompt_jitter: 0.1,
            send_retry_attempts: 3,
            send_retry_delay_ms: 50,
        }
    }
}

/// Limits for in-flight chunked transfers.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChunkConfig {
    pub max_total_chunks: u32,
    pub max_transfer_bytes: usize,
    pub max_pending_transfers: usize,
    /// Idle time after which an incomplete transfer is abandoned (connected sessions only).
    pub transfer_timeout_ms: u64,
    /// Recently reconstructed message ids remembered for duplicate suppression.
    pub completed_memory: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_total_chunks: 4_096,
            max_transfer_bytes: 16 * 1024 * 1024,
            max_pending_transfers: 64,
            transfer_timeout_ms: 120_000,
            completed_memory: 256,
        }
    }
}

impl ChunkConfig {
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }
}

/// Per-session outbound rate limit and queue policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub max_messages_per_window: u32,
    pub window_ms: u64,
    pub penalty_ms: u64,
    pub max_queue_depth: usize,
    pub drain_interval_ms: u64,
    pub drain_batch: usize,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_messages_per_window: 50,
            window_ms: 1_000,
            penalty_ms: 5_000,
            max_queue_depth: 1_000,
            drain_interval_ms: 100,
            drain_batch: 5,
        }
    }
}

impl ThrottleConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn penalty(&self) -> Duration {
        Duration::from_millis(self.penalty_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}

/// Topic naming policy and per-topic backlog bound.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    pub max_topics: usize,
    pub max_topic_len: usize,
    /// Entries kept per topic while disconnected; oldest entries are dropped first.
    pub backlog_capacity: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            max_topics: 64,
            max_topic_len: 128,
            backlog_capacity: 512,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration from a path resolved via TETHER_CONFIG or defaults to `config/tether.toml`.
    /// Applies TETHER_LOG_LEVEL to override `telemetry.log_level` after parsing.
    pub fn load_from_env() -> Result<Self> {
        let path = env_config_path();
        let mut cfg = Self::load(&path)?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Load configuration from a specific file (TOML or JSON based on extension).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        if is_json(path_ref) {
            Ok(serde_json::from_str(&data)
                .with_context(|| format!("invalid JSON config {}", path_ref.display()))?)
        } else {
            Ok(toml::from_str(&data)
                .with_context(|| format!("invalid TOML config {}", path_ref.display()))?)
        }
    }

    /// Validate invariants the recovery core relies on.
    pub fn validate(&self) -> Result<()> {
        if self.session.grace_period_ms == 0 {
            bail!("session.grace_period_ms must be > 0");
        }
        if self.session.journal_capacity == 0 {
            bail!("session.journal_capacity must be > 0");
        }
        if self.recovery.prompt_initial_delay_ms == 0 {
            bail!("recovery.prompt_initial_delay_ms must be > 0");
        }
        if self.recovery.prompt_max_delay_ms < self.recovery.prompt_initial_delay_ms {
            bail!("recovery.prompt_max_delay_ms must be >= prompt_initial_delay_ms");
        }
        if !(0.0..1.0).contains(&self.recovery.prompt_jitter) {
            bail!("recovery.prompt_jitter must be within [0.0, 1.0)");
        }
        if self.recovery.send_retry_attempts == 0 {
            bail!("recovery.send_retry_attempts must be > 0");
        }
        if self.chunks.max_total_chunks == 0 {
            bail!("chunks.max_total_chunks must be > 0");
        }
        if self.chunks.max_pending_transfers == 0 {
            bail!("chunks.max_pending_transfers must be > 0");
        }
        if self.throttle.max_messages_per_window == 0 {
            bail!("throttle.max_messages_per_window must be > 0");
        }
        if self.throttle.window_ms == 0 {
            bail!("throttle.window_ms must be > 0");
        }
        if self.throttle.max_queue_depth == 0 {
            bail!("throttle.max_queue_depth must be > 0");
        }
        if self.throttle.drain_interval_ms == 0 || self.throttle.drain_batch == 0 {
            bail!("throttle drain cadence must be > 0");
        }
        if self.subscriptions.max_topics == 0 || self.subscriptions.max_topic_len == 0 {
            bail!("subscription limits must be > 0");
        }
        if self.subscriptions.backlog_capacity == 0 {
            bail!("subscriptions.backlog_capacity must be > 0");
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("TETHER_LOG_LEVEL") {
            self.telemetry.log_level = Some(level);
        }
    }
}

fn env_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("TETHER_CONFIG") {
        PathBuf::from(path)
    } else {
        PathBuf::from("config/tether.toml")
    }
}

fn is_json(path: &Path) -> bool {
    matches!(path.extension().and_then(|s| s.to_str()), Some("json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg: Config = toml::from_str(
            r#"
[throttle]
max_messages_per_window = 10
penalty_ms = 250

[subscriptions]
backlog_capacity = 4
"#,
        )
        .unwrap();
        assert_eq!(cfg.throttle.max_messages_per_window, 10);
        assert_eq!(cfg.throttle.penalty(), Duration::from_millis(250));
        assert_eq!(cfg.throttle.window_ms, 1_000);
        assert_eq!(cfg.subscriptions.backlog_capacity, 4);
        assert_eq!(cfg.session.grace_period_ms, 30_000);
    }

    #[test]
    fn test_inverted_backoff_rejected() {
        let mut cfg = Config::default();
        cfg.recovery.prompt_max_delay_ms = 10;
        cfg.recovery.prompt_initial_delay_ms = 100;
        let err = cfg.validate().unwrap_err();
        assert!(format!("{err:?}").contains("prompt_max_delay_ms"));
    }

    #[test]
    fn test_load_json_by_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tether.json");
        let mut file = fs::File::create(&path).unwrap();
        write!(file, r#"{{"session": {{"grace_period_ms": 500}}}}"#).unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.session.grace_period(), Duration::from_millis(500));
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = Config::load("/nonexistent/tether.toml").unwrap_err();
        assert!(format!("{err:#}").contains("unable to read config"));
    }
}
