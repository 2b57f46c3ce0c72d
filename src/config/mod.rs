use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::error;

use crate::backoff::Backoff;
use crate::executor::ExecutorConfig;
use crate::session::SessionConfig;
use crate::supervisor::SupervisorConfig;

const DEFAULT_URL: &str = "wss://api.tether.io/api/v1/agent/ws";
const DEFAULT_LOG: &str = "info";
const ENV_PREFIX: &str = "TETHERD";

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  `TETHERD_*` overlay  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// Control-plane WebSocket URL.
    url: Option<String>,
    /// Log level filter string, e.g. "debug", "info,tetherd=trace".
    log: Option<String>,
    heartbeat_interval_secs: Option<u64>,
    heartbeat_timeout_secs: Option<u64>,
    handshake_timeout_secs: Option<u64>,
    auth_timeout_secs: Option<u64>,
    write_timeout_secs: Option<u64>,
    reconnect: Option<TomlReconnect>,
    executor: Option<TomlExecutor>,
    supervisor: Option<TomlSupervisor>,
}

#[derive(Deserialize, Default)]
struct TomlReconnect {
    initial_delay_ms: Option<u64>,
    max_delay_secs: Option<u64>,
    multiplier: Option<f64>,
    /// 0 = retry forever.
    max_attempts: Option<u32>,
}

#[derive(Deserialize, Default)]
struct TomlExecutor {
    max_workers: Option<usize>,
    queue_capacity: Option<usize>,
    shutdown_grace_secs: Option<u64>,
}

#[derive(Deserialize, Default)]
struct TomlSupervisor {
    readiness_window_secs: Option<u64>,
    grace_deadline_secs: Option<u64>,
    health_interval_secs: Option<u64>,
    max_restarts: Option<u32>,
    restart_backoff_ms: Option<u64>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── Environment overlay ──────────────────────────────────────────────────────

/// `reconnect.initial_delay_ms` → `TETHERD_RECONNECT_INITIAL_DELAY_MS`.
fn env_key(dotted: &str) -> String {
    format!("{ENV_PREFIX}_{}", dotted.replace('.', "_").to_uppercase())
}

fn env_str(dotted: &str) -> Option<String> {
    std::env::var(env_key(dotted)).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(dotted: &str) -> Option<T> {
    env_str(dotted).and_then(|v| v.parse().ok())
}

// ─── BridgeConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub url: String,
    pub data_dir: PathBuf,
    pub log: String,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub handshake_timeout: Duration,
    pub auth_timeout: Duration,
    pub write_timeout: Duration,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub reconnect_multiplier: f64,
    /// 0 = retry forever.
    pub reconnect_max_attempts: u32,
    pub executor_max_workers: Option<usize>,
    pub executor_queue_capacity: usize,
    pub executor_shutdown_grace: Duration,
    pub supervisor_readiness_window: Duration,
    pub supervisor_grace_deadline: Duration,
    pub supervisor_health_interval: Duration,
    pub supervisor_max_restarts: u32,
    pub supervisor_restart_backoff: Duration,
}

impl BridgeConfig {
    /// Build config from CLI args + env overlay + optional TOML file.
    pub fn new(url: Option<String>, data_dir: Option<PathBuf>, log: Option<String>) -> Self {
        let data_dir = data_dir.unwrap_or_else(crate::credentials::default_config_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();
        let reconnect = toml.reconnect.unwrap_or_default();
        let executor = toml.executor.unwrap_or_default();
        let supervisor = toml.supervisor.unwrap_or_default();

        let url = url
            .or_else(|| env_str("url"))
            .or(toml.url)
            .unwrap_or_else(|| DEFAULT_URL.to_string());
        let log = log
            .or_else(|| env_str("log"))
            .or(toml.log)
            .unwrap_or_else(|| DEFAULT_LOG.to_string());

        let secs = |env: &str, file: Option<u64>, default: u64| {
            Duration::from_secs(env_parse(env).or(file).unwrap_or(default))
        };
        let millis = |env: &str, file: Option<u64>, default: u64| {
            Duration::from_millis(env_parse(env).or(file).unwrap_or(default))
        };

        Self {
            url,
            log,
            heartbeat_interval: secs(
                "heartbeat_interval_secs",
                toml.heartbeat_interval_secs,
                30,
            ),
            heartbeat_timeout: secs("heartbeat_timeout_secs", toml.heartbeat_timeout_secs, 60),
            handshake_timeout: secs("handshake_timeout_secs", toml.handshake_timeout_secs, 30),
            auth_timeout: secs("auth_timeout_secs", toml.auth_timeout_secs, 10),
            write_timeout: secs("write_timeout_secs", toml.write_timeout_secs, 10),
            reconnect_initial_delay: millis(
                "reconnect.initial_delay_ms",
                reconnect.initial_delay_ms,
                2_000,
            ),
            reconnect_max_delay: secs(
                "reconnect.max_delay_secs",
                reconnect.max_delay_secs,
                60,
            ),
            reconnect_multiplier: env_parse("reconnect.multiplier")
                .or(reconnect.multiplier)
                .unwrap_or(2.0),
            reconnect_max_attempts: env_parse("reconnect.max_attempts")
                .or(reconnect.max_attempts)
                .unwrap_or(0),
            executor_max_workers: env_parse("executor.max_workers").or(executor.max_workers),
            executor_queue_capacity: env_parse("executor.queue_capacity")
                .or(executor.queue_capacity)
                .unwrap_or(64),
            executor_shutdown_grace: secs(
                "executor.shutdown_grace_secs",
                executor.shutdown_grace_secs,
                5,
            ),
            supervisor_readiness_window: secs(
                "supervisor.readiness_window_secs",
                supervisor.readiness_window_secs,
                5,
            ),
            supervisor_grace_deadline: secs(
                "supervisor.grace_deadline_secs",
                supervisor.grace_deadline_secs,
                10,
            ),
            supervisor_health_interval: secs(
                "supervisor.health_interval_secs",
                supervisor.health_interval_secs,
                10,
            ),
            supervisor_max_restarts: env_parse("supervisor.max_restarts")
                .or(supervisor.max_restarts)
                .unwrap_or(3),
            supervisor_restart_backoff: millis(
                "supervisor.restart_backoff_ms",
                supervisor.restart_backoff_ms,
                1_000,
            ),
            data_dir,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            url: self.url.clone(),
            handshake_timeout: self.handshake_timeout,
            auth_timeout: self.auth_timeout,
            write_timeout: self.write_timeout,
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_timeout: self.heartbeat_timeout,
            backoff: Backoff::new(
                self.reconnect_initial_delay,
                self.reconnect_max_delay,
                self.reconnect_multiplier,
                self.reconnect_max_attempts,
            ),
            ..Default::default()
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_workers: self
                .executor_max_workers
                .unwrap_or_else(crate::executor::default_pool_size),
            queue_capacity: self.executor_queue_capacity,
            shutdown_grace: self.executor_shutdown_grace,
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            readiness_window: self.supervisor_readiness_window,
            grace_deadline: self.supervisor_grace_deadline,
            health_interval: self.supervisor_health_interval,
            max_restarts: self.supervisor_max_restarts,
            restart_backoff: self.supervisor_restart_backoff,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_operational_contract() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = BridgeConfig::new(None, Some(dir.path().to_path_buf()), None);
        assert_eq!(cfg.url, DEFAULT_URL);
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(cfg.heartbeat_timeout, Duration::from_secs(60));
        assert_eq!(cfg.auth_timeout, Duration::from_secs(10));
        assert_eq!(cfg.executor_queue_capacity, 64);
        assert_eq!(cfg.supervisor_max_restarts, 3);
        assert_eq!(cfg.reconnect_max_attempts, 0);
    }

    #[test]
    fn toml_overrides_defaults_and_cli_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            r#"
url = "wss://from-toml.example/ws"
heartbeat_interval_secs = 15

[reconnect]
max_attempts = 7

[supervisor]
max_restarts = 1
"#,
        )
        .unwrap();

        let cfg = BridgeConfig::new(None, Some(dir.path().to_path_buf()), None);
        assert_eq!(cfg.url, "wss://from-toml.example/ws");
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(cfg.reconnect_max_attempts, 7);
        assert_eq!(cfg.supervisor_max_restarts, 1);

        let cfg = BridgeConfig::new(
            Some("wss://from-cli.example/ws".into()),
            Some(dir.path().to_path_buf()),
            None,
        );
        assert_eq!(cfg.url, "wss://from-cli.example/ws");
    }

    #[test]
    fn env_overlay_maps_dots_to_underscores() {
        assert_eq!(
            env_key("reconnect.initial_delay_ms"),
            "TETHERD_RECONNECT_INITIAL_DELAY_MS"
        );
        assert_eq!(env_key("url"), "TETHERD_URL");

        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("TETHERD_EXECUTOR_QUEUE_CAPACITY", "9");
        let cfg = BridgeConfig::new(None, Some(dir.path().to_path_buf()), None);
        assert_eq!(cfg.executor_queue_capacity, 9);
        std::env::remove_var("TETHERD_EXECUTOR_QUEUE_CAPACITY");
    }

    #[test]
    fn broken_toml_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "url = [not valid").unwrap();
        let cfg = BridgeConfig::new(None, Some(dir.path().to_path_buf()), None);
        assert_eq!(cfg.url, DEFAULT_URL);
    }
}
