use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

// Daemon configuration sourced from environment variables, with an optional
// YAML override file for ops-friendly deployments.
#[derive(Debug, Clone)]
pub struct TapdConfig {
    // Which wire protocol the listener speaks (selection, not detection).
    pub driver: Driver,
    // Client-facing listen address.
    pub listen: SocketAddr,
    // host:port of the real database server.
    pub upstream: String,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Queue capacity handed to each broker subscriber.
    pub broker_buffer: usize,
    // Capacity of the interceptor's captured-event channel.
    pub event_queue_depth: usize,
    // Max accepted frame/packet length on proxied connections.
    pub max_frame_bytes: usize,
    // N+1 detection threshold; 0 disables the detector.
    pub nplus1_threshold: usize,
    // N+1 detection window.
    pub nplus1_window: Duration,
    // Per-template alert cooldown.
    pub nplus1_cooldown: Duration,
    // Slow query threshold; zero disables the flag.
    pub slow_threshold: Duration,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Driver {
    Postgres,
    Mysql,
    // TiDB speaks the MySQL protocol; kept separate for logs and config.
    Tidb,
}

impl FromStr for Driver {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self> {
        match input {
            "postgres" => Ok(Driver::Postgres),
            "mysql" => Ok(Driver::Mysql),
            "tidb" => Ok(Driver::Tidb),
            other => bail!("unsupported driver: {other} (expected postgres, mysql, or tidb)"),
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Driver::Postgres => "postgres",
            Driver::Mysql => "mysql",
            Driver::Tidb => "tidb",
        })
    }
}

const DEFAULT_METRICS_BIND: &str = "0.0.0.0:8080";
const DEFAULT_BROKER_BUFFER: usize = 256;
const DEFAULT_EVENT_QUEUE_DEPTH: usize = 1024;
const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
const DEFAULT_NPLUS1_THRESHOLD: usize = 5;
const DEFAULT_NPLUS1_WINDOW_MS: u64 = 1000;
const DEFAULT_NPLUS1_COOLDOWN_MS: u64 = 10_000;
const DEFAULT_SLOW_THRESHOLD_MS: u64 = 100;

#[derive(Debug, Deserialize)]
struct TapdConfigOverride {
    driver: Option<String>,
    listen: Option<String>,
    upstream: Option<String>,
    metrics_bind: Option<String>,
    broker_buffer: Option<usize>,
    event_queue_depth: Option<usize>,
    max_frame_bytes: Option<usize>,
    nplus1_threshold: Option<usize>,
    nplus1_window_ms: Option<u64>,
    nplus1_cooldown_ms: Option<u64>,
    slow_threshold_ms: Option<u64>,
}

impl TapdConfig {
    pub fn from_env() -> Result<Self> {
        let driver = std::env::var("SQLTAP_DRIVER")
            .context("SQLTAP_DRIVER is required (postgres, mysql, or tidb)")?
            .parse()?;
        let listen = std::env::var("SQLTAP_LISTEN")
            .context("SQLTAP_LISTEN is required (client listen address)")?
            .parse()
            .with_context(|| "parse SQLTAP_LISTEN")?;
        let upstream = std::env::var("SQLTAP_UPSTREAM")
            .context("SQLTAP_UPSTREAM is required (upstream database address)")?;
        let metrics_bind = std::env::var("SQLTAP_METRICS_BIND")
            .unwrap_or_else(|_| DEFAULT_METRICS_BIND.to_string())
            .parse()
            .with_context(|| "parse SQLTAP_METRICS_BIND")?;
        let broker_buffer = std::env::var("SQLTAP_BROKER_BUFFER")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_BROKER_BUFFER);
        let event_queue_depth = std::env::var("SQLTAP_EVENT_QUEUE_DEPTH")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_EVENT_QUEUE_DEPTH);
        let max_frame_bytes = std::env::var("SQLTAP_MAX_FRAME_BYTES")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_FRAME_BYTES);
        // 0 is meaningful here: it disables N+1 detection.
        let nplus1_threshold = std::env::var("SQLTAP_NPLUS1_THRESHOLD")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(DEFAULT_NPLUS1_THRESHOLD);
        let nplus1_window = std::env::var("SQLTAP_NPLUS1_WINDOW_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_NPLUS1_WINDOW_MS);
        let nplus1_cooldown = std::env::var("SQLTAP_NPLUS1_COOLDOWN_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_NPLUS1_COOLDOWN_MS);
        // 0 is meaningful here too: it disables the slow-query flag.
        let slow_threshold = std::env::var("SQLTAP_SLOW_THRESHOLD_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_SLOW_THRESHOLD_MS);
        Ok(Self {
            driver,
            listen,
            upstream,
            metrics_bind,
            broker_buffer,
            event_queue_depth,
            max_frame_bytes,
            nplus1_threshold,
            nplus1_window: Duration::from_millis(nplus1_window),
            nplus1_cooldown: Duration::from_millis(nplus1_cooldown),
            slow_threshold: Duration::from_millis(slow_threshold),
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        let Some(config_path) = std::env::var("SQLTAP_CONFIG").ok() else {
            return Ok(config);
        };
        let contents = fs::read_to_string(&config_path)
            .with_context(|| format!("read SQLTAP_CONFIG: {config_path}"))?;
        config.apply_yaml(&contents)?;
        Ok(config)
    }

    fn apply_yaml(&mut self, contents: &str) -> Result<()> {
        let override_cfg: TapdConfigOverride =
            serde_yaml::from_str(contents).with_context(|| "parse tapd config yaml")?;
        if let Some(value) = override_cfg.driver {
            self.driver = value.parse()?;
        }
        if let Some(value) = override_cfg.listen {
            self.listen = value.parse().with_context(|| "parse listen")?;
        }
        if let Some(value) = override_cfg.upstream {
            self.upstream = value;
        }
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = override_cfg.broker_buffer {
            if value > 0 {
                self.broker_buffer = value;
            }
        }
        if let Some(value) = override_cfg.event_queue_depth {
            if value > 0 {
                self.event_queue_depth = value;
            }
        }
        if let Some(value) = override_cfg.max_frame_bytes {
            if value > 0 {
                self.max_frame_bytes = value;
            }
        }
        if let Some(value) = override_cfg.nplus1_threshold {
            self.nplus1_threshold = value;
        }
        if let Some(value) = override_cfg.nplus1_window_ms {
            if value > 0 {
                self.nplus1_window = Duration::from_millis(value);
            }
        }
        if let Some(value) = override_cfg.nplus1_cooldown_ms {
            if value > 0 {
                self.nplus1_cooldown = Duration::from_millis(value);
            }
        }
        if let Some(value) = override_cfg.slow_threshold_ms {
            self.slow_threshold = Duration::from_millis(value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> TapdConfig {
        TapdConfig {
            driver: Driver::Postgres,
            listen: "127.0.0.1:6432".parse().expect("listen"),
            upstream: "127.0.0.1:5432".to_string(),
            metrics_bind: DEFAULT_METRICS_BIND.parse().expect("metrics bind"),
            broker_buffer: DEFAULT_BROKER_BUFFER,
            event_queue_depth: DEFAULT_EVENT_QUEUE_DEPTH,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            nplus1_threshold: DEFAULT_NPLUS1_THRESHOLD,
            nplus1_window: Duration::from_millis(DEFAULT_NPLUS1_WINDOW_MS),
            nplus1_cooldown: Duration::from_millis(DEFAULT_NPLUS1_COOLDOWN_MS),
            slow_threshold: Duration::from_millis(DEFAULT_SLOW_THRESHOLD_MS),
        }
    }

    #[test]
    fn driver_parsing() {
        assert_eq!("postgres".parse::<Driver>().expect("pg"), Driver::Postgres);
        assert_eq!("mysql".parse::<Driver>().expect("mysql"), Driver::Mysql);
        assert_eq!("tidb".parse::<Driver>().expect("tidb"), Driver::Tidb);
        assert!("oracle".parse::<Driver>().is_err());
    }

    #[test]
    fn yaml_override_applies_selected_fields() {
        let mut config = base_config();
        config
            .apply_yaml(
                "driver: mysql\nupstream: db.internal:3306\nslow_threshold_ms: 250\nnplus1_threshold: 8\n",
            )
            .expect("apply");
        assert_eq!(config.driver, Driver::Mysql);
        assert_eq!(config.upstream, "db.internal:3306");
        assert_eq!(config.slow_threshold, Duration::from_millis(250));
        assert_eq!(config.nplus1_threshold, 8);
        // Untouched fields keep their values.
        assert_eq!(config.broker_buffer, DEFAULT_BROKER_BUFFER);
    }

    #[test]
    fn yaml_override_zero_disables_thresholds() {
        let mut config = base_config();
        config
            .apply_yaml("nplus1_threshold: 0\nslow_threshold_ms: 0\n")
            .expect("apply");
        assert_eq!(config.nplus1_threshold, 0);
        assert_eq!(config.slow_threshold, Duration::ZERO);
    }

    #[test]
    fn yaml_override_rejects_bad_driver() {
        let mut config = base_config();
        assert!(config.apply_yaml("driver: sqlite\n").is_err());
    }

    #[test]
    fn yaml_override_ignores_zero_capacities() {
        let mut config = base_config();
        config
            .apply_yaml("broker_buffer: 0\nevent_queue_depth: 0\n")
            .expect("apply");
        assert_eq!(config.broker_buffer, DEFAULT_BROKER_BUFFER);
        assert_eq!(config.event_queue_depth, DEFAULT_EVENT_QUEUE_DEPTH);
    }
}
