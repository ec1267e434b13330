use std::time::Duration;

use chart_relay::{LogConfig, RelayConfig};

/// Environment-driven server configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    /// e.g. "redis://localhost:6379"; absent means in-memory storage only
    pub redis_url: Option<String>,
    pub heartbeat: Duration,
    pub poll_interval: Duration,
    pub chart_cap: usize,
    pub message_cap: usize,
}

impl AppConfig {
    pub fn load() -> Self {
        let defaults = RelayConfig::default();
        Self {
            port: env_parse("PORT", 8080),
            redis_url: std::env::var("REDIS_URL").ok().filter(|u| !u.is_empty()),
            heartbeat: Duration::from_secs(env_parse("HEARTBEAT_SECS", 30)),
            poll_interval: Duration::from_millis(env_parse(
                "POLL_MS",
                defaults.poll_interval.as_millis() as u64,
            )),
            chart_cap: env_parse("CHART_LOG_CAP", defaults.log.chart_cap),
            message_cap: env_parse("MESSAGE_LOG_CAP", defaults.log.message_cap),
        }
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            log: LogConfig {
                chart_cap: self.chart_cap,
                message_cap: self.message_cap,
                ..LogConfig::default()
            },
            heartbeat: self.heartbeat,
            poll_interval: self.poll_interval,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
