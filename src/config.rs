//! Environment-driven configuration.
//!
//! Everything has a development default except broker credentials, which must
//! be given as a pair: one half without the other refuses to start.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("incomplete broker credentials: set both {0} and {1}")]
    IncompleteCredentials(&'static str, &'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub credentials: Option<(String, String)>,
    /// Max unacknowledged in-flight messages per consumer.
    pub prefetch: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub broker: BrokerConfig,
    pub store_url: String,
    pub tick_interval: Duration,
    pub scheduler_interval: Duration,
    pub http_port: u16,
    /// Comma-separated serials to seed as demo twins on startup.
    pub seed_devices: Vec<String>,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_u64(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v.parse().map_err(|_| ConfigError::Invalid { key, value: v }),
        Err(_) => Ok(default),
    }
}

/// Like `parse_u64`, but zero is as fatal as garbage: these knobs lose their
/// meaning at 0 (a prefetch of 0 would never deliver anything).
fn parse_positive(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match parse_u64(key, default)? {
        0 => Err(ConfigError::Invalid {
            key,
            value: "0".to_string(),
        }),
        n => Ok(n),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let user = std::env::var("FLEETWIN_BROKER_USER").ok();
        let pass = std::env::var("FLEETWIN_BROKER_PASS").ok();
        let credentials = match (user, pass) {
            (Some(u), Some(p)) => Some((u, p)),
            (None, None) => None,
            _ => {
                return Err(ConfigError::IncompleteCredentials(
                    "FLEETWIN_BROKER_USER",
                    "FLEETWIN_BROKER_PASS",
                ))
            }
        };

        let port = parse_u64("FLEETWIN_BROKER_PORT", 1883)? as u16;
        let prefetch = parse_positive("FLEETWIN_PREFETCH", 1)? as usize;
        let tick_secs = parse_positive("FLEETWIN_TICK_INTERVAL_SECS", 2)?;
        let sched_secs = parse_positive("FLEETWIN_SCHEDULER_INTERVAL_SECS", 60)?;
        let http_port = parse_u64("FLEETWIN_HTTP_PORT", 8080)? as u16;

        let seed_devices = env_or("FLEETWIN_SEED_DEVICES", "")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        Ok(Self {
            broker: BrokerConfig {
                host: env_or("FLEETWIN_BROKER_HOST", "localhost"),
                port,
                client_id: env_or("FLEETWIN_BROKER_CLIENT_ID", "fleetwin-core"),
                credentials,
                prefetch,
            },
            store_url: env_or("FLEETWIN_STORE_URL", "memory:"),
            tick_interval: Duration::from_secs(tick_secs),
            scheduler_interval: Duration::from_secs(sched_secs),
            http_port,
            seed_devices,
        })
    }
}
