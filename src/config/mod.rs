//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::balancer::autoscale::{AutoscalePolicy, LaunchSettings, DEFAULT_AUTOSCALE_INTERVAL};
use crate::balancer::breaker::{BreakerPolicy, DEFAULT_BASE_COOLDOWN, DEFAULT_MAX_COOLDOWN};
use crate::balancer::pool::{PoolSettings, DEFAULT_BACKEND_CAPACITY};
use crate::balancer::proxy::DEFAULT_CONNECT_TIMEOUT;
use crate::rooms::manager::{RoomManagerConfig, DEFAULT_ROOM_GRACE, DEFAULT_SWEEP_INTERVAL};
use crate::util::rate_limit::{AdmissionLimits, INPUT_RATE_BURST, INPUT_RATE_RPS};

/// Room server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// LOG_FORMAT=json
    pub log_json: bool,
    pub rooms: RoomManagerConfig,
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars(&lookup);

        // Hosting platforms provide PORT; fall back to SERVER_ADDR or default
        let server_addr = match vars.get("PORT") {
            Some(port) => format!("0.0.0.0:{}", port),
            None => vars.get("SERVER_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
        };

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress(server_addr))?,
            log_level: vars.get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_json: vars.json_logs(),
            rooms: RoomManagerConfig {
                grace: vars.secs("ROOM_GRACE_SECS", DEFAULT_ROOM_GRACE)?,
                sweep_interval: vars.period("ROOM_SWEEP_SECS", DEFAULT_SWEEP_INTERVAL)?,
                admission: AdmissionLimits {
                    rps: vars.parse("INPUT_RATE_RPS", INPUT_RATE_RPS)?,
                    burst: vars.parse("INPUT_RATE_BURST", INPUT_RATE_BURST)?,
                },
            },
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_level: "info".to_string(),
            log_json: false,
            rooms: RoomManagerConfig::default(),
        }
    }
}

/// Load balancer configuration
#[derive(Clone, Debug)]
pub struct BalancerConfig {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub log_json: bool,
    /// Backends registered at startup
    pub backends: Vec<String>,
    pub pool: PoolSettings,
    pub connect_timeout: Duration,
    /// Autoscaling is off unless set
    pub autoscale: Option<AutoscalePolicy>,
    pub launch: LaunchSettings,
}

impl BalancerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars(&lookup);

        let listen_addr = vars.get("LB_ADDR").unwrap_or_else(|| "0.0.0.0:8765".to_string());
        let backends = vars
            .get("BACKENDS")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let autoscale = if vars.flag("AUTOSCALE")? {
            let defaults = AutoscalePolicy::default();
            Some(AutoscalePolicy {
                interval: vars.period("AUTOSCALE_INTERVAL_SECS", DEFAULT_AUTOSCALE_INTERVAL)?,
                min_backends: vars.parse("MIN_BACKENDS", defaults.min_backends)?,
                max_backends: vars.parse("MAX_BACKENDS", defaults.max_backends)?,
                scale_up_per_backend: vars
                    .parse("SCALE_UP_PER_BACKEND", defaults.scale_up_per_backend)?,
                scale_down_per_backend: vars
                    .parse("SCALE_DOWN_PER_BACKEND", defaults.scale_down_per_backend)?,
            })
        } else {
            None
        };
        if let Some(policy) = &autoscale {
            if policy.min_backends > policy.max_backends {
                return Err(ConfigError::Invalid {
                    key: "MIN_BACKENDS",
                    value: policy.min_backends.to_string(),
                });
            }
        }

        let launch_defaults = LaunchSettings::default();

        Ok(Self {
            listen_addr: listen_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress(listen_addr))?,
            log_level: vars.get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_json: vars.json_logs(),
            backends,
            pool: PoolSettings {
                capacity: vars.parse("BACKEND_CAPACITY", DEFAULT_BACKEND_CAPACITY)?,
                breaker: BreakerPolicy {
                    base_cooldown: vars.millis("BREAKER_BASE_COOLDOWN_MS", DEFAULT_BASE_COOLDOWN)?,
                    max_cooldown: vars.millis("BREAKER_MAX_COOLDOWN_MS", DEFAULT_MAX_COOLDOWN)?,
                },
            },
            connect_timeout: vars.millis("CONNECT_TIMEOUT_MS", DEFAULT_CONNECT_TIMEOUT)?,
            autoscale,
            launch: LaunchSettings {
                base_port: vars.parse("BACKEND_BASE_PORT", launch_defaults.base_port)?,
                url_template: vars
                    .get("BACKEND_URL_TEMPLATE")
                    .unwrap_or(launch_defaults.url_template),
                launch_cmd: vars.get("BACKEND_LAUNCH_CMD").filter(|c| !c.trim().is_empty()),
            },
        })
    }
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8765)),
            log_level: "info".to_string(),
            log_json: false,
            backends: Vec::new(),
            pool: PoolSettings::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            autoscale: None,
            launch: LaunchSettings::default(),
        }
    }
}

/// Typed access to a variable source
struct Vars<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { key, value }),
            None => Ok(default),
        }
    }

    fn secs(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }

    /// Like `secs`, but zero is rejected: timer periods must be positive
    fn period(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let period = self.secs(key, default)?;
        if period.is_zero() {
            return Err(ConfigError::Invalid {
                key,
                value: "0".to_string(),
            });
        }
        Ok(period)
    }

    fn millis(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_millis() as u64)
            .map(Duration::from_millis)
    }

    fn json_logs(&self) -> bool {
        self.get("LOG_FORMAT")
            .is_some_and(|f| f.trim().eq_ignore_ascii_case("json"))
    }

    fn flag(&self, key: &'static str) -> Result<bool, ConfigError> {
        match self.get(key).map(|v| v.trim().to_ascii_lowercase()) {
            None => Ok(false),
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
            Some(value) => Err(ConfigError::Invalid { key, value }),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}
