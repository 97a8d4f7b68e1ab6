use serde::{Deserialize, Serialize};

use crate::utils::error::{BrokerError, Result};

/// Top-level configuration settings for the broker process.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub maintenance: MaintenanceSettings,
    pub persistence: PersistenceSettings,
    pub logging: LoggingSettings,
}

/// Bind address of the WebSocket gateway.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Dispatch policy and bounded-resource limits.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct BrokerSettings {
    /// Capacity given to internal queues when an endpoint asks for zero.
    pub default_queue_capacity: usize,
    pub failure_history_limit: usize,
    pub latency_sample_limit: usize,
    /// Broadcast succeeds iff successes > quorum * registered agents.
    pub broadcast_quorum: f64,
    pub multicast_min_successes: usize,
    pub webhook_timeout_ms: u64,
}

/// Periods and thresholds of the background routines.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MaintenanceSettings {
    pub expiry_sweep_interval_ms: u64,
    pub performance_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub inactivity_window_ms: u64,
    pub success_rate_floor: f64,
    pub latency_ceiling_ms: f64,
}

/// Dead-letter journal.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PersistenceSettings {
    pub enabled: bool,
    pub path: String,
    pub ttl_secs: Option<i64>,
    pub max_entries: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Every field is optional; missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub maintenance: Option<PartialMaintenanceSettings>,
    pub persistence: Option<PartialPersistenceSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub default_queue_capacity: Option<usize>,
    pub failure_history_limit: Option<usize>,
    pub latency_sample_limit: Option<usize>,
    pub broadcast_quorum: Option<f64>,
    pub multicast_min_successes: Option<usize>,
    pub webhook_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialMaintenanceSettings {
    pub expiry_sweep_interval_ms: Option<u64>,
    pub performance_interval_ms: Option<u64>,
    pub heartbeat_interval_ms: Option<u64>,
    pub inactivity_window_ms: Option<u64>,
    pub success_rate_floor: Option<f64>,
    pub latency_ceiling_ms: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialPersistenceSettings {
    pub enabled: Option<bool>,
    pub path: Option<String>,
    pub ttl_secs: Option<i64>,
    pub max_entries: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            broker: BrokerSettings::default(),
            maintenance: MaintenanceSettings::default(),
            persistence: PersistenceSettings {
                enabled: false,
                path: "agentbus_dead_letters".to_string(),
                ttl_secs: Some(86_400),
                max_entries: Some(10_000),
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            default_queue_capacity: 100,
            failure_history_limit: 100,
            latency_sample_limit: 1000,
            broadcast_quorum: 0.5,
            multicast_min_successes: 1,
            webhook_timeout_ms: 5000,
        }
    }
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            expiry_sweep_interval_ms: 60_000,
            performance_interval_ms: 30_000,
            heartbeat_interval_ms: 30_000,
            inactivity_window_ms: 120_000,
            success_rate_floor: 0.95,
            latency_ceiling_ms: 1000.0,
        }
    }
}

impl Settings {
    /// Merge a partial configuration over the defaults.
    pub fn from_partial(partial: PartialSettings) -> Self {
        let default = Settings::default();
        let server = partial.server.unwrap_or_default();
        let broker = partial.broker.unwrap_or_default();
        let maintenance = partial.maintenance.unwrap_or_default();
        let persistence = partial.persistence.unwrap_or_default();
        let logging = partial.logging.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(default.server.host),
                port: server.port.unwrap_or(default.server.port),
            },
            broker: BrokerSettings {
                default_queue_capacity: broker
                    .default_queue_capacity
                    .unwrap_or(default.broker.default_queue_capacity),
                failure_history_limit: broker
                    .failure_history_limit
                    .unwrap_or(default.broker.failure_history_limit),
                latency_sample_limit: broker
                    .latency_sample_limit
                    .unwrap_or(default.broker.latency_sample_limit),
                broadcast_quorum: broker
                    .broadcast_quorum
                    .unwrap_or(default.broker.broadcast_quorum),
                multicast_min_successes: broker
                    .multicast_min_successes
                    .unwrap_or(default.broker.multicast_min_successes),
                webhook_timeout_ms: broker
                    .webhook_timeout_ms
                    .unwrap_or(default.broker.webhook_timeout_ms),
            },
            maintenance: MaintenanceSettings {
                expiry_sweep_interval_ms: maintenance
                    .expiry_sweep_interval_ms
                    .unwrap_or(default.maintenance.expiry_sweep_interval_ms),
                performance_interval_ms: maintenance
                    .performance_interval_ms
                    .unwrap_or(default.maintenance.performance_interval_ms),
                heartbeat_interval_ms: maintenance
                    .heartbeat_interval_ms
                    .unwrap_or(default.maintenance.heartbeat_interval_ms),
                inactivity_window_ms: maintenance
                    .inactivity_window_ms
                    .unwrap_or(default.maintenance.inactivity_window_ms),
                success_rate_floor: maintenance
                    .success_rate_floor
                    .unwrap_or(default.maintenance.success_rate_floor),
                latency_ceiling_ms: maintenance
                    .latency_ceiling_ms
                    .unwrap_or(default.maintenance.latency_ceiling_ms),
            },
            persistence: PersistenceSettings {
                enabled: persistence.enabled.unwrap_or(default.persistence.enabled),
                path: persistence.path.unwrap_or(default.persistence.path),
                ttl_secs: persistence.ttl_secs.or(default.persistence.ttl_secs),
                max_entries: persistence.max_entries.or(default.persistence.max_entries),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(default.logging.level),
            },
        }
    }

    /// Reject values the broker cannot run with.
    pub fn validate(&self) -> Result<()> {
        let b = &self.broker;
        let m = &self.maintenance;

        if b.default_queue_capacity == 0 {
            return Err(invalid("broker.default_queue_capacity must be > 0"));
        }
        if b.failure_history_limit == 0 || b.latency_sample_limit == 0 {
            return Err(invalid("broker history limits must be > 0"));
        }
        if !(0.0..1.0).contains(&b.broadcast_quorum) {
            return Err(invalid("broker.broadcast_quorum must be in [0, 1)"));
        }
        if b.multicast_min_successes == 0 {
            return Err(invalid("broker.multicast_min_successes must be > 0"));
        }
        if b.webhook_timeout_ms == 0 {
            return Err(invalid("broker.webhook_timeout_ms must be > 0"));
        }
        if m.expiry_sweep_interval_ms == 0
            || m.performance_interval_ms == 0
            || m.heartbeat_interval_ms == 0
        {
            return Err(invalid("maintenance intervals must be > 0"));
        }
        if m.inactivity_window_ms == 0 {
            return Err(invalid("maintenance.inactivity_window_ms must be > 0"));
        }
        if !(0.0..=1.0).contains(&m.success_rate_floor) {
            return Err(invalid("maintenance.success_rate_floor must be in [0, 1]"));
        }
        if m.latency_ceiling_ms <= 0.0 {
            return Err(invalid("maintenance.latency_ceiling_ms must be > 0"));
        }
        if self.persistence.enabled && self.persistence.path.is_empty() {
            return Err(invalid("persistence.path is required when enabled"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> BrokerError {
    BrokerError::Config(msg.to_string())
}
