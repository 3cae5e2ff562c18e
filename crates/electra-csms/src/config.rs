use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use csms_core::{ChargingGroup, PowerProfile, SessionStore, Station};
use csms_engine::{AllocationConfig, EngineConfig, ProtocolConfig, RetryPolicy, SchedulerConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Station {0} is declared twice")]
    DuplicateStation(String),
    #[error("Group {0} is declared twice")]
    DuplicateGroup(uuid::Uuid),
    #[error("Station {station_id} belongs to unknown group {group_id}")]
    UnknownGroup {
        station_id: String,
        group_id: uuid::Uuid,
    },
    #[error("Station {station_id} has an invalid connector {idx}: {reason}")]
    InvalidConnector {
        station_id: String,
        idx: u32,
        reason: &'static str,
    },
    #[error("Profile {0} must target exactly one known station or group")]
    ProfileTarget(uuid::Uuid),
    #[error("Retry policy '{0}' needs at least one attempt")]
    NoAttempts(&'static str),
    #[error("Pass timeout of {pass_timeout_ms} ms is shorter than the {budget_ms} ms a delivery may take")]
    PassTimeoutTooShort { pass_timeout_ms: u64, budget_ms: u64 },
}

/// The whole configuration file of the management system
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CsmsConfig {
    pub server: ServerConfig,
    pub protocol: ProtocolSection,
    pub scheduler: SchedulerSection,
    pub allocation: AllocationSection,
    pub delivery: RetrySection,
    pub publisher: RetrySection,
    pub stations: Vec<Station>,
    pub groups: Vec<ChargingGroup>,
    pub profiles: Vec<PowerProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "0.0.0.0".into(),
            port: 3000,
        }
    }
}

/// Durations in this and the following sections are milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ProtocolSection {
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub call_timeout_ms: u64,
    pub lock_timeout_ms: u64,
}

impl Default for ProtocolSection {
    fn default() -> Self {
        let defaults = ProtocolConfig::default();
        ProtocolSection {
            heartbeat_interval_ms: millis(defaults.heartbeat_interval),
            heartbeat_timeout_ms: millis(defaults.heartbeat_timeout),
            call_timeout_ms: millis(defaults.call_timeout),
            lock_timeout_ms: millis(defaults.lock_timeout),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerSection {
    pub interval_ms: u64,
    pub debounce_ms: u64,
    pub pass_timeout_ms: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        let defaults = SchedulerConfig::default();
        SchedulerSection {
            interval_ms: millis(defaults.interval),
            debounce_ms: millis(defaults.debounce),
            pass_timeout_ms: millis(defaults.pass_timeout),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AllocationSection {
    /// Minimum change in watts before a new limit is sent.
    pub epsilon: u32,
}

impl Default for AllocationSection {
    fn default() -> Self {
        AllocationSection {
            epsilon: AllocationConfig::default().epsilon,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        let defaults = RetryPolicy::default();
        RetrySection {
            max_attempts: defaults.max_attempts,
            initial_backoff_ms: millis(defaults.initial_backoff),
            max_backoff_ms: millis(defaults.max_backoff),
        }
    }
}

impl RetrySection {
    fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl CsmsConfig {
    /// Read, parse and validate a configuration file.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let config: CsmsConfig =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut groups = HashSet::new();
        for group in &self.groups {
            if !groups.insert(group.id) {
                return Err(ConfigError::DuplicateGroup(group.id));
            }
        }

        let mut stations = HashSet::new();
        for station in &self.stations {
            if !stations.insert(station.station_id.as_str()) {
                return Err(ConfigError::DuplicateStation(station.station_id.clone()));
            }
            if let Some(group_id) = station.group_id.filter(|id| !groups.contains(id)) {
                return Err(ConfigError::UnknownGroup {
                    station_id: station.station_id.clone(),
                    group_id,
                });
            }
            let mut indices = HashSet::new();
            for connector in &station.connectors {
                let reason = if connector.idx == 0 {
                    Some("connector 0 addresses the whole station")
                } else if !indices.insert(connector.idx) {
                    Some("declared twice")
                } else if connector.min_power > connector.max_power {
                    Some("minimum power above maximum power")
                } else {
                    None
                };
                if let Some(reason) = reason {
                    return Err(ConfigError::InvalidConnector {
                        station_id: station.station_id.clone(),
                        idx: connector.idx,
                        reason,
                    });
                }
            }
        }

        for profile in &self.profiles {
            let valid = match (&profile.station_id, profile.group_id) {
                (Some(station_id), None) => stations.contains(station_id.as_str()),
                (None, Some(group_id)) => groups.contains(&group_id),
                _ => false,
            };
            if !valid {
                return Err(ConfigError::ProfileTarget(profile.id));
            }
        }

        for (name, section) in [("delivery", &self.delivery), ("publisher", &self.publisher)] {
            if section.max_attempts == 0 {
                return Err(ConfigError::NoAttempts(name));
            }
        }

        let budget = self.engine_config().delivery_budget();
        if Duration::from_millis(self.scheduler.pass_timeout_ms) < budget {
            return Err(ConfigError::PassTimeoutTooShort {
                pass_timeout_ms: self.scheduler.pass_timeout_ms,
                budget_ms: millis(budget),
            });
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            protocol: ProtocolConfig {
                heartbeat_interval: Duration::from_millis(self.protocol.heartbeat_interval_ms),
                heartbeat_timeout: Duration::from_millis(self.protocol.heartbeat_timeout_ms),
                call_timeout: Duration::from_millis(self.protocol.call_timeout_ms),
                lock_timeout: Duration::from_millis(self.protocol.lock_timeout_ms),
            },
            scheduler: SchedulerConfig {
                interval: Duration::from_millis(self.scheduler.interval_ms),
                debounce: Duration::from_millis(self.scheduler.debounce_ms),
                pass_timeout: Duration::from_millis(self.scheduler.pass_timeout_ms),
            },
            allocation: AllocationConfig {
                epsilon: self.allocation.epsilon,
            },
            delivery: self.delivery.policy(),
            publisher: self.publisher.policy(),
        }
    }

    /// Build the session store holding the configured stations, groups and profiles.
    pub fn build_store(&self) -> SessionStore {
        let store = SessionStore::new(Duration::from_millis(self.protocol.lock_timeout_ms));
        for group in &self.groups {
            store.register_group(group.clone());
        }
        for station in &self.stations {
            store.register_station(station.clone());
        }
        for profile in &self.profiles {
            store.register_profile(profile.clone());
        }
        store
    }
}
