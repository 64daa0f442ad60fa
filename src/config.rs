//! Simulation tuning knobs

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::ble::types::ManagerState;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid simulation config: {0}")]
    Parse(#[from] serde_json::Error),
}

mod millis {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Global parameters of one simulation run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// How long a central takes to notice a silently lost link.
    #[serde(rename = "supervision_timeout_ms", with = "millis")]
    pub supervision_timeout: Duration,
    /// Size of the write-without-response credit buffer per connection.
    pub write_without_response_credits: usize,
    /// Maximum RSSI jitter (in dBm) around a proximity band.
    pub rssi_deviation: i16,
    /// MTU used by peripherals that don't specify one.
    pub default_mtu: usize,
    /// Adapter state at creation and after teardown.
    pub initial_state: ManagerState,
    /// Seed for RSSI jitter; `None` draws from entropy.
    pub rng_seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            supervision_timeout: Duration::from_secs(4),
            write_without_response_credits: 20,
            rssi_deviation: 15,
            default_mtu: 23,
            initial_state: ManagerState::PoweredOff,
            rng_seed: None,
        }
    }
}

impl SimulationConfig {
    /// Parse a JSON config. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SimulationConfig::default();
        assert_eq!(config.supervision_timeout, Duration::from_secs(4));
        assert_eq!(config.write_without_response_credits, 20);
        assert_eq!(config.default_mtu, 23);
        assert_eq!(config.initial_state, ManagerState::PoweredOff);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = SimulationConfig::from_json(
            r#"{ "supervision_timeout_ms": 6000, "rng_seed": 7, "initial_state": "PoweredOn" }"#,
        )
        .unwrap();
        assert_eq!(config.supervision_timeout, Duration::from_secs(6));
        assert_eq!(config.rng_seed, Some(7));
        assert_eq!(config.initial_state, ManagerState::PoweredOn);
        assert_eq!(config.write_without_response_credits, 20);
    }

    #[test]
    fn test_round_trip() {
        let config = SimulationConfig {
            rng_seed: Some(42),
            ..SimulationConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(SimulationConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_invalid_json() {
        assert!(SimulationConfig::from_json("{ not json").is_err());
    }
}
