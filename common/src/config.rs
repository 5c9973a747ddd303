use serde::{Deserialize, Serialize};

/// Compiled-in schedule defaults, applied on first boot or when a stored
/// key is missing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleDefaults {
    pub interval_secs: u64,
    pub duration_secs: u64,
    /// Factory-provisioned first activation epoch. Stored verbatim until a
    /// synchronized clock can interpret it (see `ScheduleEngine::boot`).
    pub turn_on_epoch: u64,
}

impl Default for ScheduleDefaults {
    fn default() -> Self {
        Self {
            interval_secs: 3_600,
            duration_secs: 30,
            turn_on_epoch: 1_772_431_200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub mqtt_client_id: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "broker.emqx.io".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            mqtt_client_id: "irrigator-controller".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub defaults: ScheduleDefaults,
    pub network: NetworkConfig,
    pub tick_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            defaults: ScheduleDefaults::default(),
            network: NetworkConfig::default(),
            tick_interval_ms: 1_000,
            heartbeat_interval_ms: 30_000,
        }
    }
}
