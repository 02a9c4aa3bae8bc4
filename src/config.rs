//! Gateway configuration.
//!
//! Onboarding persists the device's connection properties as a flat JSON
//! object; [`GatewayConfig`] reads that file's contents plus the settings
//! that used to come from the environment (`stage`) and the optional shadow
//! tuning.
//!
//! ```
//! use libiot_gateway::config::GatewayConfig;
//!
//! let config = GatewayConfig::from_json(br#"{
//!     "mqtt_endpoint": "broker.example.test",
//!     "mqtt_port": 8883,
//!     "client_id": "press-7",
//!     "org_id": "org-1",
//!     "site_id": "site-1",
//!     "machine_id": "machine-1",
//!     "telemetry_topic": "ingest/telemetry",
//!     "stage": "dev"
//! }"#).unwrap();
//! assert_eq!(config.remote_address(), "broker.example.test:8883");
//! assert_eq!(config.telemetry_topic(), "ingest/telemetry/org-1/press-7");
//! ```

use crate::network::application::mqtt::TransportOptions;
use crate::shadow::ShadowConfig;
use crate::telemetry;
use serde::Deserialize;

/// Why a configuration could not be used.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid gateway configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("\"{0}\" must not be empty")]
    Empty(&'static str),
}

/// Everything needed to bring one device online.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayConfig {
    pub mqtt_endpoint: String,
    pub mqtt_port: u16,
    /// Thing name; also the MQTT client identifier.
    pub client_id: String,
    pub org_id: String,
    #[serde(default)]
    pub site_id: Option<String>,
    #[serde(default)]
    pub machine_id: Option<String>,
    #[serde(default)]
    pub machine_region: Option<String>,
    /// Base of the telemetry topic; see [`telemetry::telemetry_topic`].
    pub telemetry_topic: String,
    /// Deployment stage prefixing the telemetry-rejected topic.
    pub stage: String,
    #[serde(default)]
    pub keep_alive_seconds: Option<u16>,
    #[serde(default)]
    pub shadow: ShadowConfig,
}

impl GatewayConfig {
    /// Parses and checks a configuration document.
    pub fn from_json(json: &[u8]) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_slice(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("mqtt_endpoint", &self.mqtt_endpoint),
            ("client_id", &self.client_id),
            ("org_id", &self.org_id),
            ("telemetry_topic", &self.telemetry_topic),
            ("stage", &self.stage),
        ];
        match required.iter().find(|(_, value)| value.is_empty()) {
            Some((name, _)) => Err(ConfigError::Empty(*name)),
            None => Ok(()),
        }
    }

    /// `endpoint:port`, as accepted by [`Connect`](crate::network::Connect).
    pub fn remote_address(&self) -> String {
        format!("{}:{}", self.mqtt_endpoint, self.mqtt_port)
    }

    pub fn telemetry_topic(&self) -> String {
        telemetry::telemetry_topic(&self.telemetry_topic, &self.org_id, &self.client_id)
    }

    pub fn transport_options(&self) -> TransportOptions {
        let mut options = TransportOptions::new(self.client_id.as_str());
        if let Some(keep_alive) = self.keep_alive_seconds {
            options.keep_alive_seconds = keep_alive;
        }
        options
    }
}
